//! In-process engine double for deterministic job tests

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde_json::json;

use crate::engine::{EngineError, EngineInfo, Interrupt, Materialized, QueryOutput, Row, SqlEngine};

/// Statements containing this marker fail like a missing relation
pub(crate) const FAILING_SQL: &str = "SELECT * FROM missing_table";

/// Produces `rows` single-column rows (`n` = 0, 1, 2, ...).
///
/// When gated, every execution blocks until [`FakeEngine::open_gate`] is
/// called or its interrupt trips.
pub(crate) struct FakeEngine {
    rows: usize,
    gated: AtomicBool,
    gate_open: AtomicBool,
    fail_release: AtomicBool,
    executions: AtomicUsize,
    released: Mutex<Vec<String>>,
}

impl FakeEngine {
    pub(crate) fn new(rows: usize) -> Self {
        Self {
            rows,
            gated: AtomicBool::new(false),
            gate_open: AtomicBool::new(false),
            fail_release: AtomicBool::new(false),
            executions: AtomicUsize::new(0),
            released: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn gated(rows: usize) -> Self {
        let engine = Self::new(rows);
        engine.gated.store(true, Ordering::SeqCst);
        engine
    }

    pub(crate) fn open_gate(&self) {
        self.gate_open.store(true, Ordering::SeqCst);
    }

    pub(crate) fn fail_releases(&self) {
        self.fail_release.store(true, Ordering::SeqCst);
    }

    pub(crate) fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }

    pub(crate) fn released(&self) -> Vec<String> {
        self.released.lock().unwrap().clone()
    }

    fn run(&self, sql: &str, interrupt: &Interrupt) -> Result<(), EngineError> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        loop {
            if let Some(err) = interrupt.stop_error() {
                return Err(err);
            }
            if !self.gated.load(Ordering::SeqCst) || self.gate_open.load(Ordering::SeqCst) {
                break;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        if sql.contains("missing_table") {
            return Err(EngineError::Sql(rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(1),
                Some("no such table: missing_table".to_string()),
            )));
        }
        Ok(())
    }

    fn rows(&self, offset: usize, limit: usize) -> Vec<Row> {
        (offset..self.rows.min(offset.saturating_add(limit)))
            .map(|n| vec![json!(n)])
            .collect()
    }
}

impl SqlEngine for FakeEngine {
    fn materialize(
        &self,
        sql: &str,
        scratch: &str,
        interrupt: &Interrupt,
    ) -> Result<Materialized, EngineError> {
        self.run(sql, interrupt)?;
        Ok(Materialized {
            columns: vec!["n".to_string()],
            row_count: self.rows,
            scratch: Some(scratch.to_string()),
        })
    }

    fn query(&self, sql: &str, max_rows: usize, interrupt: &Interrupt) -> Result<QueryOutput, EngineError> {
        self.run(sql, interrupt)?;
        if self.rows > max_rows {
            return Err(EngineError::RowLimit(max_rows));
        }
        Ok(QueryOutput {
            columns: vec!["n".to_string()],
            rows: self.rows(0, self.rows),
        })
    }

    fn read_page(&self, _scratch: &str, offset: usize, limit: usize) -> Result<Vec<Row>, EngineError> {
        Ok(self.rows(offset, limit))
    }

    fn release(&self, scratch: &str) -> Result<(), EngineError> {
        if self.fail_release.load(Ordering::SeqCst) {
            return Err(EngineError::Storage(format!("cannot release {}", scratch)));
        }
        self.released.lock().unwrap().push(scratch.to_string());
        Ok(())
    }

    fn info(&self) -> EngineInfo {
        EngineInfo {
            version: "fake 1.0".to_string(),
            memory_used_bytes: 3 * 1024 * 1024,
        }
    }
}
