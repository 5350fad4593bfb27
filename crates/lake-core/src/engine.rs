//! Embedded SQL engine
//!
//! The job subsystem treats the analytical engine as a blocking collaborator
//! behind [`SqlEngine`]. [`SqliteEngine`] is the shipped implementation:
//! one shared database file, a fresh connection per execution, and one
//! scratch database file per materialized result set.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rusqlite::types::ValueRef;
use rusqlite::{params, params_from_iter, Connection, OpenFlags};
use serde_json::Value;
use std::fs;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One result row, values in column order (nulls preserved)
pub type Row = Vec<Value>;

/// VM steps between cancellation/deadline checks
const PROGRESS_STEPS: i32 = 1000;

/// Name of the single table inside every scratch database
const SCRATCH_TABLE: &str = "result";

/// Every scratch file name starts with this; nothing else is ever purged
pub const SCRATCH_PREFIX: &str = "scratch-";

const SCRATCH_EXTENSION: &str = "db";

/// Engine errors
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("query canceled")]
    Canceled,

    #[error("query exceeded maximum duration of {}", format_duration(.0))]
    TimedOut(Duration),

    #[error("{0}")]
    Sql(#[from] rusqlite::Error),

    #[error("{0}")]
    Scan(String),

    #[error("result row limit of {0} exceeded")]
    RowLimit(usize),

    #[error("scratch storage error: {0}")]
    Storage(String),

    #[error("engine task failed: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn is_canceled(&self) -> bool {
        matches!(self, EngineError::Canceled)
    }
}

/// Cancellation signal plus deadline for one execution.
///
/// Cancellation wins over the deadline when both have tripped.
#[derive(Debug, Clone)]
pub struct Interrupt {
    token: CancellationToken,
    deadline: Instant,
    timeout: Duration,
}

impl Interrupt {
    pub fn new(token: CancellationToken, timeout: Duration) -> Self {
        Self {
            token,
            deadline: Instant::now() + timeout,
            timeout,
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    pub fn should_stop(&self) -> bool {
        self.is_canceled() || self.is_expired()
    }

    /// The error describing why execution must stop, if it must
    pub fn stop_error(&self) -> Option<EngineError> {
        if self.is_canceled() {
            Some(EngineError::Canceled)
        } else if self.is_expired() {
            Some(EngineError::TimedOut(self.timeout))
        } else {
            None
        }
    }

    /// Attribute an engine failure to the interrupt when it has tripped
    fn classify(&self, err: rusqlite::Error) -> EngineError {
        self.stop_error().unwrap_or(EngineError::Sql(err))
    }
}

/// Outcome of materializing a statement into scratch storage
#[derive(Debug, Clone, PartialEq)]
pub struct Materialized {
    pub columns: Vec<String>,
    pub row_count: usize,
    /// Scratch id holding the rows; None when the statement produced no columns
    pub scratch: Option<String>,
}

/// Fully buffered result of a synchronous query
#[derive(Debug, Clone, PartialEq)]
pub struct QueryOutput {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

/// Engine health details
#[derive(Debug, Clone, PartialEq)]
pub struct EngineInfo {
    pub version: String,
    pub memory_used_bytes: i64,
}

/// Blocking interface to the embedded analytical engine.
///
/// Every method may block; async callers run them on the blocking pool.
pub trait SqlEngine: Send + Sync + 'static {
    /// Run `sql` to completion, storing its rows under `scratch`.
    fn materialize(
        &self,
        sql: &str,
        scratch: &str,
        interrupt: &Interrupt,
    ) -> Result<Materialized, EngineError>;

    /// Run `sql` and buffer at most `max_rows` rows.
    fn query(&self, sql: &str, max_rows: usize, interrupt: &Interrupt)
        -> Result<QueryOutput, EngineError>;

    /// Read `limit` rows starting at the 0-based `offset` from scratch storage.
    fn read_page(&self, scratch: &str, offset: usize, limit: usize) -> Result<Vec<Row>, EngineError>;

    /// Release scratch storage. Releasing an absent scratch id succeeds.
    fn release(&self, scratch: &str) -> Result<(), EngineError>;

    fn info(&self) -> EngineInfo;
}

/// SQLite-backed engine
pub struct SqliteEngine {
    database_path: PathBuf,
    scratch_dir: PathBuf,
    busy_timeout: Duration,
}

impl SqliteEngine {
    /// Open (or create) the database and prepare the scratch directory.
    ///
    /// Scratch files left by a previous process are removed: job state does
    /// not survive restarts, so nothing can reference them.
    pub fn open(
        database_path: impl Into<PathBuf>,
        scratch_dir: impl Into<PathBuf>,
        max_memory_gb: u32,
    ) -> Result<Self, EngineError> {
        let engine = Self {
            database_path: database_path.into(),
            scratch_dir: scratch_dir.into(),
            busy_timeout: Duration::from_secs(30),
        };

        let conn = engine.connect()?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!(journal_mode = %mode, path = %engine.database_path.display(), "Engine database opened");

        if max_memory_gb > 0 {
            let limit_bytes = i64::from(max_memory_gb) * 1024 * 1024 * 1024;
            let applied: i64 =
                conn.pragma_update_and_check(None, "hard_heap_limit", limit_bytes, |row| row.get(0))?;
            info!(max_memory_gb, applied_bytes = applied, "Engine memory limit set");
        }

        fs::create_dir_all(&engine.scratch_dir)
            .map_err(|e| EngineError::Storage(format!("create scratch dir: {}", e)))?;
        let purged = engine.purge_scratch()?;
        if purged > 0 {
            info!(purged, "Removed stale scratch storage");
        }

        Ok(engine)
    }

    fn connect(&self) -> Result<Connection, EngineError> {
        let conn = Connection::open_with_flags(
            &self.database_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(self.busy_timeout)?;
        Ok(conn)
    }

    fn scratch_path(&self, scratch: &str) -> Result<PathBuf, EngineError> {
        let valid = !scratch.is_empty()
            && scratch
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(EngineError::Storage(format!("invalid scratch id: {:?}", scratch)));
        }
        Ok(self
            .scratch_dir
            .join(format!("{}{}.{}", SCRATCH_PREFIX, scratch, SCRATCH_EXTENSION)))
    }

    fn remove_scratch_files(path: &Path) -> std::io::Result<()> {
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        let journal = PathBuf::from(format!("{}-journal", path.display()));
        match fs::remove_file(journal) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    /// Remove files this engine created in the scratch directory. Anything
    /// without the scratch prefix is left alone.
    fn purge_scratch(&self) -> Result<usize, EngineError> {
        let entries = fs::read_dir(&self.scratch_dir)
            .map_err(|e| EngineError::Storage(format!("read scratch dir: {}", e)))?;

        let mut purged = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() || !is_scratch_file(&entry.file_name().to_string_lossy()) {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => purged += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove stale scratch file"),
            }
        }
        Ok(purged)
    }

    fn materialize_into(
        &self,
        conn: &Connection,
        sql: &str,
        scratch_path: &Path,
        interrupt: &Interrupt,
    ) -> Result<Materialized, EngineError> {
        let columns: Vec<String> = {
            let mut stmt = conn.prepare(sql).map_err(|e| interrupt.classify(e))?;
            let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
            if columns.is_empty() {
                stmt.raw_execute().map_err(|e| interrupt.classify(e))?;
                return Ok(Materialized {
                    columns,
                    row_count: 0,
                    scratch: None,
                });
            }
            columns
        };

        let scratch_path = scratch_path.to_string_lossy().into_owned();
        conn.execute("ATTACH DATABASE ?1 AS scratch", params![scratch_path])?;
        conn.execute_batch("PRAGMA scratch.synchronous = OFF")?;

        let outcome = copy_rows(conn, sql, columns.len(), interrupt);

        if let Err(e) = conn.execute("DETACH DATABASE scratch", []) {
            debug!(error = %e, "Failed to detach scratch database");
        }

        Ok(Materialized {
            columns,
            row_count: outcome?,
            scratch: None,
        })
    }
}

/// Step `sql` and append every row it returns to the attached scratch table.
///
/// The scratch table has positional, untyped columns so that any statement
/// returning rows (SELECT, VALUES, PRAGMA, RETURNING, EXPLAIN) is stored the
/// same way and duplicate column names survive. Rows are streamed, never
/// buffered, and the copy commits or rolls back as one transaction.
fn copy_rows(
    conn: &Connection,
    sql: &str,
    width: usize,
    interrupt: &Interrupt,
) -> Result<usize, EngineError> {
    let scan = |e: rusqlite::Error| EngineError::Scan(e.to_string());
    let tx = conn.unchecked_transaction()?;

    let columns = (0..width).map(|i| format!("c{}", i)).collect::<Vec<_>>().join(", ");
    tx.execute_batch(&format!("CREATE TABLE scratch.{} ({})", SCRATCH_TABLE, columns))
        .map_err(scan)?;

    let row_count = {
        let mut source = tx.prepare(sql).map_err(|e| interrupt.classify(e))?;
        let placeholders = vec!["?"; width].join(", ");
        let mut sink = tx
            .prepare(&format!(
                "INSERT INTO scratch.{} VALUES ({})",
                SCRATCH_TABLE, placeholders
            ))
            .map_err(scan)?;

        let mut rows = source.query([]).map_err(|e| interrupt.classify(e))?;
        let mut count = 0usize;
        while let Some(row) = rows.next().map_err(|e| interrupt.classify(e))? {
            let values = (0..width)
                .map(|idx| row.get_ref(idx))
                .collect::<Result<Vec<ValueRef<'_>>, _>>()
                .map_err(scan)?;
            sink.execute(params_from_iter(values.into_iter().map(rusqlite::types::ToSqlOutput::Borrowed)))
                .map_err(|e| interrupt.classify(e))?;
            count += 1;
        }
        count
    };

    tx.commit().map_err(|e| interrupt.classify(e))?;
    Ok(row_count)
}

fn is_scratch_file(name: &str) -> bool {
    let Some(rest) = name.strip_prefix(SCRATCH_PREFIX) else {
        return false;
    };
    let journal = format!(".{}-journal", SCRATCH_EXTENSION);
    let data = format!(".{}", SCRATCH_EXTENSION);
    rest.ends_with(&journal) || rest.ends_with(&data)
}

impl SqlEngine for SqliteEngine {
    fn materialize(
        &self,
        sql: &str,
        scratch: &str,
        interrupt: &Interrupt,
    ) -> Result<Materialized, EngineError> {
        if let Some(err) = interrupt.stop_error() {
            return Err(err);
        }

        let sql = trim_statement(sql);
        let scratch_path = self.scratch_path(scratch)?;
        let conn = self.connect()?;
        install_interrupt(&conn, interrupt);

        match self.materialize_into(&conn, sql, &scratch_path, interrupt) {
            Ok(mut materialized) => {
                if !materialized.columns.is_empty() {
                    materialized.scratch = Some(scratch.to_string());
                }
                Ok(materialized)
            }
            Err(err) => {
                drop(conn);
                if let Err(e) = Self::remove_scratch_files(&scratch_path) {
                    warn!(scratch = %scratch, error = %e, "Failed to remove partial scratch file");
                }
                Err(err)
            }
        }
    }

    fn query(
        &self,
        sql: &str,
        max_rows: usize,
        interrupt: &Interrupt,
    ) -> Result<QueryOutput, EngineError> {
        if let Some(err) = interrupt.stop_error() {
            return Err(err);
        }

        let conn = self.connect()?;
        install_interrupt(&conn, interrupt);

        let mut stmt = conn
            .prepare(trim_statement(sql))
            .map_err(|e| interrupt.classify(e))?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let width = columns.len();

        let mut rows = Vec::new();
        let mut cursor = stmt.query([]).map_err(|e| interrupt.classify(e))?;
        while let Some(row) = cursor.next().map_err(|e| interrupt.classify(e))? {
            if rows.len() >= max_rows {
                return Err(EngineError::RowLimit(max_rows));
            }
            rows.push(read_row(row, width)?);
        }

        Ok(QueryOutput { columns, rows })
    }

    fn read_page(&self, scratch: &str, offset: usize, limit: usize) -> Result<Vec<Row>, EngineError> {
        let path = self.scratch_path(scratch)?;
        if !path.exists() {
            return Err(EngineError::Storage(format!("scratch {} is gone", scratch)));
        }

        let scan = |e: rusqlite::Error| EngineError::Scan(e.to_string());
        let conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(scan)?;

        let mut stmt = conn
            .prepare(&format!(
                "SELECT * FROM {} ORDER BY rowid LIMIT ?1 OFFSET ?2",
                SCRATCH_TABLE
            ))
            .map_err(scan)?;
        let width = stmt.column_count();

        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let offset = i64::try_from(offset).unwrap_or(i64::MAX);
        let mut cursor = stmt.query(params![limit, offset]).map_err(scan)?;

        let mut rows = Vec::new();
        while let Some(row) = cursor.next().map_err(scan)? {
            rows.push(read_row(row, width)?);
        }
        Ok(rows)
    }

    fn release(&self, scratch: &str) -> Result<(), EngineError> {
        let path = self.scratch_path(scratch)?;
        Self::remove_scratch_files(&path)
            .map_err(|e| EngineError::Storage(format!("remove {}: {}", path.display(), e)))
    }

    fn info(&self) -> EngineInfo {
        let version = self
            .connect()
            .and_then(|conn| {
                conn.query_row("SELECT sqlite_version()", [], |row| row.get::<_, String>(0))
                    .map_err(EngineError::from)
            })
            .unwrap_or_else(|_| "unknown".to_string());

        // SAFETY: sqlite3_memory_used takes no arguments and only reads
        // SQLite's internal allocator statistics.
        let memory_used_bytes = unsafe { rusqlite::ffi::sqlite3_memory_used() };

        EngineInfo {
            version: format!("SQLite {}", version),
            memory_used_bytes,
        }
    }
}

/// Whole seconds when exact, milliseconds otherwise
fn format_duration(duration: &Duration) -> String {
    if duration.subsec_nanos() == 0 {
        format!("{}s", duration.as_secs())
    } else {
        format!("{}ms", duration.as_millis())
    }
}

/// Abort the running statement once the interrupt trips.
fn install_interrupt(conn: &Connection, interrupt: &Interrupt) {
    let interrupt = AssertUnwindSafe(interrupt.clone());
    conn.progress_handler(PROGRESS_STEPS, Some(move || interrupt.should_stop()));
}

/// Strip trailing terminators and surrounding whitespace
fn trim_statement(sql: &str) -> &str {
    sql.trim().trim_end_matches(|c: char| c == ';' || c.is_whitespace())
}

fn read_row(row: &rusqlite::Row<'_>, width: usize) -> Result<Row, EngineError> {
    (0..width)
        .map(|idx| {
            row.get_ref(idx)
                .map(value_to_json)
                .map_err(|e| EngineError::Scan(e.to_string()))
        })
        .collect()
}

fn value_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(BASE64.encode(bytes)),
    }
}
