//! Job entity and its state machine
//!
//! A job moves `Queued -> Running -> {Succeeded | Failed | Canceled}` and never
//! leaves a terminal state. All dependent fields (result, error, completion
//! time, cancel handle) change together under one lock, so readers always see
//! a consistent snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Error message recorded when a job is canceled without an engine-supplied reason
pub const CANCELED_MESSAGE: &str = "query canceled";

/// Job lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueryStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl QueryStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            QueryStatus::Succeeded | QueryStatus::Failed | QueryStatus::Canceled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QueryStatus::Queued => "Queued",
            QueryStatus::Running => "Running",
            QueryStatus::Succeeded => "Succeeded",
            QueryStatus::Failed => "Failed",
            QueryStatus::Canceled => "Canceled",
        }
    }
}

impl fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a succeeded job's rows live
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub row_count: usize,
    /// Scratch storage id; None when the statement produced no rows to keep
    pub scratch: Option<String>,
}

/// Point-in-time view of a job
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSnapshot {
    pub query_id: String,
    pub request_id: String,
    pub status: QueryStatus,
    pub columns: Vec<String>,
    pub row_count: usize,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct JobState {
    status: QueryStatus,
    result: Option<ResultSet>,
    error: Option<String>,
    completed_at: Option<DateTime<Utc>>,
    /// Present only while Running
    cancel_handle: Option<CancellationToken>,
    storage_released: bool,
}

impl JobState {
    fn finish(&mut self, status: QueryStatus) {
        self.status = status;
        self.completed_at = Some(Utc::now());
        self.cancel_handle = None;
    }
}

/// One submitted SQL statement
#[derive(Debug)]
pub struct Job {
    id: String,
    request_id: String,
    sql: String,
    created_at: DateTime<Utc>,
    cancel: CancellationToken,
    state: Mutex<JobState>,
}

impl Job {
    pub fn new(sql: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            request_id: request_id.into(),
            sql: sql.into(),
            created_at: Utc::now(),
            cancel: CancellationToken::new(),
            state: Mutex::new(JobState {
                status: QueryStatus::Queued,
                result: None,
                error: None,
                completed_at: None,
                cancel_handle: None,
                storage_released: false,
            }),
        }
    }

    /// Tie the job's cancellation to `parent`, so canceling the parent
    /// cancels the job whether queued or running.
    pub fn under(mut self, parent: &CancellationToken) -> Self {
        self.cancel = parent.child_token();
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Fires when the job is canceled, whether queued or running
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    fn lock(&self) -> MutexGuard<'_, JobState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn status(&self) -> QueryStatus {
        self.lock().status
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.lock().completed_at
    }

    /// Queued -> Running. Returns the cancel handle for the execution, or None
    /// if the job was canceled before it could start.
    pub fn start_running(&self) -> Option<CancellationToken> {
        let mut state = self.lock();
        if state.status != QueryStatus::Queued || self.cancel.is_cancelled() {
            return None;
        }
        let handle = self.cancel.clone();
        state.status = QueryStatus::Running;
        state.cancel_handle = Some(handle.clone());
        Some(handle)
    }

    /// Running -> Succeeded.
    ///
    /// A result arriving after the job already reached a terminal state is
    /// handed back so the caller can release its storage.
    pub fn complete(&self, result: ResultSet) -> std::result::Result<(), ResultSet> {
        let mut state = self.lock();
        if state.status != QueryStatus::Running {
            return Err(result);
        }
        state.result = Some(result);
        state.error = None;
        state.finish(QueryStatus::Succeeded);
        Ok(())
    }

    /// Running -> Failed. Returns false if the job was no longer running.
    pub fn fail(&self, message: impl Into<String>) -> bool {
        let mut state = self.lock();
        if state.status != QueryStatus::Running {
            return false;
        }
        state.error = Some(message.into());
        state.finish(QueryStatus::Failed);
        true
    }

    /// Running -> Canceled after the engine observed cancellation.
    pub fn mark_canceled(&self, message: Option<String>) -> bool {
        let mut state = self.lock();
        if state.status != QueryStatus::Running {
            return false;
        }
        state.error = Some(message.unwrap_or_else(|| CANCELED_MESSAGE.to_string()));
        state.finish(QueryStatus::Canceled);
        true
    }

    /// Explicit cancel request; a no-op on terminal jobs.
    ///
    /// A queued job is canceled outright and never starts. A running job is
    /// marked Canceled immediately and its cancel handle is invoked, so any
    /// result the execution still produces is discarded.
    pub fn cancel(&self) -> QueryStatus {
        let handle = {
            let mut state = self.lock();
            match state.status {
                QueryStatus::Queued | QueryStatus::Running => {
                    let handle = state.cancel_handle.take();
                    state.error = Some(CANCELED_MESSAGE.to_string());
                    state.finish(QueryStatus::Canceled);
                    handle
                }
                status => return status,
            }
        };

        if let Some(handle) = handle {
            handle.cancel();
        }
        self.cancel.cancel();
        QueryStatus::Canceled
    }

    /// Detach the job's scratch storage for release. Only the first call
    /// returns the id; afterwards results are reported as gone.
    pub fn take_storage(&self) -> Option<String> {
        let mut state = self.lock();
        state.storage_released = true;
        state.result.as_mut().and_then(|result| result.scratch.take())
    }

    /// Result handle for a fetch, or the error matching the current status
    pub fn result(&self) -> Result<ResultSet> {
        let state = self.lock();
        match state.status {
            QueryStatus::Queued | QueryStatus::Running => Err(Error::NotReady),
            QueryStatus::Failed | QueryStatus::Canceled => Err(Error::NotAvailable(
                state
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("query {}", state.status.as_str().to_lowercase())),
            )),
            QueryStatus::Succeeded if state.storage_released => Err(Error::not_found(&self.id)),
            QueryStatus::Succeeded => state
                .result
                .clone()
                .ok_or_else(|| Error::internal("succeeded job has no result")),
        }
    }

    /// Terminal for at least `ttl` as of `now`
    pub fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        let state = self.lock();
        if !state.status.is_terminal() {
            return false;
        }
        state
            .completed_at
            .and_then(|done| now.signed_duration_since(done).to_std().ok())
            .map(|age| age >= ttl)
            .unwrap_or(false)
    }

    pub fn has_cancel_handle(&self) -> bool {
        self.lock().cancel_handle.is_some()
    }

    pub fn snapshot(&self) -> JobSnapshot {
        let state = self.lock();
        let (columns, row_count) = state
            .result
            .as_ref()
            .map(|r| (r.columns.clone(), r.row_count))
            .unwrap_or_default();

        JobSnapshot {
            query_id: self.id.clone(),
            request_id: self.request_id.clone(),
            status: state.status,
            columns,
            row_count,
            error: state.error.clone(),
            created_at: self.created_at,
            completed_at: state.completed_at,
        }
    }
}
