//! Execution Engine
//!
//! Runs one statement under the admission limiter, the per-query deadline and
//! the caller's cancellation token. Engine calls block, so they run on the
//! blocking pool and never under a registry or job lock.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OwnedSemaphorePermit;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::engine::{EngineError, Interrupt, QueryOutput, Row, SqlEngine};
use crate::error::{Error, Result};
use crate::job::{Job, QueryStatus, ResultSet};
use crate::limiter::ExecutionLimiter;
use crate::metrics::AgentMetrics;

/// Statement runner shared by the async job path and synchronous execution
pub struct QueryExecutor {
    engine: Arc<dyn SqlEngine>,
    limiter: ExecutionLimiter,
    metrics: AgentMetrics,
    query_timeout: Duration,
    max_result_rows: usize,
}

impl QueryExecutor {
    pub fn new(
        engine: Arc<dyn SqlEngine>,
        limiter: ExecutionLimiter,
        metrics: AgentMetrics,
        query_timeout: Duration,
        max_result_rows: usize,
    ) -> Self {
        Self {
            engine,
            limiter,
            metrics,
            query_timeout,
            max_result_rows,
        }
    }

    pub fn engine(&self) -> &Arc<dyn SqlEngine> {
        &self.engine
    }

    pub fn limiter(&self) -> &ExecutionLimiter {
        &self.limiter
    }

    /// Drive a queued job to a terminal state.
    ///
    /// Waits for a limiter slot unless the job is canceled first; a job
    /// canceled before it starts never runs and ends Canceled, including when
    /// the cancellation came from a parent token rather than `Job::cancel`.
    #[instrument(skip(self, job), fields(query_id = %job.id()))]
    pub async fn run_job(&self, job: Arc<Job>) {
        let Some(_permit) = self.limiter.acquire(job.cancellation()).await else {
            debug!("Query canceled while waiting for a slot");
            job.cancel();
            self.metrics.query_canceled();
            return;
        };

        let Some(handle) = job.start_running() else {
            debug!(status = %job.status(), "Query no longer queued, skipping execution");
            job.cancel();
            self.metrics.query_canceled();
            return;
        };
        info!(request_id = %job.request_id(), "Query running");

        let interrupt = Interrupt::new(handle, self.query_timeout);
        let engine = self.engine.clone();
        let sql = job.sql().to_string();
        let scratch = job.id().to_string();

        self.metrics.execution_started();
        let started = Instant::now();
        let outcome =
            tokio::task::spawn_blocking(move || engine.materialize(&sql, &scratch, &interrupt)).await;
        self.metrics.execution_finished(started.elapsed().as_secs_f64());

        match outcome {
            Ok(Ok(materialized)) => {
                let row_count = materialized.row_count;
                let result = ResultSet {
                    columns: materialized.columns,
                    row_count,
                    scratch: materialized.scratch,
                };
                match job.complete(result) {
                    Ok(()) => {
                        self.metrics.query_succeeded();
                        info!(row_count, "Query succeeded");
                    }
                    Err(late) => {
                        debug!(status = %job.status(), "Discarding result of a job that already ended");
                        if let Some(scratch) = late.scratch {
                            self.release(scratch).await;
                        }
                    }
                }
            }
            Ok(Err(EngineError::Canceled)) => {
                job.mark_canceled(None);
            }
            Ok(Err(e)) => {
                if job.fail(e.to_string()) {
                    self.metrics.query_failed();
                    info!(error = %e, "Query failed");
                }
            }
            Err(e) => {
                warn!(error = %e, "Query execution task failed");
                if job.fail(format!("execution task failed: {}", e)) {
                    self.metrics.query_failed();
                }
            }
        }

        if job.status() == QueryStatus::Canceled {
            self.metrics.query_canceled();
            info!("Query canceled");
        }
    }

    /// Take a slot for synchronous execution without waiting
    pub fn try_admit(&self) -> Result<OwnedSemaphorePermit> {
        self.limiter.try_acquire().inspect_err(|_| {
            self.metrics.execute_rejected();
        })
    }

    /// Run `sql` inline on an admitted slot, buffering at most the configured
    /// row ceiling.
    ///
    /// The slot is held by the blocking task itself: if the caller goes away
    /// and `cancel` fires, the slot frees only once the engine has stopped.
    #[instrument(skip(self, permit, sql, cancel))]
    pub async fn execute(
        &self,
        permit: OwnedSemaphorePermit,
        sql: &str,
        cancel: CancellationToken,
    ) -> Result<QueryOutput> {
        let interrupt = Interrupt::new(cancel, self.query_timeout);
        let engine = self.engine.clone();
        let metrics = self.metrics.clone();
        let sql = sql.to_string();
        let max_rows = self.max_result_rows;

        let started = Instant::now();
        let outcome = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            metrics.execution_started();
            let output = engine.query(&sql, max_rows, &interrupt);
            metrics.execution_finished(started.elapsed().as_secs_f64());
            output
        })
        .await;

        let output = outcome.map_err(|e| Error::internal(format!("execution task failed: {}", e)))??;
        debug!(
            row_count = output.rows.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Inline query finished"
        );
        Ok(output)
    }

    /// Read rows from a job's scratch storage
    pub async fn read_page(&self, scratch: String, offset: usize, limit: usize) -> Result<Vec<Row>> {
        let engine = self.engine.clone();
        tokio::task::spawn_blocking(move || engine.read_page(&scratch, offset, limit))
            .await
            .map_err(|e| Error::internal(format!("page read task failed: {}", e)))?
            .map_err(|e| Error::Scan(e.to_string()))
    }

    /// Best-effort release of scratch storage no job refers to
    async fn release(&self, scratch: String) {
        let engine = self.engine.clone();
        let target = scratch.clone();
        match tokio::task::spawn_blocking(move || engine.release(&target)).await {
            Ok(Ok(())) => debug!(scratch = %scratch, "Released orphaned result storage"),
            Ok(Err(e)) => warn!(scratch = %scratch, error = %e, "Failed to release orphaned result storage"),
            Err(e) => warn!(scratch = %scratch, error = %e, "Storage release task failed"),
        }
    }
}
