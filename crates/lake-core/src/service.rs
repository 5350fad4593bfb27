//! Lifecycle Orchestrator
//!
//! The operations exposed at the boundary. Every job operation first gives
//! the registry a chance to sweep expired jobs.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OwnedSemaphorePermit;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::AgentConfig;
use crate::engine::{QueryOutput, SqlEngine};
use crate::error::{Error, Result};
use crate::executor::QueryExecutor;
use crate::job::{Job, JobSnapshot, QueryStatus};
use crate::limiter::ExecutionLimiter;
use crate::metrics::AgentMetrics;
use crate::pagination::{next_token, PageRequest, ResultPage};
use crate::registry::{JobRegistry, RegistryMetrics};

/// Settings the service needs from [`AgentConfig`]
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub query_timeout: Duration,
    pub max_result_rows: usize,
    pub max_concurrent_queries: usize,
    pub result_ttl: Duration,
    pub cleanup_interval: Duration,
    pub default_page_size: usize,
    pub max_page_size: usize,
    pub max_memory_gb: u32,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            query_timeout: Duration::from_secs(120),
            max_result_rows: 10_000,
            max_concurrent_queries: 8,
            result_ttl: Duration::from_secs(600),
            cleanup_interval: Duration::from_secs(60),
            default_page_size: 1000,
            max_page_size: 5000,
            max_memory_gb: 0,
        }
    }
}

impl From<&AgentConfig> for ServiceConfig {
    fn from(config: &AgentConfig) -> Self {
        Self {
            query_timeout: config.query_timeout(),
            max_result_rows: config.max_result_rows,
            max_concurrent_queries: config.max_concurrent_queries,
            result_ttl: config.result_ttl(),
            cleanup_interval: config.cleanup_interval(),
            default_page_size: config.default_page_size,
            max_page_size: config.max_page_size,
            max_memory_gb: config.max_memory_gb,
        }
    }
}

/// Result of Submit
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitOutcome {
    pub query_id: String,
    pub status: QueryStatus,
    pub request_id: String,
    /// False when an existing job was returned for a repeated request id
    pub created: bool,
}

/// Engine and registry health
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: &'static str,
    pub uptime_seconds: u64,
    pub engine_version: String,
    pub memory_used_mb: i64,
    pub max_memory_gb: u32,
    pub active_queries: usize,
    #[serde(flatten)]
    pub jobs: RegistryMetrics,
    pub result_ttl_secs: u64,
}

/// Asynchronous query jobs plus synchronous execution
pub struct QueryService {
    registry: Arc<JobRegistry>,
    executor: Arc<QueryExecutor>,
    metrics: AgentMetrics,
    config: ServiceConfig,
    /// Parent of every job and inline execution token
    shutdown: CancellationToken,
    started_at: Instant,
}

impl QueryService {
    pub fn new(engine: Arc<dyn SqlEngine>, config: ServiceConfig) -> Result<Self> {
        let metrics = AgentMetrics::new()
            .map_err(|e| Error::internal(format!("failed to register metrics: {}", e)))?;
        let registry = Arc::new(JobRegistry::new(
            engine.clone(),
            config.result_ttl,
            config.cleanup_interval,
        ));
        let executor = Arc::new(QueryExecutor::new(
            engine,
            ExecutionLimiter::new(config.max_concurrent_queries),
            metrics.clone(),
            config.query_timeout,
            config.max_result_rows,
        ));

        Ok(Self {
            registry,
            executor,
            metrics,
            config,
            shutdown: CancellationToken::new(),
            started_at: Instant::now(),
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &AgentMetrics {
        &self.metrics
    }

    /// Cancel every queued and running job and interrupt inline executions.
    ///
    /// Jobs submitted afterwards are canceled before they start.
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            info!(active = self.executor.limiter().active(), "Canceling in-flight queries");
            self.shutdown.cancel();
        }
    }

    /// Cancellation token for one inline execution, fired on shutdown
    pub fn execution_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    /// Opportunistic eviction, rate-limited by the registry
    async fn sweep(&self) {
        let evicted = self.registry.sweep(Utc::now()).await;
        if evicted > 0 {
            self.metrics.jobs_evicted(evicted);
        }
    }

    async fn job(&self, query_id: &str) -> Result<Arc<Job>> {
        self.registry
            .get(query_id)
            .await
            .ok_or_else(|| Error::not_found(query_id))
    }

    /// Register a job and start it in the background.
    ///
    /// A non-empty `request_id` already owned by a live job returns that job
    /// instead; no second execution is started.
    pub async fn submit(&self, sql: &str, request_id: &str) -> Result<SubmitOutcome> {
        self.sweep().await;

        let sql = sql.trim();
        if sql.is_empty() {
            return Err(Error::validation("sql is required"));
        }

        let (job, created) = self
            .registry
            .get_or_insert_with(request_id, || Job::new(sql, request_id).under(&self.shutdown))
            .await;

        if created {
            self.metrics.query_submitted();
            info!(query_id = %job.id(), request_id = %request_id, "Query submitted");

            let executor = self.executor.clone();
            let task_job = job.clone();
            tokio::spawn(async move { executor.run_job(task_job).await });
        } else {
            debug!(query_id = %job.id(), request_id = %request_id, "Returning existing job for request id");
        }

        Ok(SubmitOutcome {
            query_id: job.id().to_string(),
            status: job.status(),
            request_id: job.request_id().to_string(),
            created,
        })
    }

    pub async fn status(&self, query_id: &str) -> Result<JobSnapshot> {
        self.sweep().await;
        Ok(self.job(query_id).await?.snapshot())
    }

    /// One page of a succeeded job's rows
    pub async fn fetch_results(&self, query_id: &str, page: PageRequest) -> Result<ResultPage> {
        self.sweep().await;

        let job = self.job(query_id).await?;
        let result = job.result()?;
        let (count, next_offset) = page.window(result.row_count);

        let rows = match result.scratch {
            Some(scratch) if count > 0 => {
                match self.executor.read_page(scratch, page.offset, count).await {
                    Ok(rows) => rows,
                    // Storage released underneath us by delete or eviction
                    Err(e) => return Err(job.result().err().unwrap_or(e)),
                }
            }
            _ => Vec::new(),
        };

        Ok(ResultPage {
            query_id: job.id().to_string(),
            request_id: job.request_id().to_string(),
            columns: result.columns,
            rows,
            row_count: result.row_count,
            next_page_token: next_token(next_offset, result.row_count),
        })
    }

    /// Request cancellation; a no-op on terminal jobs
    pub async fn cancel(&self, query_id: &str) -> Result<JobSnapshot> {
        self.sweep().await;

        let job = self.job(query_id).await?;
        let status = job.cancel();
        info!(query_id = %query_id, status = %status, "Cancel requested");
        Ok(job.snapshot())
    }

    /// Cancel if in flight, release storage, then forget the job
    pub async fn delete(&self, query_id: &str) -> Result<JobSnapshot> {
        self.sweep().await;

        let job = self.job(query_id).await?;
        job.cancel();
        self.registry.release_storage(&job).await;
        self.registry.remove(query_id).await;
        info!(query_id = %query_id, "Query deleted");
        Ok(job.snapshot())
    }

    pub async fn health(&self) -> Result<HealthSnapshot> {
        self.sweep().await;

        let engine = self.executor.engine().clone();
        let info = tokio::task::spawn_blocking(move || engine.info())
            .await
            .map_err(|e| Error::internal(format!("health task failed: {}", e)))?;

        Ok(HealthSnapshot {
            status: "ok",
            uptime_seconds: self.started_at.elapsed().as_secs(),
            engine_version: info.version,
            memory_used_mb: info.memory_used_bytes / (1024 * 1024),
            max_memory_gb: self.config.max_memory_gb,
            active_queries: self.executor.limiter().active(),
            jobs: self.registry.metrics().await,
            result_ttl_secs: self.config.result_ttl.as_secs(),
        })
    }

    /// Reserve a slot for [`QueryService::execute`]; fails fast when saturated
    pub fn admit(&self) -> Result<OwnedSemaphorePermit> {
        self.executor.try_admit()
    }

    /// Synchronous execution outside the job registry
    pub async fn execute(
        &self,
        permit: OwnedSemaphorePermit,
        sql: &str,
        cancel: CancellationToken,
    ) -> Result<QueryOutput> {
        let sql = sql.trim();
        if sql.is_empty() {
            return Err(Error::validation("sql is required"));
        }
        self.executor.execute(permit, sql, cancel).await
    }

    pub fn render_metrics(&self) -> Result<String> {
        self.metrics
            .render()
            .map_err(|e| Error::internal(format!("failed to encode metrics: {}", e)))
    }
}
