//! Prometheus metrics for the query lifecycle
//!
//! Counters per terminal outcome, the limiter occupancy gauge and engine time
//! per statement, all kept in a private registry rendered by `/metrics`.

use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder};

/// Query lifecycle metrics
#[derive(Clone)]
pub struct AgentMetrics {
    /// Jobs accepted by submit (idempotent replays excluded)
    queries_submitted: IntCounter,

    queries_succeeded: IntCounter,

    queries_failed: IntCounter,

    queries_canceled: IntCounter,

    /// Jobs removed by TTL eviction
    jobs_evicted: IntCounter,

    /// Synchronous executions turned away by the limiter
    execute_rejected: IntCounter,

    /// Statements currently holding a limiter slot
    active_executions: IntGauge,

    /// Engine time per statement
    query_duration: Histogram,

    registry: Registry,
}

impl AgentMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let queries_submitted = IntCounter::new(
            "lake_queries_submitted_total",
            "Total number of query jobs submitted",
        )?;
        registry.register(Box::new(queries_submitted.clone()))?;

        let queries_succeeded = IntCounter::new(
            "lake_queries_succeeded_total",
            "Total number of query jobs that succeeded",
        )?;
        registry.register(Box::new(queries_succeeded.clone()))?;

        let queries_failed = IntCounter::new(
            "lake_queries_failed_total",
            "Total number of query jobs that failed",
        )?;
        registry.register(Box::new(queries_failed.clone()))?;

        let queries_canceled = IntCounter::new(
            "lake_queries_canceled_total",
            "Total number of query jobs canceled",
        )?;
        registry.register(Box::new(queries_canceled.clone()))?;

        let jobs_evicted = IntCounter::new(
            "lake_jobs_evicted_total",
            "Total number of terminal jobs evicted after their TTL",
        )?;
        registry.register(Box::new(jobs_evicted.clone()))?;

        let execute_rejected = IntCounter::new(
            "lake_execute_rejected_total",
            "Synchronous executions rejected because no slot was free",
        )?;
        registry.register(Box::new(execute_rejected.clone()))?;

        let active_executions = IntGauge::new(
            "lake_active_executions",
            "Number of statements currently executing",
        )?;
        registry.register(Box::new(active_executions.clone()))?;

        let query_duration = Histogram::with_opts(
            HistogramOpts::new(
                "lake_query_duration_seconds",
                "Statement execution duration in seconds",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0]),
        )?;
        registry.register(Box::new(query_duration.clone()))?;

        Ok(Self {
            queries_submitted,
            queries_succeeded,
            queries_failed,
            queries_canceled,
            jobs_evicted,
            execute_rejected,
            active_executions,
            query_duration,
            registry,
        })
    }

    pub fn query_submitted(&self) {
        self.queries_submitted.inc();
    }

    pub fn query_succeeded(&self) {
        self.queries_succeeded.inc();
    }

    pub fn query_failed(&self) {
        self.queries_failed.inc();
    }

    pub fn query_canceled(&self) {
        self.queries_canceled.inc();
    }

    pub fn jobs_evicted(&self, count: usize) {
        self.jobs_evicted.inc_by(count as u64);
    }

    pub fn execute_rejected(&self) {
        self.execute_rejected.inc();
    }

    pub fn execution_started(&self) {
        self.active_executions.inc();
    }

    pub fn execution_finished(&self, elapsed_secs: f64) {
        self.active_executions.dec();
        self.query_duration.observe(elapsed_secs);
    }

    /// Text exposition format for scraping
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
