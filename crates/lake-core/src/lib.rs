//! Query job subsystem for the lakehouse compute agent
//!
//! # Modules
//!
//! - `config`: Agent configuration and environment file loading
//! - `error`: Error taxonomy and Result alias
//! - `job`: Job entity and its state machine
//! - `registry`: Thread-safe job storage, request-id index and TTL eviction
//! - `engine`: Embedded SQL engine seam and the SQLite implementation
//! - `limiter`: Fixed-capacity admission limiter
//! - `executor`: Runs one statement under the limiter, deadline and cancellation
//! - `pagination`: Continuation tokens and page clamping
//! - `metrics`: Prometheus counters for the job lifecycle
//! - `service`: Boundary operations (submit, status, fetch, cancel, delete, health)

pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod job;
pub mod limiter;
pub mod metrics;
pub mod pagination;
pub mod registry;
pub mod service;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports
pub use config::AgentConfig;
pub use engine::{EngineError, EngineInfo, Interrupt, Materialized, QueryOutput, Row, SqlEngine, SqliteEngine};
pub use error::{Error, ErrorCode, Result};
pub use executor::QueryExecutor;
pub use job::{Job, JobSnapshot, QueryStatus, ResultSet};
pub use limiter::ExecutionLimiter;
pub use metrics::AgentMetrics;
pub use pagination::{PageRequest, ResultPage};
pub use registry::{JobRegistry, RegistryMetrics};
pub use service::{HealthSnapshot, QueryService, ServiceConfig, SubmitOutcome};
