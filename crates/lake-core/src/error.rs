//! Error types for the compute agent

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::engine::EngineError;

/// Stable error codes surfaced to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Bad or missing credential
    AuthError,
    /// Malformed request body
    ParseError,
    /// Well-formed but semantically invalid request
    ValidationError,
    /// Admission limiter saturated
    TooManyRequests,
    /// Engine returned a failure
    ExecutionError,
    /// Result materialization failed
    ScanError,
    /// Synchronous path row cap exceeded
    ResultLimitExceeded,
    /// Result fetch on an in-flight job
    QueryNotReady,
    /// Result fetch on a failed or canceled job
    QueryNotAvailable,
    /// Unknown job id
    NotFound,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::AuthError => "AUTH_ERROR",
            ErrorCode::ParseError => "PARSE_ERROR",
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::TooManyRequests => "TOO_MANY_REQUESTS",
            ErrorCode::ExecutionError => "EXECUTION_ERROR",
            ErrorCode::ScanError => "SCAN_ERROR",
            ErrorCode::ResultLimitExceeded => "RESULT_LIMIT_EXCEEDED",
            ErrorCode::QueryNotReady => "QUERY_NOT_READY",
            ErrorCode::QueryNotAvailable => "QUERY_NOT_AVAILABLE",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for job and execution operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("query not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Validation(String),

    #[error("too many concurrent queries")]
    TooManyRequests,

    #[error("query is not ready")]
    NotReady,

    #[error("{0}")]
    NotAvailable(String),

    #[error("{0}")]
    Execution(String),

    #[error("{0}")]
    Scan(String),

    #[error("result row limit exceeded")]
    ResultLimitExceeded,

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a not found error
    pub fn not_found(id: impl Into<String>) -> Self {
        Error::NotFound(id.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// Stable code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::NotFound(_) => ErrorCode::NotFound,
            Error::Validation(_) => ErrorCode::ValidationError,
            Error::TooManyRequests => ErrorCode::TooManyRequests,
            Error::NotReady => ErrorCode::QueryNotReady,
            Error::NotAvailable(_) => ErrorCode::QueryNotAvailable,
            Error::Execution(_) => ErrorCode::ExecutionError,
            Error::Scan(_) => ErrorCode::ScanError,
            Error::ResultLimitExceeded => ErrorCode::ResultLimitExceeded,
            Error::Internal(_) => ErrorCode::InternalError,
        }
    }
}

impl From<EngineError> for Error {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Scan(msg) => Error::Scan(msg),
            EngineError::RowLimit(_) => Error::ResultLimitExceeded,
            other => Error::Execution(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable_strings() {
        assert_eq!(Error::NotReady.code().as_str(), "QUERY_NOT_READY");
        assert_eq!(
            Error::NotAvailable("query canceled".into()).code().as_str(),
            "QUERY_NOT_AVAILABLE"
        );
        assert_eq!(Error::not_found("q").code(), ErrorCode::NotFound);
        assert_eq!(
            serde_json::to_value(ErrorCode::ResultLimitExceeded).unwrap(),
            serde_json::json!("RESULT_LIMIT_EXCEEDED")
        );
    }

    #[test]
    fn test_engine_errors_map_to_codes() {
        let err: Error = EngineError::Scan("bad value".into()).into();
        assert_eq!(err.code(), ErrorCode::ScanError);

        let err: Error = EngineError::RowLimit(10).into();
        assert_eq!(err.code(), ErrorCode::ResultLimitExceeded);

        let err: Error = EngineError::Canceled.into();
        assert_eq!(err.code(), ErrorCode::ExecutionError);
    }
}
