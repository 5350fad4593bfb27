//! JSON error envelope
//!
//! Every failure is reported as `{error, code, request_id}` with the HTTP
//! status that belongs to its code.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use lake_core::{Error, ErrorCode};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: ErrorCode,
    pub request_id: String,
}

/// Error response carrying its status, stable code and request id
#[derive(Debug, Clone)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorBody,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self {
            status: status_for(code),
            body: ErrorBody {
                error: message.into(),
                code,
                request_id: request_id.into(),
            },
        }
    }

    pub fn from_error(err: Error, request_id: impl Into<String>) -> Self {
        Self::new(err.code(), err.to_string(), request_id)
    }

    pub fn unauthorized(request_id: impl Into<String>) -> Self {
        Self::new(ErrorCode::AuthError, "unauthorized", request_id)
    }

    pub fn parse(request_id: impl Into<String>) -> Self {
        Self::new(ErrorCode::ParseError, "invalid request body", request_id)
    }
}

/// HTTP status for each error code
pub fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::AuthError => StatusCode::UNAUTHORIZED,
        ErrorCode::ParseError | ErrorCode::ValidationError => StatusCode::BAD_REQUEST,
        ErrorCode::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
        ErrorCode::ResultLimitExceeded => StatusCode::PAYLOAD_TOO_LARGE,
        ErrorCode::QueryNotReady | ErrorCode::QueryNotAvailable => StatusCode::CONFLICT,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::ExecutionError | ErrorCode::ScanError | ErrorCode::InternalError => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}
