//! Synchronous execution

use axum::extract::{Request, State};
use axum::Json;
use lake_core::Row;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::auth::RequestId;
use crate::error::ApiError;
use crate::state::AppState;

/// Largest accepted request body
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    #[serde(default)]
    pub sql: String,
    #[serde(default)]
    pub request_id: String,
}

#[derive(Debug, Serialize)]
pub struct ExecuteResponse {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    pub row_count: usize,
    pub request_id: String,
}

/// POST /execute
///
/// Takes a limiter slot before reading the body and answers 429 when none is
/// free. The statement is interrupted if the client disconnects or the agent
/// shuts down.
pub async fn execute(
    State(state): State<AppState>,
    request_id: RequestId,
    request: Request,
) -> Result<Json<ExecuteResponse>, ApiError> {
    let permit = state.service.admit().map_err(|e| {
        warn!(request_id = %request_id.as_str(), "Rejecting query, no execution slot free");
        ApiError::from_error(e, request_id.as_str())
    })?;

    let body = axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES)
        .await
        .map_err(|_| ApiError::parse(request_id.as_str()))?;
    let payload: ExecuteRequest =
        serde_json::from_slice(&body).map_err(|_| ApiError::parse(request_id.as_str()))?;

    let reply = match (request_id.supplied(), payload.request_id.trim()) {
        (None, body_id) if !body_id.is_empty() => body_id.to_string(),
        _ => request_id.as_str().to_string(),
    };

    let cancel = state.service.execution_token();
    let _abort_on_disconnect = cancel.clone().drop_guard();

    info!(request_id = %reply, "Executing query");
    let output = state
        .service
        .execute(permit, &payload.sql, cancel)
        .await
        .map_err(|e| {
            warn!(request_id = %reply, code = %e.code(), error = %e, "Query execution failed");
            ApiError::from_error(e, reply.as_str())
        })?;

    let row_count = output.rows.len();
    info!(request_id = %reply, row_count, "Query completed");

    Ok(Json(ExecuteResponse {
        columns: output.columns,
        rows: output.rows,
        row_count,
        request_id: reply,
    }))
}
