//! Health and metrics handlers

use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::Json;
use lake_core::HealthSnapshot;

use crate::auth::RequestId;
use crate::error::ApiError;
use crate::state::AppState;

/// GET /health
pub async fn health(
    State(state): State<AppState>,
    request_id: RequestId,
) -> Result<Json<HealthSnapshot>, ApiError> {
    state
        .service
        .health()
        .await
        .map(Json)
        .map_err(|e| ApiError::from_error(e, request_id.as_str()))
}

/// GET /metrics - Prometheus text exposition
pub async fn metrics(
    State(state): State<AppState>,
    request_id: RequestId,
) -> Result<impl IntoResponse, ApiError> {
    let body = state
        .service
        .render_metrics()
        .map_err(|e| ApiError::from_error(e, request_id.as_str()))?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    ))
}
