//! Asynchronous query lifecycle handlers

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use lake_core::{Error, JobSnapshot, PageRequest, QueryStatus, ResultPage};
use serde::{Deserialize, Serialize};

use crate::auth::RequestId;
use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    #[serde(default)]
    pub sql: String,
    #[serde(default)]
    pub request_id: String,
}

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub query_id: String,
    pub status: QueryStatus,
    pub request_id: String,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub query_id: String,
    pub status: QueryStatus,
    pub columns: Vec<String>,
    pub row_count: usize,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub request_id: String,
}

impl StatusResponse {
    fn new(snapshot: JobSnapshot, request_id: &RequestId) -> Self {
        let request_id = reply_id(&snapshot.request_id, request_id);
        Self {
            query_id: snapshot.query_id,
            status: snapshot.status,
            columns: snapshot.columns,
            row_count: snapshot.row_count,
            error: snapshot.error,
            created_at: snapshot.created_at,
            completed_at: snapshot.completed_at,
            request_id,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ResultsParams {
    pub page_token: Option<String>,
    pub max_results: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ResultsResponse {
    #[serde(flatten)]
    pub page: ResultPage,
    pub request_id: String,
}

/// The job's own request id when it has one, else this request's id
fn reply_id(job_request_id: &str, request_id: &RequestId) -> String {
    if job_request_id.is_empty() {
        request_id.as_str().to_string()
    } else {
        job_request_id.to_string()
    }
}

/// POST /queries
pub async fn submit_query(
    State(state): State<AppState>,
    request_id: RequestId,
    body: Bytes,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let request: SubmitRequest =
        serde_json::from_slice(&body).map_err(|_| ApiError::parse(request_id.as_str()))?;

    // Idempotency key: body first, then the caller's X-Request-ID
    let key = match request.request_id.trim() {
        "" => request_id.supplied().unwrap_or_default(),
        key => key,
    };
    let reply = reply_id(key, &request_id);

    let outcome = state
        .service
        .submit(&request.sql, key)
        .await
        .map_err(|e| ApiError::from_error(e, reply.as_str()))?;

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            query_id: outcome.query_id,
            status: outcome.status,
            request_id: reply,
        }),
    ))
}

/// GET /queries/:id
pub async fn get_query(
    State(state): State<AppState>,
    Path(query_id): Path<String>,
    request_id: RequestId,
) -> Result<Json<StatusResponse>, ApiError> {
    let snapshot = state
        .service
        .status(&query_id)
        .await
        .map_err(|e| ApiError::from_error(e, request_id.as_str()))?;
    Ok(Json(StatusResponse::new(snapshot, &request_id)))
}

/// GET /queries/:id/results?page_token=&max_results=
pub async fn fetch_results(
    State(state): State<AppState>,
    Path(query_id): Path<String>,
    Query(params): Query<ResultsParams>,
    request_id: RequestId,
) -> Result<Json<ResultsResponse>, ApiError> {
    let fail = |e: Error| ApiError::from_error(e, request_id.as_str());

    let max_results = match params.max_results.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => Some(raw.parse::<i64>().map_err(|_| {
            fail(Error::validation(format!("invalid max_results: {:?}", raw)))
        })?),
    };

    let config = state.service.config();
    let page = PageRequest::resolve(
        params.page_token.as_deref(),
        max_results,
        config.default_page_size,
        config.max_page_size,
    )
    .map_err(fail)?;

    let page = state
        .service
        .fetch_results(&query_id, page)
        .await
        .map_err(fail)?;

    Ok(Json(ResultsResponse {
        request_id: reply_id(&page.request_id, &request_id),
        page,
    }))
}

/// POST /queries/:id/cancel
pub async fn cancel_query(
    State(state): State<AppState>,
    Path(query_id): Path<String>,
    request_id: RequestId,
) -> Result<Json<SubmitResponse>, ApiError> {
    let snapshot = state
        .service
        .cancel(&query_id)
        .await
        .map_err(|e| ApiError::from_error(e, request_id.as_str()))?;

    Ok(Json(SubmitResponse {
        request_id: reply_id(&snapshot.request_id, &request_id),
        query_id: snapshot.query_id,
        status: snapshot.status,
    }))
}

/// DELETE /queries/:id
pub async fn delete_query(
    State(state): State<AppState>,
    Path(query_id): Path<String>,
    request_id: RequestId,
) -> Result<Json<SubmitResponse>, ApiError> {
    let snapshot = state
        .service
        .delete(&query_id)
        .await
        .map_err(|e| ApiError::from_error(e, request_id.as_str()))?;

    Ok(Json(SubmitResponse {
        request_id: reply_id(&snapshot.request_id, &request_id),
        query_id: snapshot.query_id,
        status: QueryStatus::Canceled,
    }))
}
