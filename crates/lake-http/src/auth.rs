//! Request ids and shared-secret authentication
//!
//! `request_id_middleware` runs outermost so even rejected requests carry an
//! id; `require_token` runs before any handler, so unauthenticated requests
//! are turned away before their body is read.

use axum::extract::{FromRequestParts, Request, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::convert::Infallible;
use subtle::ConstantTimeEq;
use tracing::warn;
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const AGENT_TOKEN_HEADER: &str = "x-agent-token";

/// Correlation id of the current request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestId {
    value: String,
    /// Taken from the caller's X-Request-ID header rather than generated
    supplied: bool,
}

impl RequestId {
    pub fn generate() -> Self {
        Self {
            value: Uuid::new_v4().to_string(),
            supplied: false,
        }
    }

    fn from_headers(headers: &HeaderMap) -> Self {
        headers
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| Self {
                value: v.to_string(),
                supplied: true,
            })
            .unwrap_or_else(Self::generate)
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }

    /// The caller's own id, if they sent one
    pub fn supplied(&self) -> Option<&str> {
        self.supplied.then_some(self.value.as_str())
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for RequestId
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(parts
            .extensions
            .get::<RequestId>()
            .cloned()
            .unwrap_or_else(|| RequestId::from_headers(&parts.headers)))
    }
}

/// Attach a [`RequestId`] to the request and echo it on the response
pub async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    let request_id = RequestId::from_headers(request.headers());
    request.extensions_mut().insert(request_id.clone());

    let mut response = next.run(request).await;
    if !response.headers().contains_key(REQUEST_ID_HEADER) {
        if let Ok(value) = HeaderValue::from_str(request_id.as_str()) {
            response.headers_mut().insert(REQUEST_ID_HEADER, value);
        }
    }
    response
}

/// Reject requests that do not present the agent token
pub async fn require_token(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let authorized = extract_auth_token(request.headers())
        .map(|token| bool::from(token.as_bytes().ct_eq(state.token.as_bytes())))
        .unwrap_or(false);

    if !authorized {
        let request_id = request
            .extensions()
            .get::<RequestId>()
            .map(|id| id.as_str().to_string())
            .unwrap_or_default();
        warn!(
            request_id = %request_id,
            path = %request.uri().path(),
            "Rejected request without a valid agent token"
        );
        return ApiError::unauthorized(request_id).into_response();
    }

    next.run(request).await
}

/// Token from `X-Agent-Token` or `Authorization: Bearer`
fn extract_auth_token(headers: &HeaderMap) -> Option<&str> {
    if let Some(raw) = headers.get(AGENT_TOKEN_HEADER).and_then(|v| v.to_str().ok()) {
        let token = raw.trim();
        if !token.is_empty() {
            return Some(token);
        }
    }

    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|raw| raw.trim().strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(*k, HeaderValue::from_static(v));
        }
        map
    }

    #[test]
    fn test_extract_agent_token_header() {
        let map = headers(&[(AGENT_TOKEN_HEADER, " secret ")]);
        assert_eq!(extract_auth_token(&map), Some("secret"));
    }

    #[test]
    fn test_extract_bearer_token() {
        let map = headers(&[("authorization", "Bearer secret")]);
        assert_eq!(extract_auth_token(&map), Some("secret"));

        let map = headers(&[("authorization", "Basic c2VjcmV0")]);
        assert_eq!(extract_auth_token(&map), None);

        let map = headers(&[(AGENT_TOKEN_HEADER, ""), ("authorization", "Bearer  ")]);
        assert_eq!(extract_auth_token(&map), None);
    }

    #[test]
    fn test_request_id_from_header_or_generated() {
        let supplied = RequestId::from_headers(&headers(&[(REQUEST_ID_HEADER, "abc")]));
        assert_eq!(supplied.as_str(), "abc");
        assert_eq!(supplied.supplied(), Some("abc"));

        let generated = RequestId::from_headers(&HeaderMap::new());
        assert!(generated.supplied().is_none());
        assert!(Uuid::parse_str(generated.as_str()).is_ok());
    }
}
