//! Shared Middleware Stack
//!
//! Applied once by the server builder around the agent router.

use axum::{
    body::Body,
    http::{HeaderValue, Request},
    middleware::{self, Next},
    response::Response,
    Router,
};
use std::time::{Duration, Instant};
use tower_http::{
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::Level;

/// Middleware configuration
#[derive(Debug, Clone)]
pub struct MiddlewareConfig {
    /// Enable CORS (default: false; the agent is called server-to-server)
    pub cors_enabled: bool,
    /// Enable request tracing spans (default: true)
    pub tracing_enabled: bool,
    /// Whole-request timeout; must exceed the query timeout
    pub timeout: Duration,
    /// Enable security headers (default: true)
    pub security_headers: bool,
    /// Enable request logging (default: true)
    pub request_logging: bool,
}

impl Default for MiddlewareConfig {
    fn default() -> Self {
        Self {
            cors_enabled: false,
            tracing_enabled: true,
            timeout: Duration::from_secs(150),
            security_headers: true,
            request_logging: true,
        }
    }
}

impl MiddlewareConfig {
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = duration;
        self
    }
}

/// Apply the configured layers to a router
pub fn apply_middleware(router: Router, config: MiddlewareConfig) -> Router {
    let mut router = router;

    // Security headers (innermost - runs first on response)
    if config.security_headers {
        router = router.layer(middleware::from_fn(security_headers_middleware));
    }

    if config.request_logging {
        router = router.layer(middleware::from_fn(request_logging_middleware));
    }

    router = router.layer(TimeoutLayer::new(config.timeout));

    if config.tracing_enabled {
        router = router.layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        );
    }

    // CORS (outermost - runs first on request)
    if config.cors_enabled {
        router = router.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );
    }

    router
}

async fn security_headers_middleware(request: Request<Body>, next: Next) -> Response {
    let mut response = next.run(request).await;

    let headers = response.headers_mut();
    headers.insert("X-Content-Type-Options", HeaderValue::from_static("nosniff"));
    headers.insert("X-Frame-Options", HeaderValue::from_static("DENY"));
    headers.insert("Referrer-Policy", HeaderValue::from_static("no-referrer"));
    // Query results must never be cached by intermediaries
    headers.insert("Cache-Control", HeaderValue::from_static("no-store"));

    response
}

/// Log each request at a level matching its status class
async fn request_logging_middleware(request: Request<Body>, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let response = next.run(request).await;

    let duration_ms = start.elapsed().as_millis() as u64;
    let status = response.status().as_u16();

    if response.status().is_server_error() {
        tracing::error!(%method, %path, status, duration_ms, "request failed");
    } else if response.status().is_client_error() {
        tracing::warn!(%method, %path, status, duration_ms, "request rejected");
    } else {
        tracing::info!(%method, %path, status, duration_ms, "request completed");
    }

    response
}
