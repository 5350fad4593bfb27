//! lake-http: HTTP/TLS surface of the compute agent
//!
//! Architecture:
//! ```text
//! lake-agent binary
//!     └── lake-http (this crate)
//!         ├── TLS termination (rustls)
//!         ├── Middleware stack (trace, request logging, security headers)
//!         ├── Request-id + shared-secret auth
//!         └── Routes
//!             ├── /queries/*   → asynchronous job lifecycle
//!             ├── /execute     → synchronous, row-capped execution
//!             ├── /health      → engine + job registry health
//!             └── /metrics     → Prometheus text exposition
//! ```

pub mod auth;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod routes;
pub mod server;
pub mod state;
pub mod tls;

// Re-export main types
pub use auth::{RequestId, AGENT_TOKEN_HEADER, REQUEST_ID_HEADER};
pub use error::ApiError;
pub use middleware::MiddlewareConfig;
pub use routes::create_router;
pub use server::{HttpServer, HttpServerBuilder, ServerConfig};
pub use state::AppState;
pub use tls::TlsConfig;

/// Error types for the HTTP server
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("TLS configuration error: {0}")]
    TlsError(String),

    #[error("Server binding error: {0}")]
    BindError(#[from] std::io::Error),

    #[error("Certificate error: {0}")]
    CertificateError(String),
}

pub type Result<T> = std::result::Result<T, ServerError>;
