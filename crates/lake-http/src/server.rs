//! HTTP/TLS Server
//!
//! Serves the agent router over plain HTTP or, when a certificate pair is
//! configured, HTTPS only. Both modes stop accepting connections when the
//! shutdown future resolves and let open connections finish their current
//! request before returning.

use crate::middleware::{apply_middleware, MiddlewareConfig};
use crate::tls::TlsConfig;
use crate::{Result, ServerError};
use axum::Router;
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// How long in-flight HTTPS connections get to finish after shutdown
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Server configuration
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Bind address (host:port)
    pub bind_addr: String,
    /// Public hostname for logging
    pub public_host: String,
    pub tls: TlsConfig,
}

/// Agent HTTP server
pub struct HttpServer {
    config: ServerConfig,
    router: Router,
}

impl HttpServer {
    pub fn builder() -> HttpServerBuilder {
        HttpServerBuilder::new()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Serve until `shutdown` resolves
    pub async fn serve_with_shutdown<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr: SocketAddr = self.config.bind_addr.parse().map_err(|_| {
            ServerError::BindError(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Invalid bind address: {}", self.config.bind_addr),
            ))
        })?;

        let tls_acceptor = self.config.tls.build_acceptor()?;
        let listener = TcpListener::bind(addr).await.map_err(ServerError::BindError)?;

        let Some(acceptor) = tls_acceptor else {
            info!("HTTP server listening on http://{}", addr);
            info!("Public URL: http://{}:{}", self.config.public_host, addr.port());

            axum::serve(listener, self.router)
                .with_graceful_shutdown(shutdown)
                .await
                .map_err(|e| ServerError::BindError(std::io::Error::other(e)))?;
            return Ok(());
        };

        info!("HTTPS server listening on https://{}", addr);
        info!("Public URL: https://{}:{}", self.config.public_host, addr.port());

        serve_connections(listener, self.router, shutdown, move |stream| acceptor.accept(stream)).await;
        Ok(())
    }
}

/// Accept loop for connections that need a handshake before HTTP, such as TLS.
///
/// Once `shutdown` resolves the listener closes and every open connection is
/// asked to finish its in-flight request; the call returns when all of them
/// have closed or [`DRAIN_TIMEOUT`] passes.
async fn serve_connections<F, H, Fut, S>(listener: TcpListener, router: Router, shutdown: F, handshake: H)
where
    F: Future<Output = ()>,
    H: Fn(TcpStream) -> Fut,
    Fut: Future<Output = std::io::Result<S>> + Send + 'static,
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let connections = TaskTracker::new();
    let draining = CancellationToken::new();

    tokio::pin!(shutdown);
    loop {
        let (stream, peer_addr) = tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown requested, no longer accepting connections");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection");
                    continue;
                }
            },
        };

        let handshake = handshake(stream);
        let router = router.clone();
        let draining = draining.clone();
        connections.spawn(async move {
            let stream = match handshake.await {
                Ok(stream) => stream,
                Err(e) => {
                    debug!("Handshake error from {}: {}", peer_addr, e);
                    return;
                }
            };

            let io = TokioIo::new(stream);
            let service = TowerToHyperService::new(router);
            let conn = http1::Builder::new().serve_connection(io, service);
            tokio::pin!(conn);

            let outcome = tokio::select! {
                outcome = conn.as_mut() => outcome,
                _ = draining.cancelled() => {
                    conn.as_mut().graceful_shutdown();
                    conn.as_mut().await
                }
            };
            if let Err(e) = outcome {
                debug!("Connection error from {}: {}", peer_addr, e);
            }
        });
    }

    drop(listener);
    draining.cancel();
    connections.close();
    if tokio::time::timeout(DRAIN_TIMEOUT, connections.wait()).await.is_err() {
        warn!(
            open = connections.len(),
            "Connections still open after drain timeout, abandoning them"
        );
    } else {
        debug!("All connections drained");
    }
}

/// Builder for HttpServer
pub struct HttpServerBuilder {
    bind_addr: String,
    public_host: Option<String>,
    tls_config: TlsConfig,
    router: Option<Router>,
    middleware_config: MiddlewareConfig,
}

impl HttpServerBuilder {
    pub fn new() -> Self {
        Self {
            bind_addr: "0.0.0.0:9443".to_string(),
            public_host: None,
            tls_config: TlsConfig::default(),
            router: None,
            middleware_config: MiddlewareConfig::default(),
        }
    }

    /// Set bind address (host:port)
    pub fn bind(mut self, addr: impl Into<String>) -> Self {
        self.bind_addr = addr.into();
        self
    }

    pub fn public_host(mut self, host: impl Into<String>) -> Self {
        self.public_host = Some(host.into());
        self
    }

    /// Enable HTTPS with explicit certificate paths
    pub fn https(mut self, cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        self.tls_config = TlsConfig::with_certs(cert_path, key_path);
        self
    }

    pub fn http_only(mut self) -> Self {
        self.tls_config = TlsConfig::disabled();
        self
    }

    pub fn router(mut self, router: Router) -> Self {
        self.router = Some(router);
        self
    }

    pub fn middleware(mut self, config: MiddlewareConfig) -> Self {
        self.middleware_config = config;
        self
    }

    pub fn build(self) -> Result<HttpServer> {
        let router = apply_middleware(self.router.unwrap_or_default(), self.middleware_config);

        let public_host = self
            .public_host
            .unwrap_or_else(|| gethostname::gethostname().to_string_lossy().to_string());

        let config = ServerConfig {
            bind_addr: self.bind_addr,
            public_host,
            tls: self.tls_config,
        };

        Ok(HttpServer { config, router })
    }
}

impl Default for HttpServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
