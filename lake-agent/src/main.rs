//! lake-agent: Main Entry Point
//!
//! Loads configuration, opens the engine and serves the agent API until
//! Ctrl+C or SIGTERM. On a signal, in-flight queries are canceled before open
//! connections drain.

use anyhow::Context;
use lake_core::config::{load_environment, LogFormat};
use lake_core::{AgentConfig, QueryService, ServiceConfig, SqliteEngine};
use lake_http::{create_router, AppState, HttpServer, MiddlewareConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Added to the query timeout so the engine deadline fires before the HTTP one
const REQUEST_TIMEOUT_SLACK: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_file = load_environment();
    let config = AgentConfig::load().context("Failed to load agent configuration")?;

    init_tracing(config.log_format);
    if let Some(path) = env_file {
        info!(path = %path, "Loaded environment file");
    }
    info!(
        version = env!("CARGO_PKG_VERSION"),
        env = %config.env,
        listen_addr = %config.listen_addr,
        lifecycle = config.query_lifecycle_enabled,
        "Starting lake-agent"
    );

    let engine = SqliteEngine::open(&config.database_path, &config.scratch_dir, config.max_memory_gb)
        .with_context(|| format!("Failed to open database {}", config.database_path.display()))?;

    let service = Arc::new(QueryService::new(Arc::new(engine), ServiceConfig::from(&config))?);
    let state = AppState::from_config(service.clone(), &config);

    let mut builder = HttpServer::builder()
        .bind(config.listen_addr.clone())
        .router(create_router(state))
        .middleware(MiddlewareConfig::default().timeout(config.query_timeout() + REQUEST_TIMEOUT_SLACK));

    builder = match (&config.tls_cert_file, &config.tls_key_file) {
        (Some(cert), Some(key)) => builder.https(cert, key),
        _ => {
            if config.is_production() {
                warn!("Serving plain HTTP in production (allow_insecure_http=true)");
            }
            builder.http_only()
        }
    };

    builder
        .build()?
        .serve_with_shutdown(async move {
            shutdown_signal().await;
            service.shutdown();
        })
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,lake_core=debug,lake_http=debug"));

    match format {
        LogFormat::Compact => tracing_subscriber::registry()
            .with(fmt::layer().compact())
            .with(filter)
            .init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down...");
        },
    }
}
