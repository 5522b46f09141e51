use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tracing::info;

mod api;
mod backends;
mod cache;
mod config;
mod error;
mod logging;
mod metrics;
mod pipeline;
mod retrieval;
mod router;
mod security;
mod state;
mod util;

pub use config::Config;
pub use error::AppError;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // When invoked as a Docker HEALTHCHECK, hit /health and exit immediately.
    // This avoids needing any external tool (curl/wget) in the container image.
    if std::env::args().nth(1).as_deref() == Some("--healthcheck") {
        return healthcheck().await;
    }

    let config_path = std::env::var("GATEWAY_CONFIG").ok().map(PathBuf::from);
    let config = Config::load(config_path.as_deref())
        .with_context(|| format!("failed to load config from {config_path:?}"))?;

    let _log_guard = logging::init(&config.server);

    info!(host = %config.server.host, port = config.server.port, env = %config.server.env, "cost-gateway starting");

    let config = Arc::new(config);
    let state = Arc::new(
        state::AppState::new(config.clone())
            .await
            .context("failed to build application state")?,
    );

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .with_context(|| format!("invalid HOST/PORT: {}:{}", config.server.host, config.server.port))?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening");

    let app = api::router(state.clone());

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("shutting down, flushing embedding cache");
    // Stores close their pooled connections on drop; nothing else to flush
    // explicitly, but touching the embeddings handle keeps its cache-dir
    // creation lock from being dropped mid-write.
    drop(state);

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Lightweight healthcheck: GET /health and exit 0 on 200, 1 otherwise.
/// Invoked via `cost-gateway --healthcheck` from Docker HEALTHCHECK.
async fn healthcheck() -> anyhow::Result<()> {
    let host = std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port = std::env::var("PORT").ok().and_then(|v| v.parse::<u16>().ok()).unwrap_or(8080);

    let url = format!("http://{host}:{port}/health");
    let resp = reqwest::get(&url).await?;

    if resp.status().is_success() {
        std::process::exit(0);
    } else {
        std::process::exit(1);
    }
}
