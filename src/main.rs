mod api;
mod config;
mod constants;
mod domain;
mod error;
mod fusion;
mod http_client;
mod meteo;
mod pipeline;
mod point;
mod render;
mod stations;
mod storage;
mod synth;
mod types;
mod utils;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::routing::get;
use axum::Router;
use reqwest::Client;
use tokio::sync::RwLock;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::api::{granules, grid, healthz, meta, point, tile};
use crate::config::Config;
use crate::types::AppState;
use crate::utils::init_tracing;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cfg = Arc::new(Config::from_env()?);
    if !cfg.data_root.is_dir() {
        warn!(
            "Data root {} does not exist yet; requests will report data as unavailable",
            cfg.data_root.display()
        );
    }

    let http = Client::builder()
        .timeout(cfg.request_timeout)
        .user_agent("climatewise-grid/1.0")
        .pool_max_idle_per_host(16)
        .build()
        .context("Failed to build reqwest client")?;

    let state = AppState {
        cfg: cfg.clone(),
        http,
        raster_cache: Arc::new(RwLock::new(HashMap::new())),
    };

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/meta", get(meta))
        .route("/v1/granules/{product}", get(granules))
        .route("/v1/tiles/{product}/{z}", get(tile))
        .route("/v1/grid/{product}", get(grid))
        .route("/v1/point", get(point))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&cfg.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", cfg.listen_addr))?;

    info!(
        "Grid service listening on {} (data root {})",
        cfg.listen_addr,
        cfg.data_root.display()
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
            sigterm.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
