pub mod auth;
pub mod config;
pub mod db;
pub mod ingest;
pub mod metrics;
pub mod rate_limit;
pub mod resolver;
pub mod routes;
pub mod state;
pub mod stores;
pub mod workers;

use std::net::SocketAddr;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::state::AppState;
use fleet_common::error::{AppError, AppResult};

/// Connect the stores, provision the durable log, spawn the background
/// workers and serve until shutdown.
pub async fn serve(config: ServerConfig) -> AppResult<()> {
    if config.tls_cert_file.is_some() || config.tls_key_file.is_some() {
        warn!("TLS_CERT_FILE/TLS_KEY_FILE set; terminate TLS at the fronting proxy");
    }

    let pool = db::connect_and_migrate(&config.database_url).await?;
    let log = ingest::LogPublisher::connect(&config.nats_url).await?;
    let bind_addr = config.bind_addr.clone();
    let state = AppState::new(config, pool, log);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    workers::spawn_all(&state, shutdown_rx);

    let app = routes::build_router(state);
    let addr: SocketAddr = bind_addr
        .parse()
        .map_err(|e| AppError::Config(format!("invalid bind address: {e}")))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| AppError::External(format!("bind failed: {e}")))?;
    info!(%addr, "fleet server listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    })
    .await
    .map_err(|e| AppError::External(format!("server error: {e}")))
}
