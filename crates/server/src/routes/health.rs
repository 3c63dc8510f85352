use std::time::Duration;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;

use crate::db;
use crate::metrics::gather_text;
use crate::state::AppState;
use fleet_common::api::HealthResponse;

const DB_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

pub async fn health(State(state): State<AppState>) -> Response {
    let database = match tokio::time::timeout(DB_PROBE_TIMEOUT, db::ping(&state.db)).await {
        Ok(Ok(())) => "ok".to_string(),
        Ok(Err(e)) => format!("error: {e}"),
        Err(_) => "error: probe timed out".to_string(),
    };

    let log = match state.log.connection_state() {
        async_nats::connection::State::Connected => "ok".to_string(),
        other => format!("error: {other:?}"),
    };

    let healthy = database == "ok" && log == "ok";
    let body = HealthResponse {
        status: if healthy { "healthy" } else { "unhealthy" }.to_string(),
        database,
        log,
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime: state.started_at.elapsed().as_secs(),
        timestamp: Utc::now(),
    };

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body)).into_response()
}

pub async fn metrics() -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        gather_text(),
    )
        .into_response()
}
