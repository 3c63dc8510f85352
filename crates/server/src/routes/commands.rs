use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::auth::device::AuthedDevice;
use crate::metrics::COMMANDS;
use crate::state::AppState;
use crate::stores::audit::AuditStore;
use crate::stores::command::{status_to_db, CommandRecord, CommandStore};
use fleet_common::api::CommandAck;
use fleet_common::error::{AppError, AppResult};

const DEFAULT_CLAIM_LIMIT: i64 = 10;

#[derive(Debug, Deserialize)]
pub struct PollQuery {
    limit: Option<i64>,
}

/// Hand out pending commands, atomically claimed as `executing`. A command
/// appears in exactly one poll response.
pub async fn poll(
    State(state): State<AppState>,
    Extension(device): Extension<AuthedDevice>,
    Query(query): Query<PollQuery>,
) -> AppResult<Json<Vec<CommandRecord>>> {
    let limit = query.limit.unwrap_or(DEFAULT_CLAIM_LIMIT);
    let claimed = CommandStore::new(state.db.clone())
        .claim_pending(device.device_id, limit)
        .await?;

    if !claimed.is_empty() {
        COMMANDS
            .with_label_values(&["claimed"])
            .inc_by(claimed.len() as f64);
        info!(
            device_id = %device.device_id,
            count = claimed.len(),
            "commands claimed"
        );
    }
    Ok(Json(claimed))
}

/// Record a command outcome. Acknowledgement is idempotent by command id:
/// the first terminal status wins and repeats are no-ops.
pub async fn ack(
    State(state): State<AppState>,
    Extension(device): Extension<AuthedDevice>,
    Path((_, command_id)): Path<(String, Uuid)>,
    Json(payload): Json<CommandAck>,
) -> AppResult<StatusCode> {
    if payload.result.is_none() && payload.error.is_none() {
        return Err(AppError::InvalidInput(
            "ack requires result or error".to_string(),
        ));
    }

    let status = CommandStore::new(state.db.clone())
        .ack(command_id, device.device_id, &payload)
        .await?;
    COMMANDS.with_label_values(&["acknowledged"]).inc();

    AuditStore::new(state.db.clone())
        .record(
            "agent",
            "ack_command",
            "command",
            &command_id.to_string(),
            json!({ "status": status_to_db(status) }),
        )
        .await;

    info!(
        device_id = %device.device_id,
        command_id = %command_id,
        status = status_to_db(status),
        "command acknowledged"
    );
    Ok(StatusCode::OK)
}
