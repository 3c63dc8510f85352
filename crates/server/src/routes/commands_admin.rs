use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::state::AppState;
use crate::stores::audit::AuditStore;
use crate::stores::command::{status_from_db, CommandFilter, CommandRecord, CommandStore};
use crate::stores::device::DeviceStore;
use fleet_common::error::{AppError, AppResult};

#[derive(Debug, Deserialize)]
pub struct CreateCommandRequest {
    pub device_id: Uuid,
    #[serde(rename = "type")]
    pub command_type: String,
    #[serde(default)]
    pub parameters: Value,
    pub ttl_seconds: i64,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    device_id: Option<Uuid>,
    status: Option<String>,
    limit: Option<i64>,
}

pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> AppResult<Json<Vec<CommandRecord>>> {
    let status = query
        .status
        .as_deref()
        .map(status_from_db)
        .transpose()
        .map_err(|_| AppError::InvalidInput("invalid status filter".to_string()))?;

    let filter = CommandFilter {
        device_id: query.device_id,
        status,
        limit: query.limit.unwrap_or(100),
    };
    Ok(Json(CommandStore::new(state.db.clone()).list(&filter).await?))
}

pub async fn create(
    State(state): State<AppState>,
    Json(payload): Json<CreateCommandRequest>,
) -> AppResult<(StatusCode, Json<CommandRecord>)> {
    if DeviceStore::new(state.db.clone())
        .get(payload.device_id)
        .await?
        .is_none()
    {
        return Err(AppError::NotFound);
    }

    let parameters = if payload.parameters.is_null() {
        json!({})
    } else {
        payload.parameters
    };
    let created = CommandStore::new(state.db.clone())
        .create(
            payload.device_id,
            &payload.command_type,
            parameters,
            payload.ttl_seconds,
        )
        .await?;

    AuditStore::new(state.db.clone())
        .record(
            "admin",
            "create_command",
            "command",
            &created.command_id.to_string(),
            json!({
                "device_id": payload.device_id,
                "type": created.command_type,
                "ttl_seconds": created.ttl_seconds,
            }),
        )
        .await;

    Ok((StatusCode::CREATED, Json(created)))
}
