use axum::extract::State;
use axum::Json;
use serde_json::json;
use tracing::info;

use crate::auth::token::issue_device_token;
use crate::resolver;
use crate::state::AppState;
use crate::stores::audit::AuditStore;
use crate::stores::device::DeviceStore;
use crate::stores::policy::PolicyStore;
use fleet_common::api::{RegisterRequest, RegisterResponse};
use fleet_common::error::{AppError, AppResult};

/// Create or re-key a device identity. Re-registration rotates the token:
/// the previous secret stops working the moment this returns.
pub async fn register(
    State(state): State<AppState>,
    Json(payload): Json<RegisterRequest>,
) -> AppResult<Json<RegisterResponse>> {
    if payload.device_id.is_nil() {
        return Err(AppError::InvalidInput("device_id is required".to_string()));
    }
    if payload.agent_version.is_empty() {
        return Err(AppError::InvalidInput(
            "agent_version is required".to_string(),
        ));
    }

    let issued = issue_device_token()?;
    let devices = DeviceStore::new(state.db.clone());
    let created = devices
        .upsert_registration(
            payload.device_id,
            &payload.hostname,
            &payload.capabilities,
            &payload.agent_version,
            &issued.token_hash,
        )
        .await?;

    let group_id = devices
        .get(payload.device_id)
        .await?
        .and_then(|d| d.group_id);
    let policies = PolicyStore::new(state.db.clone())
        .candidates_for(payload.device_id, group_id)
        .await?;
    let (effective, _) = resolver::effective_policy(
        &policies,
        payload.device_id,
        group_id,
        &payload.capabilities,
    );

    AuditStore::new(state.db.clone())
        .record(
            "agent",
            if created { "register" } else { "re-register" },
            "device",
            &payload.device_id.to_string(),
            json!({
                "hostname": payload.hostname,
                "agent_version": payload.agent_version,
            }),
        )
        .await;

    info!(device_id = %payload.device_id, created, "device registered");
    Ok(Json(RegisterResponse {
        device_id: payload.device_id,
        auth_token: Some(issued.raw_token),
        policy_version: effective.version,
    }))
}
