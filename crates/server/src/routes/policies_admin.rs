use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::state::AppState;
use crate::stores::audit::AuditStore;
use crate::stores::policy::{PolicyRow, PolicyScope, PolicyStore};
use fleet_common::error::AppResult;
use fleet_common::types::PolicyConfig;

#[derive(Debug, Deserialize)]
pub struct CreatePolicyRequest {
    pub scope: PolicyScope,
    pub group_id: Option<i64>,
    pub device_id: Option<Uuid>,
    pub config: PolicyConfig,
    #[serde(default)]
    pub created_by: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdatePolicyRequest {
    pub config: PolicyConfig,
}

pub async fn list(State(state): State<AppState>) -> AppResult<Json<Vec<PolicyRow>>> {
    Ok(Json(PolicyStore::new(state.db.clone()).list().await?))
}

pub async fn create(
    State(state): State<AppState>,
    Json(payload): Json<CreatePolicyRequest>,
) -> AppResult<(StatusCode, Json<PolicyRow>)> {
    let created = PolicyStore::new(state.db.clone())
        .create(
            payload.scope,
            payload.group_id,
            payload.device_id,
            &payload.config,
            &payload.created_by,
        )
        .await?;

    AuditStore::new(state.db.clone())
        .record(
            "admin",
            "create_policy",
            "policy",
            &created.policy_id.to_string(),
            json!({ "scope": created.scope.as_str(), "version": created.version }),
        )
        .await;

    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn update(
    State(state): State<AppState>,
    Path(policy_id): Path<i64>,
    Json(payload): Json<UpdatePolicyRequest>,
) -> AppResult<Json<PolicyRow>> {
    let updated = PolicyStore::new(state.db.clone())
        .update(policy_id, &payload.config)
        .await?;

    AuditStore::new(state.db.clone())
        .record(
            "admin",
            "update_policy",
            "policy",
            &policy_id.to_string(),
            json!({ "version": updated.version }),
        )
        .await;

    Ok(Json(updated))
}

pub async fn delete(
    State(state): State<AppState>,
    Path(policy_id): Path<i64>,
) -> AppResult<StatusCode> {
    PolicyStore::new(state.db.clone()).delete(policy_id).await?;

    AuditStore::new(state.db.clone())
        .record(
            "admin",
            "delete_policy",
            "policy",
            &policy_id.to_string(),
            json!({}),
        )
        .await;

    Ok(StatusCode::NO_CONTENT)
}
