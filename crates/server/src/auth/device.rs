use std::collections::HashMap;

use axum::extract::{Path, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use uuid::Uuid;

use crate::auth::token::verify_token;
use crate::state::AppState;
use crate::stores::device::DeviceStore;
use fleet_common::error::AppError;
use fleet_common::http::extract_bearer;
use fleet_common::types::{Capability, DeviceStatus};

/// Identity resolved by the device auth middleware, available to handlers
/// as a request extension.
#[derive(Debug, Clone)]
pub struct AuthedDevice {
    pub device_id: Uuid,
    pub group_id: Option<i64>,
    pub capabilities: Vec<Capability>,
}

/// Bearer-token check for `/v1/agents/{id}/...` routes: the token must
/// verify against the stored hash of the device named in the path and the
/// device must be active.
pub async fn require_device(
    State(state): State<AppState>,
    Path(params): Path<HashMap<String, String>>,
    mut request: axum::extract::Request,
    next: Next,
) -> Result<Response, AppError> {
    let device_id = params
        .get("id")
        .ok_or_else(|| AppError::InvalidInput("device id required".to_string()))
        .and_then(|raw| {
            Uuid::parse_str(raw).map_err(|_| AppError::InvalidInput("invalid device id".to_string()))
        })?;

    let token = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(extract_bearer)
        .filter(|t| !t.is_empty())
        .ok_or(AppError::Unauthorized)?
        .to_string();

    let store = DeviceStore::new(state.db.clone());
    let auth = store
        .auth_info(device_id)
        .await?
        .ok_or(AppError::Unauthorized)?;

    if !verify_token(&auth.auth_token_hash, &token)? {
        return Err(AppError::Unauthorized);
    }
    if auth.status != DeviceStatus::Active {
        return Err(AppError::Forbidden);
    }

    request.extensions_mut().insert(AuthedDevice {
        device_id,
        group_id: auth.group_id,
        capabilities: auth.capabilities,
    });
    Ok(next.run(request).await)
}
