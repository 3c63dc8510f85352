use axum::extract::State;
use axum::http::header::{ETAG, IF_NONE_MATCH};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use tracing::debug;

use crate::auth::device::AuthedDevice;
use crate::resolver;
use crate::state::AppState;
use crate::stores::policy::PolicyStore;
use fleet_common::error::AppResult;

/// Serve the device's effective policy with conditional-request semantics.
pub async fn get_policy(
    State(state): State<AppState>,
    Extension(device): Extension<AuthedDevice>,
    headers: HeaderMap,
) -> AppResult<Response> {
    let candidates = PolicyStore::new(state.db.clone())
        .candidates_for(device.device_id, device.group_id)
        .await?;
    let (effective, etag) = resolver::effective_policy(
        &candidates,
        device.device_id,
        device.group_id,
        &device.capabilities,
    );

    if let Some(if_none_match) = headers.get(IF_NONE_MATCH).and_then(|v| v.to_str().ok()) {
        if if_none_match == etag {
            debug!(device_id = %device.device_id, "policy unchanged");
            return Ok(StatusCode::NOT_MODIFIED.into_response());
        }
    }

    debug!(
        device_id = %device.device_id,
        version = effective.version,
        "serving effective policy"
    );
    let mut response = Json(effective).into_response();
    response
        .headers_mut()
        .insert(ETAG, etag.parse().expect("etag is a valid header value"));
    Ok(response)
}
