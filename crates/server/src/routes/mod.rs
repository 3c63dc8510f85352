pub mod commands;
pub mod commands_admin;
pub mod devices;
pub mod health;
pub mod inventory;
pub mod policies_admin;
pub mod policy;
pub mod register;

use axum::middleware::from_fn_with_state;
use axum::routing::{get, post, put};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::auth;
use crate::rate_limit;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    let agent_routes = Router::new()
        .route("/v1/agents/{id}/inventory", post(inventory::ingest))
        .route("/v1/agents/{id}/policy", get(policy::get_policy))
        .route("/v1/agents/{id}/commands", get(commands::poll))
        .route("/v1/agents/{id}/commands/{cmd_id}/ack", post(commands::ack))
        .layer(from_fn_with_state(
            state.clone(),
            auth::device::require_device,
        ));

    let admin_routes = Router::new()
        .route("/v1/devices", get(devices::list))
        .route("/v1/devices/stats", get(devices::stats))
        .route("/v1/devices/{id}", get(devices::get))
        .route("/v1/devices/{id}/telemetry", get(devices::telemetry))
        .route("/v1/policies", get(policies_admin::list).post(policies_admin::create))
        .route(
            "/v1/policies/{policy_id}",
            put(policies_admin::update).delete(policies_admin::delete),
        )
        .route(
            "/v1/commands",
            get(commands_admin::list).post(commands_admin::create),
        )
        .layer(from_fn_with_state(state.clone(), auth::admin::require_admin));

    Router::new()
        .route("/health", get(health::health))
        .route("/metrics", get(health::metrics))
        .route("/v1/agents/register", post(register::register))
        .merge(agent_routes)
        .merge(admin_routes)
        .layer(from_fn_with_state(state.clone(), rate_limit::limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
