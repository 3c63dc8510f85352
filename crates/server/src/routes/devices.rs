use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state::AppState;
use crate::stores::command::CommandStore;
use crate::stores::device::{
    status_from_db, DeviceFilter, DeviceRecord, DeviceStatusCounts, DeviceStore,
};
use crate::stores::telemetry::{TelemetryRow, TelemetryStore};
use fleet_common::error::{AppError, AppResult};

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    status: Option<String>,
    hostname: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct DeviceListResponse {
    pub devices: Vec<DeviceRecord>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> AppResult<Json<DeviceListResponse>> {
    let status = query
        .status
        .as_deref()
        .map(status_from_db)
        .transpose()
        .map_err(|_| AppError::InvalidInput("invalid status filter".to_string()))?;

    let filter = DeviceFilter {
        status,
        hostname: query.hostname,
        limit: query.limit.unwrap_or(50),
        offset: query.offset.unwrap_or(0),
    };
    let (devices, total) = DeviceStore::new(state.db.clone()).list(&filter).await?;

    Ok(Json(DeviceListResponse {
        devices,
        total,
        limit: filter.limit.clamp(1, 1000),
        offset: filter.offset.max(0),
    }))
}

#[derive(Debug, Serialize)]
pub struct FleetStatsResponse {
    #[serde(flatten)]
    pub devices: DeviceStatusCounts,
    pub recent_telemetry: i64,
    pub pending_commands: i64,
}

pub async fn stats(State(state): State<AppState>) -> AppResult<Json<FleetStatsResponse>> {
    let devices = DeviceStore::new(state.db.clone()).status_counts().await?;
    let recent_telemetry = TelemetryStore::new(state.db.clone())
        .count_recent(chrono::Duration::hours(24))
        .await?;
    let pending_commands = CommandStore::new(state.db.clone())
        .count_deliverable()
        .await?;

    Ok(Json(FleetStatsResponse {
        devices,
        recent_telemetry,
        pending_commands,
    }))
}

pub async fn get(
    State(state): State<AppState>,
    Path(device_id): Path<Uuid>,
) -> AppResult<Json<DeviceRecord>> {
    DeviceStore::new(state.db.clone())
        .get(device_id)
        .await?
        .map(Json)
        .ok_or(AppError::NotFound)
}

#[derive(Debug, Deserialize)]
pub struct TelemetryQuery {
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct DeviceTelemetryResponse {
    pub latest: Option<TelemetryRow>,
    pub history: Vec<TelemetryRow>,
}

pub async fn telemetry(
    State(state): State<AppState>,
    Path(device_id): Path<Uuid>,
    Query(query): Query<TelemetryQuery>,
) -> AppResult<Json<DeviceTelemetryResponse>> {
    let devices = DeviceStore::new(state.db.clone());
    if devices.get(device_id).await?.is_none() {
        return Err(AppError::NotFound);
    }

    let store = TelemetryStore::new(state.db.clone());
    let latest = store.latest_for(device_id).await?;
    let history = store
        .history_for(device_id, query.from, query.to, query.limit.unwrap_or(100))
        .await?;

    Ok(Json(DeviceTelemetryResponse { latest, history }))
}
