use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use fleet_common::error::{AppError, AppResult};
use fleet_common::types::{Capability, DeviceStatus};

#[derive(Debug, Clone, Serialize)]
pub struct DeviceRecord {
    pub device_id: Uuid,
    pub hostname: String,
    pub agent_version: String,
    pub capabilities: Vec<Capability>,
    pub group_id: Option<i64>,
    pub status: DeviceStatus,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// Device fields needed by the auth middleware; the token hash never leaves
/// this struct.
#[derive(Debug, Clone)]
pub struct DeviceAuthInfo {
    pub status: DeviceStatus,
    pub group_id: Option<i64>,
    pub capabilities: Vec<Capability>,
    pub auth_token_hash: String,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct DeviceStatusCounts {
    pub total: i64,
    pub active: i64,
    pub inactive: i64,
    pub offline: i64,
}

#[derive(Debug, Default)]
pub struct DeviceFilter {
    pub status: Option<DeviceStatus>,
    pub hostname: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Clone)]
pub struct DeviceStore {
    pool: PgPool,
}

impl DeviceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, device_id: Uuid) -> AppResult<Option<DeviceRecord>> {
        let row = sqlx::query(
            "SELECT device_id, hostname, agent_version, capabilities, group_id, status, \
                    first_seen_at, last_seen_at \
             FROM devices WHERE device_id = $1",
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::External(format!("failed to fetch device: {e}")))?;

        row.map(row_to_device).transpose()
    }

    pub async fn auth_info(&self, device_id: Uuid) -> AppResult<Option<DeviceAuthInfo>> {
        let row = sqlx::query(
            "SELECT status, group_id, capabilities, auth_token_hash \
             FROM devices WHERE device_id = $1",
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::External(format!("failed to fetch device auth: {e}")))?;

        row.map(|r| {
            let status_text: String = r
                .try_get("status")
                .map_err(|e| AppError::External(format!("read status failed: {e}")))?;
            let capabilities: serde_json::Value = r
                .try_get("capabilities")
                .map_err(|e| AppError::External(format!("read capabilities failed: {e}")))?;
            Ok(DeviceAuthInfo {
                status: status_from_db(&status_text)?,
                group_id: r
                    .try_get("group_id")
                    .map_err(|e| AppError::External(format!("read group_id failed: {e}")))?,
                capabilities: serde_json::from_value(capabilities)
                    .map_err(|e| AppError::External(format!("invalid capabilities: {e}")))?,
                auth_token_hash: r
                    .try_get("auth_token_hash")
                    .map_err(|e| AppError::External(format!("read token hash failed: {e}")))?,
            })
        })
        .transpose()
    }

    /// Create the device on first registration or refresh identity fields and
    /// rotate the token hash on re-registration. Returns whether the device
    /// was newly created.
    pub async fn upsert_registration(
        &self,
        device_id: Uuid,
        hostname: &str,
        capabilities: &[Capability],
        agent_version: &str,
        auth_token_hash: &str,
    ) -> AppResult<bool> {
        let capabilities = serde_json::to_value(capabilities).map_err(|_| AppError::Internal)?;
        let result = sqlx::query(
            "INSERT INTO devices \
                 (device_id, hostname, capabilities, agent_version, auth_token_hash, status) \
             VALUES ($1, $2, $3, $4, $5, 'active') \
             ON CONFLICT (device_id) DO UPDATE SET \
                 hostname = EXCLUDED.hostname, \
                 capabilities = EXCLUDED.capabilities, \
                 agent_version = EXCLUDED.agent_version, \
                 auth_token_hash = EXCLUDED.auth_token_hash, \
                 status = 'active', \
                 last_seen_at = now() \
             RETURNING (first_seen_at = last_seen_at) AS created",
        )
        .bind(device_id)
        .bind(hostname)
        .bind(&capabilities)
        .bind(agent_version)
        .bind(auth_token_hash)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::External(format!("failed to upsert device: {e}")))?;

        result
            .try_get("created")
            .map_err(|e| AppError::External(format!("read created failed: {e}")))
    }

    /// Liveness update on the ingest path; failures are the caller's to
    /// tolerate.
    pub async fn touch_last_seen(&self, device_id: Uuid) -> AppResult<()> {
        sqlx::query("UPDATE devices SET last_seen_at = now() WHERE device_id = $1")
            .bind(device_id)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::External(format!("failed to update last_seen: {e}")))?;
        Ok(())
    }

    /// Fleet-wide status breakdown for the admin dashboard.
    pub async fn status_counts(&self) -> AppResult<DeviceStatusCounts> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total, \
                    COUNT(*) FILTER (WHERE status = 'active') AS active, \
                    COUNT(*) FILTER (WHERE status = 'inactive') AS inactive, \
                    COUNT(*) FILTER (WHERE status = 'offline') AS offline \
             FROM devices",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::External(format!("failed to count devices: {e}")))?;

        Ok(DeviceStatusCounts {
            total: row
                .try_get("total")
                .map_err(|e| AppError::External(format!("read total failed: {e}")))?,
            active: row
                .try_get("active")
                .map_err(|e| AppError::External(format!("read active failed: {e}")))?,
            inactive: row
                .try_get("inactive")
                .map_err(|e| AppError::External(format!("read inactive failed: {e}")))?,
            offline: row
                .try_get("offline")
                .map_err(|e| AppError::External(format!("read offline failed: {e}")))?,
        })
    }

    pub async fn list(&self, filter: &DeviceFilter) -> AppResult<(Vec<DeviceRecord>, i64)> {
        let limit = filter.limit.clamp(1, 1000);
        let offset = filter.offset.max(0);
        let status = filter.status.map(status_to_db);
        let hostname = filter.hostname.as_ref().map(|h| format!("%{h}%"));

        let rows = sqlx::query(
            "SELECT device_id, hostname, agent_version, capabilities, group_id, status, \
                    first_seen_at, last_seen_at \
             FROM devices \
             WHERE ($1::text IS NULL OR status = $1) \
               AND ($2::text IS NULL OR hostname ILIKE $2) \
             ORDER BY last_seen_at DESC LIMIT $3 OFFSET $4",
        )
        .bind(status)
        .bind(&hostname)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::External(format!("failed to list devices: {e}")))?;

        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM devices \
             WHERE ($1::text IS NULL OR status = $1) \
               AND ($2::text IS NULL OR hostname ILIKE $2)",
        )
        .bind(status)
        .bind(&hostname)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::External(format!("failed to count devices: {e}")))?;

        let devices = rows
            .into_iter()
            .map(row_to_device)
            .collect::<AppResult<Vec<_>>>()?;
        Ok((devices, total))
    }
}

fn row_to_device(row: sqlx::postgres::PgRow) -> AppResult<DeviceRecord> {
    let status_text: String = row
        .try_get("status")
        .map_err(|e| AppError::External(format!("read status failed: {e}")))?;
    let capabilities: serde_json::Value = row
        .try_get("capabilities")
        .map_err(|e| AppError::External(format!("read capabilities failed: {e}")))?;

    Ok(DeviceRecord {
        device_id: row
            .try_get("device_id")
            .map_err(|e| AppError::External(format!("read device_id failed: {e}")))?,
        hostname: row
            .try_get("hostname")
            .map_err(|e| AppError::External(format!("read hostname failed: {e}")))?,
        agent_version: row
            .try_get("agent_version")
            .map_err(|e| AppError::External(format!("read agent_version failed: {e}")))?,
        capabilities: serde_json::from_value(capabilities)
            .map_err(|e| AppError::External(format!("invalid capabilities: {e}")))?,
        group_id: row
            .try_get("group_id")
            .map_err(|e| AppError::External(format!("read group_id failed: {e}")))?,
        status: status_from_db(&status_text)?,
        first_seen_at: row
            .try_get("first_seen_at")
            .map_err(|e| AppError::External(format!("read first_seen_at failed: {e}")))?,
        last_seen_at: row
            .try_get("last_seen_at")
            .map_err(|e| AppError::External(format!("read last_seen_at failed: {e}")))?,
    })
}

pub fn status_to_db(status: DeviceStatus) -> &'static str {
    match status {
        DeviceStatus::Active => "active",
        DeviceStatus::Inactive => "inactive",
        DeviceStatus::Offline => "offline",
    }
}

pub fn status_from_db(raw: &str) -> AppResult<DeviceStatus> {
    match raw {
        "active" => Ok(DeviceStatus::Active),
        "inactive" => Ok(DeviceStatus::Inactive),
        "offline" => Ok(DeviceStatus::Offline),
        _ => Err(AppError::External(format!("invalid device status: {raw}"))),
    }
}
