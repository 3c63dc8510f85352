use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use fleet_common::error::{AppError, AppResult};
use fleet_common::types::PolicyConfig;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PolicyScope {
    Global,
    Group,
    Device,
}

impl PolicyScope {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Group => "group",
            Self::Device => "device",
        }
    }

    pub fn from_db(raw: &str) -> AppResult<Self> {
        match raw {
            "global" => Ok(Self::Global),
            "group" => Ok(Self::Group),
            "device" => Ok(Self::Device),
            _ => Err(AppError::External(format!("invalid policy scope: {raw}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PolicyRow {
    pub policy_id: i64,
    pub scope: PolicyScope,
    pub group_id: Option<i64>,
    pub device_id: Option<Uuid>,
    pub version: i32,
    pub config: PolicyConfig,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Scope-field pairing plus config bounds, checked before any write.
pub fn validate_policy(
    scope: PolicyScope,
    group_id: Option<i64>,
    device_id: Option<Uuid>,
    config: &PolicyConfig,
) -> AppResult<()> {
    match scope {
        PolicyScope::Global if group_id.is_some() || device_id.is_some() => Err(
            AppError::InvalidInput("global policies take no scoping field".to_string()),
        ),
        PolicyScope::Group if group_id.is_none() => Err(AppError::InvalidInput(
            "group_id required for group scope".to_string(),
        )),
        PolicyScope::Group if device_id.is_some() => Err(AppError::InvalidInput(
            "device_id not allowed for group scope".to_string(),
        )),
        PolicyScope::Device if device_id.is_none() => Err(AppError::InvalidInput(
            "device_id required for device scope".to_string(),
        )),
        PolicyScope::Device if group_id.is_some() => Err(AppError::InvalidInput(
            "group_id not allowed for device scope".to_string(),
        )),
        _ => config.validate().map_err(AppError::InvalidInput),
    }
}

#[derive(Clone)]
pub struct PolicyStore {
    pool: PgPool,
}

impl PolicyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Every policy that could apply to the device; the resolver picks the
    /// effective one.
    pub async fn candidates_for(
        &self,
        device_id: Uuid,
        group_id: Option<i64>,
    ) -> AppResult<Vec<PolicyRow>> {
        let rows = sqlx::query(
            "SELECT policy_id, scope, group_id, device_id, version, config, created_by, \
                    created_at, updated_at \
             FROM policies \
             WHERE scope = 'global' \
                OR (scope = 'group' AND group_id = $1) \
                OR (scope = 'device' AND device_id = $2)",
        )
        .bind(group_id)
        .bind(device_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::External(format!("failed to query policies: {e}")))?;

        rows.into_iter().map(row_to_policy).collect()
    }

    pub async fn list(&self) -> AppResult<Vec<PolicyRow>> {
        let rows = sqlx::query(
            "SELECT policy_id, scope, group_id, device_id, version, config, created_by, \
                    created_at, updated_at \
             FROM policies ORDER BY policy_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::External(format!("failed to list policies: {e}")))?;

        rows.into_iter().map(row_to_policy).collect()
    }

    pub async fn create(
        &self,
        scope: PolicyScope,
        group_id: Option<i64>,
        device_id: Option<Uuid>,
        config: &PolicyConfig,
        created_by: &str,
    ) -> AppResult<PolicyRow> {
        validate_policy(scope, group_id, device_id, config)?;
        let config_json = serde_json::to_value(config).map_err(|_| AppError::Internal)?;

        let row = sqlx::query(
            "INSERT INTO policies (scope, group_id, device_id, version, config, created_by) \
             VALUES ($1, $2, $3, 1, $4, $5) \
             RETURNING policy_id, scope, group_id, device_id, version, config, created_by, \
                       created_at, updated_at",
        )
        .bind(scope.as_str())
        .bind(group_id)
        .bind(device_id)
        .bind(&config_json)
        .bind(created_by)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::External(format!("failed to create policy: {e}")))?;

        row_to_policy(row)
    }

    /// Replace the config, bumping the monotonic version.
    pub async fn update(&self, policy_id: i64, config: &PolicyConfig) -> AppResult<PolicyRow> {
        config.validate().map_err(AppError::InvalidInput)?;
        let config_json = serde_json::to_value(config).map_err(|_| AppError::Internal)?;

        let row = sqlx::query(
            "UPDATE policies \
             SET config = $1, version = version + 1, updated_at = now() \
             WHERE policy_id = $2 \
             RETURNING policy_id, scope, group_id, device_id, version, config, created_by, \
                       created_at, updated_at",
        )
        .bind(&config_json)
        .bind(policy_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::External(format!("failed to update policy: {e}")))?
        .ok_or(AppError::NotFound)?;

        row_to_policy(row)
    }

    pub async fn delete(&self, policy_id: i64) -> AppResult<()> {
        let result = sqlx::query("DELETE FROM policies WHERE policy_id = $1")
            .bind(policy_id)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::External(format!("failed to delete policy: {e}")))?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound);
        }
        Ok(())
    }
}

fn row_to_policy(row: sqlx::postgres::PgRow) -> AppResult<PolicyRow> {
    let scope_text: String = row
        .try_get("scope")
        .map_err(|e| AppError::External(format!("read scope failed: {e}")))?;
    let config: serde_json::Value = row
        .try_get("config")
        .map_err(|e| AppError::External(format!("read config failed: {e}")))?;

    Ok(PolicyRow {
        policy_id: row
            .try_get("policy_id")
            .map_err(|e| AppError::External(format!("read policy_id failed: {e}")))?,
        scope: PolicyScope::from_db(&scope_text)?,
        group_id: row
            .try_get("group_id")
            .map_err(|e| AppError::External(format!("read group_id failed: {e}")))?,
        device_id: row
            .try_get("device_id")
            .map_err(|e| AppError::External(format!("read device_id failed: {e}")))?,
        version: row
            .try_get("version")
            .map_err(|e| AppError::External(format!("read version failed: {e}")))?,
        config: serde_json::from_value(config)
            .map_err(|e| AppError::External(format!("invalid policy config: {e}")))?,
        created_by: row
            .try_get("created_by")
            .map_err(|e| AppError::External(format!("read created_by failed: {e}")))?,
        created_at: row
            .try_get("created_at")
            .map_err(|e| AppError::External(format!("read created_at failed: {e}")))?,
        updated_at: row
            .try_get("updated_at")
            .map_err(|e| AppError::External(format!("read updated_at failed: {e}")))?,
    })
}
