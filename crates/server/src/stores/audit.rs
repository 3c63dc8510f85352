use serde_json::Value;
use sqlx::PgPool;
use tracing::warn;

use fleet_common::error::{AppError, AppResult};

/// Append-only trail of identity and command events. Writes are best-effort
/// from callers' perspective: use [`AuditStore::record`] where a failed
/// audit write must not fail the request.
#[derive(Clone)]
pub struct AuditStore {
    pool: PgPool,
}

impl AuditStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn append(
        &self,
        actor: &str,
        action: &str,
        resource_type: &str,
        resource_id: &str,
        details: Value,
    ) -> AppResult<()> {
        sqlx::query(
            "INSERT INTO audit_log (actor, action, resource_type, resource_id, details) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(actor)
        .bind(action)
        .bind(resource_type)
        .bind(resource_id)
        .bind(&details)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::External(format!("failed to append audit record: {e}")))?;
        Ok(())
    }

    pub async fn record(
        &self,
        actor: &str,
        action: &str,
        resource_type: &str,
        resource_id: &str,
        details: Value,
    ) {
        if let Err(e) = self
            .append(actor, action, resource_type, resource_id, details)
            .await
        {
            warn!(action, resource_id, error = %e, "audit write failed");
        }
    }
}
