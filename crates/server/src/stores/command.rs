use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use fleet_common::api::CommandAck;
use fleet_common::error::{AppError, AppResult};
use fleet_common::types::{CommandStatus, COMMAND_MAX_TTL_SECONDS};

#[derive(Debug, Clone, Serialize)]
pub struct CommandRecord {
    pub command_id: Uuid,
    pub device_id: Uuid,
    #[serde(rename = "type")]
    pub command_type: String,
    pub parameters: Value,
    pub issued_at: DateTime<Utc>,
    pub ttl_seconds: i64,
    pub status: CommandStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct CommandFilter {
    pub device_id: Option<Uuid>,
    pub status: Option<CommandStatus>,
    pub limit: i64,
}

#[derive(Clone)]
pub struct CommandStore {
    pool: PgPool,
}

impl CommandStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        device_id: Uuid,
        command_type: &str,
        parameters: Value,
        ttl_seconds: i64,
    ) -> AppResult<CommandRecord> {
        if ttl_seconds <= 0 || ttl_seconds > COMMAND_MAX_TTL_SECONDS {
            return Err(AppError::InvalidInput(format!(
                "ttl_seconds must be within (0, {COMMAND_MAX_TTL_SECONDS}]"
            )));
        }
        if command_type.is_empty() {
            return Err(AppError::InvalidInput("type is required".to_string()));
        }

        let row = sqlx::query(
            "INSERT INTO commands (command_id, device_id, command_type, parameters, ttl_seconds) \
             VALUES ($1, $2, $3, $4, $5) \
             RETURNING command_id, device_id, command_type, parameters, issued_at, ttl_seconds, \
                       status, result, completed_at",
        )
        .bind(Uuid::new_v4())
        .bind(device_id)
        .bind(command_type)
        .bind(&parameters)
        .bind(ttl_seconds)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::External(format!("failed to create command: {e}")))?;

        row_to_command(row)
    }

    /// Claim up to `limit` deliverable commands for a device, atomically
    /// transitioning them to `executing`. Each command is returned by
    /// exactly one poll.
    pub async fn claim_pending(&self, device_id: Uuid, limit: i64) -> AppResult<Vec<CommandRecord>> {
        let rows = sqlx::query(
            "UPDATE commands SET status = 'executing' \
             WHERE command_id IN ( \
                 SELECT command_id FROM commands \
                 WHERE device_id = $1 \
                   AND status = 'pending' \
                   AND issued_at + make_interval(secs => ttl_seconds::double precision) > now() \
                 ORDER BY issued_at ASC \
                 LIMIT $2 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING command_id, device_id, command_type, parameters, issued_at, ttl_seconds, \
                       status, result, completed_at",
        )
        .bind(device_id)
        .bind(limit.clamp(1, 100))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::External(format!("failed to claim commands: {e}")))?;

        rows.into_iter().map(row_to_command).collect()
    }

    /// Apply an acknowledgement. The first terminal status wins: a repeat
    /// ack (or an ack racing the expirer) is a no-op.
    pub async fn ack(
        &self,
        command_id: Uuid,
        device_id: Uuid,
        ack: &CommandAck,
    ) -> AppResult<CommandStatus> {
        let (status, result) = match &ack.error {
            Some(error) => (
                CommandStatus::Failed,
                serde_json::json!({ "error": error }),
            ),
            None => (
                CommandStatus::Completed,
                ack.result.clone().unwrap_or(Value::Null),
            ),
        };

        let updated = sqlx::query(
            "UPDATE commands \
             SET status = $1, result = $2, completed_at = now() \
             WHERE command_id = $3 AND device_id = $4 AND status = 'executing'",
        )
        .bind(status_to_db(status))
        .bind(&result)
        .bind(command_id)
        .bind(device_id)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::External(format!("failed to ack command: {e}")))?;

        if updated.rows_affected() > 0 {
            return Ok(status);
        }

        // No transition happened: idempotent repeat, expired, or unknown.
        let current = self.get(command_id).await?.ok_or(AppError::NotFound)?;
        if current.device_id != device_id {
            return Err(AppError::NotFound);
        }
        if current.status.is_terminal() {
            return Ok(current.status);
        }
        Err(AppError::Conflict(format!(
            "command is {}",
            status_to_db(current.status)
        )))
    }

    pub async fn get(&self, command_id: Uuid) -> AppResult<Option<CommandRecord>> {
        let row = sqlx::query(
            "SELECT command_id, device_id, command_type, parameters, issued_at, ttl_seconds, \
                    status, result, completed_at \
             FROM commands WHERE command_id = $1",
        )
        .bind(command_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::External(format!("failed to fetch command: {e}")))?;

        row.map(row_to_command).transpose()
    }

    pub async fn list(&self, filter: &CommandFilter) -> AppResult<Vec<CommandRecord>> {
        let rows = sqlx::query(
            "SELECT command_id, device_id, command_type, parameters, issued_at, ttl_seconds, \
                    status, result, completed_at \
             FROM commands \
             WHERE ($1::uuid IS NULL OR device_id = $1) \
               AND ($2::text IS NULL OR status = $2) \
             ORDER BY issued_at DESC LIMIT $3",
        )
        .bind(filter.device_id)
        .bind(filter.status.map(status_to_db))
        .bind(filter.limit.clamp(1, 1000))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::External(format!("failed to list commands: {e}")))?;

        rows.into_iter().map(row_to_command).collect()
    }

    /// Pending commands that are still inside their ttl, fleet-wide.
    pub async fn count_deliverable(&self) -> AppResult<i64> {
        sqlx::query_scalar(
            "SELECT COUNT(*) FROM commands \
             WHERE status = 'pending' \
               AND issued_at + make_interval(secs => ttl_seconds::double precision) > now()",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::External(format!("failed to count commands: {e}")))
    }

    /// Bulk conditional transition run by the expirer.
    pub async fn expire_pending(&self) -> AppResult<u64> {
        let result = sqlx::query(
            "UPDATE commands SET status = 'expired', completed_at = now() \
             WHERE status = 'pending' \
               AND issued_at + make_interval(secs => ttl_seconds::double precision) < now()",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::External(format!("failed to expire commands: {e}")))?;
        Ok(result.rows_affected())
    }
}

fn row_to_command(row: sqlx::postgres::PgRow) -> AppResult<CommandRecord> {
    let status_text: String = row
        .try_get("status")
        .map_err(|e| AppError::External(format!("read status failed: {e}")))?;

    Ok(CommandRecord {
        command_id: row
            .try_get("command_id")
            .map_err(|e| AppError::External(format!("read command_id failed: {e}")))?,
        device_id: row
            .try_get("device_id")
            .map_err(|e| AppError::External(format!("read device_id failed: {e}")))?,
        command_type: row
            .try_get("command_type")
            .map_err(|e| AppError::External(format!("read command_type failed: {e}")))?,
        parameters: row
            .try_get("parameters")
            .map_err(|e| AppError::External(format!("read parameters failed: {e}")))?,
        issued_at: row
            .try_get("issued_at")
            .map_err(|e| AppError::External(format!("read issued_at failed: {e}")))?,
        ttl_seconds: row
            .try_get("ttl_seconds")
            .map_err(|e| AppError::External(format!("read ttl_seconds failed: {e}")))?,
        status: status_from_db(&status_text)?,
        result: row
            .try_get("result")
            .map_err(|e| AppError::External(format!("read result failed: {e}")))?,
        completed_at: row
            .try_get("completed_at")
            .map_err(|e| AppError::External(format!("read completed_at failed: {e}")))?,
    })
}

pub fn status_to_db(status: CommandStatus) -> &'static str {
    match status {
        CommandStatus::Pending => "pending",
        CommandStatus::Executing => "executing",
        CommandStatus::Completed => "completed",
        CommandStatus::Failed => "failed",
        CommandStatus::Expired => "expired",
    }
}

pub fn status_from_db(raw: &str) -> AppResult<CommandStatus> {
    match raw {
        "pending" => Ok(CommandStatus::Pending),
        "executing" => Ok(CommandStatus::Executing),
        "completed" => Ok(CommandStatus::Completed),
        "failed" => Ok(CommandStatus::Failed),
        "expired" => Ok(CommandStatus::Expired),
        _ => Err(AppError::External(format!("invalid command status: {raw}"))),
    }
}
