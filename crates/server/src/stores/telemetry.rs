use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use fleet_common::error::{AppError, AppResult};
use fleet_common::types::TelemetryRecord;

#[derive(Debug, Clone, Serialize)]
pub struct TelemetryRow {
    pub device_id: Uuid,
    pub collected_at: DateTime<Utc>,
    pub seq: i64,
    pub agent_version: String,
    pub metrics: serde_json::Value,
    pub tags: Option<serde_json::Value>,
    pub ingestion_id: Uuid,
    pub server_received_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct TelemetryStore {
    pool: PgPool,
}

impl TelemetryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Materialize one record: append to history and refresh the latest
    /// snapshot in a single transaction.
    ///
    /// Both statements are idempotent under log redelivery: the history
    /// insert is absorbed by the `(device_id, collected_at, seq)` key, and
    /// the latest upsert only moves forward in `(collected_at, seq)` order
    /// so reordered redelivery never regresses the snapshot.
    pub async fn write_record(&self, record: &TelemetryRecord) -> AppResult<()> {
        let metrics = serde_json::Value::Object(record.envelope.metrics.clone());
        let tags = record
            .envelope
            .tags
            .as_ref()
            .map(|t| serde_json::to_value(t).unwrap_or_default());

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::External(format!("begin failed: {e}")))?;

        sqlx::query(
            "INSERT INTO telemetry \
                 (device_id, collected_at, seq, agent_version, metrics, tags, ingestion_id, server_received_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (device_id, collected_at, seq) DO NOTHING",
        )
        .bind(record.envelope.device_id)
        .bind(record.envelope.collected_at)
        .bind(record.envelope.seq)
        .bind(&record.envelope.agent_version)
        .bind(&metrics)
        .bind(&tags)
        .bind(record.ingestion_id)
        .bind(record.server_received_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| AppError::External(format!("history insert failed: {e}")))?;

        sqlx::query(
            "INSERT INTO telemetry_latest \
                 (device_id, collected_at, seq, agent_version, metrics, tags, ingestion_id, server_received_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, now()) \
             ON CONFLICT (device_id) DO UPDATE SET \
                 collected_at = EXCLUDED.collected_at, \
                 seq = EXCLUDED.seq, \
                 agent_version = EXCLUDED.agent_version, \
                 metrics = EXCLUDED.metrics, \
                 tags = EXCLUDED.tags, \
                 ingestion_id = EXCLUDED.ingestion_id, \
                 server_received_at = now() \
             WHERE telemetry_latest.collected_at < EXCLUDED.collected_at \
                OR (telemetry_latest.collected_at = EXCLUDED.collected_at \
                    AND telemetry_latest.seq <= EXCLUDED.seq)",
        )
        .bind(record.envelope.device_id)
        .bind(record.envelope.collected_at)
        .bind(record.envelope.seq)
        .bind(&record.envelope.agent_version)
        .bind(&metrics)
        .bind(&tags)
        .bind(record.ingestion_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| AppError::External(format!("latest upsert failed: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| AppError::External(format!("commit failed: {e}")))?;
        Ok(())
    }

    /// History rows received in the trailing window, fleet-wide.
    pub async fn count_recent(&self, window: chrono::Duration) -> AppResult<i64> {
        let since = Utc::now() - window;
        sqlx::query_scalar("SELECT COUNT(*) FROM telemetry WHERE collected_at >= $1")
            .bind(since)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| AppError::External(format!("failed to count telemetry: {e}")))
    }

    pub async fn latest_for(&self, device_id: Uuid) -> AppResult<Option<TelemetryRow>> {
        let row = sqlx::query(
            "SELECT device_id, collected_at, seq, agent_version, metrics, tags, \
                    ingestion_id, server_received_at \
             FROM telemetry_latest WHERE device_id = $1",
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::External(format!("failed to fetch latest: {e}")))?;

        row.map(row_to_telemetry).transpose()
    }

    pub async fn history_for(
        &self,
        device_id: Uuid,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        limit: i64,
    ) -> AppResult<Vec<TelemetryRow>> {
        let rows = sqlx::query(
            "SELECT device_id, collected_at, seq, agent_version, metrics, tags, \
                    ingestion_id, server_received_at \
             FROM telemetry \
             WHERE device_id = $1 \
               AND ($2::timestamptz IS NULL OR collected_at >= $2) \
               AND ($3::timestamptz IS NULL OR collected_at <= $3) \
             ORDER BY collected_at DESC LIMIT $4",
        )
        .bind(device_id)
        .bind(from)
        .bind(to)
        .bind(limit.clamp(1, 1000))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::External(format!("failed to fetch history: {e}")))?;

        rows.into_iter().map(row_to_telemetry).collect()
    }
}

fn row_to_telemetry(row: sqlx::postgres::PgRow) -> AppResult<TelemetryRow> {
    Ok(TelemetryRow {
        device_id: row
            .try_get("device_id")
            .map_err(|e| AppError::External(format!("read device_id failed: {e}")))?,
        collected_at: row
            .try_get("collected_at")
            .map_err(|e| AppError::External(format!("read collected_at failed: {e}")))?,
        seq: row
            .try_get("seq")
            .map_err(|e| AppError::External(format!("read seq failed: {e}")))?,
        agent_version: row
            .try_get("agent_version")
            .map_err(|e| AppError::External(format!("read agent_version failed: {e}")))?,
        metrics: row
            .try_get("metrics")
            .map_err(|e| AppError::External(format!("read metrics failed: {e}")))?,
        tags: row
            .try_get("tags")
            .map_err(|e| AppError::External(format!("read tags failed: {e}")))?,
        ingestion_id: row
            .try_get("ingestion_id")
            .map_err(|e| AppError::External(format!("read ingestion_id failed: {e}")))?,
        server_received_at: row
            .try_get("server_received_at")
            .map_err(|e| AppError::External(format!("read server_received_at failed: {e}")))?,
    })
}
