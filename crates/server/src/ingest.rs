//! Durable log plumbing: JetStream connection, stream provisioning and the
//! publish side of the ingest path.

use async_nats::jetstream::{self, stream::Config as StreamConfig, stream::StorageType};
use tracing::info;

use fleet_common::error::{AppError, AppResult};
use fleet_common::types::TelemetryRecord;

pub const STREAM_NAME: &str = "TELEMETRY";
pub const INGEST_SUBJECT: &str = "telemetry.ingest";
pub const CONSUMER_NAME: &str = "telemetry-writer";

#[derive(Clone)]
pub struct LogPublisher {
    client: async_nats::Client,
    js: jetstream::Context,
}

impl LogPublisher {
    pub async fn connect(nats_url: &str) -> AppResult<Self> {
        let client = async_nats::connect(nats_url)
            .await
            .map_err(|e| AppError::External(format!("nats connect failed: {e}")))?;
        info!(url = %nats_url, "connected to durable log");
        let js = jetstream::new(client.clone());

        js.get_or_create_stream(StreamConfig {
            name: STREAM_NAME.to_string(),
            subjects: vec![INGEST_SUBJECT.to_string()],
            storage: StorageType::File,
            num_replicas: 1,
            ..Default::default()
        })
        .await
        .map_err(|e| AppError::External(format!("stream provisioning failed: {e}")))?;

        Ok(Self { client, js })
    }

    /// Publish one record and wait for the log's acknowledgement; the ingest
    /// endpoint only answers 202 once this returns.
    pub async fn publish(&self, record: &TelemetryRecord) -> AppResult<()> {
        let payload = serde_json::to_vec(record).map_err(|_| AppError::Internal)?;
        self.js
            .publish(INGEST_SUBJECT, payload.into())
            .await
            .map_err(|e| AppError::Unavailable(format!("log publish failed: {e}")))?
            .await
            .map_err(|e| AppError::Unavailable(format!("log did not acknowledge: {e}")))?;
        Ok(())
    }

    pub fn jetstream(&self) -> jetstream::Context {
        self.js.clone()
    }

    pub fn connection_state(&self) -> async_nats::connection::State {
        self.client.connection_state()
    }
}
