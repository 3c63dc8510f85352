//! Durable-log consumer that materializes envelopes into the partitioned
//! store.

use std::time::Duration;

use async_nats::jetstream::consumer::pull::Config as PullConfig;
use async_nats::jetstream::AckKind;
use futures::StreamExt;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::ingest::{CONSUMER_NAME, INGEST_SUBJECT, STREAM_NAME};
use crate::metrics::TELEMETRY_WRITES;
use crate::state::AppState;
use crate::stores::telemetry::TelemetryStore;
use fleet_common::types::TelemetryRecord;

const BATCH_EXPIRY: Duration = Duration::from_secs(5);

pub fn spawn(state: AppState, shutdown: watch::Receiver<bool>) {
    tokio::spawn(async move {
        if let Err(e) = run(state, shutdown).await {
            warn!(error = %e, "telemetry writer exited");
        }
    });
}

async fn run(
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), async_nats::Error> {
    let js = state.log.jetstream();
    let stream = js.get_stream(STREAM_NAME).await?;
    let consumer = stream
        .get_or_create_consumer(
            CONSUMER_NAME,
            PullConfig {
                durable_name: Some(CONSUMER_NAME.to_string()),
                filter_subject: INGEST_SUBJECT.to_string(),
                ..Default::default()
            },
        )
        .await?;

    let store = TelemetryStore::new(state.db.clone());
    let batch_size = state.config.max_batch_size;
    info!(batch_size, "telemetry writer started");

    loop {
        if *shutdown.borrow() {
            info!("telemetry writer stopped");
            return Ok(());
        }

        let mut messages = consumer
            .stream()
            .max_messages_per_batch(batch_size)
            .expires(BATCH_EXPIRY)
            .messages()
            .await?;

        loop {
            tokio::select! {
                next = messages.next() => match next {
                    Some(Ok(message)) => handle_message(&store, message).await,
                    Some(Err(e)) => {
                        warn!(error = %e, "log batch error");
                        break;
                    }
                    None => break,
                },
                _ = shutdown.changed() => {
                    info!("telemetry writer stopped");
                    return Ok(());
                }
            }
        }
    }
}

async fn handle_message(store: &TelemetryStore, message: async_nats::jetstream::Message) {
    let record: TelemetryRecord = match serde_json::from_slice(&message.payload) {
        Ok(record) => record,
        Err(e) => {
            // A payload that never parses would redeliver forever.
            warn!(error = %e, "unparseable log message dropped");
            TELEMETRY_WRITES.with_label_values(&["dropped"]).inc();
            let _ = message.ack().await;
            return;
        }
    };

    match store.write_record(&record).await {
        Ok(()) => {
            TELEMETRY_WRITES.with_label_values(&["written"]).inc();
            debug!(
                device_id = %record.envelope.device_id,
                seq = record.envelope.seq,
                "envelope materialized"
            );
            if let Err(e) = message.ack().await {
                warn!(error = %e, "ack failed");
            }
        }
        Err(e) if is_out_of_retention(&e.to_string()) => {
            // The target partition was dropped: the sample is out of
            // retention and redelivery cannot succeed.
            warn!(
                device_id = %record.envelope.device_id,
                collected_at = %record.envelope.collected_at,
                "envelope outside retention window dropped"
            );
            TELEMETRY_WRITES.with_label_values(&["dropped"]).inc();
            let _ = message.ack().await;
        }
        Err(e) => {
            warn!(error = %e, "materialization failed, requesting redelivery");
            TELEMETRY_WRITES.with_label_values(&["failed"]).inc();
            if let Err(e) = message.ack_with(AckKind::Nak(None)).await {
                warn!(error = %e, "NAK failed");
            }
        }
    }
}

fn is_out_of_retention(error: &str) -> bool {
    error.contains("no partition of relation")
}

#[cfg(test)]
mod tests {
    use super::is_out_of_retention;

    #[test]
    fn partition_routing_errors_are_terminal() {
        assert!(is_out_of_retention(
            "history insert failed: error returned from database: \
             no partition of relation \"telemetry\" found for row"
        ));
        assert!(!is_out_of_retention("connection reset by peer"));
    }
}
