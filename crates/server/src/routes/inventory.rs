use std::io::Read;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::header::CONTENT_ENCODING;
use axum::http::{HeaderMap, StatusCode};
use axum::{Extension, Json};
use chrono::Utc;
use flate2::read::GzDecoder;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::auth::device::AuthedDevice;
use crate::metrics::{INGEST_ENVELOPES, INGEST_PAYLOAD_BYTES};
use crate::state::AppState;
use crate::stores::device::DeviceStore;
use fleet_common::api::IngestResponse;
use fleet_common::error::{AppError, AppResult};
use fleet_common::types::{TelemetryEnvelope, TelemetryRecord};
use fleet_common::validate::validate_envelope;

/// Accept one telemetry envelope. The envelope is validated, stamped with a
/// server identity and handed to the durable log; 202 is only returned once
/// the log acknowledges the publish. Materialization happens asynchronously.
pub async fn ingest(
    State(state): State<AppState>,
    Extension(device): Extension<AuthedDevice>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<(StatusCode, Json<IngestResponse>)> {
    let decoded = decode_body(&headers, &body).inspect_err(|_| {
        INGEST_ENVELOPES.with_label_values(&["rejected"]).inc();
    })?;
    INGEST_PAYLOAD_BYTES.observe(decoded.len() as f64);

    let envelope: TelemetryEnvelope = serde_json::from_slice(&decoded).map_err(|e| {
        INGEST_ENVELOPES.with_label_values(&["rejected"]).inc();
        AppError::InvalidInput(format!("invalid telemetry payload: {e}"))
    })?;

    if envelope.device_id != device.device_id {
        INGEST_ENVELOPES.with_label_values(&["rejected"]).inc();
        return Err(AppError::InvalidInput("device id mismatch".to_string()));
    }
    if let Err(reason) = validate_envelope(&envelope, Utc::now()) {
        INGEST_ENVELOPES.with_label_values(&["rejected"]).inc();
        return Err(AppError::InvalidInput(reason));
    }

    let record = TelemetryRecord {
        envelope,
        ingestion_id: Uuid::new_v4(),
        server_received_at: Utc::now(),
    };

    state.log.publish(&record).await.inspect_err(|e| {
        INGEST_ENVELOPES.with_label_values(&["unavailable"]).inc();
        warn!(device_id = %device.device_id, error = %e, "log publish failed");
    })?;

    // Liveness is best-effort; losing it must not fail an accepted envelope.
    if let Err(e) = DeviceStore::new(state.db.clone())
        .touch_last_seen(device.device_id)
        .await
    {
        warn!(device_id = %device.device_id, error = %e, "last_seen update failed");
    }

    INGEST_ENVELOPES.with_label_values(&["accepted"]).inc();
    debug!(
        device_id = %device.device_id,
        seq = record.envelope.seq,
        ingestion_id = %record.ingestion_id,
        "envelope accepted"
    );
    Ok((
        StatusCode::ACCEPTED,
        Json(IngestResponse {
            ingestion_id: record.ingestion_id,
            status: "accepted".to_string(),
        }),
    ))
}

fn decode_body(headers: &HeaderMap, body: &Bytes) -> AppResult<Vec<u8>> {
    let is_gzip = headers
        .get(CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("gzip"))
        .unwrap_or(false);

    if !is_gzip {
        return Ok(body.to_vec());
    }

    let mut decoder = GzDecoder::new(body.as_ref());
    let mut decoded = Vec::new();
    decoder
        .read_to_end(&mut decoded)
        .map_err(|_| AppError::InvalidInput("body is not valid gzip".to_string()))?;
    Ok(decoded)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use axum::http::HeaderValue;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    use super::*;

    #[test]
    fn plain_body_passes_through() {
        let headers = HeaderMap::new();
        let body = Bytes::from_static(b"{\"a\":1}");
        assert_eq!(decode_body(&headers, &body).expect("decode"), b"{\"a\":1}");
    }

    #[test]
    fn gzip_body_is_decompressed() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"{\"seq\":9}").expect("compress");
        let compressed = encoder.finish().expect("finish");

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        let decoded = decode_body(&headers, &Bytes::from(compressed)).expect("decode");
        assert_eq!(decoded, b"{\"seq\":9}");
    }

    #[test]
    fn advertised_but_invalid_gzip_is_rejected() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        let err = decode_body(&headers, &Bytes::from_static(b"plainly not gzip"))
            .expect_err("should fail");
        assert!(err.to_string().contains("gzip"));
    }
}
