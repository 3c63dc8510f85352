//! Shape validation for telemetry envelopes.
//!
//! Metric payloads are validated structurally before an envelope is accepted
//! for ingestion. A failed check is a 400-class error: the agent is expected
//! to drop the envelope, not retry it.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde_json::Value;

use crate::types::{self, TelemetryEnvelope};

/// Maximum tolerated clock skew between agent and server.
pub const MAX_CLOCK_SKEW_SECONDS: i64 = 60;

pub fn validate_envelope(envelope: &TelemetryEnvelope, now: DateTime<Utc>) -> Result<(), String> {
    if envelope.device_id.is_nil() {
        return Err("device_id is required".to_string());
    }
    if envelope.collected_at > now + Duration::seconds(MAX_CLOCK_SKEW_SECONDS) {
        return Err("collected_at is too far in the future".to_string());
    }
    for (name, payload) in &envelope.metrics {
        validate_metric(name, payload).map_err(|e| format!("invalid metric {name}: {e}"))?;
    }
    Ok(())
}

pub fn validate_metric(name: &str, payload: &Value) -> Result<(), String> {
    match name {
        types::METRIC_OS_INFO => validate_os_info(payload),
        types::METRIC_CPU => validate_cpu(payload),
        types::METRIC_MEMORY => validate_memory(payload),
        types::METRIC_DISK => validate_disk(payload),
        types::METRIC_SOFTWARE => validate_software(payload),
        _ => Err("unknown metric".to_string()),
    }
}

fn validate_os_info(payload: &Value) -> Result<(), String> {
    let obj = payload.as_object().ok_or("must be an object")?;
    for key in [
        "caption", "version", "make", "model", "serial", "hostname", "domain", "last_user",
    ] {
        if let Some(value) = obj.get(key) {
            if !value.is_string() {
                return Err(format!("{key} must be a string"));
            }
        }
    }
    Ok(())
}

fn validate_cpu(payload: &Value) -> Result<(), String> {
    let obj = payload.as_object().ok_or("must be an object")?;
    let percent = obj
        .get("cpu_percent")
        .and_then(Value::as_f64)
        .ok_or("cpu_percent must be a number")?;
    if !(0.0..=100.0).contains(&percent) {
        return Err("cpu_percent must be within [0, 100]".to_string());
    }
    Ok(())
}

fn validate_memory(payload: &Value) -> Result<(), String> {
    let obj = payload.as_object().ok_or("must be an object")?;
    let used = obj
        .get("used_bytes")
        .and_then(Value::as_u64)
        .ok_or("used_bytes must be a non-negative integer")?;
    let total = obj
        .get("total_bytes")
        .and_then(Value::as_u64)
        .ok_or("total_bytes must be a non-negative integer")?;
    if used > total {
        return Err("used_bytes exceeds total_bytes".to_string());
    }
    Ok(())
}

fn validate_disk(payload: &Value) -> Result<(), String> {
    let disks = payload.as_array().ok_or("must be an array")?;
    for (i, disk) in disks.iter().enumerate() {
        let obj = disk
            .as_object()
            .ok_or_else(|| format!("volume {i} must be an object"))?;
        if !obj.get("name").map(Value::is_string).unwrap_or(false) {
            return Err(format!("volume {i}: name must be a string"));
        }
        for key in ["total_bytes", "free_bytes", "used_bytes"] {
            if obj.get(key).and_then(Value::as_u64).is_none() {
                return Err(format!("volume {i}: {key} must be a non-negative integer"));
            }
        }
    }
    Ok(())
}

fn validate_software(payload: &Value) -> Result<(), String> {
    let items = payload.as_array().ok_or("must be an array")?;
    for (i, item) in items.iter().enumerate() {
        let obj = item
            .as_object()
            .ok_or_else(|| format!("item {i} must be an object"))?;
        for key in ["name", "version", "publisher"] {
            if !obj.get(key).map(Value::is_string).unwrap_or(false) {
                return Err(format!("item {i}: {key} must be a string"));
            }
        }
        let install_date = obj
            .get("install_date")
            .and_then(Value::as_str)
            .ok_or_else(|| format!("item {i}: install_date must be a string"))?;
        if !install_date.is_empty()
            && NaiveDate::parse_from_str(install_date, "%Y-%m-%d").is_err()
        {
            return Err(format!("item {i}: install_date must be YYYY-MM-DD or empty"));
        }
    }
    Ok(())
}
