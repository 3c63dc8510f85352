use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram, CounterVec, Encoder, Histogram, TextEncoder,
};

lazy_static! {
    // Ingest endpoint outcomes: accepted, rejected, unavailable.
    pub static ref INGEST_ENVELOPES: CounterVec = register_counter_vec!(
        "fleet_ingest_envelopes_total",
        "Telemetry envelopes seen by the ingest endpoint",
        &["outcome"]
    )
    .unwrap();

    pub static ref INGEST_PAYLOAD_BYTES: Histogram = register_histogram!(
        "fleet_ingest_payload_bytes",
        "Decoded envelope sizes in bytes",
        prometheus::exponential_buckets(256.0, 4.0, 8).unwrap()
    )
    .unwrap();

    // Materialization outcomes: written, duplicate_or_stale, dropped, failed.
    pub static ref TELEMETRY_WRITES: CounterVec = register_counter_vec!(
        "fleet_telemetry_writes_total",
        "Log messages processed by the telemetry writer",
        &["outcome"]
    )
    .unwrap();

    pub static ref COMMANDS: CounterVec = register_counter_vec!(
        "fleet_commands_total",
        "Command lifecycle transitions",
        &["transition"]
    )
    .unwrap();

    pub static ref PARTITION_OPS: CounterVec = register_counter_vec!(
        "fleet_partition_operations_total",
        "Partition manager operations",
        &["op"]
    )
    .unwrap();
}

pub fn gather_text() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&prometheus::gather(), &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
