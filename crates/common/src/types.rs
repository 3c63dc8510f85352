use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Metric names an agent can collect. Everything on the wire is validated
/// against this set.
pub const METRIC_OS_INFO: &str = "os.info";
pub const METRIC_CPU: &str = "cpu.utilization";
pub const METRIC_MEMORY: &str = "memory.usage";
pub const METRIC_DISK: &str = "disk.utilization";
pub const METRIC_SOFTWARE: &str = "software.inventory";

pub const KNOWN_METRICS: [&str; 5] = [
    METRIC_OS_INFO,
    METRIC_CPU,
    METRIC_MEMORY,
    METRIC_DISK,
    METRIC_SOFTWARE,
];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Active,
    Inactive,
    Offline,
}

/// One collection feature an agent advertises at registration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Capability {
    pub name: String,
    pub version: String,
}

/// One sampling cycle as produced by the agent scheduler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelemetryEnvelope {
    pub device_id: Uuid,
    pub agent_version: String,
    pub collected_at: DateTime<Utc>,
    pub seq: i64,
    pub metrics: serde_json::Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<BTreeMap<String, String>>,
}

/// Envelope as published to the durable log, with server-side identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelemetryRecord {
    #[serde(flatten)]
    pub envelope: TelemetryEnvelope,
    pub ingestion_id: Uuid,
    pub server_received_at: DateTime<Utc>,
}

/// The collection directive an agent obeys.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PolicyConfig {
    pub interval_seconds: u32,
    #[serde(default)]
    pub metrics: BTreeMap<String, MetricToggle>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetricToggle {
    pub enabled: bool,
}

pub const POLICY_MIN_INTERVAL_SECONDS: u32 = 60;
pub const POLICY_MAX_INTERVAL_SECONDS: u32 = 3600;
pub const POLICY_DEFAULT_INTERVAL_SECONDS: u32 = 900;

impl PolicyConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.interval_seconds < POLICY_MIN_INTERVAL_SECONDS
            || self.interval_seconds > POLICY_MAX_INTERVAL_SECONDS
        {
            return Err(format!(
                "interval_seconds must be between {POLICY_MIN_INTERVAL_SECONDS} and {POLICY_MAX_INTERVAL_SECONDS}"
            ));
        }
        Ok(())
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            interval_seconds: POLICY_DEFAULT_INTERVAL_SECONDS,
            metrics: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    Executing,
    Completed,
    Failed,
    Expired,
}

impl CommandStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Expired)
    }
}

pub const COMMAND_MAX_TTL_SECONDS: i64 = 3600;
pub const COMMAND_COLLECT_NOW: &str = "collect.now";

/// Command as delivered to an agent by the poll endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandSpec {
    pub command_id: Uuid,
    #[serde(rename = "type")]
    pub command_type: String,
    #[serde(default)]
    pub parameters: Value,
    pub issued_at: DateTime<Utc>,
    pub ttl_seconds: i64,
}

impl CommandSpec {
    pub fn expired_at(&self, now: DateTime<Utc>) -> bool {
        self.issued_at + chrono::Duration::seconds(self.ttl_seconds) < now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn policy_config_interval_bounds() {
        let mut cfg = PolicyConfig::default();
        assert!(cfg.validate().is_ok());

        cfg.interval_seconds = 59;
        assert!(cfg.validate().is_err());

        cfg.interval_seconds = 60;
        assert!(cfg.validate().is_ok());

        cfg.interval_seconds = 3601;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn envelope_round_trips_through_json() {
        let mut metrics = serde_json::Map::new();
        metrics.insert(
            METRIC_CPU.to_string(),
            serde_json::json!({"cpu_percent": 12.5}),
        );
        let envelope = TelemetryEnvelope {
            device_id: Uuid::new_v4(),
            agent_version: "0.3.0".to_string(),
            collected_at: Utc::now(),
            seq: 42,
            metrics,
            tags: None,
        };

        let json = serde_json::to_string(&envelope).expect("serialize");
        assert!(!json.contains("tags"));
        let back: TelemetryEnvelope = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, envelope);
    }

    #[test]
    fn record_flattens_envelope_fields() {
        let record = TelemetryRecord {
            envelope: TelemetryEnvelope {
                device_id: Uuid::new_v4(),
                agent_version: "0.3.0".to_string(),
                collected_at: Utc::now(),
                seq: 1,
                metrics: serde_json::Map::new(),
                tags: None,
            },
            ingestion_id: Uuid::new_v4(),
            server_received_at: Utc::now(),
        };

        let value = serde_json::to_value(&record).expect("serialize");
        assert!(value.get("device_id").is_some());
        assert!(value.get("ingestion_id").is_some());
        assert!(value.get("envelope").is_none());
    }

    #[test]
    fn terminal_statuses() {
        assert!(!CommandStatus::Pending.is_terminal());
        assert!(!CommandStatus::Executing.is_terminal());
        assert!(CommandStatus::Completed.is_terminal());
        assert!(CommandStatus::Failed.is_terminal());
        assert!(CommandStatus::Expired.is_terminal());
    }

    #[test]
    fn command_expiry_uses_issued_at_plus_ttl() {
        let now = Utc::now();
        let cmd = CommandSpec {
            command_id: Uuid::new_v4(),
            command_type: COMMAND_COLLECT_NOW.to_string(),
            parameters: Value::Null,
            issued_at: now - Duration::seconds(120),
            ttl_seconds: 60,
        };
        assert!(cmd.expired_at(now));

        let fresh = CommandSpec {
            issued_at: now,
            ..cmd
        };
        assert!(!fresh.expired_at(now));
    }
}
