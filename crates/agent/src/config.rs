use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AgentError, AgentResult};
use fleet_common::types;

pub const DEFAULT_CONFIG_PATH: &str = "/var/lib/fleet-agent/config.json";
pub const DEFAULT_LOCAL_OUTPUT_PATH: &str = "/var/lib/fleet-agent/inventory.json";
pub const DEFAULT_COLLECTION_INTERVAL_SECONDS: u64 = 900;
pub const MIN_COLLECTION_INTERVAL_SECONDS: u64 = 60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub backoff_multiplier: f64,
    pub max_backoff_seconds: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff_multiplier: 2.0,
            max_backoff_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "Uuid::nil")]
    pub device_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(default = "default_interval")]
    pub collection_interval_seconds: u64,
    #[serde(default = "default_enabled_metrics")]
    pub enabled_metrics: BTreeMap<String, bool>,
    #[serde(default = "default_output_path")]
    pub local_output_path: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default, rename = "retry_config")]
    pub retry: RetryConfig,
}

fn default_interval() -> u64 {
    DEFAULT_COLLECTION_INTERVAL_SECONDS
}

fn default_enabled_metrics() -> BTreeMap<String, bool> {
    // os.info is always collected on a fresh install; everything else is
    // opted in by policy.
    BTreeMap::from([(types::METRIC_OS_INFO.to_string(), true)])
}

fn default_output_path() -> PathBuf {
    PathBuf::from(DEFAULT_LOCAL_OUTPUT_PATH)
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            device_id: Uuid::nil(),
            api_endpoint: None,
            auth_token: None,
            collection_interval_seconds: default_interval(),
            enabled_metrics: default_enabled_metrics(),
            local_output_path: default_output_path(),
            log_level: default_log_level(),
            retry: RetryConfig::default(),
        }
    }
}

impl AgentConfig {
    pub fn validate(&self) -> AgentResult<()> {
        if self.device_id.is_nil() {
            return Err(AgentError::Config("device_id is required".to_string()));
        }
        if self.collection_interval_seconds < MIN_COLLECTION_INTERVAL_SECONDS {
            return Err(AgentError::Config(format!(
                "collection_interval_seconds must be at least {MIN_COLLECTION_INTERVAL_SECONDS}"
            )));
        }
        if self.local_output_path.as_os_str().is_empty() {
            return Err(AgentError::Config(
                "local_output_path is required".to_string(),
            ));
        }
        if self.retry.backoff_multiplier <= 1.0 {
            return Err(AgentError::Config(
                "retry.backoff_multiplier must be greater than 1.0".to_string(),
            ));
        }
        if self.retry.max_backoff_seconds < 1 {
            return Err(AgentError::Config(
                "retry.max_backoff_seconds must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn collection_interval(&self) -> Duration {
        Duration::from_secs(self.collection_interval_seconds)
    }
}

/// On-disk configuration shared by the agent tasks.
///
/// Reads hand out clones; writes go through [`ConfigStore::update`], which
/// holds the lock across mutation and the atomic file replace so concurrent
/// writers cannot interleave.
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    current: Mutex<AgentConfig>,
}

impl ConfigStore {
    /// Load the config file, creating it with defaults (and a fresh
    /// device id) on first start.
    pub fn load(path: impl Into<PathBuf>) -> AgentResult<Self> {
        let path = path.into();
        let mut config = match std::fs::read(&path) {
            Ok(data) => serde_json::from_slice::<AgentConfig>(&data)
                .map_err(|e| AgentError::Config(format!("failed to parse config file: {e}")))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => AgentConfig::default(),
            Err(e) => return Err(AgentError::Config(format!("failed to read config file: {e}"))),
        };

        if config.device_id.is_nil() {
            config.device_id = Uuid::new_v4();
            write_atomic(&path, &config)?;
        }
        config.validate()?;

        Ok(Self {
            path,
            current: Mutex::new(config),
        })
    }

    pub fn snapshot(&self) -> AgentConfig {
        self.current.lock().expect("config lock poisoned").clone()
    }

    /// Mutate the config and persist it atomically.
    pub fn update(&self, mutate: impl FnOnce(&mut AgentConfig)) -> AgentResult<AgentConfig> {
        let mut guard = self.current.lock().expect("config lock poisoned");
        let mut candidate = guard.clone();
        mutate(&mut candidate);
        candidate.validate()?;
        write_atomic(&self.path, &candidate)?;
        *guard = candidate.clone();
        Ok(candidate)
    }
}

fn write_atomic(path: &Path, config: &AgentConfig) -> AgentResult<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let data = serde_json::to_vec_pretty(config)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, data)?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn first_load_generates_device_id_and_persists() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("config.json");

        let store = ConfigStore::load(&path).expect("load");
        let config = store.snapshot();
        assert!(!config.device_id.is_nil());
        assert_eq!(
            config.collection_interval_seconds,
            DEFAULT_COLLECTION_INTERVAL_SECONDS
        );

        // Second load sees the same identity.
        let again = ConfigStore::load(&path).expect("reload");
        assert_eq!(again.snapshot().device_id, config.device_id);
    }

    #[test]
    fn update_persists_atomically() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("config.json");
        let store = ConfigStore::load(&path).expect("load");

        store
            .update(|cfg| {
                cfg.auth_token = Some("flt_live_abc123def456".to_string());
                cfg.collection_interval_seconds = 300;
            })
            .expect("update");

        let reloaded = ConfigStore::load(&path).expect("reload");
        let config = reloaded.snapshot();
        assert_eq!(config.auth_token.as_deref(), Some("flt_live_abc123def456"));
        assert_eq!(config.collection_interval_seconds, 300);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn update_rejects_interval_below_minimum() {
        let dir = TempDir::new().expect("tempdir");
        let store = ConfigStore::load(dir.path().join("config.json")).expect("load");

        let before = store.snapshot();
        let err = store
            .update(|cfg| cfg.collection_interval_seconds = 30)
            .expect_err("should reject");
        assert!(err.to_string().contains("collection_interval_seconds"));
        // Rejected update leaves the stored config untouched.
        assert_eq!(store.snapshot(), before);
    }

    #[test]
    fn partial_config_file_fills_defaults() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("config.json");
        let device_id = Uuid::new_v4();
        std::fs::write(
            &path,
            format!(
                r#"{{"device_id":"{device_id}","api_endpoint":"https://ingest.example.com"}}"#
            ),
        )
        .expect("write");

        let store = ConfigStore::load(&path).expect("load");
        let config = store.snapshot();
        assert_eq!(config.device_id, device_id);
        assert_eq!(
            config.api_endpoint.as_deref(),
            Some("https://ingest.example.com")
        );
        assert_eq!(
            config.collection_interval_seconds,
            DEFAULT_COLLECTION_INTERVAL_SECONDS
        );
        assert_eq!(config.enabled_metrics.get(types::METRIC_OS_INFO), Some(&true));
        assert_eq!(config.retry.max_retries, 5);
    }

    #[test]
    fn validate_rejects_flat_backoff() {
        let mut config = AgentConfig {
            device_id: Uuid::new_v4(),
            ..AgentConfig::default()
        };
        config.retry.backoff_multiplier = 1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn parse_error_is_reported_not_overwritten() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("config.json");
        std::fs::write(&path, b"{not json").expect("write");

        let err = ConfigStore::load(&path).expect_err("should fail");
        assert!(err.to_string().contains("parse"));
        // The broken file is left in place for the operator.
        assert_eq!(std::fs::read(&path).expect("read"), b"{not json");
    }
}
