use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use sysinfo::System;

use super::Collector;
use crate::error::{AgentError, AgentResult};
use fleet_common::types;

#[derive(Debug, Serialize)]
struct OsInfo {
    caption: String,
    version: String,
    make: String,
    model: String,
    serial: String,
    hostname: String,
    domain: String,
    last_user: String,
}

pub struct OsInfoCollector;

impl OsInfoCollector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Collector for OsInfoCollector {
    fn name(&self) -> &'static str {
        types::METRIC_OS_INFO
    }

    async fn collect(&self) -> AgentResult<Value> {
        let info = tokio::task::spawn_blocking(|| OsInfo {
            caption: System::long_os_version().unwrap_or_default(),
            version: System::os_version().unwrap_or_default(),
            make: read_dmi("sys_vendor"),
            model: read_dmi("product_name"),
            serial: read_dmi("product_serial"),
            hostname: System::host_name().unwrap_or_default(),
            domain: read_domain(),
            last_user: std::env::var("USER").unwrap_or_default(),
        })
        .await
        .map_err(|e| AgentError::Collector(format!("os.info task failed: {e}")))?;

        Ok(serde_json::to_value(info)?)
    }
}

/// DMI attributes are world-readable on most distributions; serial numbers
/// often are not, in which case the field stays empty.
fn read_dmi(attribute: &str) -> String {
    std::fs::read_to_string(format!("/sys/class/dmi/id/{attribute}"))
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

fn read_domain() -> String {
    System::host_name()
        .and_then(|h| h.split_once('.').map(|(_, domain)| domain.to_string()))
        .unwrap_or_default()
}
