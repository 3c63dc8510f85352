use std::collections::HashSet;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use super::Collector;
use crate::error::{AgentError, AgentResult};
use fleet_common::types;

const DPKG_STATUS_PATH: &str = "/var/lib/dpkg/status";

/// Name prefixes for system components and kernel/update packages that
/// would otherwise drown the inventory.
const SUPPRESSED_PREFIXES: [&str; 5] = [
    "lib",
    "fonts-",
    "linux-image-",
    "linux-headers-",
    "linux-modules-",
];

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SoftwareItem {
    pub name: String,
    pub version: String,
    pub publisher: String,
    pub install_date: String,
}

pub struct SoftwareCollector {
    status_path: String,
}

impl SoftwareCollector {
    pub fn new() -> Self {
        Self {
            status_path: DPKG_STATUS_PATH.to_string(),
        }
    }
}

#[async_trait]
impl Collector for SoftwareCollector {
    fn name(&self) -> &'static str {
        types::METRIC_SOFTWARE
    }

    async fn collect(&self) -> AgentResult<Value> {
        let path = self.status_path.clone();
        let items = tokio::task::spawn_blocking(move || -> AgentResult<Vec<SoftwareItem>> {
            let raw = std::fs::read_to_string(&path)
                .map_err(|e| AgentError::Collector(format!("cannot read {path}: {e}")))?;
            Ok(parse_dpkg_status(&raw))
        })
        .await
        .map_err(|e| AgentError::Collector(format!("software.inventory task failed: {e}")))??;

        Ok(serde_json::to_value(items)?)
    }
}

/// Parse installed packages out of a dpkg status database. Entries are
/// deduplicated case-insensitively by name and system/update entries are
/// suppressed by prefix; the result is ordered by name.
pub fn parse_dpkg_status(raw: &str) -> Vec<SoftwareItem> {
    let mut items = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    for paragraph in raw.split("\n\n") {
        let mut name = "";
        let mut version = "";
        let mut publisher = "";
        let mut installed = false;

        for line in paragraph.lines() {
            if let Some(v) = line.strip_prefix("Package: ") {
                name = v.trim();
            } else if let Some(v) = line.strip_prefix("Version: ") {
                version = v.trim();
            } else if let Some(v) = line.strip_prefix("Maintainer: ") {
                publisher = v.trim();
            } else if let Some(v) = line.strip_prefix("Status: ") {
                installed = v.trim().ends_with("installed");
            }
        }

        if name.is_empty() || !installed {
            continue;
        }
        if SUPPRESSED_PREFIXES.iter().any(|p| name.starts_with(p)) {
            continue;
        }
        if !seen.insert(name.to_lowercase()) {
            continue;
        }

        items.push(SoftwareItem {
            name: name.to_string(),
            version: version.to_string(),
            publisher: publisher.to_string(),
            // dpkg does not record an install date.
            install_date: String::new(),
        });
    }

    items.sort_by(|a, b| a.name.cmp(&b.name));
    items
}
