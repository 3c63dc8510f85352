use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use sysinfo::Disks;

use super::Collector;
use crate::error::{AgentError, AgentResult};
use fleet_common::types;

#[derive(Debug, Serialize)]
struct Volume {
    name: String,
    total_bytes: u64,
    free_bytes: u64,
    used_bytes: u64,
}

pub struct DiskCollector;

impl DiskCollector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Collector for DiskCollector {
    fn name(&self) -> &'static str {
        types::METRIC_DISK
    }

    async fn collect(&self) -> AgentResult<Value> {
        let volumes = tokio::task::spawn_blocking(|| {
            let disks = Disks::new_with_refreshed_list();
            let mut volumes: Vec<Volume> = disks
                .iter()
                .filter(|d| !d.is_removable())
                .map(|d| {
                    let total = d.total_space();
                    let free = d.available_space();
                    Volume {
                        name: d.mount_point().to_string_lossy().to_string(),
                        total_bytes: total,
                        free_bytes: free,
                        used_bytes: total.saturating_sub(free),
                    }
                })
                .collect();
            volumes.sort_by(|a, b| a.name.cmp(&b.name));
            volumes
        })
        .await
        .map_err(|e| AgentError::Collector(format!("disk.utilization task failed: {e}")))?;

        Ok(serde_json::to_value(volumes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn volumes_are_ordered_and_consistent() {
        let collector = DiskCollector::new();
        let value = collector.collect().await.expect("collect");

        let volumes = value.as_array().expect("array");
        let mut previous = String::new();
        for volume in volumes {
            let name = volume["name"].as_str().expect("name").to_string();
            assert!(previous <= name, "volumes not sorted");
            previous = name;

            let total = volume["total_bytes"].as_u64().expect("total");
            let free = volume["free_bytes"].as_u64().expect("free");
            let used = volume["used_bytes"].as_u64().expect("used");
            assert_eq!(used, total - free);
        }
    }
}
