use async_trait::async_trait;
use serde_json::{json, Value};
use sysinfo::System;

use super::Collector;
use crate::error::{AgentError, AgentResult};
use fleet_common::types;

pub struct MemoryCollector;

impl MemoryCollector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Collector for MemoryCollector {
    fn name(&self) -> &'static str {
        types::METRIC_MEMORY
    }

    async fn collect(&self) -> AgentResult<Value> {
        let (used, total) = tokio::task::spawn_blocking(|| {
            let mut sys = System::new();
            sys.refresh_memory();
            (sys.used_memory(), sys.total_memory())
        })
        .await
        .map_err(|e| AgentError::Collector(format!("memory.usage task failed: {e}")))?;

        Ok(json!({
            "used_bytes": used.min(total),
            "total_bytes": total,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn used_never_exceeds_total() {
        let collector = MemoryCollector::new();
        let value = collector.collect().await.expect("collect");

        let used = value["used_bytes"].as_u64().expect("used");
        let total = value["total_bytes"].as_u64().expect("total");
        assert!(used <= total);
    }
}
