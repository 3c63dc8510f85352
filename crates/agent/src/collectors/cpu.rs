use async_trait::async_trait;
use serde_json::{json, Value};
use sysinfo::System;

use super::Collector;
use crate::error::{AgentError, AgentResult};
use fleet_common::types;

pub struct CpuCollector;

impl CpuCollector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Collector for CpuCollector {
    fn name(&self) -> &'static str {
        types::METRIC_CPU
    }

    async fn collect(&self) -> AgentResult<Value> {
        // Utilization is a delta between two refreshes, so the probe has to
        // block for the sysinfo minimum sampling interval.
        let percent = tokio::task::spawn_blocking(|| {
            let mut sys = System::new_all();
            std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
            sys.refresh_cpu_usage();

            let cpus = sys.cpus();
            if cpus.is_empty() {
                return 0.0_f64;
            }
            let total: f64 = cpus.iter().map(|c| f64::from(c.cpu_usage())).sum();
            total / cpus.len() as f64
        })
        .await
        .map_err(|e| AgentError::Collector(format!("cpu.utilization task failed: {e}")))?;

        Ok(json!({ "cpu_percent": percent.clamp(0.0, 100.0) }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn percent_is_within_bounds() {
        let collector = CpuCollector::new();
        let value = collector.collect().await.expect("collect");

        let percent = value["cpu_percent"].as_f64().expect("number");
        assert!((0.0..=100.0).contains(&percent), "got {percent}");
    }
}
