//! Host probes. Each collector produces the JSON payload for one metric
//! name; a failing collector is logged and its metric omitted from the
//! envelope, never failing the collection cycle.

mod cpu;
mod disk;
mod memory;
mod os_info;
mod software;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::AgentResult;
use fleet_common::types;

pub use cpu::CpuCollector;
pub use disk::DiskCollector;
pub use memory::MemoryCollector;
pub use os_info::OsInfoCollector;
pub use software::SoftwareCollector;

#[async_trait]
pub trait Collector: Send + Sync {
    fn name(&self) -> &'static str;
    async fn collect(&self) -> AgentResult<Value>;
}

struct Entry {
    collector: Box<dyn Collector>,
    enabled: bool,
}

/// The set of registered collectors with their enabled bits. Owned
/// exclusively by the scheduler task; enable changes arrive as scheduler
/// messages, so no locking is needed here.
pub struct CollectorSet {
    entries: Vec<Entry>,
}

impl CollectorSet {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// All canonical probes, with enabled bits taken from `enabled_metrics`
    /// (absent names default to disabled).
    pub fn with_defaults(enabled_metrics: &BTreeMap<String, bool>) -> Self {
        let mut set = Self::new();
        set.register(Box::new(OsInfoCollector::new()));
        set.register(Box::new(CpuCollector::new()));
        set.register(Box::new(MemoryCollector::new()));
        set.register(Box::new(DiskCollector::new()));
        set.register(Box::new(SoftwareCollector::new()));
        for entry in &mut set.entries {
            entry.enabled = enabled_metrics
                .get(entry.collector.name())
                .copied()
                .unwrap_or(false);
        }
        set
    }

    pub fn register(&mut self, collector: Box<dyn Collector>) {
        self.entries.push(Entry {
            collector,
            enabled: false,
        });
    }

    /// Returns false for names no collector answers to.
    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> bool {
        match self
            .entries
            .iter_mut()
            .find(|e| e.collector.name() == name)
        {
            Some(entry) => {
                entry.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn enabled(&self) -> impl Iterator<Item = &dyn Collector> {
        self.entries
            .iter()
            .filter(|e| e.enabled)
            .map(|e| e.collector.as_ref())
    }

    pub fn enabled_names(&self) -> Vec<&'static str> {
        self.enabled().map(|c| c.name()).collect()
    }
}

impl Default for CollectorSet {
    fn default() -> Self {
        let all_on: BTreeMap<String, bool> = types::KNOWN_METRICS
            .iter()
            .map(|n| ((*n).to_string(), true))
            .collect();
        Self::with_defaults(&all_on)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::CollectorSet;
    use fleet_common::types;

    #[test]
    fn defaults_follow_enabled_metrics_map() {
        let enabled = BTreeMap::from([
            (types::METRIC_OS_INFO.to_string(), true),
            (types::METRIC_CPU.to_string(), false),
        ]);
        let set = CollectorSet::with_defaults(&enabled);

        // cpu is explicitly off; names absent from the map are disabled.
        assert_eq!(set.enabled_names(), vec![types::METRIC_OS_INFO]);
    }

    #[test]
    fn set_enabled_reports_unknown_names() {
        let mut set = CollectorSet::default();
        assert!(set.set_enabled(types::METRIC_DISK, false));
        assert!(!set.enabled_names().contains(&types::METRIC_DISK));
        assert!(!set.set_enabled("gpu.thermals", true));
    }
}
