//! Periodic collection driver.
//!
//! The scheduler task owns the collector set and the writer list; all
//! reconfiguration (interval changes, collector enable bits, out-of-band
//! triggers) arrives as messages on its control channel, so no state is
//! shared behind locks.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::collectors::CollectorSet;
use crate::error::{AgentError, AgentResult};
use crate::output::Writer;
use fleet_common::types::TelemetryEnvelope;

/// Upper bound for one collector invocation; must stay below the minimum
/// collection interval.
const COLLECTOR_TIMEOUT: Duration = Duration::from_secs(30);
const CONTROL_CHANNEL_CAPACITY: usize = 16;

pub enum SchedulerMsg {
    /// One collection outside the schedule; does not reset the ticker.
    Trigger {
        metrics: Option<Vec<String>>,
        reply: oneshot::Sender<AgentResult<Vec<String>>>,
    },
    UpdateInterval(Duration),
    SetEnabled(String, bool),
}

#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<SchedulerMsg>,
}

impl SchedulerHandle {
    pub async fn trigger_now(&self, metrics: Option<Vec<String>>) -> AgentResult<Vec<String>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SchedulerMsg::Trigger { metrics, reply })
            .await
            .map_err(|_| AgentError::Command("scheduler stopped".to_string()))?;
        rx.await
            .map_err(|_| AgentError::Command("scheduler dropped trigger".to_string()))?
    }

    pub async fn update_interval(&self, interval: Duration) {
        let _ = self.tx.send(SchedulerMsg::UpdateInterval(interval)).await;
    }

    pub async fn set_enabled(&self, name: String, enabled: bool) {
        let _ = self.tx.send(SchedulerMsg::SetEnabled(name, enabled)).await;
    }
}

pub struct Scheduler {
    device_id: uuid::Uuid,
    agent_version: String,
    interval: Duration,
    collectors: CollectorSet,
    writers: Vec<Arc<dyn Writer>>,
    seq: i64,
    rx: mpsc::Receiver<SchedulerMsg>,
}

impl Scheduler {
    #[allow(clippy::new_ret_no_self)]
    pub fn new(
        device_id: uuid::Uuid,
        interval: Duration,
        collectors: CollectorSet,
        writers: Vec<Arc<dyn Writer>>,
    ) -> (Self, SchedulerHandle) {
        let (tx, rx) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);
        let scheduler = Self {
            device_id,
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
            interval,
            collectors,
            writers,
            // Seeded with wall-clock millis so seq stays monotonic across
            // restarts without persisting a counter.
            seq: Utc::now().timestamp_millis(),
            rx,
        };
        (scheduler, SchedulerHandle { tx })
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        // Fleet-wide dejitter: the first tick is pushed back by a uniform
        // delay in [0, interval/10). Control messages are served meanwhile.
        let jitter_ms =
            rand::thread_rng().gen_range(0..self.interval.as_millis().max(10) / 10) as u64;
        debug!(jitter_ms, "first collection delayed by jitter");

        let first_tick = Instant::now() + Duration::from_millis(jitter_ms) + self.interval;
        let mut ticker = interval_at(first_tick, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            interval_seconds = self.interval.as_secs(),
            collectors = ?self.collectors.enabled_names(),
            "scheduler started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.collect_and_write(None).await;
                }
                Some(msg) = self.rx.recv() => match msg {
                    SchedulerMsg::Trigger { metrics, reply } => {
                        let collected = self.collect_and_write(metrics.as_deref()).await;
                        let _ = reply.send(Ok(collected));
                    }
                    SchedulerMsg::UpdateInterval(interval) => {
                        if interval != self.interval {
                            info!(
                                interval_seconds = interval.as_secs(),
                                "collection interval updated"
                            );
                            self.interval = interval;
                            ticker = interval_at(Instant::now() + interval, interval);
                            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                        }
                    }
                    SchedulerMsg::SetEnabled(name, enabled) => {
                        if self.collectors.set_enabled(&name, enabled) {
                            info!(collector = %name, enabled, "collector toggled");
                        } else {
                            // Unknown names are ignored for forward compatibility.
                            debug!(collector = %name, "ignoring unknown collector name");
                        }
                    }
                },
                _ = shutdown.changed() => {
                    info!("scheduler stopping");
                    return;
                }
            }
        }
    }

    /// Run every enabled collector (optionally narrowed to `filter`),
    /// assemble an envelope and hand it to all writers. Returns the metric
    /// names that produced a payload.
    async fn collect_and_write(&mut self, filter: Option<&[String]>) -> Vec<String> {
        let mut metrics = serde_json::Map::new();

        for collector in self.collectors.enabled() {
            if let Some(wanted) = filter {
                if !wanted.iter().any(|w| w == collector.name()) {
                    continue;
                }
            }
            match tokio::time::timeout(COLLECTOR_TIMEOUT, collector.collect()).await {
                Ok(Ok(payload)) => {
                    metrics.insert(collector.name().to_string(), payload);
                }
                Ok(Err(e)) => {
                    warn!(collector = collector.name(), error = %e, "collector failed");
                }
                Err(_) => {
                    warn!(collector = collector.name(), "collector timed out");
                }
            }
        }

        self.seq += 1;
        let envelope = TelemetryEnvelope {
            device_id: self.device_id,
            agent_version: self.agent_version.clone(),
            collected_at: Utc::now(),
            seq: self.seq,
            metrics,
            tags: None,
        };

        for writer in &self.writers {
            if let Err(e) = writer.write(&envelope).await {
                warn!(writer = writer.name(), error = %e, "writer failed");
            }
        }

        debug!(
            seq = envelope.seq,
            metrics = envelope.metrics.len(),
            "collection cycle completed"
        );
        envelope.metrics.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::{json, Value};

    use super::*;
    use crate::collectors::{Collector, CollectorSet};
    use fleet_common::types;

    struct StaticCollector {
        name: &'static str,
        fail: bool,
    }

    #[async_trait]
    impl Collector for StaticCollector {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn collect(&self) -> AgentResult<Value> {
            if self.fail {
                Err(AgentError::Collector("probe unavailable".to_string()))
            } else {
                Ok(json!({"ok": true}))
            }
        }
    }

    #[derive(Default)]
    struct CapturingWriter {
        envelopes: Mutex<Vec<TelemetryEnvelope>>,
    }

    #[async_trait]
    impl Writer for CapturingWriter {
        fn name(&self) -> &'static str {
            "capture"
        }

        async fn write(&self, envelope: &TelemetryEnvelope) -> AgentResult<()> {
            self.envelopes
                .lock()
                .expect("lock")
                .push(envelope.clone());
            Ok(())
        }
    }

    struct FailingWriter;

    #[async_trait]
    impl Writer for FailingWriter {
        fn name(&self) -> &'static str {
            "broken"
        }

        async fn write(&self, _: &TelemetryEnvelope) -> AgentResult<()> {
            Err(AgentError::Writer("disk full".to_string()))
        }
    }

    fn collector_set(entries: Vec<(&'static str, bool)>) -> CollectorSet {
        let mut set = CollectorSet::new();
        for (name, fail) in entries {
            set.register(Box::new(StaticCollector { name, fail }));
            set.set_enabled(name, true);
        }
        set
    }

    async fn start(
        set: CollectorSet,
        writers: Vec<Arc<dyn Writer>>,
    ) -> (SchedulerHandle, watch::Sender<bool>) {
        let (scheduler, handle) = Scheduler::new(
            uuid::Uuid::new_v4(),
            Duration::from_secs(900),
            set,
            writers,
        );
        let (stop_tx, stop_rx) = watch::channel(false);
        scheduler.spawn(stop_rx);
        (handle, stop_tx)
    }

    #[tokio::test]
    async fn trigger_collects_enabled_metrics() {
        let writer = Arc::new(CapturingWriter::default());
        let set = collector_set(vec![(types::METRIC_OS_INFO, false), (types::METRIC_CPU, false)]);
        let (handle, _stop) = start(set, vec![writer.clone()]).await;

        let mut collected = handle.trigger_now(None).await.expect("trigger");
        collected.sort();
        assert_eq!(collected, vec![types::METRIC_CPU, types::METRIC_OS_INFO]);

        let envelopes = writer.envelopes.lock().expect("lock");
        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0].metrics.len(), 2);
    }

    #[tokio::test]
    async fn collector_failure_becomes_omission() {
        let writer = Arc::new(CapturingWriter::default());
        let set = collector_set(vec![(types::METRIC_OS_INFO, false), (types::METRIC_CPU, true)]);
        let (handle, _stop) = start(set, vec![writer.clone()]).await;

        let collected = handle.trigger_now(None).await.expect("trigger");
        assert_eq!(collected, vec![types::METRIC_OS_INFO]);

        // The envelope still carries identity and seq despite the failure.
        let envelopes = writer.envelopes.lock().expect("lock");
        assert_eq!(envelopes.len(), 1);
        assert!(envelopes[0].seq > 0);
        assert!(!envelopes[0].metrics.contains_key(types::METRIC_CPU));
    }

    #[tokio::test]
    async fn writer_failure_does_not_block_other_writers() {
        let capture = Arc::new(CapturingWriter::default());
        let set = collector_set(vec![(types::METRIC_OS_INFO, false)]);
        let writers: Vec<Arc<dyn Writer>> = vec![Arc::new(FailingWriter), capture.clone()];
        let (handle, _stop) = start(set, writers).await;

        handle.trigger_now(None).await.expect("trigger");
        assert_eq!(capture.envelopes.lock().expect("lock").len(), 1);
    }

    #[tokio::test]
    async fn trigger_respects_metric_filter() {
        let writer = Arc::new(CapturingWriter::default());
        let set = collector_set(vec![(types::METRIC_OS_INFO, false), (types::METRIC_CPU, false)]);
        let (handle, _stop) = start(set, vec![writer.clone()]).await;

        let collected = handle
            .trigger_now(Some(vec![types::METRIC_OS_INFO.to_string()]))
            .await
            .expect("trigger");
        assert_eq!(collected, vec![types::METRIC_OS_INFO]);
    }

    #[tokio::test]
    async fn seq_is_monotonic_across_cycles() {
        let writer = Arc::new(CapturingWriter::default());
        let set = collector_set(vec![(types::METRIC_OS_INFO, false)]);
        let (handle, _stop) = start(set, vec![writer.clone()]).await;

        handle.trigger_now(None).await.expect("first");
        handle.trigger_now(None).await.expect("second");

        let envelopes = writer.envelopes.lock().expect("lock");
        assert!(envelopes[1].seq > envelopes[0].seq);
    }

    #[tokio::test]
    async fn set_enabled_toggles_collection() {
        let writer = Arc::new(CapturingWriter::default());
        let set = collector_set(vec![(types::METRIC_OS_INFO, false), (types::METRIC_CPU, false)]);
        let (handle, _stop) = start(set, vec![writer.clone()]).await;

        handle
            .set_enabled(types::METRIC_CPU.to_string(), false)
            .await;
        // Unknown collector names are ignored without failing the scheduler.
        handle.set_enabled("gpu.thermals".to_string(), true).await;

        let collected = handle.trigger_now(None).await.expect("trigger");
        assert_eq!(collected, vec![types::METRIC_OS_INFO]);
    }
}
