//! Periodic policy fetch with conditional-request semantics.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{ETAG, IF_NONE_MATCH};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::ConfigStore;
use crate::error::{AgentError, AgentResult};
use crate::scheduler::SchedulerHandle;
use fleet_common::api::EffectivePolicy;
use fleet_common::types::KNOWN_METRICS;

const POLL_INTERVAL: Duration = Duration::from_secs(60);

pub struct PolicyClient {
    client: reqwest::Client,
    config: Arc<ConfigStore>,
    scheduler: SchedulerHandle,
    etag: Option<String>,
}

impl PolicyClient {
    pub fn new(
        client: reqwest::Client,
        config: Arc<ConfigStore>,
        scheduler: SchedulerHandle,
    ) -> Self {
        Self {
            client,
            config,
            scheduler,
            etag: None,
        }
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.fetch_and_apply().await {
                        // Current policy stays in force on any failure.
                        warn!(error = %e, "policy fetch failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("policy client stopping");
                    return;
                }
            }
        }
    }

    async fn fetch_and_apply(&mut self) -> AgentResult<()> {
        let snapshot = self.config.snapshot();
        let (Some(endpoint), Some(token)) = (&snapshot.api_endpoint, &snapshot.auth_token) else {
            return Ok(());
        };

        let url = format!(
            "{}/v1/agents/{}/policy",
            endpoint.trim_end_matches('/'),
            snapshot.device_id
        );
        let mut request = self.client.get(&url).bearer_auth(token);
        if let Some(etag) = &self.etag {
            request = request.header(IF_NONE_MATCH, etag);
        }

        let resp = request.send().await?;
        match resp.status() {
            StatusCode::NOT_MODIFIED => {
                debug!("policy unchanged");
                Ok(())
            }
            s if s.is_success() => {
                let served_etag = resp
                    .headers()
                    .get(ETAG)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                let body = resp.bytes().await?;
                let policy: EffectivePolicy = serde_json::from_slice(&body)?;

                self.apply(&policy).await?;
                self.etag = Some(served_etag.unwrap_or_else(|| derive_etag(&body)));
                info!(version = policy.version, "policy applied");
                Ok(())
            }
            s => Err(AgentError::Policy(format!("policy fetch returned {s}"))),
        }
    }

    async fn apply(&self, policy: &EffectivePolicy) -> AgentResult<()> {
        if policy.config.interval_seconds > 0 {
            let interval = Duration::from_secs(u64::from(policy.config.interval_seconds));
            self.scheduler.update_interval(interval).await;
        }

        for (name, toggle) in known_toggles(policy) {
            self.scheduler
                .set_enabled(name.to_string(), toggle)
                .await;
        }

        self.config.update(|cfg| {
            if policy.config.interval_seconds > 0 {
                cfg.collection_interval_seconds = u64::from(policy.config.interval_seconds);
            }
            for (name, toggle) in known_toggles(policy) {
                cfg.enabled_metrics.insert(name.to_string(), toggle);
            }
        })?;
        Ok(())
    }
}

/// Policy entries for metric names this agent knows about; unknown names
/// are ignored for forward compatibility.
fn known_toggles(policy: &EffectivePolicy) -> impl Iterator<Item = (&str, bool)> {
    policy
        .config
        .metrics
        .iter()
        .filter(|(name, _)| KNOWN_METRICS.contains(&name.as_str()))
        .map(|(name, toggle)| (name.as_str(), toggle.enabled))
}

/// Content-hash fallback when the server omits an entity tag.
fn derive_etag(body: &[u8]) -> String {
    let digest = Sha256::digest(body);
    format!("\"{:x}\"", digest)
}
