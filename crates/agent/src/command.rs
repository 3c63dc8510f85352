//! Remote command polling and bounded execution.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};

use crate::config::ConfigStore;
use crate::error::{AgentError, AgentResult};
use crate::scheduler::SchedulerHandle;
use fleet_common::api::CommandAck;
use fleet_common::types::{CommandSpec, COMMAND_COLLECT_NOW};

const POLL_INTERVAL: Duration = Duration::from_secs(60);
/// Commands executing at once; overflow stays queued server-side until the
/// next poll.
const MAX_CONCURRENT_COMMANDS: usize = 2;

pub struct CommandClient {
    client: reqwest::Client,
    config: Arc<ConfigStore>,
    scheduler: SchedulerHandle,
    permits: Arc<Semaphore>,
}

impl CommandClient {
    pub fn new(
        client: reqwest::Client,
        config: Arc<ConfigStore>,
        scheduler: SchedulerHandle,
    ) -> Self {
        Self {
            client,
            config,
            scheduler,
            permits: Arc::new(Semaphore::new(MAX_CONCURRENT_COMMANDS)),
        }
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once().await {
                        warn!(error = %e, "command poll failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("command client stopping");
                    return;
                }
            }
        }
    }

    /// Claim at most as many commands as there are free execution slots;
    /// the rest stay pending server-side and return on the next poll.
    async fn poll_once(&self) -> AgentResult<()> {
        let snapshot = self.config.snapshot();
        let (Some(endpoint), Some(token)) = (&snapshot.api_endpoint, &snapshot.auth_token) else {
            return Ok(());
        };

        let slots = self.permits.available_permits();
        if slots == 0 {
            debug!("all command slots busy, skipping poll");
            return Ok(());
        }

        let url = format!(
            "{}/v1/agents/{}/commands?limit={}",
            endpoint.trim_end_matches('/'),
            snapshot.device_id,
            slots
        );
        let resp = self.client.get(&url).bearer_auth(token).send().await?;
        if !resp.status().is_success() {
            return Err(AgentError::Command(format!(
                "command poll returned {}",
                resp.status()
            )));
        }

        let commands: Vec<CommandSpec> = resp.json().await?;
        if commands.is_empty() {
            return Ok(());
        }
        info!(count = commands.len(), "received commands");

        for command in commands {
            let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                debug!(command_id = %command.command_id, "no free slot, command waits for next poll");
                continue;
            };

            let client = self.client.clone();
            let config = self.config.clone();
            let scheduler = self.scheduler.clone();
            tokio::spawn(async move {
                let _permit = permit;
                let command_id = command.command_id;
                let ack = execute(&scheduler, command).await;
                if let Err(e) = send_ack(&client, &config, command_id, &ack).await {
                    warn!(command_id = %command_id, error = %e, "command ack failed");
                }
            });
        }
        Ok(())
    }
}

async fn execute(scheduler: &SchedulerHandle, command: CommandSpec) -> CommandAck {
    if command.expired_at(Utc::now()) {
        return CommandAck {
            result: None,
            error: Some("expired before execution".to_string()),
        };
    }

    match command.command_type.as_str() {
        COMMAND_COLLECT_NOW => {
            let metrics = requested_metrics(&command.parameters);
            match scheduler.trigger_now(metrics).await {
                Ok(collected) => CommandAck {
                    result: Some(json!({
                        "status": "completed",
                        "metrics": collected,
                    })),
                    error: None,
                },
                Err(e) => CommandAck {
                    result: None,
                    error: Some(format!("collection failed: {e}")),
                },
            }
        }
        _ => CommandAck {
            result: None,
            error: Some("unknown command type".to_string()),
        },
    }
}

/// `{metrics: ["os.info", ...]}` narrows the collection; absent or malformed
/// parameters trigger a full cycle.
fn requested_metrics(parameters: &Value) -> Option<Vec<String>> {
    let names: Vec<String> = parameters
        .get("metrics")?
        .as_array()?
        .iter()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect();
    if names.is_empty() {
        None
    } else {
        Some(names)
    }
}

async fn send_ack(
    client: &reqwest::Client,
    config: &Arc<ConfigStore>,
    command_id: uuid::Uuid,
    ack: &CommandAck,
) -> AgentResult<()> {
    let snapshot = config.snapshot();
    let (Some(endpoint), Some(token)) = (&snapshot.api_endpoint, &snapshot.auth_token) else {
        return Err(AgentError::Command("not configured for cloud mode".to_string()));
    };

    let url = format!(
        "{}/v1/agents/{}/commands/{}/ack",
        endpoint.trim_end_matches('/'),
        snapshot.device_id,
        command_id
    );
    let resp = client.post(&url).bearer_auth(token).json(ack).send().await?;
    if !resp.status().is_success() {
        return Err(AgentError::Command(format!(
            "ack returned {}",
            resp.status()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn requested_metrics_parses_names() {
        let params = json!({"metrics": ["os.info", "cpu.utilization"]});
        assert_eq!(
            requested_metrics(&params),
            Some(vec!["os.info".to_string(), "cpu.utilization".to_string()])
        );
    }

    #[test]
    fn requested_metrics_tolerates_missing_or_malformed() {
        assert_eq!(requested_metrics(&json!({})), None);
        assert_eq!(requested_metrics(&json!({"metrics": "os.info"})), None);
        assert_eq!(requested_metrics(&json!({"metrics": []})), None);
        assert_eq!(requested_metrics(&json!({"metrics": [42]})), None);
    }

    #[tokio::test]
    async fn unknown_command_type_is_acked_with_error() {
        let (_, handle) = {
            use crate::collectors::CollectorSet;
            use crate::scheduler::Scheduler;
            Scheduler::new(
                uuid::Uuid::new_v4(),
                Duration::from_secs(900),
                CollectorSet::new(),
                Vec::new(),
            )
        };
        // Scheduler not spawned: an unknown type never reaches it.
        let command = CommandSpec {
            command_id: uuid::Uuid::new_v4(),
            command_type: "reboot.now".to_string(),
            parameters: Value::Null,
            issued_at: Utc::now(),
            ttl_seconds: 120,
        };
        let ack = execute(&handle, command).await;
        assert_eq!(ack.error.as_deref(), Some("unknown command type"));
        assert!(ack.result.is_none());
    }

    #[tokio::test]
    async fn expired_command_is_acked_with_error() {
        let (_, handle) = {
            use crate::collectors::CollectorSet;
            use crate::scheduler::Scheduler;
            Scheduler::new(
                uuid::Uuid::new_v4(),
                Duration::from_secs(900),
                CollectorSet::new(),
                Vec::new(),
            )
        };
        let command = CommandSpec {
            command_id: uuid::Uuid::new_v4(),
            command_type: COMMAND_COLLECT_NOW.to_string(),
            parameters: Value::Null,
            issued_at: Utc::now() - chrono::Duration::seconds(300),
            ttl_seconds: 60,
        };
        let ack = execute(&handle, command).await;
        assert_eq!(ack.error.as_deref(), Some("expired before execution"));
    }
}
