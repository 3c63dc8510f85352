//! Device onboarding against the central service.

use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use sysinfo::System;
use tracing::{info, warn};

use crate::capability;
use crate::config::ConfigStore;
use crate::error::{AgentError, AgentResult};
use fleet_common::api::{RegisterRequest, RegisterResponse};

const MAX_ATTEMPTS: u32 = 10;
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Register this device if no auth token is stored yet, persisting the
/// returned token atomically. Retries transient failures with exponential
/// backoff; a registration conflict is terminal.
pub async fn ensure_registered(
    client: &reqwest::Client,
    config: &Arc<ConfigStore>,
) -> AgentResult<()> {
    let snapshot = config.snapshot();
    if snapshot.auth_token.is_some() {
        return Ok(());
    }
    let Some(endpoint) = snapshot.api_endpoint.clone() else {
        return Err(AgentError::Registration(
            "api_endpoint not configured".to_string(),
        ));
    };

    let request = RegisterRequest {
        device_id: snapshot.device_id,
        hostname: System::host_name().unwrap_or_else(|| "unknown".to_string()),
        capabilities: capability::capabilities(),
        agent_version: env!("CARGO_PKG_VERSION").to_string(),
    };

    let mut last_error = None;
    for attempt in 1..=MAX_ATTEMPTS {
        info!(attempt, device_id = %request.device_id, "attempting registration");
        match try_register(client, &endpoint, &request).await {
            Ok(token) => {
                config.update(|cfg| cfg.auth_token = Some(token.clone()))?;
                info!(device_id = %request.device_id, "registration successful");
                return Ok(());
            }
            Err(e @ AgentError::Registration(_)) => return Err(e),
            Err(e) => {
                let backoff = Duration::from_secs(2u64.pow(attempt.min(6))).min(MAX_BACKOFF);
                warn!(attempt, error = %e, backoff_seconds = backoff.as_secs(), "registration attempt failed, retrying");
                last_error = Some(e);
                tokio::time::sleep(backoff).await;
            }
        }
    }

    Err(last_error.unwrap_or_else(|| {
        AgentError::Registration(format!("gave up after {MAX_ATTEMPTS} attempts"))
    }))
}

async fn try_register(
    client: &reqwest::Client,
    endpoint: &str,
    request: &RegisterRequest,
) -> AgentResult<String> {
    let url = format!("{}/v1/agents/register", endpoint.trim_end_matches('/'));
    let resp = client.post(&url).json(request).send().await?;

    match resp.status() {
        s if s.is_success() => {
            let body: RegisterResponse = resp.json().await?;
            body.auth_token.ok_or_else(|| {
                AgentError::Registration(
                    "already registered and no token returned, operator intervention required"
                        .to_string(),
                )
            })
        }
        StatusCode::CONFLICT => Err(AgentError::Registration(
            "device already registered without a token, operator intervention required"
                .to_string(),
        )),
        s => {
            let body = resp.text().await.unwrap_or_default();
            // Transient server-side failures fall through to the retry loop.
            Err(AgentError::Api(format!("registration returned {s}: {body}")))
        }
    }
}
