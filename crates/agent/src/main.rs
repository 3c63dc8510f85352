mod capability;
mod collectors;
mod command;
mod config;
mod error;
mod output;
mod policy;
mod registration;
mod scheduler;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::collectors::CollectorSet;
use crate::command::CommandClient;
use crate::config::ConfigStore;
use crate::output::{CloudWriter, LocalWriter, Writer};
use crate::policy::PolicyClient;
use crate::scheduler::Scheduler;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);
const REAUTH_CHECK_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Parser)]
#[command(name = "fleet-agent", version, about = "Endpoint inventory and telemetry agent")]
struct Cli {
    /// Path to the agent configuration file.
    #[arg(long, env = "FLEET_AGENT_CONFIG", default_value = config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match ConfigStore::load(&cli.config) {
        Ok(store) => Arc::new(store),
        Err(err) => {
            eprintln!("fleet-agent failed to load config: {err}");
            std::process::exit(1);
        }
    };

    let log_level = config.snapshot().log_level;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();

    if let Err(err) = run(config).await {
        error!("fleet-agent failed: {err}");
        std::process::exit(1);
    }
}

async fn run(config: Arc<ConfigStore>) -> error::AgentResult<()> {
    let snapshot = config.snapshot();
    info!(device_id = %snapshot.device_id, "starting fleet agent");

    let client = fleet_common::http::build_client();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let cloud_mode = snapshot.api_endpoint.is_some();
    if cloud_mode {
        if let Err(e) = registration::ensure_registered(&client, &config).await {
            // Local collection keeps working; the operator can fix
            // registration out-of-band.
            warn!(error = %e, "registration failed, continuing in local-only mode");
        }
    }

    let mut writers: Vec<Arc<dyn Writer>> =
        vec![Arc::new(LocalWriter::new(snapshot.local_output_path.clone()))];
    let mut cloud_writer = None;
    if cloud_mode {
        let writer = CloudWriter::new(client.clone(), config.clone());
        writer.spawn_retry_loop(shutdown_rx.clone());
        writers.push(writer.clone());
        cloud_writer = Some(writer);
    }

    let collectors = CollectorSet::with_defaults(&snapshot.enabled_metrics);
    let (scheduler, handle) = Scheduler::new(
        snapshot.device_id,
        snapshot.collection_interval(),
        collectors,
        writers,
    );
    let scheduler_task = scheduler.spawn(shutdown_rx.clone());

    if cloud_mode {
        PolicyClient::new(client.clone(), config.clone(), handle.clone())
            .spawn(shutdown_rx.clone());
        CommandClient::new(client.clone(), config.clone(), handle.clone())
            .spawn(shutdown_rx.clone());
    }

    if let Some(writer) = cloud_writer {
        spawn_reauth_watcher(client.clone(), config.clone(), writer, shutdown_rx.clone());
    }

    tokio::signal::ctrl_c()
        .await
        .map_err(error::AgentError::Io)?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    if tokio::time::timeout(SHUTDOWN_GRACE, scheduler_task)
        .await
        .is_err()
    {
        warn!("scheduler did not drain within grace period");
    }
    info!("fleet agent stopped");
    Ok(())
}

/// When the server rejects our token, rotate identity by re-registering.
fn spawn_reauth_watcher(
    client: reqwest::Client,
    config: Arc<ConfigStore>,
    writer: Arc<CloudWriter>,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(REAUTH_CHECK_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !writer.needs_reauth() {
                        continue;
                    }
                    info!("auth token rejected, attempting re-registration");
                    if config.update(|cfg| cfg.auth_token = None).is_err() {
                        continue;
                    }
                    match registration::ensure_registered(&client, &config).await {
                        Ok(()) => {
                            writer.clear_reauth();
                            info!("re-registration successful");
                        }
                        Err(e) => warn!(error = %e, "re-registration failed"),
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    });
}
