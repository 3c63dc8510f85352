use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::metrics::COMMANDS;
use crate::state::AppState;
use crate::stores::command::CommandStore;

const EXPIRE_INTERVAL: Duration = Duration::from_secs(60);

/// Transitions stale pending commands to `expired` in bulk.
pub fn spawn(state: AppState, mut shutdown: watch::Receiver<bool>) {
    tokio::spawn(async move {
        let store = CommandStore::new(state.db.clone());
        let mut ticker = tokio::time::interval(EXPIRE_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;
        info!("command expirer started");

        loop {
            tokio::select! {
                _ = ticker.tick() => match store.expire_pending().await {
                    Ok(0) => {}
                    Ok(expired) => {
                        COMMANDS
                            .with_label_values(&["expired"])
                            .inc_by(expired as f64);
                        info!(expired, "expired stale commands");
                    }
                    Err(e) => warn!(error = %e, "command expiry failed"),
                },
                _ = shutdown.changed() => {
                    info!("command expirer stopped");
                    return;
                }
            }
        }
    });
}
