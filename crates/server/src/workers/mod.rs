mod command_expirer;
mod partition_manager;
mod telemetry_writer;

use tokio::sync::watch;

use crate::state::AppState;

pub use partition_manager::{parse_partition_date, partition_name};

/// Spawn the long-running background workers. Each owns its shutdown
/// receiver and drains on signal.
pub fn spawn_all(state: &AppState, shutdown: watch::Receiver<bool>) {
    telemetry_writer::spawn(state.clone(), shutdown.clone());
    command_expirer::spawn(state.clone(), shutdown.clone());
    partition_manager::spawn(state.clone(), shutdown);
}
