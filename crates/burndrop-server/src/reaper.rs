//! Background removal of secrets that expired without being read.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time;
use tracing::warn;

use crate::engine::SecretEngine;

/// Default interval between background purges.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

/// Run one purge, logging instead of propagating failures.
/// Returns the number of records removed (0 on failure).
pub fn run_once(engine: &SecretEngine) -> usize {
    match engine.purge_expired() {
        Ok(removed) => removed,
        Err(e) => {
            warn!(error = %e, "purge of expired secrets failed");
            0
        }
    }
}

/// Spawn a background Tokio task that purges every `interval`.
pub fn spawn_reaper(engine: SecretEngine, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        ticker.tick().await; // skip first immediate tick
        loop {
            ticker.tick().await;
            run_once(&engine);
        }
    })
}
