//! # Auto-Refresh Poller
//!
//! Background task that re-reads the caller's glucose and risk handles on a fixed
//! interval. While the coordinator lacks a contract, a read provider or a signer address
//! the tick clears both mirrors instead of reading; reading resumes on its own once they
//! are back. Tick errors are logged and swallowed.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::{RefreshOutcome, WorkflowCoordinator};

/// Handle to a running poller. Dropping it stops the task.
#[derive(Debug)]
pub struct AutoRefreshPoller {
    interval: Duration,
    handle: JoinHandle<()>,
}

impl AutoRefreshPoller {
    /// Spawn the poller. The first refresh happens immediately.
    pub fn spawn(coordinator: WorkflowCoordinator, interval: Duration) -> Self {
        info!("Starting auto-refresh poller (every {:?})", interval);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                match coordinator.refresh_handles().await {
                    Ok(RefreshOutcome::Updated) => debug!("Handles refreshed"),
                    Ok(RefreshOutcome::Cleared) => debug!("Handles cleared: contract, provider or signer missing"),
                    Ok(RefreshOutcome::Discarded) => debug!("Refresh discarded: session changed while reading"),
                    Err(e) => warn!("Error refreshing handles: {}", e),
                }
            }
        });

        Self { interval, handle }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    pub fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for AutoRefreshPoller {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
