//! Stall watchdog
//!
//! Periodically asks the orchestrator to fail a WAITING_COMMAND or
//! PROGRAMMING stage that has outlived its configured limit.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::orchestrator::{Orchestrator, StallLimits};

/// Spawn the watchdog; returns `None` when every limit is disabled
pub fn spawn_watchdog(
    orchestrator: Arc<Orchestrator>,
    limits: StallLimits,
    interval: Duration,
    cancel: CancellationToken,
) -> Option<JoinHandle<()>> {
    if limits.waiting_command.is_none() && limits.programming.is_none() {
        debug!("Workflow watchdog disabled");
        return None;
    }

    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if orchestrator.check_stall(&limits).await {
                        warn!("Watchdog moved a stalled workflow to ERROR");
                    }
                },
            }
        }
        debug!("Workflow watchdog stopped");
    }))
}
