//! Periodic drift correction for vault protection.
//!
//! Runs independently of plan and selection changes. Each tick reconciles
//! every registered vault; a failure for one vault is logged and retried on
//! the next tick.

use crate::enforcer::{ProtectionEnforcer, ReconcileOutcome};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Start the watch loop. Cancel the returned token to stop it.
pub fn spawn_protection_watch(
    enforcer: Arc<ProtectionEnforcer>,
    every: Duration,
) -> CancellationToken {
    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();

    tokio::spawn(async move {
        run_watch_loop(enforcer, every, cancel_clone).await;
    });

    cancel
}

async fn run_watch_loop(
    enforcer: Arc<ProtectionEnforcer>,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!(interval_secs = every.as_secs(), "protection watch started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("protection watch shutting down");
                break;
            }
            _ = ticker.tick() => {
                run_watch_iteration(&enforcer).await;
            }
        }
    }
}

async fn run_watch_iteration(enforcer: &ProtectionEnforcer) {
    let mut corrected = 0usize;
    let mut failed = 0usize;
    for (vault, outcome) in enforcer.reconcile_all().await {
        match outcome {
            Ok(ReconcileOutcome::Applied { hash, .. }) => {
                corrected += 1;
                info!(vault = %vault, hash = %hash, "protection drift corrected");
            }
            Ok(ReconcileOutcome::Unchanged { .. }) => {}
            Err(err) => {
                failed += 1;
                warn!(vault = %vault, error = %err, "protection still pending");
            }
        }
    }
    debug!(corrected, failed, "protection watch tick");
}
