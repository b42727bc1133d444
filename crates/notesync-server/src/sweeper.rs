//! Periodic removal of expired lock records and stale presence entries.
//!
//! Expiry is decided lazily on every lock operation and presence read, so
//! this is housekeeping only: it keeps abandoned records from piling up in
//! the stores, notably for documents nobody opens again.

use std::time::Duration;

use notesync_core::{LockManager, PresenceRegistry};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Run `LockManager::sweep` and `PresenceRegistry::sweep` every `period`
/// until `shutdown` turns true.
pub fn spawn_sweeper(
    locks: LockManager,
    presence: PresenceRegistry,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match locks.sweep().await {
                        Ok(0) => debug!("Lock sweep: nothing expired"),
                        Ok(removed) => info!("Lock sweep removed {} expired locks", removed),
                        Err(e) => warn!("Lock sweep failed: {}", e),
                    }
                    match presence.sweep().await {
                        Ok(0) => debug!("Presence sweep: nothing stale"),
                        Ok(removed) => info!("Presence sweep removed {} stale editors", removed),
                        Err(e) => warn!("Presence sweep failed: {}", e),
                    }
                }
                // The watch guard is not Send; drop it inside the branch.
                _ = async { let _ = shutdown.wait_for(|&stop| stop).await; } => break,
            }
        }
        debug!("Sweeper stopped");
    })
}
