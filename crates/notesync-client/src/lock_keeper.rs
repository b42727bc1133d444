//! Keeps an edit lock alive while a document is open.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::transport::SyncTransport;

/// Handle on a running keeper. Dropping it stops the task.
pub struct LockKeeper {
    document_id: String,
    handle: JoinHandle<()>,
    lost: watch::Receiver<Option<String>>,
}

impl LockKeeper {
    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    /// Why the lock was lost, if it was.
    pub fn lost_reason(&self) -> Option<String> {
        self.lost.borrow().clone()
    }

    /// Wait until the lock is lost; returns the reason.
    pub async fn lost(&mut self) -> Option<String> {
        self.lost
            .wait_for(|reason| reason.is_some())
            .await
            .ok()
            .and_then(|reason| reason.clone())
    }

    pub fn stop(self) {
        self.handle.abort();
    }
}

impl Drop for LockKeeper {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Extend the caller's lock on `document_id` every `period`.
///
/// Connectivity failures are retried on the next tick, since the lock TTL
/// leaves room for a few missed extensions. A refusal or any other error
/// ends the keeper and is published as the loss reason.
pub fn spawn_lock_keeper(
    transport: Arc<dyn SyncTransport>,
    document_id: &str,
    period: Duration,
) -> LockKeeper {
    let (tx, lost) = watch::channel(None);
    let doc = document_id.to_string();

    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            match transport.extend_lock(&doc).await {
                Ok(status) if status.extended => {
                    debug!("Extended lock on {} until {:?}", doc, status.expires_at);
                }
                Ok(status) => {
                    let reason = status.reason.unwrap_or_else(|| "rejected".to_string());
                    info!("Lost lock on {}: {}", doc, reason);
                    let _ = tx.send(Some(reason));
                    break;
                }
                Err(e) if e.is_network() => {
                    warn!("Lock extension for {} failed, will retry: {}", doc, e);
                }
                Err(e) => {
                    warn!("Lock extension for {} failed: {}", doc, e);
                    let _ = tx.send(Some(e.code().to_string()));
                    break;
                }
            }
        }
    });

    LockKeeper {
        document_id: document_id.to_string(),
        handle,
        lost,
    }
}
