//! Online/offline routing of local mutations.

use std::sync::Arc;

use chrono::Utc;
use notesync_core::{ConflictReport, Document, ResolutionStrategy, ServerEvent, SyncError, Version};
use tracing::{info, warn};
use uuid::Uuid;

use crate::baseline::BaselineStore;
use crate::queue::{OfflineQueue, ReplayReport};
use crate::reconcile::{apply_resolution, push_update, SyncOutcome};
use crate::transport::SyncTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Online,
    Offline,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SaveOutcome {
    Synced(SyncOutcome),
    /// Stored locally; will be replayed on reconnect.
    Queued(Uuid),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    Created(Document),
    /// Created offline under a temporary id.
    Queued(String),
}

/// A client's view of sync: baselines, the offline queue and connectivity.
///
/// While online, mutations go straight to the server. The first connectivity
/// failure flips the client offline and the mutation is queued instead of
/// failing; `reconnect` replays the queue.
pub struct SyncClient {
    transport: Arc<dyn SyncTransport>,
    baselines: BaselineStore,
    queue: OfflineQueue,
    state: Connectivity,
}

impl SyncClient {
    pub fn new(client_id: &str, transport: Arc<dyn SyncTransport>, queue: OfflineQueue) -> Self {
        // Leftovers from a previous run mean we never confirmed them.
        let state = if queue.is_empty() {
            Connectivity::Online
        } else {
            Connectivity::Offline
        };
        Self {
            transport,
            baselines: BaselineStore::new(client_id),
            queue,
            state,
        }
    }

    pub fn state(&self) -> Connectivity {
        self.state
    }

    pub fn is_online(&self) -> bool {
        self.state == Connectivity::Online
    }

    pub fn baselines(&self) -> &BaselineStore {
        &self.baselines
    }

    pub fn baselines_mut(&mut self) -> &mut BaselineStore {
        &mut self.baselines
    }

    pub fn queue(&self) -> &OfflineQueue {
        &self.queue
    }

    pub fn go_offline(&mut self) {
        if self.state == Connectivity::Online {
            warn!("Switching to offline mode");
            self.state = Connectivity::Offline;
        }
    }

    /// Adopt a server document as the confirmed state, e.g. after opening it.
    pub async fn open(&mut self, document_id: &str) -> Result<Document, SyncError> {
        let document = self
            .transport
            .fetch_document(document_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("document {}", document_id)))?;
        self.baselines.confirm_document(&document);
        Ok(document)
    }

    /// Save local content for a document.
    pub async fn save_local(
        &mut self,
        document_id: &str,
        title: &str,
        content: &str,
    ) -> Result<SaveOutcome, SyncError> {
        // Earlier changes still queued must reach the server first.
        if self.is_online() && self.queue.is_empty() {
            let local = Version::new(title, content, Utc::now());
            match push_update(self.transport.as_ref(), &mut self.baselines, document_id, &local)
                .await
            {
                Ok(outcome) => return Ok(SaveOutcome::Synced(outcome)),
                Err(e) if e.is_network() => self.go_offline(),
                Err(e) => return Err(e),
            }
        }
        let id = self.queue.enqueue_update(document_id, title, content).await?;
        Ok(SaveOutcome::Queued(id))
    }

    pub async fn create_local(&mut self, title: &str, content: &str) -> Result<CreateOutcome, SyncError> {
        if self.is_online() && self.queue.is_empty() {
            match self.transport.create_document(title, content).await {
                Ok(document) => {
                    self.baselines.confirm_document(&document);
                    return Ok(CreateOutcome::Created(document));
                }
                Err(e) if e.is_network() => self.go_offline(),
                Err(e) => return Err(e),
            }
        }
        let temp_id = self.queue.enqueue_create(title, content).await?;
        Ok(CreateOutcome::Queued(temp_id))
    }

    /// Delete a document; returns whether it reached the server now.
    pub async fn delete_local(&mut self, document_id: &str) -> Result<bool, SyncError> {
        if self.is_online() && self.queue.is_empty() {
            match self.transport.delete_document(document_id).await {
                Ok(()) => {
                    self.baselines.remove(document_id);
                    return Ok(true);
                }
                Err(e) if e.is_network() => self.go_offline(),
                Err(e) => return Err(e),
            }
        }
        self.queue.enqueue_delete(document_id).await?;
        Ok(false)
    }

    /// Replay queued changes. A halted replay leaves the client offline.
    pub async fn reconnect(&mut self) -> Result<ReplayReport, SyncError> {
        info!("Reconnecting with {} queued changes", self.queue.len());
        let report = self
            .queue
            .replay(self.transport.as_ref(), &mut self.baselines)
            .await?;
        self.state = if report.halted {
            Connectivity::Offline
        } else {
            Connectivity::Online
        };
        Ok(report)
    }

    pub async fn resolve_conflict(
        &mut self,
        report: &ConflictReport,
        strategy: ResolutionStrategy,
    ) -> Result<SyncOutcome, SyncError> {
        apply_resolution(self.transport.as_ref(), &mut self.baselines, report, strategy).await
    }

    /// Track save confirmations from the live channel.
    ///
    /// Returns true when the event moved a baseline.
    pub fn on_server_event(&mut self, event: &ServerEvent) -> bool {
        match event {
            ServerEvent::BatchSaved {
                document_id,
                content_hash,
                updated_at,
                ..
            } => {
                self.baselines
                    .confirm(document_id, content_hash.clone(), *updated_at);
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryTransport;
    use notesync_core::fingerprint;

    fn client(transport: &Arc<MemoryTransport>) -> SyncClient {
        SyncClient::new("device-1", transport.clone(), OfflineQueue::in_memory())
    }

    #[tokio::test]
    async fn test_online_save_pushes() {
        let transport = Arc::new(MemoryTransport::new());
        transport.seed("note-1", "T", "a");
        let mut client = client(&transport);
        client.open("note-1").await.unwrap();

        let outcome = client.save_local("note-1", "T", "ab").await.unwrap();
        assert!(matches!(outcome, SaveOutcome::Synced(SyncOutcome::Pushed(_))));
        assert!(client.queue().is_empty());
    }

    #[tokio::test]
    async fn test_network_error_flips_offline_and_queues() {
        let transport = Arc::new(MemoryTransport::new());
        transport.seed("note-1", "T", "a");
        let mut client = client(&transport);
        client.open("note-1").await.unwrap();

        transport.set_offline(true);
        let outcome = client.save_local("note-1", "T", "ab").await.unwrap();
        assert!(matches!(outcome, SaveOutcome::Queued(_)));
        assert_eq!(client.state(), Connectivity::Offline);

        let created = client.create_local("New", "x").await.unwrap();
        let CreateOutcome::Queued(temp) = created else {
            panic!("expected queued create");
        };
        client.save_local(&temp, "New", "xy").await.unwrap();
        assert_eq!(client.queue().len(), 3);

        let report = client.reconnect().await.unwrap();
        assert!(report.halted);
        assert_eq!(client.state(), Connectivity::Offline);

        transport.set_offline(false);
        let report = client.reconnect().await.unwrap();
        assert_eq!(report.applied, 3);
        assert!(client.is_online());
        assert_eq!(transport.document("note-1").unwrap().content, "ab");
        assert_eq!(transport.document("srv-1").unwrap().content, "xy");
    }

    #[tokio::test]
    async fn test_validation_error_is_not_offline() {
        let transport = Arc::new(MemoryTransport::new());
        let mut client = client(&transport);

        let err = client.create_local("", "x").await.unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
        assert!(client.is_online());
        assert!(client.queue().is_empty());
    }

    #[tokio::test]
    async fn test_batch_saved_moves_baseline() {
        let transport = Arc::new(MemoryTransport::new());
        let mut client = client(&transport);
        let hash = fingerprint("T", "server");

        let moved = client.on_server_event(&ServerEvent::BatchSaved {
            document_id: "note-1".into(),
            title: "T".into(),
            content: "server".into(),
            content_hash: hash.clone(),
            updated_at: Utc::now(),
            update_count: 2,
        });
        assert!(moved);
        assert_eq!(client.baselines().hash("note-1"), Some(&hash));
        assert!(!client.on_server_event(&ServerEvent::error("x", "y", None)));
    }

    #[tokio::test]
    async fn test_offline_delete_replays() {
        let transport = Arc::new(MemoryTransport::new());
        transport.seed("note-1", "T", "a");
        let mut client = client(&transport);
        client.go_offline();

        assert!(!client.delete_local("note-1").await.unwrap());
        client.reconnect().await.unwrap();
        assert!(transport.document("note-1").is_none());
    }
}
