#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use notesync_client::{LockStatus, SyncTransport};
use notesync_core::{
    AllowAll, Document, Edit, ExtendOutcome, LockPolicy, PresenceConfig,
    SyncError, SystemClock,
};
use notesync_local::{MemoryDocumentStore, MemoryLockStore, MemoryPresenceStore};
use notesync_server::{router, AppState, Backends, BatchConfig};
use tokio::net::TcpListener;

/// Server state over memory stores with one seeded document.
pub fn state_with(id: &str, title: &str, content: &str) -> AppState {
    let documents = Arc::new(MemoryDocumentStore::new());
    documents.insert(Document::new(id, title, content, Utc::now()));
    AppState::new(
        Backends {
            locks: Arc::new(MemoryLockStore::new()),
            presence: Arc::new(MemoryPresenceStore::new()),
            documents,
            access: Arc::new(AllowAll),
            clock: Arc::new(SystemClock),
        },
        LockPolicy::default(),
        PresenceConfig::default(),
        BatchConfig {
            quiet_period: Duration::from_millis(50),
            ..BatchConfig::default()
        },
    )
}

/// Serve the router on an ephemeral port; returns the base URL.
pub async fn spawn_server(state: AppState) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router(state)).await.unwrap();
    });
    format!("http://{}", addr)
}

/// Client transport that talks to the server state in-process.
///
/// Updates go through the batch aggregator and are flushed immediately, so
/// the returned document is what the server persisted.
pub struct LoopbackTransport {
    pub state: AppState,
    pub user_id: String,
}

impl LoopbackTransport {
    pub fn new(state: &AppState, user_id: &str) -> Arc<Self> {
        Arc::new(Self {
            state: state.clone(),
            user_id: user_id.to_string(),
        })
    }
}

#[async_trait]
impl SyncTransport for LoopbackTransport {
    async fn create_document(&self, title: &str, content: &str) -> Result<Document, SyncError> {
        self.state.documents.create(title, content).await
    }

    async fn update_document(
        &self,
        document_id: &str,
        title: &str,
        content: &str,
    ) -> Result<Document, SyncError> {
        self.state
            .batches
            .submit(
                document_id,
                &self.user_id,
                Some(title.to_string()),
                Edit::Full {
                    content: content.to_string(),
                },
            )
            .await?;
        self.state.batches.flush(document_id).await?;
        self.state
            .documents
            .load(document_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(document_id.to_string()))
    }

    async fn delete_document(&self, document_id: &str) -> Result<(), SyncError> {
        if self.state.documents.delete(document_id).await? {
            Ok(())
        } else {
            Err(SyncError::NotFound(document_id.to_string()))
        }
    }

    async fn fetch_document(&self, document_id: &str) -> Result<Option<Document>, SyncError> {
        self.state.documents.load(document_id).await
    }

    async fn extend_lock(&self, document_id: &str) -> Result<LockStatus, SyncError> {
        Ok(match self.state.locks.extend(document_id, &self.user_id, None).await? {
            ExtendOutcome::Extended(lock) => LockStatus {
                extended: true,
                reason: None,
                expires_at: Some(lock.expires_at),
            },
            ExtendOutcome::Rejected(rejection) => LockStatus {
                extended: false,
                reason: Some(rejection.reason().to_string()),
                expires_at: None,
            },
        })
    }
}
