use async_trait::async_trait;
use chrono::{DateTime, Utc};
use notesync_core::{Document, SyncError};
use serde::{Deserialize, Serialize};

/// Result of a lock extension request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockStatus {
    pub extended: bool,
    /// Why the extension was refused (`not_held`, `expired`, `not_owner`).
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Port onto the document CRUD / sync server.
///
/// Implementations report connectivity problems as `SyncError::Network`;
/// that is what moves a client into offline mode.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Create a document; the server assigns its id.
    async fn create_document(&self, title: &str, content: &str) -> Result<Document, SyncError>;

    /// Replace a document's title and content. Returns the stored document.
    async fn update_document(
        &self,
        document_id: &str,
        title: &str,
        content: &str,
    ) -> Result<Document, SyncError>;

    async fn delete_document(&self, document_id: &str) -> Result<(), SyncError>;

    async fn fetch_document(&self, document_id: &str) -> Result<Option<Document>, SyncError>;

    /// Extend the caller's edit lock on a document.
    async fn extend_lock(&self, document_id: &str) -> Result<LockStatus, SyncError>;
}
