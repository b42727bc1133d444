use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::fingerprint::{fingerprint, ContentHash};

/// A stored note as the sync layer sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: String,
    pub title: String,
    pub content: String,
    pub content_hash: ContentHash,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_editor: Option<String>,
    /// Ids of copies that mirror this document's content.
    #[serde(default)]
    pub shared_copies: Vec<String>,
    #[serde(default)]
    pub image_refs: Vec<String>,
    #[serde(default)]
    pub is_shared: bool,
}

impl Document {
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        content: impl Into<String>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        let title = title.into();
        let content = content.into();
        Self {
            id: id.into(),
            content_hash: fingerprint(&title, &content),
            title,
            content,
            updated_at,
            last_editor: None,
            shared_copies: Vec::new(),
            image_refs: Vec::new(),
            is_shared: false,
        }
    }

    /// Recompute the fingerprint after title or content changed.
    pub fn refresh_hash(&mut self) {
        self.content_hash = fingerprint(&self.title, &self.content);
    }
}

/// Port onto the external document persistence layer.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Returns the backend identifier (e.g., "memory", "file").
    fn backend_name(&self) -> &'static str;

    async fn load(&self, id: &str) -> Result<Option<Document>, SyncError>;

    /// Persist title, content and metadata as one atomic write.
    async fn save(&self, document: &Document) -> Result<(), SyncError>;

    /// Remove a document. Returns whether it existed.
    async fn delete(&self, id: &str) -> Result<bool, SyncError>;

    /// Create a document under a fresh id and return it.
    async fn create(&self, title: &str, content: &str) -> Result<Document, SyncError>;
}

/// Port onto the external permission layer.
#[async_trait]
pub trait AccessPolicy: Send + Sync {
    async fn can_edit(&self, document_id: &str, user_id: &str) -> Result<bool, SyncError>;
}

/// Permits every edit.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl AccessPolicy for AllowAll {
    async fn can_edit(&self, _document_id: &str, _user_id: &str) -> Result<bool, SyncError> {
        Ok(true)
    }
}
