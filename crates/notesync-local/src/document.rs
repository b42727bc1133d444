use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use notesync_core::{Document, DocumentStore, SyncError};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::fs::{read_optional, remove_optional, validate_id, write_atomic};

/// File-backed document store.
///
/// Each document is one JSON record holding content and metadata together at
/// `{base_dir}/documents/{id}.json`, so a save can never leave the two out of
/// step.
#[derive(Debug)]
pub struct FileDocumentStore {
    base_dir: PathBuf,
}

impl FileDocumentStore {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
        }
    }

    fn document_path(&self, id: &str) -> Result<PathBuf, SyncError> {
        validate_id(id)?;
        Ok(self.base_dir.join("documents").join(format!("{}.json", id)))
    }
}

#[async_trait]
impl DocumentStore for FileDocumentStore {
    fn backend_name(&self) -> &'static str {
        "file"
    }

    #[instrument(skip(self), level = "debug")]
    async fn load(&self, id: &str) -> Result<Option<Document>, SyncError> {
        let path = self.document_path(id)?;
        match read_optional(&path).await? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => {
                debug!("Document {} not found", id);
                Ok(None)
            }
        }
    }

    #[instrument(skip(self, document), level = "debug", fields(id = %document.id))]
    async fn save(&self, document: &Document) -> Result<(), SyncError> {
        let path = self.document_path(&document.id)?;
        let data = serde_json::to_vec_pretty(document)?;
        write_atomic(&path, &data).await?;
        debug!(
            "Saved document {} ({} bytes, hash {})",
            document.id,
            data.len(),
            document.content_hash
        );
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete(&self, id: &str) -> Result<bool, SyncError> {
        let path = self.document_path(id)?;
        remove_optional(&path).await
    }

    async fn create(&self, title: &str, content: &str) -> Result<Document, SyncError> {
        let document = Document::new(Uuid::new_v4().to_string(), title, content, Utc::now());
        self.save(&document).await?;
        Ok(document)
    }
}

/// In-process document store for tests and ephemeral deployments.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    documents: DashMap<String, Document>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a document directly.
    pub fn insert(&self, document: Document) {
        self.documents.insert(document.id.clone(), document);
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn load(&self, id: &str) -> Result<Option<Document>, SyncError> {
        Ok(self.documents.get(id).map(|doc| doc.clone()))
    }

    async fn save(&self, document: &Document) -> Result<(), SyncError> {
        self.documents.insert(document.id.clone(), document.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool, SyncError> {
        Ok(self.documents.remove(id).is_some())
    }

    async fn create(&self, title: &str, content: &str) -> Result<Document, SyncError> {
        let document = Document::new(Uuid::new_v4().to_string(), title, content, Utc::now());
        self.insert(document.clone());
        Ok(document)
    }
}
