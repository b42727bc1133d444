//! In-memory transport for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use notesync_core::{Document, SyncError};

use crate::transport::{LockStatus, SyncTransport};

/// Server double. Creating a document with an empty title fails validation.
#[derive(Default)]
pub(crate) struct MemoryTransport {
    documents: Mutex<HashMap<String, Document>>,
    offline: AtomicBool,
    next_id: AtomicUsize,
    lock_replies: Mutex<VecDeque<Result<LockStatus, SyncError>>>,
    pub(crate) lock_calls: AtomicUsize,
}

impl MemoryTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn seed(&self, id: &str, title: &str, content: &str) -> Document {
        let doc = Document::new(id, title, content, Utc::now());
        self.documents.lock().unwrap().insert(id.to_string(), doc.clone());
        doc
    }

    pub(crate) fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub(crate) fn document(&self, id: &str) -> Option<Document> {
        self.documents.lock().unwrap().get(id).cloned()
    }

    pub(crate) fn document_count(&self) -> usize {
        self.documents.lock().unwrap().len()
    }

    pub(crate) fn script_lock_reply(&self, reply: Result<LockStatus, SyncError>) {
        self.lock_replies.lock().unwrap().push_back(reply);
    }

    fn check_online(&self) -> Result<(), SyncError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(SyncError::Network("connection refused".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SyncTransport for MemoryTransport {
    async fn create_document(&self, title: &str, content: &str) -> Result<Document, SyncError> {
        self.check_online()?;
        if title.is_empty() {
            return Err(SyncError::Validation("title required".into()));
        }
        let id = format!("srv-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        Ok(self.seed(&id, title, content))
    }

    async fn update_document(
        &self,
        document_id: &str,
        title: &str,
        content: &str,
    ) -> Result<Document, SyncError> {
        self.check_online()?;
        let mut documents = self.documents.lock().unwrap();
        let doc = documents
            .get_mut(document_id)
            .ok_or_else(|| SyncError::NotFound(document_id.to_string()))?;
        doc.title = title.to_string();
        doc.content = content.to_string();
        doc.updated_at = Utc::now();
        doc.refresh_hash();
        Ok(doc.clone())
    }

    async fn delete_document(&self, document_id: &str) -> Result<(), SyncError> {
        self.check_online()?;
        self.documents
            .lock()
            .unwrap()
            .remove(document_id)
            .map(|_| ())
            .ok_or_else(|| SyncError::NotFound(document_id.to_string()))
    }

    async fn fetch_document(&self, document_id: &str) -> Result<Option<Document>, SyncError> {
        self.check_online()?;
        Ok(self.document(document_id))
    }

    async fn extend_lock(&self, _document_id: &str) -> Result<LockStatus, SyncError> {
        self.lock_calls.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        self.lock_replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(LockStatus {
                extended: true,
                reason: None,
                expires_at: Some(Utc::now()),
            }))
    }
}
