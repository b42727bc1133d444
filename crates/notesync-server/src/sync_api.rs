//! Polling and reconnect queries against persisted state.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use notesync_core::{classify, ContentHash, DocumentStore, SyncDecision, SyncError};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

/// Largest document set accepted by one bulk sync.
pub const MAX_BULK_ENTRIES: usize = 500;

/// Answer to an incremental poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatesSince {
    /// Present when the document changed after the requested instant, or
    /// whenever a conflict is flagged so the caller can resolve it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_editor: Option<String>,
    pub content_hash: ContentHash,
    /// Set only when the caller supplied a local hash.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_conflict: Option<bool>,
}

/// What a client believes about one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientDocState {
    pub updated_at: DateTime<Utc>,
    pub content_hash: ContentHash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BulkStatus {
    Unchanged,
    Changed,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkEntry {
    pub status: BulkStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<ContentHash>,
}

/// Read-side queries used by polling clients and on reconnect.
pub struct SyncService {
    documents: Arc<dyn DocumentStore>,
}

impl SyncService {
    pub fn new(documents: Arc<dyn DocumentStore>) -> Self {
        Self { documents }
    }

    /// Changes to a document since `since`.
    ///
    /// With a `baseline_hash` the conflict flag comes from a three-way
    /// classification; without one, a changed document whose server hash
    /// differs from `local_hash` counts as conflicting.
    #[instrument(skip(self), level = "debug")]
    pub async fn fetch_updates_since(
        &self,
        document_id: &str,
        since: DateTime<Utc>,
        local_hash: Option<&ContentHash>,
        baseline_hash: Option<&ContentHash>,
    ) -> Result<UpdatesSince, SyncError> {
        let document = self
            .documents
            .load(document_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("document {}", document_id)))?;

        let changed = document.updated_at > since;
        let has_conflict = local_hash.map(|local| match baseline_hash {
            Some(baseline) => {
                classify(baseline, local, &document.content_hash) == SyncDecision::Conflict
            }
            None => changed && *local != document.content_hash,
        });

        debug!(
            "Updates for {} since {}: changed={}, conflict={:?}",
            document_id, since, changed, has_conflict
        );

        let include = changed || has_conflict == Some(true);
        Ok(UpdatesSince {
            content: include.then(|| document.content.clone()),
            title: include.then(|| document.title.clone()),
            updated_at: document.updated_at,
            last_editor: document.last_editor,
            content_hash: document.content_hash,
            has_conflict,
        })
    }

    /// Compare a client's view of many documents with the server's.
    ///
    /// A document whose load fails is left out of the result; the client
    /// keeps its own view of it until the next sync.
    #[instrument(skip(self, known), level = "debug", fields(count = known.len()))]
    pub async fn bulk_sync(
        &self,
        known: &HashMap<String, ClientDocState>,
    ) -> Result<BTreeMap<String, BulkEntry>, SyncError> {
        if known.len() > MAX_BULK_ENTRIES {
            return Err(SyncError::Validation(format!(
                "bulk sync accepts at most {} documents, got {}",
                MAX_BULK_ENTRIES,
                known.len()
            )));
        }

        let mut result = BTreeMap::new();
        for (document_id, client) in known {
            let loaded = match self.documents.load(document_id).await {
                Ok(loaded) => loaded,
                Err(e) => {
                    warn!("Bulk sync skipped {}: {}", document_id, e);
                    continue;
                }
            };
            let entry = match loaded {
                None => BulkEntry {
                    status: BulkStatus::Deleted,
                    updated_at: None,
                    content_hash: None,
                },
                Some(document) => {
                    let status = if document.content_hash == client.content_hash {
                        BulkStatus::Unchanged
                    } else {
                        BulkStatus::Changed
                    };
                    BulkEntry {
                        status,
                        updated_at: Some(document.updated_at),
                        content_hash: Some(document.content_hash),
                    }
                }
            };
            result.insert(document_id.clone(), entry);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Duration;
    use notesync_core::{fingerprint, Document};
    use notesync_local::MemoryDocumentStore;

    fn setup() -> (SyncService, DateTime<Utc>) {
        let store = Arc::new(MemoryDocumentStore::new());
        let saved_at = Utc::now();
        let mut doc = Document::new("note-1", "Title", "server text", saved_at);
        doc.last_editor = Some("alice".into());
        store.insert(doc);
        (SyncService::new(store), saved_at)
    }

    #[tokio::test]
    async fn test_updates_since_before_change() {
        let (sync, saved_at) = setup();
        let updates = sync
            .fetch_updates_since("note-1", saved_at - Duration::seconds(5), None, None)
            .await
            .unwrap();

        assert_eq!(updates.content.as_deref(), Some("server text"));
        assert_eq!(updates.title.as_deref(), Some("Title"));
        assert_eq!(updates.last_editor.as_deref(), Some("alice"));
        assert_eq!(updates.has_conflict, None);
    }

    #[tokio::test]
    async fn test_updates_since_after_change_omits_content() {
        let (sync, saved_at) = setup();
        let local = fingerprint("Title", "my text");
        let updates = sync
            .fetch_updates_since("note-1", saved_at, Some(&local), None)
            .await
            .unwrap();

        assert!(updates.content.is_none());
        assert!(updates.title.is_none());
        assert_eq!(updates.updated_at, saved_at);
        assert_eq!(updates.has_conflict, Some(false));
    }

    #[tokio::test]
    async fn test_conflict_without_baseline() {
        let (sync, saved_at) = setup();
        let since = saved_at - Duration::seconds(1);

        let stale = fingerprint("Title", "my text");
        let updates = sync.fetch_updates_since("note-1", since, Some(&stale), None).await.unwrap();
        assert_eq!(updates.has_conflict, Some(true));

        let same = fingerprint("Title", "server text");
        let updates = sync.fetch_updates_since("note-1", since, Some(&same), None).await.unwrap();
        assert_eq!(updates.has_conflict, Some(false));
    }

    #[tokio::test]
    async fn test_conflict_with_baseline() {
        let (sync, saved_at) = setup();
        let since = saved_at - Duration::seconds(1);
        let baseline = fingerprint("Title", "original");

        // Only the server moved: accept remote, no conflict.
        let updates = sync
            .fetch_updates_since("note-1", since, Some(&baseline), Some(&baseline))
            .await
            .unwrap();
        assert_eq!(updates.has_conflict, Some(false));

        // Both moved apart.
        let local = fingerprint("Title", "my text");
        let updates = sync
            .fetch_updates_since("note-1", since, Some(&local), Some(&baseline))
            .await
            .unwrap();
        assert_eq!(updates.has_conflict, Some(true));
    }

    #[tokio::test]
    async fn test_conflict_after_last_poll_carries_server_version() {
        let (sync, saved_at) = setup();
        let since = saved_at + Duration::seconds(1);
        let baseline = fingerprint("Title", "base text");
        let local = fingerprint("Title", "local text");

        let updates = sync
            .fetch_updates_since("note-1", since, Some(&local), Some(&baseline))
            .await
            .unwrap();
        assert_eq!(updates.has_conflict, Some(true));
        assert_eq!(updates.content.as_deref(), Some("server text"));
        assert_eq!(updates.title.as_deref(), Some("Title"));
    }

    #[tokio::test]
    async fn test_updates_for_missing_document() {
        let (sync, saved_at) = setup();
        let err = sync.fetch_updates_since("nope", saved_at, None, None).await.unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_bulk_sync_statuses() {
        let (sync, saved_at) = setup();
        let mut known = HashMap::new();
        known.insert(
            "note-1".to_string(),
            ClientDocState {
                updated_at: saved_at,
                content_hash: fingerprint("Title", "server text"),
            },
        );
        known.insert(
            "gone".to_string(),
            ClientDocState {
                updated_at: saved_at,
                content_hash: fingerprint("x", "y"),
            },
        );
        let result = sync.bulk_sync(&known).await.unwrap();
        assert_eq!(result["note-1"].status, BulkStatus::Unchanged);
        assert_eq!(result["gone"].status, BulkStatus::Deleted);
        assert!(result["gone"].content_hash.is_none());

        known.insert(
            "note-1".to_string(),
            ClientDocState {
                updated_at: saved_at - Duration::minutes(1),
                content_hash: fingerprint("Title", "older"),
            },
        );
        let result = sync.bulk_sync(&known).await.unwrap();
        assert_eq!(result["note-1"].status, BulkStatus::Changed);
        assert_eq!(result["note-1"].updated_at, Some(saved_at));
    }

    struct BrokenStore {
        inner: MemoryDocumentStore,
        broken_id: &'static str,
    }

    #[async_trait]
    impl DocumentStore for BrokenStore {
        fn backend_name(&self) -> &'static str {
            "broken"
        }
        async fn load(&self, id: &str) -> Result<Option<Document>, SyncError> {
            if id == self.broken_id {
                return Err(SyncError::Persistence("unreadable record".into()));
            }
            self.inner.load(id).await
        }
        async fn save(&self, document: &Document) -> Result<(), SyncError> {
            self.inner.save(document).await
        }
        async fn delete(&self, id: &str) -> Result<bool, SyncError> {
            self.inner.delete(id).await
        }
        async fn create(&self, title: &str, content: &str) -> Result<Document, SyncError> {
            self.inner.create(title, content).await
        }
    }

    #[tokio::test]
    async fn test_bulk_sync_skips_unreadable_document() {
        let inner = MemoryDocumentStore::new();
        let saved_at = Utc::now();
        inner.insert(Document::new("note-1", "Title", "server text", saved_at));
        let sync = SyncService::new(Arc::new(BrokenStore {
            inner,
            broken_id: "note-2",
        }));

        let known: HashMap<String, ClientDocState> = ["note-1", "note-2"]
            .into_iter()
            .map(|id| {
                (
                    id.to_string(),
                    ClientDocState {
                        updated_at: saved_at,
                        content_hash: fingerprint("Title", "server text"),
                    },
                )
            })
            .collect();

        let result = sync.bulk_sync(&known).await.unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result["note-1"].status, BulkStatus::Unchanged);
        assert!(!result.contains_key("note-2"));
    }

    #[tokio::test]
    async fn test_bulk_sync_limit() {
        let (sync, saved_at) = setup();
        let known: HashMap<String, ClientDocState> = (0..=MAX_BULK_ENTRIES)
            .map(|i| {
                (
                    format!("doc-{}", i),
                    ClientDocState {
                        updated_at: saved_at,
                        content_hash: fingerprint("t", "c"),
                    },
                )
            })
            .collect();
        let err = sync.bulk_sync(&known).await.unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
    }

    #[test]
    fn test_updates_wire_shape() {
        let updates = UpdatesSince {
            content: None,
            title: None,
            updated_at: DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            last_editor: None,
            content_hash: ContentHash::new("abc"),
            has_conflict: Some(true),
        };
        let json = serde_json::to_value(&updates).unwrap();
        assert_eq!(json["hasConflict"], true);
        assert_eq!(json["contentHash"], "abc");
        assert!(json.get("content").is_none());
    }
}
