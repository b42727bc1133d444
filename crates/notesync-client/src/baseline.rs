//! Sync baselines: the hash a client last saw confirmed by the server.
//!
//! A baseline only moves forward on a server confirmation (a fetched or
//! returned `Document`, or a `batch-saved` event). Local edits never touch it.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use notesync_core::{ContentHash, Document};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncBaseline {
    pub document_id: String,
    pub client_id: String,
    pub last_known_hash: ContentHash,
    pub last_synced_at: DateTime<Utc>,
}

/// Baselines of one client, keyed by document id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BaselineStore {
    client_id: String,
    baselines: HashMap<String, SyncBaseline>,
}

impl BaselineStore {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            baselines: HashMap::new(),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn get(&self, document_id: &str) -> Option<&SyncBaseline> {
        self.baselines.get(document_id)
    }

    pub fn hash(&self, document_id: &str) -> Option<&ContentHash> {
        self.get(document_id).map(|b| &b.last_known_hash)
    }

    /// Record a server-confirmed state.
    pub fn confirm(&mut self, document_id: &str, hash: ContentHash, synced_at: DateTime<Utc>) {
        debug!("Baseline for {} confirmed at {}", document_id, hash);
        self.baselines.insert(
            document_id.to_string(),
            SyncBaseline {
                document_id: document_id.to_string(),
                client_id: self.client_id.clone(),
                last_known_hash: hash,
                last_synced_at: synced_at,
            },
        );
    }

    /// Record the state of a document the server just returned.
    pub fn confirm_document(&mut self, document: &Document) {
        self.confirm(&document.id, document.content_hash.clone(), document.updated_at);
    }

    pub fn remove(&mut self, document_id: &str) -> Option<SyncBaseline> {
        self.baselines.remove(document_id)
    }

    /// Move a baseline from a temporary id to the server-assigned one.
    pub fn rename(&mut self, from: &str, to: &str) {
        if let Some(mut baseline) = self.baselines.remove(from) {
            baseline.document_id = to.to_string();
            self.baselines.insert(to.to_string(), baseline);
        }
    }

    pub fn len(&self) -> usize {
        self.baselines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.baselines.is_empty()
    }
}
