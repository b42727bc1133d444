use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use notesync_core::{PresenceEntry, PresenceStore, SyncError};
use tracing::{debug, instrument, warn};

use crate::client::KvClient;

type PresenceSet = HashMap<String, PresenceEntry>;

const PRESENCE_PREFIX: &str = "presence:";

/// KV-based shared presence store.
///
/// One key per document, `presence:{document_id}`, holding a JSON map of user
/// id to entry. Every write renews the key's expiry, so a document nobody
/// heartbeats on disappears on its own. Updates are read-modify-write on the
/// whole set; a concurrent update from another server can be overwritten, and
/// the next heartbeat restores it.
pub struct KvPresenceStore {
    kv_client: Arc<KvClient>,
    ttl: Duration,
}

impl KvPresenceStore {
    pub fn new(kv_client: Arc<KvClient>, ttl: Duration) -> Self {
        Self { kv_client, ttl }
    }

    fn presence_key(document_id: &str) -> String {
        format!("{}{}", PRESENCE_PREFIX, document_id)
    }

    async fn load(&self, document_id: &str) -> Result<PresenceSet, SyncError> {
        let key = Self::presence_key(document_id);
        match self.kv_client.get(&key).await? {
            Some(raw) => Ok(serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!("Discarding malformed presence set {}: {}", key, e);
                PresenceSet::new()
            })),
            None => Ok(PresenceSet::new()),
        }
    }

    async fn store(&self, document_id: &str, set: &PresenceSet, ttl: Duration) -> Result<(), SyncError> {
        let key = Self::presence_key(document_id);
        if set.is_empty() {
            self.kv_client.delete(&key).await?;
            return Ok(());
        }
        let value = serde_json::to_string(set)?;
        self.kv_client.put(&key, &value, Some(ttl)).await
    }
}

#[async_trait]
impl PresenceStore for KvPresenceStore {
    fn backend_name(&self) -> &'static str {
        "kv"
    }

    #[instrument(skip(self, entry), level = "debug", fields(document_id = %entry.document_id, user_id = %entry.user_id))]
    async fn upsert(&self, entry: &PresenceEntry, ttl: Duration) -> Result<(), SyncError> {
        let mut set = self.load(&entry.document_id).await?;
        set.insert(entry.user_id.clone(), entry.clone());
        self.store(&entry.document_id, &set, ttl.max(self.ttl)).await
    }

    async fn get(
        &self,
        document_id: &str,
        user_id: &str,
    ) -> Result<Option<PresenceEntry>, SyncError> {
        Ok(self.load(document_id).await?.remove(user_id))
    }

    #[instrument(skip(self), level = "debug")]
    async fn remove(&self, document_id: &str, user_ids: &[String]) -> Result<usize, SyncError> {
        let mut set = self.load(document_id).await?;
        let removed = user_ids.iter().filter(|id| set.remove(*id).is_some()).count();
        if removed > 0 {
            self.store(document_id, &set, self.ttl).await?;
            debug!("Removed {} presence entries from {}", removed, document_id);
        }
        Ok(removed)
    }

    async fn list(&self, document_id: &str) -> Result<Vec<PresenceEntry>, SyncError> {
        Ok(self.load(document_id).await?.into_values().collect())
    }

    async fn documents(&self) -> Result<Vec<String>, SyncError> {
        Ok(self
            .kv_client
            .list_keys(PRESENCE_PREFIX)
            .await?
            .into_iter()
            .filter_map(|key| key.strip_prefix(PRESENCE_PREFIX).map(str::to_string))
            .collect())
    }
}
