use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use notesync_core::{EditLock, LockStore, SyncError};
use tracing::{debug, instrument, warn};

use crate::client::KvClient;

/// Grace period the KV entry outlives the lock, so lazy expiry sees the record.
const EXPIRY_SLACK: Duration = Duration::from_secs(60);

/// KV-based shared lock store.
///
/// Lock keys: `lock:{document_id}`.
///
/// The KV API has no compare-and-swap, so `put_if` is a read, a compare and a
/// write. Two servers acquiring the same document within one round trip can
/// both observe the old record and both write; the last write wins and the
/// other caller believes it holds the lock until its next extend is rejected.
/// KV is also eventually consistent across regions, which widens the window.
pub struct KvLockStore {
    kv_client: Arc<KvClient>,
}

impl KvLockStore {
    pub fn new(kv_client: Arc<KvClient>) -> Self {
        Self { kv_client }
    }

    fn lock_key(document_id: &str) -> String {
        format!("lock:{}", document_id)
    }

    fn decode(key: &str, raw: &str) -> Option<EditLock> {
        match serde_json::from_str(raw) {
            Ok(lock) => Some(lock),
            Err(e) => {
                warn!("Ignoring malformed lock record {}: {}", key, e);
                None
            }
        }
    }
}

#[async_trait]
impl LockStore for KvLockStore {
    fn backend_name(&self) -> &'static str {
        "kv"
    }

    #[instrument(skip(self), level = "debug")]
    async fn get(&self, document_id: &str) -> Result<Option<EditLock>, SyncError> {
        let key = Self::lock_key(document_id);
        Ok(self
            .kv_client
            .get(&key)
            .await?
            .and_then(|raw| Self::decode(&key, &raw)))
    }

    #[instrument(skip(self, expected, lock), level = "debug", fields(document_id = %lock.document_id))]
    async fn put_if(
        &self,
        expected: Option<&EditLock>,
        lock: &EditLock,
    ) -> Result<bool, SyncError> {
        let current = self.get(&lock.document_id).await?;
        if current.as_ref() != expected {
            debug!("Conditional lock write on {} lost", lock.document_id);
            return Ok(false);
        }

        let ttl = lock.ttl().to_std().unwrap_or_default() + EXPIRY_SLACK;
        let value = serde_json::to_string(lock)?;
        self.kv_client
            .put(&Self::lock_key(&lock.document_id), &value, Some(ttl))
            .await?;
        Ok(true)
    }

    #[instrument(skip(self, expected), level = "debug", fields(document_id = %expected.document_id))]
    async fn delete_if(&self, expected: &EditLock) -> Result<bool, SyncError> {
        if self.get(&expected.document_id).await?.as_ref() != Some(expected) {
            return Ok(false);
        }
        self.kv_client
            .delete(&Self::lock_key(&expected.document_id))
            .await
    }

    async fn list(&self) -> Result<Vec<EditLock>, SyncError> {
        let mut locks = Vec::new();
        for key in self.kv_client.list_keys("lock:").await? {
            if let Some(raw) = self.kv_client.get(&key).await? {
                locks.extend(Self::decode(&key, &raw));
            }
        }
        Ok(locks)
    }
}
