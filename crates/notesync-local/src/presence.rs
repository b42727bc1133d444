use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use notesync_core::{PresenceEntry, PresenceStore, SyncError};
use tracing::{debug, instrument};

/// In-process presence store, also the degraded fallback for the shared one.
///
/// Entries are kept until removed; freshness is judged by the registry on
/// every read, which also removes what has gone stale. Documents nobody
/// reads again are cleared by `PresenceRegistry::sweep`.
#[derive(Debug, Default)]
pub struct MemoryPresenceStore {
    sets: DashMap<String, HashMap<String, PresenceEntry>>,
}

impl MemoryPresenceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PresenceStore for MemoryPresenceStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    #[instrument(skip(self, entry), level = "debug", fields(document_id = %entry.document_id, user_id = %entry.user_id))]
    async fn upsert(&self, entry: &PresenceEntry, _ttl: Duration) -> Result<(), SyncError> {
        self.sets
            .entry(entry.document_id.clone())
            .or_default()
            .insert(entry.user_id.clone(), entry.clone());
        Ok(())
    }

    async fn get(
        &self,
        document_id: &str,
        user_id: &str,
    ) -> Result<Option<PresenceEntry>, SyncError> {
        Ok(self
            .sets
            .get(document_id)
            .and_then(|set| set.get(user_id).cloned()))
    }

    async fn remove(&self, document_id: &str, user_ids: &[String]) -> Result<usize, SyncError> {
        let removed = match self.sets.get_mut(document_id) {
            Some(mut set) => user_ids.iter().filter(|id| set.remove(*id).is_some()).count(),
            None => 0,
        };
        // Drop the empty set so abandoned documents do not accumulate.
        if self.sets.remove_if(document_id, |_, set| set.is_empty()).is_some() {
            debug!("Presence set for {} is empty, dropped", document_id);
        }
        Ok(removed)
    }

    async fn list(&self, document_id: &str) -> Result<Vec<PresenceEntry>, SyncError> {
        Ok(self
            .sets
            .get(document_id)
            .map(|set| set.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn documents(&self) -> Result<Vec<String>, SyncError> {
        Ok(self.sets.iter().map(|set| set.key().clone()).collect())
    }
}
