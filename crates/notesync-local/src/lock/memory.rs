use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use notesync_core::{EditLock, LockStore, SyncError};
use tracing::{debug, instrument};

/// In-process lock store.
///
/// `put_if` runs under the map's shard lock, so the conditional write is
/// atomic within the process. Locks are not shared between server instances.
#[derive(Debug, Default)]
pub struct MemoryLockStore {
    locks: DashMap<String, EditLock>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, document_id: &str) -> Result<Option<EditLock>, SyncError> {
        Ok(self.locks.get(document_id).map(|lock| lock.clone()))
    }

    #[instrument(skip(self, expected, lock), level = "debug", fields(document_id = %lock.document_id))]
    async fn put_if(
        &self,
        expected: Option<&EditLock>,
        lock: &EditLock,
    ) -> Result<bool, SyncError> {
        let written = match self.locks.entry(lock.document_id.clone()) {
            Entry::Occupied(mut current) => {
                if Some(current.get()) == expected {
                    current.insert(lock.clone());
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(slot) => {
                if expected.is_none() {
                    slot.insert(lock.clone());
                    true
                } else {
                    false
                }
            }
        };
        if !written {
            debug!("Conditional lock write on {} lost", lock.document_id);
        }
        Ok(written)
    }

    async fn delete_if(&self, expected: &EditLock) -> Result<bool, SyncError> {
        Ok(self
            .locks
            .remove_if(&expected.document_id, |_, current| current == expected)
            .is_some())
    }

    async fn list(&self) -> Result<Vec<EditLock>, SyncError> {
        Ok(self.locks.iter().map(|entry| entry.value().clone()).collect())
    }
}
