use std::path::{Path, PathBuf};

use async_trait::async_trait;
use notesync_core::{EditLock, LockStore, SyncError};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::fs::{read_optional, remove_optional, validate_id, write_atomic};

/// File-backed lock store.
///
/// One JSON record per document at `{base_dir}/locks/{document_id}.lock`,
/// written atomically. Conditional writes are serialized by a process-wide
/// mutex: this makes `put_if` atomic for every request served by this
/// process, but two processes sharing the directory are not coordinated.
#[derive(Debug)]
pub struct FileLockStore {
    base_dir: PathBuf,
    write_guard: Mutex<()>,
}

impl FileLockStore {
    /// Create a new FileLockStore with the given base directory.
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            write_guard: Mutex::new(()),
        }
    }

    fn locks_dir(&self) -> PathBuf {
        self.base_dir.join("locks")
    }

    fn lock_path(&self, document_id: &str) -> Result<PathBuf, SyncError> {
        validate_id(document_id)?;
        Ok(self.locks_dir().join(format!("{}.lock", document_id)))
    }

    async fn read(&self, path: &Path) -> Result<Option<EditLock>, SyncError> {
        match read_optional(path).await? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl LockStore for FileLockStore {
    fn backend_name(&self) -> &'static str {
        "file"
    }

    #[instrument(skip(self), level = "debug")]
    async fn get(&self, document_id: &str) -> Result<Option<EditLock>, SyncError> {
        let path = self.lock_path(document_id)?;
        self.read(&path).await
    }

    #[instrument(skip(self, expected, lock), level = "debug", fields(document_id = %lock.document_id))]
    async fn put_if(
        &self,
        expected: Option<&EditLock>,
        lock: &EditLock,
    ) -> Result<bool, SyncError> {
        let path = self.lock_path(&lock.document_id)?;
        let _guard = self.write_guard.lock().await;

        let current = self.read(&path).await?;
        if current.as_ref() != expected {
            debug!("Conditional lock write on {} lost", lock.document_id);
            return Ok(false);
        }

        let data = serde_json::to_vec(lock)?;
        write_atomic(&path, &data).await?;
        Ok(true)
    }

    #[instrument(skip(self, expected), level = "debug", fields(document_id = %expected.document_id))]
    async fn delete_if(&self, expected: &EditLock) -> Result<bool, SyncError> {
        let path = self.lock_path(&expected.document_id)?;
        let _guard = self.write_guard.lock().await;

        if self.read(&path).await?.as_ref() != Some(expected) {
            return Ok(false);
        }
        remove_optional(&path).await
    }

    async fn list(&self) -> Result<Vec<EditLock>, SyncError> {
        let dir = self.locks_dir();
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(SyncError::Persistence(format!(
                    "Failed to list {}: {}",
                    dir.display(),
                    e
                )))
            }
        };

        let mut locks = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| SyncError::Persistence(format!("Failed to list {}: {}", dir.display(), e)))?
        {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("lock") {
                continue;
            }
            match self.read(&path).await {
                Ok(Some(lock)) => locks.push(lock),
                Ok(None) => {}
                Err(e) => warn!("Skipping unreadable lock record {}: {}", path.display(), e),
            }
        }
        Ok(locks)
    }
}
