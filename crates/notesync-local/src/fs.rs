use std::path::Path;

use notesync_core::SyncError;
use tokio::fs;

const MAX_ID_LEN: usize = 128;

/// Reject ids that cannot safely become a file name.
pub fn validate_id(id: &str) -> Result<(), SyncError> {
    let valid = !id.is_empty()
        && id.len() <= MAX_ID_LEN
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(SyncError::Validation(format!("invalid id: {:?}", id)))
    }
}

/// Write a file via a sibling temp file and a rename, so readers only ever
/// see the old or the new content.
pub async fn write_atomic(path: &Path, data: &[u8]) -> Result<(), SyncError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await.map_err(|e| {
            SyncError::Persistence(format!(
                "Failed to create directory {}: {}",
                parent.display(),
                e
            ))
        })?;
    }

    let temp_path = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
    fs::write(&temp_path, data).await.map_err(|e| {
        SyncError::Persistence(format!(
            "Failed to write temp file {}: {}",
            temp_path.display(),
            e
        ))
    })?;

    if let Err(e) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(SyncError::Persistence(format!(
            "Failed to rename temp file to {}: {}",
            path.display(),
            e
        )));
    }
    Ok(())
}

/// Read a file, mapping "not found" to `None`.
pub(crate) async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, SyncError> {
    match fs::read(path).await {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(SyncError::Persistence(format!(
            "Failed to read {}: {}",
            path.display(),
            e
        ))),
    }
}

/// Remove a file, returning whether it existed.
pub(crate) async fn remove_optional(path: &Path) -> Result<bool, SyncError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(SyncError::Persistence(format!(
            "Failed to remove {}: {}",
            path.display(),
            e
        ))),
    }
}
