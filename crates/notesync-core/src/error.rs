use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors that can occur anywhere in the synchronization layer.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    #[error("Document {document_id} is being edited by {holder_id} until {expires_at}")]
    LockConflict {
        document_id: String,
        holder_id: String,
        expires_at: DateTime<Utc>,
    },

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Persistence failure: {0}")]
    Persistence(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Connectivity failures flip clients into offline mode.
    pub fn is_network(&self) -> bool {
        matches!(self, SyncError::Network(_))
    }

    /// Failures worth retrying with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Network(_) | SyncError::Persistence(_) | SyncError::RateLimited(_)
        )
    }

    /// Failures meaning the backing store itself is unreachable.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, SyncError::Network(_) | SyncError::Persistence(_))
    }

    /// Stable machine-readable code used on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::LockConflict { .. } => "lock-conflict",
            SyncError::PermissionDenied(_) => "permission-denied",
            SyncError::NotFound(_) => "not-found",
            SyncError::Validation(_) => "validation-error",
            SyncError::Network(_) => "network-error",
            SyncError::Persistence(_) => "persistence-failure",
            SyncError::RateLimited(_) => "rate-limited",
            SyncError::Serialization(_) => "serialization-error",
            SyncError::Internal(_) => "internal-error",
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}
