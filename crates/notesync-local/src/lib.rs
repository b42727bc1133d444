//! In-process and filesystem backends for notesync.
//!
//! The memory stores double as the degraded fallback when the shared store is
//! unreachable; the file stores give a single-node deployment durable locks
//! and documents.

mod document;
mod fs;
mod lock;
mod presence;

pub use document::{FileDocumentStore, MemoryDocumentStore};
pub use fs::{validate_id, write_atomic};
pub use lock::{FileLockStore, MemoryLockStore};
pub use presence::MemoryPresenceStore;
