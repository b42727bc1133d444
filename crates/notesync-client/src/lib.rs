//! Client side of the notesync synchronization engine.
//!
//! This crate provides:
//! - `SyncTransport`: the port onto the document CRUD / sync server
//! - `BaselineStore`: the last server-confirmed hash per document
//! - `reconcile`: three-way push with conflict reporting
//! - `OfflineQueue`: persisted FIFO of local mutations, replayed on reconnect
//! - `SyncClient`: online/offline routing of local mutations
//! - `LockKeeper`: background edit-lock extension

mod baseline;
mod client;
mod lock_keeper;
mod queue;
pub mod reconcile;
mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use baseline::{BaselineStore, SyncBaseline};
pub use client::{Connectivity, CreateOutcome, SaveOutcome, SyncClient};
pub use lock_keeper::{spawn_lock_keeper, LockKeeper};
pub use queue::{
    is_temp_id, ChangeKind, ChangePayload, DeadLetter, OfflineQueue, PendingChange, ReplayReport,
};
pub use reconcile::{apply_resolution, push_update, SyncOutcome};
pub use transport::{LockStatus, SyncTransport};
