//! Core traits and types for the notesync synchronization engine.
//!
//! This crate defines the pieces shared between the server, the storage
//! backends and the client:
//! - `fingerprint`: normalized content hashing
//! - `patch`: incremental edits and structural validation
//! - `LockStore` / `LockManager`: advisory per-document edit locks
//! - `PresenceStore` / `PresenceRegistry`: who is editing what
//! - `DocumentStore` / `AccessPolicy`: ports onto the CRUD and permission layers
//! - `conflict`: three-way hash classification and resolution strategies
//! - `event`: the persistent channel vocabulary

mod clock;
pub mod conflict;
mod document;
mod error;
pub mod event;
mod failover;
pub mod fingerprint;
mod lock;
pub mod patch;
mod presence;

pub use clock::{to_chrono, Clock, ManualClock, SystemClock};
pub use conflict::{
    classify, resolve, suggest_strategy, ConflictReport, ResolutionStrategy, SyncDecision, Version,
};
pub use document::{AccessPolicy, AllowAll, Document, DocumentStore};
pub use error::SyncError;
pub use event::{ClientEvent, Edit, PresenceReason, ServerEvent};
pub use failover::{FailoverLockStore, FailoverPresenceStore};
pub use fingerprint::{fingerprint, normalize, ContentHash};
pub use lock::{
    AcquireOutcome, EditLock, ExtendOutcome, ExtendRejection, LockManager, LockPolicy, LockStore,
    ReleaseOutcome,
};
pub use patch::{apply_patches, is_well_formed, Patch, PatchOutcome, SkippedPatch};
pub use presence::{
    recommended_poll_interval, HeartbeatResult, PresenceConfig, PresenceEntry, PresenceInfo,
    PresenceRegistry, PresenceStore,
};
