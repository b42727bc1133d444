//! Real-time sync server for notesync.
//!
//! This crate provides:
//! - `hub`: per-document channel fan-out for connected sessions
//! - `batch`: per-document actors coalescing edits into periodic saves
//! - `sync_api`: polling and reconnect queries
//! - `handlers` / `ws`: the axum HTTP and WebSocket surface
//! - `sweeper`: background cleanup of expired locks and stale presence

pub mod batch;
pub mod config;
pub mod error;
pub mod handlers;
pub mod hub;
pub mod sweeper;
pub mod sync_api;
pub mod ws;

pub use batch::{BatchAggregator, BatchConfig, SubmitAck};
pub use config::{Config, LockBackend, PresenceBackend};
pub use error::ApiError;
pub use handlers::{router, AppState, Backends};
pub use hub::{BroadcastHub, SessionId};
pub use sweeper::spawn_sweeper;
pub use sync_api::SyncService;
