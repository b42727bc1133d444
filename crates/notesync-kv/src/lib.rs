//! Shared lock and presence stores over the Cloudflare KV REST API.

mod client;
mod lock;
mod presence;

pub use client::KvClient;
pub use lock::KvLockStore;
pub use presence::KvPresenceStore;
