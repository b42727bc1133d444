use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use notesync_core::{LockPolicy, PresenceConfig, SyncError};

use crate::batch::BatchConfig;

/// Configuration for the notesync server.
#[derive(Parser, Debug, Clone)]
#[command(name = "notesync-server")]
#[command(about = "Real-time document sync server: locks, presence, broadcast and batched saves")]
pub struct Config {
    /// Host to bind to
    #[arg(long, default_value = "0.0.0.0", env = "NOTESYNC_HOST")]
    pub host: String,

    /// Port to bind to
    #[arg(long, default_value = "8080", env = "NOTESYNC_PORT")]
    pub port: u16,

    /// Base directory for documents and file locks
    #[arg(long, env = "NOTESYNC_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Where edit locks live
    #[arg(long, default_value = "file", env = "NOTESYNC_LOCK_BACKEND")]
    pub lock_backend: LockBackend,

    /// Where presence sets live
    #[arg(long, default_value = "memory", env = "NOTESYNC_PRESENCE_BACKEND")]
    pub presence_backend: PresenceBackend,

    /// Cloudflare Account ID (kv backends)
    #[arg(long, env = "CLOUDFLARE_ACCOUNT_ID")]
    pub cloudflare_account_id: Option<String>,

    /// Cloudflare API Token with KV read/write permission
    #[arg(long, env = "CLOUDFLARE_API_TOKEN")]
    pub cloudflare_api_token: Option<String>,

    /// KV namespace ID for locks and presence
    #[arg(long, env = "KV_NAMESPACE_ID")]
    pub kv_namespace_id: Option<String>,

    /// Edit lock TTL in seconds
    #[arg(long, default_value = "120", env = "NOTESYNC_LOCK_TTL_SECS")]
    pub lock_ttl_secs: u64,

    /// How often holders are told to extend their lock, in seconds
    #[arg(long, default_value = "30", env = "NOTESYNC_LOCK_EXTEND_SECS")]
    pub lock_extend_secs: u64,

    /// Absolute lifetime of a presence entry without heartbeat, in seconds
    #[arg(long, default_value = "600", env = "NOTESYNC_PRESENCE_TTL_SECS")]
    pub presence_ttl_secs: u64,

    /// Presence entries unseen for this long are dropped, in seconds
    #[arg(long, default_value = "300", env = "NOTESYNC_PRESENCE_STALE_SECS")]
    pub presence_stale_secs: u64,

    /// Quiet period before a batch is written, in milliseconds
    #[arg(long, default_value = "2000", env = "NOTESYNC_BATCH_QUIET_MS")]
    pub batch_quiet_ms: u64,

    /// Edits per batch before a forced write
    #[arg(long, default_value = "20", env = "NOTESYNC_BATCH_MAX_UPDATES")]
    pub batch_max_updates: usize,

    /// Interval of the expired-lock and stale-presence sweep, in seconds (0 disables it)
    #[arg(long, default_value = "60", env = "NOTESYNC_SWEEP_SECS")]
    pub sweep_secs: u64,
}

impl Config {
    /// Get the effective data directory.
    pub fn effective_data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("notesync")
        })
    }

    pub fn lock_policy(&self) -> LockPolicy {
        LockPolicy {
            ttl: Duration::from_secs(self.lock_ttl_secs),
            extend_interval: Duration::from_secs(self.lock_extend_secs),
        }
    }

    pub fn presence_config(&self) -> PresenceConfig {
        PresenceConfig {
            entry_ttl: Duration::from_secs(self.presence_ttl_secs),
            stale_after: Duration::from_secs(self.presence_stale_secs),
        }
    }

    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig {
            quiet_period: Duration::from_millis(self.batch_quiet_ms),
            max_updates: self.batch_max_updates,
            ..BatchConfig::default()
        }
    }

    /// KV credentials, required when either backend is `kv`.
    pub fn kv_credentials(&self) -> Option<(&str, &str, &str)> {
        Some((
            self.cloudflare_account_id.as_deref()?,
            self.kv_namespace_id.as_deref()?,
            self.cloudflare_api_token.as_deref()?,
        ))
    }

    /// Reject settings that would make the server misbehave at runtime.
    pub fn validate(&self) -> Result<(), SyncError> {
        self.lock_policy().validate()?;

        if self.presence_stale_secs == 0 || self.presence_stale_secs > self.presence_ttl_secs {
            return Err(SyncError::Validation(format!(
                "presence stale threshold ({}s) must be non-zero and at most the entry ttl ({}s)",
                self.presence_stale_secs, self.presence_ttl_secs
            )));
        }
        if self.batch_quiet_ms == 0 || self.batch_max_updates == 0 {
            return Err(SyncError::Validation(
                "batch quiet period and max updates must be non-zero".to_string(),
            ));
        }
        let needs_kv = self.lock_backend == LockBackend::Kv
            || self.presence_backend == PresenceBackend::Kv;
        if needs_kv && self.kv_credentials().is_none() {
            return Err(SyncError::Validation(
                "kv backend requires CLOUDFLARE_ACCOUNT_ID, CLOUDFLARE_API_TOKEN and KV_NAMESPACE_ID"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LockBackend {
    File,
    Memory,
    Kv,
}

impl std::fmt::Display for LockBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockBackend::File => write!(f, "file"),
            LockBackend::Memory => write!(f, "memory"),
            LockBackend::Kv => write!(f, "kv"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum PresenceBackend {
    Memory,
    Kv,
}

impl std::fmt::Display for PresenceBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PresenceBackend::Memory => write!(f, "memory"),
            PresenceBackend::Kv => write!(f, "kv"),
        }
    }
}
