//! notesync server.
//!
//! Serves edit locks, presence, the persistent channel and batched saves
//! over HTTP/WebSocket. Open batches are flushed before exit.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use notesync_core::{
    AllowAll, Clock, FailoverLockStore, FailoverPresenceStore, LockStore, PresenceStore,
    SystemClock,
};
use notesync_kv::{KvClient, KvLockStore, KvPresenceStore};
use notesync_local::{FileDocumentStore, FileLockStore, MemoryLockStore, MemoryPresenceStore};
use notesync_server::{router, spawn_sweeper, AppState, Backends, Config, LockBackend, PresenceBackend};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch as tokio_watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    config.validate()?;

    info!("Starting notesync-server v{}", env!("CARGO_PKG_VERSION"));
    info!("  Host: {}", config.host);
    info!("  Port: {}", config.port);
    info!("  Lock backend: {}", config.lock_backend);
    info!("  Presence backend: {}", config.presence_backend);

    let dir = config.effective_data_dir();
    info!("  Data dir: {}", dir.display());

    let kv_client = config.kv_credentials().map(|(account_id, namespace_id, api_token)| {
        Arc::new(KvClient::new(account_id, namespace_id, api_token.to_string()))
    });

    let locks: Arc<dyn LockStore> = match (config.lock_backend, &kv_client) {
        (LockBackend::File, _) => Arc::new(FileLockStore::new(&dir)),
        (LockBackend::Memory, _) => Arc::new(MemoryLockStore::new()),
        (LockBackend::Kv, Some(kv)) => {
            info!("  Lock fallback: memory");
            Arc::new(FailoverLockStore::new(
                Arc::new(KvLockStore::new(kv.clone())),
                Arc::new(MemoryLockStore::new()),
            ))
        }
        (LockBackend::Kv, None) => anyhow::bail!("kv lock backend requires KV credentials"),
    };

    let presence_config = config.presence_config();
    let presence: Arc<dyn PresenceStore> = match (config.presence_backend, &kv_client) {
        (PresenceBackend::Memory, _) => Arc::new(MemoryPresenceStore::new()),
        (PresenceBackend::Kv, Some(kv)) => {
            info!("  Presence fallback: memory");
            Arc::new(FailoverPresenceStore::new(
                Arc::new(KvPresenceStore::new(kv.clone(), presence_config.entry_ttl)),
                Arc::new(MemoryPresenceStore::new()),
            ))
        }
        (PresenceBackend::Kv, None) => {
            anyhow::bail!("kv presence backend requires KV credentials")
        }
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let state = AppState::new(
        Backends {
            locks,
            presence,
            documents: Arc::new(FileDocumentStore::new(&dir)),
            access: Arc::new(AllowAll),
            clock,
        },
        config.lock_policy(),
        presence_config,
        config.batch_config(),
    );

    let shutdown_rx = create_shutdown_signal();

    let sweeper = (config.sweep_secs > 0).then(|| {
        info!("  Sweep every {}s", config.sweep_secs);
        spawn_sweeper(
            state.locks.clone(),
            state.presence.clone(),
            Duration::from_secs(config.sweep_secs),
            shutdown_rx.clone(),
        )
    });

    let batches = state.batches.clone();
    let app = router(state);

    // Bind and serve
    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("Listening on http://{}", addr);

    let mut server_shutdown = shutdown_rx.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = server_shutdown.wait_for(|&v| v).await;
        })
        .await?;

    info!("Flushing open batches");
    batches.shutdown().await;
    if let Some(sweeper) = sweeper {
        if let Err(e) = sweeper.await {
            warn!("Sweeper ended abnormally: {}", e);
        }
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Create a shutdown signal that triggers on Ctrl+C or SIGTERM.
fn create_shutdown_signal() -> tokio_watch::Receiver<bool> {
    let (tx, rx) = tokio_watch::channel(false);

    tokio::spawn(async move {
        let ctrl_c = async {
            signal::ctrl_c()
                .await
                .expect("Failed to install Ctrl+C handler");
            info!("Received Ctrl+C, initiating shutdown");
        };

        #[cfg(unix)]
        let terminate = async {
            signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("Failed to install SIGTERM handler")
                .recv()
                .await;
            info!("Received SIGTERM, initiating shutdown");
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }

        let _ = tx.send(true);
    });

    rx
}
