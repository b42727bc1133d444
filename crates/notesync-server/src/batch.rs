//! Diff batching.
//!
//! Every document with pending edits gets one actor task. The actor owns the
//! accumulated content and its own flush deadline, so submissions for one
//! document are applied strictly in arrival order and flushes never overlap.
//! Actors retire after a quiet spell with nothing pending and are respawned
//! on the next submission.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use notesync_core::{
    apply_patches, is_well_formed, Clock, Document, DocumentStore, Edit, ServerEvent,
    SyncError,
};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, error, info, instrument, warn};

use crate::hub::BroadcastHub;

/// How long an actor with nothing pending lingers before retiring.
const IDLE_RETIRE_AFTER: Duration = Duration::from_secs(60);

static ACTOR_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    /// Debounce window: a batch is written once edits stop for this long.
    pub quiet_period: Duration,
    /// A batch reaching this many edits is written immediately.
    pub max_updates: usize,
    /// First retry delay after a failed write; doubles per failure.
    pub retry_base: Duration,
    pub retry_cap: Duration,
    /// Consecutive failures before contributors are told saving is degraded.
    pub degraded_after: u32,
    /// Pending commands per document before submissions are refused.
    pub mailbox: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            quiet_period: Duration::from_millis(2000),
            max_updates: 20,
            retry_base: Duration::from_millis(500),
            retry_cap: Duration::from_secs(30),
            degraded_after: 3,
            mailbox: 256,
        }
    }
}

impl BatchConfig {
    fn retry_delay(&self, failures: u32) -> Duration {
        let factor = 1u32.checked_shl(failures.saturating_sub(1)).unwrap_or(u32::MAX);
        self.retry_base.saturating_mul(factor).min(self.retry_cap)
    }
}

/// Acknowledgement of one accepted submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitAck {
    pub document_id: String,
    pub applied: usize,
    pub skipped: usize,
    /// Edits in the batch so far, this one included.
    pub update_count: usize,
    /// Whether this submission triggered an immediate write.
    pub flushed: bool,
    /// Accumulated content after this submission.
    pub content: String,
}

enum BatchCommand {
    Submit {
        user_id: String,
        title: Option<String>,
        edit: Edit,
        reply: oneshot::Sender<Result<SubmitAck, SyncError>>,
    },
    Flush {
        reply: oneshot::Sender<Result<(), SyncError>>,
    },
}

struct ActorHandle {
    id: u64,
    sender: mpsc::Sender<BatchCommand>,
}

type ActorMap = Arc<DashMap<String, ActorHandle>>;

/// Coalesces edits into periodic atomic writes.
#[derive(Clone)]
pub struct BatchAggregator {
    store: Arc<dyn DocumentStore>,
    hub: Arc<BroadcastHub>,
    clock: Arc<dyn Clock>,
    config: BatchConfig,
    actors: ActorMap,
}

impl BatchAggregator {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        hub: Arc<BroadcastHub>,
        clock: Arc<dyn Clock>,
        config: BatchConfig,
    ) -> Self {
        Self {
            store,
            hub,
            clock,
            config,
            actors: Arc::new(DashMap::new()),
        }
    }

    pub fn config(&self) -> BatchConfig {
        self.config
    }

    /// Number of live document actors.
    pub fn active_documents(&self) -> usize {
        self.actors.len()
    }

    /// Queue an edit for a document.
    ///
    /// Resolves once the edit is applied to the in-memory batch (not once it
    /// is persisted). A submission that would break the markup is refused as
    /// a whole with `Validation`.
    pub async fn submit(
        &self,
        document_id: &str,
        user_id: &str,
        title: Option<String>,
        edit: Edit,
    ) -> Result<SubmitAck, SyncError> {
        let (reply, response) = oneshot::channel();
        self.dispatch(
            document_id,
            BatchCommand::Submit {
                user_id: user_id.to_string(),
                title,
                edit,
                reply,
            },
        )?;
        response
            .await
            .map_err(|_| SyncError::Internal(format!("batch actor for {} stopped", document_id)))?
    }

    /// Write a document's pending batch now.
    pub async fn flush(&self, document_id: &str) -> Result<(), SyncError> {
        if !self.actors.contains_key(document_id) {
            return Ok(());
        }
        let (reply, response) = oneshot::channel();
        self.dispatch(document_id, BatchCommand::Flush { reply })?;
        response
            .await
            .map_err(|_| SyncError::Internal(format!("batch actor for {} stopped", document_id)))?
    }

    /// Flush every open batch; returns how many documents failed to save.
    pub async fn flush_all(&self) -> usize {
        let targets: Vec<(String, mpsc::Sender<BatchCommand>)> = self
            .actors
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().sender.clone()))
            .collect();

        let mut failed = 0;
        for (document_id, sender) in targets {
            let (reply, response) = oneshot::channel();
            if sender.send(BatchCommand::Flush { reply }).await.is_err() {
                continue;
            }
            match response.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!("Final flush of {} failed: {}", document_id, e);
                    failed += 1;
                }
                Err(_) => {}
            }
        }
        failed
    }

    /// Flush everything and stop all actors.
    pub async fn shutdown(&self) {
        let failed = self.flush_all().await;
        self.actors.clear();
        if failed > 0 {
            warn!("Shutdown with {} unsaved batches", failed);
        } else {
            info!("All batches flushed");
        }
    }

    fn dispatch(&self, document_id: &str, command: BatchCommand) -> Result<(), SyncError> {
        let mut command = command;
        // A closed mailbox means the actor just retired; replace it once.
        for _ in 0..2 {
            let handle = self
                .actors
                .entry(document_id.to_string())
                .or_insert_with(|| self.spawn_actor(document_id));
            match handle.sender.try_send(command) {
                Ok(()) => return Ok(()),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    return Err(SyncError::RateLimited(format!(
                        "too many pending edits for {}",
                        document_id
                    )));
                }
                Err(mpsc::error::TrySendError::Closed(returned)) => {
                    let stale = handle.id;
                    drop(handle);
                    self.actors.remove_if(document_id, |_, h| h.id == stale);
                    command = returned;
                }
            }
        }
        Err(SyncError::Internal(format!(
            "batch actor for {} could not be started",
            document_id
        )))
    }

    fn spawn_actor(&self, document_id: &str) -> ActorHandle {
        let id = ACTOR_COUNTER.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.config.mailbox);
        let actor = DocumentActor {
            id,
            document_id: document_id.to_string(),
            store: Arc::clone(&self.store),
            hub: Arc::clone(&self.hub),
            clock: Arc::clone(&self.clock),
            config: self.config,
            actors: Arc::clone(&self.actors),
            receiver,
            document: None,
            batch: None,
            deadline: None,
            failures: 0,
        };
        debug!("Starting batch actor {} for {}", id, document_id);
        tokio::spawn(actor.run());
        ActorHandle { id, sender }
    }
}

/// Edits accumulated since the last successful write.
struct Batch {
    title: String,
    content: String,
    contributors: HashSet<String>,
    last_editor: String,
    update_count: usize,
    created_at: DateTime<Utc>,
}

struct DocumentActor {
    id: u64,
    document_id: String,
    store: Arc<dyn DocumentStore>,
    hub: Arc<BroadcastHub>,
    clock: Arc<dyn Clock>,
    config: BatchConfig,
    actors: ActorMap,
    receiver: mpsc::Receiver<BatchCommand>,
    /// Last persisted state.
    document: Option<Document>,
    batch: Option<Batch>,
    deadline: Option<Instant>,
    /// Consecutive failed writes of the current batch.
    failures: u32,
}

impl DocumentActor {
    async fn run(mut self) {
        loop {
            let deadline = self.deadline;
            let idle = deadline.is_none() && self.batch.is_none();
            tokio::select! {
                command = self.receiver.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => {
                        if self.batch.is_some() {
                            let _ = self.flush().await;
                        }
                        break;
                    }
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    let _ = self.flush().await;
                }
                _ = sleep(IDLE_RETIRE_AFTER), if idle => {
                    if self.retire() {
                        break;
                    }
                }
            }
        }
        debug!("Batch actor {} for {} stopped", self.id, self.document_id);
    }

    /// Leave the actor map if no command is waiting.
    fn retire(&self) -> bool {
        let receiver = &self.receiver;
        self.actors
            .remove_if(&self.document_id, |_, handle| {
                handle.id == self.id && receiver.is_empty()
            })
            .is_some()
    }

    async fn handle(&mut self, command: BatchCommand) {
        match command {
            BatchCommand::Submit {
                user_id,
                title,
                edit,
                reply,
            } => {
                let result = self.submit(&user_id, title, edit).await;
                let _ = reply.send(result);
            }
            BatchCommand::Flush { reply } => {
                let result = self.flush().await;
                let _ = reply.send(result);
            }
        }
    }

    async fn load(&mut self) -> Result<&Document, SyncError> {
        if self.document.is_none() {
            let document = self
                .store
                .load(&self.document_id)
                .await?
                .ok_or_else(|| SyncError::NotFound(format!("document {}", self.document_id)))?;
            self.document = Some(document);
        }
        self.document
            .as_ref()
            .ok_or_else(|| SyncError::Internal("document cache empty after load".to_string()))
    }

    #[instrument(skip(self, edit), level = "debug", fields(document_id = %self.document_id))]
    async fn submit(
        &mut self,
        user_id: &str,
        title: Option<String>,
        edit: Edit,
    ) -> Result<SubmitAck, SyncError> {
        let (base_title, base_content) = {
            let document = self.load().await?;
            (document.title.clone(), document.content.clone())
        };
        let before = match &self.batch {
            Some(batch) => batch.content.clone(),
            None => base_content,
        };

        let (after, applied, skipped) = match edit {
            Edit::Full { content } => (content, 1, 0),
            Edit::Patches { patches } => {
                let outcome = apply_patches(&before, &patches);
                for skip in &outcome.skipped {
                    warn!(
                        "Skipping out-of-range patch #{} on {} ({:?}, content length {})",
                        skip.index, self.document_id, skip.patch, skip.content_len
                    );
                }
                (outcome.content, outcome.applied, outcome.skipped.len())
            }
        };

        if is_well_formed(&before) && !is_well_formed(&after) {
            warn!(
                "Discarding submission from {} on {}: result is not well-formed",
                user_id, self.document_id
            );
            return Err(SyncError::Validation(
                "edit would leave the document with malformed markup".to_string(),
            ));
        }

        let now = self.clock.now();
        let batch = self.batch.get_or_insert_with(|| Batch {
            title: base_title,
            content: String::new(),
            contributors: HashSet::new(),
            last_editor: user_id.to_string(),
            update_count: 0,
            created_at: now,
        });
        batch.content = after.clone();
        if let Some(title) = title {
            batch.title = title;
        }
        batch.contributors.insert(user_id.to_string());
        batch.last_editor = user_id.to_string();
        batch.update_count += 1;
        let update_count = batch.update_count;

        let in_backoff = self.failures > 0;
        let mut flushed = false;
        if update_count >= self.config.max_updates && !in_backoff {
            debug!("Batch for {} reached {} updates, flushing", self.document_id, update_count);
            flushed = self.flush().await.is_ok();
        } else if !in_backoff {
            // Debounce: every edit pushes the write back.
            self.deadline = Some(Instant::now() + self.config.quiet_period);
        }

        Ok(SubmitAck {
            document_id: self.document_id.clone(),
            applied,
            skipped,
            update_count,
            flushed,
            content: after,
        })
    }

    /// Persist the pending batch. On failure the batch stays and a retry is
    /// scheduled with exponential backoff.
    async fn flush(&mut self) -> Result<(), SyncError> {
        self.deadline = None;
        let Some(batch) = self.batch.take() else {
            return Ok(());
        };
        let Some(base) = self.document.as_ref() else {
            return Err(SyncError::Internal(format!(
                "batch for {} without a loaded document",
                self.document_id
            )));
        };

        let mut document = base.clone();
        document.title = batch.title.clone();
        document.content = batch.content.clone();
        document.updated_at = self.clock.now();
        document.last_editor = Some(batch.last_editor.clone());
        document.refresh_hash();

        if let Err(e) = self.store.save(&document).await {
            self.failures += 1;
            let delay = self.config.retry_delay(self.failures);
            error!(
                "Failed to save {} (attempt {}, {} edits since {}): {}; retrying in {:?}",
                self.document_id,
                self.failures,
                batch.update_count,
                batch.created_at,
                e,
                delay
            );
            if self.failures == self.config.degraded_after {
                self.hub.send_to_users(
                    &self.document_id,
                    &batch.contributors,
                    ServerEvent::error(
                        "save-degraded",
                        format!("saving is failing, still retrying: {}", e),
                        Some(&self.document_id),
                    ),
                );
            }
            self.batch = Some(batch);
            self.deadline = Some(Instant::now() + delay);
            return Err(e);
        }

        if self.failures > 0 {
            info!("Saved {} after {} failed attempts", self.document_id, self.failures);
        }
        self.failures = 0;
        debug!(
            "Flushed {} ({} edits, hash {})",
            self.document_id, batch.update_count, document.content_hash
        );

        self.propagate_to_copies(&document).await;
        self.announce(&document, &batch);
        self.document = Some(document);
        Ok(())
    }

    /// Mirror the saved content into linked shared copies.
    async fn propagate_to_copies(&self, document: &Document) {
        for copy_id in &document.shared_copies {
            let result = match self.store.load(copy_id).await {
                Ok(Some(mut copy)) => {
                    copy.title = document.title.clone();
                    copy.content = document.content.clone();
                    copy.updated_at = document.updated_at;
                    copy.last_editor = document.last_editor.clone();
                    copy.refresh_hash();
                    self.store.save(&copy).await
                }
                Ok(None) => Err(SyncError::NotFound(format!("shared copy {}", copy_id))),
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                warn!(
                    "Failed to propagate {} to shared copy {}: {}",
                    document.id, copy_id, e
                );
            }
        }
    }

    fn announce(&self, document: &Document, batch: &Batch) {
        self.hub.send_to_users(
            &document.id,
            &batch.contributors,
            ServerEvent::BatchSaved {
                document_id: document.id.clone(),
                title: document.title.clone(),
                content: document.content.clone(),
                content_hash: document.content_hash.clone(),
                updated_at: document.updated_at,
                update_count: batch.update_count,
            },
        );
        self.hub.broadcast_except_users(
            &document.id,
            &batch.contributors,
            ServerEvent::NoteUpdatedBroadcast {
                document_id: document.id.clone(),
                content_hash: document.content_hash.clone(),
                updated_at: document.updated_at,
                last_editor: document.last_editor.clone(),
            },
        );
    }
}
