//! Offline queue.
//!
//! Local mutations made while disconnected are recorded in order and
//! replayed on reconnect. Documents created offline get a temporary
//! `local-` id until the server assigns a real one; every queued change is
//! remapped as soon as that happens.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use notesync_core::{ConflictReport, SyncError, Version};
use notesync_local::write_atomic;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::baseline::BaselineStore;
use crate::reconcile::{push_update, SyncOutcome};
use crate::transport::SyncTransport;

const TEMP_ID_PREFIX: &str = "local-";

/// Whether an id was minted offline and not yet replaced by the server's.
pub fn is_temp_id(id: &str) -> bool {
    id.starts_with(TEMP_ID_PREFIX)
}

fn new_temp_id() -> String {
    format!("{}{}", TEMP_ID_PREFIX, Uuid::new_v4())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePayload {
    pub title: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingChange {
    pub id: Uuid,
    pub document_id: String,
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    /// Absent for deletes.
    #[serde(default)]
    pub payload: Option<ChangePayload>,
    pub timestamp: DateTime<Utc>,
}

/// A change the server refused for a reason other than connectivity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub change: PendingChange,
    pub code: String,
    pub error: String,
}

/// What a replay did.
#[derive(Debug, Default)]
pub struct ReplayReport {
    pub applied: usize,
    pub dead_lettered: usize,
    /// Temporary id to server id.
    pub remapped: Vec<(String, String)>,
    /// Updates that hit a true conflict; they left the queue with the report.
    pub conflicts: Vec<ConflictReport>,
    /// Replay stopped on a connectivity failure; the rest is still queued.
    pub halted: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueueSnapshot {
    pending: VecDeque<PendingChange>,
    #[serde(default)]
    dead_letters: Vec<DeadLetter>,
}

/// FIFO of pending local mutations, optionally persisted to a JSON file.
#[derive(Debug, Default)]
pub struct OfflineQueue {
    path: Option<PathBuf>,
    pending: VecDeque<PendingChange>,
    dead_letters: Vec<DeadLetter>,
}

impl OfflineQueue {
    /// A queue that lives in memory only.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load the queue persisted at `path`, or start empty.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, SyncError> {
        let path = path.as_ref().to_path_buf();
        let snapshot = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<QueueSnapshot>(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => QueueSnapshot::default(),
            Err(e) => {
                return Err(SyncError::Persistence(format!(
                    "Failed to read queue {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        debug!(
            "Opened offline queue {} ({} pending, {} dead)",
            path.display(),
            snapshot.pending.len(),
            snapshot.dead_letters.len()
        );
        Ok(Self {
            path: Some(path),
            pending: snapshot.pending,
            dead_letters: snapshot.dead_letters,
        })
    }

    /// Write the queue to its file, if it has one.
    pub async fn save(&self) -> Result<(), SyncError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let snapshot = QueueSnapshot {
            pending: self.pending.clone(),
            dead_letters: self.dead_letters.clone(),
        };
        let json = serde_json::to_vec_pretty(&snapshot)?;
        write_atomic(path, &json).await
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn pending(&self) -> impl Iterator<Item = &PendingChange> {
        self.pending.iter()
    }

    pub fn dead_letters(&self) -> &[DeadLetter] {
        &self.dead_letters
    }

    /// Queue a document created offline; returns its temporary id.
    pub async fn enqueue_create(&mut self, title: &str, content: &str) -> Result<String, SyncError> {
        let document_id = new_temp_id();
        self.push(&document_id, ChangeKind::Create, Some(payload(title, content)))
            .await?;
        Ok(document_id)
    }

    pub async fn enqueue_update(
        &mut self,
        document_id: &str,
        title: &str,
        content: &str,
    ) -> Result<Uuid, SyncError> {
        self.push(document_id, ChangeKind::Update, Some(payload(title, content)))
            .await
    }

    pub async fn enqueue_delete(&mut self, document_id: &str) -> Result<Uuid, SyncError> {
        self.push(document_id, ChangeKind::Delete, None).await
    }

    async fn push(
        &mut self,
        document_id: &str,
        kind: ChangeKind,
        payload: Option<ChangePayload>,
    ) -> Result<Uuid, SyncError> {
        let change = PendingChange {
            id: Uuid::new_v4(),
            document_id: document_id.to_string(),
            kind,
            payload,
            timestamp: Utc::now(),
        };
        let id = change.id;
        debug!("Queued {:?} for {}", kind, document_id);
        self.pending.push_back(change);
        self.save().await?;
        Ok(id)
    }

    /// Point every queued change for `from` at `to`.
    fn remap(&mut self, from: &str, to: &str) {
        for change in self.pending.iter_mut().filter(|c| c.document_id == from) {
            change.document_id = to.to_string();
        }
    }

    /// Replay queued changes in order.
    ///
    /// Stops at the first connectivity failure, leaving that change at the
    /// head. Any other failure moves the change to the dead letters and the
    /// replay continues. The queue file is rewritten after every change
    /// leaves the head, so an interrupted replay never repeats one.
    #[instrument(skip_all, level = "debug", fields(pending = self.pending.len()))]
    pub async fn replay(
        &mut self,
        transport: &dyn SyncTransport,
        baselines: &mut BaselineStore,
    ) -> Result<ReplayReport, SyncError> {
        let mut report = ReplayReport::default();

        while let Some(change) = self.pending.front().cloned() {
            match self.apply(&change, transport, baselines, &mut report).await {
                Ok(()) => {
                    report.applied += 1;
                }
                Err(e) if e.is_network() => {
                    info!("Replay halted at {:?} on {}: {}", change.kind, change.document_id, e);
                    report.halted = true;
                    break;
                }
                Err(e) => {
                    warn!(
                        "Dead-lettering {:?} on {}: {}",
                        change.kind, change.document_id, e
                    );
                    self.dead_letters.push(DeadLetter {
                        change: change.clone(),
                        code: e.code().to_string(),
                        error: e.to_string(),
                    });
                    report.dead_lettered += 1;
                }
            }
            self.pending.pop_front();
            self.save().await?;
        }

        debug!(
            "Replay done: {} applied, {} dead, {} conflicts, halted={}",
            report.applied,
            report.dead_lettered,
            report.conflicts.len(),
            report.halted
        );
        Ok(report)
    }

    async fn apply(
        &mut self,
        change: &PendingChange,
        transport: &dyn SyncTransport,
        baselines: &mut BaselineStore,
        report: &mut ReplayReport,
    ) -> Result<(), SyncError> {
        if change.kind != ChangeKind::Create && is_temp_id(&change.document_id) {
            return Err(SyncError::NotFound(format!(
                "{} was never created on the server",
                change.document_id
            )));
        }

        match change.kind {
            ChangeKind::Create => {
                let payload = require_payload(change)?;
                let created = transport
                    .create_document(&payload.title, &payload.content)
                    .await?;
                self.remap(&change.document_id, &created.id);
                baselines.rename(&change.document_id, &created.id);
                baselines.confirm_document(&created);
                report
                    .remapped
                    .push((change.document_id.clone(), created.id));
            }
            ChangeKind::Update => {
                let payload = require_payload(change)?;
                let local = Version::new(&payload.title, &payload.content, change.timestamp);
                let outcome =
                    push_update(transport, baselines, &change.document_id, &local).await?;
                if let SyncOutcome::Conflict(conflict) = outcome {
                    report.conflicts.push(conflict);
                }
            }
            ChangeKind::Delete => match transport.delete_document(&change.document_id).await {
                Ok(()) => {
                    baselines.remove(&change.document_id);
                }
                Err(SyncError::NotFound(_)) => {
                    debug!("{} already deleted on the server", change.document_id);
                    baselines.remove(&change.document_id);
                }
                Err(e) => return Err(e),
            },
        }
        Ok(())
    }
}

fn payload(title: &str, content: &str) -> ChangePayload {
    ChangePayload {
        title: title.to_string(),
        content: content.to_string(),
    }
}

fn require_payload(change: &PendingChange) -> Result<&ChangePayload, SyncError> {
    change.payload.as_ref().ok_or_else(|| {
        SyncError::Validation(format!("{:?} change {} has no payload", change.kind, change.id))
    })
}
