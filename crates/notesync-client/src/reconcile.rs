//! Three-way push of local content against the server.
//!
//! Every push starts from a fresh read of the server state and classifies
//! baseline, local and server hashes. Only the two safe outcomes move data;
//! a true conflict is returned to the caller untouched.

use notesync_core::{
    classify, resolve, ConflictReport, Document, ResolutionStrategy, SyncDecision, SyncError,
    Version,
};
use tracing::{debug, info, instrument};

use crate::baseline::BaselineStore;
use crate::transport::SyncTransport;

#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    /// Nothing to do; the server already holds the local content.
    InSync(Document),
    /// Local content was written to the server.
    Pushed(Document),
    /// Only the server changed; the caller should adopt this document.
    Accepted(Document),
    /// Both sides changed since the baseline.
    Conflict(ConflictReport),
}

impl SyncOutcome {
    pub fn is_conflict(&self) -> bool {
        matches!(self, SyncOutcome::Conflict(_))
    }

    /// The server document after the operation, unless in conflict.
    pub fn document(&self) -> Option<&Document> {
        match self {
            SyncOutcome::InSync(doc) | SyncOutcome::Pushed(doc) | SyncOutcome::Accepted(doc) => {
                Some(doc)
            }
            SyncOutcome::Conflict(_) => None,
        }
    }
}

fn version_of(document: &Document) -> Version {
    Version::new(&document.title, &document.content, document.updated_at)
}

/// Reconcile local content for one document with the server.
///
/// Without a baseline the client cannot tell who changed what, so anything
/// but identical content is reported as a conflict.
#[instrument(skip(transport, baselines, local), level = "debug")]
pub async fn push_update(
    transport: &dyn SyncTransport,
    baselines: &mut BaselineStore,
    document_id: &str,
    local: &Version,
) -> Result<SyncOutcome, SyncError> {
    let server = transport
        .fetch_document(document_id)
        .await?
        .ok_or_else(|| SyncError::NotFound(format!("document {}", document_id)))?;
    let local_hash = local.hash();

    let decision = match baselines.hash(document_id) {
        Some(baseline) => classify(baseline, &local_hash, &server.content_hash),
        None if local_hash == server.content_hash => SyncDecision::InSync,
        None => SyncDecision::Conflict,
    };
    debug!("Reconcile {}: {:?}", document_id, decision);

    match decision {
        SyncDecision::InSync => {
            baselines.confirm_document(&server);
            Ok(SyncOutcome::InSync(server))
        }
        SyncDecision::PushLocal => {
            let stored = transport
                .update_document(document_id, &local.title, &local.content)
                .await?;
            baselines.confirm_document(&stored);
            Ok(SyncOutcome::Pushed(stored))
        }
        SyncDecision::AcceptRemote => {
            baselines.confirm_document(&server);
            Ok(SyncOutcome::Accepted(server))
        }
        SyncDecision::Conflict => {
            let report = ConflictReport::new(
                document_id,
                baselines.hash(document_id).cloned(),
                local.clone(),
                version_of(&server),
            );
            info!(
                "Conflict on {}: local {} vs server {}",
                document_id, report.local_hash, report.server_hash
            );
            Ok(SyncOutcome::Conflict(report))
        }
    }
}

/// Apply the user's choice for a reported conflict.
///
/// The server state shown in the report becomes the baseline, then the
/// merged content is pushed through the normal three-way path. If the server
/// moved again since the report, a fresh conflict comes back.
pub async fn apply_resolution(
    transport: &dyn SyncTransport,
    baselines: &mut BaselineStore,
    report: &ConflictReport,
    strategy: ResolutionStrategy,
) -> Result<SyncOutcome, SyncError> {
    let merged = resolve(strategy, &report.local, &report.remote);
    info!(
        "Resolving conflict on {} with {:?}",
        report.document_id, strategy
    );
    baselines.confirm(
        &report.document_id,
        report.server_hash.clone(),
        report.remote.updated_at,
    );
    push_update(transport, baselines, &report.document_id, &merged).await
}
