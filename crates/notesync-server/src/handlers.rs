//! HTTP handlers for the sync server.
//!
//! Implements:
//! - POST/DELETE /notes/{id}/lock, POST /notes/{id}/lock/extend - edit locks
//! - POST/DELETE /notes/{id}/presence, POST /notes/{id}/presence/heartbeat - presence
//! - GET /notes/{id}/updates - incremental poll
//! - POST /sync/bulk - reconnect comparison
//! - GET /ws - persistent channel (see `ws`)
//! - GET /health - Health check endpoint

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use notesync_core::{
    recommended_poll_interval, AccessPolicy, AcquireOutcome, Clock, ContentHash,
    DocumentStore, ExtendOutcome, LockManager, LockPolicy, LockStore, PresenceConfig,
    PresenceEntry, PresenceInfo, PresenceReason, PresenceRegistry, PresenceStore, ReleaseOutcome,
    SyncError,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::batch::{BatchAggregator, BatchConfig};
use crate::error::{ApiError, Result};
use crate::hub::BroadcastHub;
use crate::sync_api::{BulkEntry, ClientDocState, SyncService, UpdatesSince};
use crate::ws::ws_handler;

/// Header carrying the caller identity set by the upstream identity layer.
pub const USER_ID_HEADER: &str = "x-user-id";

/// Storage and policy ports the server is assembled from.
pub struct Backends {
    pub locks: Arc<dyn LockStore>,
    pub presence: Arc<dyn PresenceStore>,
    pub documents: Arc<dyn DocumentStore>,
    pub access: Arc<dyn AccessPolicy>,
    pub clock: Arc<dyn Clock>,
}

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub locks: LockManager,
    pub presence: PresenceRegistry,
    pub hub: Arc<BroadcastHub>,
    pub batches: BatchAggregator,
    pub sync: Arc<SyncService>,
    pub documents: Arc<dyn DocumentStore>,
    pub access: Arc<dyn AccessPolicy>,
}

impl AppState {
    pub fn new(
        backends: Backends,
        lock_policy: LockPolicy,
        presence_config: PresenceConfig,
        batch_config: BatchConfig,
    ) -> Self {
        let Backends {
            locks,
            presence,
            documents,
            access,
            clock,
        } = backends;

        let locks = LockManager::new(locks, clock.clone(), lock_policy);
        let presence = PresenceRegistry::new(presence, clock.clone(), presence_config);
        let hub = Arc::new(BroadcastHub::new(presence.clone(), clock.clone()));
        let batches = BatchAggregator::new(documents.clone(), hub.clone(), clock, batch_config);
        let sync = Arc::new(SyncService::new(documents.clone()));

        Self {
            locks,
            presence,
            hub,
            batches,
            sync,
            documents,
            access,
        }
    }

    /// Fail with `PermissionDenied` unless the user may edit the document.
    pub async fn ensure_can_edit(&self, document_id: &str, user_id: &str) -> Result<()> {
        if self.access.can_edit(document_id, user_id).await? {
            Ok(())
        } else {
            Err(SyncError::PermissionDenied(format!(
                "{} may not edit {}",
                user_id, document_id
            ))
            .into())
        }
    }
}

/// Build the router with all routes, CORS and request tracing.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route(
            "/notes/{id}/lock",
            post(acquire_lock_handler).delete(release_lock_handler),
        )
        .route("/notes/{id}/lock/extend", post(extend_lock_handler))
        .route(
            "/notes/{id}/presence",
            post(join_presence_handler).delete(leave_presence_handler),
        )
        .route("/notes/{id}/presence/heartbeat", post(heartbeat_handler))
        .route("/notes/{id}/updates", get(updates_handler))
        .route("/sync/bulk", post(bulk_sync_handler))
        .route("/ws", get(ws_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Caller identity from the `x-user-id` header.
#[derive(Debug, Clone)]
pub struct CallerId(pub String);

impl<S: Send + Sync> FromRequestParts<S> for CallerId {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self> {
        parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| CallerId(v.to_string()))
            .ok_or(ApiError::Unauthenticated)
    }
}

/// Health check response.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub healthy: bool,
    pub version: &'static str,
    pub lock_backend: &'static str,
    pub sessions: usize,
    pub open_batches: usize,
}

/// GET /health - Health check endpoint.
pub async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        healthy: true,
        version: env!("CARGO_PKG_VERSION"),
        lock_backend: state.locks.backend_name(),
        sessions: state.hub.session_count(),
        open_batches: state.batches.active_documents(),
    })
}

// =========================================================================
// Locks
// =========================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockQuery {
    pub ttl_ms: Option<u64>,
}

impl LockQuery {
    fn ttl(&self) -> Option<Duration> {
        self.ttl_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcquireResponse {
    pub granted: bool,
    pub holder_id: String,
    pub expires_at: DateTime<Utc>,
    /// How often the holder should extend, present when granted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommended_extend_ms: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtendResponse {
    pub extended: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseResponse {
    pub released: bool,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub holder_id: Option<String>,
}

/// POST /notes/{id}/lock - Acquire or refresh the edit lock.
///
/// A conflict answers 409 with the current holder and expiry.
pub async fn acquire_lock_handler(
    State(state): State<AppState>,
    CallerId(user_id): CallerId,
    Path(document_id): Path<String>,
    Query(query): Query<LockQuery>,
) -> Result<Response> {
    state.ensure_can_edit(&document_id, &user_id).await?;

    let outcome = state.locks.acquire(&document_id, &user_id, query.ttl()).await?;
    let response = match outcome {
        AcquireOutcome::Granted(lock) => (
            StatusCode::OK,
            Json(AcquireResponse {
                granted: true,
                holder_id: lock.holder_id,
                expires_at: lock.expires_at,
                recommended_extend_ms: Some(
                    state.locks.policy().extend_interval.as_millis() as u64
                ),
            }),
        ),
        AcquireOutcome::Conflict {
            holder_id,
            expires_at,
        } => (
            StatusCode::CONFLICT,
            Json(AcquireResponse {
                granted: false,
                holder_id,
                expires_at,
                recommended_extend_ms: None,
            }),
        ),
    };
    Ok(response.into_response())
}

/// POST /notes/{id}/lock/extend - Push the expiry of a held lock.
pub async fn extend_lock_handler(
    State(state): State<AppState>,
    CallerId(user_id): CallerId,
    Path(document_id): Path<String>,
    Query(query): Query<LockQuery>,
) -> Result<Response> {
    let outcome = state.locks.extend(&document_id, &user_id, query.ttl()).await?;
    let response = match outcome {
        ExtendOutcome::Extended(lock) => (
            StatusCode::OK,
            Json(ExtendResponse {
                extended: true,
                reason: None,
                expires_at: Some(lock.expires_at),
            }),
        ),
        ExtendOutcome::Rejected(rejection) => (
            StatusCode::CONFLICT,
            Json(ExtendResponse {
                extended: false,
                reason: Some(rejection.reason().to_string()),
                expires_at: None,
            }),
        ),
    };
    Ok(response.into_response())
}

/// DELETE /notes/{id}/lock - Release the edit lock.
pub async fn release_lock_handler(
    State(state): State<AppState>,
    CallerId(user_id): CallerId,
    Path(document_id): Path<String>,
) -> Result<Response> {
    let outcome = state.locks.release(&document_id, &user_id).await?;
    let response = match outcome {
        ReleaseOutcome::Released => (
            StatusCode::OK,
            Json(ReleaseResponse {
                released: true,
                reason: "released".to_string(),
                holder_id: None,
            }),
        ),
        ReleaseOutcome::AlreadyFree => (
            StatusCode::OK,
            Json(ReleaseResponse {
                released: false,
                reason: "already_free".to_string(),
                holder_id: None,
            }),
        ),
        ReleaseOutcome::NotOwner { holder_id, .. } => (
            StatusCode::CONFLICT,
            Json(ReleaseResponse {
                released: false,
                reason: "not_owner".to_string(),
                holder_id: Some(holder_id),
            }),
        ),
    };
    Ok(response.into_response())
}

// =========================================================================
// Presence
// =========================================================================

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceResponse {
    pub editors: Vec<PresenceEntry>,
    pub recommended_poll_ms: u64,
}

impl PresenceResponse {
    fn new(editors: Vec<PresenceEntry>, requester_is_mobile: bool) -> Self {
        let poll = recommended_poll_interval(editors.len(), requester_is_mobile);
        Self {
            editors,
            recommended_poll_ms: poll.as_millis() as u64,
        }
    }
}

/// Heartbeat body; every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeartbeatRequest {
    pub display_name: Option<String>,
    pub avatar_ref: Option<String>,
    pub is_mobile: Option<bool>,
}

/// POST /notes/{id}/presence - Join the document's editor list.
pub async fn join_presence_handler(
    State(state): State<AppState>,
    CallerId(user_id): CallerId,
    Path(document_id): Path<String>,
    Json(info): Json<PresenceInfo>,
) -> Result<Json<PresenceResponse>> {
    state.presence.join(&document_id, &user_id, &info).await?;
    let editors = state
        .hub
        .publish_presence(&document_id, PresenceReason::Join)
        .await;
    Ok(Json(PresenceResponse::new(editors, info.is_mobile)))
}

/// DELETE /notes/{id}/presence - Leave the document's editor list.
pub async fn leave_presence_handler(
    State(state): State<AppState>,
    CallerId(user_id): CallerId,
    Path(document_id): Path<String>,
) -> Result<Json<PresenceResponse>> {
    state.presence.leave(&document_id, &user_id).await?;
    let editors = state
        .hub
        .publish_presence(&document_id, PresenceReason::Leave)
        .await;
    Ok(Json(PresenceResponse::new(editors, false)))
}

/// POST /notes/{id}/presence/heartbeat - Keep the caller's entry alive.
pub async fn heartbeat_handler(
    State(state): State<AppState>,
    CallerId(user_id): CallerId,
    Path(document_id): Path<String>,
    body: Option<Json<HeartbeatRequest>>,
) -> Result<Json<PresenceResponse>> {
    let request = body.map(|Json(request)| request).unwrap_or_default();
    // Fields left out of the body keep their current values.
    let current = state.presence.entry(&document_id, &user_id).await?;
    let is_mobile = request
        .is_mobile
        .or(current.as_ref().map(|e| e.is_mobile))
        .unwrap_or(false);
    let info = PresenceInfo {
        display_name: request
            .display_name
            .or(current.as_ref().map(|e| e.display_name.clone()))
            .unwrap_or_else(|| user_id.clone()),
        avatar_ref: request
            .avatar_ref
            .or(current.and_then(|e| e.avatar_ref)),
        is_mobile,
    };

    let result = state
        .presence
        .heartbeat(&document_id, &user_id, Some(&info))
        .await?;
    if !result.expired.is_empty() {
        state
            .hub
            .publish_presence(&document_id, PresenceReason::Timeout)
            .await;
    } else if result.mobile_changed {
        state
            .hub
            .publish_presence(&document_id, PresenceReason::MobileStatus)
            .await;
    }
    Ok(Json(PresenceResponse::new(result.editors, is_mobile)))
}

// =========================================================================
// Sync queries
// =========================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatesQuery {
    pub since: DateTime<Utc>,
    pub local_hash: Option<String>,
    pub baseline_hash: Option<String>,
}

/// GET /notes/{id}/updates - Changes since a timestamp.
pub async fn updates_handler(
    State(state): State<AppState>,
    CallerId(user_id): CallerId,
    Path(document_id): Path<String>,
    Query(query): Query<UpdatesQuery>,
) -> Result<Json<UpdatesSince>> {
    debug!("{} polling {} since {}", user_id, document_id, query.since);
    let local = query.local_hash.map(ContentHash::new);
    let baseline = query.baseline_hash.map(ContentHash::new);
    let updates = state
        .sync
        .fetch_updates_since(&document_id, query.since, local.as_ref(), baseline.as_ref())
        .await?;
    Ok(Json(updates))
}

/// POST /sync/bulk - Compare a client's document set with the server's.
pub async fn bulk_sync_handler(
    State(state): State<AppState>,
    CallerId(_user_id): CallerId,
    Json(known): Json<HashMap<String, ClientDocState>>,
) -> Result<Json<BTreeMap<String, BulkEntry>>> {
    Ok(Json(state.sync.bulk_sync(&known).await?))
}
