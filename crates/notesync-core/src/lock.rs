use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::clock::{to_chrono, Clock};
use crate::error::SyncError;

/// How many times a lost conditional write is retried before giving up.
const MAX_WRITE_ATTEMPTS: usize = 3;

/// An advisory exclusive-edit lock on one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditLock {
    pub document_id: String,
    pub holder_id: String,
    /// When the lock was granted or last extended.
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl EditLock {
    pub fn new(document_id: &str, holder_id: &str, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            document_id: document_id.to_string(),
            holder_id: holder_id.to_string(),
            acquired_at: now,
            expires_at: now + to_chrono(ttl),
        }
    }

    pub fn ttl(&self) -> chrono::Duration {
        self.expires_at - self.acquired_at
    }

    /// Lazy expiry: compared at access time, never swept for correctness.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now - self.acquired_at >= self.ttl()
    }
}

/// Result of an acquire attempt. A conflict is an answer, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    Granted(EditLock),
    Conflict {
        holder_id: String,
        expires_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtendOutcome {
    Extended(EditLock),
    Rejected(ExtendRejection),
}

/// Why an extension was refused. None of these touch the stored lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtendRejection {
    /// No live lock exists.
    NotHeld,
    /// The caller's own lock lapsed before the extension arrived.
    Expired,
    /// Someone else holds a live lock.
    NotOwner {
        holder_id: String,
        expires_at: DateTime<Utc>,
    },
}

impl ExtendRejection {
    pub fn reason(&self) -> &'static str {
        match self {
            ExtendRejection::NotHeld => "not_held",
            ExtendRejection::Expired => "expired",
            ExtendRejection::NotOwner { .. } => "not_owner",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    /// Nothing to release.
    AlreadyFree,
    NotOwner {
        holder_id: String,
        expires_at: DateTime<Utc>,
    },
}

/// Backing store for lock records.
///
/// Writes are conditional on the record the caller last observed, which is
/// what closes the window between two simultaneous acquires. Backends that
/// cannot offer an atomic conditional write must say so in their docs.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Returns the backend identifier (e.g., "memory", "file", "kv").
    fn backend_name(&self) -> &'static str;

    /// Read the lock record for a document, expired or not.
    async fn get(&self, document_id: &str) -> Result<Option<EditLock>, SyncError>;

    /// Store `lock` only if the current record equals `expected`
    /// (`None` meaning no record). Returns whether the write happened.
    async fn put_if(
        &self,
        expected: Option<&EditLock>,
        lock: &EditLock,
    ) -> Result<bool, SyncError>;

    /// Delete the record only if it still equals `expected`.
    async fn delete_if(&self, expected: &EditLock) -> Result<bool, SyncError>;

    /// All stored records, for housekeeping sweeps.
    async fn list(&self) -> Result<Vec<EditLock>, SyncError>;
}

/// Lock TTL and the cadence at which holders extend it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockPolicy {
    pub ttl: Duration,
    pub extend_interval: Duration,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(120),
            extend_interval: Duration::from_secs(30),
        }
    }
}

impl LockPolicy {
    /// A holder must get at least three extension attempts inside one TTL,
    /// otherwise a single slow round trip loses a live lock.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.ttl.is_zero() || self.extend_interval.is_zero() {
            return Err(SyncError::Validation(
                "lock ttl and extend interval must be non-zero".to_string(),
            ));
        }
        if self.extend_interval.saturating_mul(3) > self.ttl {
            return Err(SyncError::Validation(format!(
                "lock extend interval {:?} must be at most a third of the ttl {:?}",
                self.extend_interval, self.ttl
            )));
        }
        Ok(())
    }

    /// Resolve a caller-requested TTL against the policy.
    ///
    /// A lock that lapses before the holder's next scheduled extension
    /// would be granted already lost, so shorter TTLs are refused.
    pub fn effective_ttl(&self, requested: Option<Duration>) -> Result<Duration, SyncError> {
        let Some(ttl) = requested else {
            return Ok(self.ttl);
        };
        if ttl.is_zero() || ttl < self.extend_interval {
            return Err(SyncError::Validation(format!(
                "lock ttl {:?} must be at least the extend interval {:?}",
                ttl, self.extend_interval
            )));
        }
        Ok(ttl)
    }
}

/// Applies the lock rules on top of a `LockStore`.
#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn LockStore>,
    clock: Arc<dyn Clock>,
    policy: LockPolicy,
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("backend", &self.store.backend_name())
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl LockManager {
    pub fn new(store: Arc<dyn LockStore>, clock: Arc<dyn Clock>, policy: LockPolicy) -> Self {
        Self {
            store,
            clock,
            policy,
        }
    }

    pub fn policy(&self) -> LockPolicy {
        self.policy
    }

    pub fn backend_name(&self) -> &'static str {
        self.store.backend_name()
    }

    /// Acquire or refresh the lock on a document.
    ///
    /// Granted when there is no lock, the lock has expired, or the caller
    /// already holds it. Otherwise the current holder and expiry come back
    /// and the stored lock is left untouched.
    #[instrument(skip(self), level = "debug")]
    pub async fn acquire(
        &self,
        document_id: &str,
        holder_id: &str,
        ttl: Option<Duration>,
    ) -> Result<AcquireOutcome, SyncError> {
        let ttl = self.policy.effective_ttl(ttl)?;

        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let now = self.clock.now();
            let current = self.store.get(document_id).await?;

            if let Some(existing) = &current {
                if !existing.is_expired(now) && existing.holder_id != holder_id {
                    debug!(
                        "Lock on {} held by {} until {} (requested by {})",
                        document_id, existing.holder_id, existing.expires_at, holder_id
                    );
                    return Ok(AcquireOutcome::Conflict {
                        holder_id: existing.holder_id.clone(),
                        expires_at: existing.expires_at,
                    });
                }
            }

            let lock = EditLock::new(document_id, holder_id, now, ttl);
            if self.store.put_if(current.as_ref(), &lock).await? {
                debug!(
                    "Acquired lock on {} for {} (expires at {})",
                    document_id, holder_id, lock.expires_at
                );
                return Ok(AcquireOutcome::Granted(lock));
            }

            debug!(
                "Lost lock race on {} for {} (attempt {})",
                document_id, holder_id, attempt
            );
        }

        // Still contended after every attempt: report whoever won.
        let now = self.clock.now();
        match self.store.get(document_id).await? {
            Some(winner) if !winner.is_expired(now) => Ok(AcquireOutcome::Conflict {
                holder_id: winner.holder_id,
                expires_at: winner.expires_at,
            }),
            _ => {
                warn!("Lock on {} stayed contended without a live holder", document_id);
                Err(SyncError::Internal(format!(
                    "lock on {} is contended, retry later",
                    document_id
                )))
            }
        }
    }

    /// Push the expiry of a lock the caller currently holds.
    #[instrument(skip(self), level = "debug")]
    pub async fn extend(
        &self,
        document_id: &str,
        holder_id: &str,
        ttl: Option<Duration>,
    ) -> Result<ExtendOutcome, SyncError> {
        let ttl = self.policy.effective_ttl(ttl)?;

        for _ in 0..MAX_WRITE_ATTEMPTS {
            let now = self.clock.now();
            let Some(existing) = self.store.get(document_id).await? else {
                return Ok(ExtendOutcome::Rejected(ExtendRejection::NotHeld));
            };

            if existing.holder_id != holder_id {
                let rejection = if existing.is_expired(now) {
                    ExtendRejection::NotHeld
                } else {
                    ExtendRejection::NotOwner {
                        holder_id: existing.holder_id.clone(),
                        expires_at: existing.expires_at,
                    }
                };
                debug!(
                    "Cannot extend lock on {}: held by {} not {}",
                    document_id, existing.holder_id, holder_id
                );
                return Ok(ExtendOutcome::Rejected(rejection));
            }

            if existing.is_expired(now) {
                debug!("Lock on {} expired before {} extended it", document_id, holder_id);
                return Ok(ExtendOutcome::Rejected(ExtendRejection::Expired));
            }

            let renewed = EditLock::new(document_id, holder_id, now, ttl);
            if self.store.put_if(Some(&existing), &renewed).await? {
                debug!(
                    "Extended lock on {} for {} (new expiry: {})",
                    document_id, holder_id, renewed.expires_at
                );
                return Ok(ExtendOutcome::Extended(renewed));
            }
        }

        Err(SyncError::Internal(format!(
            "lock on {} changed during extension, retry later",
            document_id
        )))
    }

    /// Release a lock. Anyone may clear an expired lock.
    #[instrument(skip(self), level = "debug")]
    pub async fn release(
        &self,
        document_id: &str,
        holder_id: &str,
    ) -> Result<ReleaseOutcome, SyncError> {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let now = self.clock.now();
            let Some(existing) = self.store.get(document_id).await? else {
                return Ok(ReleaseOutcome::AlreadyFree);
            };

            if existing.holder_id != holder_id && !existing.is_expired(now) {
                debug!(
                    "Cannot release lock on {}: held by {} not {}",
                    document_id, existing.holder_id, holder_id
                );
                return Ok(ReleaseOutcome::NotOwner {
                    holder_id: existing.holder_id,
                    expires_at: existing.expires_at,
                });
            }

            if self.store.delete_if(&existing).await? {
                debug!("Released lock on {} by {}", document_id, holder_id);
                return Ok(ReleaseOutcome::Released);
            }
        }

        Err(SyncError::Internal(format!(
            "lock on {} changed during release, retry later",
            document_id
        )))
    }

    /// The live lock on a document, if any. Clears an expired record.
    pub async fn status(&self, document_id: &str) -> Result<Option<EditLock>, SyncError> {
        let now = self.clock.now();
        match self.store.get(document_id).await? {
            Some(lock) if lock.is_expired(now) => {
                self.store.delete_if(&lock).await?;
                Ok(None)
            }
            other => Ok(other),
        }
    }

    /// Remove every expired record. Returns how many were cleared.
    #[instrument(skip(self), level = "debug")]
    pub async fn sweep(&self) -> Result<usize, SyncError> {
        let now = self.clock.now();
        let mut removed = 0;
        for lock in self.store.list().await? {
            if lock.is_expired(now) && self.store.delete_if(&lock).await? {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!("Swept {} expired locks", removed);
        }
        Ok(removed)
    }
}
