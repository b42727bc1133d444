use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::clock::{to_chrono, Clock};
use crate::error::SyncError;

/// Profile details a client announces when it joins a document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceInfo {
    pub display_name: String,
    #[serde(default)]
    pub avatar_ref: Option<String>,
    #[serde(default)]
    pub is_mobile: bool,
}

/// One active editor on one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub document_id: String,
    pub user_id: String,
    pub display_name: String,
    pub avatar_ref: Option<String>,
    pub is_mobile: bool,
    pub joined_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    /// Absolute expiry, pushed forward by every heartbeat.
    pub expires_at: DateTime<Utc>,
}

/// Backing store for presence sets, one set per document.
///
/// Stores persist entries as given; freshness is decided by the registry on
/// read, so both the shared and the in-process implementation behave alike.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Returns the backend identifier (e.g., "memory", "kv").
    fn backend_name(&self) -> &'static str;

    /// Insert or replace an entry. `ttl` lets backends with native expiry
    /// drop abandoned sets on their own.
    async fn upsert(&self, entry: &PresenceEntry, ttl: Duration) -> Result<(), SyncError>;

    async fn get(
        &self,
        document_id: &str,
        user_id: &str,
    ) -> Result<Option<PresenceEntry>, SyncError>;

    /// Remove entries; returns how many existed.
    async fn remove(&self, document_id: &str, user_ids: &[String]) -> Result<usize, SyncError>;

    /// Every stored entry for a document, fresh or not.
    async fn list(&self, document_id: &str) -> Result<Vec<PresenceEntry>, SyncError>;

    /// Documents that have a stored set, for housekeeping sweeps.
    async fn documents(&self) -> Result<Vec<String>, SyncError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceConfig {
    /// Absolute lifetime of an entry without a heartbeat.
    pub entry_ttl: Duration,
    /// Entries not seen for this long are dropped on read.
    pub stale_after: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            entry_ttl: Duration::from_secs(600),
            stale_after: Duration::from_secs(300),
        }
    }
}

/// Outcome of a heartbeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatResult {
    pub editors: Vec<PresenceEntry>,
    /// Entries dropped for staleness while answering.
    pub expired: Vec<PresenceEntry>,
    /// The caller's mobile flag flipped.
    pub mobile_changed: bool,
}

/// Suggested polling interval for clients that cannot hold a live channel.
///
/// More active editors means changes arrive more often, so clients poll
/// faster; a lone editor polls slowly. Mobile requesters never go below 10s.
pub fn recommended_poll_interval(active_editors: usize, requester_is_mobile: bool) -> Duration {
    let interval = match active_editors {
        0 | 1 => Duration::from_secs(30),
        2..=3 => Duration::from_secs(15),
        4..=8 => Duration::from_secs(8),
        _ => Duration::from_secs(5),
    };
    if requester_is_mobile {
        interval.max(Duration::from_secs(10))
    } else {
        interval
    }
}

/// Tracks who is actively editing each document.
#[derive(Clone)]
pub struct PresenceRegistry {
    store: Arc<dyn PresenceStore>,
    clock: Arc<dyn Clock>,
    config: PresenceConfig,
}

impl std::fmt::Debug for PresenceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceRegistry")
            .field("backend", &self.store.backend_name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PresenceRegistry {
    pub fn new(store: Arc<dyn PresenceStore>, clock: Arc<dyn Clock>, config: PresenceConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    pub fn config(&self) -> PresenceConfig {
        self.config
    }

    /// Announce a user on a document. Rejoining keeps the original join time.
    #[instrument(skip(self, info), level = "debug")]
    pub async fn join(
        &self,
        document_id: &str,
        user_id: &str,
        info: &PresenceInfo,
    ) -> Result<Vec<PresenceEntry>, SyncError> {
        let now = self.clock.now();
        let existing = self
            .store
            .get(document_id, user_id)
            .await?
            .filter(|entry| self.is_fresh(entry, now));
        self.write_joined(document_id, user_id, info, existing.map(|e| e.joined_at))
            .await?;
        debug!("{} joined {}", user_id, document_id);

        self.list_active(document_id).await
    }

    async fn write_joined(
        &self,
        document_id: &str,
        user_id: &str,
        info: &PresenceInfo,
        joined_at: Option<DateTime<Utc>>,
    ) -> Result<(), SyncError> {
        let now = self.clock.now();
        let entry = PresenceEntry {
            document_id: document_id.to_string(),
            user_id: user_id.to_string(),
            display_name: info.display_name.clone(),
            avatar_ref: info.avatar_ref.clone(),
            is_mobile: info.is_mobile,
            joined_at: joined_at.unwrap_or(now),
            last_seen_at: now,
            expires_at: now + to_chrono(self.config.entry_ttl),
        };
        self.store.upsert(&entry, self.config.entry_ttl).await
    }

    #[instrument(skip(self), level = "debug")]
    pub async fn leave(
        &self,
        document_id: &str,
        user_id: &str,
    ) -> Result<Vec<PresenceEntry>, SyncError> {
        let removed = self
            .store
            .remove(document_id, &[user_id.to_string()])
            .await?;
        debug!("{} left {} (removed {})", user_id, document_id, removed);
        self.list_active(document_id).await
    }

    /// Refresh an entry. An unknown (or already stale) user is re-joined when
    /// `info` is supplied, otherwise the heartbeat is `NotFound`.
    #[instrument(skip(self, info), level = "debug")]
    pub async fn heartbeat(
        &self,
        document_id: &str,
        user_id: &str,
        info: Option<&PresenceInfo>,
    ) -> Result<HeartbeatResult, SyncError> {
        let now = self.clock.now();
        let existing = self
            .store
            .get(document_id, user_id)
            .await?
            .filter(|entry| self.is_fresh(entry, now));

        let mobile_changed = match (existing, info) {
            (Some(mut entry), info) => {
                let mut changed = false;
                if let Some(info) = info {
                    changed = entry.is_mobile != info.is_mobile;
                    entry.is_mobile = info.is_mobile;
                    entry.display_name = info.display_name.clone();
                    entry.avatar_ref = info.avatar_ref.clone();
                }
                entry.last_seen_at = now;
                entry.expires_at = now + to_chrono(self.config.entry_ttl);
                self.store.upsert(&entry, self.config.entry_ttl).await?;
                changed
            }
            (None, Some(info)) => {
                self.write_joined(document_id, user_id, info, None).await?;
                debug!("{} re-joined {} on heartbeat", user_id, document_id);
                false
            }
            (None, None) => {
                return Err(SyncError::NotFound(format!(
                    "{} is not present on {}",
                    user_id, document_id
                )));
            }
        };

        let (editors, expired) = self.collect_active(document_id).await?;
        Ok(HeartbeatResult {
            editors,
            expired,
            mobile_changed,
        })
    }

    /// The caller's entry, if present and fresh.
    pub async fn entry(
        &self,
        document_id: &str,
        user_id: &str,
    ) -> Result<Option<PresenceEntry>, SyncError> {
        let now = self.clock.now();
        Ok(self
            .store
            .get(document_id, user_id)
            .await?
            .filter(|entry| self.is_fresh(entry, now)))
    }

    /// Active, non-stale editors ordered by join time.
    ///
    /// Stale entries are deleted as a side effect: reading is the
    /// authoritative check for whether an editor is still here.
    pub async fn list_active(&self, document_id: &str) -> Result<Vec<PresenceEntry>, SyncError> {
        Ok(self.collect_active(document_id).await?.0)
    }

    /// Like `list_active`, also returning what was just dropped.
    #[instrument(skip(self), level = "debug")]
    pub async fn collect_active(
        &self,
        document_id: &str,
    ) -> Result<(Vec<PresenceEntry>, Vec<PresenceEntry>), SyncError> {
        let now = self.clock.now();
        let (mut fresh, stale): (Vec<_>, Vec<_>) = self
            .store
            .list(document_id)
            .await?
            .into_iter()
            .partition(|entry| self.is_fresh(entry, now));

        if !stale.is_empty() {
            let ids: Vec<String> = stale.iter().map(|e| e.user_id.clone()).collect();
            match self.store.remove(document_id, &ids).await {
                Ok(count) => debug!("Dropped {} stale editors from {}", count, document_id),
                Err(e) => warn!("Failed to drop stale editors from {}: {}", document_id, e),
            }
        }

        fresh.sort_by(|a, b| a.joined_at.cmp(&b.joined_at).then(a.user_id.cmp(&b.user_id)));
        Ok((fresh, stale))
    }

    /// Drop stale entries on every document, including ones nobody reads
    /// anymore. Returns how many entries were removed.
    #[instrument(skip(self), level = "debug")]
    pub async fn sweep(&self) -> Result<usize, SyncError> {
        let mut removed = 0;
        for document_id in self.store.documents().await? {
            removed += self.collect_active(&document_id).await?.1.len();
        }
        Ok(removed)
    }

    fn is_fresh(&self, entry: &PresenceEntry, now: DateTime<Utc>) -> bool {
        now - entry.last_seen_at < to_chrono(self.config.stale_after) && now < entry.expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct TestStore {
        sets: Mutex<HashMap<String, HashMap<String, PresenceEntry>>>,
    }

    #[async_trait]
    impl PresenceStore for TestStore {
        fn backend_name(&self) -> &'static str {
            "test"
        }

        async fn upsert(&self, entry: &PresenceEntry, _ttl: Duration) -> Result<(), SyncError> {
            self.sets
                .lock()
                .unwrap()
                .entry(entry.document_id.clone())
                .or_default()
                .insert(entry.user_id.clone(), entry.clone());
            Ok(())
        }

        async fn get(
            &self,
            document_id: &str,
            user_id: &str,
        ) -> Result<Option<PresenceEntry>, SyncError> {
            Ok(self
                .sets
                .lock()
                .unwrap()
                .get(document_id)
                .and_then(|set| set.get(user_id).cloned()))
        }

        async fn remove(&self, document_id: &str, user_ids: &[String]) -> Result<usize, SyncError> {
            let mut sets = self.sets.lock().unwrap();
            let Some(set) = sets.get_mut(document_id) else {
                return Ok(0);
            };
            Ok(user_ids.iter().filter(|id| set.remove(*id).is_some()).count())
        }

        async fn list(&self, document_id: &str) -> Result<Vec<PresenceEntry>, SyncError> {
            Ok(self
                .sets
                .lock()
                .unwrap()
                .get(document_id)
                .map(|set| set.values().cloned().collect())
                .unwrap_or_default())
        }

        async fn documents(&self) -> Result<Vec<String>, SyncError> {
            Ok(self
                .sets
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, set)| !set.is_empty())
                .map(|(id, _)| id.clone())
                .collect())
        }
    }

    fn info(name: &str) -> PresenceInfo {
        PresenceInfo {
            display_name: name.to_string(),
            avatar_ref: None,
            is_mobile: false,
        }
    }

    fn setup() -> (PresenceRegistry, Arc<TestStore>, ManualClock) {
        let store = Arc::new(TestStore::default());
        let clock = ManualClock::default();
        let registry =
            PresenceRegistry::new(store.clone(), Arc::new(clock.clone()), PresenceConfig::default());
        (registry, store, clock)
    }

    #[tokio::test]
    async fn test_join_and_leave() {
        let (presence, _store, clock) = setup();
        presence.join("doc-1", "alice", &info("Alice")).await.unwrap();
        clock.advance(Duration::from_secs(1));
        let editors = presence.join("doc-1", "bob", &info("Bob")).await.unwrap();
        let ids: Vec<_> = editors.iter().map(|e| e.user_id.as_str()).collect();
        assert_eq!(ids, vec!["alice", "bob"]);

        let editors = presence.leave("doc-1", "alice").await.unwrap();
        assert_eq!(editors.len(), 1);
        assert_eq!(editors[0].user_id, "bob");
    }

    #[tokio::test]
    async fn test_stale_entries_removed_by_listing() {
        let (presence, store, clock) = setup();
        presence.join("doc-1", "alice", &info("Alice")).await.unwrap();
        clock.advance(Duration::from_secs(200));
        presence.join("doc-1", "bob", &info("Bob")).await.unwrap();
        clock.advance(Duration::from_secs(150));

        // alice was last seen 350s ago, past the 300s threshold.
        let editors = presence.list_active("doc-1").await.unwrap();
        assert_eq!(editors.len(), 1);
        assert_eq!(editors[0].user_id, "bob");
        assert!(store.get("doc-1", "alice").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_heartbeat_keeps_entry_alive() {
        let (presence, _store, clock) = setup();
        presence.join("doc-1", "alice", &info("Alice")).await.unwrap();
        for _ in 0..5 {
            clock.advance(Duration::from_secs(240));
            let result = presence.heartbeat("doc-1", "alice", None).await.unwrap();
            assert_eq!(result.editors.len(), 1);
        }
    }

    #[tokio::test]
    async fn test_heartbeat_reports_timeouts_and_mobile_flips() {
        let (presence, _store, clock) = setup();
        presence.join("doc-1", "alice", &info("Alice")).await.unwrap();
        clock.advance(Duration::from_secs(200));
        presence.join("doc-1", "bob", &info("Bob")).await.unwrap();
        clock.advance(Duration::from_secs(150));

        let result = presence.heartbeat("doc-1", "bob", None).await.unwrap();
        assert!(!result.mobile_changed);
        assert_eq!(result.expired.len(), 1);
        assert_eq!(result.expired[0].user_id, "alice");

        let mobile = PresenceInfo {
            is_mobile: true,
            ..info("Bob")
        };
        let result = presence.heartbeat("doc-1", "bob", Some(&mobile)).await.unwrap();
        assert!(result.mobile_changed);
        assert_eq!(result.editors.len(), 1);
        assert!(result.editors[0].is_mobile);
    }

    #[tokio::test]
    async fn test_heartbeat_without_entry() {
        let (presence, _store, _clock) = setup();
        let err = presence.heartbeat("doc-1", "ghost", None).await.unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));

        let result = presence
            .heartbeat("doc-1", "ghost", Some(&info("Ghost")))
            .await
            .unwrap();
        assert_eq!(result.editors.len(), 1);
    }

    #[tokio::test]
    async fn test_rejoin_keeps_join_time() {
        let (presence, _store, clock) = setup();
        let first = presence.join("doc-1", "alice", &info("Alice")).await.unwrap();
        clock.advance(Duration::from_secs(10));
        let second = presence.join("doc-1", "alice", &info("Alice")).await.unwrap();
        assert_eq!(first[0].joined_at, second[0].joined_at);
        assert!(second[0].last_seen_at > first[0].last_seen_at);
    }

    #[test]
    fn test_poll_interval_shrinks_with_editors() {
        assert_eq!(recommended_poll_interval(1, false), Duration::from_secs(30));
        assert_eq!(recommended_poll_interval(3, false), Duration::from_secs(15));
        assert_eq!(recommended_poll_interval(6, false), Duration::from_secs(8));
        assert_eq!(recommended_poll_interval(20, false), Duration::from_secs(5));
        assert_eq!(recommended_poll_interval(20, true), Duration::from_secs(10));
        assert_eq!(recommended_poll_interval(1, true), Duration::from_secs(30));
    }
}
