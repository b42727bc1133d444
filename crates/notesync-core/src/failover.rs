//! Degraded-mode wrappers.
//!
//! When the shared store is unreachable the server keeps serving from a
//! process-local fallback instead of failing every request. Coordination in
//! degraded mode is best effort: two server instances each running on their
//! own fallback can grant the same lock twice.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::SyncError;
use crate::lock::{EditLock, LockStore};
use crate::presence::{PresenceEntry, PresenceStore};

/// Tracks whether the primary is currently considered down.
#[derive(Debug, Default)]
struct Health {
    degraded: AtomicBool,
}

impl Health {
    /// Run `primary`; on an availability error switch to `fallback`.
    async fn route<T, P, F>(&self, what: &str, primary: P, fallback: F) -> Result<T, SyncError>
    where
        P: std::future::Future<Output = Result<T, SyncError>>,
        F: std::future::Future<Output = Result<T, SyncError>>,
    {
        match primary.await {
            Ok(value) => {
                if self.degraded.swap(false, Ordering::SeqCst) {
                    info!("Primary {} store reachable again, leaving degraded mode", what);
                }
                Ok(value)
            }
            Err(e) if e.is_unavailable() => {
                if !self.degraded.swap(true, Ordering::SeqCst) {
                    warn!("Primary {} store unavailable ({}), using local fallback", what, e);
                }
                fallback.await
            }
            Err(e) => Err(e),
        }
    }
}

/// Lock store that falls back to a local store while the primary is down.
pub struct FailoverLockStore {
    primary: Arc<dyn LockStore>,
    fallback: Arc<dyn LockStore>,
    health: Health,
}

impl FailoverLockStore {
    pub fn new(primary: Arc<dyn LockStore>, fallback: Arc<dyn LockStore>) -> Self {
        Self {
            primary,
            fallback,
            health: Health::default(),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.health.degraded.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LockStore for FailoverLockStore {
    fn backend_name(&self) -> &'static str {
        self.primary.backend_name()
    }

    async fn get(&self, document_id: &str) -> Result<Option<EditLock>, SyncError> {
        self.health
            .route(
                "lock",
                self.primary.get(document_id),
                self.fallback.get(document_id),
            )
            .await
    }

    async fn put_if(
        &self,
        expected: Option<&EditLock>,
        lock: &EditLock,
    ) -> Result<bool, SyncError> {
        self.health
            .route(
                "lock",
                self.primary.put_if(expected, lock),
                self.fallback.put_if(expected, lock),
            )
            .await
    }

    async fn delete_if(&self, expected: &EditLock) -> Result<bool, SyncError> {
        self.health
            .route(
                "lock",
                self.primary.delete_if(expected),
                self.fallback.delete_if(expected),
            )
            .await
    }

    async fn list(&self) -> Result<Vec<EditLock>, SyncError> {
        self.health
            .route("lock", self.primary.list(), self.fallback.list())
            .await
    }
}

/// Presence store that falls back to a local store while the primary is down.
pub struct FailoverPresenceStore {
    primary: Arc<dyn PresenceStore>,
    fallback: Arc<dyn PresenceStore>,
    health: Health,
}

impl FailoverPresenceStore {
    pub fn new(primary: Arc<dyn PresenceStore>, fallback: Arc<dyn PresenceStore>) -> Self {
        Self {
            primary,
            fallback,
            health: Health::default(),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.health.degraded.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PresenceStore for FailoverPresenceStore {
    fn backend_name(&self) -> &'static str {
        self.primary.backend_name()
    }

    async fn upsert(&self, entry: &PresenceEntry, ttl: Duration) -> Result<(), SyncError> {
        self.health
            .route(
                "presence",
                self.primary.upsert(entry, ttl),
                self.fallback.upsert(entry, ttl),
            )
            .await
    }

    async fn get(
        &self,
        document_id: &str,
        user_id: &str,
    ) -> Result<Option<PresenceEntry>, SyncError> {
        self.health
            .route(
                "presence",
                self.primary.get(document_id, user_id),
                self.fallback.get(document_id, user_id),
            )
            .await
    }

    async fn remove(&self, document_id: &str, user_ids: &[String]) -> Result<usize, SyncError> {
        self.health
            .route(
                "presence",
                self.primary.remove(document_id, user_ids),
                self.fallback.remove(document_id, user_ids),
            )
            .await
    }

    async fn list(&self, document_id: &str) -> Result<Vec<PresenceEntry>, SyncError> {
        self.health
            .route(
                "presence",
                self.primary.list(document_id),
                self.fallback.list(document_id),
            )
            .await
    }

    async fn documents(&self) -> Result<Vec<String>, SyncError> {
        self.health
            .route("presence", self.primary.documents(), self.fallback.documents())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::presence::{PresenceConfig, PresenceInfo, PresenceRegistry};
    use chrono::Utc;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct SwitchableStore {
        locks: Mutex<HashMap<String, EditLock>>,
        presence: Mutex<HashMap<(String, String), PresenceEntry>>,
        down: AtomicBool,
        failure: Mutex<Option<SyncError>>,
    }

    impl SwitchableStore {
        fn check(&self) -> Result<(), SyncError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(self
                    .failure
                    .lock()
                    .unwrap()
                    .clone()
                    .unwrap_or_else(|| SyncError::Network("connection refused".into())));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl LockStore for SwitchableStore {
        fn backend_name(&self) -> &'static str {
            "switchable"
        }

        async fn get(&self, document_id: &str) -> Result<Option<EditLock>, SyncError> {
            self.check()?;
            Ok(self.locks.lock().unwrap().get(document_id).cloned())
        }

        async fn put_if(
            &self,
            expected: Option<&EditLock>,
            lock: &EditLock,
        ) -> Result<bool, SyncError> {
            self.check()?;
            let mut locks = self.locks.lock().unwrap();
            if locks.get(&lock.document_id) != expected {
                return Ok(false);
            }
            locks.insert(lock.document_id.clone(), lock.clone());
            Ok(true)
        }

        async fn delete_if(&self, expected: &EditLock) -> Result<bool, SyncError> {
            self.check()?;
            Ok(self.locks.lock().unwrap().remove(&expected.document_id).is_some())
        }

        async fn list(&self) -> Result<Vec<EditLock>, SyncError> {
            self.check()?;
            Ok(self.locks.lock().unwrap().values().cloned().collect())
        }
    }

    #[async_trait]
    impl PresenceStore for SwitchableStore {
        fn backend_name(&self) -> &'static str {
            "switchable"
        }

        async fn upsert(&self, entry: &PresenceEntry, _ttl: Duration) -> Result<(), SyncError> {
            self.check()?;
            self.presence.lock().unwrap().insert(
                (entry.document_id.clone(), entry.user_id.clone()),
                entry.clone(),
            );
            Ok(())
        }

        async fn get(
            &self,
            document_id: &str,
            user_id: &str,
        ) -> Result<Option<PresenceEntry>, SyncError> {
            self.check()?;
            let key = (document_id.to_string(), user_id.to_string());
            Ok(self.presence.lock().unwrap().get(&key).cloned())
        }

        async fn remove(&self, document_id: &str, user_ids: &[String]) -> Result<usize, SyncError> {
            self.check()?;
            let mut presence = self.presence.lock().unwrap();
            Ok(user_ids
                .iter()
                .filter(|user| {
                    presence
                        .remove(&(document_id.to_string(), user.to_string()))
                        .is_some()
                })
                .count())
        }

        async fn list(&self, document_id: &str) -> Result<Vec<PresenceEntry>, SyncError> {
            self.check()?;
            Ok(self
                .presence
                .lock()
                .unwrap()
                .values()
                .filter(|entry| entry.document_id == document_id)
                .cloned()
                .collect())
        }

        async fn documents(&self) -> Result<Vec<String>, SyncError> {
            self.check()?;
            let mut documents: Vec<String> = self
                .presence
                .lock()
                .unwrap()
                .keys()
                .map(|(document_id, _)| document_id.clone())
                .collect();
            documents.sort();
            documents.dedup();
            Ok(documents)
        }
    }

    fn presence_registry(store: Arc<FailoverPresenceStore>) -> PresenceRegistry {
        PresenceRegistry::new(store, Arc::new(ManualClock::default()), PresenceConfig::default())
    }

    fn info(name: &str) -> PresenceInfo {
        PresenceInfo {
            display_name: name.to_string(),
            avatar_ref: None,
            is_mobile: false,
        }
    }

    fn lock(holder: &str) -> EditLock {
        EditLock::new("doc-1", holder, Utc::now(), Duration::from_secs(120))
    }

    #[tokio::test]
    async fn test_switches_to_fallback_and_back() {
        let primary = Arc::new(SwitchableStore::default());
        let fallback = Arc::new(SwitchableStore::default());
        let store = FailoverLockStore::new(primary.clone(), fallback.clone());

        assert!(store.put_if(None, &lock("alice")).await.unwrap());
        assert!(!store.is_degraded());
        assert!(primary.locks.lock().unwrap().contains_key("doc-1"));

        primary.down.store(true, Ordering::SeqCst);
        assert!(store.get("doc-1").await.unwrap().is_none());
        assert!(store.put_if(None, &lock("bob")).await.unwrap());
        assert!(store.is_degraded());
        assert_eq!(fallback.locks.lock().unwrap()["doc-1"].holder_id, "bob");

        primary.down.store(false, Ordering::SeqCst);
        let current = store.get("doc-1").await.unwrap().unwrap();
        assert_eq!(current.holder_id, "alice");
        assert!(!store.is_degraded());
    }

    #[tokio::test]
    async fn test_non_availability_errors_pass_through() {
        let primary = Arc::new(SwitchableStore::default());
        *primary.failure.lock().unwrap() = Some(SyncError::Validation("bad id".into()));
        primary.down.store(true, Ordering::SeqCst);
        let store = FailoverLockStore::new(primary, Arc::new(SwitchableStore::default()));

        let err = store.get("doc-1").await.unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
        assert!(!store.is_degraded());
    }

    #[tokio::test]
    async fn test_presence_survives_primary_outage() {
        let primary = Arc::new(SwitchableStore::default());
        let fallback = Arc::new(SwitchableStore::default());
        let store = Arc::new(FailoverPresenceStore::new(primary.clone(), fallback.clone()));
        let registry = presence_registry(store.clone());

        registry.join("doc-1", "alice", &info("Alice")).await.unwrap();
        assert!(!store.is_degraded());
        assert_eq!(primary.presence.lock().unwrap().len(), 1);

        primary.down.store(true, Ordering::SeqCst);
        let editors = registry.join("doc-1", "bob", &info("Bob")).await.unwrap();
        assert!(store.is_degraded());
        let names: Vec<&str> = editors.iter().map(|e| e.user_id.as_str()).collect();
        assert_eq!(names, vec!["bob"]);
        assert_eq!(fallback.presence.lock().unwrap().len(), 1);

        let heartbeat = registry.heartbeat("doc-1", "bob", None).await.unwrap();
        assert_eq!(heartbeat.editors.len(), 1);
        assert_eq!(registry.leave("doc-1", "bob").await.unwrap(), Vec::new());
        assert!(fallback.presence.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_presence_leaves_degraded_mode_on_recovery() {
        let primary = Arc::new(SwitchableStore::default());
        let fallback = Arc::new(SwitchableStore::default());
        let store = Arc::new(FailoverPresenceStore::new(primary.clone(), fallback.clone()));
        let registry = presence_registry(store.clone());

        primary.down.store(true, Ordering::SeqCst);
        registry.join("doc-1", "bob", &info("Bob")).await.unwrap();
        assert!(store.is_degraded());

        primary.down.store(false, Ordering::SeqCst);
        let editors = registry.join("doc-1", "alice", &info("Alice")).await.unwrap();
        assert!(!store.is_degraded());
        let names: Vec<&str> = editors.iter().map(|e| e.user_id.as_str()).collect();
        assert_eq!(names, vec!["alice"]);
        assert_eq!(store.documents().await.unwrap(), vec!["doc-1".to_string()]);
    }
}
