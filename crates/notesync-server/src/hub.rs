//! Channel fan-out for connected sessions.
//!
//! Each live connection registers a session and gets a bounded outbound
//! queue. Sessions join one channel per open document. The hub reads and
//! writes presence through the registry but never touches document content.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use notesync_core::{
    recommended_poll_interval, Clock, PresenceEntry, PresenceInfo, PresenceReason,
    PresenceRegistry, ServerEvent, SyncError,
};
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Outbound queue depth per session. A client that falls this far behind
/// starts losing events and must resync from its baseline.
const SESSION_BUFFER: usize = 64;

pub type SessionId = Uuid;

struct Session {
    user_id: String,
    sender: mpsc::Sender<ServerEvent>,
    /// Channels joined, with the profile announced in each.
    channels: HashMap<String, PresenceInfo>,
}

pub struct BroadcastHub {
    presence: PresenceRegistry,
    clock: Arc<dyn Clock>,
    sessions: DashMap<SessionId, Session>,
    channels: DashMap<String, HashSet<SessionId>>,
}

impl BroadcastHub {
    pub fn new(presence: PresenceRegistry, clock: Arc<dyn Clock>) -> Self {
        Self {
            presence,
            clock,
            sessions: DashMap::new(),
            channels: DashMap::new(),
        }
    }

    /// Register a connection; events for it arrive on the returned receiver.
    pub fn register_session(&self, user_id: &str) -> (SessionId, mpsc::Receiver<ServerEvent>) {
        let (sender, receiver) = mpsc::channel(SESSION_BUFFER);
        let id = Uuid::new_v4();
        self.sessions.insert(
            id,
            Session {
                user_id: user_id.to_string(),
                sender,
                channels: HashMap::new(),
            },
        );
        debug!("Registered session {} for {}", id, user_id);
        (id, receiver)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn member_count(&self, document_id: &str) -> usize {
        self.channels.get(document_id).map_or(0, |members| members.len())
    }

    /// Join a document channel and announce the session's user.
    ///
    /// Membership always succeeds; if presence cannot be recorded the
    /// collaboration indicator is simply missing this user.
    #[instrument(skip(self, info), level = "debug")]
    pub async fn join_channel(
        &self,
        session_id: SessionId,
        document_id: &str,
        info: PresenceInfo,
    ) -> Result<Vec<PresenceEntry>, SyncError> {
        let user_id = {
            let mut session = self
                .sessions
                .get_mut(&session_id)
                .ok_or_else(|| SyncError::NotFound(format!("session {}", session_id)))?;
            session.channels.insert(document_id.to_string(), info.clone());
            session.user_id.clone()
        };
        self.channels
            .entry(document_id.to_string())
            .or_default()
            .insert(session_id);

        if let Err(e) = self.presence.join(document_id, &user_id, &info).await {
            warn!("Presence join failed for {} on {}: {}", user_id, document_id, e);
        }
        Ok(self.publish_presence(document_id, PresenceReason::Join).await)
    }

    #[instrument(skip(self), level = "debug")]
    pub async fn leave_channel(&self, session_id: SessionId, document_id: &str) {
        let Some(user_id) = self.drop_membership(session_id, document_id) else {
            return;
        };
        self.release_presence(document_id, &user_id).await;
        self.publish_presence(document_id, PresenceReason::Leave).await;
    }

    /// Refresh the session's presence and answer with a heartbeat ack.
    #[instrument(skip(self), level = "debug")]
    pub async fn heartbeat(&self, session_id: SessionId, document_id: &str, is_mobile: Option<bool>) {
        let Some((user_id, info)) = self.sessions.get_mut(&session_id).and_then(|mut session| {
            let user_id = session.user_id.clone();
            let info = session.channels.get_mut(document_id)?;
            if let Some(is_mobile) = is_mobile {
                info.is_mobile = is_mobile;
            }
            Some((user_id, info.clone()))
        }) else {
            self.send_to(
                session_id,
                ServerEvent::error("not-joined", "heartbeat for a channel not joined", Some(document_id)),
            );
            return;
        };

        let active = match self.presence.heartbeat(document_id, &user_id, Some(&info)).await {
            Ok(result) => {
                let active = result.editors.len();
                if !result.expired.is_empty() {
                    self.publish_presence(document_id, PresenceReason::Timeout).await;
                } else if result.mobile_changed {
                    self.publish_presence(document_id, PresenceReason::MobileStatus).await;
                }
                active
            }
            Err(e) => {
                warn!("Presence heartbeat failed for {} on {}: {}", user_id, document_id, e);
                0
            }
        };

        let poll = recommended_poll_interval(active, info.is_mobile);
        self.send_to(
            session_id,
            ServerEvent::HeartbeatAck {
                document_id: document_id.to_string(),
                server_time: self.clock.now(),
                recommended_poll_ms: poll.as_millis() as u64,
            },
        );
    }

    /// Send an event to every member of a channel, optionally skipping one.
    pub fn broadcast(&self, document_id: &str, event: ServerEvent, exclude: Option<SessionId>) {
        for (id, sender) in self.members(document_id, |id, _| Some(*id) != exclude) {
            Self::deliver(id, &sender, event.clone());
        }
    }

    /// Send an event to members whose user is in `users`.
    pub fn send_to_users(&self, document_id: &str, users: &HashSet<String>, event: ServerEvent) {
        for (id, sender) in self.members(document_id, |_, user| users.contains(user)) {
            Self::deliver(id, &sender, event.clone());
        }
    }

    /// Send an event to members whose user is not in `users`.
    pub fn broadcast_except_users(&self, document_id: &str, users: &HashSet<String>, event: ServerEvent) {
        for (id, sender) in self.members(document_id, |_, user| !users.contains(user)) {
            Self::deliver(id, &sender, event.clone());
        }
    }

    /// Unicast to one session.
    pub fn send_to(&self, session_id: SessionId, event: ServerEvent) {
        let sender = self.sessions.get(&session_id).map(|s| s.sender.clone());
        if let Some(sender) = sender {
            Self::deliver(session_id, &sender, event);
        }
    }

    /// Tear down a session after its connection dropped.
    ///
    /// Every channel the session was in loses the user's presence (unless the
    /// same user is still connected there through another session) and hears
    /// about it. A failure in one channel is logged and the rest still run.
    #[instrument(skip(self), level = "debug")]
    pub async fn disconnect(&self, session_id: SessionId) {
        let Some((_, session)) = self.sessions.remove(&session_id) else {
            return;
        };

        for document_id in session.channels.keys() {
            if let Some(mut members) = self.channels.get_mut(document_id) {
                members.remove(&session_id);
            }
            self.channels.remove_if(document_id, |_, members| members.is_empty());

            self.release_presence(document_id, &session.user_id).await;
            self.publish_presence(document_id, PresenceReason::Disconnect).await;
        }
        debug!(
            "Disconnected session {} ({} channels)",
            session_id,
            session.channels.len()
        );
    }

    /// Recompute the editor list and send it to every member.
    ///
    /// Each member gets its own poll recommendation, since mobile clients
    /// have a floor. A failed read publishes an empty list.
    pub async fn publish_presence(&self, document_id: &str, reason: PresenceReason) -> Vec<PresenceEntry> {
        let editors = match self.presence.list_active(document_id).await {
            Ok(editors) => editors,
            Err(e) => {
                warn!("Presence list failed for {}: {}", document_id, e);
                Vec::new()
            }
        };

        let recipients: Vec<(SessionId, mpsc::Sender<ServerEvent>, bool)> = self
            .channels
            .get(document_id)
            .map(|members| members.iter().copied().collect::<Vec<_>>())
            .unwrap_or_default()
            .into_iter()
            .filter_map(|id| {
                let session = self.sessions.get(&id)?;
                let is_mobile = session.channels.get(document_id).is_some_and(|i| i.is_mobile);
                Some((id, session.sender.clone(), is_mobile))
            })
            .collect();

        for (id, sender, is_mobile) in recipients {
            let poll = recommended_poll_interval(editors.len(), is_mobile);
            Self::deliver(
                id,
                &sender,
                ServerEvent::PresenceChanged {
                    document_id: document_id.to_string(),
                    reason,
                    editors: editors.clone(),
                    recommended_poll_ms: poll.as_millis() as u64,
                },
            );
        }
        editors
    }

    /// Remove the session from a channel; returns its user if it was a member.
    fn drop_membership(&self, session_id: SessionId, document_id: &str) -> Option<String> {
        let user_id = {
            let mut session = self.sessions.get_mut(&session_id)?;
            session.channels.remove(document_id)?;
            session.user_id.clone()
        };
        if let Some(mut members) = self.channels.get_mut(document_id) {
            members.remove(&session_id);
        }
        self.channels.remove_if(document_id, |_, members| members.is_empty());
        Some(user_id)
    }

    /// Drop the user's presence unless another of their sessions remains.
    async fn release_presence(&self, document_id: &str, user_id: &str) {
        let still_connected = !self
            .members(document_id, |_, user| user == user_id)
            .is_empty();
        if still_connected {
            debug!("{} still connected to {} elsewhere", user_id, document_id);
            return;
        }
        if let Err(e) = self.presence.leave(document_id, user_id).await {
            warn!("Presence leave failed for {} on {}: {}", user_id, document_id, e);
        }
    }

    /// Snapshot channel members matching `filter` without holding map guards.
    fn members(
        &self,
        document_id: &str,
        filter: impl Fn(&SessionId, &str) -> bool,
    ) -> Vec<(SessionId, mpsc::Sender<ServerEvent>)> {
        let ids: Vec<SessionId> = self
            .channels
            .get(document_id)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default();
        ids.into_iter()
            .filter_map(|id| {
                let session = self.sessions.get(&id)?;
                filter(&id, &session.user_id).then(|| (id, session.sender.clone()))
            })
            .collect()
    }

    fn deliver(session_id: SessionId, sender: &mpsc::Sender<ServerEvent>, event: ServerEvent) {
        match sender.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Session {} is not keeping up, dropping event", session_id)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Session {} already closed", session_id)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notesync_core::{ManualClock, PresenceConfig, PresenceStore};
    use notesync_local::MemoryPresenceStore;
    use std::time::Duration;

    fn setup() -> (Arc<BroadcastHub>, ManualClock) {
        let clock = ManualClock::default();
        let presence = PresenceRegistry::new(
            Arc::new(MemoryPresenceStore::new()),
            Arc::new(clock.clone()),
            PresenceConfig::default(),
        );
        (Arc::new(BroadcastHub::new(presence, Arc::new(clock.clone()))), clock)
    }

    fn info(name: &str) -> PresenceInfo {
        PresenceInfo {
            display_name: name.to_string(),
            ..PresenceInfo::default()
        }
    }

    fn drain(rx: &mut mpsc::Receiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn editors_of(event: &ServerEvent) -> Vec<String> {
        match event {
            ServerEvent::PresenceChanged { editors, .. } => {
                editors.iter().map(|e| e.user_id.clone()).collect()
            }
            other => panic!("expected presence-changed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_join_publishes_fresh_list_to_everyone() {
        let (hub, _clock) = setup();
        let (alice, mut alice_rx) = hub.register_session("alice");
        let (bob, mut bob_rx) = hub.register_session("bob");

        hub.join_channel(alice, "note-1", info("Alice")).await.unwrap();
        hub.join_channel(bob, "note-1", info("Bob")).await.unwrap();

        let alice_events = drain(&mut alice_rx);
        assert_eq!(alice_events.len(), 2);
        assert_eq!(editors_of(&alice_events[1]), vec!["alice", "bob"]);

        let bob_events = drain(&mut bob_rx);
        assert_eq!(bob_events.len(), 1);
        assert_eq!(editors_of(&bob_events[0]), vec!["alice", "bob"]);
    }

    #[tokio::test]
    async fn test_broadcast_excludes_sender() {
        let (hub, _clock) = setup();
        let (alice, mut alice_rx) = hub.register_session("alice");
        let (bob, mut bob_rx) = hub.register_session("bob");
        hub.join_channel(alice, "note-1", info("Alice")).await.unwrap();
        hub.join_channel(bob, "note-1", info("Bob")).await.unwrap();
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        let event = ServerEvent::error("test", "hello", None);
        hub.broadcast("note-1", event.clone(), Some(alice));

        assert!(drain(&mut alice_rx).is_empty());
        assert_eq!(drain(&mut bob_rx), vec![event]);
    }

    #[tokio::test]
    async fn test_disconnect_cleans_every_channel() {
        let (hub, _clock) = setup();
        let (alice, _alice_rx) = hub.register_session("alice");
        let (bob, mut bob_rx) = hub.register_session("bob");
        for doc in ["note-1", "note-2"] {
            hub.join_channel(alice, doc, info("Alice")).await.unwrap();
            hub.join_channel(bob, doc, info("Bob")).await.unwrap();
        }
        drain(&mut bob_rx);

        hub.disconnect(alice).await;

        let events = drain(&mut bob_rx);
        assert_eq!(events.len(), 2);
        for event in &events {
            assert!(matches!(
                event,
                ServerEvent::PresenceChanged { reason: PresenceReason::Disconnect, .. }
            ));
            assert_eq!(editors_of(event), vec!["bob"]);
        }
        assert_eq!(hub.member_count("note-1"), 1);
        assert_eq!(hub.session_count(), 1);
    }

    #[tokio::test]
    async fn test_second_session_keeps_user_present() {
        let (hub, _clock) = setup();
        let (laptop, _laptop_rx) = hub.register_session("alice");
        let (phone, mut phone_rx) = hub.register_session("alice");
        hub.join_channel(laptop, "note-1", info("Alice")).await.unwrap();
        hub.join_channel(phone, "note-1", info("Alice")).await.unwrap();
        drain(&mut phone_rx);

        hub.leave_channel(laptop, "note-1").await;

        let events = drain(&mut phone_rx);
        assert_eq!(editors_of(&events[0]), vec!["alice"]);
    }

    #[tokio::test]
    async fn test_heartbeat_acks_and_reports_timeouts() {
        let (hub, clock) = setup();
        let (alice, mut alice_rx) = hub.register_session("alice");
        let (bob, mut bob_rx) = hub.register_session("bob");
        hub.join_channel(alice, "note-1", info("Alice")).await.unwrap();
        clock.advance(Duration::from_secs(200));
        hub.join_channel(bob, "note-1", info("Bob")).await.unwrap();
        clock.advance(Duration::from_secs(150));
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        hub.heartbeat(bob, "note-1", Some(true)).await;

        let events = drain(&mut bob_rx);
        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[0],
            ServerEvent::PresenceChanged { reason: PresenceReason::Timeout, .. }
        ));
        assert_eq!(editors_of(&events[0]), vec!["bob"]);
        match &events[1] {
            ServerEvent::HeartbeatAck { recommended_poll_ms, .. } => {
                assert_eq!(*recommended_poll_ms, 30_000)
            }
            other => panic!("expected heartbeat-ack, got {:?}", other),
        }
        // The ack is unicast.
        assert!(drain(&mut alice_rx)
            .iter()
            .all(|e| !matches!(e, ServerEvent::HeartbeatAck { .. })));
    }

    /// Presence store that is always down.
    struct DownStore;

    #[async_trait::async_trait]
    impl PresenceStore for DownStore {
        fn backend_name(&self) -> &'static str {
            "down"
        }
        async fn upsert(&self, _: &PresenceEntry, _: Duration) -> Result<(), SyncError> {
            Err(SyncError::Network("down".into()))
        }
        async fn get(&self, _: &str, _: &str) -> Result<Option<PresenceEntry>, SyncError> {
            Err(SyncError::Network("down".into()))
        }
        async fn remove(&self, _: &str, _: &[String]) -> Result<usize, SyncError> {
            Err(SyncError::Network("down".into()))
        }
        async fn list(&self, _: &str) -> Result<Vec<PresenceEntry>, SyncError> {
            Err(SyncError::Network("down".into()))
        }
        async fn documents(&self) -> Result<Vec<String>, SyncError> {
            Err(SyncError::Network("down".into()))
        }
    }

    #[tokio::test]
    async fn test_presence_outage_does_not_block_membership() {
        let presence = PresenceRegistry::new(
            Arc::new(DownStore),
            Arc::new(ManualClock::default()),
            PresenceConfig::default(),
        );
        let hub = BroadcastHub::new(presence, Arc::new(ManualClock::default()));
        let (alice, mut alice_rx) = hub.register_session("alice");

        let editors = hub.join_channel(alice, "note-1", info("Alice")).await.unwrap();
        assert!(editors.is_empty());
        assert_eq!(hub.member_count("note-1"), 1);
        assert_eq!(editors_of(&drain(&mut alice_rx)[0]), Vec::<String>::new());

        hub.disconnect(alice).await;
        assert_eq!(hub.member_count("note-1"), 0);
    }
}
