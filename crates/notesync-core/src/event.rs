//! Persistent channel vocabulary.
//!
//! Frames are JSON objects `{"event": "<name>", "data": {...}}` with
//! camelCase payload fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::fingerprint::ContentHash;
use crate::patch::Patch;
use crate::presence::{PresenceEntry, PresenceInfo};

/// A single submitted change: full replacement or an ordered patch list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Edit {
    Full { content: String },
    Patches { patches: Vec<Patch> },
}

/// Client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ClientEvent {
    JoinNote {
        document_id: String,
        #[serde(default)]
        info: PresenceInfo,
    },
    LeaveNote {
        document_id: String,
    },
    NoteUpdate {
        document_id: String,
        #[serde(default)]
        title: Option<String>,
        edit: Edit,
    },
    Heartbeat {
        document_id: String,
        #[serde(default)]
        is_mobile: Option<bool>,
    },
}

impl ClientEvent {
    pub fn document_id(&self) -> &str {
        match self {
            ClientEvent::JoinNote { document_id, .. }
            | ClientEvent::LeaveNote { document_id }
            | ClientEvent::NoteUpdate { document_id, .. }
            | ClientEvent::Heartbeat { document_id, .. } => document_id,
        }
    }
}

/// Why a presence list was republished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PresenceReason {
    Join,
    Leave,
    Timeout,
    MobileStatus,
    Disconnect,
}

/// Server to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    /// A live edit from another member, forwarded as submitted.
    NoteUpdated {
        document_id: String,
        editor_id: String,
        title: Option<String>,
        edit: Edit,
    },
    /// A flush completed; sent to members who did not contribute.
    NoteUpdatedBroadcast {
        document_id: String,
        content_hash: ContentHash,
        updated_at: DateTime<Utc>,
        last_editor: Option<String>,
    },
    PresenceChanged {
        document_id: String,
        reason: PresenceReason,
        editors: Vec<PresenceEntry>,
        recommended_poll_ms: u64,
    },
    /// Save confirmation with the authoritative content, for baseline resync.
    BatchSaved {
        document_id: String,
        title: String,
        content: String,
        content_hash: ContentHash,
        updated_at: DateTime<Utc>,
        update_count: usize,
    },
    HeartbeatAck {
        document_id: String,
        server_time: DateTime<Utc>,
        recommended_poll_ms: u64,
    },
    Error {
        code: String,
        message: String,
        document_id: Option<String>,
    },
}

impl ServerEvent {
    pub fn error(code: &str, message: impl Into<String>, document_id: Option<&str>) -> Self {
        ServerEvent::Error {
            code: code.to_string(),
            message: message.into(),
            document_id: document_id.map(str::to_string),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_frame_with_patches() {
        let frame = json!({
            "event": "note-update",
            "data": {
                "documentId": "doc-1",
                "edit": {
                    "kind": "patches",
                    "patches": [{"op": "insert", "position": 5, "text": " world"}]
                }
            }
        });
        let event: ClientEvent = serde_json::from_value(frame).unwrap();
        assert_eq!(event.document_id(), "doc-1");
        match event {
            ClientEvent::NoteUpdate { title, edit, .. } => {
                assert!(title.is_none());
                assert_eq!(
                    edit,
                    Edit::Patches {
                        patches: vec![Patch::Insert {
                            position: 5,
                            text: " world".into()
                        }]
                    }
                );
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_join_without_info() {
        let frame = json!({"event": "join-note", "data": {"documentId": "doc-1"}});
        let event: ClientEvent = serde_json::from_value(frame).unwrap();
        assert!(matches!(event, ClientEvent::JoinNote { info, .. } if info.display_name.is_empty()));
    }

    #[test]
    fn test_server_frame_names() {
        let event = ServerEvent::HeartbeatAck {
            document_id: "doc-1".into(),
            server_time: Utc::now(),
            recommended_poll_ms: 30_000,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "heartbeat-ack");
        assert_eq!(value["data"]["recommendedPollMs"], 30_000);

        let value = serde_json::to_value(ServerEvent::error("save-degraded", "retrying", Some("doc-1"))).unwrap();
        assert_eq!(value["event"], "error");
        assert_eq!(value["data"]["code"], "save-degraded");
        assert_eq!(value["data"]["documentId"], "doc-1");
    }
}
