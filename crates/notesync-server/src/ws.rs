//! Persistent channel over WebSocket.
//!
//! One socket is one hub session. Incoming text frames are `ClientEvent`s;
//! everything the hub queues for the session is written back as
//! `ServerEvent` frames by a dedicated writer task.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use notesync_core::{ClientEvent, Edit, ServerEvent};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::{ApiError, Result};
use crate::handlers::{AppState, USER_ID_HEADER};
use crate::hub::SessionId;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsQuery {
    /// Fallback for clients that cannot set headers on the upgrade request.
    pub user_id: Option<String>,
}

/// GET /ws - Upgrade to the persistent channel.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
) -> Result<Response> {
    let user_id = headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or(query.user_id)
        .filter(|v| !v.trim().is_empty())
        .ok_or(ApiError::Unauthenticated)?;

    Ok(ws.on_upgrade(move |socket| handle_socket(state, user_id, socket)))
}

async fn handle_socket(state: AppState, user_id: String, socket: WebSocket) {
    let (session_id, mut events) = state.hub.register_session(&user_id);
    info!("[{}] Channel opened for {}", session_id, user_id);

    let (mut sink, mut stream) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    warn!("[{}] Failed to encode event: {}", session_id, e);
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = stream.next().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                debug!("[{}] Socket error: {}", session_id, e);
                break;
            }
        };
        match message {
            Message::Text(text) => match serde_json::from_str::<ClientEvent>(text.as_str()) {
                Ok(event) => handle_client_event(&state, session_id, &user_id, event).await,
                Err(e) => state.hub.send_to(
                    session_id,
                    ServerEvent::error("invalid-event", e.to_string(), None),
                ),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    state.hub.disconnect(session_id).await;
    writer.abort();
    info!("[{}] Channel closed for {}", session_id, user_id);
}

/// Dispatch one client event for a session.
///
/// Failures are reported back on the session as `error` events; the channel
/// itself stays open.
pub async fn handle_client_event(
    state: &AppState,
    session_id: SessionId,
    user_id: &str,
    event: ClientEvent,
) {
    let document_id = event.document_id().to_string();
    let result = match event {
        ClientEvent::JoinNote { document_id, info } => state
            .hub
            .join_channel(session_id, &document_id, info)
            .await
            .map(|_| ())
            .map_err(ApiError::from),
        ClientEvent::LeaveNote { document_id } => {
            state.hub.leave_channel(session_id, &document_id).await;
            Ok(())
        }
        ClientEvent::Heartbeat {
            document_id,
            is_mobile,
        } => {
            state.hub.heartbeat(session_id, &document_id, is_mobile).await;
            Ok(())
        }
        ClientEvent::NoteUpdate {
            document_id,
            title,
            edit,
        } => submit_update(state, session_id, user_id, document_id, title, edit).await,
    };

    if let Err(e) = result {
        debug!("[{}] Event on {} failed: {}", session_id, document_id, e);
        state.hub.send_to(
            session_id,
            ServerEvent::error(e.code(), e.to_string(), Some(&document_id)),
        );
    }
}

async fn submit_update(
    state: &AppState,
    session_id: SessionId,
    user_id: &str,
    document_id: String,
    title: Option<String>,
    edit: Edit,
) -> Result<()> {
    state.ensure_can_edit(&document_id, user_id).await?;
    let ack = state
        .batches
        .submit(&document_id, user_id, title.clone(), edit.clone())
        .await?;

    // Peers must not replay patches the server skipped; send the result.
    let edit = match edit {
        Edit::Patches { .. } if ack.skipped > 0 => Edit::Full {
            content: ack.content,
        },
        edit => edit,
    };

    state.hub.broadcast(
        &document_id,
        ServerEvent::NoteUpdated {
            document_id: document_id.clone(),
            editor_id: user_id.to_string(),
            title,
            edit,
        },
        Some(session_id),
    );
    Ok(())
}
