//! WebSocket handler — the live messaging transport.
//!
//! DESIGN
//! ======
//! On upgrade, registers a per-connection channel and enters a `select!`
//! loop:
//! - Incoming client frames → parse into `ClientEvent` + dispatch to the
//!   room directory
//! - `ServerEvent`s fanned in from room actors and the presence tracker →
//!   forward to the client
//!
//! Dispatch is factored into `process_client_text`, which returns the
//! events owed to the sender; room actors push everything else through
//! the registry. Tests exercise dispatch in-process without a socket.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade with `?token=` → validate → send `connected`
//! 2. Register the connection (flips presence on the user's first socket)
//! 3. Client events → dispatch → sender replies / actor fan-out
//! 4. Close → leave every joined room → unregister → presence may flip off

use std::collections::{HashMap, HashSet};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::event::{ClientEvent, RoomError, ServerEvent};
use crate::services::store::SessionUser;
use crate::state::AppState;

// =============================================================================
// UPGRADE
// =============================================================================

pub async fn handle_ws(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(token) = params.get("token") else {
        return (StatusCode::UNAUTHORIZED, "token required").into_response();
    };

    let user = match state.store.validate_token(token).await {
        Ok(Some(user)) => user,
        Ok(None) => return (StatusCode::UNAUTHORIZED, "invalid or expired token").into_response(),
        Err(e) => {
            tracing::error!(error = %e, "ws: token validation failed");
            return (StatusCode::SERVICE_UNAVAILABLE, "token validation error").into_response();
        }
    };

    ws.on_upgrade(move |socket| run_ws(socket, state, user))
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_ws(mut socket: WebSocket, state: AppState, user: SessionUser) {
    let conn_id = Uuid::new_v4();

    // Per-connection channel; room actors and the presence tracker push
    // ServerEvents here through the registry.
    let (conn_tx, mut conn_rx) = mpsc::channel::<ServerEvent>(256);

    let welcome = ServerEvent::Connected {
        user_id: user.id,
        user_name: user.name.clone(),
    };
    if send_event(&mut socket, &welcome).await.is_err() {
        return;
    }

    state.registry.register(user.id, conn_id, conn_tx.clone());
    info!(%conn_id, user_id = %user.id, "ws: client connected");

    // Rooms this connection has joined; each needs a leave on the way out.
    let mut joined: HashSet<Uuid> = HashSet::new();

    loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(msg) = msg else { break };
                let Ok(msg) = msg else { break };
                match msg {
                    Message::Text(text) => {
                        let replies =
                            process_client_text(&state, &mut joined, conn_id, &user, &conn_tx, &text).await;
                        for event in replies {
                            let _ = send_event(&mut socket, &event).await;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            Some(event) = conn_rx.recv() => {
                if send_event(&mut socket, &event).await.is_err() {
                    break;
                }
            }
        }
    }

    // Leave rooms BEFORE unregistering so receipt windows flush and actors
    // can evict; the unregister then drives the presence edge.
    for room_id in joined {
        state.rooms.leave(room_id, conn_id).await;
    }
    state.registry.unregister(conn_id);
    info!(%conn_id, user_id = %user.id, "ws: client disconnected");
}

// =============================================================================
// EVENT DISPATCH
// =============================================================================

/// Parse and process one inbound text frame and return the events owed to
/// the sender. Everything addressed to other parties (fan-out, receipts,
/// typing) flows through the room actors and the registry instead.
async fn process_client_text(
    state: &AppState,
    joined: &mut HashSet<Uuid>,
    conn_id: Uuid,
    user: &SessionUser,
    conn_tx: &mpsc::Sender<ServerEvent>,
    text: &str,
) -> Vec<ServerEvent> {
    let event: ClientEvent = match serde_json::from_str(text) {
        Ok(ev) => ev,
        Err(e) => {
            warn!(%conn_id, error = %e, "ws: malformed client event");
            return vec![ServerEvent::Error {
                code: "E_MALFORMED".into(),
                message: format!("malformed event: {e}"),
                retryable: false,
                room_id: None,
            }];
        }
    };

    let room_id = event.room_id();

    // Everything except join/leave requires this connection to be in the room.
    let needs_session = !matches!(event, ClientEvent::JoinRoom { .. } | ClientEvent::LeaveRoom { .. });
    if needs_session && !joined.contains(&room_id) {
        let err = RoomError::NotJoined(room_id);
        return vec![ServerEvent::error_from(&err, Some(room_id))];
    }

    let result = match event {
        ClientEvent::JoinRoom { room_id, last_seen_seq } => {
            return match state.rooms.join(room_id, conn_id, user, last_seen_seq, conn_tx).await {
                Ok(snapshot) => {
                    joined.insert(room_id);
                    vec![ServerEvent::RoomJoined {
                        room: snapshot.room,
                        members: snapshot.members,
                        online_user_ids: snapshot.online_user_ids,
                        messages: snapshot.messages,
                    }]
                }
                Err(err) => vec![ServerEvent::error_from(&err, Some(room_id))],
            };
        }
        ClientEvent::LeaveRoom { room_id } => {
            if joined.remove(&room_id) {
                state.rooms.leave(room_id, conn_id).await;
            }
            return vec![ServerEvent::RoomLeft { room_id }];
        }
        ClientEvent::SendMessage {
            room_id,
            content,
            kind,
            reply_to,
            forward_of,
        } => {
            state
                .rooms
                .post_message(room_id, user, kind, content, reply_to, forward_of)
                .await
        }
        ClientEvent::EditMessage {
            room_id,
            message_id,
            content,
            kind,
        } => state.rooms.edit_message(room_id, user.id, message_id, content, kind).await,
        ClientEvent::DeleteMessage { room_id, message_id } => {
            state.rooms.delete_message(room_id, user.id, message_id).await
        }
        ClientEvent::TypingStart { room_id } => state.rooms.set_typing(room_id, user.id, true).await,
        ClientEvent::TypingStop { room_id } => state.rooms.set_typing(room_id, user.id, false).await,
        ClientEvent::MarkDelivered { room_id, message_id } => {
            state.rooms.mark_receipt(room_id, user.id, message_id, false).await
        }
        ClientEvent::MarkRead { room_id, message_id } => {
            state.rooms.mark_receipt(room_id, user.id, message_id, true).await
        }
        ClientEvent::FetchReceipts { room_id, message_id } => {
            return match state.rooms.fetch_receipts(room_id, user.id, message_id).await {
                Ok(receipts) => vec![receipts],
                Err(err) => vec![ServerEvent::error_from(&err, Some(room_id))],
            };
        }
    };

    // Accepted work is acknowledged by the actor's own fan-out (the sender
    // hears its message echoed with the assigned seq), so success is silent.
    match result {
        Ok(()) => vec![],
        Err(err) => vec![ServerEvent::error_from(&err, Some(room_id))],
    }
}

// =============================================================================
// OUTBOUND
// =============================================================================

async fn send_event(socket: &mut WebSocket, event: &ServerEvent) -> Result<(), ()> {
    let json = match serde_json::to_string(event) {
        Ok(j) => j,
        Err(e) => {
            warn!(error = %e, "ws: failed to serialize event");
            return Err(());
        }
    };
    match event {
        ServerEvent::Error {
            code, message, retryable, ..
        } => {
            warn!(%code, %message, retryable = *retryable, "ws: send error event");
        }
        // Typing churn is ephemeral; logging it would drown everything else.
        ServerEvent::UserTyping { .. } | ServerEvent::UserStoppedTyping { .. } => {}
        _ => {
            info!(name = event.name(), "ws: send event");
        }
    }
    socket.send(Message::Text(json.into())).await.map_err(|_| ())
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
