//! WebSocket gateway: one socket maps to one room and one user.
//!
//! The protocol is join-first: the initial text frame must be `join-room`.
//! Admission failures are answered with a failed `room-joined` reply and
//! the socket is closed; after a successful join, inbound events dispatch
//! to the room and the outbound side drains the room's broadcast channel,
//! dropping frames the member originated itself.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use chrono::Utc;
use cowrite_core::protocol::{ClientEvent, ErrorCode, ServerEvent};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::AppState;
use crate::rooms::Room;

/// Process-wide connection id sequence; ids only need to be unique, not
/// secret, so a counter beats uuid allocation on the relay hot path.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

type WsSink = SplitSink<WebSocket, Message>;

/// WebSocket upgrade handler
pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn send_event(tx: &mut WsSink, event: &ServerEvent) -> Result<(), ()> {
    let json = serde_json::to_string(event).map_err(|_| ())?;
    tx.send(Message::Text(json.into())).await.map_err(|_| ())
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let connection_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);

    // Join-first: reject everything until a valid join-room arrives.
    let (room, mut frames, user_id) = loop {
        let msg = match ws_rx.next().await {
            Some(Ok(msg)) => msg,
            Some(Err(_)) | None => return,
        };
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => return,
            _ => continue,
        };

        let event: ClientEvent = match serde_json::from_str(&text) {
            Ok(ev) => ev,
            Err(e) => {
                debug!("Connection {}: malformed frame before join: {}", connection_id, e);
                let ev = ServerEvent::Error {
                    code: ErrorCode::Validation,
                    message: "malformed event".to_string(),
                };
                if send_event(&mut ws_tx, &ev).await.is_err() {
                    return;
                }
                continue;
            }
        };

        let ClientEvent::JoinRoom {
            room_id,
            nickname,
            user_id,
        } = event
        else {
            let ev = ServerEvent::Error {
                code: ErrorCode::NotInRoom,
                message: "join a room first".to_string(),
            };
            if send_event(&mut ws_tx, &ev).await.is_err() {
                return;
            }
            continue;
        };

        let Some(room) = state.registry.get(&room_id).await else {
            warn!("Connection {}: join rejected, room {} not found", connection_id, room_id);
            let _ = send_event(&mut ws_tx, &ServerEvent::join_rejected(ErrorCode::RoomNotFound))
                .await;
            return;
        };

        match room
            .join(&nickname, user_id.as_deref(), connection_id, Utc::now())
            .await
        {
            Ok(snapshot) => {
                let reply = ServerEvent::RoomJoined {
                    success: true,
                    users: snapshot.users,
                    messages: snapshot.messages,
                    user_id: snapshot.user_id.clone(),
                    owner_id: snapshot.owner_id,
                    owner_nickname: snapshot.owner_nickname,
                    capacity: snapshot.capacity,
                    error: None,
                };
                if send_event(&mut ws_tx, &reply).await.is_err() {
                    room.connection_closed(connection_id, Utc::now()).await;
                    return;
                }
                info!(
                    "Connection {} joined room {} as {}",
                    connection_id,
                    room.id(),
                    snapshot.user_id
                );
                break (room, snapshot.frames, snapshot.user_id);
            }
            Err(code) => {
                warn!("Connection {}: join rejected ({})", connection_id, code);
                let _ = send_event(&mut ws_tx, &ServerEvent::join_rejected(code)).await;
                return;
            }
        }
    };

    let mut left_explicitly = false;

    loop {
        tokio::select! {
            frame = frames.recv() => match frame {
                Ok(frame) => {
                    if frame.exclude == Some(connection_id) {
                        continue;
                    }
                    if ws_tx
                        .send(Message::Text(frame.payload.to_string().into()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    room.log_lagged(connection_id, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            msg = ws_rx.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => continue,
                };

                match dispatch_event(&state, &room, connection_id, &user_id, &text).await {
                    Dispatch::Continue => {}
                    Dispatch::Reply(event) => {
                        if send_event(&mut ws_tx, &event).await.is_err() {
                            break;
                        }
                    }
                    Dispatch::Leave => {
                        left_explicitly = true;
                        break;
                    }
                }
            }
        }
    }

    if !left_explicitly {
        // Keep the seat for a grace-period resume.
        room.connection_closed(connection_id, Utc::now()).await;
    }
    info!("Connection {} disconnected from room {}", connection_id, room.id());
}

enum Dispatch {
    Continue,
    Reply(ServerEvent),
    Leave,
}

/// Route one in-session client event. Admission and action errors go back
/// to the initiating client only, never to the room.
async fn dispatch_event(
    state: &AppState,
    room: &Arc<Room>,
    connection_id: u64,
    user_id: &str,
    text: &str,
) -> Dispatch {
    let event: ClientEvent = match serde_json::from_str(text) {
        Ok(ev) => ev,
        Err(e) => {
            debug!("Connection {}: malformed frame: {}", connection_id, e);
            return Dispatch::Reply(ServerEvent::Error {
                code: ErrorCode::Validation,
                message: "malformed event".to_string(),
            });
        }
    };

    let now = Utc::now();
    let result = match event {
        ClientEvent::JoinRoom { .. } => {
            return Dispatch::Reply(ServerEvent::Error {
                code: ErrorCode::Validation,
                message: "already in a room".to_string(),
            });
        }
        ClientEvent::LeaveRoom => {
            room.leave(connection_id, now).await;
            return Dispatch::Leave;
        }
        ClientEvent::SendMessage { content } => {
            if let Err(retry_after) = state.rate_limiter.try_send(
                user_id,
                state.config.chat_rate_limit,
                Duration::from_secs(state.config.chat_rate_window_secs),
            ) {
                return Dispatch::Reply(ServerEvent::Error {
                    code: ErrorCode::RateLimited,
                    message: format!("too many messages, retry in {}s", retry_after),
                });
            }
            room.send_chat(connection_id, &content, now).await
        }
        ClientEvent::UserTyping { is_typing } => room.set_typing(connection_id, is_typing).await,
        ClientEvent::DocumentUpdate { update } => {
            room.relay_document_update(connection_id, update, now).await
        }
        ClientEvent::AwarenessUpdate { awareness } => {
            room.relay_awareness(connection_id, awareness, now).await
        }
        ClientEvent::Activity { kind } => room.relay_activity(connection_id, kind, now).await,
    };

    match result {
        Ok(()) => Dispatch::Continue,
        Err(code) => Dispatch::Reply(ServerEvent::Error {
            code,
            message: code.to_string(),
        }),
    }
}
