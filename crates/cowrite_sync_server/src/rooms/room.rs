//! A single collaboration room: membership, chat history, presence, and
//! the relay fan-out channel.
//!
//! All mutable room state lives behind one `tokio::sync::Mutex`, so every
//! operation on a given room is serialized while different rooms proceed
//! independently. Fan-out goes through a `broadcast` channel carrying
//! pre-serialized frames; each frame may name a connection to exclude and
//! receivers drop their own frames on that basis.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use cowrite_core::protocol::{
    ActivityKind, CapacityInfo, ChatMessage, ErrorCode, ServerEvent, UserInfo,
};
use tokio::sync::{Mutex, broadcast};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Nicknames longer than this are rejected with `VALIDATION`.
pub const MAX_NICKNAME_LEN: usize = 32;
/// Chat messages longer than this are rejected with `VALIDATION`.
pub const MAX_MESSAGE_LEN: usize = 2000;

/// A pre-serialized event fanned out to a room's connections.
///
/// `exclude` names the originating connection; its receiver drops the
/// frame so relayed deltas and presence events reach only the OTHER
/// members.
#[derive(Debug, Clone)]
pub struct RoomFrame {
    pub payload: Arc<str>,
    pub exclude: Option<u64>,
}

/// A seat in the room. Offline members keep their seat so a resume within
/// the room's lifetime reclaims the same identity.
#[derive(Debug)]
struct Member {
    user_id: String,
    nickname: String,
    joined_at: DateTime<Utc>,
    is_online: bool,
    connection_id: Option<u64>,
}

impl Member {
    fn to_user_info(&self) -> UserInfo {
        UserInfo {
            id: self.user_id.clone(),
            nickname: self.nickname.clone(),
            joined_at: self.joined_at,
            is_online: self.is_online,
        }
    }
}

struct RoomState {
    /// Members in join order; the order drives owner succession.
    members: Vec<Member>,
    /// Server-ordered linear chat history, trimmed to `history_limit`.
    messages: VecDeque<ChatMessage>,
    owner_id: Option<String>,
    last_activity: DateTime<Utc>,
    /// Set once by eviction; a closed room admits no one and relays nothing.
    closed: bool,
}

impl RoomState {
    fn find_by_connection(&self, connection_id: u64) -> Option<&Member> {
        self.members
            .iter()
            .find(|m| m.connection_id == Some(connection_id))
    }

    fn owner_nickname(&self) -> String {
        self.owner_id
            .as_deref()
            .and_then(|id| self.members.iter().find(|m| m.user_id == id))
            .map(|m| m.nickname.clone())
            .unwrap_or_default()
    }
}

/// Everything a freshly joined connection needs: its identity, the room
/// snapshot, and a subscription to the fan-out channel.
#[derive(Debug)]
pub struct JoinSnapshot {
    pub user_id: String,
    pub users: Vec<UserInfo>,
    pub messages: Vec<ChatMessage>,
    pub owner_id: String,
    pub owner_nickname: String,
    pub capacity: CapacityInfo,
    pub frames: broadcast::Receiver<RoomFrame>,
}

/// One collaboration room.
pub struct Room {
    id: String,
    capacity: usize,
    history_limit: usize,
    created_at: DateTime<Utc>,
    state: Mutex<RoomState>,
    broadcast_tx: broadcast::Sender<RoomFrame>,
}

impl Room {
    pub fn new(id: String, capacity: usize, history_limit: usize, now: DateTime<Utc>) -> Self {
        let (broadcast_tx, _) = broadcast::channel(1024);
        Self {
            id,
            capacity,
            history_limit,
            created_at: now,
            state: Mutex::new(RoomState {
                members: Vec::new(),
                messages: VecDeque::new(),
                owner_id: None,
                last_activity: now,
                closed: false,
            }),
            broadcast_tx,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Serialize an event and fan it out, optionally excluding the sender.
    fn broadcast(&self, event: &ServerEvent, exclude: Option<u64>) {
        let payload = match serde_json::to_string(event) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize broadcast event in room {}: {}", self.id, e);
                return;
            }
        };
        // No receivers is fine (last member just left)
        let _ = self.broadcast_tx.send(RoomFrame {
            payload: Arc::from(payload),
            exclude,
        });
    }

    // ==================== Admission ====================

    /// Admit a connection into the room.
    ///
    /// A `resume_user_id` matching an existing seat reclaims it (even past
    /// capacity checks: the seat is already counted). Otherwise this is a
    /// fresh join: capacity is enforced on total seats and the nickname
    /// must be unique among currently online members (case-sensitive).
    pub async fn join(
        &self,
        nickname: &str,
        resume_user_id: Option<&str>,
        connection_id: u64,
        now: DateTime<Utc>,
    ) -> Result<JoinSnapshot, ErrorCode> {
        let nickname = nickname.trim();
        if nickname.is_empty() || nickname.len() > MAX_NICKNAME_LEN {
            return Err(ErrorCode::Validation);
        }

        let mut state = self.state.lock().await;
        if state.closed {
            return Err(ErrorCode::RoomNotFound);
        }

        let resumed = resume_user_id
            .and_then(|rid| state.members.iter().position(|m| m.user_id == rid));

        let user_id = match resumed {
            Some(idx) => {
                // Reconnection path: same identity, new connection handle.
                let member = &mut state.members[idx];
                member.is_online = true;
                member.connection_id = Some(connection_id);
                let user_id = member.user_id.clone();
                info!("Room {}: {} resumed as {}", self.id, member.nickname, user_id);
                user_id
            }
            None => {
                if state.members.len() >= self.capacity {
                    return Err(ErrorCode::RoomFull);
                }
                if state
                    .members
                    .iter()
                    .any(|m| m.is_online && m.nickname == nickname)
                {
                    return Err(ErrorCode::NicknameTaken);
                }

                let user_id = Uuid::new_v4().to_string();
                state.members.push(Member {
                    user_id: user_id.clone(),
                    nickname: nickname.to_string(),
                    joined_at: now,
                    is_online: true,
                    connection_id: Some(connection_id),
                });
                if state.owner_id.is_none() {
                    state.owner_id = Some(user_id.clone());
                }
                info!("Room {}: {} joined as {}", self.id, nickname, user_id);
                user_id
            }
        };

        state.last_activity = now;

        // Subscribe under the lock so the snapshot and the frame stream
        // form a consistent cut of room history.
        let frames = self.broadcast_tx.subscribe();

        let joined = state
            .members
            .iter()
            .find(|m| m.user_id == user_id)
            .map(Member::to_user_info)
            .ok_or(ErrorCode::InternalError)?;
        self.broadcast(&ServerEvent::UserJoined { user: joined }, Some(connection_id));

        Ok(JoinSnapshot {
            user_id,
            users: state.members.iter().map(Member::to_user_info).collect(),
            messages: state.messages.iter().cloned().collect(),
            owner_id: state.owner_id.clone().unwrap_or_default(),
            owner_nickname: state.owner_nickname(),
            capacity: CapacityInfo {
                current: state.members.len(),
                max: self.capacity,
            },
            frames,
        })
    }

    // ==================== Departure ====================

    /// Explicit leave: the seat is released entirely, no resume possible.
    pub async fn leave(&self, connection_id: u64, now: DateTime<Utc>) {
        let mut state = self.state.lock().await;
        let Some(idx) = state
            .members
            .iter()
            .position(|m| m.connection_id == Some(connection_id))
        else {
            return;
        };

        let member = state.members.remove(idx);
        state.last_activity = now;
        info!("Room {}: {} left", self.id, member.nickname);

        self.announce_departure(&mut state, &member.user_id, connection_id);
    }

    /// Transport dropped: keep the seat but mark it offline so the member
    /// can resume with the same identity.
    pub async fn connection_closed(&self, connection_id: u64, now: DateTime<Utc>) {
        let mut state = self.state.lock().await;
        let Some(member) = state
            .members
            .iter_mut()
            .find(|m| m.connection_id == Some(connection_id))
        else {
            return;
        };

        member.is_online = false;
        member.connection_id = None;
        let user_id = member.user_id.clone();
        state.last_activity = now;

        self.announce_departure(&mut state, &user_id, connection_id);
    }

    /// Shared departure bookkeeping: notify peers, synthesize the awareness
    /// removal, and hand ownership to the earliest-joined online member.
    fn announce_departure(&self, state: &mut RoomState, user_id: &str, connection_id: u64) {
        self.broadcast(
            &ServerEvent::UserLeft {
                user_id: user_id.to_string(),
            },
            Some(connection_id),
        );
        // Peers must drop the stale cursor, not keep a ghost entry.
        self.broadcast(
            &ServerEvent::AwarenessRemoval {
                user_id: user_id.to_string(),
            },
            Some(connection_id),
        );

        let owner_online = state
            .owner_id
            .as_deref()
            .and_then(|id| state.members.iter().find(|m| m.user_id == id))
            .is_some_and(|m| m.is_online);
        if owner_online {
            return;
        }

        // Earliest-joined online member inherits; with nobody online the
        // current owner keeps the room until eviction.
        if let Some(successor) = state.members.iter().find(|m| m.is_online) {
            let owner_id = successor.user_id.clone();
            let owner_nickname = successor.nickname.clone();
            if state.owner_id.as_deref() != Some(owner_id.as_str()) {
                info!("Room {}: ownership moved to {}", self.id, owner_nickname);
                state.owner_id = Some(owner_id.clone());
                self.broadcast(
                    &ServerEvent::OwnerChanged {
                        owner_id,
                        owner_nickname,
                    },
                    None,
                );
            }
        }
    }

    // ==================== Chat ====================

    /// Append a chat message and broadcast it to the whole room, sender
    /// included: the server-assigned order IS the history.
    pub async fn send_chat(
        &self,
        connection_id: u64,
        content: &str,
        now: DateTime<Utc>,
    ) -> Result<(), ErrorCode> {
        if content.trim().is_empty() || content.len() > MAX_MESSAGE_LEN {
            return Err(ErrorCode::Validation);
        }

        let mut state = self.state.lock().await;
        if state.closed {
            return Err(ErrorCode::RoomNotFound);
        }
        let member = state
            .find_by_connection(connection_id)
            .ok_or(ErrorCode::NotInRoom)?;

        let message = ChatMessage {
            id: Uuid::new_v4().to_string(),
            user_id: member.user_id.clone(),
            nickname: member.nickname.clone(),
            content: content.to_string(),
            timestamp: now,
        };

        state.messages.push_back(message.clone());
        while state.messages.len() > self.history_limit {
            state.messages.pop_front();
        }
        state.last_activity = now;

        self.broadcast(&ServerEvent::NewMessage { message }, None);
        Ok(())
    }

    /// Relay a typing indicator to the other members.
    pub async fn set_typing(&self, connection_id: u64, is_typing: bool) -> Result<(), ErrorCode> {
        let state = self.state.lock().await;
        if state.closed {
            return Ok(());
        }
        let member = state
            .find_by_connection(connection_id)
            .ok_or(ErrorCode::NotInRoom)?;

        self.broadcast(
            &ServerEvent::UserTypingStatus {
                user_id: member.user_id.clone(),
                nickname: member.nickname.clone(),
                is_typing,
            },
            Some(connection_id),
        );
        Ok(())
    }

    // ==================== Relay ====================

    /// Fan a document delta out to every other connection, verbatim. The
    /// payload is never inspected; a closed room drops it silently (the
    /// eviction race is not a client-visible error).
    pub async fn relay_document_update(
        &self,
        connection_id: u64,
        update: Vec<u8>,
        now: DateTime<Utc>,
    ) -> Result<(), ErrorCode> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Ok(());
        }
        let member = state
            .find_by_connection(connection_id)
            .ok_or(ErrorCode::NotInRoom)?;
        let user_id = member.user_id.clone();
        state.last_activity = now;

        self.broadcast(
            &ServerEvent::DocumentUpdate { update, user_id },
            Some(connection_id),
        );
        Ok(())
    }

    /// Same contract as document relay, for awareness deltas.
    pub async fn relay_awareness(
        &self,
        connection_id: u64,
        awareness: Vec<u8>,
        now: DateTime<Utc>,
    ) -> Result<(), ErrorCode> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Ok(());
        }
        let member = state
            .find_by_connection(connection_id)
            .ok_or(ErrorCode::NotInRoom)?;
        let user_id = member.user_id.clone();
        state.last_activity = now;

        self.broadcast(
            &ServerEvent::AwarenessUpdate { awareness, user_id },
            Some(connection_id),
        );
        Ok(())
    }

    /// Relay an activity heartbeat, stamped with the server clock.
    pub async fn relay_activity(
        &self,
        connection_id: u64,
        kind: ActivityKind,
        now: DateTime<Utc>,
    ) -> Result<(), ErrorCode> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Ok(());
        }
        let member = state
            .find_by_connection(connection_id)
            .ok_or(ErrorCode::NotInRoom)?;
        let user_id = member.user_id.clone();
        state.last_activity = now;

        self.broadcast(
            &ServerEvent::Activity {
                kind,
                ts: now,
                user_id,
            },
            Some(connection_id),
        );
        Ok(())
    }

    // ==================== Eviction ====================

    /// Close the room if it has been idle past `expiry` with nobody online.
    ///
    /// Takes the room lock for the whole check-and-close, so a join racing
    /// with eviction either completes first (and defeats the eviction) or
    /// observes the closed flag and gets `RoomNotFound`.
    pub async fn close_if_idle(&self, now: DateTime<Utc>, expiry: TimeDelta) -> bool {
        let mut state = self.state.lock().await;
        if state.closed {
            return true;
        }
        let anyone_online = state.members.iter().any(|m| m.is_online);
        if anyone_online || now - state.last_activity <= expiry {
            return false;
        }

        state.closed = true;
        info!("Room {}: closed after idle expiry", self.id);
        self.broadcast(
            &ServerEvent::RoomClosed {
                room_id: self.id.clone(),
            },
            None,
        );
        true
    }

    /// Unconditionally close the room (shutdown path).
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        if state.closed {
            return;
        }
        state.closed = true;
        self.broadcast(
            &ServerEvent::RoomClosed {
                room_id: self.id.clone(),
            },
            None,
        );
    }

    /// Number of currently online members.
    pub async fn online_count(&self) -> usize {
        let state = self.state.lock().await;
        state.members.iter().filter(|m| m.is_online).count()
    }

    /// Drain broadcast lag diagnostics into the log.
    pub fn log_lagged(&self, connection_id: u64, skipped: u64) {
        warn!(
            "Room {}: connection {} lagged, skipped {} frames",
            self.id, connection_id, skipped
        );
    }
}
