//! Wire protocol shared by the server and the client sync agent.
//!
//! Every frame on the event channel is a JSON text message: an internally
//! tagged enum (`type` field) with camelCase payload fields. Document and
//! awareness payloads are opaque CRDT bytes produced by an external
//! replication library; they travel base64-encoded and are never
//! interpreted by either side of this crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Base64 (de)serialization for opaque binary payloads.
pub mod b64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

/// Typed error codes surfaced to clients on the `error` event and in
/// failed `room-joined` replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Validation,
    RoomNotFound,
    RoomFull,
    NicknameTaken,
    RateLimited,
    NotInRoom,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Validation => "VALIDATION",
            ErrorCode::RoomNotFound => "ROOM_NOT_FOUND",
            ErrorCode::RoomFull => "ROOM_FULL",
            ErrorCode::NicknameTaken => "NICKNAME_TAKEN",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::NotInRoom => "NOT_IN_ROOM",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A room member as seen on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub id: String,
    pub nickname: String,
    pub joined_at: DateTime<Utc>,
    pub is_online: bool,
}

/// An immutable chat message. `nickname` is denormalized at send time so
/// history stays readable after the sender leaves.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub user_id: String,
    pub nickname: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Room occupancy reported in the join reply.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CapacityInfo {
    pub current: usize,
    pub max: usize,
}

/// Lightweight activity heartbeat kinds (`editor:activity`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityKind {
    Edit,
    Save,
    Presence,
}

/// Events sent from a client to the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    /// Join (or resume into) a room. `user_id` carries a previously issued
    /// identity for silent rejoin; the server falls back to a fresh join
    /// when it does not match the room's member history.
    #[serde(rename = "join-room")]
    JoinRoom {
        room_id: String,
        nickname: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
    },
    #[serde(rename = "leave-room")]
    LeaveRoom,
    #[serde(rename = "send-message")]
    SendMessage { content: String },
    #[serde(rename = "user-typing")]
    UserTyping { is_typing: bool },
    /// One batched document delta. Opaque to the server.
    #[serde(rename = "editor:document-update")]
    DocumentUpdate {
        #[serde(with = "b64")]
        update: Vec<u8>,
    },
    /// One throttled awareness delta. Opaque to the server.
    #[serde(rename = "editor:awareness-update")]
    AwarenessUpdate {
        #[serde(with = "b64")]
        awareness: Vec<u8>,
    },
    #[serde(rename = "editor:activity")]
    Activity { kind: ActivityKind },
}

/// Events sent from the server to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    /// Reply to `join-room`. On failure only `success` and `error` are
    /// meaningful; the remaining fields are empty placeholders.
    #[serde(rename = "room-joined")]
    RoomJoined {
        success: bool,
        users: Vec<UserInfo>,
        messages: Vec<ChatMessage>,
        user_id: String,
        owner_id: String,
        owner_nickname: String,
        capacity: CapacityInfo,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorCode>,
    },
    #[serde(rename = "user-joined")]
    UserJoined { user: UserInfo },
    #[serde(rename = "user-left")]
    UserLeft { user_id: String },
    #[serde(rename = "new-message")]
    NewMessage { message: ChatMessage },
    #[serde(rename = "user-typing-status")]
    UserTypingStatus {
        user_id: String,
        nickname: String,
        is_typing: bool,
    },
    /// Relayed document delta, tagged with the originating user.
    #[serde(rename = "editor:document-update")]
    DocumentUpdate {
        #[serde(with = "b64")]
        update: Vec<u8>,
        user_id: String,
    },
    /// Relayed awareness delta, tagged with the originating user.
    #[serde(rename = "editor:awareness-update")]
    AwarenessUpdate {
        #[serde(with = "b64")]
        awareness: Vec<u8>,
        user_id: String,
    },
    /// Synthesized when a connection disconnects so peers garbage-collect
    /// the stale awareness entry instead of keeping a ghost cursor.
    #[serde(rename = "editor:awareness-removal")]
    AwarenessRemoval { user_id: String },
    #[serde(rename = "editor:activity")]
    Activity {
        kind: ActivityKind,
        ts: DateTime<Utc>,
        user_id: String,
    },
    /// Ownership moved to another member (owner went offline).
    #[serde(rename = "owner-changed")]
    OwnerChanged {
        owner_id: String,
        owner_nickname: String,
    },
    /// The room was destroyed server-side; clients must clear local state.
    #[serde(rename = "room-closed")]
    RoomClosed { room_id: String },
    #[serde(rename = "error")]
    Error { code: ErrorCode, message: String },
}

impl ServerEvent {
    /// Build a failed `room-joined` reply for an admission error.
    pub fn join_rejected(code: ErrorCode) -> Self {
        ServerEvent::RoomJoined {
            success: false,
            users: Vec::new(),
            messages: Vec::new(),
            user_id: String::new(),
            owner_id: String::new(),
            owner_nickname: String::new(),
            capacity: CapacityInfo { current: 0, max: 0 },
            error: Some(code),
        }
    }
}

/// Response body for `POST /create-room`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoomResponse {
    pub room_id: String,
    pub room_link: String,
}

/// Response body for `GET /room/{id}/exists`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RoomExistsResponse {
    pub exists: bool,
}
