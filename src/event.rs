//! Event contract — the typed WebSocket vocabulary for studyhall.
//!
//! DESIGN
//! ======
//! Every websocket payload is a tagged union, one enum per direction:
//! `ClientEvent` for inbound frames, `ServerEvent` for outbound. Serde
//! validates shape at the boundary, so handlers never poke at loose JSON
//! maps. The wire form is `{"event": "<name>", "data": {...}}`.
//!
//! This module also owns the shared message model (`Message` mirrors the
//! `messages` table) and the room-level error taxonomy with grepable codes.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// KINDS AND ROLES
// =============================================================================

/// Room flavor. Direct rooms have exactly two frozen participants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomKind {
    Direct,
    Group,
    Course,
    Announcement,
}

impl RoomKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Group => "group",
            Self::Course => "course",
            Self::Announcement => "announcement",
        }
    }

    #[must_use]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "direct" => Some(Self::Direct),
            "group" => Some(Self::Group),
            "course" => Some(Self::Course),
            "announcement" => Some(Self::Announcement),
            _ => None,
        }
    }
}

/// Message content kind. `System` is reserved for server-generated messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    File,
    Video,
    Audio,
    System,
    Announcement,
}

impl MessageKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::File => "file",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::System => "system",
            Self::Announcement => "announcement",
        }
    }

    #[must_use]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "text" => Some(Self::Text),
            "image" => Some(Self::Image),
            "file" => Some(Self::File),
            "video" => Some(Self::Video),
            "audio" => Some(Self::Audio),
            "system" => Some(Self::System),
            "announcement" => Some(Self::Announcement),
            _ => None,
        }
    }
}

/// Participant role within a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberRole {
    Member,
    Admin,
    Owner,
}

impl MemberRole {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Member => "member",
            Self::Admin => "admin",
            Self::Owner => "owner",
        }
    }

    #[must_use]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "member" => Some(Self::Member),
            "admin" => Some(Self::Admin),
            "owner" => Some(Self::Owner),
            _ => None,
        }
    }

    /// Admins and owners may purge history and mutate membership.
    #[must_use]
    pub fn is_admin(self) -> bool {
        matches!(self, Self::Admin | Self::Owner)
    }
}

// =============================================================================
// MESSAGE MODEL
// =============================================================================

/// Sender-visible aggregate of the per-recipient progress sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryState {
    #[default]
    Sent,
    Delivered,
    Read,
}

/// A chat message. Mirrors the `messages` table.
///
/// `seq` is the per-room position assigned at acceptance and never
/// reassigned. `delivered_to` and `read_by` map recipient id to the
/// millisecond timestamp of the first stamp; both only ever grow.
/// `delivery` is derived per room kind and not persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub room_id: Uuid,
    pub seq: i64,
    pub sender_id: Uuid,
    pub sender_name: String,
    pub kind: MessageKind,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forward_of: Option<Uuid>,
    /// Milliseconds since Unix epoch, stamped at acceptance.
    pub sent_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<i64>,
    #[serde(default)]
    pub delivered_to: HashMap<Uuid, i64>,
    #[serde(default)]
    pub read_by: HashMap<Uuid, i64>,
    #[serde(default)]
    pub delivery: DeliveryState,
}

/// Room header shared between `room_joined` replies and the REST list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomInfo {
    pub id: Uuid,
    pub name: String,
    pub kind: RoomKind,
}

/// One participant as stored, ordered by `(joined_at, user_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberInfo {
    pub user_id: Uuid,
    pub name: String,
    pub role: MemberRole,
    pub joined_at: i64,
}

/// Current time as milliseconds since Unix epoch.
#[must_use]
pub fn now_ms() -> i64 {
    let Ok(dur) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(dur.as_millis()).unwrap_or(0)
}

// =============================================================================
// ERROR TAXONOMY
// =============================================================================

/// Grepable error code and retryable flag for structured error events.
pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> &'static str;

    fn retryable(&self) -> bool {
        false
    }
}

/// Everything a room operation can reject with. Authorization and
/// validation failures surface to the caller without dropping the
/// connection; store outages are retryable and never acknowledged as
/// accepted work.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RoomError {
    #[error("forbidden: {0}")]
    Forbidden(&'static str),
    #[error("room not found: {0}")]
    RoomNotFound(Uuid),
    #[error("message not found: {0}")]
    MessageNotFound(Uuid),
    #[error("invalid request: {0}")]
    Invalid(&'static str),
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("room not joined: {0}")]
    NotJoined(Uuid),
}

impl ErrorCode for RoomError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Forbidden(_) => "E_FORBIDDEN",
            Self::RoomNotFound(_) | Self::MessageNotFound(_) => "E_NOT_FOUND",
            Self::Invalid(_) => "E_INVALID",
            Self::StoreUnavailable(_) => "E_STORE_UNAVAILABLE",
            Self::NotJoined(_) => "E_NOT_JOINED",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }
}

// =============================================================================
// CLIENT → SERVER
// =============================================================================

/// Inbound events. Unknown names or malformed payloads fail serde
/// deserialization and are answered with an `error` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    JoinRoom {
        room_id: Uuid,
        /// Backfill cursor: when present, the reply backlog is every
        /// message with `seq > last_seen_seq` (bounded), oldest first.
        #[serde(default)]
        last_seen_seq: Option<i64>,
    },
    LeaveRoom {
        room_id: Uuid,
    },
    SendMessage {
        room_id: Uuid,
        content: String,
        #[serde(default)]
        kind: MessageKind,
        #[serde(default)]
        reply_to: Option<Uuid>,
        #[serde(default)]
        forward_of: Option<Uuid>,
    },
    EditMessage {
        room_id: Uuid,
        message_id: Uuid,
        content: String,
        #[serde(default)]
        kind: Option<MessageKind>,
    },
    DeleteMessage {
        room_id: Uuid,
        message_id: Uuid,
    },
    TypingStart {
        room_id: Uuid,
    },
    TypingStop {
        room_id: Uuid,
    },
    MarkDelivered {
        room_id: Uuid,
        message_id: Uuid,
    },
    MarkRead {
        room_id: Uuid,
        message_id: Uuid,
    },
    FetchReceipts {
        room_id: Uuid,
        message_id: Uuid,
    },
}

impl ClientEvent {
    /// Room targeted by this event, if any.
    #[must_use]
    pub fn room_id(&self) -> Uuid {
        match self {
            Self::JoinRoom { room_id, .. }
            | Self::LeaveRoom { room_id }
            | Self::SendMessage { room_id, .. }
            | Self::EditMessage { room_id, .. }
            | Self::DeleteMessage { room_id, .. }
            | Self::TypingStart { room_id }
            | Self::TypingStop { room_id }
            | Self::MarkDelivered { room_id, .. }
            | Self::MarkRead { room_id, .. }
            | Self::FetchReceipts { room_id, .. } => *room_id,
        }
    }
}

// =============================================================================
// SERVER → CLIENT
// =============================================================================

/// Outbound events, fanned to connections over their per-connection channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Welcome after a successful upgrade.
    Connected {
        user_id: Uuid,
        user_name: String,
    },
    RoomJoined {
        room: RoomInfo,
        members: Vec<MemberInfo>,
        online_user_ids: Vec<Uuid>,
        messages: Vec<Message>,
    },
    RoomLeft {
        room_id: Uuid,
    },
    NewMessage {
        room_id: Uuid,
        message: Message,
    },
    MessageEdited {
        room_id: Uuid,
        message: Message,
    },
    MessageDeleted {
        room_id: Uuid,
        message_id: Uuid,
    },
    /// Receipt progress for one message, pushed to its sender.
    MessageReceipts {
        room_id: Uuid,
        message_id: Uuid,
        delivered_to: HashMap<Uuid, i64>,
        read_by: HashMap<Uuid, i64>,
        delivery: DeliveryState,
    },
    RoomPurged {
        room_id: Uuid,
    },
    UserTyping {
        room_id: Uuid,
        user_id: Uuid,
        user_name: String,
    },
    UserStoppedTyping {
        room_id: Uuid,
        user_id: Uuid,
        user_name: String,
    },
    UserOnline {
        user_id: Uuid,
    },
    UserOffline {
        user_id: Uuid,
    },
    OnlineUsersCount {
        count: usize,
    },
    Error {
        code: String,
        message: String,
        retryable: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<Uuid>,
    },
}

impl ServerEvent {
    /// Build a structured error event from a typed error.
    #[must_use]
    pub fn error_from(err: &(impl ErrorCode + ?Sized), room_id: Option<Uuid>) -> Self {
        Self::Error {
            code: err.error_code().to_string(),
            message: err.to_string(),
            retryable: err.retryable(),
            room_id,
        }
    }

    /// Wire name of this event, for logging.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::RoomJoined { .. } => "room_joined",
            Self::RoomLeft { .. } => "room_left",
            Self::NewMessage { .. } => "new_message",
            Self::MessageEdited { .. } => "message_edited",
            Self::MessageDeleted { .. } => "message_deleted",
            Self::MessageReceipts { .. } => "message_receipts",
            Self::RoomPurged { .. } => "room_purged",
            Self::UserTyping { .. } => "user_typing",
            Self::UserStoppedTyping { .. } => "user_stopped_typing",
            Self::UserOnline { .. } => "user_online",
            Self::UserOffline { .. } => "user_offline",
            Self::OnlineUsersCount { .. } => "online_users_count",
            Self::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
#[path = "event_test.rs"]
mod tests;
