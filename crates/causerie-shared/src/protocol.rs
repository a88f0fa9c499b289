//! Wire protocol spoken over the WebSocket gateway.
//!
//! Inbound frames are [`ClientCommand`]s wrapped in a [`CommandFrame`] that
//! carries an optional client sequence number for ack correlation.  Outbound
//! frames are either an [`Ack`] answering one command or a [`ServerEvent`]
//! broadcast to every live session in the affected room.  All event payloads
//! are full-entity snapshots, not diffs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ChatError;
use crate::model::{Message, Room, RoomSettings};
use crate::types::{MemberRole, MessageId, MessageKind, Presence, RoomId, UserId};

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReactionAction {
    Add,
    Remove,
}

/// Commands a client may issue after the `hello` handshake.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientCommand {
    /// First frame on every connection; anything else before it is an auth
    /// failure and the socket is closed.
    #[serde(rename_all = "camelCase")]
    Hello { user_id: UserId, display_name: String },

    #[serde(rename_all = "camelCase")]
    CreateRoom { name: String },

    #[serde(rename_all = "camelCase")]
    Join { room_id: RoomId },

    #[serde(rename_all = "camelCase")]
    Leave { room_id: RoomId },

    #[serde(rename_all = "camelCase")]
    SendMessage {
        room_id: RoomId,
        kind: MessageKind,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to: Option<MessageId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        scheduled_for: Option<DateTime<Utc>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expires_at: Option<DateTime<Utc>>,
    },

    #[serde(rename_all = "camelCase")]
    EditMessage { message_id: MessageId, content: String },

    #[serde(rename_all = "camelCase")]
    DeleteMessage { message_id: MessageId },

    #[serde(rename_all = "camelCase")]
    Reaction {
        message_id: MessageId,
        emoji: String,
        action: ReactionAction,
    },

    #[serde(rename_all = "camelCase")]
    Pin { message_id: MessageId },

    #[serde(rename_all = "camelCase")]
    Unpin { message_id: MessageId },

    #[serde(rename_all = "camelCase")]
    Typing { room_id: RoomId },

    #[serde(rename_all = "camelCase")]
    StopTyping { room_id: RoomId },

    #[serde(rename_all = "camelCase")]
    InviteToRoom {
        room_id: RoomId,
        email: String,
        #[serde(default = "default_invite_role")]
        role: MemberRole,
    },

    #[serde(rename_all = "camelCase")]
    AcceptInvite { token: String },

    #[serde(rename_all = "camelCase")]
    CancelScheduled { message_id: MessageId },

    #[serde(rename_all = "camelCase")]
    Reschedule {
        message_id: MessageId,
        scheduled_for: DateTime<Utc>,
    },

    #[serde(rename_all = "camelCase")]
    SetExpiry {
        message_id: MessageId,
        expires_at: DateTime<Utc>,
    },

    #[serde(rename_all = "camelCase")]
    KickMember { room_id: RoomId, user_id: UserId },

    #[serde(rename_all = "camelCase")]
    UpdateSettings { room_id: RoomId, settings: RoomSettings },

    #[serde(rename_all = "camelCase")]
    DeleteRoom { room_id: RoomId },
}

fn default_invite_role() -> MemberRole {
    MemberRole::Member
}

/// Envelope for an inbound command, carrying an optional client-chosen
/// sequence number echoed back on the matching ack.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(flatten)]
    pub command: ClientCommand,
}

// ---------------------------------------------------------------------------
// Acknowledgments
// ---------------------------------------------------------------------------

/// Result of one command, relayed only to the issuing connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Ack {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl Ack {
    pub fn ok(seq: Option<u64>, data: Option<serde_json::Value>) -> Self {
        Self { seq, success: true, data, error: None, code: None }
    }

    pub fn err(seq: Option<u64>, error: &ChatError) -> Self {
        Self {
            seq,
            success: false,
            data: None,
            error: Some(error.to_string()),
            code: Some(error.code().to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Outbound broadcasts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TypingEvent {
    pub room_id: RoomId,
    pub user_id: UserId,
    pub is_typing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEvent {
    pub user_id: UserId,
    pub presence: Presence,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

/// Events fanned out to every live session in the affected room.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "message:new")]
    MessageNew(Message),
    #[serde(rename = "message:edited")]
    MessageEdited(Message),
    #[serde(rename = "message:deleted")]
    MessageDeleted(Message),
    #[serde(rename = "message:reaction")]
    MessageReaction(Message),
    #[serde(rename = "message:pinned")]
    MessagePinned(Message),
    #[serde(rename = "message:unpinned")]
    MessageUnpinned(Message),
    #[serde(rename = "message:scheduled")]
    MessageScheduled(Message),
    #[serde(rename = "message:expired")]
    MessageExpired(Message),
    #[serde(rename = "memberUpdate")]
    MemberUpdate(Room),
    #[serde(rename = "roomDeleted")]
    RoomDeleted {
        #[serde(rename = "roomId")]
        room_id: RoomId,
    },
    #[serde(rename = "typing")]
    Typing(TypingEvent),
    #[serde(rename = "presence")]
    Presence(PresenceEvent),
}
