//! Domain entities moved between the store, the engine, and the wire.
//!
//! Broadcast events carry these as full snapshots (never diffs), so the same
//! structs serve as persistence models and as wire payloads.  Field names are
//! camelCase on the wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{MemberRole, MessageId, MessageKind, MessageStatus, Presence, RoomId, UserId};

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// A known user identity.  Created at registration (outside this core),
/// mutated on connect/disconnect, never deleted here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub id: UserId,
    pub display_name: String,
    pub presence: Presence,
    pub last_seen: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Room
// ---------------------------------------------------------------------------

/// Per-room feature switches and limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RoomSettings {
    pub allow_invites: bool,
    /// 0 means unlimited.
    pub member_limit: u32,
    /// 0 means keep forever.
    pub message_retention_days: u32,
    pub allow_reactions: bool,
    pub allow_pinning: bool,
    pub allow_voice: bool,
    pub allow_files: bool,
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self {
            allow_invites: true,
            member_limit: 0,
            message_retention_days: 0,
            allow_reactions: true,
            allow_pinning: true,
            allow_voice: true,
            allow_files: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RoomMember {
    pub user_id: UserId,
    pub role: MemberRole,
    pub joined_at: DateTime<Utc>,
}

/// A named group of members sharing a message stream.
///
/// Invariants: `owner_id` is always present in `members` with role `Owner`,
/// there is exactly one owner, and `members` contains each user at most once.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub id: RoomId,
    pub name: String,
    pub owner_id: UserId,
    pub members: Vec<RoomMember>,
    /// Pinned messages in pin order.
    pub pinned_message_ids: Vec<MessageId>,
    pub settings: RoomSettings,
    pub last_activity: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Room {
    pub fn member(&self, user_id: UserId) -> Option<&RoomMember> {
        self.members.iter().find(|m| m.user_id == user_id)
    }

    pub fn role_of(&self, user_id: UserId) -> Option<MemberRole> {
        self.member(user_id).map(|m| m.role)
    }
}

/// A pending invitation into a room.  The token is cluster-unique and
/// single-use; the record is removed on successful acceptance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Invite {
    pub token: String,
    pub room_id: RoomId,
    pub email: String,
    pub invited_by: UserId,
    pub role: MemberRole,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// All users who reacted with one emoji.  A message's `reactions` list never
/// contains two groups with the same emoji.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReactionGroup {
    pub emoji: String,
    pub user_ids: Vec<UserId>,
}

/// One superseded revision of an edited message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EditEntry {
    pub content: String,
    pub edited_at: DateTime<Utc>,
}

/// A single chat message with its full lifecycle state.
///
/// Deletion is soft: `is_deleted` rows stay in the store but are excluded
/// from live reads.  Edits append to `edit_history` and never discard prior
/// content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub kind: MessageKind,
    pub content: String,
    /// Opaque display metadata (attachment URLs, GIF dimensions, waveforms).
    pub metadata: Option<serde_json::Value>,
    pub reply_to: Option<MessageId>,
    pub reactions: Vec<ReactionGroup>,
    pub is_pinned: bool,
    pub pinned_by: Option<UserId>,
    pub is_edited: bool,
    pub edit_history: Vec<EditEntry>,
    pub is_deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub status: MessageStatus,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Key bundles (end-to-end session bootstrap)
// ---------------------------------------------------------------------------

/// Medium-term signed pre-key.  Rotated periodically by the client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SignedPreKey {
    pub key_id: u32,
    /// Public key material, encoded by the client (opaque to the engine).
    pub public_key: String,
    pub signature: String,
}

/// Single-use pre-key consumed during session establishment.  Never reused.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OneTimePreKey {
    pub key_id: u32,
    pub public_key: String,
}

/// Public key material a peer publishes so others can asynchronously
/// initiate an encrypted session.  The engine stores and hands this out; it
/// never performs the cryptography itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KeyBundle {
    pub registration_id: u32,
    pub identity_key: String,
    pub signed_pre_key: SignedPreKey,
    pub one_time_pre_keys: Vec<OneTimePreKey>,
}

/// Bundle returned to a session initiator: the target's identity material
/// plus exactly one freshly consumed one-time pre-key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PreKeyBundle {
    pub registration_id: u32,
    pub identity_key: String,
    pub signed_pre_key: SignedPreKey,
    pub one_time_pre_key: OneTimePreKey,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KeyStatus {
    pub unused_count: u32,
    pub needs_replenish: bool,
}
