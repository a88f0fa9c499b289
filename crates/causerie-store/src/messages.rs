//! Message persistence and the message state machine.
//!
//! Status transitions (`scheduled -> sent | cancelled | failed`, soft delete,
//! expiry) are all single conditional `UPDATE`s guarded on the current state;
//! the affected-row count tells the caller whether its transition actually
//! happened or a concurrent writer got there first.  Content is sealed at
//! rest.

use chrono::{DateTime, Utc};
use rusqlite::params;

use causerie_shared::seal::{self, SealKey};
use causerie_shared::{EditEntry, Message, MessageId, MessageKind, MessageStatus, RoomId, UserId};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::row::{conv_err, parse_opt_ts, parse_opt_uuid, parse_ts, parse_uuid};

const MESSAGE_COLS: &str = "id, room_id, sender_id, kind, content, metadata, reply_to,
     is_pinned, pinned_by, pinned_at, is_edited, is_deleted, deleted_at,
     created_at, status, scheduled_for, expires_at";

impl Database {
    // ------------------------------------------------------------------
    // Create / read
    // ------------------------------------------------------------------

    pub fn insert_message(&self, message: &Message) -> Result<()> {
        let sealed = seal::seal(self.seal_key(), message.content.as_bytes())?;
        let metadata = message
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        self.conn().execute(
            "INSERT INTO messages
                (id, room_id, sender_id, kind, content, metadata, reply_to,
                 created_at, status, scheduled_for, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                message.id.to_string(),
                message.room_id.to_string(),
                message.sender_id.to_string(),
                message.kind.as_str(),
                sealed,
                metadata,
                message.reply_to.map(|id| id.to_string()),
                message.created_at.to_rfc3339(),
                message.status.as_str(),
                message.scheduled_for.map(|t| t.to_rfc3339()),
                message.expires_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    /// Fetch a single message with reactions and edit history assembled.
    pub fn get_message(&self, id: MessageId) -> Result<Message> {
        let key = *self.seal_key();
        let mut message = self
            .conn()
            .query_row(
                &format!("SELECT {MESSAGE_COLS} FROM messages WHERE id = ?1"),
                params![id.to_string()],
                |row| row_to_message(row, &key),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })?;

        message.reactions = self.reactions_for_message(id)?;
        message.edit_history = self.edits_for_message(id)?;
        Ok(message)
    }

    /// Fetch a message only if it is live (sent and not soft-deleted).
    pub fn get_live_message(&self, id: MessageId) -> Result<Message> {
        let message = self.get_message(id)?;
        if message.is_deleted || message.status != MessageStatus::Sent {
            return Err(StoreError::NotFound);
        }
        Ok(message)
    }

    /// Live messages for a room, newest first.  Soft-deleted and scheduled
    /// rows never appear here.
    pub fn live_messages(
        &self,
        room_id: RoomId,
        limit: u32,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>> {
        let key = *self.seal_key();
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLS} FROM messages
             WHERE room_id = ?1 AND is_deleted = 0 AND status = 'sent'
               AND (?2 IS NULL OR created_at < ?2)
             ORDER BY created_at DESC
             LIMIT ?3"
        ))?;

        let rows = stmt.query_map(
            params![
                room_id.to_string(),
                before.map(|t| t.to_rfc3339()),
                limit
            ],
            |row| row_to_message(row, &key),
        )?;

        let mut messages = Vec::new();
        for row in rows {
            let mut message = row?;
            message.reactions = self.reactions_for_message(message.id)?;
            message.edit_history = self.edits_for_message(message.id)?;
            messages.push(message);
        }
        Ok(messages)
    }

    // ------------------------------------------------------------------
    // Edits / deletion
    // ------------------------------------------------------------------

    /// Replace the content of a live message, appending the superseded
    /// revision to the edit history in the same transaction.
    pub fn edit_message(
        &mut self,
        id: MessageId,
        new_content: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let key = *self.seal_key();
        let tx = self.conn_mut().transaction()?;

        let previous: Vec<u8> = tx
            .query_row(
                "SELECT content FROM messages
                 WHERE id = ?1 AND is_deleted = 0 AND status = 'sent'",
                params![id.to_string()],
                |row| row.get(0),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })?;

        tx.execute(
            "INSERT INTO message_edits (message_id, content, edited_at) VALUES (?1, ?2, ?3)",
            params![id.to_string(), previous, now.to_rfc3339()],
        )?;

        let sealed = seal::seal(&key, new_content.as_bytes())?;
        tx.execute(
            "UPDATE messages SET content = ?1, is_edited = 1 WHERE id = ?2",
            params![sealed, id.to_string()],
        )?;

        tx.commit()?;
        Ok(())
    }

    fn edits_for_message(&self, id: MessageId) -> Result<Vec<EditEntry>> {
        let key = *self.seal_key();
        let mut stmt = self.conn().prepare(
            "SELECT content, edited_at FROM message_edits
             WHERE message_id = ?1 ORDER BY id ASC",
        )?;

        let rows = stmt.query_map(params![id.to_string()], move |row| {
            let sealed: Vec<u8> = row.get(0)?;
            let edited_str: String = row.get(1)?;

            let content = seal::open(&key, &sealed).map_err(|e| conv_err(0, e))?;
            let content = String::from_utf8(content).map_err(|e| conv_err(0, e))?;

            Ok(EditEntry { content, edited_at: parse_ts(1, &edited_str)? })
        })?;

        let mut edits = Vec::new();
        for row in rows {
            edits.push(row?);
        }
        Ok(edits)
    }

    /// Soft-delete a live message.  Returns `false` if it was already
    /// deleted or never sent.
    pub fn soft_delete_message(&self, id: MessageId, now: DateTime<Utc>) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE messages SET is_deleted = 1, deleted_at = ?1
             WHERE id = ?2 AND is_deleted = 0",
            params![now.to_rfc3339(), id.to_string()],
        )?;
        Ok(affected > 0)
    }

    // ------------------------------------------------------------------
    // Scheduling state machine
    // ------------------------------------------------------------------

    /// Promote a scheduled message to sent, stamping delivery time.  The
    /// status guard makes promotion idempotent: a timer firing after a
    /// cancel (or a duplicate fire after restart) changes nothing.
    pub fn promote_scheduled(&self, id: MessageId, now: DateTime<Utc>) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE messages SET status = 'sent', created_at = ?1
             WHERE id = ?2 AND status = 'scheduled'",
            params![now.to_rfc3339(), id.to_string()],
        )?;
        Ok(affected > 0)
    }

    /// Flip a scheduled message to cancelled.  No-op if it already fired.
    pub fn mark_cancelled(&self, id: MessageId) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE messages SET status = 'cancelled' WHERE id = ?1 AND status = 'scheduled'",
            params![id.to_string()],
        )?;
        Ok(affected > 0)
    }

    /// Flip a scheduled message to failed (re-validation at fire time found
    /// the room or sender gone).
    pub fn mark_failed(&self, id: MessageId) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE messages SET status = 'failed' WHERE id = ?1 AND status = 'scheduled'",
            params![id.to_string()],
        )?;
        Ok(affected > 0)
    }

    /// Move a still-scheduled message to a new delivery time.
    pub fn reschedule_message(&self, id: MessageId, when: DateTime<Utc>) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE messages SET scheduled_for = ?1 WHERE id = ?2 AND status = 'scheduled'",
            params![when.to_rfc3339(), id.to_string()],
        )?;
        Ok(affected > 0)
    }

    /// All persisted scheduled messages in delivery order, for re-arming
    /// timers after a restart.
    pub fn scheduled_messages(&self) -> Result<Vec<(MessageId, DateTime<Utc>)>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, scheduled_for FROM messages
             WHERE status = 'scheduled' AND scheduled_for IS NOT NULL
             ORDER BY scheduled_for ASC, created_at ASC",
        )?;

        let rows = stmt.query_map([], |row| {
            let id_str: String = row.get(0)?;
            let when_str: String = row.get(1)?;
            Ok((MessageId(parse_uuid(0, &id_str)?), parse_ts(1, &when_str)?))
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Expiry
    // ------------------------------------------------------------------

    /// Set (or move) a live message's expiry time.
    pub fn set_expiry(&self, id: MessageId, when: DateTime<Utc>) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE messages SET expires_at = ?1
             WHERE id = ?2 AND is_deleted = 0 AND status = 'sent'",
            params![when.to_rfc3339(), id.to_string()],
        )?;
        Ok(affected > 0)
    }

    /// Soft-delete every live message whose expiry has passed, returning the
    /// affected (message, room) pairs for fan-out.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> Result<Vec<(MessageId, RoomId)>> {
        let mut stmt = self.conn().prepare(
            "UPDATE messages SET is_deleted = 1, deleted_at = ?1
             WHERE is_deleted = 0 AND status = 'sent'
               AND expires_at IS NOT NULL AND expires_at <= ?1
             RETURNING id, room_id",
        )?;

        let rows = stmt.query_map(params![now.to_rfc3339()], |row| {
            let id_str: String = row.get(0)?;
            let room_str: String = row.get(1)?;
            Ok((MessageId(parse_uuid(0, &id_str)?), RoomId(parse_uuid(1, &room_str)?)))
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Rooms with a retention window configured.
    pub fn rooms_with_retention(&self) -> Result<Vec<(RoomId, u32)>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT id, message_retention_days FROM rooms WHERE message_retention_days > 0")?;

        let rows = stmt.query_map([], |row| {
            let id_str: String = row.get(0)?;
            let days: u32 = row.get(1)?;
            Ok((RoomId(parse_uuid(0, &id_str)?), days))
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Soft-delete live messages in one room older than `cutoff`.
    pub fn sweep_retention(
        &self,
        room_id: RoomId,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<(MessageId, RoomId)>> {
        let mut stmt = self.conn().prepare(
            "UPDATE messages SET is_deleted = 1, deleted_at = ?1
             WHERE room_id = ?2 AND is_deleted = 0 AND status = 'sent'
               AND created_at <= ?3
             RETURNING id, room_id",
        )?;

        let rows = stmt.query_map(
            params![now.to_rfc3339(), room_id.to_string(), cutoff.to_rfc3339()],
            |row| {
                let id_str: String = row.get(0)?;
                let room_str: String = row.get(1)?;
                Ok((MessageId(parse_uuid(0, &id_str)?), RoomId(parse_uuid(1, &room_str)?)))
            },
        )?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Pinning
    // ------------------------------------------------------------------

    /// Pin or unpin a live message.  Pinning stamps `pinned_at` so the
    /// room's pinned set keeps pin order.
    pub fn set_pinned(
        &self,
        id: MessageId,
        pinned_by: Option<UserId>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let affected = match pinned_by {
            Some(by) => self.conn().execute(
                "UPDATE messages SET is_pinned = 1, pinned_by = ?1, pinned_at = ?2
                 WHERE id = ?3 AND is_deleted = 0 AND status = 'sent'",
                params![by.to_string(), now.to_rfc3339(), id.to_string()],
            )?,
            None => self.conn().execute(
                "UPDATE messages SET is_pinned = 0, pinned_by = NULL, pinned_at = NULL
                 WHERE id = ?1 AND is_deleted = 0 AND status = 'sent'",
                params![id.to_string()],
            )?,
        };
        Ok(affected > 0)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Map a `rusqlite::Row` to a [`Message`], unsealing content.  Reactions and
/// edit history are attached by the caller.
fn row_to_message(row: &rusqlite::Row<'_>, key: &SealKey) -> rusqlite::Result<Message> {
    let id_str: String = row.get(0)?;
    let room_str: String = row.get(1)?;
    let sender_str: String = row.get(2)?;
    let kind_str: String = row.get(3)?;
    let sealed: Vec<u8> = row.get(4)?;
    let metadata_str: Option<String> = row.get(5)?;
    let reply_str: Option<String> = row.get(6)?;
    let pinned_by_str: Option<String> = row.get(8)?;
    let deleted_str: Option<String> = row.get(12)?;
    let created_str: String = row.get(13)?;
    let status_str: String = row.get(14)?;
    let scheduled_str: Option<String> = row.get(15)?;
    let expires_str: Option<String> = row.get(16)?;

    let content = seal::open(key, &sealed).map_err(|e| conv_err(4, e))?;
    let content = String::from_utf8(content).map_err(|e| conv_err(4, e))?;

    let metadata = metadata_str
        .map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(|e| conv_err(5, e))?;

    Ok(Message {
        id: MessageId(parse_uuid(0, &id_str)?),
        room_id: RoomId(parse_uuid(1, &room_str)?),
        sender_id: UserId(parse_uuid(2, &sender_str)?),
        kind: MessageKind::from_str(&kind_str).unwrap_or(MessageKind::Text),
        content,
        metadata,
        reply_to: parse_opt_uuid(6, reply_str)?.map(MessageId),
        reactions: Vec::new(),
        is_pinned: row.get(7)?,
        pinned_by: parse_opt_uuid(8, pinned_by_str)?.map(UserId),
        is_edited: row.get(10)?,
        edit_history: Vec::new(),
        is_deleted: row.get(11)?,
        deleted_at: parse_opt_ts(12, deleted_str)?,
        created_at: parse_ts(13, &created_str)?,
        status: MessageStatus::from_str(&status_str).unwrap_or(MessageStatus::Sent),
        scheduled_for: parse_opt_ts(15, scheduled_str)?,
        expires_at: parse_opt_ts(16, expires_str)?,
    })
}
