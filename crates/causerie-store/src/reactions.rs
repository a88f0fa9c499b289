//! Reaction persistence.
//!
//! The (message, user, emoji) primary key makes add idempotent via
//! `INSERT OR IGNORE`; remove is a guarded `DELETE`.  Reads aggregate one
//! group per emoji so a message never carries duplicate emoji entries.

use chrono::{DateTime, Utc};
use rusqlite::params;

use causerie_shared::{MessageId, ReactionGroup, UserId};

use crate::database::Database;
use crate::error::Result;
use crate::row::parse_uuid;

impl Database {
    /// Record a reaction.  Returns `false` when the same user already
    /// reacted with the same emoji (no-op).
    pub fn add_reaction(
        &self,
        message_id: MessageId,
        user_id: UserId,
        emoji: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let affected = self.conn().execute(
            "INSERT OR IGNORE INTO reactions (message_id, user_id, emoji, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                message_id.to_string(),
                user_id.to_string(),
                emoji,
                now.to_rfc3339()
            ],
        )?;
        Ok(affected > 0)
    }

    /// Remove a reaction.  Returns `false` when there was nothing to remove.
    pub fn remove_reaction(
        &self,
        message_id: MessageId,
        user_id: UserId,
        emoji: &str,
    ) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM reactions WHERE message_id = ?1 AND user_id = ?2 AND emoji = ?3",
            params![message_id.to_string(), user_id.to_string(), emoji],
        )?;
        Ok(affected > 0)
    }

    /// Aggregated reactions for a message: one group per emoji, users in
    /// reaction order.
    pub fn reactions_for_message(&self, message_id: MessageId) -> Result<Vec<ReactionGroup>> {
        let mut stmt = self.conn().prepare(
            "SELECT emoji, user_id FROM reactions
             WHERE message_id = ?1 ORDER BY created_at ASC, user_id ASC",
        )?;

        let rows = stmt.query_map(params![message_id.to_string()], |row| {
            let emoji: String = row.get(0)?;
            let user_str: String = row.get(1)?;
            Ok((emoji, UserId(parse_uuid(1, &user_str)?)))
        })?;

        let mut groups: Vec<ReactionGroup> = Vec::new();
        for row in rows {
            let (emoji, user_id) = row?;
            match groups.iter_mut().find(|g| g.emoji == emoji) {
                Some(group) => group.user_ids.push(user_id),
                None => groups.push(ReactionGroup { emoji, user_ids: vec![user_id] }),
            }
        }
        Ok(groups)
    }
}
