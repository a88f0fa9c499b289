//! Room, membership, invite, and user-presence persistence.
//!
//! Membership mutations go through guarded single-statement writes: the
//! member-limit check happens inside the same `INSERT ... SELECT` that adds
//! the row, and invite consumption is a conditional `DELETE` — the affected
//! row count tells the caller whether it won the race.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use causerie_shared::{
    Invite, MemberRole, MessageId, Presence, Room, RoomId, RoomMember, RoomSettings, UserId,
    UserRecord,
};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::row::{parse_opt_ts, parse_ts, parse_uuid};

/// Outcome of a guarded membership insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddMemberOutcome {
    Added,
    AlreadyMember,
    Full,
}

impl Database {
    // ------------------------------------------------------------------
    // Users
    // ------------------------------------------------------------------

    /// Insert or refresh a user record (display name is transport-provided).
    pub fn upsert_user(&self, id: UserId, display_name: &str, now: DateTime<Utc>) -> Result<()> {
        self.conn().execute(
            "INSERT INTO users (id, display_name, presence, created_at)
             VALUES (?1, ?2, 'offline', ?3)
             ON CONFLICT(id) DO UPDATE SET display_name = excluded.display_name",
            params![id.to_string(), display_name, now.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn set_presence(
        &self,
        id: UserId,
        presence: Presence,
        last_seen: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.conn().execute(
            "UPDATE users SET presence = ?1, last_seen = COALESCE(?2, last_seen) WHERE id = ?3",
            params![
                presence.as_str(),
                last_seen.map(|t| t.to_rfc3339()),
                id.to_string()
            ],
        )?;
        Ok(())
    }

    pub fn get_user(&self, id: UserId) -> Result<UserRecord> {
        self.conn()
            .query_row(
                "SELECT id, display_name, presence, last_seen, created_at
                 FROM users WHERE id = ?1",
                params![id.to_string()],
                |row| {
                    let id_str: String = row.get(0)?;
                    let display_name: String = row.get(1)?;
                    let presence: String = row.get(2)?;
                    let last_seen: Option<String> = row.get(3)?;
                    let created_str: String = row.get(4)?;

                    Ok(UserRecord {
                        id: UserId(parse_uuid(0, &id_str)?),
                        display_name,
                        presence: if presence == "online" {
                            Presence::Online
                        } else {
                            Presence::Offline
                        },
                        last_seen: parse_opt_ts(3, last_seen)?,
                        created_at: parse_ts(4, &created_str)?,
                    })
                },
            )
            .map_err(not_found)
    }

    // ------------------------------------------------------------------
    // Rooms
    // ------------------------------------------------------------------

    /// Insert a new room together with its owner membership row.
    pub fn create_room(&mut self, room: &Room) -> Result<()> {
        let tx = self.conn_mut().transaction()?;

        tx.execute(
            "INSERT INTO rooms
                (id, name, owner_id, allow_invites, member_limit, message_retention_days,
                 allow_reactions, allow_pinning, allow_voice, allow_files,
                 last_activity, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                room.id.to_string(),
                room.name,
                room.owner_id.to_string(),
                room.settings.allow_invites,
                room.settings.member_limit,
                room.settings.message_retention_days,
                room.settings.allow_reactions,
                room.settings.allow_pinning,
                room.settings.allow_voice,
                room.settings.allow_files,
                room.last_activity.to_rfc3339(),
                room.created_at.to_rfc3339(),
            ],
        )?;

        tx.execute(
            "INSERT INTO room_members (room_id, user_id, role, joined_at)
             VALUES (?1, ?2, 'owner', ?3)",
            params![
                room.id.to_string(),
                room.owner_id.to_string(),
                room.created_at.to_rfc3339()
            ],
        )?;

        tx.commit()?;
        Ok(())
    }

    /// Fetch a room with its members and pinned-message ids.
    pub fn get_room(&self, id: RoomId) -> Result<Room> {
        let mut room = self
            .conn()
            .query_row(
                "SELECT id, name, owner_id, allow_invites, member_limit,
                        message_retention_days, allow_reactions, allow_pinning,
                        allow_voice, allow_files, last_activity, created_at
                 FROM rooms WHERE id = ?1",
                params![id.to_string()],
                row_to_room,
            )
            .map_err(not_found)?;

        room.members = self.room_members(id)?;
        room.pinned_message_ids = self.pinned_message_ids(id)?;
        Ok(room)
    }

    fn room_members(&self, id: RoomId) -> Result<Vec<RoomMember>> {
        let mut stmt = self.conn().prepare(
            "SELECT user_id, role, joined_at FROM room_members
             WHERE room_id = ?1 ORDER BY joined_at ASC",
        )?;

        let rows = stmt.query_map(params![id.to_string()], |row| {
            let user_str: String = row.get(0)?;
            let role_str: String = row.get(1)?;
            let joined_str: String = row.get(2)?;

            Ok(RoomMember {
                user_id: UserId(parse_uuid(0, &user_str)?),
                role: MemberRole::from_str(&role_str).unwrap_or(MemberRole::Member),
                joined_at: parse_ts(2, &joined_str)?,
            })
        })?;

        let mut members = Vec::new();
        for row in rows {
            members.push(row?);
        }
        Ok(members)
    }

    /// Pinned message ids for a room, in pin order.
    pub fn pinned_message_ids(&self, id: RoomId) -> Result<Vec<MessageId>> {
        let mut stmt = self.conn().prepare(
            "SELECT id FROM messages
             WHERE room_id = ?1 AND is_pinned = 1 AND is_deleted = 0
             ORDER BY pinned_at ASC",
        )?;

        let rows = stmt.query_map(params![id.to_string()], |row| {
            let id_str: String = row.get(0)?;
            Ok(MessageId(parse_uuid(0, &id_str)?))
        })?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    /// All rooms the user is currently a member of.
    pub fn rooms_for_user(&self, user_id: UserId) -> Result<Vec<Room>> {
        let mut stmt = self.conn().prepare(
            "SELECT room_id FROM room_members WHERE user_id = ?1",
        )?;
        let rows = stmt.query_map(params![user_id.to_string()], |row| {
            let id_str: String = row.get(0)?;
            Ok(RoomId(parse_uuid(0, &id_str)?))
        })?;

        let mut rooms = Vec::new();
        for row in rows {
            rooms.push(self.get_room(row?)?);
        }
        Ok(rooms)
    }

    /// Role of a user inside a room, or `None` when not a member.
    pub fn member_role(&self, room_id: RoomId, user_id: UserId) -> Result<Option<MemberRole>> {
        let role: Option<String> = self
            .conn()
            .query_row(
                "SELECT role FROM room_members WHERE room_id = ?1 AND user_id = ?2",
                params![room_id.to_string(), user_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(role.and_then(|r| MemberRole::from_str(&r)))
    }

    /// Add a member, enforcing the room's member limit inside the insert
    /// itself so two concurrent joins cannot both slip under the cap.
    pub fn add_member(
        &self,
        room_id: RoomId,
        user_id: UserId,
        role: MemberRole,
        now: DateTime<Utc>,
    ) -> Result<AddMemberOutcome> {
        if self.member_role(room_id, user_id)?.is_some() {
            return Ok(AddMemberOutcome::AlreadyMember);
        }

        // Room must exist; distinguishes NotFound from Full.
        let exists: Option<i64> = self
            .conn()
            .query_row(
                "SELECT 1 FROM rooms WHERE id = ?1",
                params![room_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(StoreError::NotFound);
        }

        let affected = self.conn().execute(
            "INSERT OR IGNORE INTO room_members (room_id, user_id, role, joined_at)
             SELECT ?1, ?2, ?3, ?4
             WHERE (SELECT member_limit FROM rooms WHERE id = ?1) = 0
                OR (SELECT COUNT(*) FROM room_members WHERE room_id = ?1)
                   < (SELECT member_limit FROM rooms WHERE id = ?1)",
            params![
                room_id.to_string(),
                user_id.to_string(),
                role.as_str(),
                now.to_rfc3339()
            ],
        )?;

        if affected > 0 {
            Ok(AddMemberOutcome::Added)
        } else if self.member_role(room_id, user_id)?.is_some() {
            // Lost a race against another connection of the same user.
            Ok(AddMemberOutcome::AlreadyMember)
        } else {
            Ok(AddMemberOutcome::Full)
        }
    }

    /// Remove a member.  Returns `true` if a row was deleted.
    pub fn remove_member(&self, room_id: RoomId, user_id: UserId) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM room_members WHERE room_id = ?1 AND user_id = ?2",
            params![room_id.to_string(), user_id.to_string()],
        )?;
        Ok(affected > 0)
    }

    /// Replace a room's settings.  Returns `false` when the room is gone.
    pub fn update_settings(&self, room_id: RoomId, settings: &RoomSettings) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE rooms SET allow_invites = ?1, member_limit = ?2,
                    message_retention_days = ?3, allow_reactions = ?4,
                    allow_pinning = ?5, allow_voice = ?6, allow_files = ?7
             WHERE id = ?8",
            params![
                settings.allow_invites,
                settings.member_limit,
                settings.message_retention_days,
                settings.allow_reactions,
                settings.allow_pinning,
                settings.allow_voice,
                settings.allow_files,
                room_id.to_string(),
            ],
        )?;
        Ok(affected > 0)
    }

    pub fn touch_room(&self, room_id: RoomId, now: DateTime<Utc>) -> Result<()> {
        self.conn().execute(
            "UPDATE rooms SET last_activity = ?1 WHERE id = ?2",
            params![now.to_rfc3339(), room_id.to_string()],
        )?;
        Ok(())
    }

    /// Delete a room.  Members, invites, messages, edit history, and
    /// reactions cascade away in the same implicit transaction.
    pub fn delete_room(&self, id: RoomId) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM rooms WHERE id = ?1", params![id.to_string()])?;
        Ok(affected > 0)
    }

    // ------------------------------------------------------------------
    // Invites
    // ------------------------------------------------------------------

    pub fn insert_invite(&self, invite: &Invite) -> Result<()> {
        self.conn().execute(
            "INSERT INTO invites (token, room_id, email, invited_by, role, expires_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                invite.token,
                invite.room_id.to_string(),
                invite.email,
                invite.invited_by.to_string(),
                invite.role.as_str(),
                invite.expires_at.to_rfc3339(),
                invite.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_invite(&self, token: &str) -> Result<Invite> {
        self.conn()
            .query_row(
                "SELECT token, room_id, email, invited_by, role, expires_at, created_at
                 FROM invites WHERE token = ?1",
                params![token],
                row_to_invite,
            )
            .map_err(not_found)
    }

    /// Atomically consume a still-valid invite.  Returns `false` when the
    /// token is gone or expired — a concurrent acceptor or the clock won.
    pub fn consume_invite(&self, token: &str, now: DateTime<Utc>) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM invites WHERE token = ?1 AND expires_at > ?2",
            params![token, now.to_rfc3339()],
        )?;
        Ok(affected > 0)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn not_found(e: rusqlite::Error) -> StoreError {
    match e {
        rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
        other => StoreError::Sqlite(other),
    }
}

/// Map a `rusqlite::Row` to a [`Room`] (members and pins filled in later).
fn row_to_room(row: &rusqlite::Row<'_>) -> rusqlite::Result<Room> {
    let id_str: String = row.get(0)?;
    let name: String = row.get(1)?;
    let owner_str: String = row.get(2)?;
    let last_activity_str: String = row.get(10)?;
    let created_str: String = row.get(11)?;

    Ok(Room {
        id: RoomId(parse_uuid(0, &id_str)?),
        name,
        owner_id: UserId(parse_uuid(2, &owner_str)?),
        members: Vec::new(),
        pinned_message_ids: Vec::new(),
        settings: RoomSettings {
            allow_invites: row.get(3)?,
            member_limit: row.get(4)?,
            message_retention_days: row.get(5)?,
            allow_reactions: row.get(6)?,
            allow_pinning: row.get(7)?,
            allow_voice: row.get(8)?,
            allow_files: row.get(9)?,
        },
        last_activity: parse_ts(10, &last_activity_str)?,
        created_at: parse_ts(11, &created_str)?,
    })
}

fn row_to_invite(row: &rusqlite::Row<'_>) -> rusqlite::Result<Invite> {
    let token: String = row.get(0)?;
    let room_str: String = row.get(1)?;
    let email: String = row.get(2)?;
    let inviter_str: String = row.get(3)?;
    let role_str: String = row.get(4)?;
    let expires_str: String = row.get(5)?;
    let created_str: String = row.get(6)?;

    Ok(Invite {
        token,
        room_id: RoomId(parse_uuid(1, &room_str)?),
        email,
        invited_by: UserId(parse_uuid(3, &inviter_str)?),
        role: MemberRole::from_str(&role_str).unwrap_or(MemberRole::Member),
        expires_at: parse_ts(5, &expires_str)?,
        created_at: parse_ts(6, &created_str)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use causerie_shared::invite;

    fn test_db() -> Database {
        Database::open_in_memory(&[0u8; 32]).unwrap()
    }

    fn make_room(owner: UserId, limit: u32) -> Room {
        let now = Utc::now();
        Room {
            id: RoomId::new(),
            name: "salon".to_string(),
            owner_id: owner,
            members: Vec::new(),
            pinned_message_ids: Vec::new(),
            settings: RoomSettings { member_limit: limit, ..Default::default() },
            last_activity: now,
            created_at: now,
        }
    }

    #[test]
    fn create_room_inserts_owner_membership() {
        let mut db = test_db();
        let owner = UserId::new();
        let room = make_room(owner, 0);
        db.create_room(&room).unwrap();

        let loaded = db.get_room(room.id).unwrap();
        assert_eq!(loaded.owner_id, owner);
        assert_eq!(loaded.members.len(), 1);
        assert_eq!(loaded.members[0].role, MemberRole::Owner);
        assert_eq!(loaded.role_of(owner), Some(MemberRole::Owner));
    }

    #[test]
    fn member_limit_is_enforced() {
        let mut db = test_db();
        let owner = UserId::new();
        let room = make_room(owner, 2);
        db.create_room(&room).unwrap();

        let second = UserId::new();
        assert_eq!(
            db.add_member(room.id, second, MemberRole::Member, Utc::now()).unwrap(),
            AddMemberOutcome::Added
        );

        // Owner counts toward the limit; the third user is rejected.
        let third = UserId::new();
        assert_eq!(
            db.add_member(room.id, third, MemberRole::Member, Utc::now()).unwrap(),
            AddMemberOutcome::Full
        );

        // Membership unchanged after the rejection.
        assert_eq!(db.get_room(room.id).unwrap().members.len(), 2);
    }

    #[test]
    fn add_member_is_idempotent() {
        let mut db = test_db();
        let owner = UserId::new();
        let room = make_room(owner, 0);
        db.create_room(&room).unwrap();

        let user = UserId::new();
        assert_eq!(
            db.add_member(room.id, user, MemberRole::Member, Utc::now()).unwrap(),
            AddMemberOutcome::Added
        );
        assert_eq!(
            db.add_member(room.id, user, MemberRole::Member, Utc::now()).unwrap(),
            AddMemberOutcome::AlreadyMember
        );
    }

    #[test]
    fn add_member_to_missing_room_is_not_found() {
        let db = test_db();
        let err = db
            .add_member(RoomId::new(), UserId::new(), MemberRole::Member, Utc::now())
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }

    #[test]
    fn invite_is_single_use() {
        let mut db = test_db();
        let owner = UserId::new();
        let room = make_room(owner, 0);
        db.create_room(&room).unwrap();

        let now = Utc::now();
        let inv = Invite {
            token: invite::generate_token(),
            room_id: room.id,
            email: "ami@example.org".to_string(),
            invited_by: owner,
            role: MemberRole::Member,
            expires_at: invite::default_expiry(now),
            created_at: now,
        };
        db.insert_invite(&inv).unwrap();

        assert!(db.consume_invite(&inv.token, now).unwrap());
        assert!(!db.consume_invite(&inv.token, now).unwrap());
        assert!(matches!(db.get_invite(&inv.token), Err(StoreError::NotFound)));
    }

    #[test]
    fn expired_invite_is_not_consumed() {
        let mut db = test_db();
        let owner = UserId::new();
        let room = make_room(owner, 0);
        db.create_room(&room).unwrap();

        let now = Utc::now();
        let inv = Invite {
            token: invite::generate_token(),
            room_id: room.id,
            email: "tard@example.org".to_string(),
            invited_by: owner,
            role: MemberRole::Member,
            expires_at: now - chrono::Duration::hours(1),
            created_at: now - chrono::Duration::days(8),
        };
        db.insert_invite(&inv).unwrap();

        assert!(!db.consume_invite(&inv.token, now).unwrap());
        // The record survives an expired acceptance attempt (no side effects).
        assert!(db.get_invite(&inv.token).is_ok());
    }

    #[test]
    fn delete_room_cascades_membership() {
        let mut db = test_db();
        let owner = UserId::new();
        let room = make_room(owner, 0);
        db.create_room(&room).unwrap();

        assert!(db.delete_room(room.id).unwrap());
        assert!(matches!(db.get_room(room.id), Err(StoreError::NotFound)));
        assert_eq!(db.member_role(room.id, owner).unwrap(), None);
    }

    #[test]
    fn update_settings_round_trip() {
        let mut db = test_db();
        let owner = UserId::new();
        let room = make_room(owner, 0);
        db.create_room(&room).unwrap();

        let tightened = RoomSettings {
            allow_invites: false,
            member_limit: 4,
            message_retention_days: 30,
            allow_reactions: false,
            ..Default::default()
        };
        assert!(db.update_settings(room.id, &tightened).unwrap());
        assert_eq!(db.get_room(room.id).unwrap().settings, tightened);

        assert!(!db.update_settings(RoomId::new(), &tightened).unwrap());
    }

    #[test]
    fn presence_round_trip() {
        let db = test_db();
        let user = UserId::new();
        let now = Utc::now();
        db.upsert_user(user, "Aline", now).unwrap();

        db.set_presence(user, Presence::Online, None).unwrap();
        assert_eq!(db.get_user(user).unwrap().presence, Presence::Online);

        db.set_presence(user, Presence::Offline, Some(now)).unwrap();
        let rec = db.get_user(user).unwrap();
        assert_eq!(rec.presence, Presence::Offline);
        assert!(rec.last_seen.is_some());
    }
}
