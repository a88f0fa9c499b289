//! Room directory: membership, roles, invites, room lifecycle.
//!
//! Transport-independent.  Every mutating operation returns the full updated
//! room snapshot so callers can ack and fan out the same value.  Membership
//! races (concurrent joins against a member limit, double invite acceptance)
//! are settled by the store's guarded writes, never re-checked optimistically
//! here.

use std::sync::Arc;

use chrono::Utc;

use causerie_shared::protocol::ServerEvent;
use causerie_shared::{invite, ChatError, Invite, MemberRole, Room, RoomId, RoomSettings, UserId};
use causerie_store::rooms::AddMemberOutcome;

use crate::dispatch::FanoutDispatcher;
use crate::engine::SharedDb;
use crate::error::chat_err;
use crate::mailer::InviteMailer;

const MAX_ROOM_NAME_CHARS: usize = 128;

pub struct RoomDirectory {
    db: SharedDb,
    dispatcher: Arc<FanoutDispatcher>,
    mailer: Arc<dyn InviteMailer>,
}

impl RoomDirectory {
    pub fn new(db: SharedDb, dispatcher: Arc<FanoutDispatcher>, mailer: Arc<dyn InviteMailer>) -> Self {
        Self { db, dispatcher, mailer }
    }

    pub async fn create_room(&self, owner: UserId, name: &str) -> Result<Room, ChatError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ChatError::Validation("room name must not be empty".to_string()));
        }
        if name.chars().count() > MAX_ROOM_NAME_CHARS {
            return Err(ChatError::Validation(format!(
                "room name exceeds {MAX_ROOM_NAME_CHARS} characters"
            )));
        }

        let now = Utc::now();
        let room = Room {
            id: RoomId::new(),
            name: name.to_string(),
            owner_id: owner,
            members: Vec::new(),
            pinned_message_ids: Vec::new(),
            settings: RoomSettings::default(),
            last_activity: now,
            created_at: now,
        };

        let room = {
            let mut db = self.db.lock().await;
            db.create_room(&room).map_err(chat_err)?;
            db.get_room(room.id).map_err(chat_err)?
        };

        tracing::info!(room = %room.id, owner = %owner.short(), "room created");
        self.dispatcher.broadcast_room(&room, ServerEvent::MemberUpdate(room.clone())).await;
        Ok(room)
    }

    /// Join an open room.  Exceeding `memberLimit` rejects without mutating
    /// membership; re-joining is idempotent.
    pub async fn join(&self, room_id: RoomId, user: UserId) -> Result<Room, ChatError> {
        let (outcome, room) = {
            let db = self.db.lock().await;
            let outcome = db
                .add_member(room_id, user, MemberRole::Member, Utc::now())
                .map_err(chat_err)?;
            if outcome == AddMemberOutcome::Full {
                return Err(ChatError::RoomFull);
            }
            (outcome, db.get_room(room_id).map_err(chat_err)?)
        };

        if outcome == AddMemberOutcome::Added {
            tracing::info!(room = %room_id, user = %user.short(), "member joined");
            self.dispatcher.broadcast_room(&room, ServerEvent::MemberUpdate(room.clone())).await;
        }
        Ok(room)
    }

    /// Leave a room.  The owner cannot leave their own room; they delete it
    /// (or the product grows ownership transfer later).
    pub async fn leave(&self, room_id: RoomId, user: UserId) -> Result<Room, ChatError> {
        let room = {
            let db = self.db.lock().await;
            match db.member_role(room_id, user).map_err(chat_err)? {
                None => return Err(ChatError::NotMember),
                Some(MemberRole::Owner) => return Err(ChatError::PermissionDenied),
                Some(_) => {}
            }
            db.remove_member(room_id, user).map_err(chat_err)?;
            db.get_room(room_id).map_err(chat_err)?
        };

        tracing::info!(room = %room_id, user = %user.short(), "member left");
        self.dispatcher.broadcast_room(&room, ServerEvent::MemberUpdate(room.clone())).await;
        // The leaver's other devices see the update too.
        self.dispatcher.send_to_user(user, ServerEvent::MemberUpdate(room.clone())).await;
        Ok(room)
    }

    /// Remove another member.  Requires admin or owner, and strictly higher
    /// rank than the target.
    pub async fn kick(
        &self,
        room_id: RoomId,
        by: UserId,
        target: UserId,
    ) -> Result<Room, ChatError> {
        if by == target {
            return Err(ChatError::Validation("use leave to remove yourself".to_string()));
        }

        let room = {
            let db = self.db.lock().await;
            let by_role = db
                .member_role(room_id, by)
                .map_err(chat_err)?
                .ok_or(ChatError::NotMember)?;
            let target_role = db
                .member_role(room_id, target)
                .map_err(chat_err)?
                .ok_or(ChatError::NotFound)?;

            if by_role.rank() < MemberRole::Admin.rank() || by_role.rank() <= target_role.rank() {
                return Err(ChatError::PermissionDenied);
            }

            db.remove_member(room_id, target).map_err(chat_err)?;
            db.get_room(room_id).map_err(chat_err)?
        };

        tracing::info!(room = %room_id, by = %by.short(), target = %target.short(), "member kicked");
        self.dispatcher.broadcast_room(&room, ServerEvent::MemberUpdate(room.clone())).await;
        self.dispatcher.send_to_user(target, ServerEvent::MemberUpdate(room.clone())).await;
        Ok(room)
    }

    /// Replace the room's settings (owner only).  Members get the new
    /// snapshot; enforcement applies from the next operation on.
    pub async fn update_settings(
        &self,
        room_id: RoomId,
        by: UserId,
        settings: RoomSettings,
    ) -> Result<Room, ChatError> {
        let room = {
            let db = self.db.lock().await;
            let room = db.get_room(room_id).map_err(chat_err)?;
            match room.role_of(by) {
                None => return Err(ChatError::NotMember),
                Some(MemberRole::Owner) => {}
                Some(_) => return Err(ChatError::PermissionDenied),
            }
            if settings.member_limit != 0 && (settings.member_limit as usize) < room.members.len() {
                return Err(ChatError::Validation(
                    "member limit below current member count".to_string(),
                ));
            }

            if !db.update_settings(room_id, &settings).map_err(chat_err)? {
                return Err(ChatError::NotFound);
            }
            db.get_room(room_id).map_err(chat_err)?
        };

        tracing::info!(room = %room_id, by = %by.short(), "room settings updated");
        self.dispatcher.broadcast_room(&room, ServerEvent::MemberUpdate(room.clone())).await;
        Ok(room)
    }

    /// Issue a single-use invite token and hand it to the mailer.
    pub async fn invite(
        &self,
        room_id: RoomId,
        inviter: UserId,
        email: &str,
        role: MemberRole,
    ) -> Result<Invite, ChatError> {
        let email = email.trim();
        if email.is_empty() || !email.contains('@') {
            return Err(ChatError::Validation("invalid invite email".to_string()));
        }

        let (invite, room_name) = {
            let db = self.db.lock().await;
            let room = db.get_room(room_id).map_err(chat_err)?;
            let inviter_role = room.role_of(inviter).ok_or(ChatError::NotMember)?;

            if !room.settings.allow_invites {
                return Err(ChatError::InvitesDisabled);
            }
            // Nobody grants ownership; granting admin takes admin.
            if role == MemberRole::Owner
                || (role == MemberRole::Admin && inviter_role.rank() < MemberRole::Admin.rank())
            {
                return Err(ChatError::PermissionDenied);
            }

            let now = Utc::now();
            let invite = Invite {
                token: invite::generate_token(),
                room_id,
                email: email.to_string(),
                invited_by: inviter,
                role,
                expires_at: invite::default_expiry(now),
                created_at: now,
            };
            db.insert_invite(&invite).map_err(chat_err)?;
            (invite, room.name)
        };

        tracing::info!(room = %room_id, inviter = %inviter.short(), "invite issued");
        self.mailer.send_invite(&invite, &room_name);
        Ok(invite)
    }

    /// Redeem an invite token.  Single use: the conditional delete in the
    /// store decides which of two concurrent acceptors wins.  An expired or
    /// already-consumed token fails with no side effects.
    pub async fn accept_invite(&self, token: &str, user: UserId) -> Result<Room, ChatError> {
        let now = Utc::now();

        let (outcome, room) = {
            let db = self.db.lock().await;
            let invite = match db.get_invite(token) {
                Ok(invite) => invite,
                Err(causerie_store::StoreError::NotFound) => return Err(ChatError::InvalidToken),
                Err(e) => return Err(chat_err(e)),
            };
            if invite.expires_at <= now {
                return Err(ChatError::Expired);
            }

            if !db.consume_invite(token, now).map_err(chat_err)? {
                // Lost the race; distinguish a consumed token from a clock edge.
                return match db.get_invite(token) {
                    Ok(_) => Err(ChatError::Expired),
                    Err(_) => Err(ChatError::InvalidToken),
                };
            }

            let outcome = db
                .add_member(invite.room_id, user, invite.role, now)
                .map_err(chat_err)?;
            if outcome == AddMemberOutcome::Full {
                // Keep the rejection side-effect free: restore the token.
                db.insert_invite(&invite).map_err(chat_err)?;
                return Err(ChatError::RoomFull);
            }
            (outcome, db.get_room(invite.room_id).map_err(chat_err)?)
        };

        if outcome == AddMemberOutcome::Added {
            tracing::info!(room = %room.id, user = %user.short(), "invite accepted");
            self.dispatcher.broadcast_room(&room, ServerEvent::MemberUpdate(room.clone())).await;
        }
        Ok(room)
    }

    /// Delete a room (owner only).  Members are told *before* the records
    /// disappear so clients can react; the store cascade then removes
    /// membership, invites, messages, edits, and reactions in one go.
    pub async fn delete_room(&self, room_id: RoomId, by: UserId) -> Result<(), ChatError> {
        let room = {
            let db = self.db.lock().await;
            let room = db.get_room(room_id).map_err(chat_err)?;
            if room.role_of(by) != Some(MemberRole::Owner) {
                return Err(ChatError::PermissionDenied);
            }
            room
        };

        self.dispatcher
            .broadcast_room(&room, ServerEvent::RoomDeleted { room_id })
            .await;

        {
            let db = self.db.lock().await;
            db.delete_room(room_id).map_err(chat_err)?;
        }
        tracing::info!(room = %room_id, by = %by.short(), "room deleted");
        Ok(())
    }

    pub async fn get_room(&self, room_id: RoomId) -> Result<Room, ChatError> {
        self.db.lock().await.get_room(room_id).map_err(chat_err)
    }

    pub async fn rooms_for_user(&self, user: UserId) -> Result<Vec<Room>, ChatError> {
        self.db.lock().await.rooms_for_user(user).map_err(chat_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use tokio::sync::{mpsc, Mutex};

    use causerie_shared::ConnectionId;
    use causerie_store::Database;

    use crate::registry::{Outbound, SessionRegistry};

    struct RecordingMailer {
        sent: StdMutex<Vec<Invite>>,
    }

    impl InviteMailer for RecordingMailer {
        fn send_invite(&self, invite: &Invite, _room_name: &str) {
            self.sent.lock().unwrap().push(invite.clone());
        }
    }

    fn harness() -> (RoomDirectory, Arc<SessionRegistry>, Arc<RecordingMailer>) {
        let db: SharedDb = Arc::new(Mutex::new(Database::open_in_memory(&[0u8; 32]).unwrap()));
        let registry = Arc::new(SessionRegistry::new(Duration::from_secs(3)));
        let dispatcher = Arc::new(FanoutDispatcher::new(Arc::clone(&registry)));
        let mailer = Arc::new(RecordingMailer { sent: StdMutex::new(Vec::new()) });
        let mailer_dyn: Arc<dyn InviteMailer> = mailer.clone();
        let directory = RoomDirectory::new(db, dispatcher, mailer_dyn);
        (directory, registry, mailer)
    }

    #[tokio::test]
    async fn create_join_leave_round_trip() {
        let (directory, _registry, _mailer) = harness();
        let owner = UserId::new();
        let guest = UserId::new();

        let room = directory.create_room(owner, "  salon  ").await.unwrap();
        assert_eq!(room.name, "salon");
        assert_eq!(room.role_of(owner), Some(MemberRole::Owner));

        let room = directory.join(room.id, guest).await.unwrap();
        assert_eq!(room.members.len(), 2);

        // Idempotent re-join.
        let room = directory.join(room.id, guest).await.unwrap();
        assert_eq!(room.members.len(), 2);

        let room = directory.leave(room.id, guest).await.unwrap();
        assert_eq!(room.members.len(), 1);

        // The owner cannot leave their own room.
        assert!(matches!(
            directory.leave(room.id, owner).await,
            Err(ChatError::PermissionDenied)
        ));
    }

    #[tokio::test]
    async fn empty_room_name_is_rejected() {
        let (directory, _registry, _mailer) = harness();
        assert!(matches!(
            directory.create_room(UserId::new(), "   ").await,
            Err(ChatError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn invite_flow_is_single_use() {
        let (directory, _registry, mailer) = harness();
        let owner = UserId::new();
        let guest = UserId::new();
        let room = directory.create_room(owner, "prive").await.unwrap();

        let invite = directory
            .invite(room.id, owner, "ami@example.org", MemberRole::Member)
            .await
            .unwrap();
        assert_eq!(mailer.sent.lock().unwrap().len(), 1);

        let joined = directory.accept_invite(&invite.token, guest).await.unwrap();
        assert_eq!(joined.role_of(guest), Some(MemberRole::Member));

        // Second redemption of the same token fails.
        assert!(matches!(
            directory.accept_invite(&invite.token, UserId::new()).await,
            Err(ChatError::InvalidToken)
        ));
    }

    #[tokio::test]
    async fn invite_permissions_are_enforced() {
        let (directory, _registry, _mailer) = harness();
        let owner = UserId::new();
        let member = UserId::new();
        let outsider = UserId::new();
        let room = directory.create_room(owner, "regles").await.unwrap();
        directory.join(room.id, member).await.unwrap();

        // Non-members cannot invite.
        assert!(matches!(
            directory.invite(room.id, outsider, "x@example.org", MemberRole::Member).await,
            Err(ChatError::NotMember)
        ));
        // A plain member cannot grant admin.
        assert!(matches!(
            directory.invite(room.id, member, "x@example.org", MemberRole::Admin).await,
            Err(ChatError::PermissionDenied)
        ));
        // Nobody grants ownership.
        assert!(matches!(
            directory.invite(room.id, owner, "x@example.org", MemberRole::Owner).await,
            Err(ChatError::PermissionDenied)
        ));
        // Garbage email.
        assert!(matches!(
            directory.invite(room.id, owner, "not-an-email", MemberRole::Member).await,
            Err(ChatError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn unknown_token_is_invalid() {
        let (directory, _registry, _mailer) = harness();
        assert!(matches!(
            directory.accept_invite("nope", UserId::new()).await,
            Err(ChatError::InvalidToken)
        ));
    }

    #[tokio::test]
    async fn kick_respects_rank() {
        let (directory, _registry, _mailer) = harness();
        let owner = UserId::new();
        let guest_a = UserId::new();
        let guest_b = UserId::new();
        let room = directory.create_room(owner, "ordre").await.unwrap();
        directory.join(room.id, guest_a).await.unwrap();
        directory.join(room.id, guest_b).await.unwrap();

        // A plain member cannot kick.
        assert!(matches!(
            directory.kick(room.id, guest_a, guest_b).await,
            Err(ChatError::PermissionDenied)
        ));
        // Nobody kicks the owner.
        assert!(matches!(
            directory.kick(room.id, guest_a, owner).await,
            Err(ChatError::PermissionDenied)
        ));

        let room_after = directory.kick(room.id, owner, guest_b).await.unwrap();
        assert!(room_after.member(guest_b).is_none());
    }

    #[tokio::test]
    async fn settings_update_is_owner_only_and_broadcast() {
        let (directory, registry, _mailer) = harness();
        let owner = UserId::new();
        let guest = UserId::new();
        let room = directory.create_room(owner, "reglages").await.unwrap();
        directory.join(room.id, guest).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register(ConnectionId::new(), guest, tx).await;

        let closed = RoomSettings { allow_invites: false, ..Default::default() };
        assert!(matches!(
            directory.update_settings(room.id, guest, closed.clone()).await,
            Err(ChatError::PermissionDenied)
        ));
        assert!(matches!(
            directory.update_settings(room.id, UserId::new(), closed.clone()).await,
            Err(ChatError::NotMember)
        ));

        let updated = directory.update_settings(room.id, owner, closed).await.unwrap();
        assert!(!updated.settings.allow_invites);

        // The new settings bite on the next operation.
        assert!(matches!(
            directory.invite(room.id, owner, "x@example.org", MemberRole::Member).await,
            Err(ChatError::InvitesDisabled)
        ));

        // Members received the full updated snapshot.
        let frame = rx.try_recv().unwrap();
        assert!(matches!(
            frame,
            Outbound::Event(ServerEvent::MemberUpdate(r)) if !r.settings.allow_invites
        ));
    }

    #[tokio::test]
    async fn member_limit_cannot_undercut_current_membership() {
        let (directory, _registry, _mailer) = harness();
        let owner = UserId::new();
        let room = directory.create_room(owner, "etroit").await.unwrap();
        directory.join(room.id, UserId::new()).await.unwrap();

        let too_small = RoomSettings { member_limit: 1, ..Default::default() };
        assert!(matches!(
            directory.update_settings(room.id, owner, too_small).await,
            Err(ChatError::Validation(_))
        ));

        let exact = RoomSettings { member_limit: 2, ..Default::default() };
        let updated = directory.update_settings(room.id, owner, exact).await.unwrap();
        assert_eq!(updated.settings.member_limit, 2);

        // The cap holds for the next join.
        assert!(matches!(
            directory.join(room.id, UserId::new()).await,
            Err(ChatError::RoomFull)
        ));
    }

    #[tokio::test]
    async fn delete_room_notifies_members_before_removal() {
        let (directory, registry, _mailer) = harness();
        let owner = UserId::new();
        let guest = UserId::new();
        let room = directory.create_room(owner, "adieu").await.unwrap();
        directory.join(room.id, guest).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register(ConnectionId::new(), guest, tx).await;

        // Only the owner may delete.
        assert!(matches!(
            directory.delete_room(room.id, guest).await,
            Err(ChatError::PermissionDenied)
        ));

        directory.delete_room(room.id, owner).await.unwrap();
        assert!(matches!(directory.get_room(room.id).await, Err(ChatError::NotFound)));

        // The guest was told even though the room is now gone.
        let frame = rx.try_recv().unwrap();
        assert!(matches!(
            frame,
            Outbound::Event(ServerEvent::RoomDeleted { room_id }) if room_id == room.id
        ));
    }
}
