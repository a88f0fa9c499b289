//! Message ledger: the message state machine behind send, edit, delete,
//! react, pin, and expiry.
//!
//! Membership is re-checked at send time, not trusted from socket-join time,
//! so a kick that lands between join and send wins.  Every mutation returns
//! the full updated message snapshot; the dispatcher broadcasts that same
//! value so clients never merge diffs.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use causerie_shared::constants::{MAX_CONTENT_CHARS, MAX_EMOJI_CHARS, MAX_METADATA_BYTES};
use causerie_shared::protocol::{ReactionAction, ServerEvent};
use causerie_shared::{
    ChatError, MemberRole, Message, MessageId, MessageKind, MessageStatus, Room, RoomId, UserId,
};

use crate::dispatch::FanoutDispatcher;
use crate::engine::SharedDb;
use crate::error::chat_err;

/// Payload of one send request, scheduled or immediate.
#[derive(Debug, Clone)]
pub struct Draft {
    pub room_id: RoomId,
    pub kind: MessageKind,
    pub content: String,
    pub metadata: Option<serde_json::Value>,
    pub reply_to: Option<MessageId>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

pub struct MessageLedger {
    db: SharedDb,
    dispatcher: Arc<FanoutDispatcher>,
}

impl MessageLedger {
    pub fn new(db: SharedDb, dispatcher: Arc<FanoutDispatcher>) -> Self {
        Self { db, dispatcher }
    }

    /// Persist and broadcast a message.  A draft with `scheduled_for` is
    /// stored `scheduled` and *not* broadcast; the caller arms the scheduler
    /// with the returned snapshot.
    pub async fn send(&self, sender: UserId, draft: Draft) -> Result<Message, ChatError> {
        validate_content(&draft.content)?;
        validate_metadata(draft.metadata.as_ref())?;

        let now = Utc::now();
        let status = match draft.scheduled_for {
            Some(when) if when <= now => {
                return Err(ChatError::Validation(
                    "scheduledFor must be in the future".to_string(),
                ));
            }
            Some(_) => MessageStatus::Scheduled,
            None => MessageStatus::Sent,
        };
        if let Some(when) = draft.expires_at {
            if when <= now {
                return Err(ChatError::Validation("expiresAt must be in the future".to_string()));
            }
        }

        let (message, room) = {
            let db = self.db.lock().await;
            let room = db.get_room(draft.room_id).map_err(chat_err)?;
            if room.role_of(sender).is_none() {
                return Err(ChatError::NotMember);
            }
            match draft.kind {
                MessageKind::Voice if !room.settings.allow_voice => {
                    return Err(ChatError::PermissionDenied);
                }
                MessageKind::File if !room.settings.allow_files => {
                    return Err(ChatError::PermissionDenied);
                }
                _ => {}
            }
            if let Some(reply_to) = draft.reply_to {
                let target = db.get_live_message(reply_to).map_err(chat_err)?;
                if target.room_id != draft.room_id {
                    return Err(ChatError::Validation(
                        "replyTo must reference a message in the same room".to_string(),
                    ));
                }
            }

            let message = Message {
                id: MessageId::new(),
                room_id: draft.room_id,
                sender_id: sender,
                kind: draft.kind,
                content: draft.content,
                metadata: draft.metadata,
                reply_to: draft.reply_to,
                reactions: Vec::new(),
                is_pinned: false,
                pinned_by: None,
                is_edited: false,
                edit_history: Vec::new(),
                is_deleted: false,
                deleted_at: None,
                created_at: now,
                status,
                scheduled_for: draft.scheduled_for,
                expires_at: draft.expires_at,
            };
            db.insert_message(&message).map_err(chat_err)?;
            db.touch_room(draft.room_id, now).map_err(chat_err)?;
            (db.get_message(message.id).map_err(chat_err)?, room)
        };

        match message.status {
            MessageStatus::Sent => {
                self.dispatcher
                    .broadcast_room(&room, ServerEvent::MessageNew(message.clone()))
                    .await;
            }
            MessageStatus::Scheduled => {
                // Invisible to the room until promotion; only the sender's
                // sessions learn about the pending delivery.
                self.dispatcher
                    .send_to_user(sender, ServerEvent::MessageScheduled(message.clone()))
                    .await;
            }
            _ => {}
        }
        Ok(message)
    }

    /// Replace content, appending the prior revision to the edit history.
    /// Only the sender may edit; a deleted or expired message is `NotFound`.
    pub async fn edit(
        &self,
        message_id: MessageId,
        by: UserId,
        content: &str,
    ) -> Result<Message, ChatError> {
        validate_content(content)?;

        let (message, room) = {
            let mut db = self.db.lock().await;
            let current = db.get_live_message(message_id).map_err(chat_err)?;
            if current.sender_id != by {
                return Err(ChatError::PermissionDenied);
            }
            db.edit_message(message_id, content, Utc::now()).map_err(chat_err)?;
            let message = db.get_message(message_id).map_err(chat_err)?;
            let room = db.get_room(message.room_id).map_err(chat_err)?;
            (message, room)
        };

        self.dispatcher
            .broadcast_room(&room, ServerEvent::MessageEdited(message.clone()))
            .await;
        Ok(message)
    }

    /// Soft delete.  Sender or room admin+; the row stays for audit.
    pub async fn delete(&self, message_id: MessageId, by: UserId) -> Result<Message, ChatError> {
        let (message, room) = {
            let db = self.db.lock().await;
            let current = db.get_live_message(message_id).map_err(chat_err)?;
            let room = db.get_room(current.room_id).map_err(chat_err)?;
            if current.sender_id != by && !is_admin(&room, by) {
                return Err(ChatError::PermissionDenied);
            }
            if !db.soft_delete_message(message_id, Utc::now()).map_err(chat_err)? {
                return Err(ChatError::NotFound);
            }
            (db.get_message(message_id).map_err(chat_err)?, room)
        };

        self.dispatcher
            .broadcast_room(&room, ServerEvent::MessageDeleted(message.clone()))
            .await;
        Ok(message)
    }

    /// Toggle a reaction.  Adding twice or removing a missing reaction is a
    /// no-op; the broadcast always carries the aggregated snapshot.
    pub async fn react(
        &self,
        message_id: MessageId,
        by: UserId,
        emoji: &str,
        action: ReactionAction,
    ) -> Result<Message, ChatError> {
        let emoji = emoji.trim();
        if emoji.is_empty() || emoji.chars().count() > MAX_EMOJI_CHARS {
            return Err(ChatError::Validation("invalid reaction emoji".to_string()));
        }

        let (message, room) = {
            let db = self.db.lock().await;
            let current = db.get_live_message(message_id).map_err(chat_err)?;
            let room = db.get_room(current.room_id).map_err(chat_err)?;
            if room.role_of(by).is_none() {
                return Err(ChatError::NotMember);
            }
            if !room.settings.allow_reactions {
                return Err(ChatError::PermissionDenied);
            }

            match action {
                ReactionAction::Add => {
                    db.add_reaction(message_id, by, emoji, Utc::now()).map_err(chat_err)?;
                }
                ReactionAction::Remove => {
                    db.remove_reaction(message_id, by, emoji).map_err(chat_err)?;
                }
            }
            (db.get_message(message_id).map_err(chat_err)?, room)
        };

        self.dispatcher
            .broadcast_room(&room, ServerEvent::MessageReaction(message.clone()))
            .await;
        Ok(message)
    }

    /// Pin or unpin.  Admin+ and the room must allow pinning.
    pub async fn set_pinned(
        &self,
        message_id: MessageId,
        by: UserId,
        pinned: bool,
    ) -> Result<Message, ChatError> {
        let (message, room) = {
            let db = self.db.lock().await;
            let current = db.get_live_message(message_id).map_err(chat_err)?;
            let room = db.get_room(current.room_id).map_err(chat_err)?;
            if room.role_of(by).is_none() {
                return Err(ChatError::NotMember);
            }
            if !room.settings.allow_pinning || !is_admin(&room, by) {
                return Err(ChatError::PermissionDenied);
            }

            let by_arg = pinned.then_some(by);
            if !db.set_pinned(message_id, by_arg, Utc::now()).map_err(chat_err)? {
                return Err(ChatError::NotFound);
            }
            let message = db.get_message(message_id).map_err(chat_err)?;
            // Refetch: the pinned set just changed.
            let room = db.get_room(message.room_id).map_err(chat_err)?;
            (message, room)
        };

        let event = if pinned {
            ServerEvent::MessagePinned(message.clone())
        } else {
            ServerEvent::MessageUnpinned(message.clone())
        };
        self.dispatcher.broadcast_room(&room, event).await;
        Ok(message)
    }

    /// Set or move a live message's expiry.  The sweep picks it up from
    /// there; no broadcast until it actually expires.
    pub async fn set_expiry(
        &self,
        message_id: MessageId,
        by: UserId,
        expires_at: DateTime<Utc>,
    ) -> Result<Message, ChatError> {
        if expires_at <= Utc::now() {
            return Err(ChatError::Validation("expiresAt must be in the future".to_string()));
        }

        let db = self.db.lock().await;
        let current = db.get_live_message(message_id).map_err(chat_err)?;
        let room = db.get_room(current.room_id).map_err(chat_err)?;
        if current.sender_id != by && !is_admin(&room, by) {
            return Err(ChatError::PermissionDenied);
        }
        if !db.set_expiry(message_id, expires_at).map_err(chat_err)? {
            return Err(ChatError::NotFound);
        }
        db.get_message(message_id).map_err(chat_err)
    }

    /// Live history for a member, newest first.
    pub async fn history(
        &self,
        room_id: RoomId,
        requester: UserId,
        limit: u32,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>, ChatError> {
        let limit = limit.clamp(1, 200);
        let db = self.db.lock().await;
        if db.member_role(room_id, requester).map_err(chat_err)?.is_none() {
            // NotFound for a missing room, NotMember for an existing one.
            db.get_room(room_id).map_err(chat_err)?;
            return Err(ChatError::NotMember);
        }
        db.live_messages(room_id, limit, before).map_err(chat_err)
    }
}

fn is_admin(room: &Room, user: UserId) -> bool {
    room.role_of(user)
        .map(|r| r.rank() >= MemberRole::Admin.rank())
        .unwrap_or(false)
}

fn validate_content(content: &str) -> Result<(), ChatError> {
    if content.trim().is_empty() {
        return Err(ChatError::Validation("content must not be empty".to_string()));
    }
    if content.chars().count() > MAX_CONTENT_CHARS {
        return Err(ChatError::Validation(format!(
            "content exceeds {MAX_CONTENT_CHARS} characters"
        )));
    }
    Ok(())
}

fn validate_metadata(metadata: Option<&serde_json::Value>) -> Result<(), ChatError> {
    if let Some(value) = metadata {
        let size = serde_json::to_string(value)
            .map_err(|e| ChatError::Validation(format!("invalid metadata: {e}")))?
            .len();
        if size > MAX_METADATA_BYTES {
            return Err(ChatError::Validation(format!(
                "metadata exceeds {MAX_METADATA_BYTES} bytes"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::sync::{mpsc, Mutex};

    use causerie_shared::{ConnectionId, RoomSettings};
    use causerie_store::Database;

    use crate::registry::{Outbound, SessionRegistry};

    struct Harness {
        ledger: MessageLedger,
        db: SharedDb,
        registry: Arc<SessionRegistry>,
    }

    fn harness() -> Harness {
        let db: SharedDb = Arc::new(Mutex::new(Database::open_in_memory(&[0u8; 32]).unwrap()));
        let registry = Arc::new(SessionRegistry::new(Duration::from_secs(3)));
        let dispatcher = Arc::new(FanoutDispatcher::new(Arc::clone(&registry)));
        let ledger = MessageLedger::new(Arc::clone(&db), dispatcher);
        Harness { ledger, db, registry }
    }

    async fn seed_room(h: &Harness, settings: RoomSettings) -> (RoomId, UserId, UserId) {
        let owner = UserId::new();
        let member = UserId::new();
        let now = Utc::now();
        let room = Room {
            id: RoomId::new(),
            name: "salon".to_string(),
            owner_id: owner,
            members: Vec::new(),
            pinned_message_ids: Vec::new(),
            settings,
            last_activity: now,
            created_at: now,
        };
        let mut db = h.db.lock().await;
        db.create_room(&room).unwrap();
        db.add_member(room.id, member, MemberRole::Member, now).unwrap();
        (room.id, owner, member)
    }

    fn text_draft(room_id: RoomId, content: &str) -> Draft {
        Draft {
            room_id,
            kind: MessageKind::Text,
            content: content.to_string(),
            metadata: None,
            reply_to: None,
            scheduled_for: None,
            expires_at: None,
        }
    }

    #[tokio::test]
    async fn send_broadcasts_to_members() {
        let h = harness();
        let (room, owner, member) = seed_room(&h, RoomSettings::default()).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        h.registry.register(ConnectionId::new(), member, tx).await;

        let message = h.ledger.send(owner, text_draft(room, "salut")).await.unwrap();
        assert_eq!(message.status, MessageStatus::Sent);
        assert_eq!(message.sender_id, owner);

        match rx.recv().await.unwrap() {
            Outbound::Event(ServerEvent::MessageNew(m)) => assert_eq!(m.id, message.id),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_member_send_is_rejected() {
        let h = harness();
        let (room, _owner, _member) = seed_room(&h, RoomSettings::default()).await;
        let outsider = UserId::new();
        assert!(matches!(
            h.ledger.send(outsider, text_draft(room, "intrus")).await,
            Err(ChatError::NotMember)
        ));
    }

    #[tokio::test]
    async fn content_limits_are_enforced() {
        let h = harness();
        let (room, owner, _) = seed_room(&h, RoomSettings::default()).await;

        assert!(matches!(
            h.ledger.send(owner, text_draft(room, "   ")).await,
            Err(ChatError::Validation(_))
        ));

        let oversized = "x".repeat(MAX_CONTENT_CHARS + 1);
        assert!(matches!(
            h.ledger.send(owner, text_draft(room, &oversized)).await,
            Err(ChatError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn reply_to_must_live_in_same_room() {
        let h = harness();
        let (room_a, owner, _) = seed_room(&h, RoomSettings::default()).await;
        let (room_b, other_owner, _) = seed_room(&h, RoomSettings::default()).await;

        let foreign = h.ledger.send(other_owner, text_draft(room_b, "ailleurs")).await.unwrap();

        let mut draft = text_draft(room_a, "reponse");
        draft.reply_to = Some(foreign.id);
        assert!(matches!(
            h.ledger.send(owner, draft).await,
            Err(ChatError::Validation(_))
        ));

        // Replying to a message in the same room works.
        let original = h.ledger.send(owner, text_draft(room_a, "origine")).await.unwrap();
        let mut draft = text_draft(room_a, "reponse");
        draft.reply_to = Some(original.id);
        let reply = h.ledger.send(owner, draft).await.unwrap();
        assert_eq!(reply.reply_to, Some(original.id));
    }

    #[tokio::test]
    async fn voice_messages_respect_room_settings() {
        let h = harness();
        let settings = RoomSettings { allow_voice: false, ..Default::default() };
        let (room, owner, _) = seed_room(&h, settings).await;

        let mut draft = text_draft(room, "blob://voice");
        draft.kind = MessageKind::Voice;
        assert!(matches!(
            h.ledger.send(owner, draft).await,
            Err(ChatError::PermissionDenied)
        ));
    }

    #[tokio::test]
    async fn only_the_sender_edits() {
        let h = harness();
        let (room, owner, member) = seed_room(&h, RoomSettings::default()).await;
        let message = h.ledger.send(owner, text_draft(room, "v1")).await.unwrap();

        assert!(matches!(
            h.ledger.edit(message.id, member, "pirate").await,
            Err(ChatError::PermissionDenied)
        ));

        let edited = h.ledger.edit(message.id, owner, "v2").await.unwrap();
        assert!(edited.is_edited);
        assert_eq!(edited.content, "v2");
        assert_eq!(edited.edit_history.len(), 1);
        assert_eq!(edited.edit_history[0].content, "v1");
    }

    #[tokio::test]
    async fn admins_may_delete_others_messages() {
        let h = harness();
        let (room, owner, member) = seed_room(&h, RoomSettings::default()).await;
        let message = h.ledger.send(member, text_draft(room, "a moderer")).await.unwrap();

        // A plain member cannot delete someone else's message.
        let other = UserId::new();
        {
            let db = h.db.lock().await;
            db.add_member(room, other, MemberRole::Member, Utc::now()).unwrap();
        }
        assert!(matches!(
            h.ledger.delete(message.id, other).await,
            Err(ChatError::PermissionDenied)
        ));

        let deleted = h.ledger.delete(message.id, owner).await.unwrap();
        assert!(deleted.is_deleted);

        // Gone from live reads, edit now fails.
        assert!(h.ledger.history(room, owner, 50, None).await.unwrap().is_empty());
        assert!(matches!(
            h.ledger.edit(message.id, member, "retour").await,
            Err(ChatError::NotFound)
        ));
    }

    #[tokio::test]
    async fn reactions_are_idempotent_and_gated() {
        let h = harness();
        let (room, owner, member) = seed_room(&h, RoomSettings::default()).await;
        let message = h.ledger.send(owner, text_draft(room, "reagis")).await.unwrap();

        let once = h
            .ledger
            .react(message.id, member, "👍", ReactionAction::Add)
            .await
            .unwrap();
        let twice = h
            .ledger
            .react(message.id, member, "👍", ReactionAction::Add)
            .await
            .unwrap();
        assert_eq!(once.reactions, twice.reactions);
        assert_eq!(twice.reactions.len(), 1);
        assert_eq!(twice.reactions[0].user_ids, vec![member]);

        // Removing a reaction that is not there is a no-op.
        let removed = h
            .ledger
            .react(message.id, owner, "🎉", ReactionAction::Remove)
            .await
            .unwrap();
        assert_eq!(removed.reactions.len(), 1);

        // allowReactions=false turns the feature off.
        let settings = RoomSettings { allow_reactions: false, ..Default::default() };
        let (quiet_room, quiet_owner, _) = seed_room(&h, settings).await;
        let quiet = h.ledger.send(quiet_owner, text_draft(quiet_room, "calme")).await.unwrap();
        assert!(matches!(
            h.ledger.react(quiet.id, quiet_owner, "👍", ReactionAction::Add).await,
            Err(ChatError::PermissionDenied)
        ));
    }

    #[tokio::test]
    async fn pinning_requires_admin() {
        let h = harness();
        let (room, owner, member) = seed_room(&h, RoomSettings::default()).await;
        let message = h.ledger.send(owner, text_draft(room, "important")).await.unwrap();

        assert!(matches!(
            h.ledger.set_pinned(message.id, member, true).await,
            Err(ChatError::PermissionDenied)
        ));

        let pinned = h.ledger.set_pinned(message.id, owner, true).await.unwrap();
        assert!(pinned.is_pinned);
        assert_eq!(pinned.pinned_by, Some(owner));

        let room_snapshot = {
            let db = h.db.lock().await;
            db.get_room(room).unwrap()
        };
        assert_eq!(room_snapshot.pinned_message_ids, vec![message.id]);

        let unpinned = h.ledger.set_pinned(message.id, owner, false).await.unwrap();
        assert!(!unpinned.is_pinned);
    }

    #[tokio::test]
    async fn scheduled_send_is_not_broadcast() {
        let h = harness();
        let (room, owner, member) = seed_room(&h, RoomSettings::default()).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        h.registry.register(ConnectionId::new(), member, tx).await;

        let mut draft = text_draft(room, "plus tard");
        draft.scheduled_for = Some(Utc::now() + chrono::Duration::minutes(5));
        let message = h.ledger.send(owner, draft).await.unwrap();
        assert_eq!(message.status, MessageStatus::Scheduled);

        // The member saw nothing; only the sender's sessions get the notice.
        assert!(rx.try_recv().is_err());
        assert!(h.ledger.history(room, member, 50, None).await.unwrap().is_empty());

        // Scheduling into the past is rejected up front.
        let mut stale = text_draft(room, "trop tard");
        stale.scheduled_for = Some(Utc::now() - chrono::Duration::minutes(1));
        assert!(matches!(
            h.ledger.send(owner, stale).await,
            Err(ChatError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn expiry_must_be_future_and_owned() {
        let h = harness();
        let (room, owner, member) = seed_room(&h, RoomSettings::default()).await;
        let message = h.ledger.send(owner, text_draft(room, "fugace")).await.unwrap();

        assert!(matches!(
            h.ledger
                .set_expiry(message.id, owner, Utc::now() - chrono::Duration::seconds(1))
                .await,
            Err(ChatError::Validation(_))
        ));
        assert!(matches!(
            h.ledger
                .set_expiry(message.id, member, Utc::now() + chrono::Duration::minutes(1))
                .await,
            Err(ChatError::PermissionDenied)
        ));

        let when = Utc::now() + chrono::Duration::minutes(1);
        let updated = h.ledger.set_expiry(message.id, owner, when).await.unwrap();
        assert!(updated.expires_at.is_some());
    }

    #[tokio::test]
    async fn history_requires_membership() {
        let h = harness();
        let (room, owner, _member) = seed_room(&h, RoomSettings::default()).await;
        h.ledger.send(owner, text_draft(room, "un")).await.unwrap();

        assert!(matches!(
            h.ledger.history(room, UserId::new(), 50, None).await,
            Err(ChatError::NotMember)
        ));
        assert!(matches!(
            h.ledger.history(RoomId::new(), owner, 50, None).await,
            Err(ChatError::NotFound)
        ));
        assert_eq!(h.ledger.history(room, owner, 50, None).await.unwrap().len(), 1);
    }
}
