//! Engine wiring: explicitly constructed services with injected store and
//! dispatcher, an explicit start/stop lifecycle, and the command dispatch the
//! gateway drives.
//!
//! Every client action resolves to a typed result here; the gateway only
//! relays acks and never sees domain logic.  A failing operation produces a
//! `{success:false, error, code}` ack and leaves state untouched.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

use causerie_shared::protocol::{
    Ack, ClientCommand, CommandFrame, PresenceEvent, ServerEvent, TypingEvent,
};
use causerie_shared::{ChatError, ConnectionId, MessageStatus, Presence, RoomId, UserId};
use causerie_store::Database;

use crate::config::ServerConfig;
use crate::dispatch::FanoutDispatcher;
use crate::e2e::E2eSessionManager;
use crate::ledger::{Draft, MessageLedger};
use crate::mailer::InviteMailer;
use crate::registry::{OutboundSender, SessionRegistry};
use crate::rooms::RoomDirectory;
use crate::scheduler::Scheduler;

/// The store handle shared by all services.  `rusqlite::Connection` is not
/// `Sync`, so access is serialized behind one async mutex; the store is the
/// per-entity serialization point anyway.
pub type SharedDb = Arc<Mutex<Database>>;

pub struct Engine {
    pub registry: Arc<SessionRegistry>,
    pub dispatcher: Arc<FanoutDispatcher>,
    pub rooms: RoomDirectory,
    pub ledger: MessageLedger,
    pub scheduler: Arc<Scheduler>,
    pub e2e: E2eSessionManager,
    db: SharedDb,
}

impl Engine {
    pub fn new(db: Database, config: &ServerConfig, mailer: Arc<dyn InviteMailer>) -> Arc<Self> {
        let db: SharedDb = Arc::new(Mutex::new(db));
        let registry = Arc::new(SessionRegistry::new(config.typing_timeout));
        let dispatcher = Arc::new(FanoutDispatcher::new(Arc::clone(&registry)));

        let rooms = RoomDirectory::new(Arc::clone(&db), Arc::clone(&dispatcher), mailer);
        let ledger = MessageLedger::new(Arc::clone(&db), Arc::clone(&dispatcher));
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&db),
            Arc::clone(&dispatcher),
            config.sweep_interval,
        ));
        let e2e = E2eSessionManager::new(Arc::clone(&db));

        Arc::new(Self { registry, dispatcher, rooms, ledger, scheduler, e2e, db })
    }

    /// Recover schedule state and start background duties.
    pub async fn start(&self) -> Result<(), ChatError> {
        self.scheduler.start().await
    }

    pub async fn stop(&self) {
        self.scheduler.stop().await;
        self.registry.shutdown().await;
    }

    // ------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------

    /// Admit an authenticated connection.  On the identity's first live
    /// connection, presence flips online and the rooms it belongs to are
    /// told.
    pub async fn connect(
        &self,
        conn_id: ConnectionId,
        user_id: UserId,
        display_name: &str,
        tx: OutboundSender,
    ) -> Result<(), ChatError> {
        if user_id.is_nil() || display_name.trim().is_empty() {
            return Err(ChatError::Auth);
        }

        {
            let db = self.db.lock().await;
            db.upsert_user(user_id, display_name.trim(), Utc::now())
                .map_err(crate::error::chat_err)?;
        }

        let first = self.registry.register(conn_id, user_id, tx).await;
        if first {
            {
                let db = self.db.lock().await;
                db.set_presence(user_id, Presence::Online, None)
                    .map_err(crate::error::chat_err)?;
            }
            self.broadcast_presence(user_id, Presence::Online, None).await;
        }
        Ok(())
    }

    /// Tear down one connection.  On the identity's last connection, typing
    /// indicators clear and presence flips offline with a last-seen stamp.
    pub async fn disconnect(&self, conn_id: ConnectionId) {
        let Some((user_id, last)) = self.registry.unregister(conn_id).await else {
            return;
        };
        if !last {
            return;
        }

        for room_id in self.registry.take_typing_rooms(user_id).await {
            self.broadcast_typing(room_id, user_id, false).await;
        }

        let now = Utc::now();
        if let Err(e) = self
            .db
            .lock()
            .await
            .set_presence(user_id, Presence::Offline, Some(now))
        {
            tracing::warn!(user = %user_id.short(), error = %e, "presence write failed");
        }
        self.broadcast_presence(user_id, Presence::Offline, Some(now)).await;
    }

    async fn broadcast_presence(
        &self,
        user_id: UserId,
        presence: Presence,
        last_seen: Option<DateTime<Utc>>,
    ) {
        let rooms = match self.db.lock().await.rooms_for_user(user_id) {
            Ok(rooms) => rooms,
            Err(e) => {
                tracing::warn!(user = %user_id.short(), error = %e, "presence fan-out skipped");
                return;
            }
        };

        // One event per recipient, even across shared rooms.
        let mut recipients: HashSet<UserId> = HashSet::new();
        for room in &rooms {
            for member in &room.members {
                recipients.insert(member.user_id);
            }
        }

        let event = ServerEvent::Presence(PresenceEvent { user_id, presence, last_seen });
        for recipient in recipients {
            self.dispatcher.send_to_user(recipient, event.clone()).await;
        }
    }

    // ------------------------------------------------------------------
    // Command dispatch
    // ------------------------------------------------------------------

    /// Process one inbound command to completion.  Returns the ack to relay,
    /// or `None` for fire-and-forget commands (typing, successful reactions).
    pub async fn handle_command(&self, user_id: UserId, frame: CommandFrame) -> Option<Ack> {
        let seq = frame.seq;
        match frame.command {
            ClientCommand::Hello { .. } => Some(Ack::err(
                seq,
                &ChatError::Validation("already authenticated".to_string()),
            )),

            ClientCommand::CreateRoom { name } => {
                Some(ack_of(seq, self.rooms.create_room(user_id, &name).await))
            }
            ClientCommand::Join { room_id } => {
                Some(ack_of(seq, self.rooms.join(room_id, user_id).await))
            }
            ClientCommand::Leave { room_id } => {
                Some(ack_of(seq, self.rooms.leave(room_id, user_id).await))
            }
            ClientCommand::KickMember { room_id, user_id: target } => {
                Some(ack_of(seq, self.rooms.kick(room_id, user_id, target).await))
            }
            ClientCommand::UpdateSettings { room_id, settings } => {
                Some(ack_of(seq, self.rooms.update_settings(room_id, user_id, settings).await))
            }
            ClientCommand::DeleteRoom { room_id } => {
                Some(ack_of(seq, self.rooms.delete_room(room_id, user_id).await))
            }

            ClientCommand::InviteToRoom { room_id, email, role } => {
                Some(ack_of(seq, self.rooms.invite(room_id, user_id, &email, role).await))
            }
            ClientCommand::AcceptInvite { token } => {
                Some(ack_of(seq, self.rooms.accept_invite(&token, user_id).await))
            }

            ClientCommand::SendMessage {
                room_id,
                kind,
                content,
                metadata,
                reply_to,
                scheduled_for,
                expires_at,
            } => {
                let draft = Draft {
                    room_id,
                    kind,
                    content,
                    metadata,
                    reply_to,
                    scheduled_for,
                    expires_at,
                };
                let result = self.ledger.send(user_id, draft).await;
                if let Ok(message) = &result {
                    if message.status == MessageStatus::Scheduled {
                        if let Some(when) = message.scheduled_for {
                            self.scheduler.arm(message.id, when).await;
                        }
                    }
                }
                Some(ack_of(seq, result))
            }
            ClientCommand::EditMessage { message_id, content } => {
                Some(ack_of(seq, self.ledger.edit(message_id, user_id, &content).await))
            }
            ClientCommand::DeleteMessage { message_id } => {
                Some(ack_of(seq, self.ledger.delete(message_id, user_id).await))
            }
            ClientCommand::Reaction { message_id, emoji, action } => {
                // Success is broadcast-only; failures still come back typed.
                match self.ledger.react(message_id, user_id, &emoji, action).await {
                    Ok(_) => None,
                    Err(e) => Some(Ack::err(seq, &e)),
                }
            }
            ClientCommand::Pin { message_id } => {
                Some(ack_of(seq, self.ledger.set_pinned(message_id, user_id, true).await))
            }
            ClientCommand::Unpin { message_id } => {
                Some(ack_of(seq, self.ledger.set_pinned(message_id, user_id, false).await))
            }
            ClientCommand::SetExpiry { message_id, expires_at } => {
                Some(ack_of(seq, self.ledger.set_expiry(message_id, user_id, expires_at).await))
            }

            ClientCommand::CancelScheduled { message_id } => {
                Some(ack_of(seq, self.scheduler.cancel(message_id, user_id).await))
            }
            ClientCommand::Reschedule { message_id, scheduled_for } => {
                Some(ack_of(
                    seq,
                    self.scheduler.reschedule(message_id, user_id, scheduled_for).await,
                ))
            }

            ClientCommand::Typing { room_id } => {
                self.handle_typing(room_id, user_id).await;
                None
            }
            ClientCommand::StopTyping { room_id } => {
                if self.registry.clear_typing(room_id, user_id).await {
                    self.broadcast_typing(room_id, user_id, false).await;
                }
                None
            }
        }
    }

    async fn handle_typing(&self, room_id: RoomId, user_id: UserId) {
        let room = match self.db.lock().await.get_room(room_id) {
            Ok(room) => room,
            Err(_) => return,
        };
        if room.role_of(user_id).is_none() {
            return;
        }

        let recipients: Vec<UserId> = room.members.iter().map(|m| m.user_id).collect();
        self.dispatcher
            .broadcast_room(
                &room,
                ServerEvent::Typing(TypingEvent { room_id, user_id, is_typing: true }),
            )
            .await;
        self.registry.arm_typing(room_id, user_id, recipients).await;
    }

    async fn broadcast_typing(&self, room_id: RoomId, user_id: UserId, is_typing: bool) {
        if let Ok(room) = self.db.lock().await.get_room(room_id) {
            self.dispatcher
                .broadcast_room(
                    &room,
                    ServerEvent::Typing(TypingEvent { room_id, user_id, is_typing }),
                )
                .await;
        }
    }
}

/// Fold an operation result into the wire ack.  `()` successes carry no data.
fn ack_of<T: Serialize>(seq: Option<u64>, result: Result<T, ChatError>) -> Ack {
    match result {
        Ok(value) => match serde_json::to_value(&value) {
            Ok(serde_json::Value::Null) => Ack::ok(seq, None),
            Ok(v) => Ack::ok(seq, Some(v)),
            Err(e) => Ack::err(seq, &ChatError::Internal(e.to_string())),
        },
        Err(e) => Ack::err(seq, &e),
    }
}
