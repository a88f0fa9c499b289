//! Scheduler/cleanup engine: deferred delivery and the expiry sweep.
//!
//! Timers are process-local and advisory; the store's conditional status
//! transitions are authoritative.  A timer firing after a cancel, a duplicate
//! fire after restart, or a cancel racing a fire all collapse to no-ops
//! because only one writer wins the `status = 'scheduled'` guard.  On start,
//! armed timers are re-derived from persisted rows, never from memory.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use causerie_shared::protocol::ServerEvent;
use causerie_shared::{ChatError, MemberRole, Message, MessageId, MessageStatus, Room, UserId};
use causerie_store::StoreError;

use crate::dispatch::FanoutDispatcher;
use crate::engine::SharedDb;
use crate::error::chat_err;

pub struct Scheduler {
    db: SharedDb,
    dispatcher: Arc<FanoutDispatcher>,
    timers: Mutex<HashMap<MessageId, JoinHandle<()>>>,
    sweep_task: Mutex<Option<JoinHandle<()>>>,
    sweep_interval: Duration,
}

impl Scheduler {
    pub fn new(db: SharedDb, dispatcher: Arc<FanoutDispatcher>, sweep_interval: Duration) -> Self {
        Self {
            db,
            dispatcher,
            timers: Mutex::new(HashMap::new()),
            sweep_task: Mutex::new(None),
            sweep_interval,
        }
    }

    /// Recover persisted schedule state and start the sweep loop.  Overdue
    /// messages fire immediately in arrival order; future ones are re-armed.
    pub async fn start(self: &Arc<Self>) -> Result<(), ChatError> {
        let pending = {
            let db = self.db.lock().await;
            db.scheduled_messages().map_err(chat_err)?
        };

        let now = Utc::now();
        let mut overdue = 0usize;
        let mut armed = 0usize;
        for (id, when) in pending {
            if when <= now {
                self.fire(id).await;
                overdue += 1;
            } else {
                self.arm(id, when).await;
                armed += 1;
            }
        }
        if overdue + armed > 0 {
            tracing::info!(overdue, armed, "schedule state recovered");
        }

        let scheduler = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(scheduler.sweep_interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                scheduler.sweep().await;
            }
        });
        *self.sweep_task.lock().await = Some(handle);
        Ok(())
    }

    /// Abort the sweep loop and every armed timer.
    pub async fn stop(&self) {
        if let Some(handle) = self.sweep_task.lock().await.take() {
            handle.abort();
        }
        let mut timers = self.timers.lock().await;
        for (_, handle) in timers.drain() {
            handle.abort();
        }
    }

    /// Arm (or re-arm) the one-shot delivery timer for a scheduled message.
    pub async fn arm(self: &Arc<Self>, id: MessageId, when: DateTime<Utc>) {
        let scheduler = Arc::clone(self);
        let delay = (when - Utc::now()).to_std().unwrap_or(Duration::ZERO);

        let mut timers = self.timers.lock().await;
        if let Some(prior) = timers.remove(&id) {
            prior.abort();
        }
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            scheduler.fire(id).await;
            scheduler.timers.lock().await.remove(&id);
        });
        timers.insert(id, handle);
        tracing::debug!(message = %id, when = %when, "delivery timer armed");
    }

    /// Deliver one scheduled message.  Never propagates errors into the
    /// timer task; the scheduling loop must survive any single failure.
    pub async fn fire(&self, id: MessageId) {
        if let Err(e) = self.try_fire(id).await {
            tracing::error!(message = %id, error = %e, "scheduled delivery failed");
        }
    }

    async fn try_fire(&self, id: MessageId) -> Result<(), ChatError> {
        let fired = {
            let db = self.db.lock().await;
            let message = match db.get_message(id) {
                Ok(m) => m,
                // Row gone (room cascade); nothing to deliver.
                Err(StoreError::NotFound) => return Ok(()),
                Err(e) => return Err(chat_err(e)),
            };
            if message.status != MessageStatus::Scheduled {
                // Cancelled, already delivered, or failed; the guard below
                // would lose anyway, skip the work.
                return Ok(());
            }

            // Re-validate at fire time: the room and the sender's membership
            // may have changed since scheduling.
            let room = match db.get_room(message.room_id) {
                Ok(room) => Some(room),
                Err(StoreError::NotFound) => None,
                Err(e) => return Err(chat_err(e)),
            };
            let still_valid = room
                .as_ref()
                .map(|r| r.role_of(message.sender_id).is_some())
                .unwrap_or(false);
            if !still_valid {
                db.mark_failed(id).map_err(chat_err)?;
                tracing::warn!(message = %id, "scheduled message failed re-validation");
                return Ok(());
            }

            if !db.promote_scheduled(id, Utc::now()).map_err(chat_err)? {
                // A cancel (or a duplicate fire) won the status race.
                return Ok(());
            }
            let snapshot = db.get_message(id).map_err(chat_err)?;
            room.map(|r| (r, snapshot))
        };

        if let Some((room, message)) = fired {
            tracing::info!(message = %message.id, room = %room.id, "scheduled message delivered");
            self.dispatcher
                .broadcast_room(&room, ServerEvent::MessageNew(message))
                .await;
        }
        Ok(())
    }

    /// Cancel a scheduled message.  No-op if it already fired: the returned
    /// snapshot simply carries the status the race settled on.
    pub async fn cancel(&self, id: MessageId, by: UserId) -> Result<Message, ChatError> {
        let message = {
            let db = self.db.lock().await;
            let message = db.get_message(id).map_err(chat_err)?;
            check_schedule_permission(&db, &message, by)?;

            if message.status == MessageStatus::Scheduled {
                db.mark_cancelled(id).map_err(chat_err)?;
            }
            db.get_message(id).map_err(chat_err)?
        };

        self.disarm(id).await;
        tracing::info!(message = %id, status = ?message.status, "scheduled message cancelled");
        Ok(message)
    }

    /// Move a scheduled delivery: cancel-then-rearm, never an in-place timer
    /// mutation, so a double fire cannot happen.
    pub async fn reschedule(
        self: &Arc<Self>,
        id: MessageId,
        by: UserId,
        when: DateTime<Utc>,
    ) -> Result<Message, ChatError> {
        if when <= Utc::now() {
            return Err(ChatError::Validation("scheduledFor must be in the future".to_string()));
        }

        let message = {
            let db = self.db.lock().await;
            let message = db.get_message(id).map_err(chat_err)?;
            check_schedule_permission(&db, &message, by)?;

            if !db.reschedule_message(id, when).map_err(chat_err)? {
                // Already fired or cancelled; rescheduling lost the race.
                return Err(ChatError::Conflict);
            }
            db.get_message(id).map_err(chat_err)?
        };

        self.disarm(id).await;
        self.arm(id, when).await;
        Ok(message)
    }

    async fn disarm(&self, id: MessageId) {
        if let Some(handle) = self.timers.lock().await.remove(&id) {
            handle.abort();
        }
    }

    /// One pass of the expiry/retention sweep.  Terminal-state writes win:
    /// the conditional updates only touch live rows, so re-running the sweep
    /// (or racing a live edit) is harmless.
    pub async fn sweep(&self) {
        if let Err(e) = self.try_sweep().await {
            tracing::error!(error = %e, "expiry sweep failed");
        }
    }

    async fn try_sweep(&self) -> Result<(), ChatError> {
        let now = Utc::now();

        let expired = {
            let db = self.db.lock().await;
            let mut pairs = db.sweep_expired(now).map_err(chat_err)?;
            for (room_id, days) in db.rooms_with_retention().map_err(chat_err)? {
                let cutoff = now - chrono::Duration::days(i64::from(days));
                pairs.extend(db.sweep_retention(room_id, cutoff, now).map_err(chat_err)?);
            }

            let mut out: Vec<(Room, Message)> = Vec::with_capacity(pairs.len());
            for (message_id, room_id) in pairs {
                let message = db.get_message(message_id).map_err(chat_err)?;
                match db.get_room(room_id) {
                    Ok(room) => out.push((room, message)),
                    // Room vanished between the sweep and the read; the
                    // delete cascade already told its members.
                    Err(StoreError::NotFound) => continue,
                    Err(e) => return Err(chat_err(e)),
                }
            }
            out
        };

        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "messages expired by sweep");
        }
        for (room, message) in expired {
            self.dispatcher
                .broadcast_room(&room, ServerEvent::MessageExpired(message))
                .await;
        }
        Ok(())
    }

    #[cfg(test)]
    async fn armed_count(&self) -> usize {
        self.timers.lock().await.len()
    }
}

/// Only the sender or a room admin touches a schedule.  When the room is
/// already gone, the sender alone may still cancel.
fn check_schedule_permission(
    db: &causerie_store::Database,
    message: &Message,
    by: UserId,
) -> Result<(), ChatError> {
    if message.sender_id == by {
        return Ok(());
    }
    match db.get_room(message.room_id) {
        Ok(room) => {
            let is_admin = room
                .role_of(by)
                .map(|r| r.rank() >= MemberRole::Admin.rank())
                .unwrap_or(false);
            if is_admin {
                Ok(())
            } else {
                Err(ChatError::PermissionDenied)
            }
        }
        Err(StoreError::NotFound) => Err(ChatError::PermissionDenied),
        Err(e) => Err(chat_err(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::sync::mpsc;

    use causerie_shared::{
        ConnectionId, MessageKind, Room, RoomId, RoomSettings,
    };
    use causerie_store::Database;

    use crate::registry::{Outbound, SessionRegistry};

    struct Harness {
        scheduler: Arc<Scheduler>,
        db: SharedDb,
        registry: Arc<SessionRegistry>,
    }

    fn harness() -> Harness {
        let db: SharedDb =
            Arc::new(tokio::sync::Mutex::new(Database::open_in_memory(&[0u8; 32]).unwrap()));
        let registry = Arc::new(SessionRegistry::new(Duration::from_secs(3)));
        let dispatcher = Arc::new(FanoutDispatcher::new(Arc::clone(&registry)));
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&db),
            dispatcher,
            Duration::from_millis(50),
        ));
        Harness { scheduler, db, registry }
    }

    async fn seed_room(h: &Harness) -> (RoomId, UserId, UserId) {
        let owner = UserId::new();
        let member = UserId::new();
        let now = Utc::now();
        let room = Room {
            id: RoomId::new(),
            name: "salle".to_string(),
            owner_id: owner,
            members: Vec::new(),
            pinned_message_ids: Vec::new(),
            settings: RoomSettings::default(),
            last_activity: now,
            created_at: now,
        };
        let mut db = h.db.lock().await;
        db.create_room(&room).unwrap();
        db.add_member(room.id, member, MemberRole::Member, now).unwrap();
        (room.id, owner, member)
    }

    async fn insert_scheduled(
        h: &Harness,
        room_id: RoomId,
        sender: UserId,
        when: DateTime<Utc>,
    ) -> MessageId {
        let message = Message {
            id: MessageId::new(),
            room_id,
            sender_id: sender,
            kind: MessageKind::Text,
            content: "rappel".to_string(),
            metadata: None,
            reply_to: None,
            reactions: Vec::new(),
            is_pinned: false,
            pinned_by: None,
            is_edited: false,
            edit_history: Vec::new(),
            is_deleted: false,
            deleted_at: None,
            created_at: Utc::now(),
            status: MessageStatus::Scheduled,
            scheduled_for: Some(when),
            expires_at: None,
        };
        h.db.lock().await.insert_message(&message).unwrap();
        message.id
    }

    async fn status_of(h: &Harness, id: MessageId) -> MessageStatus {
        h.db.lock().await.get_message(id).unwrap().status
    }

    #[tokio::test]
    async fn armed_timer_fires_and_broadcasts_once() {
        let h = harness();
        let (room, owner, member) = seed_room(&h).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        h.registry.register(ConnectionId::new(), member, tx).await;

        let when = Utc::now() + chrono::Duration::milliseconds(50);
        let id = insert_scheduled(&h, room, owner, when).await;
        h.scheduler.arm(id, when).await;

        let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("delivery should arrive")
            .unwrap();
        match frame {
            Outbound::Event(ServerEvent::MessageNew(m)) => {
                assert_eq!(m.id, id);
                assert_eq!(m.status, MessageStatus::Sent);
            }
            other => panic!("unexpected frame: {other:?}"),
        }

        // A late duplicate fire is a no-op thanks to the status guard.
        h.scheduler.fire(id).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn cancel_before_fire_never_broadcasts() {
        let h = harness();
        let (room, owner, member) = seed_room(&h).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        h.registry.register(ConnectionId::new(), member, tx).await;

        let when = Utc::now() + chrono::Duration::milliseconds(80);
        let id = insert_scheduled(&h, room, owner, when).await;
        h.scheduler.arm(id, when).await;

        let cancelled = h.scheduler.cancel(id, owner).await.unwrap();
        assert_eq!(cancelled.status, MessageStatus::Cancelled);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err(), "cancelled delivery must not broadcast");
        assert_eq!(status_of(&h, id).await, MessageStatus::Cancelled);
    }

    #[tokio::test]
    async fn cancel_after_fire_is_noop() {
        let h = harness();
        let (room, owner, _member) = seed_room(&h).await;

        let id = insert_scheduled(&h, room, owner, Utc::now()).await;
        h.scheduler.fire(id).await;
        assert_eq!(status_of(&h, id).await, MessageStatus::Sent);

        let after = h.scheduler.cancel(id, owner).await.unwrap();
        assert_eq!(after.status, MessageStatus::Sent);
    }

    #[tokio::test]
    async fn only_sender_or_admin_cancels() {
        let h = harness();
        let (room, owner, member) = seed_room(&h).await;

        let when = Utc::now() + chrono::Duration::minutes(5);
        let id = insert_scheduled(&h, room, member, when).await;

        assert!(matches!(
            h.scheduler.cancel(id, UserId::new()).await,
            Err(ChatError::PermissionDenied)
        ));
        // The room owner outranks the sender.
        let cancelled = h.scheduler.cancel(id, owner).await.unwrap();
        assert_eq!(cancelled.status, MessageStatus::Cancelled);
    }

    #[tokio::test]
    async fn fire_marks_failed_when_sender_left() {
        let h = harness();
        let (room, _owner, member) = seed_room(&h).await;

        let id = insert_scheduled(&h, room, member, Utc::now()).await;
        {
            let db = h.db.lock().await;
            db.remove_member(room, member).unwrap();
        }

        h.scheduler.fire(id).await;
        assert_eq!(status_of(&h, id).await, MessageStatus::Failed);
    }

    #[tokio::test]
    async fn reschedule_is_cancel_then_rearm() {
        let h = harness();
        let (room, owner, member) = seed_room(&h).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        h.registry.register(ConnectionId::new(), member, tx).await;

        let far = Utc::now() + chrono::Duration::minutes(10);
        let id = insert_scheduled(&h, room, owner, far).await;
        h.scheduler.arm(id, far).await;

        // Rescheduling into the past is rejected.
        assert!(matches!(
            h.scheduler
                .reschedule(id, owner, Utc::now() - chrono::Duration::seconds(1))
                .await,
            Err(ChatError::Validation(_))
        ));

        let soon = Utc::now() + chrono::Duration::milliseconds(60);
        h.scheduler.reschedule(id, owner, soon).await.unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("rescheduled delivery should arrive")
            .unwrap();
        assert!(matches!(frame, Outbound::Event(ServerEvent::MessageNew(_))));

        // Exactly one delivery.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());

        // Rescheduling a delivered message loses the guard.
        assert!(matches!(
            h.scheduler
                .reschedule(id, owner, Utc::now() + chrono::Duration::minutes(1))
                .await,
            Err(ChatError::Conflict)
        ));
    }

    #[tokio::test]
    async fn start_recovers_overdue_and_future_rows() {
        let h = harness();
        let (room, owner, member) = seed_room(&h).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        h.registry.register(ConnectionId::new(), member, tx).await;

        let overdue = insert_scheduled(
            &h,
            room,
            owner,
            Utc::now() - chrono::Duration::minutes(1),
        )
        .await;
        let future = insert_scheduled(
            &h,
            room,
            owner,
            Utc::now() + chrono::Duration::minutes(10),
        )
        .await;

        h.scheduler.start().await.unwrap();

        // The overdue row fired immediately.
        assert_eq!(status_of(&h, overdue).await, MessageStatus::Sent);
        assert!(matches!(
            rx.recv().await,
            Some(Outbound::Event(ServerEvent::MessageNew(_)))
        ));

        // The future row is armed, not fired.
        assert_eq!(status_of(&h, future).await, MessageStatus::Scheduled);
        assert_eq!(h.scheduler.armed_count().await, 1);

        h.scheduler.stop().await;
    }

    #[tokio::test]
    async fn sweep_expires_and_notifies() {
        let h = harness();
        let (room, owner, member) = seed_room(&h).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        h.registry.register(ConnectionId::new(), member, tx).await;

        let message = Message {
            id: MessageId::new(),
            room_id: room,
            sender_id: owner,
            kind: MessageKind::Text,
            content: "fugace".to_string(),
            metadata: None,
            reply_to: None,
            reactions: Vec::new(),
            is_pinned: false,
            pinned_by: None,
            is_edited: false,
            edit_history: Vec::new(),
            is_deleted: false,
            deleted_at: None,
            created_at: Utc::now(),
            status: MessageStatus::Sent,
            scheduled_for: None,
            expires_at: Some(Utc::now() - chrono::Duration::seconds(5)),
        };
        h.db.lock().await.insert_message(&message).unwrap();

        h.scheduler.sweep().await;

        match rx.recv().await.unwrap() {
            Outbound::Event(ServerEvent::MessageExpired(m)) => {
                assert_eq!(m.id, message.id);
                assert!(m.is_deleted);
            }
            other => panic!("unexpected frame: {other:?}"),
        }

        // Re-running the sweep finds nothing new.
        h.scheduler.sweep().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }
}
