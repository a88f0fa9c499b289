//! Session registry: live connections, presence edges, typing timers.
//!
//! One identity may hold several connections (multi-device); fan-out targets
//! all of them.  Everything here is process-local and in-memory; presence is
//! the only part that also touches the store, and the engine owns that write.
//!
//! Typing indicators are ephemeral.  Each `typing` signal re-arms a
//! per-(room, user) timer; when it fires without a fresh signal or an explicit
//! stop, a `typing:false` event goes out to the same recipients.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

use causerie_shared::protocol::{Ack, ServerEvent, TypingEvent};
use causerie_shared::{ConnectionId, RoomId, UserId};

/// Frame queued for one connection's write half.
#[derive(Debug, Clone)]
pub enum Outbound {
    Ack(Ack),
    Event(ServerEvent),
}

pub type OutboundSender = mpsc::UnboundedSender<Outbound>;

struct Connection {
    user_id: UserId,
    tx: OutboundSender,
}

#[derive(Default)]
struct Inner {
    connections: HashMap<ConnectionId, Connection>,
    by_user: HashMap<UserId, HashSet<ConnectionId>>,
    typing: HashMap<(RoomId, UserId), JoinHandle<()>>,
}

pub struct SessionRegistry {
    inner: RwLock<Inner>,
    typing_timeout: Duration,
}

impl SessionRegistry {
    pub fn new(typing_timeout: Duration) -> Self {
        Self { inner: RwLock::new(Inner::default()), typing_timeout }
    }

    /// Admit an authenticated connection.  Returns `true` when this is the
    /// identity's first live connection (presence goes online).
    pub async fn register(
        &self,
        conn_id: ConnectionId,
        user_id: UserId,
        tx: OutboundSender,
    ) -> bool {
        let mut inner = self.inner.write().await;
        inner.connections.insert(conn_id, Connection { user_id, tx });
        let conns = inner.by_user.entry(user_id).or_default();
        conns.insert(conn_id);
        let first = conns.len() == 1;

        tracing::debug!(conn = %conn_id, user = %user_id.short(), first, "connection registered");
        first
    }

    /// Drop a connection.  Returns the identity and whether this was its last
    /// connection (presence goes offline).
    pub async fn unregister(&self, conn_id: ConnectionId) -> Option<(UserId, bool)> {
        let mut inner = self.inner.write().await;
        let conn = inner.connections.remove(&conn_id)?;
        let user_id = conn.user_id;

        let last = match inner.by_user.get_mut(&user_id) {
            Some(conns) => {
                conns.remove(&conn_id);
                if conns.is_empty() {
                    inner.by_user.remove(&user_id);
                    true
                } else {
                    false
                }
            }
            None => true,
        };

        tracing::debug!(conn = %conn_id, user = %user_id.short(), last, "connection dropped");
        Some((user_id, last))
    }

    /// Queue an event on every live connection of one identity.  A full or
    /// closed channel is the receiver's problem; delivery is not retried.
    pub async fn send_to_user(&self, user_id: UserId, event: &ServerEvent) {
        let inner = self.inner.read().await;
        let Some(conn_ids) = inner.by_user.get(&user_id) else {
            return;
        };
        for conn_id in conn_ids {
            if let Some(conn) = inner.connections.get(conn_id) {
                if conn.tx.send(Outbound::Event(event.clone())).is_err() {
                    tracing::debug!(conn = %conn_id, "send to closed connection dropped");
                }
            }
        }
    }

    pub async fn is_online(&self, user_id: UserId) -> bool {
        self.inner.read().await.by_user.contains_key(&user_id)
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.connections.len()
    }

    pub async fn online_user_count(&self) -> usize {
        self.inner.read().await.by_user.len()
    }

    // ------------------------------------------------------------------
    // Typing
    // ------------------------------------------------------------------

    /// Re-arm the auto-clear timer for one (room, user) typing indicator.
    /// When it fires, `recipients` get a `typing:false` event.
    pub async fn arm_typing(
        self: &Arc<Self>,
        room_id: RoomId,
        user_id: UserId,
        recipients: Vec<UserId>,
    ) {
        let registry = Arc::clone(self);
        let timeout = self.typing_timeout;

        let mut inner = self.inner.write().await;
        if let Some(prior) = inner.typing.remove(&(room_id, user_id)) {
            prior.abort();
        }

        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;

            // Still armed means no stop/refresh arrived in the window.
            let still_armed = {
                let mut inner = registry.inner.write().await;
                inner.typing.remove(&(room_id, user_id)).is_some()
            };
            if still_armed {
                let event = ServerEvent::Typing(TypingEvent {
                    room_id,
                    user_id,
                    is_typing: false,
                });
                for recipient in &recipients {
                    registry.send_to_user(*recipient, &event).await;
                }
            }
        });
        inner.typing.insert((room_id, user_id), handle);
    }

    /// Disarm one typing timer.  Returns `false` when nothing was armed.
    pub async fn clear_typing(&self, room_id: RoomId, user_id: UserId) -> bool {
        let mut inner = self.inner.write().await;
        match inner.typing.remove(&(room_id, user_id)) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Disarm every typing timer for one identity, returning the rooms that
    /// had one armed so the caller can broadcast the clear.
    pub async fn take_typing_rooms(&self, user_id: UserId) -> Vec<RoomId> {
        let mut inner = self.inner.write().await;
        let keys: Vec<(RoomId, UserId)> = inner
            .typing
            .keys()
            .filter(|(_, u)| *u == user_id)
            .copied()
            .collect();

        let mut rooms = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(handle) = inner.typing.remove(&key) {
                handle.abort();
            }
            rooms.push(key.0);
        }
        rooms
    }

    /// Abort all timers.  Called on engine shutdown.
    pub async fn shutdown(&self) {
        let mut inner = self.inner.write().await;
        for (_, handle) in inner.typing.drain() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn channel() -> (OutboundSender, UnboundedReceiver<Outbound>) {
        mpsc::unbounded_channel()
    }

    #[tokio::test]
    async fn presence_edges_fire_on_first_and_last_connection() {
        let registry = SessionRegistry::new(Duration::from_secs(3));
        let user = UserId::new();
        let (tx_a, _rx_a) = channel();
        let (tx_b, _rx_b) = channel();

        let first = ConnectionId::new();
        let second = ConnectionId::new();
        assert!(registry.register(first, user, tx_a).await);
        assert!(!registry.register(second, user, tx_b).await);
        assert!(registry.is_online(user).await);

        assert_eq!(registry.unregister(first).await, Some((user, false)));
        assert_eq!(registry.unregister(second).await, Some((user, true)));
        assert!(!registry.is_online(user).await);

        // Unknown connection is a no-op.
        assert_eq!(registry.unregister(ConnectionId::new()).await, None);
    }

    #[tokio::test]
    async fn events_reach_every_connection_of_a_user() {
        let registry = SessionRegistry::new(Duration::from_secs(3));
        let user = UserId::new();
        let (tx_a, mut rx_a) = channel();
        let (tx_b, mut rx_b) = channel();
        registry.register(ConnectionId::new(), user, tx_a).await;
        registry.register(ConnectionId::new(), user, tx_b).await;

        let event = ServerEvent::RoomDeleted { room_id: RoomId::new() };
        registry.send_to_user(user, &event).await;

        assert!(matches!(rx_a.recv().await, Some(Outbound::Event(ServerEvent::RoomDeleted { .. }))));
        assert!(matches!(rx_b.recv().await, Some(Outbound::Event(ServerEvent::RoomDeleted { .. }))));
    }

    #[tokio::test]
    async fn typing_auto_clears_after_timeout() {
        let registry = Arc::new(SessionRegistry::new(Duration::from_millis(50)));
        let typist = UserId::new();
        let watcher = UserId::new();
        let (tx, mut rx) = channel();
        registry.register(ConnectionId::new(), watcher, tx).await;

        let room = RoomId::new();
        registry.arm_typing(room, typist, vec![watcher]).await;

        let frame = tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .expect("auto-clear should arrive")
            .expect("channel open");
        match frame {
            Outbound::Event(ServerEvent::Typing(ev)) => {
                assert_eq!(ev.room_id, room);
                assert_eq!(ev.user_id, typist);
                assert!(!ev.is_typing);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn explicit_stop_suppresses_auto_clear() {
        let registry = Arc::new(SessionRegistry::new(Duration::from_millis(50)));
        let typist = UserId::new();
        let watcher = UserId::new();
        let (tx, mut rx) = channel();
        registry.register(ConnectionId::new(), watcher, tx).await;

        let room = RoomId::new();
        registry.arm_typing(room, typist, vec![watcher]).await;
        assert!(registry.clear_typing(room, typist).await);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(rx.try_recv().is_err(), "no auto-clear after explicit stop");
    }

    #[tokio::test]
    async fn disconnect_collects_armed_typing_rooms() {
        let registry = Arc::new(SessionRegistry::new(Duration::from_secs(3)));
        let typist = UserId::new();
        let room_a = RoomId::new();
        let room_b = RoomId::new();
        registry.arm_typing(room_a, typist, Vec::new()).await;
        registry.arm_typing(room_b, typist, Vec::new()).await;

        let mut rooms = registry.take_typing_rooms(typist).await;
        rooms.sort_by_key(|r| r.to_string());
        let mut expected = vec![room_a, room_b];
        expected.sort_by_key(|r| r.to_string());
        assert_eq!(rooms, expected);

        assert!(!registry.clear_typing(room_a, typist).await);
    }
}
