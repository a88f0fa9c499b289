//! Fan-out dispatcher: routes one state change to every live session that
//! should see it.
//!
//! Recipient sets come from the room snapshot the mutating operation already
//! holds, so a broadcast always reflects the membership at commit time.  A
//! failed enqueue is logged and dropped; the store transition is the source
//! of truth and late joiners see the new state on their next read.

use std::sync::Arc;

use causerie_shared::protocol::ServerEvent;
use causerie_shared::{Room, UserId};

use crate::registry::SessionRegistry;

pub struct FanoutDispatcher {
    registry: Arc<SessionRegistry>,
}

impl FanoutDispatcher {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Broadcast to every member of a room snapshot.
    pub async fn broadcast_room(&self, room: &Room, event: ServerEvent) {
        tracing::trace!(room = %room.id, members = room.members.len(), "fan-out");
        for member in &room.members {
            self.registry.send_to_user(member.user_id, &event).await;
        }
    }

    /// Broadcast to an explicit recipient list (room already gone, or the
    /// recipients are not a room's membership).
    pub async fn broadcast_users(&self, users: &[UserId], event: ServerEvent) {
        for user in users {
            self.registry.send_to_user(*user, &event).await;
        }
    }

    /// Deliver to a single identity (all of its connections).
    pub async fn send_to_user(&self, user: UserId, event: ServerEvent) {
        self.registry.send_to_user(user, &event).await;
    }
}
