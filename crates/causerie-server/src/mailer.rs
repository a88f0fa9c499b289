//! Invite delivery seam.
//!
//! The engine only decides *that* an invite email goes out; actual delivery
//! belongs to an external sender.  The default implementation logs the
//! invite so a deployment without a mail backend still works.

use causerie_shared::Invite;

/// Delivers room invites to their email recipient.
pub trait InviteMailer: Send + Sync {
    fn send_invite(&self, invite: &Invite, room_name: &str);
}

/// Logs invites instead of sending them.
pub struct LogMailer;

impl InviteMailer for LogMailer {
    fn send_invite(&self, invite: &Invite, room_name: &str) {
        tracing::info!(
            email = %invite.email,
            room = %invite.room_id,
            room_name = %room_name,
            expires_at = %invite.expires_at,
            "invite issued (no mail backend configured)"
        );
    }
}
