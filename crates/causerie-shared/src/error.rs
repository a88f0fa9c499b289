use thiserror::Error;

/// Typed failures returned to clients as acknowledgments.
///
/// Every variant is recovered at the operation boundary and relayed as a
/// `{success: false, error, code}` ack; none of them crash the process.  The
/// room/message state is left unmodified whenever one of these is returned.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChatError {
    #[error("not found")]
    NotFound,

    #[error("permission denied")]
    PermissionDenied,

    #[error("not a member of this room")]
    NotMember,

    #[error("room is full")]
    RoomFull,

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invite has expired")]
    Expired,

    #[error("invalid invite token")]
    InvalidToken,

    #[error("invites are disabled for this room")]
    InvitesDisabled,

    #[error("no unused one-time pre-keys for this identity")]
    NoUnusedPreKeys,

    #[error("conflicting concurrent update")]
    Conflict,

    #[error("authentication required")]
    Auth,

    #[error("internal error: {0}")]
    Internal(String),
}

impl ChatError {
    /// Stable machine-readable code carried on the wire alongside the
    /// human-readable message.
    pub fn code(&self) -> &'static str {
        match self {
            ChatError::NotFound => "not_found",
            ChatError::PermissionDenied => "permission_denied",
            ChatError::NotMember => "not_member",
            ChatError::RoomFull => "room_full",
            ChatError::Validation(_) => "validation_error",
            ChatError::Expired => "expired",
            ChatError::InvalidToken => "invalid_token",
            ChatError::InvitesDisabled => "invites_disabled",
            ChatError::NoUnusedPreKeys => "no_unused_prekeys",
            ChatError::Conflict => "conflict",
            ChatError::Auth => "auth_required",
            ChatError::Internal(_) => "internal",
        }
    }
}
