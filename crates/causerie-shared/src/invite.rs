//! Invite token generation.
//!
//! Tokens are single-use capabilities stored server-side: 128 bits from the
//! OS RNG, base64url-encoded.  The store enforces single use by deleting the
//! record atomically on acceptance; this module only produces the opaque
//! string and the expiry timestamp.

use chrono::{DateTime, Duration, Utc};
use rand::RngCore;

use crate::constants::INVITE_EXPIRY_DAYS;

/// Number of random bytes per token (128 bits of entropy).
const TOKEN_BYTES: usize = 16;

/// Generate a fresh unguessable invite token.
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    base64_url_encode(&bytes)
}

/// Expiry timestamp for a token created now.
pub fn default_expiry(now: DateTime<Utc>) -> DateTime<Utc> {
    now + Duration::days(INVITE_EXPIRY_DAYS)
}

fn base64_url_encode(data: &[u8]) -> String {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    URL_SAFE_NO_PAD.encode(data)
}
