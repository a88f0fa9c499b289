/// Protocol version string reported by `/info`.
pub const PROTOCOL_VERSION: &str = "/causerie/1.0.0";

/// Application name
pub const APP_NAME: &str = "Causerie";

/// XChaCha20-Poly1305 nonce size in bytes
pub const NONCE_SIZE: usize = 24;

/// Symmetric sealing key size in bytes
pub const SEAL_KEY_SIZE: usize = 32;

/// Maximum text/gif content length in characters
pub const MAX_CONTENT_CHARS: usize = 4096;

/// Maximum reaction emoji length in characters
pub const MAX_EMOJI_CHARS: usize = 32;

/// Maximum serialized metadata size in bytes (16 KiB)
pub const MAX_METADATA_BYTES: usize = 16_384;

/// Invite token lifetime in days
pub const INVITE_EXPIRY_DAYS: i64 = 7;

/// Typing indicator auto-clear timeout in milliseconds
pub const TYPING_TIMEOUT_MS: u64 = 3_000;

/// Expiry sweep interval in seconds
pub const SWEEP_INTERVAL_SECS: u64 = 60;

/// Unused one-time pre-key count below which a replenish is requested
pub const PREKEY_LOW_WATER_MARK: u32 = 10;

/// Default HTTP/WebSocket port
pub const DEFAULT_HTTP_PORT: u16 = 8080;
