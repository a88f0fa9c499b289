//! Server configuration loaded from environment variables.
//!
//! All settings have defaults so the server can start with zero configuration
//! for local development.  The seal key defaults to all-zeros, which is fine
//! for a dev database and useless for anything else.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use causerie_shared::constants::{DEFAULT_HTTP_PORT, SWEEP_INTERVAL_SECS, TYPING_TIMEOUT_MS};
use causerie_shared::seal::SealKey;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP/WebSocket server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// Filesystem path of the SQLite database.
    /// Env: `DB_PATH`
    /// Default: `./causerie.db`
    pub db_path: PathBuf,

    /// Human-readable name for this server instance.
    /// Env: `INSTANCE_NAME`
    /// Default: `"Causerie"`
    pub instance_name: String,

    /// Key sealing message content at rest (hex-encoded, 64 chars).
    /// Env: `SEAL_KEY`
    /// Default: all-zeros (development only).
    pub seal_key: SealKey,

    /// Interval between expiry/retention sweeps.
    /// Env: `SWEEP_INTERVAL_SECS`
    /// Default: 60
    pub sweep_interval: Duration,

    /// Inactivity window after which a typing indicator auto-clears.
    /// Env: `TYPING_TIMEOUT_MS`
    /// Default: 3000
    pub typing_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            db_path: PathBuf::from("./causerie.db"),
            instance_name: "Causerie".to_string(),
            seal_key: [0u8; 32],
            sweep_interval: Duration::from_secs(SWEEP_INTERVAL_SECS),
            typing_timeout: Duration::from_millis(TYPING_TIMEOUT_MS),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "invalid HTTP_ADDR, using default");
            }
        }

        if let Ok(path) = std::env::var("DB_PATH") {
            config.db_path = PathBuf::from(path);
        }

        if let Ok(name) = std::env::var("INSTANCE_NAME") {
            config.instance_name = name;
        }

        if let Ok(hex_key) = std::env::var("SEAL_KEY") {
            match parse_seal_key(&hex_key) {
                Ok(key) => config.seal_key = key,
                Err(e) => {
                    tracing::warn!(error = %e, "invalid SEAL_KEY, using default (dev-only)");
                }
            }
        }

        if let Ok(val) = std::env::var("SWEEP_INTERVAL_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                config.sweep_interval = Duration::from_secs(secs.max(1));
            }
        }

        if let Ok(val) = std::env::var("TYPING_TIMEOUT_MS") {
            if let Ok(ms) = val.parse::<u64>() {
                config.typing_timeout = Duration::from_millis(ms.max(100));
            }
        }

        config
    }
}

/// Parse a 64-character hex string into a 32-byte seal key.
fn parse_seal_key(hex_str: &str) -> Result<SealKey, String> {
    let hex_str = hex_str.trim();
    if hex_str.len() != 64 {
        return Err(format!("expected 64 hex chars, got {}", hex_str.len()));
    }

    let bytes = hex::decode(hex_str).map_err(|e| format!("invalid hex: {e}"))?;
    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.http_addr, ([0, 0, 0, 0], 8080).into());
        assert_eq!(config.seal_key, [0u8; 32]);
        assert_eq!(config.sweep_interval, Duration::from_secs(60));
        assert_eq!(config.typing_timeout, Duration::from_millis(3000));
    }

    #[test]
    fn parse_seal_key_round_trip() {
        let hex_key = "cd".repeat(32);
        let key = parse_seal_key(&hex_key).unwrap();
        assert_eq!(key, [0xcd; 32]);
    }

    #[test]
    fn parse_seal_key_wrong_length() {
        assert!(parse_seal_key("abcd").is_err());
    }
}
