//! Database connection management.
//!
//! The [`Database`] struct owns a [`rusqlite::Connection`] and guarantees that
//! migrations are run before any other operation.  Message content is sealed
//! at rest (XChaCha20-Poly1305) with the key handed in at open time; the rest
//! of the schema is plain SQLite.

use std::path::{Path, PathBuf};

use rusqlite::Connection;

use causerie_shared::seal::SealKey;

use crate::error::Result;
use crate::migrations;

/// Wrapper around a [`rusqlite::Connection`].
pub struct Database {
    conn: Connection,
    seal_key: SealKey,
}

impl Database {
    /// Open (or create) a database at an explicit path.
    ///
    /// `seal_key` protects message content at rest; opening an existing
    /// database with a different key makes previously stored content
    /// unreadable.
    pub fn open_at(path: &Path, seal_key: &SealKey) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        tracing::info!(path = %path.display(), "opening database");

        let conn = Connection::open(path)?;
        Self::init(conn, seal_key)
    }

    /// Open a throwaway in-memory database.  Used by tests and by the
    /// engine's test harness.
    pub fn open_in_memory(seal_key: &SealKey) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, seal_key)
    }

    fn init(conn: Connection, seal_key: &SealKey) -> Result<Self> {
        // Recommended SQLite settings.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        // Run schema migrations.
        migrations::run_migrations(&conn)?;

        Ok(Self { conn, seal_key: *seal_key })
    }

    /// Return a reference to the underlying `rusqlite::Connection`.
    ///
    /// Callers should prefer the typed helpers, but direct access is
    /// occasionally needed for ad-hoc queries.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Return a mutable reference to the underlying connection (needed for
    /// multi-statement transactions).
    pub fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Key used to seal message content at rest.
    pub(crate) fn seal_key(&self) -> &SealKey {
        &self.seal_key
    }

    /// Return the filesystem path of the open database (if any).
    pub fn path(&self) -> Option<PathBuf> {
        self.conn.path().map(PathBuf::from)
    }
}
