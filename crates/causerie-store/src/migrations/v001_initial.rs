//! v001 -- Initial schema creation.
//!
//! Creates the core tables: `users`, `rooms`, `room_members`, `invites`,
//! `messages`, `message_edits`, `reactions`, `prekey_bundles`, and
//! `one_time_prekeys`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Users
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS users (
    id           TEXT PRIMARY KEY NOT NULL,   -- UUID v4
    display_name TEXT NOT NULL,
    presence     TEXT NOT NULL DEFAULT 'offline',
    last_seen    TEXT,                        -- ISO-8601 / RFC-3339
    created_at   TEXT NOT NULL
);

-- ----------------------------------------------------------------
-- Rooms
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS rooms (
    id                     TEXT PRIMARY KEY NOT NULL,  -- UUID v4
    name                   TEXT NOT NULL,
    owner_id               TEXT NOT NULL,
    allow_invites          INTEGER NOT NULL DEFAULT 1, -- boolean 0/1
    member_limit           INTEGER NOT NULL DEFAULT 0, -- 0 = unlimited
    message_retention_days INTEGER NOT NULL DEFAULT 0, -- 0 = keep forever
    allow_reactions        INTEGER NOT NULL DEFAULT 1,
    allow_pinning          INTEGER NOT NULL DEFAULT 1,
    allow_voice            INTEGER NOT NULL DEFAULT 1,
    allow_files            INTEGER NOT NULL DEFAULT 1,
    last_activity          TEXT NOT NULL,
    created_at             TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS room_members (
    room_id   TEXT NOT NULL,
    user_id   TEXT NOT NULL,
    role      TEXT NOT NULL,                 -- owner | admin | member
    joined_at TEXT NOT NULL,

    PRIMARY KEY (room_id, user_id),
    FOREIGN KEY (room_id) REFERENCES rooms(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_room_members_user ON room_members(user_id);

CREATE TABLE IF NOT EXISTS invites (
    token      TEXT PRIMARY KEY NOT NULL,    -- base64url, 128-bit entropy
    room_id    TEXT NOT NULL,
    email      TEXT NOT NULL,
    invited_by TEXT NOT NULL,
    role       TEXT NOT NULL,
    expires_at TEXT NOT NULL,
    created_at TEXT NOT NULL,

    FOREIGN KEY (room_id) REFERENCES rooms(id) ON DELETE CASCADE
);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id            TEXT PRIMARY KEY NOT NULL, -- UUID v4
    room_id       TEXT NOT NULL,
    sender_id     TEXT NOT NULL,
    kind          TEXT NOT NULL,             -- text | gif | voice | file
    content       BLOB NOT NULL,             -- sealed at rest
    metadata      TEXT,                      -- JSON
    reply_to      TEXT,
    is_pinned     INTEGER NOT NULL DEFAULT 0,
    pinned_by     TEXT,
    pinned_at     TEXT,
    is_edited     INTEGER NOT NULL DEFAULT 0,
    is_deleted    INTEGER NOT NULL DEFAULT 0,
    deleted_at    TEXT,
    created_at    TEXT NOT NULL,
    status        TEXT NOT NULL,             -- sent | scheduled | cancelled | failed
    scheduled_for TEXT,
    expires_at    TEXT,

    FOREIGN KEY (room_id) REFERENCES rooms(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_messages_room_ts
    ON messages(room_id, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_messages_status ON messages(status);
CREATE INDEX IF NOT EXISTS idx_messages_expires ON messages(expires_at)
    WHERE expires_at IS NOT NULL;

CREATE TABLE IF NOT EXISTS message_edits (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    message_id TEXT NOT NULL,
    content    BLOB NOT NULL,                -- superseded revision, sealed
    edited_at  TEXT NOT NULL,

    FOREIGN KEY (message_id) REFERENCES messages(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_message_edits_message ON message_edits(message_id);

CREATE TABLE IF NOT EXISTS reactions (
    message_id TEXT NOT NULL,
    user_id    TEXT NOT NULL,
    emoji      TEXT NOT NULL,
    created_at TEXT NOT NULL,

    PRIMARY KEY (message_id, user_id, emoji),
    FOREIGN KEY (message_id) REFERENCES messages(id) ON DELETE CASCADE
);

-- ----------------------------------------------------------------
-- Key bundles (end-to-end session bootstrap)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS prekey_bundles (
    user_id           TEXT PRIMARY KEY NOT NULL,
    registration_id   INTEGER NOT NULL,
    identity_key      TEXT NOT NULL,
    signed_prekey_id  INTEGER NOT NULL,
    signed_prekey     TEXT NOT NULL,
    signed_prekey_sig TEXT NOT NULL,
    updated_at        TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS one_time_prekeys (
    user_id    TEXT NOT NULL,
    key_id     INTEGER NOT NULL,
    public_key TEXT NOT NULL,
    used       INTEGER NOT NULL DEFAULT 0,   -- consumed at most once

    PRIMARY KEY (user_id, key_id),
    FOREIGN KEY (user_id) REFERENCES prekey_bundles(user_id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_prekeys_unused ON one_time_prekeys(user_id, used);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
