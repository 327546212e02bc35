//! v001 -- Initial schema creation.
//!
//! Creates `identity`, `avatars`, `contacts`, `messages` and `files`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Local identity (single row)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS identity (
    id          INTEGER PRIMARY KEY CHECK (id = 1),
    secret_key  TEXT NOT NULL,               -- hex-encoded 32-byte Ed25519 seed
    name        TEXT NOT NULL,
    avatar      BLOB,
    created_at  TEXT NOT NULL                -- RFC-3339
);

-- ----------------------------------------------------------------
-- Avatars
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS avatars (
    id          TEXT PRIMARY KEY NOT NULL,   -- UUID v4
    data        BLOB NOT NULL,
    created_at  TEXT NOT NULL
);

-- ----------------------------------------------------------------
-- Contacts
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS contacts (
    id          TEXT PRIMARY KEY NOT NULL,   -- UUID v4
    name        TEXT NOT NULL,
    public_key  TEXT NOT NULL UNIQUE,        -- hex-encoded 32-byte Ed25519 key
    verified    INTEGER NOT NULL DEFAULT 0,
    seen        INTEGER NOT NULL DEFAULT 1,
    avatar_id   TEXT,
    created_at  TEXT NOT NULL,

    FOREIGN KEY (avatar_id) REFERENCES avatars(id) ON DELETE SET NULL
);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    contact_id  TEXT NOT NULL,
    outgoing    INTEGER NOT NULL,
    kind        TEXT NOT NULL,               -- 'text' | 'file'
    body        TEXT NOT NULL,               -- text, or the file name
    file_id     TEXT,
    timestamp   TEXT NOT NULL,

    FOREIGN KEY (contact_id) REFERENCES contacts(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_messages_contact_ts
    ON messages(contact_id, timestamp DESC);

-- ----------------------------------------------------------------
-- Files received or sent as single records
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS files (
    id          TEXT PRIMARY KEY NOT NULL,   -- UUID v4
    contact_id  TEXT,                        -- NULL for non-contacts
    file_name   TEXT NOT NULL,
    file_size   INTEGER NOT NULL,
    content     BLOB NOT NULL,
    created_at  TEXT NOT NULL,

    FOREIGN KEY (contact_id) REFERENCES contacts(id) ON DELETE CASCADE
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
