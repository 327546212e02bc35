//! v002 -- Content hashes for files and avatars.
//!
//! Files are checked against their BLAKE3 hash when loaded; identical avatars
//! share one row.

use rusqlite::Connection;

const UP_SQL: &str = r#"
ALTER TABLE files ADD COLUMN blake3_hash TEXT NOT NULL DEFAULT '';
ALTER TABLE avatars ADD COLUMN blake3_hash TEXT NOT NULL DEFAULT '';

CREATE INDEX IF NOT EXISTS idx_files_contact ON files(contact_id);
CREATE INDEX IF NOT EXISTS idx_avatars_hash ON avatars(blake3_hash);
"#;

/// Apply the v002 migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
