//! SQLite connection setup.
//!
//! Every constructor runs the migrations before returning, so the rest of
//! the crate can assume the current schema.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use rusqlite::Connection;

use crate::error::{Result, StoreError};
use crate::migrations;

pub struct Database {
    conn: Connection,
}

impl Database {
    /// `murmur.db` inside the platform data directory, e.g.
    /// `~/.local/share/murmur/murmur.db` on Linux.
    pub fn default_path() -> Result<PathBuf> {
        let dirs = ProjectDirs::from("net", "murmur", "murmur").ok_or(StoreError::NoDataDir)?;
        Ok(dirs.data_dir().join("murmur.db"))
    }

    /// Open or create a plain database at `path`.
    pub fn open_at(path: &Path) -> Result<Self> {
        Self::prepare(Self::connect(path)?)
    }

    /// Open or create an SQLCipher database keyed with the raw 32-byte `db_key`.
    #[cfg(feature = "sqlcipher")]
    pub fn open_encrypted(path: &Path, db_key: &[u8; 32]) -> Result<Self> {
        let conn = Self::connect(path)?;
        conn.pragma_update(None, "key", format!("x'{}'", hex::encode(db_key)))?;
        Self::prepare(conn)
    }

    fn connect(path: &Path) -> Result<Connection> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        tracing::info!(path = %path.display(), "opening database");
        Ok(Connection::open(path)?)
    }

    fn prepare(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations::run_migrations(&conn)?;
        Ok(Self { conn })
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.conn.path().map(PathBuf::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("test.db");

        let db = Database::open_at(&path).expect("should open");
        assert!(db.path().is_some());
        assert!(path.exists());
    }

    #[test]
    fn reopen_keeps_schema_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        drop(Database::open_at(&path).unwrap());

        let db = Database::open_at(&path).unwrap();
        let version: u32 = db
            .conn()
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap();
        assert_eq!(version, migrations::CURRENT_VERSION);
    }
}
