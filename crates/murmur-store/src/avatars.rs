use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::parse_uuid;

impl Database {
    /// Store avatar bytes, reusing the row of an identical image.
    pub fn insert_avatar(&self, data: &[u8]) -> Result<Uuid> {
        let hash = blake3::hash(data).to_hex().to_string();

        let existing = self
            .conn()
            .query_row(
                "SELECT id FROM avatars WHERE blake3_hash = ?1",
                params![hash],
                |row| parse_uuid(0, &row.get::<_, String>(0)?),
            )
            .optional()?;
        if let Some(id) = existing {
            return Ok(id);
        }

        let id = Uuid::new_v4();
        self.conn().execute(
            "INSERT INTO avatars (id, data, created_at, blake3_hash) VALUES (?1, ?2, ?3, ?4)",
            params![id.to_string(), data, Utc::now().to_rfc3339(), hash],
        )?;
        Ok(id)
    }

    pub fn get_avatar(&self, id: Uuid) -> Result<Vec<u8>> {
        self.conn()
            .query_row(
                "SELECT data FROM avatars WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound("avatar"),
                other => StoreError::Sqlite(other),
            })
    }

    /// Remove avatars no contact refers to any more.
    pub fn prune_avatars(&self) -> Result<usize> {
        let affected = self.conn().execute(
            "DELETE FROM avatars WHERE id NOT IN
                (SELECT avatar_id FROM contacts WHERE avatar_id IS NOT NULL)",
            [],
        )?;
        if affected > 0 {
            tracing::debug!(count = affected, "pruned unused avatars");
        }
        Ok(affected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_avatars_share_a_row() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("test.db")).unwrap();

        let a = db.insert_avatar(b"png bytes").unwrap();
        let b = db.insert_avatar(b"png bytes").unwrap();
        let c = db.insert_avatar(b"other").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(db.get_avatar(a).unwrap(), b"png bytes");

        assert_eq!(db.prune_avatars().unwrap(), 2);
        assert!(matches!(db.get_avatar(a), Err(StoreError::NotFound("avatar"))));
    }
}
