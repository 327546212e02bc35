use chrono::Utc;
use rusqlite::params;
use uuid::Uuid;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{parse_timestamp, parse_uuid, StoredFile};

impl Database {
    pub fn insert_file(&self, contact_id: Option<Uuid>, file_name: &str, content: &[u8]) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let hash = blake3::hash(content).to_hex().to_string();
        self.conn().execute(
            "INSERT INTO files (id, contact_id, file_name, file_size, content, created_at, blake3_hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id.to_string(),
                contact_id.map(|c| c.to_string()),
                file_name,
                content.len() as i64,
                content,
                Utc::now().to_rfc3339(),
                hash,
            ],
        )?;
        tracing::debug!(file = %id, name = %file_name, size = content.len(), "stored file");
        Ok(id)
    }

    /// Load a file and check its content hash.
    pub fn get_file(&self, id: Uuid) -> Result<StoredFile> {
        let file = self
            .conn()
            .query_row(
                "SELECT id, contact_id, file_name, file_size, blake3_hash, content, created_at
                 FROM files
                 WHERE id = ?1",
                params![id.to_string()],
                row_to_file,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound("file"),
                other => StoreError::Sqlite(other),
            })?;

        // rows written before v002 carry no hash
        if !file.blake3_hash.is_empty()
            && blake3::hash(&file.content).to_hex().as_str() != file.blake3_hash
        {
            return Err(StoreError::Corrupt(id));
        }
        Ok(file)
    }

    pub fn delete_file(&self, id: Uuid) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM files WHERE id = ?1", params![id.to_string()])?;
        Ok(affected > 0)
    }

    pub fn set_file_owner(&self, id: Uuid, contact_id: Uuid) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE files SET contact_id = ?2 WHERE id = ?1",
            params![id.to_string(), contact_id.to_string()],
        )?;
        Ok(affected > 0)
    }

    /// Delete every file owned by `contact_id`, returning how many went.
    pub fn delete_files_for_contact(&self, contact_id: Uuid) -> Result<usize> {
        let affected = self.conn().execute(
            "DELETE FROM files WHERE contact_id = ?1",
            params![contact_id.to_string()],
        )?;
        Ok(affected)
    }

    /// Drop files received from peers that never became contacts.
    ///
    /// Those rows are only reachable during the session that stored them, so
    /// this runs once at startup.
    pub fn clear_temporary_files(&self) -> Result<usize> {
        let affected = self
            .conn()
            .execute("DELETE FROM files WHERE contact_id IS NULL", [])?;
        if affected > 0 {
            tracing::info!(removed = affected, "cleared files of non-contacts");
        }
        Ok(affected)
    }
}

fn row_to_file(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredFile> {
    let id_str: String = row.get(0)?;
    let contact_str: Option<String> = row.get(1)?;
    let file_name: String = row.get(2)?;
    let file_size: i64 = row.get(3)?;
    let blake3_hash: String = row.get(4)?;
    let content: Vec<u8> = row.get(5)?;
    let created_str: String = row.get(6)?;

    let contact_id = match contact_str {
        Some(s) => Some(parse_uuid(1, &s)?),
        None => None,
    };

    Ok(StoredFile {
        id: parse_uuid(0, &id_str)?,
        contact_id,
        file_name,
        file_size,
        blake3_hash,
        content,
        created_at: parse_timestamp(6, &created_str)?,
    })
}
