use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use murmur_shared::identity::Identity;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{parse_key, parse_timestamp, IdentityRecord};

impl Database {
    pub fn load_identity(&self) -> Result<Option<IdentityRecord>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT secret_key, name, avatar, created_at FROM identity WHERE id = 1",
                [],
                row_to_identity,
            )
            .optional()?)
    }

    /// Persist a freshly generated identity. Fails if one already exists.
    pub fn create_identity(&self, identity: &Identity, name: &str) -> Result<IdentityRecord> {
        let record = IdentityRecord {
            secret_key: *identity.secret_bytes(),
            name: name.to_string(),
            avatar: None,
            created_at: Utc::now(),
        };
        self.conn().execute(
            "INSERT INTO identity (id, secret_key, name, avatar, created_at)
             VALUES (1, ?1, ?2, NULL, ?3)",
            params![
                hex::encode(record.secret_key),
                record.name,
                record.created_at.to_rfc3339(),
            ],
        )?;
        tracing::info!(key = %identity.key().short(), "created local identity");
        Ok(record)
    }

    pub fn update_identity_name(&self, name: &str) -> Result<()> {
        let affected = self
            .conn()
            .execute("UPDATE identity SET name = ?1 WHERE id = 1", params![name])?;
        if affected == 0 {
            return Err(StoreError::NotFound("identity"));
        }
        Ok(())
    }

    pub fn update_identity_avatar(&self, avatar: Option<&[u8]>) -> Result<()> {
        let affected = self
            .conn()
            .execute("UPDATE identity SET avatar = ?1 WHERE id = 1", params![avatar])?;
        if affected == 0 {
            return Err(StoreError::NotFound("identity"));
        }
        Ok(())
    }
}

impl IdentityRecord {
    pub fn identity(&self) -> Identity {
        Identity::from_secret_bytes(&self.secret_key)
    }
}

fn row_to_identity(row: &rusqlite::Row<'_>) -> rusqlite::Result<IdentityRecord> {
    let key_hex: String = row.get(0)?;
    let name: String = row.get(1)?;
    let avatar: Option<Vec<u8>> = row.get(2)?;
    let created_str: String = row.get(3)?;

    Ok(IdentityRecord {
        secret_key: parse_key(0, &key_hex)?,
        name,
        avatar,
        created_at: parse_timestamp(3, &created_str)?,
    })
}
