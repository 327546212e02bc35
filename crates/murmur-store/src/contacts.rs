use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use murmur_shared::types::{Contact, IdentityKey};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{parse_key, parse_uuid};

const CONTACT_COLUMNS: &str = "id, name, public_key, verified, seen, avatar_id";

impl Database {
    pub fn insert_contact(&self, contact: &Contact) -> Result<()> {
        self.conn().execute(
            "INSERT INTO contacts (id, name, public_key, verified, seen, avatar_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                contact.uuid.to_string(),
                contact.name,
                contact.public_key.to_hex(),
                contact.verified as i32,
                contact.seen as i32,
                contact.avatar.map(|a| a.to_string()),
                chrono::Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// All contacts in insertion order, which is also the order of their session ids.
    pub fn list_contacts(&self) -> Result<Vec<Contact>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {CONTACT_COLUMNS} FROM contacts ORDER BY rowid ASC"
        ))?;
        let rows = stmt.query_map([], row_to_contact)?;

        let mut contacts = Vec::new();
        for row in rows {
            contacts.push(row?);
        }
        Ok(contacts)
    }

    pub fn get_contact(&self, id: Uuid) -> Result<Contact> {
        self.conn()
            .query_row(
                &format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE id = ?1"),
                params![id.to_string()],
                row_to_contact,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound("contact"),
                other => StoreError::Sqlite(other),
            })
    }

    pub fn find_contact_by_key(&self, key: &IdentityKey) -> Result<Option<Contact>> {
        Ok(self
            .conn()
            .query_row(
                &format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE public_key = ?1"),
                params![key.to_hex()],
                row_to_contact,
            )
            .optional()?)
    }

    // messages and files go with it through ON DELETE CASCADE
    pub fn delete_contact(&self, id: Uuid) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM contacts WHERE id = ?1", params![id.to_string()])?;
        Ok(affected > 0)
    }

    pub fn rename_contact(&self, id: Uuid, name: &str) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE contacts SET name = ?2 WHERE id = ?1",
            params![id.to_string(), name],
        )?;
        Ok(affected > 0)
    }

    pub fn mark_contact_verified(&self, id: Uuid) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE contacts SET verified = 1 WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(affected > 0)
    }

    pub fn update_contact_seen(&self, id: Uuid, seen: bool) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE contacts SET seen = ?2 WHERE id = ?1",
            params![id.to_string(), seen as i32],
        )?;
        Ok(affected > 0)
    }

    pub fn update_contact_avatar(&self, id: Uuid, avatar: Option<Uuid>) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE contacts SET avatar_id = ?2 WHERE id = ?1",
            params![id.to_string(), avatar.map(|a| a.to_string())],
        )?;
        Ok(affected > 0)
    }
}

fn row_to_contact(row: &rusqlite::Row<'_>) -> rusqlite::Result<Contact> {
    let id_str: String = row.get(0)?;
    let name: String = row.get(1)?;
    let key_hex: String = row.get(2)?;
    let verified: i32 = row.get(3)?;
    let seen: i32 = row.get(4)?;
    let avatar_str: Option<String> = row.get(5)?;

    let avatar = match avatar_str {
        Some(s) => Some(parse_uuid(5, &s)?),
        None => None,
    };

    Ok(Contact {
        uuid: parse_uuid(0, &id_str)?,
        name,
        public_key: IdentityKey(parse_key(2, &key_hex)?),
        verified: verified != 0,
        seen: seen != 0,
        avatar,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("test.db")).unwrap();
        (dir, db)
    }

    fn contact(byte: u8, name: &str) -> Contact {
        Contact {
            uuid: Uuid::new_v4(),
            name: name.into(),
            public_key: IdentityKey([byte; 32]),
            verified: false,
            seen: true,
            avatar: None,
        }
    }

    #[test]
    fn insert_and_list_in_order() {
        let (_dir, db) = open();
        let a = contact(1, "Ana");
        let b = contact(2, "Ben");
        db.insert_contact(&a).unwrap();
        db.insert_contact(&b).unwrap();

        assert_eq!(db.list_contacts().unwrap(), vec![a.clone(), b]);
        assert_eq!(db.get_contact(a.uuid).unwrap(), a);
        assert_eq!(
            db.find_contact_by_key(&IdentityKey([1; 32])).unwrap(),
            Some(a)
        );
        assert!(db.find_contact_by_key(&IdentityKey([9; 32])).unwrap().is_none());
    }

    #[test]
    fn duplicate_key_is_rejected() {
        let (_dir, db) = open();
        db.insert_contact(&contact(1, "Ana")).unwrap();
        assert!(db.insert_contact(&contact(1, "Impostor")).is_err());
    }

    #[test]
    fn updates_and_delete() {
        let (_dir, db) = open();
        let a = contact(3, "Ana");
        db.insert_contact(&a).unwrap();

        assert!(db.rename_contact(a.uuid, "Anna").unwrap());
        assert!(db.mark_contact_verified(a.uuid).unwrap());
        assert!(db.update_contact_seen(a.uuid, false).unwrap());

        let stored = db.get_contact(a.uuid).unwrap();
        assert_eq!(stored.name, "Anna");
        assert!(stored.verified);
        assert!(!stored.seen);

        assert!(db.delete_contact(a.uuid).unwrap());
        assert!(!db.delete_contact(a.uuid).unwrap());
        assert!(matches!(
            db.get_contact(a.uuid),
            Err(StoreError::NotFound("contact"))
        ));
    }
}
