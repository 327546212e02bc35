//! [`Storage`] implementation used by the node manager.

use uuid::Uuid;

use murmur_net::{Storage, StorageError};
use murmur_shared::types::{ChatRecord, Contact, IdentityKey};

use crate::database::Database;
use crate::error::StoreError;

fn found(updated: bool, what: &'static str) -> Result<(), StorageError> {
    if updated {
        Ok(())
    } else {
        Err(StoreError::NotFound(what).into())
    }
}

fn optional<T>(result: crate::error::Result<T>) -> Result<Option<T>, StorageError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(StoreError::NotFound(_)) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

impl Storage for Database {
    fn load_contacts(&self) -> Result<Vec<Contact>, StorageError> {
        Ok(self.list_contacts()?)
    }

    fn add_contact(
        &mut self,
        name: &str,
        public_key: &IdentityKey,
        avatar: Option<Uuid>,
    ) -> Result<Contact, StorageError> {
        let contact = Contact {
            uuid: Uuid::new_v4(),
            name: name.to_string(),
            public_key: *public_key,
            verified: false,
            seen: true,
            avatar,
        };
        self.insert_contact(&contact)?;
        Ok(contact)
    }

    fn remove_contact(&mut self, contact: Uuid) -> Result<(), StorageError> {
        found(self.delete_contact(contact)?, "contact")
    }

    fn set_verified(&mut self, contact: Uuid) -> Result<(), StorageError> {
        found(self.mark_contact_verified(contact)?, "contact")
    }

    fn set_contact_seen(&mut self, contact: Uuid, seen: bool) -> Result<(), StorageError> {
        found(self.update_contact_seen(contact, seen)?, "contact")
    }

    fn set_contact_name(&mut self, contact: Uuid, name: &str) -> Result<(), StorageError> {
        found(self.rename_contact(contact, name)?, "contact")
    }

    fn set_contact_avatar(
        &mut self,
        contact: Uuid,
        avatar: Option<Uuid>,
    ) -> Result<(), StorageError> {
        found(self.update_contact_avatar(contact, avatar)?, "contact")
    }

    fn store_message(&mut self, contact: Uuid, record: &ChatRecord) -> Result<(), StorageError> {
        Ok(self.insert_message(contact, record)?)
    }

    fn load_messages(
        &self,
        contact: Uuid,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<ChatRecord>, StorageError> {
        let limit = u32::try_from(limit).unwrap_or(u32::MAX);
        let offset = u32::try_from(offset).unwrap_or(u32::MAX);
        Ok(self.get_messages_for_contact(contact, limit, offset)?)
    }

    fn delete_conversation(&mut self, contact: Uuid) -> Result<(), StorageError> {
        let files = self.delete_files_for_contact(contact)?;
        let removed = self.delete_messages_for_contact(contact)?;
        tracing::debug!(contact = %contact, removed, files, "deleted conversation");
        Ok(())
    }

    fn store_file(
        &mut self,
        contact: Option<Uuid>,
        name: &str,
        content: &[u8],
    ) -> Result<Uuid, StorageError> {
        Ok(self.insert_file(contact, name, content)?)
    }

    fn assign_file(&mut self, file_id: Uuid, contact: Uuid) -> Result<(), StorageError> {
        found(self.set_file_owner(file_id, contact)?, "file")
    }

    fn load_file(&self, file_id: Uuid) -> Result<Option<(String, Vec<u8>)>, StorageError> {
        Ok(optional(self.get_file(file_id))?.map(|f| (f.file_name, f.content)))
    }

    fn store_avatar(&mut self, data: &[u8]) -> Result<Uuid, StorageError> {
        Ok(self.insert_avatar(data)?)
    }

    fn load_avatar(&self, avatar: Uuid) -> Result<Option<Vec<u8>>, StorageError> {
        optional(self.get_avatar(avatar))
    }

    fn set_identity_name(&mut self, name: &str) -> Result<(), StorageError> {
        Ok(self.update_identity_name(name)?)
    }

    fn set_identity_avatar(&mut self, avatar: Option<&[u8]>) -> Result<(), StorageError> {
        Ok(self.update_identity_avatar(avatar)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use murmur_shared::types::ChatContent;

    fn open() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("test.db")).unwrap();
        (dir, db)
    }

    #[test]
    fn contact_lifecycle_through_trait() {
        let (_dir, mut db) = open();
        let storage: &mut dyn Storage = &mut db;

        let avatar = storage.store_avatar(b"face").unwrap();
        let contact = storage
            .add_contact("Ana", &IdentityKey([4; 32]), Some(avatar))
            .unwrap();
        storage.set_verified(contact.uuid).unwrap();
        storage.set_contact_name(contact.uuid, "Anna").unwrap();

        let file_id = storage
            .store_file(Some(contact.uuid), "a.txt", b"data")
            .unwrap();
        storage
            .store_message(
                contact.uuid,
                &ChatRecord::new(false, ChatContent::File { file_id, name: "a.txt".into() }),
            )
            .unwrap();

        let loaded = storage.load_contacts().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "Anna");
        assert!(loaded[0].verified);
        assert_eq!(loaded[0].avatar, Some(avatar));
        assert_eq!(storage.load_avatar(avatar).unwrap().as_deref(), Some(&b"face"[..]));
        assert_eq!(storage.load_messages(contact.uuid, 0, 10).unwrap().len(), 1);

        let stranger_file = storage.store_file(None, "b.txt", b"more").unwrap();
        storage.assign_file(stranger_file, contact.uuid).unwrap();

        storage.delete_conversation(contact.uuid).unwrap();
        assert!(storage.load_messages(contact.uuid, 0, 10).unwrap().is_empty());
        assert!(storage.load_file(file_id).unwrap().is_none());
        assert!(storage.load_file(stranger_file).unwrap().is_none());
        assert_eq!(storage.load_contacts().unwrap().len(), 1);

        storage.remove_contact(contact.uuid).unwrap();
        assert!(storage.load_contacts().unwrap().is_empty());
        assert!(storage.load_file(file_id).unwrap().is_none());
        // avatars of strangers may still point here; pruning is left to startup
        assert!(storage.load_avatar(avatar).unwrap().is_some());
        assert_eq!(
            storage.remove_contact(contact.uuid),
            Err(StorageError::NotFound("contact".into()))
        );
    }

    #[test]
    fn identity_updates_need_an_identity() {
        let (_dir, mut db) = open();
        assert!(matches!(
            db.set_identity_name("Ana"),
            Err(StorageError::NotFound(_))
        ));
    }
}
