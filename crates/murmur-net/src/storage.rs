//! Persistence seam used by the node manager.
//!
//! The SQLite implementation lives in `murmur-store`; [`MemoryStorage`] keeps
//! everything in maps and backs the tests of this crate.

use std::collections::HashMap;

use uuid::Uuid;

use murmur_shared::types::{ChatRecord, Contact, IdentityKey};

use crate::error::StorageError;

pub trait Storage: Send {
    fn load_contacts(&self) -> Result<Vec<Contact>, StorageError>;

    fn add_contact(
        &mut self,
        name: &str,
        public_key: &IdentityKey,
        avatar: Option<Uuid>,
    ) -> Result<Contact, StorageError>;

    /// Remove a contact together with its conversation.
    fn remove_contact(&mut self, contact: Uuid) -> Result<(), StorageError>;

    fn set_verified(&mut self, contact: Uuid) -> Result<(), StorageError>;

    fn set_contact_seen(&mut self, contact: Uuid, seen: bool) -> Result<(), StorageError>;

    fn set_contact_name(&mut self, contact: Uuid, name: &str) -> Result<(), StorageError>;

    fn set_contact_avatar(&mut self, contact: Uuid, avatar: Option<Uuid>)
        -> Result<(), StorageError>;

    fn store_message(&mut self, contact: Uuid, record: &ChatRecord) -> Result<(), StorageError>;

    /// Most recent messages first, `limit` at most, skipping `offset`.
    fn load_messages(
        &self,
        contact: Uuid,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<ChatRecord>, StorageError>;

    fn delete_conversation(&mut self, contact: Uuid) -> Result<(), StorageError>;

    /// Store file content, optionally owned by a contact. Returns the file id.
    fn store_file(
        &mut self,
        contact: Option<Uuid>,
        name: &str,
        content: &[u8],
    ) -> Result<Uuid, StorageError>;

    /// Hand a file stored without an owner to a contact, so it outlives the session.
    fn assign_file(&mut self, file_id: Uuid, contact: Uuid) -> Result<(), StorageError>;

    fn load_file(&self, file_id: Uuid) -> Result<Option<(String, Vec<u8>)>, StorageError>;

    fn store_avatar(&mut self, data: &[u8]) -> Result<Uuid, StorageError>;

    fn load_avatar(&self, avatar: Uuid) -> Result<Option<Vec<u8>>, StorageError>;

    fn set_identity_name(&mut self, name: &str) -> Result<(), StorageError>;

    fn set_identity_avatar(&mut self, avatar: Option<&[u8]>) -> Result<(), StorageError>;
}

/// Volatile storage, everything is lost on drop.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    contacts: Vec<Contact>,
    messages: HashMap<Uuid, Vec<ChatRecord>>,
    files: HashMap<Uuid, (Option<Uuid>, String, Vec<u8>)>,
    avatars: HashMap<Uuid, Vec<u8>>,
    identity_name: Option<String>,
    identity_avatar: Option<Vec<u8>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_contacts(contacts: Vec<Contact>) -> Self {
        Self {
            contacts,
            ..Self::default()
        }
    }

    pub fn identity_name(&self) -> Option<&str> {
        self.identity_name.as_deref()
    }

    pub fn identity_avatar(&self) -> Option<&[u8]> {
        self.identity_avatar.as_deref()
    }

    fn contact_mut(&mut self, contact: Uuid) -> Result<&mut Contact, StorageError> {
        self.contacts
            .iter_mut()
            .find(|c| c.uuid == contact)
            .ok_or_else(|| StorageError::NotFound(format!("contact {contact}")))
    }
}

impl Storage for MemoryStorage {
    fn load_contacts(&self) -> Result<Vec<Contact>, StorageError> {
        Ok(self.contacts.clone())
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
        self.contacts.push(contact.clone());
        Ok(contact)
    }

    fn remove_contact(&mut self, contact: Uuid) -> Result<(), StorageError> {
        let before = self.contacts.len();
        self.contacts.retain(|c| c.uuid != contact);
        if self.contacts.len() == before {
            return Err(StorageError::NotFound(format!("contact {contact}")));
        }
        self.messages.remove(&contact);
        self.files.retain(|_, (owner, _, _)| *owner != Some(contact));
        Ok(())
    }

    fn set_verified(&mut self, contact: Uuid) -> Result<(), StorageError> {
        self.contact_mut(contact)?.verified = true;
        Ok(())
    }

    fn set_contact_seen(&mut self, contact: Uuid, seen: bool) -> Result<(), StorageError> {
        self.contact_mut(contact)?.seen = seen;
        Ok(())
    }

    fn set_contact_name(&mut self, contact: Uuid, name: &str) -> Result<(), StorageError> {
        self.contact_mut(contact)?.name = name.to_string();
        Ok(())
    }

    fn set_contact_avatar(
        &mut self,
        contact: Uuid,
        avatar: Option<Uuid>,
    ) -> Result<(), StorageError> {
        self.contact_mut(contact)?.avatar = avatar;
        Ok(())
    }

    fn store_message(&mut self, contact: Uuid, record: &ChatRecord) -> Result<(), StorageError> {
        self.contact_mut(contact)?;
        self.messages.entry(contact).or_default().push(record.clone());
        Ok(())
    }

    fn load_messages(
        &self,
        contact: Uuid,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<ChatRecord>, StorageError> {
        Ok(self
            .messages
            .get(&contact)
            .map(|msgs| msgs.iter().rev().skip(offset).take(limit).cloned().collect())
            .unwrap_or_default())
    }

    fn delete_conversation(&mut self, contact: Uuid) -> Result<(), StorageError> {
        self.messages.remove(&contact);
        self.files.retain(|_, (owner, _, _)| *owner != Some(contact));
        Ok(())
    }

    fn store_file(
        &mut self,
        contact: Option<Uuid>,
        name: &str,
        content: &[u8],
    ) -> Result<Uuid, StorageError> {
        let id = Uuid::new_v4();
        self.files
            .insert(id, (contact, name.to_string(), content.to_vec()));
        Ok(id)
    }

    fn assign_file(&mut self, file_id: Uuid, contact: Uuid) -> Result<(), StorageError> {
        match self.files.get_mut(&file_id) {
            Some((owner, _, _)) => {
                *owner = Some(contact);
                Ok(())
            }
            None => Err(StorageError::NotFound(format!("file {file_id}"))),
        }
    }

    fn load_file(&self, file_id: Uuid) -> Result<Option<(String, Vec<u8>)>, StorageError> {
        Ok(self
            .files
            .get(&file_id)
            .map(|(_, name, content)| (name.clone(), content.clone())))
    }

    fn store_avatar(&mut self, data: &[u8]) -> Result<Uuid, StorageError> {
        let id = Uuid::new_v4();
        self.avatars.insert(id, data.to_vec());
        Ok(id)
    }

    fn load_avatar(&self, avatar: Uuid) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.avatars.get(&avatar).cloned())
    }

    fn set_identity_name(&mut self, name: &str) -> Result<(), StorageError> {
        self.identity_name = Some(name.to_string());
        Ok(())
    }

    fn set_identity_avatar(&mut self, avatar: Option<&[u8]>) -> Result<(), StorageError> {
        self.identity_avatar = avatar.map(<[u8]>::to_vec);
        Ok(())
    }
}
