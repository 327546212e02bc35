//! Session and contact bookkeeping.
//!
//! Maps stable session ids to live connections, contacts, queued outbound
//! messages and the volatile state kept for peers that are not contacts.
//! Owned by the manager task; never shared.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use murmur_shared::protocol::Message;
use murmur_shared::types::{ChatRecord, Contact, IdentityKey, SessionId};

/// Why a freshly authenticated connection was refused.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileError {
    #[error("Peer already has a live session ({0})")]
    Duplicate(SessionId),

    #[error("Peer is ourselves")]
    SelfConnection,
}

/// Information about a live session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub peer_key: IdentityKey,
    pub addr: SocketAddr,
    pub outgoing: bool,
    /// Unique per connection, so stale events of a replaced connection can be told apart.
    pub generation: u64,
    pub connected_at: DateTime<Utc>,
}

/// A live session plus whatever the owner needs to drive it.
pub struct LiveSession<H> {
    pub info: SessionInfo,
    pub handle: H,
}

/// State dropped for a non-contact when its session goes away.
#[derive(Debug, Default)]
pub struct Forgotten {
    pub saved: Vec<ChatRecord>,
    pub name: Option<String>,
}

/// Volatile state moved out of the registry when a peer becomes a contact.
#[derive(Debug, Default)]
pub struct Promoted {
    pub saved: Vec<ChatRecord>,
}

pub struct Registry<H> {
    sessions: HashMap<SessionId, LiveSession<H>>,
    contacts: HashMap<SessionId, Contact>,
    pending: HashMap<SessionId, VecDeque<Message>>,
    saved: HashMap<SessionId, Vec<ChatRecord>>,
    saved_names: HashMap<SessionId, String>,
    saved_avatars: HashMap<SessionId, Uuid>,
    not_seen: HashSet<SessionId>,
    next_id: u64,
}

impl<H> Registry<H> {
    pub fn new() -> Self {
        Self {
            sessions: HashMap::new(),
            contacts: HashMap::new(),
            pending: HashMap::new(),
            saved: HashMap::new(),
            saved_names: HashMap::new(),
            saved_avatars: HashMap::new(),
            not_seen: HashSet::new(),
            next_id: 0,
        }
    }

    /// Assign ids to persisted contacts, in load order.
    pub fn load_contacts(&mut self, contacts: Vec<Contact>) {
        for contact in contacts {
            let id = self.allocate_id();
            if !contact.seen {
                self.not_seen.insert(id);
            }
            self.pending.insert(id, VecDeque::new());
            self.contacts.insert(id, contact);
        }
        debug!(count = self.contacts.len(), "Loaded contacts into registry");
    }

    fn allocate_id(&mut self) -> SessionId {
        let id = SessionId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Pick the session id for a newly authenticated peer.
    ///
    /// Returns the id and whether it belongs to a contact. The session itself
    /// is registered separately with [`Registry::insert`].
    pub fn reconcile(
        &mut self,
        peer_key: &IdentityKey,
        own_key: &IdentityKey,
    ) -> Result<(SessionId, bool), ReconcileError> {
        if peer_key == own_key {
            return Err(ReconcileError::SelfConnection);
        }
        if let Some(existing) = self.session_by_key(peer_key) {
            return Err(ReconcileError::Duplicate(existing));
        }
        if let Some(id) = self.contact_by_key(peer_key) {
            return Ok((id, true));
        }
        let id = self.allocate_id();
        self.saved.insert(id, Vec::new());
        Ok((id, false))
    }

    pub fn insert(&mut self, session: LiveSession<H>) {
        self.sessions.insert(session.info.id, session);
    }

    /// Drop a live session. Volatile state of non-contacts goes with it.
    pub fn disconnect(&mut self, id: SessionId) -> Option<(LiveSession<H>, Forgotten)> {
        let session = self.sessions.remove(&id)?;
        let mut forgotten = Forgotten::default();
        if !self.contacts.contains_key(&id) {
            forgotten.saved = self.saved.remove(&id).unwrap_or_default();
            forgotten.name = self.saved_names.remove(&id);
            self.saved_avatars.remove(&id);
            self.not_seen.remove(&id);
        }
        Some((session, forgotten))
    }

    /// Turn a non-contact into a contact, handing back its saved messages for persistence.
    pub fn promote(&mut self, id: SessionId, contact: Contact) -> Promoted {
        let saved = self.saved.remove(&id).unwrap_or_default();
        self.saved_names.remove(&id);
        self.saved_avatars.remove(&id);
        self.pending.insert(id, VecDeque::new());
        self.contacts.insert(id, contact);
        Promoted { saved }
    }

    /// Turn a contact back into an anonymous peer. While it is connected its name and
    /// avatar stay in memory; an offline contact leaves nothing behind.
    pub fn demote(&mut self, id: SessionId) -> Option<Contact> {
        let contact = self.contacts.remove(&id)?;
        self.pending.remove(&id);
        if self.sessions.contains_key(&id) {
            self.saved.insert(id, Vec::new());
            self.saved_names.insert(id, contact.name.clone());
            if let Some(avatar) = contact.avatar {
                self.saved_avatars.insert(id, avatar);
            }
        } else {
            self.not_seen.remove(&id);
        }
        Some(contact)
    }

    pub fn session(&self, id: SessionId) -> Option<&LiveSession<H>> {
        self.sessions.get(&id)
    }

    pub fn session_mut(&mut self, id: SessionId) -> Option<&mut LiveSession<H>> {
        self.sessions.get_mut(&id)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &LiveSession<H>> {
        self.sessions.values()
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn drain_sessions(&mut self) -> Vec<LiveSession<H>> {
        self.sessions.drain().map(|(_, s)| s).collect()
    }

    pub fn is_online(&self, id: SessionId) -> bool {
        self.sessions.contains_key(&id)
    }

    pub fn session_by_key(&self, key: &IdentityKey) -> Option<SessionId> {
        self.sessions
            .values()
            .find(|s| &s.info.peer_key == key)
            .map(|s| s.info.id)
    }

    pub fn session_by_generation(&self, generation: u64) -> Option<SessionId> {
        self.sessions
            .values()
            .find(|s| s.info.generation == generation)
            .map(|s| s.info.id)
    }

    pub fn contact_by_key(&self, key: &IdentityKey) -> Option<SessionId> {
        self.contacts
            .iter()
            .find(|(_, c)| &c.public_key == key)
            .map(|(id, _)| *id)
    }

    pub fn contact(&self, id: SessionId) -> Option<&Contact> {
        self.contacts.get(&id)
    }

    pub fn contact_mut(&mut self, id: SessionId) -> Option<&mut Contact> {
        self.contacts.get_mut(&id)
    }

    pub fn contact_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.contacts.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn is_contact(&self, id: SessionId) -> bool {
        self.contacts.contains_key(&id)
    }

    /// Contact name, else the name the peer announced, else nothing.
    pub fn name_of(&self, id: SessionId) -> Option<String> {
        self.contacts
            .get(&id)
            .map(|c| c.name.clone())
            .or_else(|| self.saved_names.get(&id).cloned())
    }

    pub fn queue_pending(&mut self, id: SessionId, message: Message) -> bool {
        match self.pending.get_mut(&id) {
            Some(queue) => {
                queue.push_back(message);
                true
            }
            None => false,
        }
    }

    pub fn take_pending(&mut self, id: SessionId) -> VecDeque<Message> {
        self.pending
            .get_mut(&id)
            .map(std::mem::take)
            .unwrap_or_default()
    }

    pub fn pending_len(&self, id: SessionId) -> usize {
        self.pending.get(&id).map_or(0, VecDeque::len)
    }

    pub fn save_message(&mut self, id: SessionId, record: ChatRecord) {
        self.saved.entry(id).or_default().push(record);
    }

    pub fn saved_messages(&self, id: SessionId) -> &[ChatRecord] {
        self.saved.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn clear_saved(&mut self, id: SessionId) {
        if let Some(saved) = self.saved.get_mut(&id) {
            saved.clear();
        }
    }

    pub fn set_saved_name(&mut self, id: SessionId, name: String) {
        self.saved_names.insert(id, name);
    }

    pub fn set_saved_avatar(&mut self, id: SessionId, avatar: Option<Uuid>) {
        match avatar {
            Some(avatar) => self.saved_avatars.insert(id, avatar),
            None => self.saved_avatars.remove(&id),
        };
    }

    pub fn saved_avatar(&self, id: SessionId) -> Option<Uuid> {
        self.saved_avatars.get(&id).copied()
    }

    /// Returns true when the set changed.
    pub fn set_seen(&mut self, id: SessionId, seen: bool) -> bool {
        if seen {
            self.not_seen.remove(&id)
        } else {
            self.not_seen.insert(id)
        }
    }

    pub fn is_seen(&self, id: SessionId) -> bool {
        !self.not_seen.contains(&id)
    }
}

impl<H> Default for Registry<H> {
    fn default() -> Self {
        Self::new()
    }
}
