//! Node orchestration with the tokio mpsc command/event pattern.
//!
//! One manager task owns the listener, the session registry, every send
//! cipher, the transfer state machines and the storage handle. Application
//! code talks to it through [`NodeHandle`] and listens on the [`NodeEvent`]
//! channel. Handshakes and per-session IO run in their own tasks and report
//! back over internal channels.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use murmur_shared::identity::Identity;
use murmur_shared::protocol::{sanitize_name, FileInfo, Message};
use murmur_shared::types::{ChatContent, ChatRecord, IdentityKey, SessionId};

use crate::config::NodeConfig;
use crate::error::{NetError, TransferError};
use crate::events::{AskPath, NodeEvent, SessionSummary, TransferDirection};
use crate::record::padded_len;
use crate::registry::{LiveSession, Registry, SessionInfo};
use crate::session::{establish, EstablishedSession, SessionEvent, SessionHandle};
use crate::storage::Storage;
use crate::transfer::{display_name, FileProgress, FilesReceiver, FilesSender, Step};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// Command types
// ---------------------------------------------------------------------------

/// Commands sent *into* the node task.
#[derive(Debug)]
pub enum NodeCommand {
    /// Dial a peer.
    Connect(SocketAddr),
    SendText {
        session_id: SessionId,
        text: String,
    },
    /// Small batches go out as FILE records, larger ones as a chunked transfer.
    SendFiles {
        session_id: SessionId,
        paths: Vec<PathBuf>,
    },
    CancelTransfer {
        session_id: SessionId,
    },
    /// Answer an `AskLargeFiles` event.
    RespondLargeFiles {
        session_id: SessionId,
        accept: bool,
    },
    ChangeName(String),
    ChangeAvatar(Option<Vec<u8>>),
    SetAsContact {
        session_id: SessionId,
        name: String,
    },
    SetVerified {
        session_id: SessionId,
    },
    RemoveContact {
        session_id: SessionId,
    },
    DeleteConversation {
        session_id: SessionId,
    },
    SetForeground(bool),
    SetFocus(Option<SessionId>),
    MarkSeen {
        session_id: SessionId,
    },
    /// Request a snapshot of contacts and live sessions.
    ListSessions(oneshot::Sender<Vec<SessionSummary>>),
    /// A page of a conversation, most recent first.
    LoadHistory {
        session_id: SessionId,
        offset: usize,
        limit: usize,
        reply: oneshot::Sender<Vec<ChatRecord>>,
    },
    /// Name and content of a received small file.
    OpenFile {
        file_id: uuid::Uuid,
        reply: oneshot::Sender<Option<(String, Vec<u8>)>>,
    },
    PeerAvatar {
        session_id: SessionId,
        reply: oneshot::Sender<Option<Vec<u8>>>,
    },
    /// Close every session and stop the node.
    Logout,
}

/// What we tell peers about ourselves.
#[derive(Debug, Clone, Default)]
pub struct LocalProfile {
    pub name: String,
    pub avatar: Option<Vec<u8>>,
}

/// Cheap, cloneable handle to a running node.
#[derive(Debug, Clone)]
pub struct NodeHandle {
    commands: mpsc::Sender<NodeCommand>,
    port: u16,
}

impl NodeHandle {
    async fn send(&self, command: NodeCommand) -> Result<(), NetError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| NetError::NodeStopped)
    }

    /// Dial `ip` on the configured port.
    pub async fn connect(&self, ip: IpAddr) -> Result<(), NetError> {
        self.send(NodeCommand::Connect(SocketAddr::new(ip, self.port)))
            .await
    }

    pub async fn connect_addr(&self, addr: SocketAddr) -> Result<(), NetError> {
        self.send(NodeCommand::Connect(addr)).await
    }

    pub async fn send_text(&self, session_id: SessionId, text: String) -> Result<(), NetError> {
        self.send(NodeCommand::SendText { session_id, text }).await
    }

    pub async fn send_files(
        &self,
        session_id: SessionId,
        paths: Vec<PathBuf>,
    ) -> Result<(), NetError> {
        self.send(NodeCommand::SendFiles { session_id, paths })
            .await
    }

    pub async fn cancel_transfer(&self, session_id: SessionId) -> Result<(), NetError> {
        self.send(NodeCommand::CancelTransfer { session_id }).await
    }

    pub async fn respond_large_files(
        &self,
        session_id: SessionId,
        accept: bool,
    ) -> Result<(), NetError> {
        self.send(NodeCommand::RespondLargeFiles { session_id, accept })
            .await
    }

    pub async fn change_name(&self, name: String) -> Result<(), NetError> {
        self.send(NodeCommand::ChangeName(name)).await
    }

    pub async fn change_avatar(&self, avatar: Option<Vec<u8>>) -> Result<(), NetError> {
        self.send(NodeCommand::ChangeAvatar(avatar)).await
    }

    pub async fn set_as_contact(&self, session_id: SessionId, name: String) -> Result<(), NetError> {
        self.send(NodeCommand::SetAsContact { session_id, name })
            .await
    }

    pub async fn set_verified(&self, session_id: SessionId) -> Result<(), NetError> {
        self.send(NodeCommand::SetVerified { session_id }).await
    }

    pub async fn remove_contact(&self, session_id: SessionId) -> Result<(), NetError> {
        self.send(NodeCommand::RemoveContact { session_id }).await
    }

    pub async fn delete_conversation(&self, session_id: SessionId) -> Result<(), NetError> {
        self.send(NodeCommand::DeleteConversation { session_id })
            .await
    }

    pub async fn set_foreground(&self, foreground: bool) -> Result<(), NetError> {
        self.send(NodeCommand::SetForeground(foreground)).await
    }

    pub async fn set_focus(&self, session_id: Option<SessionId>) -> Result<(), NetError> {
        self.send(NodeCommand::SetFocus(session_id)).await
    }

    pub async fn mark_seen(&self, session_id: SessionId) -> Result<(), NetError> {
        self.send(NodeCommand::MarkSeen { session_id }).await
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionSummary>, NetError> {
        let (tx, rx) = oneshot::channel();
        self.send(NodeCommand::ListSessions(tx)).await?;
        rx.await.map_err(|_| NetError::NodeStopped)
    }

    pub async fn load_history(
        &self,
        session_id: SessionId,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<ChatRecord>, NetError> {
        let (reply, rx) = oneshot::channel();
        self.send(NodeCommand::LoadHistory {
            session_id,
            offset,
            limit,
            reply,
        })
        .await?;
        rx.await.map_err(|_| NetError::NodeStopped)
    }

    pub async fn open_file(
        &self,
        file_id: uuid::Uuid,
    ) -> Result<Option<(String, Vec<u8>)>, NetError> {
        let (reply, rx) = oneshot::channel();
        self.send(NodeCommand::OpenFile { file_id, reply }).await?;
        rx.await.map_err(|_| NetError::NodeStopped)
    }

    pub async fn peer_avatar(&self, session_id: SessionId) -> Result<Option<Vec<u8>>, NetError> {
        let (reply, rx) = oneshot::channel();
        self.send(NodeCommand::PeerAvatar { session_id, reply })
            .await?;
        rx.await.map_err(|_| NetError::NodeStopped)
    }

    pub async fn logout(&self) -> Result<(), NetError> {
        self.send(NodeCommand::Logout).await
    }
}

/// Log a failed accept and pause, so a persistent error does not spin the select loop.
async fn accept_failed(e: &std::io::Error) {
    error!(error = %e, "Accept failed");
    tokio::time::sleep(ACCEPT_BACKOFF).await;
}

/// Results of handshake tasks.
enum Internal {
    Handshaked {
        addr: SocketAddr,
        outgoing: bool,
        result: Result<EstablishedSession, String>,
    },
}

/// Bind the listener and spawn the node in a background tokio task.
///
/// Contacts are loaded from `storage` before the first connection is accepted.
///
/// # Returns
///
/// `(handle, event_rx, bound_address)`
pub async fn spawn_node(
    config: NodeConfig,
    identity: Identity,
    profile: LocalProfile,
    storage: Box<dyn Storage>,
) -> Result<(NodeHandle, mpsc::Receiver<NodeEvent>, SocketAddr), NetError> {
    let listener = TcpListener::bind(config.listen_socket()).await?;
    let local_addr = listener.local_addr()?;

    let mut registry = Registry::new();
    registry.load_contacts(storage.load_contacts()?);

    let own_key = identity.key();
    info!(
        addr = %local_addr,
        key = %own_key.short(),
        fingerprint = %own_key.fingerprint(),
        "Node listening"
    );

    let (cmd_tx, cmd_rx) = mpsc::channel(config.command_capacity);
    let (event_tx, event_rx) = mpsc::channel(config.event_capacity);
    let (internal_tx, internal_rx) = mpsc::channel(config.command_capacity);
    let (session_tx, session_rx) = mpsc::channel(config.command_capacity);
    let (shutdown_tx, _) = watch::channel(false);

    let handle = NodeHandle {
        commands: cmd_tx,
        port: config.port,
    };

    let node = Node {
        config,
        identity: Arc::new(identity),
        own_key,
        profile,
        storage,
        registry,
        senders: HashMap::new(),
        receivers: HashMap::new(),
        foreground: false,
        focused: None,
        dialing: HashSet::new(),
        next_generation: 0,
        events: event_tx,
        internal_tx,
        session_tx,
        shutdown_tx,
    };
    tokio::spawn(node.run(listener, cmd_rx, internal_rx, session_rx));

    Ok((handle, event_rx, local_addr))
}

struct Node {
    config: NodeConfig,
    identity: Arc<Identity>,
    own_key: IdentityKey,
    profile: LocalProfile,
    storage: Box<dyn Storage>,
    registry: Registry<SessionHandle>,
    senders: HashMap<SessionId, FilesSender>,
    receivers: HashMap<SessionId, FilesReceiver>,
    foreground: bool,
    focused: Option<SessionId>,
    /// Outbound dials whose handshake has not finished yet.
    dialing: HashSet<SocketAddr>,
    next_generation: u64,
    events: mpsc::Sender<NodeEvent>,
    internal_tx: mpsc::Sender<Internal>,
    session_tx: mpsc::Sender<SessionEvent>,
    shutdown_tx: watch::Sender<bool>,
}

impl Node {
    async fn run(
        mut self,
        listener: TcpListener,
        mut commands: mpsc::Receiver<NodeCommand>,
        mut internal: mpsc::Receiver<Internal>,
        mut session_events: mpsc::Receiver<SessionEvent>,
    ) {
        loop {
            tokio::select! {
                // --- Commands from the application ---
                cmd = commands.recv() => {
                    match cmd {
                        Some(NodeCommand::Logout) => {
                            info!("Logout requested");
                            break;
                        }
                        Some(cmd) => self.handle_command(cmd).await,
                        None => {
                            info!("Command channel closed, stopping node");
                            break;
                        }
                    }
                }

                // --- Incoming connections ---
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            debug!(ip = %addr, "Incoming connection");
                            self.spawn_handshake(stream, addr);
                        }
                        Err(e) => accept_failed(&e).await,
                    }
                }

                // --- Handshake results ---
                Some(event) = internal.recv() => {
                    match event {
                        Internal::Handshaked { addr, outgoing, result } => {
                            self.on_handshaked(addr, outgoing, result).await;
                        }
                    }
                }

                // --- Session traffic ---
                Some(event) = session_events.recv() => {
                    match event {
                        SessionEvent::Message { generation, message } => {
                            let Some(id) = self.registry.session_by_generation(generation) else {
                                debug!(generation, "Message from a replaced connection dropped");
                                continue;
                            };
                            self.dispatch(id, message).await;
                        }
                        SessionEvent::Closed { generation, reason } => {
                            if let Some(id) = self.registry.session_by_generation(generation) {
                                self.teardown(id, &reason).await;
                            }
                        }
                    }
                }
            }
        }

        self.shutdown().await;
    }

    /// Never blocks the actor: a full event channel drops the event.
    fn emit(&self, event: NodeEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(?event, "Event channel full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    // -----------------------------------------------------------------------
    // Connection setup
    // -----------------------------------------------------------------------

    fn spawn_handshake(&self, stream: TcpStream, addr: SocketAddr) {
        let identity = Arc::clone(&self.identity);
        let internal = self.internal_tx.clone();
        let deadline = self.config.handshake_timeout;
        let padding = self.config.padding();
        let max_record_size = self.config.max_record_size;

        tokio::spawn(async move {
            let result = establish(
                stream,
                addr,
                false,
                &identity,
                deadline,
                padding,
                max_record_size,
            )
            .await
            .map_err(|e| e.to_string());
            let _ = internal
                .send(Internal::Handshaked {
                    addr,
                    outgoing: false,
                    result,
                })
                .await;
        });
    }

    fn connect(&mut self, addr: SocketAddr) {
        if self.dialing.contains(&addr) || self.registry.sessions().any(|s| s.info.addr == addr) {
            debug!(ip = %addr, "Already connected or dialing");
            return;
        }
        self.dialing.insert(addr);

        let identity = Arc::clone(&self.identity);
        let internal = self.internal_tx.clone();
        let deadline = self.config.handshake_timeout;
        let padding = self.config.padding();
        let max_record_size = self.config.max_record_size;

        tokio::spawn(async move {
            let result = match tokio::time::timeout(deadline, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => establish(
                    stream,
                    addr,
                    true,
                    &identity,
                    deadline,
                    padding,
                    max_record_size,
                )
                .await
                .map_err(|e| e.to_string()),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err(format!("connect timed out after {deadline:?}")),
            };
            let _ = internal
                .send(Internal::Handshaked {
                    addr,
                    outgoing: true,
                    result,
                })
                .await;
        });
    }

    async fn on_handshaked(
        &mut self,
        addr: SocketAddr,
        outgoing: bool,
        result: Result<EstablishedSession, String>,
    ) {
        if outgoing {
            self.dialing.remove(&addr);
        }

        let session = match result {
            Ok(session) => session,
            Err(reason) => {
                warn!(ip = %addr, outgoing, reason = %reason, "Handshake failed");
                if outgoing {
                    self.emit(NodeEvent::ConnectFailed {
                        ip: addr.ip(),
                        reason,
                    });
                }
                return;
            }
        };

        let peer_key = session.peer_key;
        let (id, is_contact) = match self.registry.reconcile(&peer_key, &self.own_key) {
            Ok(found) => found,
            Err(e) => {
                // dropping the session closes the socket
                info!(ip = %addr, peer = %peer_key.short(), reason = %e, "Refusing session");
                if outgoing {
                    self.emit(NodeEvent::ConnectFailed {
                        ip: addr.ip(),
                        reason: e.to_string(),
                    });
                }
                return;
            }
        };

        let generation = self.next_generation;
        self.next_generation += 1;
        let handle = SessionHandle::spawn(
            session,
            generation,
            self.session_tx.clone(),
            self.shutdown_tx.subscribe(),
        );
        self.registry.insert(LiveSession {
            info: SessionInfo {
                id,
                peer_key,
                addr,
                outgoing,
                generation,
                connected_at: Utc::now(),
            },
            handle,
        });

        info!(session = %id, ip = %addr, outgoing, is_contact, "Session established");
        let name = self.registry.name_of(id);
        self.emit(NodeEvent::NewSession {
            session_id: id,
            ip: addr.ip(),
            outgoing,
            is_contact,
            name,
            fingerprint: peer_key.fingerprint(),
        });

        if is_contact {
            let pending = self.registry.take_pending(id);
            if !pending.is_empty() {
                debug!(session = %id, count = pending.len(), "Flushing pending messages");
            }
            for message in pending {
                self.send_message(id, &message);
            }
            self.emit(NodeEvent::PendingMessagesSent { session_id: id });
        } else {
            self.send_message(id, &Message::AskProfileInfo);
        }
    }

    async fn teardown(&mut self, id: SessionId, reason: &str) {
        let Some((session, forgotten)) = self.registry.disconnect(id) else {
            return;
        };
        session.handle.close();
        if !forgotten.saved.is_empty() {
            debug!(session = %id, count = forgotten.saved.len(), "Forgetting messages of non-contact");
        }
        info!(session = %id, ip = %session.info.addr, reason = %reason, "Session closed");

        if self.senders.remove(&id).is_some() {
            self.emit(NodeEvent::TransferAborted {
                session_id: id,
                direction: TransferDirection::Send,
                by_peer: false,
            });
        }
        if let Some(receiver) = self.receivers.remove(&id) {
            receiver.abort().await;
            self.emit(NodeEvent::TransferAborted {
                session_id: id,
                direction: TransferDirection::Receive,
                by_peer: false,
            });
        }

        self.emit(NodeEvent::SessionDisconnected { session_id: id });
    }

    async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        for session in self.registry.drain_sessions() {
            session.handle.close();
        }
        for (_, receiver) in self.receivers.drain() {
            receiver.abort().await;
        }
        info!("Node stopped");
    }

    // -----------------------------------------------------------------------
    // Outbound records
    // -----------------------------------------------------------------------

    /// Seal and queue one message, or park it behind a prefetched chunk.
    /// Returns false when the session is gone or the message could not be built.
    fn send_message(&mut self, id: SessionId, message: &Message) -> bool {
        let payload = match message.encode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(session = %id, kind = message.kind(), error = %e, "Cannot encode message");
                return false;
            }
        };
        if !self.fits_record(payload.len()) {
            warn!(session = %id, kind = message.kind(), size = payload.len(), "Message exceeds the record size limit");
            return false;
        }

        if let Some(sender) = self.senders.get_mut(&id) {
            if sender.is_prefetching() {
                sender.defer(payload);
                return true;
            }
        }

        let Some(session) = self.registry.session_mut(id) else {
            return false;
        };
        match session.handle.seal(&payload) {
            Ok(record) => session.handle.write(record.into_bytes()),
            Err(e) => {
                error!(session = %id, error = %e, "Sealing failed");
                false
            }
        }
    }

    /// Whether a payload of `len` bytes seals into a record peers will accept.
    fn fits_record(&self, len: usize) -> bool {
        padded_len(len, self.config.padding()) <= self.config.max_record_size
    }

    fn message_fits(&self, message: &Message) -> bool {
        message
            .encode()
            .is_ok_and(|payload| self.fits_record(payload.len()))
    }

    fn write_records(&mut self, id: SessionId, records: Vec<Vec<u8>>) {
        let Some(session) = self.registry.session(id) else {
            return;
        };
        for bytes in records {
            if !session.handle.write(bytes) {
                break;
            }
        }
    }

    fn broadcast(&mut self, message: &Message) {
        for id in self.registry.session_ids() {
            self.send_message(id, message);
        }
    }

    fn contact_uuid(&self, id: SessionId) -> Option<uuid::Uuid> {
        self.registry.contact(id).map(|c| c.uuid)
    }

    /// Persist a chat record for a contact; otherwise, or when the store fails, keep it in memory.
    fn record_message(&mut self, id: SessionId, record: &ChatRecord) {
        if let Some(uuid) = self.contact_uuid(id) {
            match self.storage.store_message(uuid, record) {
                Ok(()) => return,
                Err(e) => warn!(session = %id, error = %e, "Could not store message, keeping it in memory"),
            }
        }
        self.registry.save_message(id, record.clone());
    }

    async fn deliver(&mut self, id: SessionId, message: Message, content: ChatContent) {
        let queued = if self.registry.is_online(id) {
            if !self.send_message(id, &message) {
                return;
            }
            false
        } else if self.registry.queue_pending(id, message) {
            debug!(session = %id, pending = self.registry.pending_len(id), "Peer offline, message queued");
            true
        } else {
            info!(session = %id, "Peer offline and not a contact, message dropped");
            return;
        };

        let record = ChatRecord::new(true, content);
        self.record_message(id, &record);
        self.emit(NodeEvent::MessageSent {
            session_id: id,
            record,
            queued,
        });
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    async fn handle_command(&mut self, cmd: NodeCommand) {
        match cmd {
            NodeCommand::Connect(addr) => self.connect(addr),
            NodeCommand::SendText { session_id, text } => {
                self.deliver(
                    session_id,
                    Message::Text(text.clone()),
                    ChatContent::Text { text },
                )
                .await;
            }
            NodeCommand::SendFiles { session_id, paths } => {
                self.send_files(session_id, paths).await;
            }
            NodeCommand::CancelTransfer { session_id } => {
                self.cancel_transfer(session_id).await;
            }
            NodeCommand::RespondLargeFiles { session_id, accept } => {
                self.respond_large_files(session_id, accept).await;
            }
            NodeCommand::ChangeName(name) => {
                let name = sanitize_name(&name);
                let message = Message::Name(name.clone());
                if !self.message_fits(&message) {
                    warn!(len = name.len(), "Name does not fit in a record, not changed");
                    return;
                }
                if let Err(e) = self.storage.set_identity_name(&name) {
                    warn!(error = %e, "Could not persist name");
                }
                self.profile.name = name;
                self.broadcast(&message);
            }
            NodeCommand::ChangeAvatar(avatar) => {
                let message = match &avatar {
                    Some(data) => Message::Avatar(data.clone()),
                    None => Message::RemoveAvatar,
                };
                let size = avatar.as_ref().map_or(0, Vec::len);
                if size > self.config.max_avatar_size || !self.message_fits(&message) {
                    warn!(size, "Avatar too large, not changed");
                    return;
                }
                if let Err(e) = self.storage.set_identity_avatar(avatar.as_deref()) {
                    warn!(error = %e, "Could not persist avatar");
                }
                self.profile.avatar = avatar;
                self.broadcast(&message);
            }
            NodeCommand::SetAsContact { session_id, name } => {
                self.set_as_contact(session_id, name);
            }
            NodeCommand::SetVerified { session_id } => {
                let Some(uuid) = self.contact_uuid(session_id) else {
                    warn!(session = %session_id, "Only contacts can be verified");
                    return;
                };
                match self.storage.set_verified(uuid) {
                    Ok(()) => {
                        if let Some(contact) = self.registry.contact_mut(session_id) {
                            contact.verified = true;
                        }
                    }
                    Err(e) => warn!(session = %session_id, error = %e, "Could not mark contact verified"),
                }
            }
            NodeCommand::RemoveContact { session_id } => {
                self.remove_contact(session_id).await;
            }
            NodeCommand::DeleteConversation { session_id } => {
                if let Some(uuid) = self.contact_uuid(session_id) {
                    if let Err(e) = self.storage.delete_conversation(uuid) {
                        warn!(session = %session_id, error = %e, "Could not delete conversation");
                    }
                }
                self.registry.clear_saved(session_id);
            }
            NodeCommand::SetForeground(foreground) => {
                self.foreground = foreground;
                if let (true, Some(focused)) = (foreground, self.focused) {
                    self.mark_seen(focused);
                }
            }
            NodeCommand::SetFocus(focused) => {
                self.focused = focused;
                if let (true, Some(focused)) = (self.foreground, focused) {
                    self.mark_seen(focused);
                }
            }
            NodeCommand::MarkSeen { session_id } => self.mark_seen(session_id),
            NodeCommand::ListSessions(reply) => {
                let _ = reply.send(self.list_sessions());
            }
            NodeCommand::LoadHistory {
                session_id,
                offset,
                limit,
                reply,
            } => {
                let _ = reply.send(self.load_history(session_id, offset, limit));
            }
            NodeCommand::OpenFile { file_id, reply } => {
                let file = self.storage.load_file(file_id).unwrap_or_else(|e| {
                    warn!(file = %file_id, error = %e, "Could not load file");
                    None
                });
                let _ = reply.send(file);
            }
            NodeCommand::PeerAvatar { session_id, reply } => {
                let _ = reply.send(self.peer_avatar(session_id));
            }
            NodeCommand::Logout => {}
        }
    }

    fn set_as_contact(&mut self, id: SessionId, name: String) {
        if self.registry.is_contact(id) {
            debug!(session = %id, "Already a contact");
            return;
        }
        let Some(peer_key) = self.registry.session(id).map(|s| s.info.peer_key) else {
            warn!(session = %id, "Cannot add an offline peer as contact");
            return;
        };

        let name = sanitize_name(&name);
        let avatar = self.registry.saved_avatar(id);
        let contact = match self.storage.add_contact(&name, &peer_key, avatar) {
            Ok(contact) => contact,
            Err(e) => {
                warn!(session = %id, error = %e, "Could not add contact");
                return;
            }
        };
        let uuid = contact.uuid;
        let promoted = self.registry.promote(id, contact);

        for record in promoted.saved {
            if let ChatContent::File { file_id, .. } = &record.content {
                if let Err(e) = self.storage.assign_file(*file_id, uuid) {
                    warn!(session = %id, file = %file_id, error = %e, "Could not keep file of new contact");
                }
            }
            if let Err(e) = self.storage.store_message(uuid, &record) {
                warn!(session = %id, error = %e, "Could not store saved message");
                self.registry.save_message(id, record);
            }
        }
        if !self.registry.is_seen(id) {
            if let Err(e) = self.storage.set_contact_seen(uuid, false) {
                warn!(session = %id, error = %e, "Could not store seen flag");
            }
        }
        info!(session = %id, name = %name, "Peer added as contact");
    }

    async fn remove_contact(&mut self, id: SessionId) {
        let Some(uuid) = self.contact_uuid(id) else {
            return;
        };
        if let Err(e) = self.storage.remove_contact(uuid) {
            warn!(session = %id, error = %e, "Could not remove contact");
            return;
        }
        self.registry.demote(id);
        info!(session = %id, "Contact removed");

        // a queued request can no longer reach an offline non-contact
        if !self.registry.is_online(id) && self.senders.remove(&id).is_some() {
            self.emit(NodeEvent::TransferAborted {
                session_id: id,
                direction: TransferDirection::Send,
                by_peer: false,
            });
        }
    }

    fn mark_seen(&mut self, id: SessionId) {
        if !self.registry.set_seen(id, true) {
            return;
        }
        if let Some(uuid) = self.contact_uuid(id) {
            if let Err(e) = self.storage.set_contact_seen(uuid, true) {
                warn!(session = %id, error = %e, "Could not store seen flag");
            }
        }
    }

    /// Contacts page through storage; a stranger's conversation lives in memory only.
    fn load_history(&self, id: SessionId, offset: usize, limit: usize) -> Vec<ChatRecord> {
        if let Some(uuid) = self.contact_uuid(id) {
            return self
                .storage
                .load_messages(uuid, offset, limit)
                .unwrap_or_else(|e| {
                    warn!(session = %id, error = %e, "Could not load history");
                    Vec::new()
                });
        }
        self.registry
            .saved_messages(id)
            .iter()
            .rev()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect()
    }

    fn peer_avatar(&self, id: SessionId) -> Option<Vec<u8>> {
        let avatar = match self.registry.contact(id) {
            Some(contact) => contact.avatar,
            None => self.registry.saved_avatar(id),
        }?;
        self.storage.load_avatar(avatar).unwrap_or_else(|e| {
            warn!(session = %id, error = %e, "Could not load avatar");
            None
        })
    }

    fn list_sessions(&self) -> Vec<SessionSummary> {
        let mut ids = self.registry.contact_ids();
        ids.extend(self.registry.session_ids());
        ids.sort();
        ids.dedup();

        ids.into_iter()
            .map(|id| {
                let session = self.registry.session(id);
                let contact = self.registry.contact(id);
                let key = session
                    .map(|s| s.info.peer_key)
                    .or_else(|| contact.map(|c| c.public_key));
                SessionSummary {
                    session_id: id,
                    name: self.registry.name_of(id),
                    ip: session.map(|s| s.info.addr.ip()),
                    online: session.is_some(),
                    is_contact: contact.is_some(),
                    verified: contact.is_some_and(|c| c.verified),
                    seen: self.registry.is_seen(id),
                    fingerprint: key.map(|k| k.fingerprint()),
                }
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // File transfers
    // -----------------------------------------------------------------------

    fn transfer_active(&self, id: SessionId) -> bool {
        self.senders.contains_key(&id) || self.receivers.contains_key(&id)
    }

    async fn reject(&mut self, id: SessionId, reason: TransferError) {
        info!(session = %id, reason = %reason, "File transfer rejected");
        self.emit(NodeEvent::TransferRejected {
            session_id: id,
            reason,
        });
    }

    async fn send_files(&mut self, id: SessionId, paths: Vec<PathBuf>) {
        if paths.is_empty() {
            return;
        }
        if self.transfer_active(id) {
            self.reject(id, TransferError::AlreadyInProgress).await;
            return;
        }
        let online = self.registry.is_online(id);
        if !online && !self.registry.is_contact(id) {
            self.reject(id, TransferError::PeerOffline).await;
            return;
        }

        let mut large = false;
        for path in &paths {
            match tokio::fs::metadata(path).await {
                Ok(meta) => large |= meta.len() > self.config.small_file_limit,
                Err(e) => {
                    self.reject(id, TransferError::Unreadable(format!("{}: {e}", path.display())))
                        .await;
                    return;
                }
            }
        }

        if !large {
            for path in &paths {
                self.send_small_file(id, path).await;
            }
            return;
        }

        let sender = match FilesSender::open(&paths, self.config.chunk_size).await {
            Ok(sender) => sender,
            Err(reason) => {
                self.reject(id, reason).await;
                return;
            }
        };
        let ask = sender.ask_message();
        info!(session = %id, files = paths.len(), online, "Asking peer to accept large files");
        self.senders.insert(id, sender);
        if online {
            self.send_message(id, &ask);
        } else {
            self.registry.queue_pending(id, ask);
        }
    }

    async fn send_small_file(&mut self, id: SessionId, path: &Path) {
        let content = match tokio::fs::read(path).await {
            Ok(content) => content,
            Err(e) => {
                self.reject(id, TransferError::Unreadable(format!("{}: {e}", path.display())))
                    .await;
                return;
            }
        };
        let name = display_name(path);
        let owner = self.contact_uuid(id);
        let file_id = match self.storage.store_file(owner, &name, &content) {
            Ok(file_id) => file_id,
            Err(e) => {
                warn!(session = %id, file = %name, error = %e, "Could not store outgoing file");
                return;
            }
        };
        self.deliver(
            id,
            Message::File {
                name: name.clone(),
                content,
            },
            ChatContent::File { file_id, name },
        )
        .await;
    }

    async fn cancel_transfer(&mut self, id: SessionId) {
        if let Some(sender) = self.senders.remove(&id) {
            match self.registry.session_mut(id) {
                Some(session) => match sender.cancel(session.handle.cipher()) {
                    Ok(records) => self.write_records(id, records),
                    Err(e) => warn!(session = %id, error = %e, "Could not flush cancelled transfer"),
                },
                None => {
                    // the request never left: drop it from the pending queue
                    let pending = self.registry.take_pending(id);
                    for message in pending {
                        if !matches!(message, Message::AskLargeFiles(_)) {
                            self.registry.queue_pending(id, message);
                        }
                    }
                }
            }
            self.send_message(id, &Message::AbortFilesTransfer);
            info!(session = %id, "Outgoing transfer cancelled");
            self.emit(NodeEvent::TransferAborted {
                session_id: id,
                direction: TransferDirection::Send,
                by_peer: false,
            });
        } else if let Some(receiver) = self.receivers.remove(&id) {
            receiver.abort().await;
            self.send_message(id, &Message::AbortFilesTransfer);
            info!(session = %id, "Incoming transfer cancelled");
            self.emit(NodeEvent::TransferAborted {
                session_id: id,
                direction: TransferDirection::Receive,
                by_peer: false,
            });
        } else {
            self.reject(id, TransferError::NoTransfer).await;
        }
    }

    async fn respond_large_files(&mut self, id: SessionId, accept: bool) {
        let Some(mut receiver) = self.receivers.remove(&id) else {
            self.reject(id, TransferError::NoTransfer).await;
            return;
        };
        if receiver.is_accepted() {
            debug!(session = %id, "Transfer already accepted");
            self.receivers.insert(id, receiver);
            return;
        }

        if !accept {
            self.send_message(id, &Message::AbortFilesTransfer);
            info!(session = %id, "Large files refused");
            self.emit(NodeEvent::TransferAborted {
                session_id: id,
                direction: TransferDirection::Receive,
                by_peer: false,
            });
            return;
        }

        match receiver.accept().await {
            Ok(step) => {
                self.send_message(id, &Message::AcceptLargeFiles);
                info!(session = %id, files = receiver.files().len(), "Large files accepted");
                self.emit_progress(id, TransferDirection::Receive, step.progress);
                if step.finished {
                    self.emit(NodeEvent::TransferCompleted {
                        session_id: id,
                        direction: TransferDirection::Receive,
                    });
                } else {
                    self.receivers.insert(id, receiver);
                }
            }
            Err(e) => {
                warn!(session = %id, error = %e, "Cannot receive files");
                receiver.abort().await;
                self.send_message(id, &Message::AbortFilesTransfer);
                self.emit(NodeEvent::TransferAborted {
                    session_id: id,
                    direction: TransferDirection::Receive,
                    by_peer: false,
                });
            }
        }
    }

    fn emit_progress(
        &self,
        id: SessionId,
        direction: TransferDirection,
        progress: Vec<FileProgress>,
    ) {
        for p in progress {
            self.emit(NodeEvent::TransferProgress {
                session_id: id,
                direction,
                file_index: p.file_index,
                file_name: p.file_name,
                transferred: p.transferred,
                size: p.size,
            });
        }
    }

    async fn after_send_step(&mut self, id: SessionId, step: Step) {
        self.write_records(id, step.outbound);
        self.emit_progress(id, TransferDirection::Send, step.progress);

        if let Some(e) = step.failed {
            warn!(session = %id, error = %e, "Outgoing transfer failed");
            if let Some(sender) = self.senders.remove(&id) {
                if let Some(session) = self.registry.session_mut(id) {
                    match sender.cancel(session.handle.cipher()) {
                        Ok(records) => self.write_records(id, records),
                        Err(e) => warn!(session = %id, error = %e, "Could not flush failed transfer"),
                    }
                }
            }
            self.send_message(id, &Message::AbortFilesTransfer);
            self.emit(NodeEvent::TransferAborted {
                session_id: id,
                direction: TransferDirection::Send,
                by_peer: false,
            });
        } else if step.finished {
            self.senders.remove(&id);
            info!(session = %id, "Files sent");
            self.emit(NodeEvent::TransferCompleted {
                session_id: id,
                direction: TransferDirection::Send,
            });
        }
    }

    // -----------------------------------------------------------------------
    // Incoming messages
    // -----------------------------------------------------------------------

    async fn dispatch(&mut self, id: SessionId, message: Message) {
        debug!(session = %id, kind = message.kind(), "Message received");
        match message {
            Message::Text(text) => self.on_chat(id, ChatContent::Text { text }).await,
            Message::File { name, content } => {
                let owner = self.contact_uuid(id);
                match self.storage.store_file(owner, &name, &content) {
                    Ok(file_id) => self.on_chat(id, ChatContent::File { file_id, name }).await,
                    Err(e) => warn!(session = %id, file = %name, error = %e, "Could not store received file"),
                }
            }
            Message::AskProfileInfo => {
                let name = self.profile.name.clone();
                self.send_message(id, &Message::Name(name));
                if let Some(avatar) = self.profile.avatar.clone() {
                    self.send_message(id, &Message::Avatar(avatar));
                }
            }
            Message::Name(name) => self.on_name(id, name).await,
            Message::Avatar(data) => self.on_avatar(id, Some(data)).await,
            Message::RemoveAvatar => self.on_avatar(id, None).await,
            Message::AskLargeFiles(files) => self.on_ask_large_files(id, files).await,
            Message::AcceptLargeFiles => {
                let Some(sender) = self.senders.get_mut(&id) else {
                    warn!(session = %id, "ACCEPT_LARGE_FILES without a pending request");
                    self.send_message(id, &Message::AbortFilesTransfer);
                    return;
                };
                let Some(session) = self.registry.session_mut(id) else {
                    return;
                };
                let step = sender.on_accept(session.handle.cipher()).await;
                self.after_send_step(id, step).await;
            }
            Message::AckChunk => {
                let (Some(sender), Some(session)) =
                    (self.senders.get_mut(&id), self.registry.session_mut(id))
                else {
                    debug!(session = %id, "ACK_CHUNK without a transfer");
                    return;
                };
                let step = sender.on_ack(session.handle.cipher()).await;
                self.after_send_step(id, step).await;
            }
            Message::LargeFileChunk(chunk) => self.on_chunk(id, &chunk).await,
            Message::AbortFilesTransfer => self.on_abort_by_peer(id).await,
        }
    }

    async fn on_chat(&mut self, id: SessionId, content: ChatContent) {
        let record = ChatRecord::new(false, content);
        let seen = self.foreground && self.focused == Some(id);
        self.record_message(id, &record);

        if !seen && self.registry.set_seen(id, false) {
            if let Some(uuid) = self.contact_uuid(id) {
                if let Err(e) = self.storage.set_contact_seen(uuid, false) {
                    warn!(session = %id, error = %e, "Could not store seen flag");
                }
            }
        }

        self.emit(NodeEvent::NewMessage {
            session_id: id,
            record,
            seen,
        });
    }

    async fn on_name(&mut self, id: SessionId, name: String) {
        let name = sanitize_name(&name);
        match self.contact_uuid(id) {
            Some(uuid) => {
                if let Err(e) = self.storage.set_contact_name(uuid, &name) {
                    warn!(session = %id, error = %e, "Could not store contact name");
                }
                if let Some(contact) = self.registry.contact_mut(id) {
                    contact.name = name.clone();
                }
            }
            None => self.registry.set_saved_name(id, name.clone()),
        }
        self.emit(NodeEvent::NameTold {
            session_id: id,
            name,
        });
    }

    async fn on_avatar(&mut self, id: SessionId, data: Option<Vec<u8>>) {
        let avatar = match data {
            Some(data) if data.len() > self.config.max_avatar_size => {
                warn!(session = %id, size = data.len(), "Avatar too large, ignored");
                return;
            }
            Some(data) => match self.storage.store_avatar(&data) {
                Ok(avatar) => Some(avatar),
                Err(e) => {
                    warn!(session = %id, error = %e, "Could not store avatar");
                    return;
                }
            },
            None => None,
        };

        match self.contact_uuid(id) {
            Some(uuid) => {
                if let Err(e) = self.storage.set_contact_avatar(uuid, avatar) {
                    warn!(session = %id, error = %e, "Could not update contact avatar");
                }
                if let Some(contact) = self.registry.contact_mut(id) {
                    contact.avatar = avatar;
                }
            }
            None => self.registry.set_saved_avatar(id, avatar),
        }
        self.emit(NodeEvent::AvatarChanged {
            session_id: id,
            has_avatar: avatar.is_some(),
        });
    }

    async fn on_ask_large_files(&mut self, id: SessionId, files: Vec<FileInfo>) {
        if self.transfer_active(id) {
            warn!(session = %id, "ASK_LARGE_FILES while a transfer is active, ignored");
            return;
        }
        let path = if self.foreground {
            AskPath::Prompt
        } else {
            AskPath::Notification
        };
        self.receivers.insert(
            id,
            FilesReceiver::new(files.clone(), self.config.download_dir.clone(), path),
        );
        self.emit(NodeEvent::AskLargeFiles {
            session_id: id,
            files,
            path,
        });
    }

    async fn on_chunk(&mut self, id: SessionId, chunk: &[u8]) {
        let Some(receiver) = self.receivers.get_mut(&id) else {
            debug!(session = %id, "Chunk without a transfer dropped");
            return;
        };
        match receiver.on_chunk(chunk).await {
            Ok(step) => {
                self.send_message(id, &Message::AckChunk);
                self.emit_progress(id, TransferDirection::Receive, step.progress);
                if step.finished {
                    if let Some(receiver) = self.receivers.remove(&id) {
                        info!(session = %id, files = receiver.saved_paths().len(), "Files received");
                    }
                    self.emit(NodeEvent::TransferCompleted {
                        session_id: id,
                        direction: TransferDirection::Receive,
                    });
                }
            }
            Err(e) => {
                warn!(session = %id, error = %e, "Incoming transfer failed");
                if let Some(receiver) = self.receivers.remove(&id) {
                    receiver.abort().await;
                }
                self.send_message(id, &Message::AbortFilesTransfer);
                self.emit(NodeEvent::TransferAborted {
                    session_id: id,
                    direction: TransferDirection::Receive,
                    by_peer: false,
                });
            }
        }
    }

    async fn on_abort_by_peer(&mut self, id: SessionId) {
        if let Some(sender) = self.senders.remove(&id) {
            if let Some(session) = self.registry.session_mut(id) {
                match sender.abort_by_peer(session.handle.cipher()) {
                    Ok(records) => self.write_records(id, records),
                    Err(e) => warn!(session = %id, error = %e, "Could not flush aborted transfer"),
                }
            }
            info!(session = %id, "Peer aborted our transfer");
            self.emit(NodeEvent::TransferAborted {
                session_id: id,
                direction: TransferDirection::Send,
                by_peer: true,
            });
        } else if let Some(receiver) = self.receivers.remove(&id) {
            receiver.abort().await;
            info!(session = %id, "Peer aborted its transfer");
            self.emit(NodeEvent::TransferAborted {
                session_id: id,
                direction: TransferDirection::Receive,
                by_peer: true,
            });
        } else {
            debug!(session = %id, "ABORT_FILES_TRANSFER without a transfer");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use murmur_shared::types::Contact;
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use uuid::Uuid;

    struct TestNode {
        handle: NodeHandle,
        events: mpsc::Receiver<NodeEvent>,
        addr: SocketAddr,
    }

    fn test_config(download_dir: &Path) -> NodeConfig {
        NodeConfig {
            listen_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            download_dir: download_dir.to_path_buf(),
            handshake_timeout: Duration::from_secs(5),
            small_file_limit: 32,
            chunk_size: 16,
            ..NodeConfig::default()
        }
    }

    async fn start(name: &str, identity: Identity, storage: MemoryStorage, dir: &Path) -> TestNode {
        start_with(test_config(dir), name, identity, storage).await
    }

    async fn start_with(
        config: NodeConfig,
        name: &str,
        identity: Identity,
        storage: MemoryStorage,
    ) -> TestNode {
        let profile = LocalProfile {
            name: name.to_string(),
            avatar: None,
        };
        let (handle, events, addr) = spawn_node(config, identity, profile, Box::new(storage))
            .await
            .unwrap();
        TestNode {
            handle,
            events,
            addr,
        }
    }

    async fn wait_for<F>(events: &mut mpsc::Receiver<NodeEvent>, mut pred: F) -> NodeEvent
    where
        F: FnMut(&NodeEvent) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let event = events.recv().await.expect("node stopped");
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    async fn new_session(events: &mut mpsc::Receiver<NodeEvent>) -> SessionId {
        match wait_for(events, |e| matches!(e, NodeEvent::NewSession { .. })).await {
            NodeEvent::NewSession { session_id, .. } => session_id,
            _ => unreachable!(),
        }
    }

    async fn connected_pair(dir: &Path) -> (TestNode, SessionId, TestNode, SessionId) {
        let mut alice = start("Alice", Identity::generate(), MemoryStorage::new(), dir).await;
        let mut bob = start("Bob", Identity::generate(), MemoryStorage::new(), dir).await;
        alice.handle.connect_addr(bob.addr).await.unwrap();
        let bob_at_alice = new_session(&mut alice.events).await;
        let alice_at_bob = new_session(&mut bob.events).await;
        (alice, bob_at_alice, bob, alice_at_bob)
    }

    #[tokio::test]
    async fn test_text_and_profile_exchange() {
        let dir = tempfile::tempdir().unwrap();
        let (mut alice, bob_id, mut bob, alice_id) = connected_pair(dir.path()).await;

        // both sides are strangers, so both ask for profile info
        let told = wait_for(&mut alice.events, |e| matches!(e, NodeEvent::NameTold { .. })).await;
        assert!(matches!(told, NodeEvent::NameTold { ref name, .. } if name == "Bob"));
        let told = wait_for(&mut bob.events, |e| matches!(e, NodeEvent::NameTold { .. })).await;
        assert!(matches!(told, NodeEvent::NameTold { ref name, .. } if name == "Alice"));

        alice.handle.send_text(bob_id, "hello bob".into()).await.unwrap();
        let sent = wait_for(&mut alice.events, |e| matches!(e, NodeEvent::MessageSent { .. })).await;
        assert!(matches!(sent, NodeEvent::MessageSent { queued: false, .. }));

        let received = wait_for(&mut bob.events, |e| matches!(e, NodeEvent::NewMessage { .. })).await;
        let NodeEvent::NewMessage { session_id, record, seen } = received else {
            unreachable!()
        };
        assert_eq!(session_id, alice_id);
        assert!(!seen);
        assert!(!record.outgoing);
        assert_eq!(record.content, ChatContent::Text { text: "hello bob".into() });

        let sessions = bob.handle.list_sessions().await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].name.as_deref(), Some("Alice"));
        assert!(sessions[0].online);
        assert!(!sessions[0].seen);

        bob.handle.mark_seen(alice_id).await.unwrap();
        let sessions = bob.handle.list_sessions().await.unwrap();
        assert!(sessions[0].seen);
    }

    #[tokio::test]
    async fn test_focused_foreground_messages_are_seen() {
        let dir = tempfile::tempdir().unwrap();
        let (alice, bob_id, mut bob, alice_id) = connected_pair(dir.path()).await;

        bob.handle.set_foreground(true).await.unwrap();
        bob.handle.set_focus(Some(alice_id)).await.unwrap();
        // round trip so both commands are applied before the message arrives
        bob.handle.list_sessions().await.unwrap();
        alice.handle.send_text(bob_id, "look".into()).await.unwrap();

        let received = wait_for(&mut bob.events, |e| matches!(e, NodeEvent::NewMessage { .. })).await;
        assert!(matches!(received, NodeEvent::NewMessage { seen: true, .. }));
    }

    #[tokio::test]
    async fn test_pending_messages_flush_on_reconnect() {
        let dir = tempfile::tempdir().unwrap();
        let bob_identity = Identity::generate();
        let contact = Contact {
            uuid: Uuid::new_v4(),
            name: "Bob".into(),
            public_key: bob_identity.key(),
            verified: true,
            seen: true,
            avatar: None,
        };

        let mut alice = start(
            "Alice",
            Identity::generate(),
            MemoryStorage::with_contacts(vec![contact]),
            dir.path(),
        )
        .await;
        let bob_id = SessionId(0);

        alice.handle.send_text(bob_id, "first".into()).await.unwrap();
        alice.handle.send_text(bob_id, "second".into()).await.unwrap();
        for _ in 0..2 {
            let sent = wait_for(&mut alice.events, |e| matches!(e, NodeEvent::MessageSent { .. })).await;
            assert!(matches!(sent, NodeEvent::MessageSent { queued: true, .. }));
        }

        let mut bob = start("Bob", bob_identity, MemoryStorage::new(), dir.path()).await;
        alice.handle.connect_addr(bob.addr).await.unwrap();

        let session = wait_for(&mut alice.events, |e| matches!(e, NodeEvent::NewSession { .. })).await;
        assert!(matches!(
            session,
            NodeEvent::NewSession { session_id: SessionId(0), is_contact: true, .. }
        ));
        wait_for(&mut alice.events, |e| matches!(e, NodeEvent::PendingMessagesSent { .. })).await;

        let mut texts = Vec::new();
        while texts.len() < 2 {
            if let NodeEvent::NewMessage { record, .. } =
                wait_for(&mut bob.events, |e| matches!(e, NodeEvent::NewMessage { .. })).await
            {
                texts.push(record.content);
            }
        }
        assert_eq!(
            texts,
            vec![
                ChatContent::Text { text: "first".into() },
                ChatContent::Text { text: "second".into() }
            ]
        );
    }

    #[tokio::test]
    async fn test_offline_stranger_message_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let mut alice = start("Alice", Identity::generate(), MemoryStorage::new(), dir.path()).await;
        alice.handle.send_text(SessionId(9), "nobody".into()).await.unwrap();
        alice
            .handle
            .send_files(SessionId(9), vec![PathBuf::from("/nonexistent")])
            .await
            .unwrap();

        let event = wait_for(&mut alice.events, |_| true).await;
        assert!(matches!(
            event,
            NodeEvent::TransferRejected { reason: TransferError::PeerOffline, .. }
        ));
    }

    #[tokio::test]
    async fn test_large_file_transfer_with_interleaved_text() {
        let dir = tempfile::tempdir().unwrap();
        let src = tempfile::tempdir().unwrap();
        let download = tempfile::tempdir().unwrap();

        let mut alice = start("Alice", Identity::generate(), MemoryStorage::new(), dir.path()).await;
        let mut bob = start("Bob", Identity::generate(), MemoryStorage::new(), download.path()).await;
        alice.handle.connect_addr(bob.addr).await.unwrap();
        let bob_id = new_session(&mut alice.events).await;
        let alice_id = new_session(&mut bob.events).await;

        let content: Vec<u8> = (0..100u8).collect();
        let path = src.path().join("report.bin");
        std::fs::write(&path, &content).unwrap();
        alice.handle.send_files(bob_id, vec![path]).await.unwrap();

        let ask = wait_for(&mut bob.events, |e| matches!(e, NodeEvent::AskLargeFiles { .. })).await;
        let NodeEvent::AskLargeFiles { files, path, .. } = ask else {
            unreachable!()
        };
        assert_eq!(path, AskPath::Notification);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].size, 100);

        bob.handle.respond_large_files(alice_id, true).await.unwrap();
        alice.handle.send_text(bob_id, "during".into()).await.unwrap();

        let mut completed = false;
        let mut text = false;
        while !(completed && text) {
            match wait_for(&mut bob.events, |e| {
                matches!(
                    e,
                    NodeEvent::TransferCompleted { .. } | NodeEvent::NewMessage { .. }
                )
            })
            .await
            {
                NodeEvent::TransferCompleted { direction, .. } => {
                    assert_eq!(direction, TransferDirection::Receive);
                    completed = true;
                }
                NodeEvent::NewMessage { record, .. } => {
                    assert_eq!(record.content, ChatContent::Text { text: "during".into() });
                    text = true;
                }
                _ => unreachable!(),
            }
        }
        wait_for(&mut alice.events, |e| {
            matches!(
                e,
                NodeEvent::TransferCompleted { direction: TransferDirection::Send, .. }
            )
        })
        .await;

        assert_eq!(std::fs::read(download.path().join("report.bin")).unwrap(), content);

        // counters are still aligned after the transfer
        alice.handle.send_text(bob_id, "after".into()).await.unwrap();
        let after = wait_for(&mut bob.events, |e| matches!(e, NodeEvent::NewMessage { .. })).await;
        assert!(matches!(
            after,
            NodeEvent::NewMessage { record: ChatRecord { content: ChatContent::Text { ref text }, .. }, .. }
                if text == "after"
        ));
    }

    #[tokio::test]
    async fn test_refused_transfer_and_second_request_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let src = tempfile::tempdir().unwrap();
        let (mut alice, bob_id, mut bob, alice_id) = connected_pair(dir.path()).await;

        let path = src.path().join("big.bin");
        std::fs::write(&path, vec![1u8; 64]).unwrap();
        alice.handle.send_files(bob_id, vec![path.clone()]).await.unwrap();
        alice.handle.send_files(bob_id, vec![path]).await.unwrap();
        let rejected = wait_for(&mut alice.events, |e| matches!(e, NodeEvent::TransferRejected { .. })).await;
        assert!(matches!(
            rejected,
            NodeEvent::TransferRejected { reason: TransferError::AlreadyInProgress, .. }
        ));

        wait_for(&mut bob.events, |e| matches!(e, NodeEvent::AskLargeFiles { .. })).await;
        bob.handle.respond_large_files(alice_id, false).await.unwrap();

        let aborted = wait_for(&mut alice.events, |e| matches!(e, NodeEvent::TransferAborted { .. })).await;
        assert!(matches!(
            aborted,
            NodeEvent::TransferAborted { direction: TransferDirection::Send, by_peer: true, .. }
        ));
    }

    #[tokio::test]
    async fn test_small_file_sent_as_single_record() {
        let dir = tempfile::tempdir().unwrap();
        let src = tempfile::tempdir().unwrap();
        let (alice, bob_id, mut bob, _) = connected_pair(dir.path()).await;

        let path = src.path().join("note.txt");
        std::fs::write(&path, b"tiny").unwrap();
        alice.handle.send_files(bob_id, vec![path]).await.unwrap();

        let received = wait_for(&mut bob.events, |e| matches!(e, NodeEvent::NewMessage { .. })).await;
        let NodeEvent::NewMessage { record, .. } = received else {
            unreachable!()
        };
        assert!(matches!(record.content, ChatContent::File { ref name, .. } if name == "note.txt"));
    }

    #[tokio::test]
    async fn test_duplicate_connection_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (alice, _, mut bob, _) = connected_pair(dir.path()).await;

        bob.handle.connect_addr(alice.addr).await.unwrap();
        let failed = wait_for(&mut bob.events, |e| matches!(e, NodeEvent::ConnectFailed { .. })).await;
        assert!(matches!(failed, NodeEvent::ConnectFailed { .. }));

        let sessions = alice.handle.list_sessions().await.unwrap();
        assert_eq!(sessions.iter().filter(|s| s.online).count(), 1);
        // the original session still works
        let bob_id = sessions[0].session_id;
        alice.handle.send_text(bob_id, "still here".into()).await.unwrap();
        wait_for(&mut bob.events, |e| matches!(e, NodeEvent::NewMessage { .. })).await;
    }

    #[tokio::test]
    async fn test_self_connection_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut alice = start("Alice", Identity::generate(), MemoryStorage::new(), dir.path()).await;
        alice.handle.connect_addr(alice.addr).await.unwrap();

        let failed = wait_for(&mut alice.events, |e| matches!(e, NodeEvent::ConnectFailed { .. })).await;
        assert!(matches!(failed, NodeEvent::ConnectFailed { ref reason, .. } if reason.contains("ourselves")));
        assert!(alice.handle.list_sessions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_peer_reports_connect_failed() {
        let dir = tempfile::tempdir().unwrap();
        let mut alice = start("Alice", Identity::generate(), MemoryStorage::new(), dir.path()).await;

        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = closed.local_addr().unwrap();
        drop(closed);

        alice.handle.connect_addr(addr).await.unwrap();
        let failed = wait_for(&mut alice.events, |_| true).await;
        assert!(matches!(failed, NodeEvent::ConnectFailed { ip, .. } if ip == addr.ip()));
    }

    #[tokio::test]
    async fn test_contact_promotion_and_disconnect() {
        let dir = tempfile::tempdir().unwrap();
        let (alice, bob_id, mut bob, alice_id) = connected_pair(dir.path()).await;

        alice.handle.send_text(bob_id, "before".into()).await.unwrap();
        wait_for(&mut bob.events, |e| matches!(e, NodeEvent::NewMessage { .. })).await;

        bob.handle.set_as_contact(alice_id, "Alice".into()).await.unwrap();
        bob.handle.set_verified(alice_id).await.unwrap();
        let sessions = bob.handle.list_sessions().await.unwrap();
        assert!(sessions[0].is_contact);
        assert!(sessions[0].verified);

        alice.handle.logout().await.unwrap();
        wait_for(&mut bob.events, |e| matches!(e, NodeEvent::SessionDisconnected { .. })).await;

        // contacts survive the disconnect with the same id
        let sessions = bob.handle.list_sessions().await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].session_id, alice_id);
        assert!(!sessions[0].online);

        bob.handle.remove_contact(alice_id).await.unwrap();
        assert!(bob.handle.list_sessions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_accept_error_backs_off() {
        let started = std::time::Instant::now();
        accept_failed(&std::io::Error::from(std::io::ErrorKind::ConnectionAborted)).await;
        assert!(started.elapsed() >= ACCEPT_BACKOFF);
    }

    #[tokio::test]
    async fn test_handle_reports_stopped_node() {
        let dir = tempfile::tempdir().unwrap();
        let alice = start("Alice", Identity::generate(), MemoryStorage::new(), dir.path()).await;
        alice.handle.logout().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(
            alice.handle.list_sessions().await,
            Err(NetError::NodeStopped)
        ));
    }

    #[tokio::test]
    async fn test_history_files_and_avatar_can_be_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let src = tempfile::tempdir().unwrap();
        let (alice, bob_id, mut bob, alice_id) = connected_pair(dir.path()).await;

        let path = src.path().join("note.txt");
        std::fs::write(&path, b"tiny").unwrap();
        alice.handle.send_text(bob_id, "one".into()).await.unwrap();
        alice.handle.send_files(bob_id, vec![path]).await.unwrap();
        for _ in 0..2 {
            wait_for(&mut bob.events, |e| matches!(e, NodeEvent::NewMessage { .. })).await;
        }

        // strangers are paged from memory
        let history = bob.handle.load_history(alice_id, 0, 10).await.unwrap();
        assert_eq!(history.len(), 2);
        let ChatContent::File { file_id, ref name } = history[0].content else {
            panic!("expected the file first, got {:?}", history[0].content);
        };
        assert_eq!(name, "note.txt");
        assert_eq!(history[1].content, ChatContent::Text { text: "one".into() });
        assert_eq!(bob.handle.load_history(alice_id, 1, 10).await.unwrap().len(), 1);

        let (name, content) = bob.handle.open_file(file_id).await.unwrap().unwrap();
        assert_eq!(name, "note.txt");
        assert_eq!(content, b"tiny");
        assert!(bob.handle.open_file(Uuid::new_v4()).await.unwrap().is_none());

        // contacts are paged from storage, files included
        bob.handle.set_as_contact(alice_id, "Alice".into()).await.unwrap();
        let history = bob.handle.load_history(alice_id, 0, 1).await.unwrap();
        assert!(matches!(history[0].content, ChatContent::File { .. }));
        assert!(bob.handle.open_file(file_id).await.unwrap().is_some());

        assert!(bob.handle.peer_avatar(alice_id).await.unwrap().is_none());
        alice.handle.change_avatar(Some(b"face".to_vec())).await.unwrap();
        wait_for(&mut bob.events, |e| {
            matches!(e, NodeEvent::AvatarChanged { has_avatar: true, .. })
        })
        .await;
        assert_eq!(
            bob.handle.peer_avatar(alice_id).await.unwrap().as_deref(),
            Some(&b"face"[..])
        );
    }

    #[tokio::test]
    async fn test_peer_abort_mid_transfer_keeps_session_usable() {
        let dir = tempfile::tempdir().unwrap();
        let src = tempfile::tempdir().unwrap();
        let download = tempfile::tempdir().unwrap();
        // every progress event fits, so none of the interesting ones get dropped
        let roomy = |path: &Path| NodeConfig {
            event_capacity: 1 << 17,
            ..test_config(path)
        };

        let mut alice = start_with(
            roomy(dir.path()),
            "Alice",
            Identity::generate(),
            MemoryStorage::new(),
        )
        .await;
        let mut bob = start_with(
            roomy(download.path()),
            "Bob",
            Identity::generate(),
            MemoryStorage::new(),
        )
        .await;
        alice.handle.connect_addr(bob.addr).await.unwrap();
        let bob_id = new_session(&mut alice.events).await;
        let alice_id = new_session(&mut bob.events).await;

        let path = src.path().join("huge.bin");
        std::fs::write(&path, vec![9u8; 1 << 20]).unwrap();
        alice.handle.send_files(bob_id, vec![path]).await.unwrap();
        wait_for(&mut bob.events, |e| matches!(e, NodeEvent::AskLargeFiles { .. })).await;
        bob.handle.respond_large_files(alice_id, true).await.unwrap();

        // a few chunks in, the sender is waiting for an ack with the next chunk sealed
        wait_for(&mut bob.events, |e| {
            matches!(
                e,
                NodeEvent::TransferProgress { direction: TransferDirection::Receive, transferred, .. }
                    if *transferred >= 48
            )
        })
        .await;
        bob.handle.cancel_transfer(alice_id).await.unwrap();
        wait_for(&mut bob.events, |e| {
            matches!(
                e,
                NodeEvent::TransferAborted { direction: TransferDirection::Receive, by_peer: false, .. }
            )
        })
        .await;

        let aborted = wait_for(&mut alice.events, |e| {
            matches!(e, NodeEvent::TransferAborted { .. } | NodeEvent::TransferCompleted { .. })
        })
        .await;
        assert!(matches!(
            aborted,
            NodeEvent::TransferAborted { direction: TransferDirection::Send, by_peer: true, .. }
        ));

        // the discarded chunk's counter was reused, so the next record still opens
        alice.handle.send_text(bob_id, "after abort".into()).await.unwrap();
        let received = wait_for(&mut bob.events, |e| {
            matches!(e, NodeEvent::NewMessage { .. } | NodeEvent::SessionDisconnected { .. })
        })
        .await;
        assert!(matches!(
            received,
            NodeEvent::NewMessage { record: ChatRecord { content: ChatContent::Text { ref text }, .. }, .. }
                if text == "after abort"
        ));
        let sessions = bob.handle.list_sessions().await.unwrap();
        assert!(sessions[0].online);
    }

    #[tokio::test]
    async fn test_avatar_above_record_limit_is_not_sent() {
        let dir = tempfile::tempdir().unwrap();
        let config = NodeConfig {
            max_record_size: 2048,
            ..test_config(dir.path())
        };
        let alice = start_with(config, "Alice", Identity::generate(), MemoryStorage::new()).await;
        let mut bob = start("Bob", Identity::generate(), MemoryStorage::new(), dir.path()).await;
        alice.handle.connect_addr(bob.addr).await.unwrap();
        let alice_id = new_session(&mut bob.events).await;

        // pads to the 4000 byte bucket
        alice.handle.change_avatar(Some(vec![1u8; 3000])).await.unwrap();
        alice.handle.change_name("Alicia".into()).await.unwrap();

        let mut avatar_seen = false;
        wait_for(&mut bob.events, |e| {
            if matches!(e, NodeEvent::AvatarChanged { has_avatar: true, .. }) {
                avatar_seen = true;
            }
            matches!(e, NodeEvent::NameTold { name, .. } if name == "Alicia")
        })
        .await;
        assert!(!avatar_seen);
        assert!(bob.handle.peer_avatar(alice_id).await.unwrap().is_none());
        assert!(bob.handle.list_sessions().await.unwrap()[0].online);
    }

    #[tokio::test]
    async fn test_full_event_channel_does_not_stall_node() {
        let dir = tempfile::tempdir().unwrap();
        let config = NodeConfig {
            event_capacity: 1,
            ..test_config(dir.path())
        };
        let mut alice = start_with(config, "Alice", Identity::generate(), MemoryStorage::new()).await;
        let mut bob = start("Bob", Identity::generate(), MemoryStorage::new(), dir.path()).await;
        alice.handle.connect_addr(bob.addr).await.unwrap();
        new_session(&mut bob.events).await;
        // alice has answered the profile request while nobody reads her events
        wait_for(&mut bob.events, |e| matches!(e, NodeEvent::NameTold { .. })).await;

        let sessions = tokio::time::timeout(Duration::from_secs(5), alice.handle.list_sessions())
            .await
            .expect("node stalled on a full event channel")
            .unwrap();
        assert_eq!(sessions.len(), 1);
        alice
            .handle
            .send_text(sessions[0].session_id, "still going".into())
            .await
            .unwrap();
        wait_for(&mut bob.events, |e| matches!(e, NodeEvent::NewMessage { .. })).await;

        // the first event was kept, later ones were dropped
        assert!(matches!(
            alice.events.recv().await,
            Some(NodeEvent::NewSession { .. })
        ));
    }
}
