//! Established sessions: handshake under a deadline, then one reader task and
//! one writer task per connection.
//!
//! The reader owns the receive cipher and forwards decoded messages. The
//! writer only ever sees sealed bytes; sealing happens in the manager, which
//! owns the send cipher through [`SessionHandle`].

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use murmur_shared::error::ProtocolError;
use murmur_shared::identity::Identity;
use murmur_shared::protocol::Message;
use murmur_shared::types::IdentityKey;

use crate::error::{HandshakeError, RecordError};
use crate::handshake::perform_handshake;
use crate::record::{PaddingPolicy, RecvCipher, SealedRecord, SendCipher};

/// A connection whose handshake succeeded.
pub struct EstablishedSession {
    pub peer_key: IdentityKey,
    pub addr: SocketAddr,
    pub outgoing: bool,
    pub stream: TcpStream,
    pub send: SendCipher,
    pub recv: RecvCipher,
}

/// Run the handshake on a fresh socket, bounded by `deadline`.
pub async fn establish(
    mut stream: TcpStream,
    addr: SocketAddr,
    outgoing: bool,
    identity: &Identity,
    deadline: Duration,
    padding: PaddingPolicy,
    max_record_size: usize,
) -> Result<EstablishedSession, HandshakeError> {
    let outcome = tokio::time::timeout(deadline, perform_handshake(&mut stream, identity))
        .await
        .map_err(|_| HandshakeError::Timeout(deadline))??;

    debug!(
        ip = %addr,
        peer = %outcome.peer_key.short(),
        role = ?outcome.role,
        "Handshake complete"
    );

    Ok(EstablishedSession {
        peer_key: outcome.peer_key,
        addr,
        outgoing,
        stream,
        send: SendCipher::new(outcome.keys.local, padding),
        recv: RecvCipher::new(outcome.keys.peer, max_record_size),
    })
}

/// Reported by session tasks to the manager, tagged with the connection generation.
#[derive(Debug)]
pub enum SessionEvent {
    Message { generation: u64, message: Message },
    Closed { generation: u64, reason: String },
}

/// Manager-side handle of a live session.
pub struct SessionHandle {
    send: SendCipher,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl SessionHandle {
    /// Split the stream and start the reader and writer tasks.
    pub fn spawn(
        session: EstablishedSession,
        generation: u64,
        events: mpsc::Sender<SessionEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (read_half, write_half) = session.stream.into_split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();

        let reader = tokio::spawn(read_loop(
            read_half,
            session.recv,
            generation,
            events.clone(),
            shutdown.clone(),
        ));
        let writer = tokio::spawn(write_loop(
            write_half,
            outbound_rx,
            generation,
            events,
            shutdown,
        ));

        Self {
            send: session.send,
            outbound,
            reader,
            writer,
        }
    }

    pub fn cipher(&mut self) -> &mut SendCipher {
        &mut self.send
    }

    pub fn seal(&mut self, payload: &[u8]) -> Result<SealedRecord, RecordError> {
        self.send.seal(payload)
    }

    /// Queue already-sealed bytes. Returns false once the writer is gone.
    pub fn write(&self, bytes: Vec<u8>) -> bool {
        self.outbound.send(bytes).is_ok()
    }

    /// Stop reading immediately; the writer drains what is queued and closes the socket.
    pub fn close(self) {
        self.reader.abort();
        drop(self.outbound);
        drop(self.writer);
    }
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    mut recv: RecvCipher,
    generation: u64,
    events: mpsc::Sender<SessionEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let reason = loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            result = recv.read_record(&mut reader) => {
                let payload = match result {
                    Ok(payload) => payload,
                    Err(RecordError::Closed) => break "closed by peer".to_string(),
                    Err(e) => {
                        warn!(generation, error = %e, "Record error");
                        break e.to_string();
                    }
                };
                match Message::decode(&payload) {
                    Ok(message) => {
                        if events
                            .send(SessionEvent::Message { generation, message })
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Err(ProtocolError::UnknownTag(tag)) => {
                        warn!(generation, tag = format!("0x{tag:02x}"), "Ignoring unknown message type");
                    }
                    Err(e) => {
                        warn!(generation, error = %e, "Malformed message");
                        break e.to_string();
                    }
                }
            }
        }
    };

    let _ = events
        .send(SessionEvent::Closed { generation, reason })
        .await;
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    generation: u64,
    events: mpsc::Sender<SessionEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            bytes = outbound.recv() => {
                let Some(bytes) = bytes else { break };
                if let Err(e) = writer.write_all(&bytes).await {
                    warn!(generation, error = %e, "Write failed");
                    let _ = events
                        .send(SessionEvent::Closed {
                            generation,
                            reason: e.to_string(),
                        })
                        .await;
                    return;
                }
            }
        }
    }
    let _ = writer.shutdown().await;
}
