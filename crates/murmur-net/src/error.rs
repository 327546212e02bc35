use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use murmur_shared::error::{CryptoError, IdentityError, ProtocolError};

#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Peer reflected our own handshake bytes")]
    Reflected,

    #[error("Peer sent a low-order ephemeral key")]
    NonContributory,

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("Finished verification failed")]
    BadFinished,

    #[error("Handshake timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Error, Debug)]
pub enum RecordError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection closed by peer")]
    Closed,

    #[error("Record too short: {0} bytes")]
    TooShort(usize),

    #[error("Record too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },

    #[error("Inner length {inner} exceeds record length {outer}")]
    BadInnerLength { inner: usize, outer: usize },

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

#[derive(Error, Debug)]
pub enum NetError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("Record error: {0}")]
    Record(#[from] RecordError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Node is not running")]
    NodeStopped,
}

/// Errors surfaced by a [`crate::storage::Storage`] backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Resource-policy failures of file transfers. These never close the session.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum TransferError {
    #[error("A file transfer with this peer is already in progress")]
    AlreadyInProgress,

    #[error("Peer is offline")]
    PeerOffline,

    #[error("No transfer in progress")]
    NoTransfer,

    #[error("Cannot read file: {0}")]
    Unreadable(String),

    #[error("Cannot write file: {0}")]
    Unwritable(String),

    #[error("Cannot seal chunk: {0}")]
    Sealing(String),
}
