//! Events emitted by the node task towards the application.

use std::net::IpAddr;

use serde::Serialize;

use murmur_shared::protocol::FileInfo;
use murmur_shared::types::{ChatRecord, SessionId};

use crate::error::TransferError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    Send,
    Receive,
}

/// How an incoming large-file request should be surfaced.
/// Decided once when the request arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AskPath {
    /// The application is in the foreground: ask the user directly.
    Prompt,
    /// Background: show a notification.
    Notification,
}

/// Snapshot row returned by [`crate::manager::NodeHandle::list_sessions`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub name: Option<String>,
    pub ip: Option<IpAddr>,
    pub online: bool,
    pub is_contact: bool,
    pub verified: bool,
    pub seen: bool,
    pub fingerprint: Option<String>,
}

/// Notifications sent *from* the node task to the application.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NodeEvent {
    NewSession {
        session_id: SessionId,
        ip: IpAddr,
        outgoing: bool,
        is_contact: bool,
        name: Option<String>,
        fingerprint: String,
    },
    SessionDisconnected {
        session_id: SessionId,
    },
    ConnectFailed {
        ip: IpAddr,
        reason: String,
    },
    NameTold {
        session_id: SessionId,
        name: String,
    },
    AvatarChanged {
        session_id: SessionId,
        has_avatar: bool,
    },
    NewMessage {
        session_id: SessionId,
        record: ChatRecord,
        seen: bool,
    },
    /// `queued` is set when the peer was offline and the message waits in its pending queue.
    MessageSent {
        session_id: SessionId,
        record: ChatRecord,
        queued: bool,
    },
    PendingMessagesSent {
        session_id: SessionId,
    },
    AskLargeFiles {
        session_id: SessionId,
        files: Vec<FileInfo>,
        path: AskPath,
    },
    TransferProgress {
        session_id: SessionId,
        direction: TransferDirection,
        file_index: usize,
        file_name: String,
        transferred: u64,
        size: u64,
    },
    TransferCompleted {
        session_id: SessionId,
        direction: TransferDirection,
    },
    TransferAborted {
        session_id: SessionId,
        direction: TransferDirection,
        /// True when the peer aborted, false for local cancellation or failure.
        by_peer: bool,
    },
    TransferRejected {
        session_id: SessionId,
        reason: TransferError,
    },
}
