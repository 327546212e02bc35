use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// Peer identity = Ed25519 public key (32 bytes)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct IdentityKey(pub [u8; 32]);

impl IdentityKey {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let mut arr = [0u8; 32];
        hex::decode_to_slice(s, &mut arr)?;
        Ok(Self(arr))
    }

    pub fn short(&self) -> String {
        self.to_hex()[..8].to_string()
    }

    pub fn fingerprint(&self) -> String {
        crate::crypto::fingerprint(&self.0)
    }
}

impl std::fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Numeric handle the UI and the registry use for a peer.
/// Stable for contacts, ephemeral for unknown peers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A persisted peer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Contact {
    pub uuid: Uuid,
    pub name: String,
    pub public_key: IdentityKey,
    pub verified: bool,
    pub seen: bool,
    /// Id of the stored avatar image, if the peer announced one.
    pub avatar: Option<Uuid>,
}

/// What a chat entry carries once it has been handled locally.
/// Received and sent files are stored separately and referenced by id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChatContent {
    Text { text: String },
    File { file_id: Uuid, name: String },
}

/// One entry of a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatRecord {
    pub outgoing: bool,
    pub timestamp: DateTime<Utc>,
    pub content: ChatContent,
}

impl ChatRecord {
    pub fn new(outgoing: bool, content: ChatContent) -> Self {
        Self {
            outgoing,
            timestamp: Utc::now(),
            content,
        }
    }
}
