//! Rows persisted in the local database that are not already shared types.
//!
//! Contacts and chat records are [`murmur_shared::types::Contact`] and
//! [`murmur_shared::types::ChatRecord`]; they are stored directly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// The local identity: signing key seed plus the profile shown to peers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentityRecord {
    /// Ed25519 seed (32 bytes), stored as hex.
    pub secret_key: [u8; 32],
    pub name: String,
    pub avatar: Option<Vec<u8>>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// File
// ---------------------------------------------------------------------------

/// A file exchanged as a single FILE record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredFile {
    pub id: Uuid,
    /// Owning contact, `None` for files of non-contacts.
    pub contact_id: Option<Uuid>,
    pub file_name: String,
    pub file_size: i64,
    pub blake3_hash: String,
    pub content: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Column conversion helpers
// ---------------------------------------------------------------------------

pub(crate) fn parse_uuid(idx: usize, s: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

pub(crate) fn parse_timestamp(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

pub(crate) fn parse_key(idx: usize, s: &str) -> rusqlite::Result<[u8; 32]> {
    let bytes = hex::decode(s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })?;
    bytes.try_into().map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            "expected 32 bytes".into(),
        )
    })
}
