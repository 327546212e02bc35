use thiserror::Error;

use murmur_net::StorageError;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("no platform data directory for the database")]
    NoDataDir,

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("migration failed: {0}")]
    Migration(String),

    /// Stored file content no longer matches its BLAKE3 hash.
    #[error("stored content of {0} is corrupt")]
    Corrupt(uuid::Uuid),
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl From<StoreError> for StorageError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => StorageError::NotFound(what.to_string()),
            other => StorageError::Backend(other.to_string()),
        }
    }
}
