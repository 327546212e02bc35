use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use murmur_shared::constants::{
    DEFAULT_PORT, FILE_CHUNK_SIZE, HANDSHAKE_TIMEOUT_SECS, MAX_AVATAR_SIZE, MAX_RECORD_SIZE,
    PADDING_BUCKET_START, SMALL_FILE_LIMIT,
};

use crate::record::PaddingPolicy;

/// Configuration for spawning a node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Address the listener binds to.
    pub listen_addr: IpAddr,
    /// Port to listen on and to dial peers at (defaults to `DEFAULT_PORT`).
    pub port: u16,
    /// Where accepted large files are written.
    pub download_dir: PathBuf,
    /// Pad records to power-of-two buckets.
    pub use_padding: bool,
    pub padding_bucket_start: usize,
    /// Upper bound on a whole handshake.
    pub handshake_timeout: Duration,
    /// Largest padded plaintext accepted from a peer.
    pub max_record_size: usize,
    /// Batches containing a file above this size use chunked transfer.
    pub small_file_limit: u64,
    pub chunk_size: usize,
    pub max_avatar_size: usize,
    pub command_capacity: usize,
    pub event_capacity: usize,
}

impl NodeConfig {
    pub fn listen_socket(&self) -> SocketAddr {
        SocketAddr::new(self.listen_addr, self.port)
    }

    pub fn padding(&self) -> PaddingPolicy {
        PaddingPolicy {
            enabled: self.use_padding,
            bucket_start: self.padding_bucket_start,
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            download_dir: std::env::temp_dir().join("murmur-downloads"),
            use_padding: true,
            padding_bucket_start: PADDING_BUCKET_START,
            handshake_timeout: Duration::from_secs(HANDSHAKE_TIMEOUT_SECS),
            max_record_size: MAX_RECORD_SIZE,
            small_file_limit: SMALL_FILE_LIMIT,
            chunk_size: FILE_CHUNK_SIZE,
            max_avatar_size: MAX_AVATAR_SIZE,
            command_capacity: 256,
            event_capacity: 256,
        }
    }
}
