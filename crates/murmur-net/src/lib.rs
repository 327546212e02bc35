// Secure LAN transport: handshake, record layer and the node manager.

pub mod config;
pub mod discovery;
pub mod error;
pub mod events;
pub mod handshake;
pub mod manager;
pub mod record;
pub mod registry;
pub mod session;
pub mod storage;
pub mod transfer;

pub use config::NodeConfig;
pub use discovery::{forward_discovered, load_static_peers, parse_peer_addrs};
pub use error::{HandshakeError, NetError, RecordError, StorageError, TransferError};
pub use events::{AskPath, NodeEvent, SessionSummary, TransferDirection};
pub use handshake::{perform_handshake, HandshakeOutcome};
pub use manager::{spawn_node, LocalProfile, NodeCommand, NodeHandle};
pub use record::{PaddingPolicy, RecvCipher, SendCipher};
pub use registry::{Registry, SessionInfo};
pub use storage::{MemoryStorage, Storage};
