/// Application name
pub const APP_NAME: &str = "Murmur";

/// Default TCP port every node listens on
pub const DEFAULT_PORT: u16 = 7530;

/// Length of the random nonces exchanged during the handshake
pub const RANDOM_LEN: usize = 64;

/// Ed25519 / X25519 public key size in bytes
pub const PUBKEY_SIZE: usize = 32;

/// Ed25519 secret key size in bytes
pub const SECRET_KEY_SIZE: usize = 32;

/// Ed25519 signature size in bytes
pub const SIGNATURE_SIZE: usize = 64;

/// ChaCha20-Poly1305 key size in bytes
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// Per-direction IV size; also the AEAD nonce size
pub const IV_SIZE: usize = 12;

/// Poly1305 authentication tag size in bytes
pub const AEAD_TAG_SIZE: usize = 16;

/// SHA-384 output size: transcript hashes, traffic secrets, Finished values
pub const HASH_OUTPUT_LEN: usize = 48;

/// Size of the big-endian length prefixes used by the record layer
pub const MESSAGE_LEN_LEN: usize = 4;

/// First padding bucket; buckets double from here
pub const PADDING_BUCKET_START: usize = 1000;

/// Largest padded plaintext accepted from a peer (~32 MB)
pub const MAX_RECORD_SIZE: usize = 32_768_000;

/// Files above this size switch the whole batch to chunked transfer
pub const SMALL_FILE_LIMIT: u64 = 16_380_000;

/// Raw file bytes carried by one LARGE_FILE_CHUNK record
pub const FILE_CHUNK_SIZE: usize = 1_023_995;

/// Avatars above this size are ignored
pub const MAX_AVATAR_SIZE: usize = 10_000_000;

/// Default upper bound on a whole handshake, in seconds
pub const HANDSHAKE_TIMEOUT_SECS: u64 = 10;

/// Key schedule labels
pub const LABEL_HANDSHAKE: &str = "handshake";
pub const LABEL_APPLICATION: &str = "application";
pub const LABEL_DERIVED: &str = "derived";
pub const LABEL_FINISHED: &str = "finished";
pub const LABEL_KEY: &str = "key";
pub const LABEL_IV: &str = "iv";
