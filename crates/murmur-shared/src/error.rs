use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed: invalid ciphertext or wrong key")]
    DecryptionFailed,

    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("Key derivation failed: {0}")]
    KeyDerivation(&'static str),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum IdentityError {
    #[error("Invalid key bytes")]
    InvalidKeyBytes,

    #[error("Signature verification failed")]
    BadSignature,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Empty message")]
    Empty,

    #[error("Unknown message tag 0x{0:02x}")]
    UnknownTag(u8),

    #[error("Truncated {0} message")]
    Truncated(&'static str),

    #[error("Invalid UTF-8 in {0} message")]
    InvalidUtf8(&'static str),

    #[error("File name too long: {0} bytes")]
    NameTooLong(usize),
}
