use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha384};

use crate::constants::{
    HASH_OUTPUT_LEN, IV_SIZE, LABEL_APPLICATION, LABEL_DERIVED, LABEL_FINISHED, LABEL_HANDSHAKE,
    LABEL_IV, LABEL_KEY, SYMMETRIC_KEY_SIZE,
};
use crate::error::CryptoError;

pub type SymmetricKey = [u8; SYMMETRIC_KEY_SIZE];
pub type Iv = [u8; IV_SIZE];
pub type Secret = [u8; HASH_OUTPUT_LEN];

type HmacSha384 = Hmac<Sha384>;

/// Which side of the handshake a node ended up on.
/// Both sides compute the same role pair from the first round bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Responder,
    Initiator,
}

impl Role {
    /// The side whose round-one bytes are smaller at the first differing
    /// position is the responder. Identical buffers have no role.
    pub fn from_round_one(sent: &[u8], received: &[u8]) -> Option<Role> {
        sent.iter()
            .zip(received.iter())
            .find(|(a, b)| a != b)
            .map(|(a, b)| if a < b { Role::Responder } else { Role::Initiator })
    }

    pub fn other(self) -> Role {
        match self {
            Role::Responder => Role::Initiator,
            Role::Initiator => Role::Responder,
        }
    }

    fn side(self) -> &'static str {
        match self {
            Role::Responder => "responder",
            Role::Initiator => "initiator",
        }
    }
}

/// Key and IV for one direction of traffic.
#[derive(Clone)]
pub struct DirectionKeys {
    pub key: SymmetricKey,
    pub iv: Iv,
}

/// Output of the handshake stage of the key schedule.
pub struct HandshakeKeys {
    pub local: DirectionKeys,
    pub peer: DirectionKeys,
    pub local_traffic: Secret,
    pub peer_traffic: Secret,
    pub handshake_secret: Secret,
}

/// Output of the application stage of the key schedule.
pub struct ApplicationKeys {
    pub local: DirectionKeys,
    pub peer: DirectionKeys,
}

pub fn transcript_hash(transcript: &[u8]) -> Secret {
    let digest = Sha384::digest(transcript);
    let mut out = [0u8; HASH_OUTPUT_LEN];
    out.copy_from_slice(&digest);
    out
}

// info = len(label) u32 BE || label [|| len(context) u32 BE || context]
fn expand_label(
    secret: &[u8],
    label: &str,
    context: Option<&[u8]>,
    out: &mut [u8],
) -> Result<(), CryptoError> {
    let hk = Hkdf::<Sha384>::from_prk(secret)
        .map_err(|_| CryptoError::KeyDerivation("invalid pseudorandom key length"))?;

    let mut info = Vec::with_capacity(8 + label.len() + context.map_or(0, |c| c.len()));
    info.extend_from_slice(&(label.len() as u32).to_be_bytes());
    info.extend_from_slice(label.as_bytes());
    if let Some(context) = context {
        info.extend_from_slice(&(context.len() as u32).to_be_bytes());
        info.extend_from_slice(context);
    }

    hk.expand(&info, out)
        .map_err(|_| CryptoError::KeyDerivation("output length too large"))
}

fn traffic_secret(
    secret: &[u8],
    stage: &str,
    role: Role,
    hash: &[u8],
) -> Result<Secret, CryptoError> {
    let label = format!("{stage} {}", role.side());
    let mut out = [0u8; HASH_OUTPUT_LEN];
    expand_label(secret, &label, Some(hash), &mut out)?;
    Ok(out)
}

fn direction_keys(traffic: &Secret) -> Result<DirectionKeys, CryptoError> {
    let mut key = [0u8; SYMMETRIC_KEY_SIZE];
    let mut iv = [0u8; IV_SIZE];
    expand_label(traffic, LABEL_KEY, None, &mut key)?;
    expand_label(traffic, LABEL_IV, None, &mut iv)?;
    Ok(DirectionKeys { key, iv })
}

impl HandshakeKeys {
    pub fn derive(shared_secret: &[u8], hash: &Secret, role: Role) -> Result<Self, CryptoError> {
        let (prk, _) = Hkdf::<Sha384>::extract(None, shared_secret);
        let mut handshake_secret = [0u8; HASH_OUTPUT_LEN];
        handshake_secret.copy_from_slice(&prk);

        let local_traffic = traffic_secret(&handshake_secret, LABEL_HANDSHAKE, role, hash)?;
        let peer_traffic = traffic_secret(&handshake_secret, LABEL_HANDSHAKE, role.other(), hash)?;

        Ok(Self {
            local: direction_keys(&local_traffic)?,
            peer: direction_keys(&peer_traffic)?,
            local_traffic,
            peer_traffic,
            handshake_secret,
        })
    }
}

impl ApplicationKeys {
    pub fn derive(handshake_secret: &Secret, hash: &Secret, role: Role) -> Result<Self, CryptoError> {
        let mut derived = [0u8; HASH_OUTPUT_LEN];
        expand_label(handshake_secret, LABEL_DERIVED, None, &mut derived)?;
        let (master, _) = Hkdf::<Sha384>::extract(Some(&derived[..]), b"");

        let local_traffic = traffic_secret(&master, LABEL_APPLICATION, role, hash)?;
        let peer_traffic = traffic_secret(&master, LABEL_APPLICATION, role.other(), hash)?;

        Ok(Self {
            local: direction_keys(&local_traffic)?,
            peer: direction_keys(&peer_traffic)?,
        })
    }
}

fn finished_mac(traffic: &Secret) -> Result<HmacSha384, CryptoError> {
    let mut finished_key = [0u8; HASH_OUTPUT_LEN];
    expand_label(traffic, LABEL_FINISHED, None, &mut finished_key)?;
    <HmacSha384 as Mac>::new_from_slice(&finished_key).map_err(|_| CryptoError::InvalidKeyLength)
}

/// Finished value proving possession of `traffic` over the transcript hash
pub fn compute_finished(traffic: &Secret, hash: &Secret) -> Result<Secret, CryptoError> {
    let mut mac = finished_mac(traffic)?;
    mac.update(hash);
    let mut out = [0u8; HASH_OUTPUT_LEN];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

/// Constant-time check of a peer's Finished value
pub fn verify_finished(traffic: &Secret, hash: &Secret, finished: &[u8]) -> bool {
    match finished_mac(traffic) {
        Ok(mut mac) => {
            mac.update(hash);
            mac.verify_slice(finished).is_ok()
        }
        Err(_) => false,
    }
}

/// Nonce = IV XOR counter (8 bytes BE, aligned to the low end)
pub fn nonce_for(iv: &Iv, counter: u64) -> Iv {
    let mut nonce = *iv;
    let counter = counter.to_be_bytes();
    let offset = IV_SIZE - counter.len();
    for (n, c) in nonce[offset..].iter_mut().zip(counter.iter()) {
        *n ^= c;
    }
    nonce
}

pub fn seal(
    keys: &DirectionKeys,
    counter: u64,
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&keys.key));
    let nonce = nonce_for(&keys.iv, counter);
    cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CryptoError::EncryptionFailed)
}

pub fn open(
    keys: &DirectionKeys,
    counter: u64,
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&keys.key));
    let nonce = nonce_for(&keys.iv, counter);
    cipher
        .decrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// 16-byte HKDF fingerprint of a public key, uppercase hex
pub fn fingerprint(public_key: &[u8]) -> String {
    let hk = Hkdf::<Sha384>::new(None, public_key);
    let mut out = [0u8; 16];
    // 16 bytes is always a valid HKDF-SHA384 output length
    if hk.expand(&[], &mut out).is_err() {
        return String::new();
    }
    hex::encode_upper(out)
}
