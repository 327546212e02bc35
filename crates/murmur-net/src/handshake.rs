//! Mutually authenticated key exchange run on every new TCP connection.
//!
//! Both sides speak first, so there is no dialer/listener asymmetry: roles are
//! assigned from the round-one bytes and every later step is derived from them.

use rand::{rngs::OsRng, RngCore};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};
use x25519_dalek::{EphemeralSecret, PublicKey};

use murmur_shared::constants::{
    AEAD_TAG_SIZE, HASH_OUTPUT_LEN, PUBKEY_SIZE, RANDOM_LEN, SIGNATURE_SIZE,
};
use murmur_shared::crypto::{self, ApplicationKeys, HandshakeKeys, Role};
use murmur_shared::identity::{verify_signature, Identity};
use murmur_shared::types::IdentityKey;

use crate::error::HandshakeError;

const ROUND_ONE_LEN: usize = RANDOM_LEN + PUBKEY_SIZE;
const IDENTITY_PLAIN_LEN: usize = PUBKEY_SIZE + SIGNATURE_SIZE;
const IDENTITY_RECORD_LEN: usize = IDENTITY_PLAIN_LEN + AEAD_TAG_SIZE;

/// Result of a successful handshake.
pub struct HandshakeOutcome {
    pub peer_key: IdentityKey,
    pub role: Role,
    pub keys: ApplicationKeys,
}

/// Bytes we sent and bytes we received, hashed in role order.
#[derive(Default)]
struct Transcript {
    sent: Vec<u8>,
    received: Vec<u8>,
}

impl Transcript {
    fn hash(&self, role: Role) -> crypto::Secret {
        let mut all = Vec::with_capacity(self.sent.len() + self.received.len());
        match role {
            Role::Responder => {
                all.extend_from_slice(&self.sent);
                all.extend_from_slice(&self.received);
            }
            Role::Initiator => {
                all.extend_from_slice(&self.received);
                all.extend_from_slice(&self.sent);
            }
        }
        crypto::transcript_hash(&all)
    }
}

async fn send<S>(stream: &mut S, transcript: &mut Transcript, data: &[u8]) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(data).await?;
    stream.flush().await?;
    transcript.sent.extend_from_slice(data);
    Ok(())
}

async fn recv<S>(stream: &mut S, transcript: &mut Transcript, buf: &mut [u8]) -> std::io::Result<()>
where
    S: AsyncRead + Unpin,
{
    stream.read_exact(buf).await?;
    transcript.received.extend_from_slice(buf);
    Ok(())
}

/// Run the handshake over `stream` and return the peer identity and application keys.
///
/// The caller bounds the whole exchange with a deadline.
pub async fn perform_handshake<S>(
    stream: &mut S,
    identity: &Identity,
) -> Result<HandshakeOutcome, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut transcript = Transcript::default();

    // Round 1: nonce || ephemeral public key
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral);
    let mut random = [0u8; RANDOM_LEN];
    OsRng.fill_bytes(&mut random);

    let mut round_one = [0u8; ROUND_ONE_LEN];
    round_one[..RANDOM_LEN].copy_from_slice(&random);
    round_one[RANDOM_LEN..].copy_from_slice(ephemeral_public.as_bytes());
    send(stream, &mut transcript, &round_one).await?;

    let mut peer_round_one = [0u8; ROUND_ONE_LEN];
    recv(stream, &mut transcript, &mut peer_round_one).await?;

    let role = Role::from_round_one(&round_one, &peer_round_one).ok_or(HandshakeError::Reflected)?;

    let mut peer_ephemeral = [0u8; PUBKEY_SIZE];
    peer_ephemeral.copy_from_slice(&peer_round_one[RANDOM_LEN..]);
    let shared = ephemeral.diffie_hellman(&PublicKey::from(peer_ephemeral));
    if !shared.was_contributory() {
        return Err(HandshakeError::NonContributory);
    }

    let handshake_keys = HandshakeKeys::derive(shared.as_bytes(), &transcript.hash(role), role)?;
    debug!(role = ?role, "Handshake keys derived");

    // Round 2: fresh nonces
    OsRng.fill_bytes(&mut random);
    send(stream, &mut transcript, &random).await?;
    let mut peer_random = [0u8; RANDOM_LEN];
    recv(stream, &mut transcript, &mut peer_random).await?;

    // Identity record: long-term key || signature over our ephemeral key
    let mut identity_plain = [0u8; IDENTITY_PLAIN_LEN];
    identity_plain[..PUBKEY_SIZE].copy_from_slice(&identity.public_key_bytes());
    identity_plain[PUBKEY_SIZE..].copy_from_slice(&identity.sign(ephemeral_public.as_bytes()));
    let identity_record = crypto::seal(&handshake_keys.local, 0, &identity_plain, &[])?;
    send(stream, &mut transcript, &identity_record).await?;

    let mut peer_record = [0u8; IDENTITY_RECORD_LEN];
    recv(stream, &mut transcript, &mut peer_record).await?;
    let peer_plain = crypto::open(&handshake_keys.peer, 0, &peer_record, &[])?;

    let mut peer_key = [0u8; PUBKEY_SIZE];
    peer_key.copy_from_slice(&peer_plain[..PUBKEY_SIZE]);
    let mut signature = [0u8; SIGNATURE_SIZE];
    signature.copy_from_slice(&peer_plain[PUBKEY_SIZE..IDENTITY_PLAIN_LEN]);
    verify_signature(&peer_key, &peer_ephemeral, &signature)?;

    // Finished values are not part of the transcript
    let hash = transcript.hash(role);
    let finished = crypto::compute_finished(&handshake_keys.local_traffic, &hash)?;
    stream.write_all(&finished).await?;
    stream.flush().await?;

    let mut peer_finished = [0u8; HASH_OUTPUT_LEN];
    stream.read_exact(&mut peer_finished).await?;
    if !crypto::verify_finished(&handshake_keys.peer_traffic, &hash, &peer_finished) {
        warn!("Handshake Finished verification failed");
        return Err(HandshakeError::BadFinished);
    }

    let keys = ApplicationKeys::derive(&handshake_keys.handshake_secret, &hash, role)?;

    Ok(HandshakeOutcome {
        peer_key: IdentityKey(peer_key),
        role,
        keys,
    })
}
