//! Encrypted record framing.
//!
//! A record on the wire is `outerLen(4B BE) || AEAD(innerLen(4B BE) || payload || padding)`.
//! `outerLen` is the length of the padded plaintext and doubles as the AAD;
//! the ciphertext that follows it is `outerLen + 16` bytes long.

use rand::RngCore;
use tokio::io::{AsyncRead, AsyncReadExt};

use murmur_shared::constants::{AEAD_TAG_SIZE, MESSAGE_LEN_LEN};
use murmur_shared::crypto::{self, DirectionKeys};

use crate::error::RecordError;

/// How plaintexts are padded before sealing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaddingPolicy {
    pub enabled: bool,
    pub bucket_start: usize,
}

/// Plaintext length of a record carrying `payload_len` bytes, i.e. its `outerLen`.
pub fn padded_len(payload_len: usize, policy: PaddingPolicy) -> usize {
    let msg_len = MESSAGE_LEN_LEN + payload_len;
    if !policy.enabled {
        return msg_len;
    }
    let mut bucket = policy.bucket_start.max(1);
    while bucket < msg_len {
        bucket = bucket.saturating_mul(2);
    }
    bucket
}

/// `innerLen || payload`, extended with random bytes to the next bucket when enabled.
pub fn pad(payload: &[u8], policy: PaddingPolicy) -> Vec<u8> {
    let msg_len = MESSAGE_LEN_LEN + payload.len();
    let target = padded_len(payload.len(), policy);

    let mut out = Vec::with_capacity(target);
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out.resize(target, 0);
    rand::thread_rng().fill_bytes(&mut out[msg_len..]);
    out
}

pub fn unpad(mut padded: Vec<u8>) -> Result<Vec<u8>, RecordError> {
    if padded.len() < MESSAGE_LEN_LEN {
        return Err(RecordError::TooShort(padded.len()));
    }
    let mut len_bytes = [0u8; MESSAGE_LEN_LEN];
    len_bytes.copy_from_slice(&padded[..MESSAGE_LEN_LEN]);
    let inner = u32::from_be_bytes(len_bytes) as usize;
    let outer = padded.len();
    if inner > outer - MESSAGE_LEN_LEN {
        return Err(RecordError::BadInnerLength { inner, outer });
    }
    padded.truncate(MESSAGE_LEN_LEN + inner);
    padded.drain(..MESSAGE_LEN_LEN);
    Ok(padded)
}

/// A record that has been sealed but not necessarily written yet.
#[derive(Debug, Clone)]
pub struct SealedRecord {
    counter: u64,
    bytes: Vec<u8>,
}

impl SealedRecord {
    pub fn counter(&self) -> u64 {
        self.counter
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Outbound half of an established session.
pub struct SendCipher {
    keys: DirectionKeys,
    counter: u64,
    padding: PaddingPolicy,
}

impl SendCipher {
    pub fn new(keys: DirectionKeys, padding: PaddingPolicy) -> Self {
        Self {
            keys,
            counter: 0,
            padding,
        }
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }

    pub fn seal(&mut self, payload: &[u8]) -> Result<SealedRecord, RecordError> {
        let padded = pad(payload, self.padding);
        let outer = u32::try_from(padded.len()).map_err(|_| RecordError::TooLarge {
            size: padded.len(),
            max: u32::MAX as usize,
        })?;
        let aad = outer.to_be_bytes();
        let ciphertext = crypto::seal(&self.keys, self.counter, &padded, &aad)?;

        let mut bytes = Vec::with_capacity(MESSAGE_LEN_LEN + ciphertext.len());
        bytes.extend_from_slice(&aad);
        bytes.extend_from_slice(&ciphertext);

        let record = SealedRecord {
            counter: self.counter,
            bytes,
        };
        self.counter += 1;
        Ok(record)
    }

    /// Give back the counter of a record that was never written.
    ///
    /// Only the most recently sealed record can be discarded; any other record
    /// is handed back untouched.
    pub fn rewind(&mut self, discarded: SealedRecord) -> Result<(), SealedRecord> {
        if discarded.counter + 1 == self.counter {
            self.counter = discarded.counter;
            Ok(())
        } else {
            Err(discarded)
        }
    }
}

/// Inbound half of an established session.
pub struct RecvCipher {
    keys: DirectionKeys,
    counter: u64,
    max_record_size: usize,
}

impl RecvCipher {
    pub fn new(keys: DirectionKeys, max_record_size: usize) -> Self {
        Self {
            keys,
            counter: 0,
            max_record_size,
        }
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }

    fn check_outer_len(&self, outer: usize) -> Result<(), RecordError> {
        if outer < MESSAGE_LEN_LEN {
            return Err(RecordError::TooShort(outer));
        }
        if outer > self.max_record_size {
            return Err(RecordError::TooLarge {
                size: outer,
                max: self.max_record_size,
            });
        }
        Ok(())
    }

    /// Decrypt one record whose length header has already been split off.
    pub fn open(&mut self, header: [u8; 4], ciphertext: &[u8]) -> Result<Vec<u8>, RecordError> {
        let outer = u32::from_be_bytes(header) as usize;
        self.check_outer_len(outer)?;
        if ciphertext.len() != outer + AEAD_TAG_SIZE {
            return Err(RecordError::TooShort(ciphertext.len()));
        }
        let padded = crypto::open(&self.keys, self.counter, ciphertext, &header)?;
        self.counter += 1;
        unpad(padded)
    }

    /// Read, decrypt and unpad the next record from `reader`.
    pub async fn read_record<R>(&mut self, reader: &mut R) -> Result<Vec<u8>, RecordError>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; MESSAGE_LEN_LEN];
        if let Err(e) = reader.read_exact(&mut header).await {
            return Err(match e.kind() {
                std::io::ErrorKind::UnexpectedEof => RecordError::Closed,
                _ => RecordError::Io(e),
            });
        }

        let outer = u32::from_be_bytes(header) as usize;
        self.check_outer_len(outer)?;

        let mut ciphertext = vec![0u8; outer + AEAD_TAG_SIZE];
        reader.read_exact(&mut ciphertext).await?;
        self.open(header, &ciphertext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use murmur_shared::constants::MAX_RECORD_SIZE;

    const PADDED: PaddingPolicy = PaddingPolicy {
        enabled: true,
        bucket_start: 1000,
    };
    const UNPADDED: PaddingPolicy = PaddingPolicy {
        enabled: false,
        bucket_start: 1000,
    };

    fn keys() -> DirectionKeys {
        DirectionKeys {
            key: [3u8; 32],
            iv: [9u8; 12],
        }
    }

    fn pair(policy: PaddingPolicy) -> (SendCipher, RecvCipher) {
        (
            SendCipher::new(keys(), policy),
            RecvCipher::new(keys(), MAX_RECORD_SIZE),
        )
    }

    #[test]
    fn test_padding_buckets() {
        assert_eq!(pad(b"", PADDED).len(), 1000);
        assert_eq!(pad(&[0u8; 996], PADDED).len(), 1000);
        assert_eq!(pad(&[0u8; 997], PADDED).len(), 2000);
        assert_eq!(pad(&[0u8; 5000], PADDED).len(), 8000);
        assert_eq!(pad(b"abc", UNPADDED).len(), 7);
    }

    #[test]
    fn test_pad_unpad() {
        let padded = pad(b"hello", PADDED);
        assert_eq!(&padded[..4], &[0, 0, 0, 5]);
        assert_eq!(unpad(padded).unwrap(), b"hello");
    }

    #[test]
    fn test_unpad_rejects_bad_inner_length() {
        let mut padded = pad(b"hello", UNPADDED);
        padded[3] = 6;
        assert!(matches!(
            unpad(padded),
            Err(RecordError::BadInnerLength { inner: 6, outer: 9 })
        ));
        assert!(matches!(unpad(vec![0, 0]), Err(RecordError::TooShort(2))));
    }

    #[test]
    fn test_outer_length_is_padded_plaintext() {
        let (mut send, _) = pair(PADDED);
        let record = send.seal(b"hi").unwrap().into_bytes();
        assert_eq!(&record[..4], &1000u32.to_be_bytes());
        assert_eq!(record.len(), 4 + 1000 + AEAD_TAG_SIZE);
    }

    #[tokio::test]
    async fn test_records_in_order() {
        let (mut send, mut recv) = pair(PADDED);
        let mut wire = Vec::new();
        for msg in [&b"one"[..], &b"two"[..], &b""[..]] {
            wire.extend(send.seal(msg).unwrap().into_bytes());
        }
        let mut reader = &wire[..];
        assert_eq!(recv.read_record(&mut reader).await.unwrap(), b"one");
        assert_eq!(recv.read_record(&mut reader).await.unwrap(), b"two");
        assert_eq!(recv.read_record(&mut reader).await.unwrap(), b"");
        assert!(matches!(
            recv.read_record(&mut reader).await,
            Err(RecordError::Closed)
        ));
        assert_eq!(recv.counter(), 3);
    }

    #[tokio::test]
    async fn test_reordered_records_fail() {
        let (mut send, mut recv) = pair(UNPADDED);
        let first = send.seal(b"first").unwrap().into_bytes();
        let second = send.seal(b"second").unwrap().into_bytes();
        let mut reader = &second[..];
        assert!(matches!(
            recv.read_record(&mut reader).await,
            Err(RecordError::Crypto(_))
        ));
        drop(first);
    }

    #[tokio::test]
    async fn test_round_trip_lands_on_buckets() {
        for policy in [PADDED, UNPADDED] {
            let (mut send, mut recv) = pair(policy);
            for len in (0..2100).step_by(7).chain([995, 996, 997, 1996, 1997]) {
                let payload: Vec<u8> = (0..len).map(|i| i as u8).collect();
                let record = send.seal(&payload).unwrap().into_bytes();

                let outer = u32::from_be_bytes([record[0], record[1], record[2], record[3]]) as usize;
                assert_eq!(record.len(), 4 + outer + AEAD_TAG_SIZE);
                assert_eq!(outer, padded_len(len, policy));
                if policy.enabled {
                    assert!(outer >= 4 + len);
                    assert!([1000, 2000, 4000].contains(&outer), "outer {outer} for {len}");
                } else {
                    assert_eq!(outer, 4 + len);
                }

                let mut reader = &record[..];
                assert_eq!(recv.read_record(&mut reader).await.unwrap(), payload);
            }
        }
    }

    #[tokio::test]
    async fn test_flipped_ciphertext_or_tag_bit_fails() {
        let sealed_len = 4 + 1000 + AEAD_TAG_SIZE;
        // first ciphertext byte, one in the middle, last tag byte
        for index in [4, 500, sealed_len - 1] {
            let (mut send, mut recv) = pair(PADDED);
            let mut record = send.seal(b"payload").unwrap().into_bytes();
            assert_eq!(record.len(), sealed_len);
            record[index] ^= 0x01;

            let mut reader = &record[..];
            assert!(matches!(
                recv.read_record(&mut reader).await,
                Err(RecordError::Crypto(_))
            ));
            assert_eq!(recv.counter(), 0);
        }
    }

    #[test]
    fn test_consecutive_nonces_are_distinct() {
        let (mut send, _) = pair(UNPADDED);
        let mut nonces = std::collections::HashSet::new();
        for expected in 0..512u64 {
            let record = send.seal(b"x").unwrap();
            assert_eq!(record.counter(), expected);
            assert!(nonces.insert(crypto::nonce_for(&keys().iv, record.counter())));
        }
        assert_eq!(nonces.len(), 512);
    }

    #[tokio::test]
    async fn test_tampered_length_field_fails() {
        let (mut send, mut recv) = pair(PADDED);
        let mut record = send.seal(b"payload").unwrap().into_bytes();
        // shrink the declared length by one and drop a byte so framing still lines up
        record[3] = 0xE7;
        record.pop();
        let mut reader = &record[..];
        assert!(recv.read_record(&mut reader).await.is_err());
    }

    #[tokio::test]
    async fn test_oversize_and_undersize_rejected() {
        let mut recv = RecvCipher::new(keys(), 2048);
        let too_big = 4096u32.to_be_bytes();
        let mut reader = &too_big[..];
        assert!(matches!(
            recv.read_record(&mut reader).await,
            Err(RecordError::TooLarge { size: 4096, max: 2048 })
        ));

        let too_small = 3u32.to_be_bytes();
        let mut reader = &too_small[..];
        assert!(matches!(
            recv.read_record(&mut reader).await,
            Err(RecordError::TooShort(3))
        ));
    }

    #[tokio::test]
    async fn test_rewind_reuses_counter() {
        let (mut send, mut recv) = pair(UNPADDED);
        let discarded = send.seal(b"never sent").unwrap();
        assert_eq!(discarded.counter(), 0);
        assert!(send.rewind(discarded).is_ok());
        assert_eq!(send.counter(), 0);

        let record = send.seal(b"sent instead").unwrap().into_bytes();
        let mut reader = &record[..];
        assert_eq!(recv.read_record(&mut reader).await.unwrap(), b"sent instead");
    }

    #[test]
    fn test_rewind_only_latest() {
        let (mut send, _) = pair(UNPADDED);
        let first = send.seal(b"a").unwrap();
        let _second = send.seal(b"b").unwrap();
        assert!(send.rewind(first).is_err());
        assert_eq!(send.counter(), 2);
    }
}
