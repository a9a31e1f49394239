//! Per-packet authenticated encryption
//!
//! Frame format:
//! ```text
//! +----------------+-------------------+-----------------------+---------------+
//! | op|key_id (1B) | sequence (4B, BE) | ciphertext + AEAD tag | HMAC (32B)    |
//! +----------------+-------------------+-----------------------+---------------+
//! ```
//!
//! The payload is sealed with ChaCha20-Poly1305 (nonce = implicit IV XOR
//! sequence, AAD = header). The outer HMAC-SHA256 covers header and
//! ciphertext and is always verified before anything is decrypted.

use super::{CryptoError, KeyId, KeySet, AEAD_TAG_LEN, HMAC_TAG_LEN, NONCE_LEN, TAG_LEN};
use crate::protocol::{PacketCode, DATA_HEADER_LEN};
use bytes::Bytes;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, CHACHA20_POLY1305};
use ring::hmac;

/// An encoded data-channel frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    key_id: KeyId,
    sequence: u32,
    bytes: Bytes,
}

impl Frame {
    /// Parse the header of an encoded frame without authenticating it
    pub fn peek(buf: &[u8]) -> Result<(KeyId, u32), CryptoError> {
        if buf.len() < DATA_HEADER_LEN + TAG_LEN {
            return Err(CryptoError::Truncated(buf.len()));
        }
        let (code, key_id) =
            PacketCode::split_op(buf[0]).map_err(|_| CryptoError::MalformedHeader(buf[0]))?;
        if code != PacketCode::Data {
            return Err(CryptoError::MalformedHeader(buf[0]));
        }
        let sequence = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        Ok((key_id, sequence))
    }

    pub fn key_id(&self) -> KeyId {
        self.key_id
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }
}

/// Encryption box bound to one key set
///
/// Stateless apart from the keys: sequence bookkeeping and replay
/// protection live in [`DataChannel`](super::DataChannel).
pub struct CryptoBox {
    key_id: KeyId,
    keys: KeySet,
}

impl CryptoBox {
    pub fn new(key_id: KeyId, keys: KeySet) -> Self {
        Self { key_id, keys }
    }

    pub fn key_id(&self) -> KeyId {
        self.key_id
    }

    /// Encrypt `plaintext` as frame `sequence`
    pub fn seal(&self, sequence: u32, plaintext: &[u8]) -> Result<Frame, CryptoError> {
        let header = encode_header(self.key_id, sequence);

        let mut buf = Vec::with_capacity(DATA_HEADER_LEN + plaintext.len() + TAG_LEN);
        buf.extend_from_slice(&header);
        buf.extend_from_slice(plaintext);

        let key = aead_key(self.keys.encrypt_cipher_key())?;
        let nonce = nonce_for(self.keys.encrypt_iv(), sequence);
        let tag = key
            .seal_in_place_separate_tag(nonce, Aad::from(header), &mut buf[DATA_HEADER_LEN..])
            .map_err(|_| CryptoError::Encryption("seal failed".to_string()))?;
        buf.extend_from_slice(tag.as_ref());

        let hmac_key = hmac::Key::new(hmac::HMAC_SHA256, self.keys.encrypt_hmac_key());
        let mac = hmac::sign(&hmac_key, &buf);
        buf.extend_from_slice(mac.as_ref());

        Ok(Frame {
            key_id: self.key_id,
            sequence,
            bytes: Bytes::from(buf),
        })
    }

    /// Verify the outer tag and return the frame's sequence number
    ///
    /// Comparison is constant time. Nothing is decrypted.
    pub fn authenticate(&self, frame: &[u8]) -> Result<u32, CryptoError> {
        let (key_id, sequence) = Frame::peek(frame)?;
        if key_id != self.key_id {
            return Err(CryptoError::UnknownKey(key_id.value()));
        }
        let (signed, mac) = frame.split_at(frame.len() - HMAC_TAG_LEN);
        let hmac_key = hmac::Key::new(hmac::HMAC_SHA256, self.keys.decrypt_hmac_key());
        hmac::verify(&hmac_key, signed, mac).map_err(|_| CryptoError::Hmac)?;
        Ok(sequence)
    }

    /// Decrypt a frame whose outer tag already passed [`authenticate`](Self::authenticate)
    pub fn decrypt_authenticated(&self, frame: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let (_, sequence) = Frame::peek(frame)?;
        let header: [u8; DATA_HEADER_LEN] = frame[..DATA_HEADER_LEN]
            .try_into()
            .map_err(|_| CryptoError::Truncated(frame.len()))?;

        let mut buf = frame[DATA_HEADER_LEN..frame.len() - HMAC_TAG_LEN].to_vec();
        let key = aead_key(self.keys.decrypt_cipher_key())?;
        let nonce = nonce_for(self.keys.decrypt_iv(), sequence);
        let plaintext_len = key
            .open_in_place(nonce, Aad::from(header), &mut buf)
            .map_err(|_| CryptoError::Hmac)?
            .len();
        debug_assert_eq!(plaintext_len + AEAD_TAG_LEN, buf.len());
        buf.truncate(plaintext_len);
        Ok(buf)
    }

    /// Authenticate then decrypt
    pub fn open(&self, frame: &[u8]) -> Result<(u32, Vec<u8>), CryptoError> {
        let sequence = self.authenticate(frame)?;
        let plaintext = self.decrypt_authenticated(frame)?;
        Ok((sequence, plaintext))
    }

    /// Encoded length of a frame carrying `plaintext_len` bytes
    pub const fn frame_len(plaintext_len: usize) -> usize {
        DATA_HEADER_LEN + plaintext_len + TAG_LEN
    }
}

fn encode_header(key_id: KeyId, sequence: u32) -> [u8; DATA_HEADER_LEN] {
    let mut header = [0u8; DATA_HEADER_LEN];
    header[0] = PacketCode::Data.op_byte(key_id);
    header[1..].copy_from_slice(&sequence.to_be_bytes());
    header
}

fn aead_key(key: &[u8]) -> Result<LessSafeKey, CryptoError> {
    let unbound = UnboundKey::new(&CHACHA20_POLY1305, key).map_err(|_| CryptoError::InvalidKeyLength)?;
    Ok(LessSafeKey::new(unbound))
}

/// Nonce = implicit IV with the sequence XORed into the last four bytes
fn nonce_for(iv: &[u8], sequence: u32) -> Nonce {
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&iv[..NONCE_LEN]);
    for (n, s) in nonce[NONCE_LEN - 4..].iter_mut().zip(sequence.to_be_bytes()) {
        *n ^= s;
    }
    Nonce::assume_unique_for_key(nonce)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{derive_key_set, Role};

    fn boxes() -> (CryptoBox, CryptoBox) {
        let secret = [0x42u8; 32];
        let client = CryptoBox::new(KeyId::INITIAL, derive_key_set(&secret, Role::Client).unwrap());
        let server = CryptoBox::new(KeyId::INITIAL, derive_key_set(&secret, Role::Server).unwrap());
        (client, server)
    }

    #[test]
    fn test_seal_open() {
        let (client, server) = boxes();
        let plaintext = [0xABu8; 64];

        let frame = client.seal(0, &plaintext).unwrap();
        assert_eq!(frame.len(), DATA_HEADER_LEN + 64 + TAG_LEN);
        assert_eq!(frame.len(), 117);
        assert_eq!(frame.sequence(), 0);

        let (sequence, decrypted) = server.open(frame.as_bytes()).unwrap();
        assert_eq!(sequence, 0);
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_own_direction_does_not_open() {
        let (client, _) = boxes();
        let frame = client.seal(3, b"loopback").unwrap();
        // Our decrypt keys are the peer's encrypt keys, not our own.
        assert!(matches!(client.open(frame.as_bytes()), Err(CryptoError::Hmac)));
    }

    #[test]
    fn test_nonce_depends_on_sequence() {
        let (client, _) = boxes();
        let a = client.seal(1, b"same payload").unwrap();
        let b = client.seal(2, b"same payload").unwrap();
        assert_ne!(a.as_bytes()[DATA_HEADER_LEN..], b.as_bytes()[DATA_HEADER_LEN..]);
    }

    #[test]
    fn test_tamper_detection() {
        let (client, server) = boxes();
        let frame = client.seal(9, b"Hello, World!").unwrap();

        for i in 0..frame.len() {
            for bit in 0..8 {
                let mut tampered = frame.as_bytes().to_vec();
                tampered[i] ^= 1 << bit;
                let result = server.open(&tampered);
                assert!(result.is_err(), "byte {} bit {} accepted", i, bit);
                if i > 0 {
                    // Byte 0 can flip into an unknown key id or opcode instead.
                    assert!(matches!(result, Err(CryptoError::Hmac)));
                }
            }
        }
    }

    #[test]
    fn test_truncated_frame() {
        let (_, server) = boxes();
        assert!(matches!(
            server.open(&[0u8; 10]),
            Err(CryptoError::Truncated(10))
        ));
    }

    #[test]
    fn test_empty_plaintext() {
        let (client, server) = boxes();
        let frame = client.seal(0, &[]).unwrap();
        assert_eq!(frame.len(), CryptoBox::frame_len(0));
        let (_, decrypted) = server.open(frame.as_bytes()).unwrap();
        assert!(decrypted.is_empty());
    }
}
