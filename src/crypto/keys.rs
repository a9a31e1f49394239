//! Key management for the data channel

use super::{CryptoError, HMAC_KEY_LEN, KEYS_COUNT, KEY_SLOT_LEN};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of the ChaCha20-Poly1305 key taken from a cipher slot
pub const CIPHER_KEY_LEN: usize = 32;

/// Length of the implicit IV taken from a cipher slot
pub const IV_LEN: usize = 12;

/// Which end of the tunnel we are
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    pub fn peer(self) -> Self {
        match self {
            Role::Client => Role::Server,
            Role::Server => Role::Client,
        }
    }
}

/// 3-bit key identifier carried in every data frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyId(u8);

impl KeyId {
    /// Key id used by the initial negotiation
    pub const INITIAL: KeyId = KeyId(0);

    /// Largest representable key id
    pub const MAX: u8 = 7;

    pub fn new(id: u8) -> Option<Self> {
        (id <= Self::MAX).then_some(Self(id))
    }

    pub fn value(self) -> u8 {
        self.0
    }

    /// Key id of the next soft reset (wraps 7 -> 1, 0 is never reused)
    pub fn next(self) -> Self {
        if self.0 >= Self::MAX {
            KeyId(1)
        } else {
            KeyId(self.0 + 1)
        }
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single 64-byte key slot
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
struct KeySlot([u8; KEY_SLOT_LEN]);

impl KeySlot {
    fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != KEY_SLOT_LEN {
            return Err(CryptoError::InvalidKeyLength);
        }
        let mut slot = [0u8; KEY_SLOT_LEN];
        slot.copy_from_slice(bytes);
        Ok(Self(slot))
    }
}

/// The four direction-scoped keys of one negotiation
///
/// Immutable once built. Dropping a key set zeroes every slot.
#[derive(Clone, ZeroizeOnDrop)]
pub struct KeySet {
    cipher_enc: KeySlot,
    hmac_enc: KeySlot,
    cipher_dec: KeySlot,
    hmac_dec: KeySlot,
}

impl KeySet {
    /// Build from explicit slots (each `KEY_SLOT_LEN` bytes)
    pub fn new(
        cipher_enc: &[u8],
        hmac_enc: &[u8],
        cipher_dec: &[u8],
        hmac_dec: &[u8],
    ) -> Result<Self, CryptoError> {
        Ok(Self {
            cipher_enc: KeySlot::from_slice(cipher_enc)?,
            hmac_enc: KeySlot::from_slice(hmac_enc)?,
            cipher_dec: KeySlot::from_slice(cipher_dec)?,
            hmac_dec: KeySlot::from_slice(hmac_dec)?,
        })
    }

    /// Build from `KEYS_COUNT * KEY_SLOT_LEN` bytes laid out as
    /// c2s cipher, c2s hmac, s2c cipher, s2c hmac
    ///
    /// The role picks which half encrypts.
    pub fn from_expanded(material: &[u8], role: Role) -> Result<Self, CryptoError> {
        if material.len() != KEYS_COUNT * KEY_SLOT_LEN {
            return Err(CryptoError::InvalidKeyLength);
        }
        let slot = |i: usize| &material[i * KEY_SLOT_LEN..(i + 1) * KEY_SLOT_LEN];
        match role {
            Role::Client => Self::new(slot(0), slot(1), slot(2), slot(3)),
            Role::Server => Self::new(slot(2), slot(3), slot(0), slot(1)),
        }
    }

    pub(crate) fn encrypt_cipher_key(&self) -> &[u8] {
        &self.cipher_enc.0[..CIPHER_KEY_LEN]
    }

    pub(crate) fn encrypt_iv(&self) -> &[u8] {
        &self.cipher_enc.0[CIPHER_KEY_LEN..CIPHER_KEY_LEN + IV_LEN]
    }

    pub(crate) fn encrypt_hmac_key(&self) -> &[u8] {
        &self.hmac_enc.0[..HMAC_KEY_LEN]
    }

    pub(crate) fn decrypt_cipher_key(&self) -> &[u8] {
        &self.cipher_dec.0[..CIPHER_KEY_LEN]
    }

    pub(crate) fn decrypt_iv(&self) -> &[u8] {
        &self.cipher_dec.0[CIPHER_KEY_LEN..CIPHER_KEY_LEN + IV_LEN]
    }

    pub(crate) fn decrypt_hmac_key(&self) -> &[u8] {
        &self.hmac_dec.0[..HMAC_KEY_LEN]
    }

    /// Short hex fingerprint of the outbound cipher key, for sensitive logging
    pub fn fingerprint(&self) -> String {
        self.cipher_enc.0[..4]
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }
}

impl fmt::Debug for KeySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeySet([REDACTED])")
    }
}
