//! Cryptographic primitives for the data channel
//!
//! This module provides:
//! - Secure random number generation (fallible, never silently weakened)
//! - HKDF-SHA256 expansion of the control-channel exporter secret
//! - Direction-scoped key sets, zeroed on drop
//! - The per-packet crypto box (ChaCha20-Poly1305 + HMAC-SHA256)
//! - Sliding replay windows
//! - The stateful data channel that rotates key sets on re-key

mod aead;
mod channel;
mod kdf;
mod keys;
mod random;
mod replay;

pub use aead::{CryptoBox, Frame};
pub use channel::{DataChannel, KeySlotInfo, SEQUENCE_SOFT_LIMIT};
pub use kdf::{derive_key_set, Hkdf};
pub use keys::{KeyId, KeySet, Role, CIPHER_KEY_LEN, IV_LEN};
pub use random::{RandomSource, SharedRandom, SystemRandomSource};
pub use replay::{ReplayWindow, REPLAY_WINDOW_SIZE};

#[cfg(test)]
pub(crate) use random::testing;

use thiserror::Error;

/// Length of a key slot in bytes (each of the four keys in a key set)
pub const KEY_SLOT_LEN: usize = 64;

/// Number of keys in a key set
pub const KEYS_COUNT: usize = 4;

/// Length of the HMAC key actually used from a slot (256-bit)
pub const HMAC_KEY_LEN: usize = 32;

/// Length of the AEAD nonce in bytes
pub const NONCE_LEN: usize = 12;

/// Length of the AEAD authentication tag in bytes
pub const AEAD_TAG_LEN: usize = 16;

/// Length of the outer HMAC-SHA256 tag in bytes
pub const HMAC_TAG_LEN: usize = 32;

/// Total per-frame authentication overhead
pub const TAG_LEN: usize = AEAD_TAG_LEN + HMAC_TAG_LEN;

/// Length of the secret exported from the control channel
pub const MASTER_SECRET_LEN: usize = 32;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Random generator failure: {0}")]
    RandomGenerator(String),

    #[error("HMAC verification failed")]
    Hmac,

    #[error("Replayed or stale sequence {0}")]
    Replay(u32),

    #[error("No key set for key id {0}")]
    UnknownKey(u8),

    #[error("Sequence space exhausted for key id {0}")]
    SequenceExhausted(u8),

    #[error("Frame too short: {0} bytes")]
    Truncated(usize),

    #[error("Malformed frame header: {0:#04x}")]
    MalformedHeader(u8),

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("No active key set")]
    NoActiveKey,
}

impl CryptoError {
    /// Whether the failure concerns a single packet only
    pub fn is_per_packet(&self) -> bool {
        matches!(
            self,
            CryptoError::Hmac
                | CryptoError::Replay(_)
                | CryptoError::UnknownKey(_)
                | CryptoError::Truncated(_)
                | CryptoError::MalformedHeader(_)
        )
    }
}
