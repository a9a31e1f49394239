//! Random/key material provider
//!
//! Every consumer of randomness goes through [`RandomSource`] so that an
//! entropy failure surfaces as [`CryptoError::RandomGenerator`] instead of a
//! panic or a silently weaker fallback.

use super::CryptoError;
use ring::rand::{SecureRandom, SystemRandom};
use std::sync::Arc;
use zeroize::Zeroizing;

/// Source of cryptographically secure random bytes
pub trait RandomSource: Send + Sync {
    /// Fill `dest` completely or fail
    fn fill(&self, dest: &mut [u8]) -> Result<(), CryptoError>;

    /// Generate `n` random bytes
    fn generate(&self, n: usize) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let mut buf = Zeroizing::new(vec![0u8; n]);
        self.fill(&mut buf)?;
        Ok(buf)
    }
}

/// Shared handle to a random source
pub type SharedRandom = Arc<dyn RandomSource>;

/// OS-backed random source
pub struct SystemRandomSource {
    rng: SystemRandom,
}

impl SystemRandomSource {
    pub fn new() -> Self {
        Self {
            rng: SystemRandom::new(),
        }
    }

    /// Create a source and draw a `seed_len` sample from it
    ///
    /// Fails up front if the OS entropy source is unusable.
    pub fn probe(seed_len: usize) -> Result<Self, CryptoError> {
        let source = Self::new();
        source.generate(seed_len)?;
        tracing::trace!(seed_len, "system random source ready");
        Ok(source)
    }

    /// Convenience constructor returning a shared handle
    pub fn shared() -> SharedRandom {
        Arc::new(Self::new())
    }
}

impl Default for SystemRandomSource {
    fn default() -> Self {
        Self::new()
    }
}

impl RandomSource for SystemRandomSource {
    fn fill(&self, dest: &mut [u8]) -> Result<(), CryptoError> {
        self.rng.fill(dest).map_err(|_| {
            tracing::error!(len = dest.len(), "system random source failed");
            CryptoError::RandomGenerator(format!("unable to obtain {} random bytes", dest.len()))
        })
    }
}
