//! Key Derivation Functions
//!
//! Provides HKDF-SHA256 for expanding the control-channel exporter secret
//! into the four data-channel keys

use super::{CryptoError, KeySet, Role, KEYS_COUNT, KEY_SLOT_LEN};
use ring::hkdf::{self, Salt, HKDF_SHA256};
use zeroize::Zeroizing;

/// HKDF expansion labels, in key set layout order
pub const KEY_EXPANSION_LABELS: [&[u8]; KEYS_COUNT] = [
    b"tunnelbox c2s cipher",
    b"tunnelbox c2s hmac",
    b"tunnelbox s2c cipher",
    b"tunnelbox s2c hmac",
];

/// HKDF salt bound to this key schedule
pub const KEY_EXPANSION_SALT: &[u8] = b"tunnelbox key expansion";

/// Extracted HKDF-SHA256 pseudorandom key
pub struct Hkdf {
    prk: hkdf::Prk,
}

impl Hkdf {
    pub fn new(salt: &[u8], ikm: &[u8]) -> Self {
        Self {
            prk: Salt::new(HKDF_SHA256, salt).extract(ikm),
        }
    }

    /// Fill `output` with key material for `info`
    pub fn expand(&self, info: &[u8], output: &mut [u8]) -> Result<(), CryptoError> {
        let len = output.len();
        let info = [info];
        self.prk
            .expand(&info, HkdfLen(len))
            .and_then(|okm| okm.fill(output))
            .map_err(|_| CryptoError::KeyDerivation(format!("cannot expand {} bytes", len)))
    }
}

struct HkdfLen(usize);

impl hkdf::KeyType for HkdfLen {
    fn len(&self) -> usize {
        self.0
    }
}

/// Derive a key set from the exported master secret
///
/// Both peers run this with the same secret; `role` selects which
/// direction's keys encrypt locally.
pub fn derive_key_set(master_secret: &[u8], role: Role) -> Result<KeySet, CryptoError> {
    if master_secret.is_empty() {
        return Err(CryptoError::KeyDerivation("empty master secret".to_string()));
    }
    let hkdf = Hkdf::new(KEY_EXPANSION_SALT, master_secret);

    let mut material = Zeroizing::new(vec![0u8; KEYS_COUNT * KEY_SLOT_LEN]);
    for (i, label) in KEY_EXPANSION_LABELS.iter().enumerate() {
        hkdf.expand(label, &mut material[i * KEY_SLOT_LEN..(i + 1) * KEY_SLOT_LEN])?;
    }

    KeySet::from_expanded(&material, role)
}
