//! Data path: between tunnel packets and data-channel frames
//!
//! Inner payload handed to the crypto layer:
//! ```text
//! +------------------+-----------------+----------------------+
//! | length (2B, BE)  | packet          | padding (random)     |
//! +------------------+-----------------+----------------------+
//! ```
//!
//! Size bounds are checked before any crypto runs, in both directions.

mod padding;
mod stats;

pub use padding::{PaddingConfig, PaddingMode};
pub use stats::{DataPathStats, StatsSnapshot};

use crate::crypto::{CryptoError, DataChannel, SharedRandom, TAG_LEN};
use crate::protocol::DATA_HEADER_LEN;
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Length prefix of the inner payload
pub const LENGTH_PREFIX_LEN: usize = 2;

/// Keepalive payload, recognised on receipt and never delivered
pub const PING_MAGIC: [u8; 16] = [
    0x2a, 0x18, 0x7b, 0xf3, 0x64, 0x1e, 0xb4, 0xcb, 0x07, 0xed, 0x2d, 0x0a, 0x98, 0x1f, 0xc7, 0x48,
];

/// Packet direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Outbound => f.write_str("outbound"),
            Direction::Inbound => f.write_str("inbound"),
        }
    }
}

/// Data path errors
#[derive(Debug, Error)]
pub enum DataPathError {
    #[error("{direction} packet of {len} bytes exceeds limit of {max}")]
    Overflow {
        direction: Direction,
        len: usize,
        max: usize,
    },

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("Malformed inner payload: {0}")]
    Malformed(&'static str),
}

/// Per-packet encryption as seen by the data path
pub trait PacketCrypto {
    fn encrypt(&mut self, plaintext: &[u8]) -> Result<Bytes, CryptoError>;
    fn decrypt(&mut self, frame: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

impl PacketCrypto for DataChannel {
    fn encrypt(&mut self, plaintext: &[u8]) -> Result<Bytes, CryptoError> {
        DataChannel::encrypt(self, plaintext).map(|frame| frame.into_bytes())
    }

    fn decrypt(&mut self, frame: &[u8]) -> Result<Vec<u8>, CryptoError> {
        DataChannel::decrypt(self, frame)
    }
}

/// Result of a successful inbound decode
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// A tunnel packet for the OS
    Packet(Bytes),
    /// Peer keepalive
    Keepalive,
}

/// Frames packets for the data channel
pub struct DataPath {
    max_payload: usize,
    padding: PaddingConfig,
    random: SharedRandom,
    stats: Arc<DataPathStats>,
}

impl DataPath {
    /// `max_payload` is the largest tunnel packet accepted, usually the MTU
    pub fn new(max_payload: usize, padding: PaddingConfig, random: SharedRandom) -> Self {
        let max_payload = max_payload.min(usize::from(u16::MAX));
        Self {
            max_payload,
            padding,
            random,
            stats: Arc::new(DataPathStats::default()),
        }
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    pub fn set_max_payload(&mut self, max_payload: usize) {
        self.max_payload = max_payload.min(usize::from(u16::MAX));
    }

    /// Largest frame the peer can legitimately send
    pub fn max_frame(&self) -> usize {
        DATA_HEADER_LEN + LENGTH_PREFIX_LEN + self.max_payload + self.padding.bound() + TAG_LEN
    }

    pub fn stats(&self) -> Arc<DataPathStats> {
        Arc::clone(&self.stats)
    }

    /// Encrypt one tunnel packet into a frame
    pub fn encapsulate<C: PacketCrypto>(
        &self,
        crypto: &mut C,
        packet: &[u8],
    ) -> Result<Bytes, DataPathError> {
        if packet.len() > self.max_payload {
            self.stats.overflow_out();
            tracing::debug!(len = packet.len(), max = self.max_payload, "outbound packet too large");
            return Err(DataPathError::Overflow {
                direction: Direction::Outbound,
                len: packet.len(),
                max: self.max_payload,
            });
        }
        let frame = self.seal(crypto, packet)?;
        self.stats.sent(packet.len());
        Ok(frame)
    }

    /// Encrypt a keepalive frame
    pub fn keepalive<C: PacketCrypto>(&self, crypto: &mut C) -> Result<Bytes, DataPathError> {
        let frame = self.seal(crypto, &PING_MAGIC)?;
        self.stats.keepalive_sent();
        Ok(frame)
    }

    fn seal<C: PacketCrypto>(&self, crypto: &mut C, packet: &[u8]) -> Result<Bytes, DataPathError> {
        let inner_len = LENGTH_PREFIX_LEN + packet.len();
        let pad = self.padding.calculate_padding(inner_len);

        let mut inner = BytesMut::with_capacity(inner_len + pad);
        // Bounded by max_payload <= u16::MAX.
        inner.put_u16(packet.len() as u16);
        inner.put_slice(packet);
        if pad > 0 {
            let padding = self.random.generate(pad)?;
            inner.put_slice(&padding);
        }

        Ok(crypto.encrypt(&inner)?)
    }

    /// Authenticate, decrypt and unframe one inbound frame
    ///
    /// Failed frames are counted by cause and the error returned; none of
    /// them are fatal.
    pub fn decapsulate<C: PacketCrypto>(
        &self,
        crypto: &mut C,
        frame: &[u8],
    ) -> Result<Delivery, DataPathError> {
        let max_frame = self.max_frame();
        if frame.len() > max_frame {
            self.stats.overflow_in();
            tracing::debug!(len = frame.len(), max = max_frame, "inbound frame too large");
            return Err(DataPathError::Overflow {
                direction: Direction::Inbound,
                len: frame.len(),
                max: max_frame,
            });
        }

        let inner = match crypto.decrypt(frame) {
            Ok(inner) => inner,
            Err(e) => {
                self.count_drop(&e);
                tracing::trace!(len = frame.len(), error = %e, "inbound frame dropped");
                return Err(e.into());
            }
        };

        let packet = match unframe(inner) {
            Ok(packet) => packet,
            Err(e) => {
                self.stats.dropped_malformed();
                return Err(e);
            }
        };

        if packet[..] == PING_MAGIC {
            self.stats.keepalive_received();
            tracing::trace!("keepalive received");
            return Ok(Delivery::Keepalive);
        }
        self.stats.received(packet.len());
        Ok(Delivery::Packet(packet))
    }

    fn count_drop(&self, err: &CryptoError) {
        match err {
            CryptoError::Hmac => self.stats.dropped_hmac(),
            CryptoError::Replay(_) => self.stats.dropped_replay(),
            CryptoError::UnknownKey(_) => self.stats.dropped_unknown_key(),
            CryptoError::Truncated(_) | CryptoError::MalformedHeader(_) => {
                self.stats.dropped_malformed()
            }
            _ => {}
        }
    }
}

fn unframe(inner: Vec<u8>) -> Result<Bytes, DataPathError> {
    if inner.len() < LENGTH_PREFIX_LEN {
        return Err(DataPathError::Malformed("missing length prefix"));
    }
    let len = usize::from(u16::from_be_bytes([inner[0], inner[1]]));
    if LENGTH_PREFIX_LEN + len > inner.len() {
        return Err(DataPathError::Malformed("length exceeds payload"));
    }
    Ok(Bytes::from(inner).slice(LENGTH_PREFIX_LEN..LENGTH_PREFIX_LEN + len))
}
