//! Protocol definitions and constants
//!
//! Every packet on the link starts with one op byte: the packet code in the
//! high five bits and the key id in the low three.
//!
//! Control packet format:
//! ```text
//! +----------------+---------------------+--------------------+-----------+
//! | op|key_id (1B) | session id (8B)     | packet id (4B, BE) | payload   |
//! +----------------+---------------------+--------------------+-----------+
//! ```
//!
//! Control packets are acknowledged by id and resent until acknowledged:
//! ```text
//! +----------------+---------------------+------------+----------------------+
//! | op|key_id (1B) | session id (8B)     | count (1B) | packet ids (4B each) |
//! +----------------+---------------------+------------+----------------------+
//! ```

use crate::crypto::KeyId;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid packet code: {0}")]
    InvalidPacketCode(u8),

    #[error("Packet too short: {0} bytes")]
    Truncated(usize),

    #[error("Unexpected session id")]
    SessionMismatch,

    #[error("Control packet {0} too far ahead of {1}")]
    OutOfWindow(u32, u32),

    #[error("Unexpected control packet for key id {0}")]
    UnexpectedKey(u8),

    #[error("Malformed acknowledgement: {0} ids in {1} bytes")]
    MalformedAck(usize, usize),
}

/// Length of a session id
pub const SESSION_ID_LEN: usize = 8;

/// Data frame header: op byte + 4-byte sequence
pub const DATA_HEADER_LEN: usize = 5;

/// Control packet header: op byte + session id + packet id
pub const CONTROL_HEADER_LEN: usize = 1 + SESSION_ID_LEN + 4;

/// Default maximum control payload per packet
pub const DEFAULT_MAX_CONTROL_PAYLOAD: usize = 1000;

/// Most packet ids one acknowledgement carries
pub const MAX_ACK_IDS: usize = u8::MAX as usize;

/// How far ahead of the next expected packet id the reassembler buffers
pub const CONTROL_REORDER_WINDOW: u32 = 64;

/// Packet codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketCode {
    /// First control packet of the initial negotiation
    HardReset = 0x01,
    /// First control packet of a re-key negotiation
    SoftReset = 0x02,
    /// Subsequent control channel (TLS) bytes
    Control = 0x03,
    /// Data channel frame
    Data = 0x04,
    /// Acknowledgement of control packet ids
    Ack = 0x05,
    /// Server asking the client to open a re-key negotiation
    RekeyRequest = 0x06,
}

impl TryFrom<u8> for PacketCode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(PacketCode::HardReset),
            0x02 => Ok(PacketCode::SoftReset),
            0x03 => Ok(PacketCode::Control),
            0x04 => Ok(PacketCode::Data),
            0x05 => Ok(PacketCode::Ack),
            0x06 => Ok(PacketCode::RekeyRequest),
            _ => Err(ProtocolError::InvalidPacketCode(value)),
        }
    }
}

impl PacketCode {
    /// Combine code and key id into the op byte
    pub fn op_byte(self, key_id: KeyId) -> u8 {
        ((self as u8) << 3) | key_id.value()
    }

    /// Split an op byte into code and key id
    pub fn split_op(op: u8) -> Result<(PacketCode, KeyId), ProtocolError> {
        let code = PacketCode::try_from(op >> 3)?;
        // Three low bits always fit a key id.
        let key_id = KeyId::new(op & 0x07).ok_or(ProtocolError::InvalidPacketCode(op))?;
        Ok((code, key_id))
    }

    /// Codes carried in a [`ControlPacket`]
    pub fn is_control(self) -> bool {
        !matches!(self, PacketCode::Data | PacketCode::Ack)
    }
}

/// Peek at the packet code of a raw link packet
pub fn packet_code(packet: &[u8]) -> Result<(PacketCode, KeyId), ProtocolError> {
    let op = *packet.first().ok_or(ProtocolError::Truncated(0))?;
    PacketCode::split_op(op)
}

/// A control channel packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPacket {
    pub code: PacketCode,
    pub key_id: KeyId,
    pub session_id: [u8; SESSION_ID_LEN],
    pub packet_id: u32,
    pub payload: Bytes,
}

impl ControlPacket {
    /// Empty request for the peer to open negotiation `key_id`
    pub fn rekey_request(key_id: KeyId, session_id: [u8; SESSION_ID_LEN]) -> Self {
        Self {
            code: PacketCode::RekeyRequest,
            key_id,
            session_id,
            packet_id: 0,
            payload: Bytes::new(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(CONTROL_HEADER_LEN + self.payload.len());
        buf.put_u8(self.code.op_byte(self.key_id));
        buf.put_slice(&self.session_id);
        buf.put_u32(self.packet_id);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, ProtocolError> {
        if buf.len() < CONTROL_HEADER_LEN {
            return Err(ProtocolError::Truncated(buf.len()));
        }
        let (code, key_id) = PacketCode::split_op(buf.get_u8())?;
        if !code.is_control() {
            return Err(ProtocolError::InvalidPacketCode(code as u8));
        }
        let mut session_id = [0u8; SESSION_ID_LEN];
        buf.copy_to_slice(&mut session_id);
        let packet_id = buf.get_u32();

        Ok(Self {
            code,
            key_id,
            session_id,
            packet_id,
            payload: buf,
        })
    }
}

/// Acknowledgement of received control packets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckPacket {
    pub key_id: KeyId,
    pub session_id: [u8; SESSION_ID_LEN],
    pub packet_ids: Vec<u32>,
}

impl AckPacket {
    pub fn encode(&self) -> Bytes {
        let ids = &self.packet_ids[..self.packet_ids.len().min(MAX_ACK_IDS)];
        let mut buf = BytesMut::with_capacity(1 + SESSION_ID_LEN + 1 + 4 * ids.len());
        buf.put_u8(PacketCode::Ack.op_byte(self.key_id));
        buf.put_slice(&self.session_id);
        buf.put_u8(ids.len() as u8);
        for id in ids {
            buf.put_u32(*id);
        }
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, ProtocolError> {
        if buf.len() < 1 + SESSION_ID_LEN + 1 {
            return Err(ProtocolError::Truncated(buf.len()));
        }
        let (code, key_id) = PacketCode::split_op(buf.get_u8())?;
        if code != PacketCode::Ack {
            return Err(ProtocolError::InvalidPacketCode(code as u8));
        }
        let mut session_id = [0u8; SESSION_ID_LEN];
        buf.copy_to_slice(&mut session_id);
        let count = usize::from(buf.get_u8());
        if buf.remaining() != 4 * count {
            return Err(ProtocolError::MalformedAck(count, buf.remaining()));
        }
        let packet_ids = (0..count).map(|_| buf.get_u32()).collect();

        Ok(Self {
            key_id,
            session_id,
            packet_ids,
        })
    }
}

#[derive(Debug)]
struct InFlight {
    packet: Bytes,
    sent_at: Instant,
}

/// Splits outbound control bytes into numbered packets
///
/// Every packet stays in flight until the peer acknowledges it.
#[derive(Debug)]
pub struct ControlWriter {
    key_id: KeyId,
    session_id: [u8; SESSION_ID_LEN],
    first_code: PacketCode,
    next_packet_id: u32,
    max_payload: usize,
    in_flight: BTreeMap<u32, InFlight>,
}

impl ControlWriter {
    /// `first_code` is used for packet id 0 (HardReset or SoftReset)
    pub fn new(
        key_id: KeyId,
        session_id: [u8; SESSION_ID_LEN],
        first_code: PacketCode,
        max_payload: usize,
    ) -> Self {
        Self {
            key_id,
            session_id,
            first_code,
            next_packet_id: 0,
            max_payload: max_payload.max(1),
            in_flight: BTreeMap::new(),
        }
    }

    /// Wrap `bytes` into as many packets as needed, sent at `now`
    pub fn packetize(&mut self, bytes: &[u8], now: Instant) -> Vec<Bytes> {
        bytes
            .chunks(self.max_payload)
            .map(|chunk| {
                let code = if self.next_packet_id == 0 {
                    self.first_code
                } else {
                    PacketCode::Control
                };
                let packet = ControlPacket {
                    code,
                    key_id: self.key_id,
                    session_id: self.session_id,
                    packet_id: self.next_packet_id,
                    payload: Bytes::copy_from_slice(chunk),
                };
                let encoded = packet.encode();
                self.in_flight.insert(
                    packet.packet_id,
                    InFlight {
                        packet: encoded.clone(),
                        sent_at: now,
                    },
                );
                self.next_packet_id = self.next_packet_id.wrapping_add(1);
                encoded
            })
            .collect()
    }

    /// Acknowledgement of `packet_ids` from this side
    pub fn ack(&self, packet_ids: Vec<u32>) -> Bytes {
        AckPacket {
            key_id: self.key_id,
            session_id: self.session_id,
            packet_ids,
        }
        .encode()
    }

    /// Stop resending acknowledged packets; returns how many were in flight
    pub fn acknowledge(&mut self, packet_ids: &[u32]) -> usize {
        packet_ids
            .iter()
            .filter(|id| self.in_flight.remove(*id).is_some())
            .count()
    }

    /// Packets unacknowledged for at least `after`, restamped as sent at `now`
    pub fn retransmit(&mut self, now: Instant, after: Duration) -> Vec<Bytes> {
        self.in_flight
            .values_mut()
            .filter(|p| now.saturating_duration_since(p.sent_at) >= after)
            .map(|p| {
                p.sent_at = now;
                p.packet.clone()
            })
            .collect()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn packets_sent(&self) -> u32 {
        self.next_packet_id
    }
}

/// Releases control payloads in packet id order
///
/// Duplicates and packets already released yield nothing (the caller still
/// acknowledges them); packets too far ahead are rejected.
#[derive(Debug, Default)]
pub struct ControlReassembler {
    next_expected: u32,
    pending: BTreeMap<u32, Bytes>,
}

impl ControlReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept a packet; returns the payloads now deliverable in order
    pub fn accept(&mut self, packet_id: u32, payload: Bytes) -> Result<Vec<Bytes>, ProtocolError> {
        if packet_id < self.next_expected {
            tracing::trace!(packet_id, "duplicate control packet ignored");
            return Ok(Vec::new());
        }
        if packet_id - self.next_expected >= CONTROL_REORDER_WINDOW {
            return Err(ProtocolError::OutOfWindow(packet_id, self.next_expected));
        }
        self.pending.entry(packet_id).or_insert(payload);

        let mut ready = Vec::new();
        while let Some(payload) = self.pending.remove(&self.next_expected) {
            ready.push(payload);
            self.next_expected += 1;
        }
        Ok(ready)
    }

    pub fn buffered(&self) -> usize {
        self.pending.len()
    }
}
