//! Link and packet-tunnel boundaries
//!
//! The session engine never owns a socket or a tun device. It talks to:
//! - a [`LinkInterface`] carrying encoded frames to the peer (UDP, or an
//!   in-memory pair for tests)
//! - a [`PacketTunnel`] producing and consuming plaintext IP packets

mod memory;

#[cfg(feature = "udp")]
mod udp;

pub use memory::{MemoryLink, MemoryTunnel, MemoryTunnelHandle};

#[cfg(feature = "udp")]
pub use udp::UdpLink;

use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Datagrams read per batch
pub const DEFAULT_READ_BATCH: usize = 200;

/// Link and tunnel errors
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Link closed")]
    Closed,

    #[error("Packet of {0} bytes exceeds link buffer")]
    TooLarge(usize),
}

impl LinkError {
    /// Errors after which the link is still usable
    ///
    /// A connected UDP socket reports an ICMP unreachable from the peer as
    /// `ConnectionRefused` on the next receive.
    pub fn is_transient(&self) -> bool {
        match self {
            LinkError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionRefused | io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }
}

/// Packet-oriented link to the remote peer
#[async_trait]
pub trait LinkInterface: Send + Sync {
    /// Send one packet
    async fn push(&self, packet: Bytes) -> Result<(), LinkError>;

    /// Send several packets in order
    async fn push_many(&self, packets: Vec<Bytes>) -> Result<(), LinkError> {
        for packet in packets {
            self.push(packet).await?;
        }
        Ok(())
    }

    /// Wait for at least one packet, then return whatever else is ready
    async fn pull(&self) -> Result<Vec<Bytes>, LinkError>;

    /// Largest packet the link can deliver
    fn packet_buffer_size(&self) -> usize;

    /// Remote endpoint, when there is one
    fn remote_address(&self) -> Option<SocketAddr>;
}

/// OS-side packet tunnel
#[async_trait]
pub trait PacketTunnel: Send + Sync {
    /// Wait for outbound packets from the OS
    async fn read_packets(&self) -> Result<Vec<Bytes>, LinkError>;

    /// Deliver decrypted packets to the OS
    async fn write_packets(&self, packets: Vec<Bytes>) -> Result<(), LinkError>;

    /// Tunnel MTU; bounds the data path payload size
    fn mtu(&self) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_link_errors() {
        assert!(LinkError::Io(io::ErrorKind::ConnectionRefused.into()).is_transient());
        assert!(LinkError::Io(io::ErrorKind::Interrupted.into()).is_transient());
        assert!(!LinkError::Io(io::ErrorKind::PermissionDenied.into()).is_transient());
        assert!(!LinkError::Closed.is_transient());
        assert!(!LinkError::TooLarge(70_000).is_transient());
    }
}
