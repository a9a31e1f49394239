//! UDP link

use super::{LinkError, LinkInterface, DEFAULT_READ_BATCH};
use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use tokio::net::{ToSocketAddrs, UdpSocket};

/// Largest UDP payload over IPv4
const MAX_DATAGRAM: usize = 65_507;

/// Connected UDP socket
pub struct UdpLink {
    socket: UdpSocket,
    remote: SocketAddr,
    read_batch: usize,
    buffer_size: usize,
}

impl UdpLink {
    /// Bind `local` and connect to `remote`
    pub async fn connect<A: ToSocketAddrs, B: ToSocketAddrs>(
        local: A,
        remote: B,
    ) -> Result<Self, LinkError> {
        let socket = UdpSocket::bind(local).await?;
        socket.connect(remote).await?;
        Self::from_socket(socket)
    }

    /// Wrap an already connected socket
    pub fn from_socket(socket: UdpSocket) -> Result<Self, LinkError> {
        let remote = socket.peer_addr()?;
        tracing::debug!(local = ?socket.local_addr().ok(), %remote, "UDP link ready");
        Ok(Self {
            socket,
            remote,
            read_batch: DEFAULT_READ_BATCH,
            buffer_size: MAX_DATAGRAM,
        })
    }

    /// Maximum datagrams returned by one `pull`
    pub fn with_read_batch(mut self, read_batch: usize) -> Self {
        self.read_batch = read_batch.max(1);
        self
    }

    /// Receive buffer size per datagram
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.clamp(1, MAX_DATAGRAM);
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr, LinkError> {
        Ok(self.socket.local_addr()?)
    }
}

#[async_trait]
impl LinkInterface for UdpLink {
    async fn push(&self, packet: Bytes) -> Result<(), LinkError> {
        if packet.len() > MAX_DATAGRAM {
            return Err(LinkError::TooLarge(packet.len()));
        }
        self.socket.send(&packet).await?;
        Ok(())
    }

    async fn pull(&self) -> Result<Vec<Bytes>, LinkError> {
        let mut buf = vec![0u8; self.buffer_size];
        let mut packets = Vec::new();

        let n = self.socket.recv(&mut buf).await?;
        packets.push(Bytes::copy_from_slice(&buf[..n]));

        while packets.len() < self.read_batch {
            match self.socket.try_recv(&mut buf) {
                Ok(n) => packets.push(Bytes::copy_from_slice(&buf[..n])),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }
        tracing::trace!(count = packets.len(), "pulled datagrams");
        Ok(packets)
    }

    fn packet_buffer_size(&self) -> usize {
        self.buffer_size
    }

    fn remote_address(&self) -> Option<SocketAddr> {
        Some(self.remote)
    }
}
