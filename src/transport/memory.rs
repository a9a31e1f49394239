//! In-memory link and tunnel

use super::{LinkError, LinkInterface, PacketTunnel, DEFAULT_READ_BATCH};
use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use tokio::sync::{mpsc, Mutex};

const MEMORY_BUFFER_SIZE: usize = 65_535;

async fn recv_batch(rx: &Mutex<mpsc::Receiver<Bytes>>) -> Result<Vec<Bytes>, LinkError> {
    let mut rx = rx.lock().await;
    let first = rx.recv().await.ok_or(LinkError::Closed)?;
    let mut packets = vec![first];
    while packets.len() < DEFAULT_READ_BATCH {
        match rx.try_recv() {
            Ok(packet) => packets.push(packet),
            Err(_) => break,
        }
    }
    Ok(packets)
}

/// One end of an in-memory link
pub struct MemoryLink {
    tx: mpsc::Sender<Bytes>,
    rx: Mutex<mpsc::Receiver<Bytes>>,
}

impl MemoryLink {
    /// Two connected ends, each buffering up to `capacity` packets
    pub fn pair(capacity: usize) -> (MemoryLink, MemoryLink) {
        let (a_tx, a_rx) = mpsc::channel(capacity);
        let (b_tx, b_rx) = mpsc::channel(capacity);
        (
            MemoryLink {
                tx: a_tx,
                rx: Mutex::new(b_rx),
            },
            MemoryLink {
                tx: b_tx,
                rx: Mutex::new(a_rx),
            },
        )
    }
}

#[async_trait]
impl LinkInterface for MemoryLink {
    async fn push(&self, packet: Bytes) -> Result<(), LinkError> {
        if packet.len() > MEMORY_BUFFER_SIZE {
            return Err(LinkError::TooLarge(packet.len()));
        }
        self.tx.send(packet).await.map_err(|_| LinkError::Closed)
    }

    async fn pull(&self) -> Result<Vec<Bytes>, LinkError> {
        recv_batch(&self.rx).await
    }

    fn packet_buffer_size(&self) -> usize {
        MEMORY_BUFFER_SIZE
    }

    fn remote_address(&self) -> Option<SocketAddr> {
        None
    }
}

/// In-memory packet tunnel
pub struct MemoryTunnel {
    outbound: Mutex<mpsc::Receiver<Bytes>>,
    delivered: mpsc::Sender<Bytes>,
    mtu: usize,
}

/// Test-side handle of a [`MemoryTunnel`]
pub struct MemoryTunnelHandle {
    outbound: mpsc::Sender<Bytes>,
    delivered: mpsc::Receiver<Bytes>,
}

impl MemoryTunnel {
    pub fn new(mtu: usize, capacity: usize) -> (MemoryTunnel, MemoryTunnelHandle) {
        let (out_tx, out_rx) = mpsc::channel(capacity);
        let (del_tx, del_rx) = mpsc::channel(capacity);
        (
            MemoryTunnel {
                outbound: Mutex::new(out_rx),
                delivered: del_tx,
                mtu,
            },
            MemoryTunnelHandle {
                outbound: out_tx,
                delivered: del_rx,
            },
        )
    }
}

#[async_trait]
impl PacketTunnel for MemoryTunnel {
    async fn read_packets(&self) -> Result<Vec<Bytes>, LinkError> {
        recv_batch(&self.outbound).await
    }

    async fn write_packets(&self, packets: Vec<Bytes>) -> Result<(), LinkError> {
        for packet in packets {
            self.delivered
                .send(packet)
                .await
                .map_err(|_| LinkError::Closed)?;
        }
        Ok(())
    }

    fn mtu(&self) -> usize {
        self.mtu
    }
}

impl MemoryTunnelHandle {
    /// Inject a packet as if the OS wanted it sent
    pub async fn send(&self, packet: Bytes) -> Result<(), LinkError> {
        self.outbound.send(packet).await.map_err(|_| LinkError::Closed)
    }

    /// Next packet delivered to the OS, `None` once the tunnel is gone
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.delivered.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_link_pair() {
        let (a, b) = MemoryLink::pair(16);
        a.push_many(vec![Bytes::from_static(b"x"), Bytes::from_static(b"y")])
            .await
            .unwrap();
        let packets = b.pull().await.unwrap();
        assert_eq!(packets, vec![Bytes::from_static(b"x"), Bytes::from_static(b"y")]);
        assert!(b.remote_address().is_none());

        drop(a);
        assert!(matches!(b.pull().await, Err(LinkError::Closed)));
    }

    #[tokio::test]
    async fn test_memory_tunnel() {
        let (tun, mut handle) = MemoryTunnel::new(1400, 8);
        assert_eq!(tun.mtu(), 1400);

        handle.send(Bytes::from_static(b"ip packet")).await.unwrap();
        assert_eq!(tun.read_packets().await.unwrap().len(), 1);

        tun.write_packets(vec![Bytes::from_static(b"reply")]).await.unwrap();
        assert_eq!(handle.recv().await.unwrap(), Bytes::from_static(b"reply"));
    }
}
