//! Integration tests for tunnelbox
//!
//! Runs a client and a server session against each other over an
//! in-memory link:
//! - negotiation and re-key
//! - packet delivery through the data path
//! - fatal and non-fatal failures

mod common;

use async_trait::async_trait;
use bytes::Bytes;
use common::{Pki, SERVER_NAME};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tunnelbox::control::CaTrustAnchor;
use tunnelbox::crypto::{CryptoError, KeyId, RandomSource, SharedRandom, SystemRandomSource};
use tunnelbox::session::{CloseReason, TlsSetup};
use tunnelbox::transport::{
    LinkError, LinkInterface, MemoryLink, MemoryTunnel, MemoryTunnelHandle,
};
use tunnelbox::{Config, ErrorKind, Session, SessionEvent, SessionHandle, SessionState};

const WAIT: Duration = Duration::from_secs(5);

struct Peer {
    handle: SessionHandle,
    events: UnboundedReceiver<SessionEvent>,
    tun: MemoryTunnelHandle,
    task: JoinHandle<tunnelbox::Result<()>>,
}

impl Peer {
    async fn next_event(&mut self) -> SessionEvent {
        timeout(WAIT, self.events.recv())
            .await
            .expect("timed out waiting for a session event")
            .expect("event channel closed")
    }

    async fn recv(&mut self) -> Bytes {
        timeout(WAIT, self.tun.recv())
            .await
            .expect("timed out waiting for a packet")
            .expect("tunnel closed")
    }

    async fn finish(self) -> tunnelbox::Result<()> {
        timeout(WAIT, self.task)
            .await
            .expect("session driver did not stop")
            .expect("session driver panicked")
    }
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.control.server_name = SERVER_NAME.to_string();
    config.session.tick_interval_ms = 20;
    config
}

fn spawn(
    config: &Config,
    tls: TlsSetup,
    random: SharedRandom,
    link: Arc<dyn LinkInterface>,
) -> Peer {
    let session = Session::new(config, tls, random, Instant::now()).unwrap();
    let (tun, tun_handle) = MemoryTunnel::new(config.data.mtu, 64);
    let (handle, events) = SessionHandle::new(session);
    let driver = handle.clone();
    let task = tokio::spawn(async move { driver.run(link, Arc::new(tun)).await });
    Peer {
        handle,
        events,
        tun: tun_handle,
        task,
    }
}

fn spawn_pair(client_ca: &CaTrustAnchor, pki: &Pki, client_random: SharedRandom) -> (Peer, Peer) {
    let config = test_config();
    let (client_link, server_link) = MemoryLink::pair(1024);
    let server = spawn(
        &config,
        TlsSetup::server(&pki.server, None).unwrap(),
        SystemRandomSource::shared(),
        Arc::new(server_link),
    );
    let client = spawn(
        &config,
        TlsSetup::client(client_ca, None, SERVER_NAME).unwrap(),
        client_random,
        Arc::new(client_link),
    );
    (client, server)
}

async fn established_pair() -> (Peer, Peer) {
    let pki = Pki::generate();
    let (mut client, mut server) = spawn_pair(&pki.ca, &pki, SystemRandomSource::shared());
    let initial = SessionEvent::Established {
        key_id: KeyId::INITIAL,
    };
    assert_eq!(client.next_event().await, initial);
    assert_eq!(server.next_event().await, initial);
    (client, server)
}

/// Random source that fails once its fill budget is spent
struct FailingRandom {
    fills_left: AtomicUsize,
    inner: SystemRandomSource,
}

impl RandomSource for FailingRandom {
    fn fill(&self, dest: &mut [u8]) -> Result<(), CryptoError> {
        let left = self.fills_left.load(Ordering::SeqCst);
        if left == 0 {
            return Err(CryptoError::RandomGenerator("no entropy".to_string()));
        }
        self.fills_left.store(left - 1, Ordering::SeqCst);
        self.inner.fill(dest)
    }
}

/// Link whose first receives fail the way a refused UDP send surfaces
struct RefusingLink {
    refusals_left: AtomicUsize,
    inner: MemoryLink,
}

#[async_trait]
impl LinkInterface for RefusingLink {
    async fn push(&self, packet: Bytes) -> Result<(), LinkError> {
        self.inner.push(packet).await
    }

    async fn pull(&self) -> Result<Vec<Bytes>, LinkError> {
        let left = self.refusals_left.load(Ordering::SeqCst);
        if left > 0 {
            self.refusals_left.store(left - 1, Ordering::SeqCst);
            return Err(LinkError::Io(io::ErrorKind::ConnectionRefused.into()));
        }
        self.inner.pull().await
    }

    fn packet_buffer_size(&self) -> usize {
        self.inner.packet_buffer_size()
    }

    fn remote_address(&self) -> Option<SocketAddr> {
        self.inner.remote_address()
    }
}

#[tokio::test]
async fn test_session_establishes() {
    let (client, server) = established_pair().await;
    assert_eq!(client.handle.state().await, SessionState::Established);
    assert_eq!(server.handle.state().await, SessionState::Established);

    let client_id = client.handle.lock().await.local_session_id();
    assert_eq!(server.handle.lock().await.peer_session_id(), Some(client_id));

    client.handle.shutdown().await;
    server.handle.shutdown().await;
}

#[tokio::test]
async fn test_packets_flow_both_ways() {
    let (mut client, mut server) = established_pair().await;

    let outgoing = Bytes::from_static(b"\x45\x00 packet for the server");
    client.tun.send(outgoing.clone()).await.unwrap();
    assert_eq!(server.recv().await, outgoing);

    let reply = Bytes::from(vec![0x45; 1400]);
    server.tun.send(reply.clone()).await.unwrap();
    assert_eq!(client.recv().await, reply);

    let stats = client.handle.lock().await.stats();
    assert_eq!(stats.packets_out, 1);
    assert_eq!(stats.packets_in, 1);

    client.handle.shutdown().await;
    server.handle.shutdown().await;
}

#[tokio::test]
async fn test_rekey_on_request() {
    let (mut client, mut server) = established_pair().await;

    client.handle.request_rekey().await;
    let next = KeyId::new(1).unwrap();
    assert_eq!(client.next_event().await, SessionEvent::Rekeyed { key_id: next });
    assert_eq!(server.next_event().await, SessionEvent::Rekeyed { key_id: next });

    {
        let session = client.handle.lock().await;
        assert_eq!(session.current_key_id(), Some(next));
        assert_eq!(session.retiring_key_id(), Some(KeyId::INITIAL));
    }

    let packet = Bytes::from_static(b"after re-key");
    client.tun.send(packet.clone()).await.unwrap();
    assert_eq!(server.recv().await, packet);

    client.handle.shutdown().await;
    server.handle.shutdown().await;
}

#[tokio::test]
async fn test_untrusted_ca_is_fatal() {
    let pki = Pki::generate();
    let stranger = Pki::generate();
    let (mut client, server) = spawn_pair(&stranger.ca, &pki, SystemRandomSource::shared());

    assert_eq!(
        client.next_event().await,
        SessionEvent::Failed(ErrorKind::TlsCa)
    );
    assert_eq!(
        client.handle.state().await,
        SessionState::Failed(ErrorKind::TlsCa)
    );
    assert_eq!(client.handle.lock().await.current_key_id(), None);

    let err = client.finish().await.unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::TlsCa));
    assert!(err.is_fatal());

    server.handle.shutdown().await;
}

#[tokio::test]
async fn test_oversized_packet_is_dropped() {
    let (mut client, mut server) = established_pair().await;

    client.tun.send(Bytes::from(vec![0u8; 1500])).await.unwrap();
    let packet = Bytes::from_static(b"still up");
    client.tun.send(packet.clone()).await.unwrap();
    assert_eq!(server.recv().await, packet);

    assert_eq!(client.handle.state().await, SessionState::Established);
    assert_eq!(client.handle.lock().await.stats().overflow_out, 1);

    client.handle.shutdown().await;
    server.handle.shutdown().await;
}

#[tokio::test]
async fn test_random_failure_is_fatal() {
    let pki = Pki::generate();
    // Enough for the session id only
    let random = Arc::new(FailingRandom {
        fills_left: AtomicUsize::new(1),
        inner: SystemRandomSource::new(),
    });
    let (mut client, server) = spawn_pair(&pki.ca, &pki, random);
    assert_eq!(
        client.next_event().await,
        SessionEvent::Established {
            key_id: KeyId::INITIAL
        }
    );

    // 2 + 13 bytes needs padding, which needs entropy
    client.tun.send(Bytes::from(vec![0u8; 13])).await.unwrap();
    assert_eq!(
        client.next_event().await,
        SessionEvent::Failed(ErrorKind::RandomGenerator)
    );
    let err = client.finish().await.unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::RandomGenerator));

    server.handle.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_closes_both_sides() {
    let (mut client, mut server) = established_pair().await;

    client.handle.shutdown().await;
    assert_eq!(client.handle.state().await, SessionState::Closed);
    assert_eq!(client.handle.lock().await.current_key_id(), None);
    assert_eq!(
        client.next_event().await,
        SessionEvent::Closed {
            reason: CloseReason::Local
        }
    );

    assert_eq!(
        server.next_event().await,
        SessionEvent::Closed {
            reason: CloseReason::Peer
        }
    );
    assert_eq!(server.handle.lock().await.current_key_id(), None);

    client.finish().await.unwrap();
    server.finish().await.unwrap();
}

#[tokio::test]
async fn test_refused_receive_keeps_session_alive() {
    let pki = Pki::generate();
    let config = test_config();
    let (client_link, server_link) = MemoryLink::pair(1024);
    let mut server = spawn(
        &config,
        TlsSetup::server(&pki.server, None).unwrap(),
        SystemRandomSource::shared(),
        Arc::new(server_link),
    );
    let mut client = spawn(
        &config,
        TlsSetup::client(&pki.ca, None, SERVER_NAME).unwrap(),
        SystemRandomSource::shared(),
        Arc::new(RefusingLink {
            refusals_left: AtomicUsize::new(3),
            inner: client_link,
        }),
    );

    let initial = SessionEvent::Established {
        key_id: KeyId::INITIAL,
    };
    assert_eq!(client.next_event().await, initial);
    assert_eq!(server.next_event().await, initial);

    let packet = Bytes::from_static(b"after refusals");
    server.tun.send(packet.clone()).await.unwrap();
    assert_eq!(client.recv().await, packet);

    client.handle.shutdown().await;
    server.handle.shutdown().await;
}

#[tokio::test]
async fn test_server_requested_rekey() {
    let (mut client, mut server) = established_pair().await;

    server.handle.request_rekey().await;
    let next = KeyId::new(1).unwrap();
    assert_eq!(server.next_event().await, SessionEvent::Rekeyed { key_id: next });
    assert_eq!(client.next_event().await, SessionEvent::Rekeyed { key_id: next });
    assert_eq!(server.handle.lock().await.current_key_id(), Some(next));

    client.handle.shutdown().await;
    server.handle.shutdown().await;
}

#[test]
fn test_tls_setup_from_config_files() {
    let pki = Pki::generate();
    let dir = tempfile::tempdir().unwrap();

    let mut config = test_config();
    config.control.ca_file = Some(pki.write_ca(dir.path()));
    let path = dir.path().join("tunnelbox.toml");
    config.save(&path).unwrap();

    let loaded = Config::load(&path).unwrap();
    assert_eq!(loaded, config);
    let setup = TlsSetup::from_config(&loaded.control).unwrap();
    assert!(matches!(setup, TlsSetup::Client { .. }));

    let mut missing = loaded.control.clone();
    missing.ca_file = None;
    assert!(TlsSetup::from_config(&missing).is_err());
}
