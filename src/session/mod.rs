//! Session: one tunnel instance
//!
//! Ties a control channel negotiation to the data channel it keys and to
//! the data path that carries tunnel packets. The [`Session`] itself is
//! synchronous and takes the current time as an argument; the async
//! [`SessionHandle`] drives it from a link and a packet tunnel.
//!
//! Everything a call wants sent to the peer is queued and collected with
//! [`Session::poll_transmit`]; state changes are collected with
//! [`Session::poll_event`].

mod driver;

pub use driver::{SessionEvents, SessionHandle};

use crate::config::{Config, ControlConfig, SessionConfig};
use crate::control::{self, CaTrustAnchor, ControlChannel, TlsError, TlsIdentity};
use crate::crypto::{
    derive_key_set, CryptoError, DataChannel, KeyId, KeySlotInfo, Role, SharedRandom,
    MASTER_SECRET_LEN,
};
use crate::protocol::{
    packet_code, AckPacket, ControlPacket, ControlReassembler, ControlWriter, PacketCode,
    ProtocolError, SESSION_ID_LEN,
};
use crate::tunnel::{DataPath, DataPathError, DataPathStats, Delivery, StatsSnapshot};
use crate::{Error, ErrorKind, Result};
use bytes::Bytes;
use rustls::pki_types::ServerName;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, not started
    Idle,
    /// Waiting for the first negotiation to complete
    Negotiating,
    /// Data flows
    Established,
    /// Torn down
    Closed,
    /// Terminated by a fatal error
    Failed(ErrorKind),
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed(_))
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => f.write_str("idle"),
            SessionState::Negotiating => f.write_str("negotiating"),
            SessionState::Established => f.write_str("established"),
            SessionState::Closed => f.write_str("closed"),
            SessionState::Failed(kind) => write!(f, "failed ({})", kind),
        }
    }
}

/// Why a session closed without failing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed locally
    Local,
    /// Peer sent close_notify
    Peer,
    /// Nothing heard from the peer within the ping timeout
    PeerTimeout,
}

/// Notable session changes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// First key set installed
    Established { key_id: KeyId },
    /// A re-key negotiation installed a new key set
    Rekeyed { key_id: KeyId },
    /// The retiring key set was dropped
    KeyRetired { key_id: KeyId },
    Closed { reason: CloseReason },
    Failed(ErrorKind),
}

/// TLS side of the session
#[derive(Clone)]
pub enum TlsSetup {
    Client {
        config: Arc<rustls::ClientConfig>,
        server_name: ServerName<'static>,
    },
    Server {
        config: Arc<rustls::ServerConfig>,
    },
}

impl TlsSetup {
    /// Client trusting `anchor`, expecting a certificate for `server_name`
    pub fn client(
        anchor: &CaTrustAnchor,
        identity: Option<&TlsIdentity>,
        server_name: &str,
    ) -> Result<Self> {
        Ok(TlsSetup::Client {
            config: control::client_config(anchor, identity)?,
            server_name: control::server_name(server_name)?,
        })
    }

    /// Client built from the `[control]` configuration section
    pub fn from_config(config: &ControlConfig) -> Result<Self> {
        let ca_file = config.ca_file.as_ref().ok_or_else(|| {
            crate::config::ConfigError::Invalid("control.ca_file is required".to_string())
        })?;
        let anchor = CaTrustAnchor::from_pem_file(ca_file)?;
        let identity = match (&config.client_cert, &config.client_key) {
            (Some(cert), Some(key)) => Some(TlsIdentity::from_pem_files(cert, key)?),
            _ => None,
        };
        Self::client(&anchor, identity.as_ref(), &config.server_name)
    }

    /// Server presenting `identity`, optionally requiring client certificates
    pub fn server(identity: &TlsIdentity, client_ca: Option<&CaTrustAnchor>) -> Result<Self> {
        Ok(TlsSetup::Server {
            config: control::server_config(identity, client_ca)?,
        })
    }

    pub fn role(&self) -> Role {
        match self {
            TlsSetup::Client { .. } => Role::Client,
            TlsSetup::Server { .. } => Role::Server,
        }
    }

    fn channel(&self, key_id: KeyId) -> std::result::Result<ControlChannel, TlsError> {
        match self {
            TlsSetup::Client {
                config,
                server_name,
            } => ControlChannel::client(Arc::clone(config), server_name.clone(), key_id),
            TlsSetup::Server { config } => ControlChannel::server(Arc::clone(config), key_id),
        }
    }
}

/// One control channel exchange and its packet bookkeeping
struct Negotiation {
    control: ControlChannel,
    writer: ControlWriter,
    reassembler: ControlReassembler,
    started_at: Instant,
    /// Anything heard from the peer for this key id
    answered: bool,
    soft: bool,
}

impl Negotiation {
    fn key_id(&self) -> KeyId {
        self.control.key_id()
    }
}

/// A tunnel session
pub struct Session {
    tls: TlsSetup,
    timers: SessionConfig,
    renegotiation_interval: Duration,
    rekey_after_bytes: Option<u64>,
    rekey_after_packets: Option<u64>,
    max_control_payload: usize,
    sensitive_logging: bool,
    local_id: [u8; SESSION_ID_LEN],
    peer_id: Option<[u8; SESSION_ID_LEN]>,
    state: SessionState,
    pending: Option<Negotiation>,
    control: Option<Negotiation>,
    channel: DataChannel,
    data_path: DataPath,
    outbox: Vec<Bytes>,
    events: VecDeque<SessionEvent>,
    last_inbound: Instant,
    last_outbound: Instant,
    last_negotiation: Option<Instant>,
    rekey_requested: bool,
    last_rekey_request: Option<Instant>,
}

impl Session {
    /// Create a session; fails if the random source cannot produce a session id
    pub fn new(config: &Config, tls: TlsSetup, random: SharedRandom, now: Instant) -> Result<Self> {
        let id = random.generate(SESSION_ID_LEN)?;
        let mut local_id = [0u8; SESSION_ID_LEN];
        local_id.copy_from_slice(&id);

        let data_path = DataPath::new(config.data.mtu, config.data.padding.clone(), random);
        let channel = DataChannel::new(
            config.data.replay_protection,
            config.session.soft_connection_timeout(),
        );

        tracing::debug!(role = ?tls.role(), session_id = %hex(&local_id), "session created");
        Ok(Self {
            tls,
            timers: config.session.clone(),
            renegotiation_interval: config.data.renegotiation_interval(),
            rekey_after_bytes: config.data.rekey_after_bytes,
            rekey_after_packets: config.data.rekey_after_packets,
            max_control_payload: config.control.max_control_payload,
            sensitive_logging: config.logging.sensitive,
            local_id,
            peer_id: None,
            state: SessionState::Idle,
            pending: None,
            control: None,
            channel,
            data_path,
            outbox: Vec::new(),
            events: VecDeque::new(),
            last_inbound: now,
            last_outbound: now,
            last_negotiation: None,
            rekey_requested: false,
            last_rekey_request: None,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn role(&self) -> Role {
        self.tls.role()
    }

    pub fn local_session_id(&self) -> [u8; SESSION_ID_LEN] {
        self.local_id
    }

    pub fn peer_session_id(&self) -> Option<[u8; SESSION_ID_LEN]> {
        self.peer_id
    }

    pub fn current_key_id(&self) -> Option<KeyId> {
        self.channel.current_key_id()
    }

    pub fn retiring_key_id(&self) -> Option<KeyId> {
        self.channel.retiring_key_id()
    }

    pub fn is_rekeying(&self) -> bool {
        self.pending.as_ref().map(|n| n.soft).unwrap_or(false)
    }

    pub fn key_info(&self, now: Instant) -> (Option<KeySlotInfo>, Option<KeySlotInfo>) {
        (self.channel.current_info(now), self.channel.retiring_info(now))
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.data_path.stats().snapshot()
    }

    pub fn stats_handle(&self) -> Arc<DataPathStats> {
        self.data_path.stats()
    }

    pub fn tick_interval(&self) -> Duration {
        self.timers.tick_interval()
    }

    /// Largest tunnel packet accepted for sending
    pub fn max_payload(&self) -> usize {
        self.data_path.max_payload()
    }

    /// Lower the payload bound to the tunnel's MTU
    pub fn clamp_mtu(&mut self, mtu: usize) {
        if mtu < self.data_path.max_payload() {
            tracing::debug!(mtu, "payload bound lowered to tunnel MTU");
            self.data_path.set_max_payload(mtu);
        }
    }

    /// Packets queued for the peer
    pub fn poll_transmit(&mut self) -> Vec<Bytes> {
        std::mem::take(&mut self.outbox)
    }

    pub fn poll_event(&mut self) -> Option<SessionEvent> {
        self.events.pop_front()
    }

    /// Begin the session; the client sends its hard reset
    pub fn start(&mut self, now: Instant) -> Result<()> {
        if self.state != SessionState::Idle {
            return Err(self.invalid_state("start"));
        }
        self.state = SessionState::Negotiating;
        self.last_inbound = now;
        if self.role() == Role::Client {
            if let Err(e) = self.begin_negotiation(KeyId::INITIAL, PacketCode::HardReset, now) {
                return Err(self.escalate(e));
            }
        }
        tracing::info!(role = ?self.role(), "session started");
        Ok(())
    }

    /// Ask for a re-key at the next tick
    ///
    /// A client opens the negotiation itself; a server asks the client to.
    pub fn request_rekey(&mut self) {
        self.rekey_requested = true;
    }

    /// Drop the retiring key set ahead of its grace period
    pub fn retire_previous_key(&mut self) {
        if let Some(key_id) = self.channel.retire_previous() {
            self.events.push_back(SessionEvent::KeyRetired { key_id });
        }
    }

    /// Process one packet from the link
    ///
    /// Returns a tunnel packet when one was decrypted. Per-packet failures
    /// come back as non-fatal errors; fatal ones also fail the session.
    pub fn handle_inbound(&mut self, packet: Bytes, now: Instant) -> Result<Option<Bytes>> {
        if self.state.is_terminal() {
            return Err(Error::SessionClosed);
        }
        let (code, _) = packet_code(&packet)?;
        match code {
            PacketCode::Data => return self.handle_data(&packet, now),
            PacketCode::Ack => {
                self.handle_ack(AckPacket::decode(packet)?, now)?;
                return Ok(None);
            }
            _ => {}
        }
        let packet = ControlPacket::decode(packet)?;
        match self.handle_control(packet, now) {
            Ok(()) => Ok(None),
            Err(e) => Err(self.escalate(e)),
        }
    }

    /// Encrypt one tunnel packet for the peer
    pub fn handle_outbound(&mut self, packet: &[u8], now: Instant) -> Result<()> {
        if self.state.is_terminal() {
            return Err(Error::SessionClosed);
        }
        if !self.channel.is_keyed() {
            return Err(self.invalid_state("send data"));
        }
        match self.data_path.encapsulate(&mut self.channel, packet) {
            Ok(frame) => {
                self.outbox.push(frame);
                self.last_outbound = now;
                Ok(())
            }
            Err(e) => {
                if let DataPathError::Crypto(CryptoError::SequenceExhausted(key_id)) = &e {
                    tracing::warn!(key_id, "sequence space exhausted, re-key required");
                    self.rekey_requested = true;
                }
                Err(self.escalate(e.into()))
            }
        }
    }

    /// Run timers: negotiation timeouts, re-key triggers, key retirement, keepalive
    pub fn tick(&mut self, now: Instant) -> Result<()> {
        if self.state.is_terminal() {
            return Ok(());
        }
        if let Err(e) = self.tick_negotiation(now) {
            return Err(self.escalate(e));
        }
        if self.state != SessionState::Established {
            return Ok(());
        }

        if let Some(key_id) = self.channel.expire_retiring(now) {
            self.events.push_back(SessionEvent::KeyRetired { key_id });
        }

        if now.saturating_duration_since(self.last_inbound) >= self.timers.ping_timeout() {
            tracing::warn!(silence = ?now.saturating_duration_since(self.last_inbound), "peer timed out");
            self.terminate(CloseReason::PeerTimeout);
            return Ok(());
        }

        if self.pending.is_none() && self.rekey_due(now) {
            let key_id = self
                .channel
                .current_key_id()
                .map(KeyId::next)
                .unwrap_or(KeyId::INITIAL);
            match self.role() {
                Role::Client => {
                    tracing::info!(%key_id, "re-key started");
                    if let Err(e) = self.begin_negotiation(key_id, PacketCode::SoftReset, now) {
                        return Err(self.escalate(e));
                    }
                }
                Role::Server => self.send_rekey_request(key_id, now),
            }
        }

        if now.saturating_duration_since(self.last_outbound) >= self.timers.ping_interval() {
            match self.data_path.keepalive(&mut self.channel) {
                Ok(frame) => {
                    self.outbox.push(frame);
                    self.last_outbound = now;
                }
                Err(e) => return Err(self.escalate(e.into())),
            }
        }
        Ok(())
    }

    /// Close the session, queueing close_notify for the peer
    pub fn close(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        let now = Instant::now();
        for negotiation in [self.pending.as_mut(), self.control.as_mut()]
            .into_iter()
            .flatten()
        {
            if let Ok(bytes) = negotiation.control.close() {
                if !bytes.is_empty() {
                    self.outbox.extend(negotiation.writer.packetize(&bytes, now));
                }
            }
        }
        self.terminate(CloseReason::Local);
    }

    fn handle_data(&mut self, frame: &[u8], now: Instant) -> Result<Option<Bytes>> {
        if !self.channel.is_keyed() {
            return Err(CryptoError::NoActiveKey.into());
        }
        match self.data_path.decapsulate(&mut self.channel, frame) {
            Ok(delivery) => {
                self.last_inbound = now;
                Ok(match delivery {
                    Delivery::Packet(packet) => Some(packet),
                    Delivery::Keepalive => None,
                })
            }
            Err(e) => Err(self.escalate(e.into())),
        }
    }

    fn handle_ack(&mut self, ack: AckPacket, now: Instant) -> Result<()> {
        self.check_peer(PacketCode::Ack, ack.key_id, &ack.session_id)?;
        let mut matched = false;
        for negotiation in [self.pending.as_mut(), self.control.as_mut()]
            .into_iter()
            .flatten()
            .filter(|n| n.key_id() == ack.key_id)
        {
            negotiation.answered = true;
            negotiation.writer.acknowledge(&ack.packet_ids);
            matched = true;
        }
        if !matched {
            tracing::trace!(key_id = %ack.key_id, "acknowledgement for unknown key id ignored");
        }
        self.last_inbound = now;
        Ok(())
    }

    fn handle_control(&mut self, packet: ControlPacket, now: Instant) -> Result<()> {
        self.check_peer(packet.code, packet.key_id, &packet.session_id)?;
        let key_id = packet.key_id;

        if packet.code == PacketCode::RekeyRequest {
            return self.handle_rekey_request(key_id, now);
        }

        if self.pending.as_ref().map(Negotiation::key_id) == Some(key_id) {
            return self.feed_pending(packet, now);
        }
        if self.control.as_ref().map(Negotiation::key_id) == Some(key_id) {
            return self.feed_completed(packet, now);
        }

        // Server side: the client opens every negotiation.
        let opens = match packet.code {
            PacketCode::HardReset => {
                key_id == KeyId::INITIAL && !self.channel.is_keyed() && self.pending.is_none()
            }
            PacketCode::SoftReset => {
                self.pending.is_none()
                    && self.channel.current_key_id().map(KeyId::next) == Some(key_id)
            }
            _ => false,
        };
        if self.role() == Role::Server && opens && packet.packet_id == 0 {
            tracing::info!(%key_id, soft = packet.code == PacketCode::SoftReset, "peer opened negotiation");
            self.begin_negotiation(key_id, packet.code, now)?;
            return self.feed_pending(packet, now);
        }

        tracing::debug!(%key_id, code = ?packet.code, "unexpected control packet dropped");
        Err(ProtocolError::UnexpectedKey(key_id.value()).into())
    }

    /// Client side: the server wants the next key negotiated
    fn handle_rekey_request(&mut self, key_id: KeyId, now: Instant) -> Result<()> {
        let wanted = self.role() == Role::Client
            && self.state == SessionState::Established
            && self.pending.is_none()
            && self.channel.current_key_id().map(KeyId::next) == Some(key_id);
        if !wanted {
            tracing::debug!(%key_id, "re-key request ignored");
            return Ok(());
        }
        tracing::info!(%key_id, "re-key started at peer request");
        self.last_inbound = now;
        self.begin_negotiation(key_id, PacketCode::SoftReset, now)
    }

    /// Server side: ask the client to open negotiation `key_id`
    fn send_rekey_request(&mut self, key_id: KeyId, now: Instant) {
        let due = self.last_rekey_request.map_or(true, |last| {
            now.saturating_duration_since(last) >= self.timers.hard_reset_timeout()
        });
        if !due {
            return;
        }
        tracing::info!(%key_id, "asking peer to re-key");
        self.outbox
            .push(ControlPacket::rekey_request(key_id, self.local_id).encode());
        self.last_rekey_request = Some(now);
    }

    fn check_peer(
        &mut self,
        code: PacketCode,
        key_id: KeyId,
        session_id: &[u8; SESSION_ID_LEN],
    ) -> Result<()> {
        match self.peer_id {
            Some(id) if id == *session_id => Ok(()),
            Some(_) => Err(ProtocolError::SessionMismatch.into()),
            None => {
                let first = match self.role() {
                    Role::Server => code == PacketCode::HardReset && key_id == KeyId::INITIAL,
                    Role::Client => {
                        key_id == KeyId::INITIAL
                            && self.pending.as_ref().map(Negotiation::key_id)
                                == Some(KeyId::INITIAL)
                    }
                };
                if !first {
                    return Err(ProtocolError::SessionMismatch.into());
                }
                tracing::debug!(peer_session_id = %hex(session_id), "peer session id learned");
                self.peer_id = Some(*session_id);
                Ok(())
            }
        }
    }

    fn begin_negotiation(&mut self, key_id: KeyId, first_code: PacketCode, now: Instant) -> Result<()> {
        let mut control = self.tls.channel(key_id)?;
        let first = control.start()?;
        let mut writer =
            ControlWriter::new(key_id, self.local_id, first_code, self.max_control_payload);
        if !first.is_empty() {
            self.outbox.extend(writer.packetize(&first, now));
        }

        self.pending = Some(Negotiation {
            control,
            writer,
            reassembler: ControlReassembler::new(),
            started_at: now,
            answered: false,
            soft: first_code == PacketCode::SoftReset,
        });
        self.last_negotiation = Some(now);
        self.rekey_requested = false;
        self.last_rekey_request = None;
        Ok(())
    }

    fn feed_pending(&mut self, packet: ControlPacket, now: Instant) -> Result<()> {
        let Some(negotiation) = self.pending.as_mut() else {
            return Ok(());
        };
        negotiation.answered = true;
        Self::feed(negotiation, &mut self.outbox, packet, now)?;
        self.last_inbound = now;

        if negotiation.control.is_established() {
            self.complete_negotiation(now)?;
        }
        Ok(())
    }

    fn feed_completed(&mut self, packet: ControlPacket, now: Instant) -> Result<()> {
        let Some(negotiation) = self.control.as_mut() else {
            return Ok(());
        };
        Self::feed(negotiation, &mut self.outbox, packet, now)?;
        self.last_inbound = now;

        if negotiation.control.state() == control::ControlState::Closed {
            tracing::info!(key_id = %negotiation.key_id(), "peer closed the session");
            self.terminate(CloseReason::Peer);
        }
        Ok(())
    }

    /// Reassemble, acknowledge and feed one control packet; replies go to `outbox`
    fn feed(
        negotiation: &mut Negotiation,
        outbox: &mut Vec<Bytes>,
        packet: ControlPacket,
        now: Instant,
    ) -> Result<()> {
        let packet_id = packet.packet_id;
        let payloads = negotiation.reassembler.accept(packet_id, packet.payload)?;
        // Duplicates too: the peer resends until it hears an ack.
        outbox.push(negotiation.writer.ack(vec![packet_id]));
        for payload in payloads {
            match negotiation.control.feed(&payload) {
                Ok(reply) => {
                    if !reply.is_empty() {
                        outbox.extend(negotiation.writer.packetize(&reply, now));
                    }
                }
                Err(e) => {
                    // Let the peer know why, if TLS queued an alert.
                    let alert = negotiation.control.take_output();
                    if !alert.is_empty() {
                        outbox.extend(negotiation.writer.packetize(&alert, now));
                    }
                    return Err(e.into());
                }
            }
            if negotiation.control.state() == control::ControlState::Closed {
                break;
            }
        }
        Ok(())
    }

    fn complete_negotiation(&mut self, now: Instant) -> Result<()> {
        let Some(negotiation) = self.pending.take() else {
            return Ok(());
        };
        let key_id = negotiation.key_id();
        let secret = negotiation.control.export_key_material(MASTER_SECRET_LEN)?;
        let keys = derive_key_set(&secret, self.role())
            .map_err(|e| TlsError::Generic(format!("key derivation: {}", e)))?;
        if self.sensitive_logging {
            tracing::trace!(%key_id, fingerprint = %keys.fingerprint(), "key set derived");
        }

        let first = !self.channel.is_keyed();
        self.channel.install(key_id, keys, now);
        self.control = Some(negotiation);

        if first {
            self.state = SessionState::Established;
            self.last_outbound = now;
            self.events.push_back(SessionEvent::Established { key_id });
            tracing::info!(%key_id, "session established");
        } else {
            self.events.push_back(SessionEvent::Rekeyed { key_id });
            tracing::info!(%key_id, retiring = ?self.channel.retiring_key_id(), "re-key complete");
        }
        Ok(())
    }

    /// Negotiation timeout and control packet retransmission
    ///
    /// An unanswered negotiation resends at the hard reset timeout, anything
    /// else still unacknowledged at the retransmission limit.
    fn tick_negotiation(&mut self, now: Instant) -> Result<()> {
        if let Some(negotiation) = self.pending.as_ref() {
            let timeout = if negotiation.soft {
                self.timers.soft_connection_timeout()
            } else {
                self.timers.connection_timeout()
            };
            if now.saturating_duration_since(negotiation.started_at) >= timeout {
                tracing::warn!(key_id = %negotiation.key_id(), ?timeout, "negotiation timed out");
                return Err(TlsError::Handshake("negotiation timed out".to_string()).into());
            }
        }

        for negotiation in [self.pending.as_mut(), self.control.as_mut()]
            .into_iter()
            .flatten()
        {
            let after = if negotiation.answered {
                self.timers.retransmission_limit()
            } else {
                self.timers.hard_reset_timeout()
            };
            let resend = negotiation.writer.retransmit(now, after);
            if !resend.is_empty() {
                tracing::debug!(
                    key_id = %negotiation.key_id(),
                    count = resend.len(),
                    "retransmitting control packets"
                );
                self.outbox.extend(resend);
            }
        }
        Ok(())
    }

    fn rekey_due(&self, now: Instant) -> bool {
        if self.rekey_requested {
            return true;
        }
        if let Some(last) = self.last_negotiation {
            if now.saturating_duration_since(last) < self.timers.soft_reset_delay() {
                return false;
            }
        }
        if self.channel.needs_rekey() {
            return true;
        }
        let Some(info) = self.channel.current_info(now) else {
            return false;
        };
        info.age >= self.renegotiation_interval
            || self.rekey_after_bytes.map_or(false, |limit| info.bytes_out >= limit)
            || self.rekey_after_packets.map_or(false, |limit| info.packets_out >= limit)
    }

    /// Fail the session on fatal errors; pass other errors through
    fn escalate(&mut self, err: Error) -> Error {
        if !err.is_fatal() || self.state.is_terminal() {
            return err;
        }
        let kind = err.kind().unwrap_or(ErrorKind::TlsGeneric);
        tracing::error!(error = %err, %kind, "session failed");
        self.drop_keys();
        self.state = SessionState::Failed(kind);
        self.events.push_back(SessionEvent::Failed(kind));
        err
    }

    fn terminate(&mut self, reason: CloseReason) {
        self.drop_keys();
        self.state = SessionState::Closed;
        self.events.push_back(SessionEvent::Closed { reason });
        tracing::info!(?reason, "session closed");
    }

    fn drop_keys(&mut self) {
        self.channel.clear();
        self.pending = None;
        self.control = None;
    }

    fn invalid_state(&self, operation: &'static str) -> Error {
        Error::InvalidState {
            operation,
            state: self.state,
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("role", &self.role())
            .field("state", &self.state)
            .field("current_key_id", &self.channel.current_key_id())
            .field("retiring_key_id", &self.channel.retiring_key_id())
            .finish()
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
