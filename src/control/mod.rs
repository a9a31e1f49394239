//! Control channel: TLS driven over caller-supplied buffers
//!
//! The channel never touches a socket. Peer bytes go in through
//! [`ControlChannel::feed`], bytes for the peer come back out, and once
//! the handshake completes the data-channel master secret is taken from
//! the TLS exporter.
//!
//! ```text
//! Idle --start--> Handshaking --feed--> Established --close--> Closed
//!                      |
//!                      +--error--> Failed
//! ```

mod trust;

pub use trust::{CaTrustAnchor, TlsIdentity};

use crate::crypto::KeyId;
use rustls::pki_types::ServerName;
use rustls::server::WebPkiClientVerifier;
use rustls::{
    AlertDescription, ClientConfig, ClientConnection, Connection, ServerConfig,
    ServerConnection,
};
use std::fmt;
use std::io::Read;
use std::sync::Arc;
use thiserror::Error;
use zeroize::Zeroizing;

/// Exporter label for the data channel master secret
pub const EXPORTER_LABEL: &[u8] = b"EXPORTER-tunnelbox-data-channel";

/// TLS errors, split by cause
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TlsError {
    #[error("Certificate rejected: {0}")]
    Ca(String),

    #[error("TLS handshake failed: {0}")]
    Handshake(String),

    #[error("TLS error: {0}")]
    Generic(String),

    #[error("TLS random generator failure")]
    RandomGenerator,

    #[error("Cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: ControlState,
    },
}

/// Control channel state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    Idle,
    Handshaking,
    Established,
    Closed,
    Failed,
}

impl fmt::Display for ControlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControlState::Idle => "idle",
            ControlState::Handshaking => "handshaking",
            ControlState::Established => "established",
            ControlState::Closed => "closed",
            ControlState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Map a rustls error onto the control channel taxonomy
pub(crate) fn classify(err: &rustls::Error) -> TlsError {
    use rustls::Error as E;
    match err {
        E::InvalidCertificate(_)
        | E::NoCertificatesPresented
        | E::InvalidCertRevocationList(_)
        | E::UnsupportedNameType => TlsError::Ca(err.to_string()),
        E::AlertReceived(alert) if is_certificate_alert(*alert) => TlsError::Ca(err.to_string()),
        E::InappropriateMessage { .. }
        | E::InappropriateHandshakeMessage { .. }
        | E::InvalidMessage(_)
        | E::PeerIncompatible(_)
        | E::PeerMisbehaved(_)
        | E::DecryptError
        | E::HandshakeNotComplete
        | E::PeerSentOversizedRecord
        | E::NoApplicationProtocol
        | E::AlertReceived(_) => TlsError::Handshake(err.to_string()),
        E::FailedToGetRandomBytes => TlsError::RandomGenerator,
        _ => TlsError::Generic(err.to_string()),
    }
}

fn is_certificate_alert(alert: AlertDescription) -> bool {
    matches!(
        alert,
        AlertDescription::BadCertificate
            | AlertDescription::UnsupportedCertificate
            | AlertDescription::CertificateRevoked
            | AlertDescription::CertificateExpired
            | AlertDescription::CertificateUnknown
            | AlertDescription::UnknownCA
            | AlertDescription::CertificateRequired
    )
}

/// Client TLS configuration trusting only `anchor`
pub fn client_config(
    anchor: &CaTrustAnchor,
    identity: Option<&TlsIdentity>,
) -> Result<Arc<ClientConfig>, TlsError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| TlsError::Generic(e.to_string()))?
        .with_root_certificates(anchor.root_store());

    let config = match identity {
        Some(identity) => builder
            .with_client_auth_cert(identity.chain.clone(), identity.key.clone_key())
            .map_err(|e| TlsError::Generic(format!("client certificate: {}", e)))?,
        None => builder.with_no_client_auth(),
    };
    Ok(Arc::new(config))
}

/// Server TLS configuration, optionally requiring client certificates from `client_ca`
pub fn server_config(
    identity: &TlsIdentity,
    client_ca: Option<&CaTrustAnchor>,
) -> Result<Arc<ServerConfig>, TlsError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ServerConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| TlsError::Generic(e.to_string()))?;

    let builder = match client_ca {
        Some(anchor) => {
            let verifier = WebPkiClientVerifier::builder_with_provider(anchor.root_store(), provider)
                .build()
                .map_err(|e| TlsError::Ca(e.to_string()))?;
            builder.with_client_cert_verifier(verifier)
        }
        None => builder.with_no_client_auth(),
    };

    let config = builder
        .with_single_cert(identity.chain.clone(), identity.key.clone_key())
        .map_err(|e| TlsError::Generic(format!("server certificate: {}", e)))?;
    Ok(Arc::new(config))
}

/// Parse a server name for certificate validation
pub fn server_name(name: &str) -> Result<ServerName<'static>, TlsError> {
    ServerName::try_from(name.to_string())
        .map_err(|_| TlsError::Generic(format!("invalid server name: {}", name)))
}

/// One TLS negotiation, bound to the key id it will produce keys for
pub struct ControlChannel {
    conn: Connection,
    key_id: KeyId,
    state: ControlState,
}

impl ControlChannel {
    /// TLS client side
    pub fn client(
        config: Arc<ClientConfig>,
        server_name: ServerName<'static>,
        key_id: KeyId,
    ) -> Result<Self, TlsError> {
        let conn = ClientConnection::new(config, server_name).map_err(|e| classify(&e))?;
        Ok(Self::with_connection(conn.into(), key_id))
    }

    /// TLS server side
    pub fn server(config: Arc<ServerConfig>, key_id: KeyId) -> Result<Self, TlsError> {
        let conn = ServerConnection::new(config).map_err(|e| classify(&e))?;
        Ok(Self::with_connection(conn.into(), key_id))
    }

    fn with_connection(conn: Connection, key_id: KeyId) -> Self {
        Self {
            conn,
            key_id,
            state: ControlState::Idle,
        }
    }

    pub fn state(&self) -> ControlState {
        self.state
    }

    pub fn key_id(&self) -> KeyId {
        self.key_id
    }

    pub fn is_established(&self) -> bool {
        self.state == ControlState::Established
    }

    /// Begin the handshake; returns the first flight (empty on the server side)
    pub fn start(&mut self) -> Result<Vec<u8>, TlsError> {
        if self.state != ControlState::Idle {
            return Err(TlsError::InvalidState {
                operation: "start",
                state: self.state,
            });
        }
        self.state = ControlState::Handshaking;
        tracing::debug!(key_id = %self.key_id, "control handshake started");
        self.drain()
    }

    /// Process bytes from the peer; returns bytes to send back
    pub fn feed(&mut self, mut bytes: &[u8]) -> Result<Vec<u8>, TlsError> {
        match self.state {
            ControlState::Handshaking | ControlState::Established => {}
            state => {
                return Err(TlsError::InvalidState {
                    operation: "feed",
                    state,
                })
            }
        }

        while !bytes.is_empty() {
            if let Err(e) = self.conn.read_tls(&mut bytes) {
                return Err(self.fail(TlsError::Generic(format!("record buffer: {}", e))));
            }
            let io = match self.conn.process_new_packets() {
                Ok(io) => io,
                Err(e) => {
                    let err = classify(&e);
                    return Err(self.fail(err));
                }
            };
            if io.plaintext_bytes_to_read() > 0 {
                // The control channel carries no application data.
                let mut sink = Vec::new();
                let _ = self.conn.reader().read_to_end(&mut sink);
                tracing::debug!(key_id = %self.key_id, len = sink.len(), "discarded control plaintext");
            }
            if io.peer_has_closed() {
                tracing::debug!(key_id = %self.key_id, "peer closed control channel");
                self.state = ControlState::Closed;
                break;
            }
        }

        if self.state == ControlState::Handshaking && !self.conn.is_handshaking() {
            self.state = ControlState::Established;
            tracing::info!(
                key_id = %self.key_id,
                version = ?self.conn.protocol_version(),
                suite = ?self.conn.negotiated_cipher_suite().map(|s| s.suite()),
                "control channel established"
            );
        }
        self.drain()
    }

    /// Export `len` bytes of key material for this channel's key id
    pub fn export_key_material(&self, len: usize) -> Result<Zeroizing<Vec<u8>>, TlsError> {
        if self.state != ControlState::Established {
            return Err(TlsError::InvalidState {
                operation: "export key material",
                state: self.state,
            });
        }
        let context = [self.key_id.value()];
        let secret = self
            .conn
            .export_keying_material(vec![0u8; len], EXPORTER_LABEL, Some(&context))
            .map_err(|e| TlsError::Generic(format!("exporter: {}", e)))?;
        Ok(Zeroizing::new(secret))
    }

    /// Send close_notify; returns the bytes carrying it
    pub fn close(&mut self) -> Result<Vec<u8>, TlsError> {
        match self.state {
            ControlState::Closed | ControlState::Failed => Ok(Vec::new()),
            ControlState::Idle => {
                self.state = ControlState::Closed;
                Ok(Vec::new())
            }
            ControlState::Handshaking | ControlState::Established => {
                self.conn.send_close_notify();
                self.state = ControlState::Closed;
                self.drain()
            }
        }
    }

    /// Drain whatever TLS wants to send, in any state (e.g. a fatal alert)
    pub fn take_output(&mut self) -> Vec<u8> {
        self.drain().unwrap_or_default()
    }

    fn drain(&mut self) -> Result<Vec<u8>, TlsError> {
        let mut out = Vec::new();
        while self.conn.wants_write() {
            self.conn
                .write_tls(&mut out)
                .map_err(|e| TlsError::Generic(e.to_string()))?;
        }
        Ok(out)
    }

    fn fail(&mut self, err: TlsError) -> TlsError {
        tracing::warn!(key_id = %self.key_id, state = %self.state, error = %err, "control channel failed");
        self.state = ControlState::Failed;
        err
    }
}

impl fmt::Debug for ControlChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlChannel")
            .field("key_id", &self.key_id)
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Throwaway PKI for tests

    use super::{CaTrustAnchor, TlsIdentity};
    use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};
    use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};

    pub(crate) struct Pki {
        pub ca: CaTrustAnchor,
        pub server: TlsIdentity,
        pub client: TlsIdentity,
    }

    fn ca() -> (rcgen::Certificate, KeyPair) {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params
            .distinguished_name
            .push(DnType::CommonName, "tunnelbox test CA");
        let cert = params.self_signed(&key).unwrap();
        (cert, key)
    }

    fn leaf(name: &str, ca: &rcgen::Certificate, ca_key: &KeyPair) -> TlsIdentity {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec![name.to_string()]).unwrap();
        params.distinguished_name.push(DnType::CommonName, name);
        let cert = params.signed_by(&key, ca, ca_key).unwrap();
        TlsIdentity::new(
            vec![cert.der().clone()],
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der())),
        )
    }

    /// CA plus server and client leaves signed by it
    pub(crate) fn pki(server_name: &str) -> Pki {
        let (ca_cert, ca_key) = ca();
        Pki {
            ca: CaTrustAnchor::from_der(vec![ca_cert.der().clone()]).unwrap(),
            server: leaf(server_name, &ca_cert, &ca_key),
            client: leaf("client", &ca_cert, &ca_key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::pki;
    use super::*;
    use rustls::CertificateError;

    const NAME: &str = "vpn.example.com";

    fn pair(
        trusted: &CaTrustAnchor,
        server: &TlsIdentity,
        name: &str,
    ) -> (ControlChannel, ControlChannel) {
        let client = ControlChannel::client(
            client_config(trusted, None).unwrap(),
            server_name(name).unwrap(),
            KeyId::INITIAL,
        )
        .unwrap();
        let server =
            ControlChannel::server(server_config(server, None).unwrap(), KeyId::INITIAL).unwrap();
        (client, server)
    }

    /// Shuttle bytes until neither side has anything left to say
    fn run(
        client: &mut ControlChannel,
        server: &mut ControlChannel,
    ) -> Result<(), (bool, TlsError)> {
        let mut to_server = client.start().map_err(|e| (true, e))?;
        server.start().map_err(|e| (false, e))?;
        for _ in 0..10 {
            if to_server.is_empty() {
                break;
            }
            let to_client = server.feed(&to_server).map_err(|e| (false, e))?;
            to_server = if to_client.is_empty() {
                Vec::new()
            } else {
                client.feed(&to_client).map_err(|e| (true, e))?
            };
        }
        Ok(())
    }

    #[test]
    fn test_handshake_establishes_both_sides() {
        let pki = pki(NAME);
        let (mut client, mut server) = pair(&pki.ca, &pki.server, NAME);
        assert_eq!(client.state(), ControlState::Idle);

        run(&mut client, &mut server).unwrap();
        assert_eq!(client.state(), ControlState::Established);
        assert_eq!(server.state(), ControlState::Established);
    }

    #[test]
    fn test_exporter_agrees() {
        let pki = pki(NAME);
        let (mut client, mut server) = pair(&pki.ca, &pki.server, NAME);
        run(&mut client, &mut server).unwrap();

        let a = client.export_key_material(32).unwrap();
        let b = server.export_key_material(32).unwrap();
        assert_eq!(a.len(), 32);
        assert_eq!(*a, *b);
    }

    #[test]
    fn test_exporter_differs_per_session() {
        let pki = pki(NAME);
        let key_id = KeyId::new(3).unwrap();
        let mut client = ControlChannel::client(
            client_config(&pki.ca, None).unwrap(),
            server_name(NAME).unwrap(),
            key_id,
        )
        .unwrap();
        let mut server =
            ControlChannel::server(server_config(&pki.server, None).unwrap(), key_id).unwrap();
        run(&mut client, &mut server).unwrap();

        let (mut c0, mut s0) = pair(&pki.ca, &pki.server, NAME);
        run(&mut c0, &mut s0).unwrap();
        assert_eq!(
            *client.export_key_material(32).unwrap(),
            *server.export_key_material(32).unwrap()
        );
        assert_ne!(
            *client.export_key_material(32).unwrap(),
            *c0.export_key_material(32).unwrap()
        );
    }

    #[test]
    fn test_untrusted_ca_fails() {
        let pki = pki(NAME);
        let other = fixtures::pki(NAME);
        let (mut client, mut server) = pair(&other.ca, &pki.server, NAME);

        let (on_client, err) = run(&mut client, &mut server).unwrap_err();
        assert!(on_client);
        assert!(matches!(err, TlsError::Ca(_)), "got {:?}", err);
        assert_eq!(client.state(), ControlState::Failed);
        assert!(client.export_key_material(32).is_err());
        // Terminal
        assert!(client.feed(b"more").is_err());
    }

    #[test]
    fn test_wrong_server_name_fails() {
        let pki = pki(NAME);
        let (mut client, mut server) = pair(&pki.ca, &pki.server, "other.example.com");

        let (_, err) = run(&mut client, &mut server).unwrap_err();
        assert!(matches!(err, TlsError::Ca(_)));
        assert_eq!(client.state(), ControlState::Failed);
    }

    #[test]
    fn test_garbage_is_handshake_error() {
        let pki = pki(NAME);
        let (mut client, _) = pair(&pki.ca, &pki.server, NAME);
        client.start().unwrap();

        // A ServerHello record with an empty body
        let err = client
            .feed(&[0x16, 0x03, 0x03, 0x00, 0x04, 0x02, 0x00, 0x00, 0x00])
            .unwrap_err();
        assert!(matches!(err, TlsError::Handshake(_)), "got {:?}", err);
        assert_eq!(client.state(), ControlState::Failed);
        // A fatal alert is queued for the peer.
        assert!(!client.take_output().is_empty());
    }

    #[test]
    fn test_state_guards() {
        let pki = pki(NAME);
        let (mut client, _) = pair(&pki.ca, &pki.server, NAME);

        assert!(matches!(
            client.feed(b"x"),
            Err(TlsError::InvalidState { operation: "feed", .. })
        ));
        assert!(client.export_key_material(32).is_err());

        assert!(!client.start().unwrap().is_empty());
        assert!(client.start().is_err());
        assert!(client.export_key_material(32).is_err());
    }

    #[test]
    fn test_close_after_established() {
        let pki = pki(NAME);
        let (mut client, mut server) = pair(&pki.ca, &pki.server, NAME);
        run(&mut client, &mut server).unwrap();

        let notify = client.close().unwrap();
        assert!(!notify.is_empty());
        assert_eq!(client.state(), ControlState::Closed);
        assert!(client.export_key_material(32).is_err());

        server.feed(&notify).unwrap();
        assert_eq!(server.state(), ControlState::Closed);
    }

    #[test]
    fn test_mutual_tls() {
        let pki = pki(NAME);
        let mut client = ControlChannel::client(
            client_config(&pki.ca, Some(&pki.client)).unwrap(),
            server_name(NAME).unwrap(),
            KeyId::INITIAL,
        )
        .unwrap();
        let mut server = ControlChannel::server(
            server_config(&pki.server, Some(&pki.ca)).unwrap(),
            KeyId::INITIAL,
        )
        .unwrap();
        run(&mut client, &mut server).unwrap();
        assert!(server.is_established());
    }

    #[test]
    fn test_classify() {
        assert!(matches!(
            classify(&rustls::Error::InvalidCertificate(CertificateError::Expired)),
            TlsError::Ca(_)
        ));
        assert!(matches!(
            classify(&rustls::Error::AlertReceived(AlertDescription::UnknownCA)),
            TlsError::Ca(_)
        ));
        assert!(matches!(
            classify(&rustls::Error::AlertReceived(AlertDescription::HandshakeFailure)),
            TlsError::Handshake(_)
        ));
        assert!(matches!(classify(&rustls::Error::DecryptError), TlsError::Handshake(_)));
        assert_eq!(
            classify(&rustls::Error::FailedToGetRandomBytes),
            TlsError::RandomGenerator
        );
        assert!(matches!(
            classify(&rustls::Error::General("x".into())),
            TlsError::Generic(_)
        ));
    }
}
