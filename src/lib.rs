//! # tunnelbox
//!
//! Secure-tunnel engine for a VPN client: a TLS control channel validated
//! against a CA, a data channel keyed from the TLS exporter, and a data
//! path turning tunnel packets into authenticated, replay-protected frames.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                   Session Layer                      │
//! │    (negotiation, re-key scheduling, keepalive)       │
//! ├──────────────────────────┬──────────────────────────┤
//! │      Control Channel     │        Data Path         │
//! │ (TLS over push/pull, CA) │ (framing, size bounds)   │
//! ├──────────────────────────┼──────────────────────────┤
//! │                          │     Data Channel         │
//! │                          │ (AEAD + HMAC, replay)    │
//! ├──────────────────────────┴──────────────────────────┤
//! │                  Transport Layer                     │
//! │          (UDP link, packet tunnel, memory)           │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod control;
pub mod crypto;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod tunnel;

pub use config::Config;
pub use session::{Session, SessionEvent, SessionHandle, SessionState};

use std::fmt;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy surfaced to the embedding application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Entropy source unavailable
    RandomGenerator,
    /// Data frame failed authentication
    Hmac,
    /// Peer certificate chain failed trust validation
    TlsCa,
    /// TLS protocol violation or negotiation timeout
    TlsHandshake,
    /// Any other TLS fault
    TlsGeneric,
    /// Packet or frame exceeded the data path bounds
    DataPathOverflow,
}

impl ErrorKind {
    /// Fatal kinds terminate the session
    pub fn is_fatal(self) -> bool {
        !matches!(self, ErrorKind::Hmac | ErrorKind::DataPathOverflow)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::RandomGenerator => "RandomGeneratorError",
            ErrorKind::Hmac => "HMACError",
            ErrorKind::TlsCa => "TLSCAError",
            ErrorKind::TlsHandshake => "TLSHandshakeError",
            ErrorKind::TlsGeneric => "TLSGenericError",
            ErrorKind::DataPathOverflow => "DataPathOverflow",
        };
        f.write_str(name)
    }
}

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("Control channel error: {0}")]
    Tls(#[from] control::TlsError),

    #[error("Data path error: {0}")]
    DataPath(#[from] tunnel::DataPathError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Link error: {0}")]
    Link(#[from] transport::LinkError),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    #[error("Session closed")]
    SessionClosed,

    #[error("Session task failed: {0}")]
    Task(String),
}

impl Error {
    /// Taxonomy kind, if the error belongs to one
    pub fn kind(&self) -> Option<ErrorKind> {
        use crypto::CryptoError;
        use tunnel::DataPathError;

        fn crypto_kind(err: &CryptoError) -> Option<ErrorKind> {
            match err {
                CryptoError::RandomGenerator(_) => Some(ErrorKind::RandomGenerator),
                CryptoError::Hmac => Some(ErrorKind::Hmac),
                _ => None,
            }
        }

        match self {
            Error::Crypto(e) => crypto_kind(e),
            Error::DataPath(DataPathError::Overflow { .. }) => Some(ErrorKind::DataPathOverflow),
            Error::DataPath(DataPathError::Crypto(e)) => crypto_kind(e),
            Error::Tls(control::TlsError::Ca(_)) => Some(ErrorKind::TlsCa),
            Error::Tls(control::TlsError::Handshake(_)) => Some(ErrorKind::TlsHandshake),
            Error::Tls(control::TlsError::Generic(_)) => Some(ErrorKind::TlsGeneric),
            Error::Tls(control::TlsError::RandomGenerator) => Some(ErrorKind::RandomGenerator),
            _ => None,
        }
    }

    /// Whether the error terminates the session
    pub fn is_fatal(&self) -> bool {
        use crypto::CryptoError;

        if let Some(kind) = self.kind() {
            return kind.is_fatal();
        }
        matches!(
            self,
            Error::Crypto(CryptoError::KeyDerivation(_))
                | Error::Crypto(CryptoError::InvalidKeyLength)
                | Error::Crypto(CryptoError::Encryption(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::TlsError;
    use crate::crypto::CryptoError;
    use crate::tunnel::{DataPathError, Direction};

    #[test]
    fn test_taxonomy() {
        let cases: Vec<(Error, ErrorKind, bool)> = vec![
            (
                CryptoError::RandomGenerator("x".into()).into(),
                ErrorKind::RandomGenerator,
                true,
            ),
            (CryptoError::Hmac.into(), ErrorKind::Hmac, false),
            (TlsError::Ca("x".into()).into(), ErrorKind::TlsCa, true),
            (TlsError::Handshake("x".into()).into(), ErrorKind::TlsHandshake, true),
            (TlsError::Generic("x".into()).into(), ErrorKind::TlsGeneric, true),
            (
                DataPathError::Overflow {
                    direction: Direction::Outbound,
                    len: 2000,
                    max: 1400,
                }
                .into(),
                ErrorKind::DataPathOverflow,
                false,
            ),
            (
                DataPathError::Crypto(CryptoError::Hmac).into(),
                ErrorKind::Hmac,
                false,
            ),
        ];
        for (err, kind, fatal) in cases {
            assert_eq!(err.kind(), Some(kind), "{}", err);
            assert_eq!(err.is_fatal(), fatal, "{}", err);
        }
    }

    #[test]
    fn test_silent_drops_are_not_fatal() {
        let replay: Error = DataPathError::Crypto(CryptoError::Replay(3)).into();
        assert_eq!(replay.kind(), None);
        assert!(!replay.is_fatal());

        let unknown: Error = CryptoError::UnknownKey(2).into();
        assert!(!unknown.is_fatal());
        assert!(!Error::SessionClosed.is_fatal());
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(ErrorKind::TlsCa.to_string(), "TLSCAError");
        assert_eq!(ErrorKind::Hmac.to_string(), "HMACError");
    }
}
