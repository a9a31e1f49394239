//! Configuration management

use crate::tunnel::{PaddingConfig, PaddingMode};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Read(#[source] std::io::Error),

    #[error("Failed to write config: {0}")]
    Write(#[source] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Session timers
    pub session: SessionConfig,
    /// Control channel (TLS) settings
    pub control: ControlConfig,
    /// Data channel settings
    pub data: DataConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Read)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(ConfigError::Write)
    }

    /// Reject values the session cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        let s = &self.session;
        if s.tick_interval_ms == 0 {
            return invalid("session.tick_interval_ms must be positive");
        }
        if s.ping_interval_ms == 0 || s.ping_timeout_ms <= s.ping_interval_ms {
            return invalid("session.ping_timeout_ms must exceed a positive ping_interval_ms");
        }
        if s.connection_timeout_ms == 0 || s.soft_connection_timeout_ms == 0 {
            return invalid("negotiation timeouts must be positive");
        }
        if s.hard_reset_timeout_ms == 0 || s.retransmission_limit_ms == 0 {
            return invalid("control retransmission timers must be positive");
        }

        let c = &self.control;
        if c.max_control_payload < MIN_CONTROL_PAYLOAD {
            return invalid("control.max_control_payload is too small");
        }
        if c.client_cert.is_some() != c.client_key.is_some() {
            return invalid("control.client_cert and control.client_key must be set together");
        }

        let d = &self.data;
        if d.mtu < MIN_MTU || d.mtu > usize::from(u16::MAX) {
            return invalid("data.mtu out of range");
        }
        if d.padding.mode == PaddingMode::Block && d.padding.block_size == 0 {
            return invalid("data.padding.block_size must be positive");
        }
        if d.padding.max_padding > MAX_PADDING {
            return invalid("data.padding.max_padding too large");
        }
        if d.renegotiation_interval_secs == 0 {
            return invalid("data.renegotiation_interval_secs must be positive");
        }
        if d.rekey_after_bytes == Some(0) || d.rekey_after_packets == Some(0) {
            return invalid("re-key thresholds must be positive when set");
        }

        if let Err(e) = EnvFilter::try_new(&self.logging.level) {
            return Err(ConfigError::Invalid(format!(
                "logging.level {:?}: {}",
                self.logging.level, e
            )));
        }
        Ok(())
    }

    /// Generate example configuration
    pub fn example() -> Self {
        let mut config = Config::default();
        config.control.server_name = "vpn.example.com".to_string();
        config.control.ca_file = Some(PathBuf::from("ca.pem"));
        config
    }
}

const MIN_CONTROL_PAYLOAD: usize = 64;
const MIN_MTU: usize = 68;
const MAX_PADDING: usize = 1024;

/// Session timers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Timer resolution of the session driver
    pub tick_interval_ms: u64,
    /// Resend the unanswered first control flight after this long
    pub hard_reset_timeout_ms: u64,
    /// Resend any other unacknowledged control packet after this long
    pub retransmission_limit_ms: u64,
    /// Initial negotiation must finish within this
    pub connection_timeout_ms: u64,
    /// Send a keepalive after this much outbound silence
    pub ping_interval_ms: u64,
    /// Give up after this much inbound silence
    pub ping_timeout_ms: u64,
    /// Minimum time between two re-key negotiations
    pub soft_reset_delay_ms: u64,
    /// Re-key negotiation must finish within this; also the grace period
    /// of the retiring key set
    pub soft_connection_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 200,
            hard_reset_timeout_ms: 2_000,
            retransmission_limit_ms: 100,
            connection_timeout_ms: 10_000,
            ping_interval_ms: 10_000,
            ping_timeout_ms: 120_000,
            soft_reset_delay_ms: 5_000,
            soft_connection_timeout_ms: 120_000,
        }
    }
}

impl SessionConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn hard_reset_timeout(&self) -> Duration {
        Duration::from_millis(self.hard_reset_timeout_ms)
    }

    pub fn retransmission_limit(&self) -> Duration {
        Duration::from_millis(self.retransmission_limit_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn soft_reset_delay(&self) -> Duration {
        Duration::from_millis(self.soft_reset_delay_ms)
    }

    pub fn soft_connection_timeout(&self) -> Duration {
        Duration::from_millis(self.soft_connection_timeout_ms)
    }
}

/// Control channel settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Name the server certificate must be valid for
    pub server_name: String,
    /// PEM bundle of trusted CA certificates
    pub ca_file: Option<PathBuf>,
    /// Client certificate chain (PEM) for mutual TLS
    pub client_cert: Option<PathBuf>,
    /// Client private key (PEM)
    pub client_key: Option<PathBuf>,
    /// Largest control payload per packet
    pub max_control_payload: usize,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            server_name: String::new(),
            ca_file: None,
            client_cert: None,
            client_key: None,
            max_control_payload: crate::protocol::DEFAULT_MAX_CONTROL_PAYLOAD,
        }
    }
}

/// Data channel settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Tunnel MTU; largest packet the data path accepts
    pub mtu: usize,
    /// Reject replayed frames
    pub replay_protection: bool,
    pub padding: PaddingConfig,
    /// Re-key after the current key set has been in use this long
    pub renegotiation_interval_secs: u64,
    /// Re-key after this many bytes sent under one key set
    pub rekey_after_bytes: Option<u64>,
    /// Re-key after this many packets sent under one key set
    pub rekey_after_packets: Option<u64>,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            mtu: 1400,
            replay_protection: true,
            padding: PaddingConfig::default(),
            renegotiation_interval_secs: 3600,
            rekey_after_bytes: None,
            rekey_after_packets: None,
        }
    }
}

impl DataConfig {
    pub fn renegotiation_interval(&self) -> Duration {
        Duration::from_secs(self.renegotiation_interval_secs)
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Compact,
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level or filter directive (trace, debug, info, warn, error)
    pub level: String,
    pub format: LogFormat,
    /// Allow key fingerprints in trace output
    pub sensitive: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            sensitive: false,
        }
    }
}

/// Install the global tracing subscriber
///
/// `RUST_LOG` overrides the configured level.
pub fn init_logging(config: &LoggingConfig) -> Result<(), ConfigError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| ConfigError::Invalid(format!("log level {:?}: {}", config.level, e)))?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = match config.format {
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    result.map_err(|e| ConfigError::Invalid(format!("logging already initialised: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.session.tick_interval(), Duration::from_millis(200));
        assert_eq!(config.session.hard_reset_timeout(), Duration::from_secs(2));
        assert_eq!(config.session.retransmission_limit(), Duration::from_millis(100));
        assert_eq!(config.session.connection_timeout(), Duration::from_secs(10));
        assert_eq!(config.session.ping_interval(), Duration::from_secs(10));
        assert_eq!(config.session.ping_timeout(), Duration::from_secs(120));
        assert_eq!(config.session.soft_reset_delay(), Duration::from_secs(5));
        assert_eq!(config.session.soft_connection_timeout(), Duration::from_secs(120));
        assert_eq!(config.control.max_control_payload, 1000);
        assert!(config.data.replay_protection);
        assert!(!config.logging.sensitive);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [control]
            server_name = "vpn.example.com"

            [data]
            mtu = 1280
            padding = { mode = "power_of_two" }

            [logging]
            format = "json"
            "#,
        )
        .unwrap();
        assert_eq!(config.control.server_name, "vpn.example.com");
        assert_eq!(config.data.mtu, 1280);
        assert_eq!(config.data.padding.mode, PaddingMode::PowerOfTwo);
        assert_eq!(config.data.padding.max_padding, 255);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.session, SessionConfig::default());
    }

    #[test]
    fn test_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tunnelbox.toml");

        let mut config = Config::example();
        config.data.rekey_after_packets = Some(1_000_000);
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_validate_rejects() {
        let mut config = Config::default();
        config.data.mtu = 10;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.session.ping_timeout_ms = config.session.ping_interval_ms;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.control.client_cert = Some(PathBuf::from("client.pem"));
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.data.rekey_after_bytes = Some(0);
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.session.retransmission_limit_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = Config::default();
        config.logging.level = "tunnelbox=debug,rustls=warn".to_string();
        assert!(config.validate().is_ok());

        config.logging.level = "tunnelbox=loud".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("logging.level"), "{}", err);
    }

    #[test]
    fn test_load_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Config::load(dir.path().join("missing.toml")),
            Err(ConfigError::Read(_))
        ));

        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[data]\nmtu = \"wide\"\n").unwrap();
        assert!(matches!(Config::load(&path), Err(ConfigError::Parse(_))));
    }
}
