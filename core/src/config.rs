//! Session Configuration
//!
//! Immutable settings fixed at `P2PSession::initialize`.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::peer::PeerId;

/// Largest application payload the relay substrate carries in one datagram
pub const MAX_PACKET_SIZE_LIMIT: u32 = 1170;

/// Longest socket name accepted by the transport namespace
pub const MAX_SOCKET_NAME_LEN: usize = 32;

/// Channel numbers are a single byte
pub const MAX_CHANNELS: u16 = 256;

/// Which unknown peers may open a connection to us
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcceptFilter {
    /// Any authenticated peer
    #[default]
    All,
    /// Only this peer; everyone else is dropped silently
    Only(PeerId),
}

impl AcceptFilter {
    pub fn admits(&self, peer: PeerId) -> bool {
        match self {
            AcceptFilter::All => true,
            AcceptFilter::Only(allowed) => *allowed == peer,
        }
    }
}

/// What happens to a registry entry once its peer is found unreachable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailedRetention {
    /// Drop the entry as soon as the failure is reported
    #[default]
    PurgeImmediately,
    /// Keep the `Failed` entry visible for a while
    RetainFor { ms: u64 },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Socket name must not be empty")]
    EmptySocketName,
    #[error("Socket name longer than 32 characters: {0}")]
    SocketNameTooLong(String),
    #[error("Socket name contains invalid characters: {0}")]
    InvalidSocketName(String),
    #[error("Max packet size must be between 1 and 1170, got {0}")]
    InvalidPacketSize(u32),
    #[error("Channel count must be between 1 and 256, got {0}")]
    InvalidChannelCount(u16),
    #[error("Max send attempts must be at least 1")]
    ZeroSendAttempts,
    #[error("Queue capacity must be at least 1")]
    ZeroQueueCapacity,
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
}

/// Settings for one P2P session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Namespace that keeps this session's traffic apart from other users of the transport
    pub socket_name: String,
    pub allow_relay: bool,
    /// Largest application payload accepted by `send`
    pub max_packet_size: u32,
    /// Valid channels are `0..channel_count`
    pub channel_count: u16,
    /// Hello hand-off attempts before a peer is declared unreachable
    pub max_send_attempts: u32,
    pub failed_retention: FailedRetention,
    pub accept_filter: AcceptFilter,
    pub queue_capacity: usize,
    /// Give up on a handshake after this long; 0 waits forever
    pub connect_timeout_ms: u64,
    /// Idle sleep of the background pump thread
    pub pump_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            socket_name: "GameSocket".to_string(),
            allow_relay: true,
            max_packet_size: MAX_PACKET_SIZE_LIMIT,
            // 0 = unreliable position, 1 = reliable events
            channel_count: 2,
            max_send_attempts: 5,
            failed_retention: FailedRetention::PurgeImmediately,
            accept_filter: AcceptFilter::All,
            queue_capacity: 256,
            connect_timeout_ms: 30_000,
            pump_interval_ms: 5,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.socket_name.is_empty() {
            return Err(ConfigError::EmptySocketName);
        }
        if self.socket_name.len() > MAX_SOCKET_NAME_LEN {
            return Err(ConfigError::SocketNameTooLong(self.socket_name.clone()));
        }
        if !self
            .socket_name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ConfigError::InvalidSocketName(self.socket_name.clone()));
        }
        if self.max_packet_size == 0 || self.max_packet_size > MAX_PACKET_SIZE_LIMIT {
            return Err(ConfigError::InvalidPacketSize(self.max_packet_size));
        }
        if self.channel_count == 0 || self.channel_count > MAX_CHANNELS {
            return Err(ConfigError::InvalidChannelCount(self.channel_count));
        }
        if self.max_send_attempts == 0 {
            return Err(ConfigError::ZeroSendAttempts);
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::ZeroQueueCapacity);
        }
        Ok(())
    }

    /// Parse and validate a JSON document. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: SessionConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        match self.connect_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn pump_interval(&self) -> Duration {
        Duration::from_millis(self.pump_interval_ms)
    }

    pub fn failed_retention_period(&self) -> Option<Duration> {
        match self.failed_retention {
            FailedRetention::PurgeImmediately => None,
            FailedRetention::RetainFor { ms } => Some(Duration::from_millis(ms)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_is_valid() {
        let config = SessionConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_packet_size, 1170);
        assert_eq!(config.channel_count, 2);
        assert_eq!(config.accept_filter, AcceptFilter::All);
        assert_eq!(config.connect_timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_socket_name_rules() {
        let mut config = SessionConfig::default();
        config.socket_name = String::new();
        assert!(matches!(config.validate(), Err(ConfigError::EmptySocketName)));

        config.socket_name = "x".repeat(33);
        assert!(matches!(config.validate(), Err(ConfigError::SocketNameTooLong(_))));

        config.socket_name = "Game Socket".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::InvalidSocketName(_))));

        config.socket_name = "Crab_Game-01".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_limits() {
        let mut config = SessionConfig::default();
        config.max_packet_size = 1171;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidPacketSize(1171))));

        config = SessionConfig::default();
        config.channel_count = 0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidChannelCount(0))));
        config.channel_count = 256;
        assert!(config.validate().is_ok());

        config.max_send_attempts = 0;
        assert!(matches!(config.validate(), Err(ConfigError::ZeroSendAttempts)));
    }

    #[test]
    fn test_json_partial_and_policies() {
        let config = SessionConfig::from_json_str(
            r#"{
                "socket_name": "Lobby42",
                "allow_relay": false,
                "failed_retention": { "retain_for": { "ms": 2000 } },
                "accept_filter": { "only": 99 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.socket_name, "Lobby42");
        assert!(!config.allow_relay);
        assert_eq!(config.max_packet_size, MAX_PACKET_SIZE_LIMIT);
        assert_eq!(config.failed_retention_period(), Some(Duration::from_secs(2)));
        assert_eq!(config.accept_filter, AcceptFilter::Only(PeerId::from_raw(99)));
        assert!(!config.accept_filter.admits(PeerId::from_raw(1)));
    }

    #[test]
    fn test_from_file() {
        let mut temp = NamedTempFile::new().unwrap();
        temp.write_all(br#"{ "channel_count": 8, "max_packet_size": 512 }"#)
            .unwrap();
        temp.flush().unwrap();

        let config = SessionConfig::from_file(temp.path()).unwrap();
        assert_eq!(config.channel_count, 8);
        assert_eq!(config.max_packet_size, 512);

        let mut bad = NamedTempFile::new().unwrap();
        bad.write_all(br#"{ "max_packet_size": 0 }"#).unwrap();
        bad.flush().unwrap();
        assert!(matches!(
            SessionConfig::from_file(bad.path()),
            Err(ConfigError::InvalidPacketSize(0))
        ));
    }
}
