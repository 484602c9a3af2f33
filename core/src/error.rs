//! Session Errors

use thiserror::Error;

use crate::config::ConfigError;
use crate::peer::PeerId;
use crate::transport::TransportError;

/// Outbound request refused before reaching the transport
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Payload is empty")]
    EmptyPayload,
    #[error("Payload too large ({len} > {max})")]
    Oversize { len: usize, max: usize },
    #[error("Invalid peer: {0}")]
    InvalidPeer(PeerId),
    #[error("Channel {channel} out of range (session has {count} channels)")]
    InvalidChannel { channel: u8, count: u16 },
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Must be authenticated before initializing P2P")]
    NotAuthenticated,
    #[error("P2P session is not initialized")]
    NotInitialized,
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// Transient: the packet was not queued, retrying later is fine
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Failed to start transport pump: {0}")]
    Pump(#[from] std::io::Error),
}

impl SessionError {
    /// True for failures that may succeed if the same call is repeated
    pub fn is_transient(&self) -> bool {
        matches!(self, SessionError::Transport(TransportError::WouldBlock))
    }
}
