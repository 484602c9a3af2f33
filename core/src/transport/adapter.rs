//! Transport Adapter
//!
//! The narrow seam between the session and whatever actually moves bytes
//! (relay service, direct sockets, or the in-memory loopback).

use bytes::Bytes;
use thiserror::Error;

use crate::peer::PeerId;

/// Delivery contract attached to an outbound packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reliability {
    /// Fire and forget. Best for periodic position snapshots.
    UnreliableUnordered,
    /// Retried until acknowledged, arrival order unspecified
    ReliableUnordered,
    /// Retried until acknowledged, arrives in send order per peer and channel
    ReliableOrdered,
}

impl Reliability {
    pub fn is_reliable(&self) -> bool {
        !matches!(self, Reliability::UnreliableUnordered)
    }
}

/// A raw datagram as it came off the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub sender: PeerId,
    pub channel: u8,
    pub data: Bytes,
}

/// Connection notifications raised by the transport itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportSignal {
    /// Transport-level session with the peer is up
    Established { peer: PeerId, relayed: bool },
    /// Path to the peer switched between direct and relay
    Route { peer: PeerId, relayed: bool },
    /// Round-trip sample
    Latency { peer: PeerId, rtt_ms: u32 },
    /// The remote side closed the connection
    Closed { peer: PeerId },
    /// The transport gave up reaching the peer
    Unreachable { peer: PeerId },
}

impl TransportSignal {
    pub fn peer(&self) -> PeerId {
        match *self {
            TransportSignal::Established { peer, .. }
            | TransportSignal::Route { peer, .. }
            | TransportSignal::Latency { peer, .. }
            | TransportSignal::Closed { peer }
            | TransportSignal::Unreachable { peer } => peer,
        }
    }
}

/// Hand-off failures. None of them say anything about the peer itself.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Transport cannot queue the packet right now")]
    WouldBlock,
    #[error("Transport is closed")]
    Closed,
    #[error("Transport unavailable: {0}")]
    Unavailable(String),
}

/// Black-box delivery capability.
///
/// Every method is non-blocking and may be called from any thread.
pub trait Transport: Send + Sync {
    /// Bind to the namespace this session's traffic lives in
    fn open(&self, _socket_name: &str, _allow_relay: bool) -> Result<(), TransportError> {
        Ok(())
    }

    /// Queue `data` for delivery. `Ok` means handed off, not delivered.
    fn try_send(
        &self,
        peer: PeerId,
        data: &[u8],
        channel: u8,
        reliability: Reliability,
    ) -> Result<(), TransportError>;

    /// Next pending datagram, if any
    fn poll_received(&self) -> Option<Datagram>;

    /// Next pending connection notification, if any
    fn poll_signal(&self) -> Option<TransportSignal> {
        None
    }

    /// Forget transport-level state for a peer, unpolled datagrams included
    fn close_peer(&self, _peer: PeerId) {}

    /// Release the namespace
    fn close(&self) {}
}
