//! Message Gateway
//!
//! Validates outbound requests, frames them, and hands them to the
//! transport. Ordered traffic is stamped with per-stream sequence numbers
//! here; the receiving registry puts it back in order.

use std::sync::Arc;

use super::connection::Greeting;
use super::registry::ConnectionRegistry;
use crate::error::{SessionError, ValidationError};
use crate::peer::PeerId;
use crate::transport::frame::{self, Frame};
use crate::transport::{Reliability, Transport, TransportError};

/// Channel greetings travel on
pub const HANDSHAKE_CHANNEL: u8 = 0;

pub struct MessageGateway {
    transport: Arc<dyn Transport>,
    local_id: PeerId,
    max_packet_size: usize,
    channel_count: u16,
}

impl MessageGateway {
    pub fn new(
        transport: Arc<dyn Transport>,
        local_id: PeerId,
        max_packet_size: usize,
        channel_count: u16,
    ) -> Self {
        MessageGateway {
            transport,
            local_id,
            max_packet_size,
            channel_count,
        }
    }

    /// Nil ids and our own id never name a remote peer
    pub fn validate_peer(&self, peer: PeerId) -> Result<(), ValidationError> {
        if peer.is_nil() || peer == self.local_id {
            return Err(ValidationError::InvalidPeer(peer));
        }
        Ok(())
    }

    pub fn validate_payload(&self, payload: &[u8], channel: u8) -> Result<(), ValidationError> {
        if payload.is_empty() {
            return Err(ValidationError::EmptyPayload);
        }
        if payload.len() > self.max_packet_size {
            return Err(ValidationError::Oversize {
                len: payload.len(),
                max: self.max_packet_size,
            });
        }
        if u16::from(channel) >= self.channel_count {
            return Err(ValidationError::InvalidChannel {
                channel,
                count: self.channel_count,
            });
        }
        Ok(())
    }

    pub fn send(
        &self,
        registry: &ConnectionRegistry,
        peer: PeerId,
        payload: &[u8],
        channel: u8,
        reliability: Reliability,
    ) -> Result<(), SessionError> {
        self.validate_payload(payload, channel)?;
        self.validate_peer(peer)?;
        self.hand_off(registry, peer, payload, channel, reliability)
    }

    /// Send to every peer that is `Connected` right now.
    /// Returns how many peers the packet was handed off for.
    pub fn broadcast(
        &self,
        registry: &ConnectionRegistry,
        payload: &[u8],
        channel: u8,
        reliability: Reliability,
    ) -> Result<usize, SessionError> {
        self.validate_payload(payload, channel)?;

        let mut delivered = 0;
        for peer in registry.connected_peers() {
            match self.hand_off(registry, peer, payload, channel, reliability) {
                Ok(()) => delivered += 1,
                Err(e) => tracing::debug!("Broadcast to {} not queued: {}", peer, e),
            }
        }
        Ok(delivered)
    }

    /// Hand a single-byte greeting frame to the transport
    pub fn send_greeting(&self, peer: PeerId, greeting: Greeting) -> Result<(), TransportError> {
        let frame = match greeting {
            Greeting::Hello => Frame::Hello,
            Greeting::Welcome => Frame::Welcome,
        };
        self.transport.try_send(
            peer,
            &frame.to_bytes(),
            HANDSHAKE_CHANNEL,
            Reliability::ReliableOrdered,
        )
    }

    fn hand_off(
        &self,
        registry: &ConnectionRegistry,
        peer: PeerId,
        payload: &[u8],
        channel: u8,
        reliability: Reliability,
    ) -> Result<(), SessionError> {
        match reliability {
            Reliability::ReliableOrdered => {
                // Peers without an entry have no stream to number
                registry.with_outbound_seq(peer, channel, |seq| {
                    let data = frame::encode_data(seq, payload);
                    self.transport.try_send(peer, &data, channel, reliability)
                })?;
            }
            Reliability::UnreliableUnordered | Reliability::ReliableUnordered => {
                let data = frame::encode_data(None, payload);
                self.transport.try_send(peer, &data, channel, reliability)?;
            }
        }

        registry.add_sent(peer, payload.len());
        tracing::trace!(
            "Sent {} bytes to {} on channel {} ({:?})",
            payload.len(),
            peer,
            channel,
            reliability
        );
        Ok(())
    }
}
