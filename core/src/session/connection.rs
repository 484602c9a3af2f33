//! Connection State Management
//!
//! Lifecycle, statistics and receive-side ordering for one peer.

use bytes::Bytes;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::peer::PeerId;

/// Frames buffered per ordered stream before it is forcibly resynchronised
pub const REORDER_WINDOW: usize = 64;

/// Connection state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    /// No entry; also reported for normal closes
    Disconnected,
    /// We sent a hello and are waiting to hear from the peer
    Connecting,
    /// Traffic flows both ways
    Connected,
    /// Peer could not be reached; terminal until retried
    Failed,
}

/// Why a connection-closed event fired
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// `disconnect` or `disconnect_all` on this side
    Local,
    /// The peer closed the connection
    Remote,
    /// Hand-off attempts exhausted, handshake timed out, or the transport gave up
    Unreachable,
}

impl CloseReason {
    pub fn status(&self) -> ConnectionStatus {
        match self {
            CloseReason::Local | CloseReason::Remote => ConnectionStatus::Disconnected,
            CloseReason::Unreachable => ConnectionStatus::Failed,
        }
    }
}

/// Point-in-time copy of a peer's connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub peer: PeerId,
    pub status: ConnectionStatus,
    /// Traffic goes through a relay rather than a direct path
    pub relayed: bool,
    /// Smoothed round-trip estimate, 0 until the first sample
    pub latency_ms: u32,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Single-byte control frames that open or restart a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Greeting {
    /// Fresh entry on the sender's side; its streams with us start from zero
    Hello,
    /// Answer to a hello; the sender's outbound streams start from zero
    Welcome,
}

/// Receive side of one ordered (peer, channel) stream
#[derive(Debug, Default)]
pub(crate) struct OrderedStream {
    next: u16,
    held: HashMap<u16, Bytes>,
}

impl OrderedStream {
    /// Stream that expects `seq` next
    pub fn starting_at(seq: u16) -> Self {
        OrderedStream {
            next: seq,
            held: HashMap::new(),
        }
    }

    /// Feed one sequenced payload; returns whatever is now deliverable, in order.
    pub fn accept(&mut self, seq: u16, payload: Bytes) -> Vec<Bytes> {
        let offset = seq.wrapping_sub(self.next) as i16;
        let distance = offset.unsigned_abs() as usize;
        let mut ready = Vec::new();

        if distance > REORDER_WINDOW {
            // Sender restarted its numbering, or the gap will never fill
            tracing::debug!(
                "Ordered stream jumped from {} to {}, resynchronising",
                self.next,
                seq
            );
            self.flush_into(&mut ready);
            ready.push(payload);
            self.next = seq.wrapping_add(1);
            return ready;
        }

        if offset < 0 {
            tracing::trace!("Dropping duplicate sequenced frame {}", seq);
            return ready;
        }

        self.held.insert(seq, payload);
        self.release_into(&mut ready);
        ready
    }

    pub fn held(&self) -> usize {
        self.held.len()
    }

    fn release_into(&mut self, ready: &mut Vec<Bytes>) {
        while let Some(payload) = self.held.remove(&self.next) {
            ready.push(payload);
            self.next = self.next.wrapping_add(1);
        }
    }

    /// Deliver everything held, skipping gaps
    fn flush_into(&mut self, ready: &mut Vec<Bytes>) {
        let next = self.next;
        let mut pending: Vec<(u16, Bytes)> = self.held.drain().collect();
        pending.sort_by_key(|(seq, _)| seq.wrapping_sub(next));
        if let Some((last, _)) = pending.last() {
            self.next = last.wrapping_add(1);
        }
        ready.extend(pending.into_iter().map(|(_, payload)| payload));
    }
}

/// Registry entry for one known peer
#[derive(Debug)]
pub struct PeerConnection {
    pub peer: PeerId,
    pub status: ConnectionStatus,
    pub relayed: bool,
    pub latency_ms: u32,
    pub bytes_sent: u64,
    pub bytes_received: u64,

    /// Greeting that still has to be handed to the transport
    pub pending_greeting: Option<Greeting>,
    /// Failed hand-offs of the pending greeting so far
    pub greeting_attempts: u32,

    pub created_at: Instant,
    pub failed_at: Option<Instant>,

    inbound: HashMap<u8, OrderedStream>,
    /// Next sequence number per outbound ordered channel
    outbound: HashMap<u8, u16>,
    /// Peer's ordered streams are known to start at zero. Otherwise a new
    /// inbound stream picks up at the first sequence number it sees.
    synced: bool,
}

impl PeerConnection {
    fn new(peer: PeerId, status: ConnectionStatus, synced: bool) -> Self {
        PeerConnection {
            peer,
            status,
            relayed: false,
            latency_ms: 0,
            bytes_sent: 0,
            bytes_received: 0,
            pending_greeting: None,
            greeting_attempts: 0,
            created_at: Instant::now(),
            failed_at: None,
            inbound: HashMap::new(),
            outbound: HashMap::new(),
            synced,
        }
    }

    /// Entry for a connection we initiated
    pub fn connecting(peer: PeerId) -> Self {
        let mut conn = Self::new(peer, ConnectionStatus::Connecting, false);
        conn.pending_greeting = Some(Greeting::Hello);
        conn
    }

    /// Entry for a peer that reached us first. `synced` when it opened with a hello.
    pub fn connected(peer: PeerId, synced: bool) -> Self {
        Self::new(peer, ConnectionStatus::Connected, synced)
    }

    /// Queue a greeting, replacing any unsent one
    pub fn greet(&mut self, greeting: Greeting) {
        self.pending_greeting = Some(greeting);
        self.greeting_attempts = 0;
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    /// Peer's outbound streams restarted from zero
    pub fn restart_inbound(&mut self) {
        self.inbound.clear();
        self.synced = true;
    }

    /// Peer dropped its entry for us; both directions start over
    pub fn restart_streams(&mut self) {
        self.outbound.clear();
        self.restart_inbound();
    }

    /// Sequence number the next ordered frame on `channel` carries
    pub fn outbound_seq(&self, channel: u8) -> u16 {
        self.outbound.get(&channel).copied().unwrap_or(0)
    }

    pub fn advance_outbound(&mut self, channel: u8) {
        let next = self.outbound_seq(channel).wrapping_add(1);
        self.outbound.insert(channel, next);
    }

    pub fn snapshot(&self) -> ConnectionInfo {
        ConnectionInfo {
            peer: self.peer,
            status: self.status,
            relayed: self.relayed,
            latency_ms: self.latency_ms,
            bytes_sent: self.bytes_sent,
            bytes_received: self.bytes_received,
        }
    }

    /// Fold a round-trip sample into the estimate (exponential moving average)
    pub fn record_latency(&mut self, sample_ms: u32) {
        self.latency_ms = if self.latency_ms == 0 {
            sample_ms
        } else {
            ((self.latency_ms as u64 * 7 + sample_ms as u64) / 8) as u32
        };
    }

    pub fn mark_failed(&mut self) {
        self.status = ConnectionStatus::Failed;
        self.pending_greeting = None;
        self.failed_at = Some(Instant::now());
    }

    /// Still connecting after `timeout`
    pub fn handshake_expired(&self, timeout: Duration) -> bool {
        self.status == ConnectionStatus::Connecting && self.created_at.elapsed() >= timeout
    }

    /// Failed entry kept for longer than `retention`
    pub fn failure_expired(&self, retention: Duration) -> bool {
        matches!(self.failed_at, Some(at) if at.elapsed() >= retention)
    }

    /// Run a sequenced payload through the channel's reorder buffer
    pub(crate) fn accept_sequenced(&mut self, channel: u8, seq: u16, payload: Bytes) -> Vec<Bytes> {
        let synced = self.synced;
        self.inbound
            .entry(channel)
            .or_insert_with(|| {
                if synced {
                    OrderedStream::default()
                } else {
                    OrderedStream::starting_at(seq)
                }
            })
            .accept(seq, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(s: &'static str) -> Bytes {
        Bytes::from_static(s.as_bytes())
    }

    #[test]
    fn test_connection_lifecycle() {
        let peer = PeerId::from_raw(12345);
        let mut conn = PeerConnection::connecting(peer);
        assert_eq!(conn.status, ConnectionStatus::Connecting);
        assert_eq!(conn.pending_greeting, Some(Greeting::Hello));
        assert!(!conn.handshake_expired(Duration::from_secs(30)));
        assert!(conn.handshake_expired(Duration::ZERO));

        conn.mark_failed();
        assert_eq!(conn.snapshot().status, ConnectionStatus::Failed);
        assert!(conn.pending_greeting.is_none());
        assert!(conn.failure_expired(Duration::ZERO));
        assert!(!conn.failure_expired(Duration::from_secs(60)));
    }

    #[test]
    fn test_latency_average() {
        let mut conn = PeerConnection::connected(PeerId::from_raw(1), true);
        conn.record_latency(80);
        assert_eq!(conn.latency_ms, 80);
        conn.record_latency(160);
        assert_eq!(conn.latency_ms, 90);
    }

    #[test]
    fn test_close_reason_status() {
        assert_eq!(CloseReason::Local.status(), ConnectionStatus::Disconnected);
        assert_eq!(CloseReason::Remote.status(), ConnectionStatus::Disconnected);
        assert_eq!(CloseReason::Unreachable.status(), ConnectionStatus::Failed);
    }

    #[test]
    fn test_unsynced_stream_picks_up_mid_sequence() {
        let mut conn = PeerConnection::connected(PeerId::from_raw(2), false);
        assert_eq!(conn.accept_sequenced(1, 40, b("a")), vec![b("a")]);
        assert_eq!(conn.accept_sequenced(1, 41, b("b")), vec![b("b")]);

        // A welcome means the peer's numbering starts over
        conn.restart_inbound();
        assert!(conn.is_synced());
        assert!(conn.accept_sequenced(1, 1, b("y")).is_empty());
        assert_eq!(conn.accept_sequenced(1, 0, b("x")), vec![b("x"), b("y")]);
    }

    #[test]
    fn test_restart_resets_outbound_numbering() {
        let mut conn = PeerConnection::connected(PeerId::from_raw(3), true);
        conn.advance_outbound(1);
        conn.advance_outbound(1);
        assert_eq!(conn.outbound_seq(1), 2);
        assert_eq!(conn.outbound_seq(0), 0);

        conn.restart_streams();
        assert_eq!(conn.outbound_seq(1), 0);
    }

    #[test]
    fn test_reorder_releases_in_sequence() {
        let mut stream = OrderedStream::default();
        assert!(stream.accept(2, b("C")).is_empty());
        assert!(stream.accept(1, b("B")).is_empty());
        assert_eq!(stream.held(), 2);
        assert_eq!(stream.accept(0, b("A")), vec![b("A"), b("B"), b("C")]);
        assert_eq!(stream.held(), 0);

        // Duplicate of something already delivered
        assert!(stream.accept(1, b("B")).is_empty());
        assert_eq!(stream.accept(3, b("D")), vec![b("D")]);
    }

    #[test]
    fn test_reorder_wraps_around() {
        let mut stream = OrderedStream {
            next: u16::MAX,
            held: HashMap::new(),
        };
        assert!(stream.accept(0, b("second")).is_empty());
        assert_eq!(
            stream.accept(u16::MAX, b("first")),
            vec![b("first"), b("second")]
        );
        assert_eq!(stream.next, 1);
    }

    #[test]
    fn test_far_ahead_frame_skips_gap() {
        let mut stream = OrderedStream::default();
        for seq in 1..=REORDER_WINDOW as u16 {
            assert!(stream.accept(seq, b("x")).is_empty());
        }
        let released = stream.accept(REORDER_WINDOW as u16 + 1, b("last"));
        assert_eq!(released.len(), REORDER_WINDOW + 1);
        assert_eq!(released.last(), Some(&b("last")));
        assert_eq!(stream.held(), 0);
        assert_eq!(stream.next, REORDER_WINDOW as u16 + 2);
    }

    #[test]
    fn test_restarted_sender_resyncs() {
        let mut stream = OrderedStream::default();
        for seq in 0..500u16 {
            stream.accept(seq, b("old"));
        }
        assert_eq!(stream.accept(0, b("fresh")), vec![b("fresh")]);
        assert_eq!(stream.accept(1, b("next")), vec![b("next")]);
    }
}
