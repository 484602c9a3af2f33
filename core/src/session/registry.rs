//! Connection Registry
//!
//! Authoritative table of known peers. All access goes through one mutex;
//! callers receive copies, never references into the table.

use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::connection::{CloseReason, ConnectionInfo, ConnectionStatus, Greeting, PeerConnection};
use crate::config::AcceptFilter;
use crate::peer::PeerId;

/// Result of `begin_connect`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectAction {
    /// New `Connecting` entry; a hello must be sent
    Started,
    AlreadyConnecting,
    AlreadyConnected,
}

/// How a peer made itself heard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Contact {
    Hello,
    Welcome,
    /// Application frame
    Traffic,
    /// Transport-level notification such as `Established`
    Signal,
}

/// Result of hearing from a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Peer may talk to us. `established` is true exactly once per transition
    /// into `Connected`; `reply` is the greeting to send back, if any.
    Accepted {
        established: bool,
        reply: Option<Greeting>,
    },
    /// Outside the accept filter
    Rejected,
    /// Entry is `Failed` and waits for an explicit retry
    Ignored,
}

/// Connection-closed notification waiting for the dispatch loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClosedNotice {
    pub peer: PeerId,
    pub reason: CloseReason,
}

#[derive(Debug, Default)]
struct RegistryState {
    peers: HashMap<PeerId, PeerConnection>,
    filter: AcceptFilter,
    notices: VecDeque<ClosedNotice>,
}

impl RegistryState {
    fn remove(&mut self, peer: PeerId) -> Option<PeerConnection> {
        self.peers.remove(&peer)
    }

    /// Mark a peer unreachable and queue its closed notice
    fn fail(&mut self, peer: PeerId, retention: Option<Duration>) -> bool {
        let Some(conn) = self.peers.get_mut(&peer) else {
            return false;
        };
        if conn.status == ConnectionStatus::Failed {
            return false;
        }

        conn.mark_failed();
        if retention.is_none() {
            self.remove(peer);
        }
        self.notices.push_back(ClosedNotice {
            peer,
            reason: CloseReason::Unreachable,
        });
        true
    }
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    state: Mutex<RegistryState>,
}

impl ConnectionRegistry {
    pub fn new(filter: AcceptFilter) -> Self {
        ConnectionRegistry {
            state: Mutex::new(RegistryState {
                filter,
                ..Default::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn filter(&self) -> AcceptFilter {
        self.lock().filter
    }

    pub fn set_filter(&self, filter: AcceptFilter) {
        self.lock().filter = filter;
    }

    /// Local side asks for a connection
    pub fn begin_connect(&self, peer: PeerId) -> ConnectAction {
        let mut state = self.lock();

        match state.peers.get(&peer).map(|c| c.status) {
            Some(ConnectionStatus::Connected) => return ConnectAction::AlreadyConnected,
            Some(ConnectionStatus::Connecting) => return ConnectAction::AlreadyConnecting,
            Some(ConnectionStatus::Failed) => {
                tracing::debug!("Purging failed entry for {} before retry", peer);
                state.remove(peer);
            }
            Some(ConnectionStatus::Disconnected) | None => {}
        }

        state.peers.insert(peer, PeerConnection::connecting(peer));
        ConnectAction::Started
    }

    /// A frame or transport notification arrived from `peer`
    pub fn admit(&self, peer: PeerId, contact: Contact) -> Admission {
        let mut state = self.lock();

        if let Some(conn) = state.peers.get_mut(&peer) {
            let established = match conn.status {
                ConnectionStatus::Connecting => {
                    conn.status = ConnectionStatus::Connected;
                    true
                }
                ConnectionStatus::Connected => false,
                ConnectionStatus::Failed | ConnectionStatus::Disconnected => {
                    return Admission::Ignored;
                }
            };

            let reply = match (contact, established) {
                // Both sides connected at once; each numbering starts at zero
                (Contact::Hello, true) => {
                    conn.restart_inbound();
                    None
                }
                // Peer dropped its entry for us and is starting over
                (Contact::Hello, false) => {
                    tracing::info!("Peer {} restarted the session", peer);
                    conn.restart_streams();
                    conn.greet(Greeting::Welcome);
                    Some(Greeting::Welcome)
                }
                (Contact::Welcome, _) => {
                    conn.restart_inbound();
                    None
                }
                (Contact::Traffic | Contact::Signal, _) => None,
            };
            return Admission::Accepted { established, reply };
        }

        if !state.filter.admits(peer) {
            return Admission::Rejected;
        }

        let reply = match contact {
            Contact::Hello => Some(Greeting::Welcome),
            // Our side of the handshake never reached the peer
            Contact::Traffic => Some(Greeting::Hello),
            Contact::Welcome | Contact::Signal => None,
        };
        let mut conn = PeerConnection::connected(peer, contact == Contact::Hello);
        if let Some(greeting) = reply {
            conn.greet(greeting);
        }
        state.peers.insert(peer, conn);
        Admission::Accepted {
            established: true,
            reply,
        }
    }

    /// Remove an entry in any state and queue a closed notice.
    /// Unknown peers are ignored.
    pub fn close(&self, peer: PeerId, reason: CloseReason) -> bool {
        let mut state = self.lock();
        if state.remove(peer).is_none() {
            return false;
        }
        state.notices.push_back(ClosedNotice { peer, reason });
        true
    }

    /// `Connecting`/`Connected` → `Failed` with a closed notice
    pub fn fail(&self, peer: PeerId, retention: Option<Duration>) -> bool {
        self.lock().fail(peer, retention)
    }

    pub fn pop_notice(&self) -> Option<ClosedNotice> {
        self.lock().notices.pop_front()
    }

    /// Greetings not handed to the transport yet
    pub fn pending_greetings(&self) -> Vec<(PeerId, Greeting)> {
        self.lock()
            .peers
            .values()
            .filter_map(|c| c.pending_greeting.map(|g| (c.peer, g)))
            .collect()
    }

    pub fn greeting_sent(&self, peer: PeerId) {
        if let Some(conn) = self.lock().peers.get_mut(&peer) {
            conn.pending_greeting = None;
            conn.greeting_attempts = 0;
        }
    }

    /// Count a failed greeting hand-off. Returns true when this exhausted the
    /// attempts of a `Connecting` peer, which is now failed.
    pub fn greeting_failed(
        &self,
        peer: PeerId,
        max_attempts: u32,
        retention: Option<Duration>,
    ) -> bool {
        let mut state = self.lock();
        let Some(conn) = state.peers.get_mut(&peer) else {
            return false;
        };

        conn.greeting_attempts += 1;
        if conn.greeting_attempts < max_attempts {
            return false;
        }

        if conn.status == ConnectionStatus::Connecting {
            state.fail(peer, retention)
        } else {
            // Peer already talks to us; give up on the reply
            conn.pending_greeting = None;
            false
        }
    }

    /// Fail handshakes older than `connect_timeout` and purge failed entries
    /// kept longer than `retention`. Returns the peers that just failed.
    pub fn expire(
        &self,
        connect_timeout: Option<Duration>,
        retention: Option<Duration>,
    ) -> Vec<PeerId> {
        let mut state = self.lock();

        let timed_out: Vec<PeerId> = match connect_timeout {
            Some(timeout) => state
                .peers
                .values()
                .filter(|c| c.handshake_expired(timeout))
                .map(|c| c.peer)
                .collect(),
            None => Vec::new(),
        };
        for peer in &timed_out {
            state.fail(*peer, retention);
        }

        if let Some(retention) = retention {
            let stale: Vec<PeerId> = state
                .peers
                .values()
                .filter(|c| c.failure_expired(retention))
                .map(|c| c.peer)
                .collect();
            for peer in stale {
                tracing::debug!("Purging failed entry for {}", peer);
                state.remove(peer);
            }
        }

        timed_out
    }

    /// Reserve the next sequence number of an ordered stream while `hand_off`
    /// runs under the lock; the number is only consumed if it succeeds.
    /// Peers without an entry get `None` and nothing is recorded.
    pub fn with_outbound_seq<T, E>(
        &self,
        peer: PeerId,
        channel: u8,
        hand_off: impl FnOnce(Option<u16>) -> Result<T, E>,
    ) -> Result<T, E> {
        let mut state = self.lock();
        let Some(conn) = state.peers.get_mut(&peer) else {
            return hand_off(None);
        };
        let result = hand_off(Some(conn.outbound_seq(channel)))?;
        conn.advance_outbound(channel);
        Ok(result)
    }

    /// Feed a sequenced payload through the peer's reorder buffer.
    /// `None` if the peer has no entry.
    pub fn accept_sequenced(
        &self,
        peer: PeerId,
        channel: u8,
        seq: u16,
        payload: Bytes,
    ) -> Option<Vec<Bytes>> {
        self.lock()
            .peers
            .get_mut(&peer)
            .map(|conn| conn.accept_sequenced(channel, seq, payload))
    }

    pub fn add_sent(&self, peer: PeerId, bytes: usize) {
        if let Some(conn) = self.lock().peers.get_mut(&peer) {
            conn.bytes_sent += bytes as u64;
        }
    }

    pub fn add_received(&self, peer: PeerId, bytes: usize) {
        if let Some(conn) = self.lock().peers.get_mut(&peer) {
            conn.bytes_received += bytes as u64;
        }
    }

    pub fn set_route(&self, peer: PeerId, relayed: bool) {
        if let Some(conn) = self.lock().peers.get_mut(&peer) {
            conn.relayed = relayed;
        }
    }

    pub fn record_latency(&self, peer: PeerId, rtt_ms: u32) {
        if let Some(conn) = self.lock().peers.get_mut(&peer) {
            conn.record_latency(rtt_ms);
        }
    }

    pub fn contains(&self, peer: PeerId) -> bool {
        self.lock().peers.contains_key(&peer)
    }

    pub fn snapshot(&self, peer: PeerId) -> Option<ConnectionInfo> {
        self.lock().peers.get(&peer).map(PeerConnection::snapshot)
    }

    pub fn snapshots(&self) -> Vec<ConnectionInfo> {
        self.lock()
            .peers
            .values()
            .map(PeerConnection::snapshot)
            .collect()
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.lock().peers.keys().copied().collect()
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.lock()
            .peers
            .values()
            .filter(|c| c.status == ConnectionStatus::Connected)
            .map(|c| c.peer)
            .collect()
    }

    pub fn connected_count(&self) -> usize {
        self.lock()
            .peers
            .values()
            .filter(|c| c.status == ConnectionStatus::Connected)
            .count()
    }

    /// Drop every entry and pending notice
    pub fn clear(&self) {
        let mut state = self.lock();
        state.peers.clear();
        state.notices.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const P: PeerId = PeerId::from_raw(0x10);
    const Q: PeerId = PeerId::from_raw(0x20);

    fn accepted(established: bool, reply: Option<Greeting>) -> Admission {
        Admission::Accepted { established, reply }
    }

    #[test]
    fn test_connect_is_idempotent() {
        let registry = ConnectionRegistry::new(AcceptFilter::All);
        assert_eq!(registry.begin_connect(P), ConnectAction::Started);
        assert_eq!(registry.begin_connect(P), ConnectAction::AlreadyConnecting);
        assert_eq!(registry.pending_greetings(), vec![(P, Greeting::Hello)]);

        registry.greeting_sent(P);
        assert!(registry.pending_greetings().is_empty());

        assert_eq!(registry.admit(P, Contact::Welcome), accepted(true, None));
        assert_eq!(registry.begin_connect(P), ConnectAction::AlreadyConnected);
        assert_eq!(registry.connected_count(), 1);
    }

    #[test]
    fn test_admit_establishes_once() {
        let registry = ConnectionRegistry::new(AcceptFilter::All);
        assert_eq!(
            registry.admit(P, Contact::Hello),
            accepted(true, Some(Greeting::Welcome))
        );
        assert_eq!(registry.admit(P, Contact::Traffic), accepted(false, None));
        assert_eq!(registry.pending_greetings(), vec![(P, Greeting::Welcome)]);
    }

    #[test]
    fn test_first_contact_picks_the_reply() {
        let registry = ConnectionRegistry::new(AcceptFilter::All);
        assert_eq!(
            registry.admit(P, Contact::Traffic),
            accepted(true, Some(Greeting::Hello))
        );
        assert_eq!(registry.admit(Q, Contact::Signal), accepted(true, None));
        assert_eq!(registry.pending_greetings(), vec![(P, Greeting::Hello)]);
    }

    #[test]
    fn test_hello_while_connected_restarts_streams() {
        let registry = ConnectionRegistry::new(AcceptFilter::All);
        registry.admit(P, Contact::Hello);
        registry.greeting_sent(P);

        for expected in 0..3 {
            assert_eq!(
                registry.with_outbound_seq(P, 1, Ok::<_, ()>),
                Ok(Some(expected))
            );
        }
        let b = |s: &'static str| Bytes::from_static(s.as_bytes());
        assert_eq!(registry.accept_sequenced(P, 1, 0, b("a")), Some(vec![b("a")]));
        assert_eq!(registry.accept_sequenced(P, 1, 1, b("b")), Some(vec![b("b")]));

        // Peer forgot us and greets again
        assert_eq!(
            registry.admit(P, Contact::Hello),
            accepted(false, Some(Greeting::Welcome))
        );
        assert_eq!(registry.with_outbound_seq(P, 1, Ok::<_, ()>), Ok(Some(0)));
        assert_eq!(registry.accept_sequenced(P, 1, 0, b("c")), Some(vec![b("c")]));
        assert_eq!(registry.pending_greetings(), vec![(P, Greeting::Welcome)]);
    }

    #[test]
    fn test_welcome_never_answered() {
        let registry = ConnectionRegistry::new(AcceptFilter::All);
        registry.begin_connect(P);
        registry.greeting_sent(P);
        assert_eq!(registry.admit(P, Contact::Welcome), accepted(true, None));
        assert_eq!(registry.admit(P, Contact::Welcome), accepted(false, None));
        assert_eq!(registry.admit(Q, Contact::Welcome), accepted(true, None));
        assert!(registry.pending_greetings().is_empty());
    }

    #[test]
    fn test_filter_rejects_unknown_but_not_our_own_connects() {
        let registry = ConnectionRegistry::new(AcceptFilter::Only(Q));
        assert_eq!(registry.admit(P, Contact::Hello), Admission::Rejected);
        assert!(!registry.contains(P));

        registry.begin_connect(P);
        assert_eq!(registry.admit(P, Contact::Hello), accepted(true, None));
    }

    #[test]
    fn test_close_queues_notice_once() {
        let registry = ConnectionRegistry::new(AcceptFilter::All);
        assert!(!registry.close(P, CloseReason::Local));
        assert!(registry.pop_notice().is_none());

        registry.begin_connect(P);
        assert!(registry.close(P, CloseReason::Local));
        assert!(!registry.close(P, CloseReason::Local));
        assert_eq!(
            registry.pop_notice(),
            Some(ClosedNotice {
                peer: P,
                reason: CloseReason::Local
            })
        );
        assert!(registry.pop_notice().is_none());
    }

    #[test]
    fn test_greeting_attempts_exhaust_into_failure() {
        let registry = ConnectionRegistry::new(AcceptFilter::All);
        registry.begin_connect(P);

        assert!(!registry.greeting_failed(P, 3, None));
        assert!(!registry.greeting_failed(P, 3, None));
        assert!(registry.greeting_failed(P, 3, None));

        // Purged immediately by default
        assert!(!registry.contains(P));
        assert_eq!(registry.pop_notice().map(|n| n.reason), Some(CloseReason::Unreachable));
    }

    #[test]
    fn test_unsent_welcome_is_dropped_not_failed() {
        let registry = ConnectionRegistry::new(AcceptFilter::All);
        registry.admit(P, Contact::Hello);

        assert!(!registry.greeting_failed(P, 2, None));
        assert!(!registry.greeting_failed(P, 2, None));
        assert!(registry.pending_greetings().is_empty());
        assert_eq!(
            registry.snapshot(P).map(|c| c.status),
            Some(ConnectionStatus::Connected)
        );
    }

    #[test]
    fn test_retained_failure_ignores_traffic_until_retry() {
        let registry = ConnectionRegistry::new(AcceptFilter::All);
        let retention = Some(Duration::from_secs(60));
        registry.begin_connect(P);
        assert!(registry.fail(P, retention));
        assert!(!registry.fail(P, retention));

        assert_eq!(
            registry.snapshot(P).map(|c| c.status),
            Some(ConnectionStatus::Failed)
        );
        assert_eq!(registry.admit(P, Contact::Hello), Admission::Ignored);
        assert_eq!(registry.begin_connect(P), ConnectAction::Started);
        assert_eq!(
            registry.snapshot(P).map(|c| c.status),
            Some(ConnectionStatus::Connecting)
        );
    }

    #[test]
    fn test_expire_handshakes_and_failures() {
        let registry = ConnectionRegistry::new(AcceptFilter::All);
        registry.begin_connect(P);
        registry.admit(Q, Contact::Signal);

        let failed = registry.expire(Some(Duration::ZERO), Some(Duration::from_secs(60)));
        assert_eq!(failed, vec![P]);
        assert_eq!(
            registry.snapshot(Q).map(|c| c.status),
            Some(ConnectionStatus::Connected)
        );

        registry.expire(None, Some(Duration::ZERO));
        assert!(!registry.contains(P));
        assert!(registry.contains(Q));
    }

    #[test]
    fn test_outbound_seq_commits_only_on_success() {
        let registry = ConnectionRegistry::new(AcceptFilter::All);

        // No entry: nothing to number and nothing remembered
        assert_eq!(registry.with_outbound_seq(P, 1, Ok::<_, ()>), Ok(None));

        registry.begin_connect(P);
        assert_eq!(registry.with_outbound_seq(P, 1, Ok::<_, ()>), Ok(Some(0)));
        assert_eq!(
            registry.with_outbound_seq(P, 1, |_| Err::<Option<u16>, ()>(())),
            Err(())
        );
        assert_eq!(registry.with_outbound_seq(P, 1, Ok::<_, ()>), Ok(Some(1)));
        assert_eq!(registry.with_outbound_seq(P, 0, Ok::<_, ()>), Ok(Some(0)));

        registry.close(P, CloseReason::Local);
        registry.begin_connect(P);
        assert_eq!(registry.with_outbound_seq(P, 1, Ok::<_, ()>), Ok(Some(0)));
    }

    #[test]
    fn test_counters_and_stats() {
        let registry = ConnectionRegistry::new(AcceptFilter::All);
        registry.admit(P, Contact::Signal);
        registry.add_sent(P, 10);
        registry.add_received(P, 4);
        registry.set_route(P, true);
        registry.record_latency(P, 50);

        // Unknown peers are not tracked
        registry.add_sent(Q, 99);

        let info = registry.snapshot(P).unwrap();
        assert_eq!(info.bytes_sent, 10);
        assert_eq!(info.bytes_received, 4);
        assert!(info.relayed);
        assert_eq!(info.latency_ms, 50);
        assert!(registry.snapshot(Q).is_none());
    }
}
