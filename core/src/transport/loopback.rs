//! Loopback Transport
//!
//! In-process stand-in for the relay service. Endpoints created from the
//! same `LoopbackNetwork` can reach each other when they are open on the
//! same socket name. Used by the test suite and for local demos.

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::adapter::{Datagram, Reliability, Transport, TransportError, TransportSignal};
use crate::peer::{Authenticator, PeerId};

#[derive(Debug, Default)]
struct Endpoint {
    socket: Option<String>,
    inbox: VecDeque<Datagram>,
    signals: VecDeque<TransportSignal>,
    refused_sends: u32,
    send_calls: u64,
}

#[derive(Debug)]
struct Hub {
    endpoints: HashMap<PeerId, Endpoint>,
    rng: StdRng,
    loss_rate: f64,
}

/// Shared medium connecting loopback endpoints
#[derive(Debug, Clone)]
pub struct LoopbackNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl Default for LoopbackNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Deterministic ids and loss pattern
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        LoopbackNetwork {
            hub: Arc::new(Mutex::new(Hub {
                endpoints: HashMap::new(),
                rng,
                loss_rate: 0.0,
            })),
        }
    }

    /// Register a new endpoint under a fresh random id
    pub fn endpoint(&self) -> LoopbackTransport {
        let mut hub = lock(&self.hub);
        let id = loop {
            let candidate = PeerId::from_raw(hub.rng.gen());
            if !candidate.is_nil() && !hub.endpoints.contains_key(&candidate) {
                break candidate;
            }
        };
        hub.endpoints.insert(id, Endpoint::default());

        LoopbackTransport {
            id,
            hub: self.hub.clone(),
        }
    }

    /// Fraction of `UnreliableUnordered` datagrams silently dropped
    pub fn set_loss_rate(&self, rate: f64) {
        lock(&self.hub).loss_rate = rate.clamp(0.0, 1.0);
    }
}

/// One endpoint on a `LoopbackNetwork`
#[derive(Debug, Clone)]
pub struct LoopbackTransport {
    id: PeerId,
    hub: Arc<Mutex<Hub>>,
}

impl LoopbackTransport {
    pub fn local_id(&self) -> PeerId {
        self.id
    }

    /// Authenticator reporting this endpoint's id
    pub fn authenticator(&self) -> LoopbackAuthenticator {
        LoopbackAuthenticator {
            id: self.id,
            authenticated: true,
        }
    }

    /// Make the next `count` sends fail with `WouldBlock`
    pub fn refuse_sends(&self, count: u32) {
        self.with_endpoint(|ep| ep.refused_sends = count);
    }

    /// Number of `try_send` calls seen, refused ones included
    pub fn send_calls(&self) -> u64 {
        self.with_endpoint(|ep| ep.send_calls)
    }

    /// Datagrams waiting to be polled
    pub fn pending(&self) -> usize {
        self.with_endpoint(|ep| ep.inbox.len())
    }

    /// Reverse the order of waiting datagrams
    pub fn reverse_inbox(&self) {
        self.with_endpoint(|ep| {
            let reversed: VecDeque<Datagram> = ep.inbox.drain(..).rev().collect();
            ep.inbox = reversed;
        });
    }

    pub fn inject_signal(&self, signal: TransportSignal) {
        self.with_endpoint(|ep| ep.signals.push_back(signal));
    }

    pub fn inject_datagram(&self, sender: PeerId, channel: u8, data: Bytes) {
        self.with_endpoint(|ep| {
            ep.inbox.push_back(Datagram {
                sender,
                channel,
                data,
            })
        });
    }

    fn with_endpoint<T: Default>(&self, f: impl FnOnce(&mut Endpoint) -> T) -> T {
        let mut hub = lock(&self.hub);
        hub.endpoints.get_mut(&self.id).map(f).unwrap_or_default()
    }
}

impl Transport for LoopbackTransport {
    fn open(&self, socket_name: &str, _allow_relay: bool) -> Result<(), TransportError> {
        let mut hub = lock(&self.hub);
        let ep = hub
            .endpoints
            .get_mut(&self.id)
            .ok_or_else(|| TransportError::Unavailable("endpoint not registered".into()))?;
        ep.socket = Some(socket_name.to_string());
        tracing::debug!("Loopback endpoint {} open on '{}'", self.id, socket_name);
        Ok(())
    }

    fn try_send(
        &self,
        peer: PeerId,
        data: &[u8],
        channel: u8,
        reliability: Reliability,
    ) -> Result<(), TransportError> {
        let mut guard = lock(&self.hub);
        let hub = &mut *guard;

        let socket = {
            let me = hub.endpoints.get_mut(&self.id).ok_or(TransportError::Closed)?;
            me.send_calls += 1;
            if me.refused_sends > 0 {
                me.refused_sends -= 1;
                return Err(TransportError::WouldBlock);
            }
            me.socket.clone().ok_or(TransportError::Closed)?
        };

        if reliability == Reliability::UnreliableUnordered
            && hub.loss_rate > 0.0
            && hub.rng.gen::<f64>() < hub.loss_rate
        {
            tracing::trace!("Loopback dropped unreliable datagram to {}", peer);
            return Ok(());
        }

        match hub.endpoints.get_mut(&peer) {
            Some(target) if target.socket.as_deref() == Some(socket.as_str()) => {
                target.inbox.push_back(Datagram {
                    sender: self.id,
                    channel,
                    data: Bytes::copy_from_slice(data),
                });
            }
            _ => {
                // Reliable traffic to nobody ends with the relay giving up
                if reliability.is_reliable() {
                    if let Some(me) = hub.endpoints.get_mut(&self.id) {
                        me.signals.push_back(TransportSignal::Unreachable { peer });
                    }
                }
            }
        }
        Ok(())
    }

    fn poll_received(&self) -> Option<Datagram> {
        self.with_endpoint(|ep| ep.inbox.pop_front())
    }

    fn poll_signal(&self) -> Option<TransportSignal> {
        self.with_endpoint(|ep| ep.signals.pop_front())
    }

    fn close_peer(&self, peer: PeerId) {
        let mut hub = lock(&self.hub);
        let socket = hub.endpoints.get_mut(&self.id).and_then(|ep| {
            ep.inbox.retain(|d| d.sender != peer);
            ep.socket.clone()
        });
        if let Some(target) = hub.endpoints.get_mut(&peer) {
            if socket.is_some() && target.socket == socket {
                target
                    .signals
                    .push_back(TransportSignal::Closed { peer: self.id });
            }
        }
    }

    fn close(&self) {
        self.with_endpoint(|ep| {
            ep.socket = None;
            ep.inbox.clear();
            ep.signals.clear();
        });
    }
}

/// Authenticator for loopback endpoints
#[derive(Debug, Clone)]
pub struct LoopbackAuthenticator {
    id: PeerId,
    authenticated: bool,
}

impl LoopbackAuthenticator {
    pub fn signed_out(id: PeerId) -> Self {
        LoopbackAuthenticator {
            id,
            authenticated: false,
        }
    }
}

impl Authenticator for LoopbackAuthenticator {
    fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    fn local_identity(&self) -> PeerId {
        self.id
    }
}

fn lock(hub: &Mutex<Hub>) -> MutexGuard<'_, Hub> {
    hub.lock().unwrap_or_else(PoisonError::into_inner)
}
