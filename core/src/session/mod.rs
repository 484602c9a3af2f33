//! P2P Session
//!
//! Peer connections and packet exchange for one authenticated user.
//!
//! The transport side only ever pushes into the inbound queue. Everything a
//! consumer sees (handler calls, state transitions caused by traffic)
//! happens inside [`P2PSession::drain`], on the thread that calls it.

pub mod connection;
pub mod gateway;
pub mod pump;
pub mod queue;
pub mod registry;

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::config::{AcceptFilter, SessionConfig};
use crate::error::SessionError;
use crate::peer::{Authenticator, PeerId};
use crate::transport::{Datagram, Frame, Reliability, Transport, TransportSignal};

pub use connection::{CloseReason, ConnectionInfo, ConnectionStatus, Greeting};
use gateway::MessageGateway;
use pump::TransportPump;
use queue::{EventQueue, EventSink, InboundEvent};
use registry::{Admission, ConnectAction, ConnectionRegistry, Contact};

/// Application packet handed to the packet handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundPacket {
    pub sender: PeerId,
    pub channel: u8,
    pub payload: Bytes,
}

pub type ConnectedHandler = Box<dyn FnMut(&P2PSession, PeerId) + Send>;
pub type ClosedHandler = Box<dyn FnMut(&P2PSession, PeerId, CloseReason) + Send>;
pub type PacketHandler = Box<dyn FnMut(&P2PSession, InboundPacket) + Send>;

#[derive(Default)]
struct Handlers {
    connected: Option<ConnectedHandler>,
    closed: Option<ClosedHandler>,
    packet: Option<PacketHandler>,
    /// Bumped on every registration change
    generation: u64,
}

fn connected_slot(h: &mut Handlers) -> &mut Option<ConnectedHandler> {
    &mut h.connected
}

fn closed_slot(h: &mut Handlers) -> &mut Option<ClosedHandler> {
    &mut h.closed
}

fn packet_slot(h: &mut Handlers) -> &mut Option<PacketHandler> {
    &mut h.packet
}

/// Explicitly owned P2P service; hand it to whatever runs the game loop.
pub struct P2PSession {
    config: SessionConfig,
    local_id: PeerId,
    transport: Arc<dyn Transport>,
    registry: ConnectionRegistry,
    gateway: MessageGateway,
    queue: EventQueue,
    sink: EventSink,
    handlers: Mutex<Handlers>,
    /// Locally disconnected peers and the queue position of the first event
    /// pushed after the disconnect
    severed: Mutex<HashMap<PeerId, u64>>,
    pump: Mutex<Option<TransportPump>>,
    initialized: AtomicBool,
}

impl P2PSession {
    /// Open a session for the authenticated local user.
    pub fn initialize(
        config: SessionConfig,
        auth: &dyn Authenticator,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, SessionError> {
        if !auth.is_authenticated() {
            tracing::warn!("Must be logged in before initializing P2P");
            return Err(SessionError::NotAuthenticated);
        }
        let local_id = auth.local_identity();
        if local_id.is_nil() {
            tracing::warn!("Authenticator returned a nil identity");
            return Err(SessionError::NotAuthenticated);
        }

        config.validate()?;
        transport.open(&config.socket_name, config.allow_relay)?;

        let queue = EventQueue::bounded(config.queue_capacity);
        let sink = queue.sink();
        let gateway = MessageGateway::new(
            transport.clone(),
            local_id,
            config.max_packet_size as usize,
            config.channel_count,
        );

        tracing::info!(
            "P2P initialized as {} on socket '{}' (relay {})",
            local_id,
            config.socket_name,
            if config.allow_relay { "enabled" } else { "disabled" }
        );

        Ok(P2PSession {
            registry: ConnectionRegistry::new(config.accept_filter),
            config,
            local_id,
            transport,
            gateway,
            queue,
            sink,
            handlers: Mutex::new(Handlers::default()),
            severed: Mutex::new(HashMap::new()),
            pump: Mutex::new(None),
            initialized: AtomicBool::new(true),
        })
    }

    /// Close every connection and release the transport. Pending events are
    /// discarded and no handler fires. Later calls are no-ops.
    pub fn shutdown(&self) {
        if !self.initialized.swap(false, Ordering::SeqCst) {
            return;
        }

        self.stop_pump();
        for peer in self.registry.peer_ids() {
            self.transport.close_peer(peer);
        }
        self.registry.clear();
        self.lock_severed().clear();
        self.queue.close();
        self.transport.close();

        tracing::info!("P2P shutdown");
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    fn ensure_initialized(&self) -> Result<(), SessionError> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(SessionError::NotInitialized)
        }
    }

    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    // ---- acceptance policy ----

    /// Let any peer open a connection to us
    pub fn accept_all(&self) {
        self.registry.set_filter(AcceptFilter::All);
    }

    /// Only `peer` may open a connection to us; others are dropped silently
    pub fn accept_only(&self, peer: PeerId) {
        self.registry.set_filter(AcceptFilter::Only(peer));
    }

    pub fn accept_filter(&self) -> AcceptFilter {
        self.registry.filter()
    }

    // ---- connections ----

    /// Start connecting to `peer`. Repeated calls while connecting or
    /// connected do nothing; a failed peer is retried.
    pub fn connect(&self, peer: PeerId) -> Result<(), SessionError> {
        self.ensure_initialized()?;
        self.gateway.validate_peer(peer)?;

        match self.registry.begin_connect(peer) {
            ConnectAction::Started => {
                tracing::info!("Connecting to peer {}", peer);
                self.lock_severed().remove(&peer);
                self.send_greeting(peer, Greeting::Hello);
            }
            ConnectAction::AlreadyConnecting => {
                tracing::debug!("Already connecting to {}", peer);
            }
            ConnectAction::AlreadyConnected => {
                tracing::debug!("Already connected to {}", peer);
            }
        }
        Ok(())
    }

    /// Drop the connection to `peer`. The closed handler fires on the next
    /// `drain`. Unknown peers are ignored.
    pub fn disconnect(&self, peer: PeerId) {
        if !self.is_initialized() {
            return;
        }
        if self.registry.close(peer, CloseReason::Local) {
            if !self.queue.is_empty() {
                self.lock_severed().insert(peer, self.queue.pushed_count());
            }
            self.transport.close_peer(peer);
            tracing::info!("Disconnected from peer {}", peer);
        }
    }

    pub fn disconnect_all(&self) {
        for peer in self.registry.peer_ids() {
            self.disconnect(peer);
        }
    }

    fn send_greeting(&self, peer: PeerId, greeting: Greeting) {
        match self.gateway.send_greeting(peer, greeting) {
            Ok(()) => self.registry.greeting_sent(peer),
            Err(e) => {
                tracing::debug!("{:?} to {} not queued: {}", greeting, peer, e);
                let exhausted = self.registry.greeting_failed(
                    peer,
                    self.config.max_send_attempts,
                    self.config.failed_retention_period(),
                );
                if exhausted {
                    tracing::warn!(
                        "Peer {} unreachable after {} attempts",
                        peer,
                        self.config.max_send_attempts
                    );
                }
            }
        }
    }

    // ---- messaging ----

    /// Send one packet. `Ok` means the transport accepted it, not that it
    /// arrived.
    pub fn send(
        &self,
        peer: PeerId,
        payload: &[u8],
        channel: u8,
        reliability: Reliability,
    ) -> Result<(), SessionError> {
        self.ensure_initialized()?;
        self.gateway
            .send(&self.registry, peer, payload, channel, reliability)
    }

    /// Send to every connected peer; returns how many were handed the packet
    pub fn broadcast(
        &self,
        payload: &[u8],
        channel: u8,
        reliability: Reliability,
    ) -> Result<usize, SessionError> {
        self.ensure_initialized()?;
        self.gateway
            .broadcast(&self.registry, payload, channel, reliability)
    }

    // ---- transport pumping ----

    /// Move up to `budget` transport events into the inbound queue.
    /// Safe to call from any thread.
    pub fn poll_transport(&self, budget: usize) -> usize {
        if !self.is_initialized() {
            return 0;
        }
        pump::pump_once(self.transport.as_ref(), &self.sink, budget)
    }

    /// Pump the transport from a background thread until stopped
    pub fn start_pump(&self) -> Result<(), SessionError> {
        self.ensure_initialized()?;
        let mut pump = self.pump.lock().unwrap_or_else(PoisonError::into_inner);
        if pump.as_ref().is_some_and(TransportPump::is_running) {
            return Ok(());
        }
        *pump = Some(TransportPump::spawn(
            self.transport.clone(),
            self.sink.clone(),
            self.config.pump_interval(),
        )?);
        Ok(())
    }

    pub fn stop_pump(&self) {
        let pump = self
            .pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut pump) = pump {
            pump.stop();
        }
    }

    // ---- dispatch ----

    /// Per-frame tick. Processes up to `max_items` pending events in order,
    /// calling handlers on this thread. Returns the number processed.
    pub fn drain(&self, max_items: usize) -> usize {
        if !self.is_initialized() {
            return 0;
        }

        for (peer, greeting) in self.registry.pending_greetings() {
            self.send_greeting(peer, greeting);
        }
        for peer in self.registry.expire(
            self.config.connect_timeout(),
            self.config.failed_retention_period(),
        ) {
            tracing::warn!("Handshake with {} timed out", peer);
        }

        let mut processed = 0;
        while processed < max_items && self.is_initialized() {
            if let Some(notice) = self.registry.pop_notice() {
                tracing::info!("Connection with {} closed ({:?})", notice.peer, notice.reason);
                self.fire_closed(notice.peer, notice.reason);
            } else if let Some((position, event)) = self.queue.pop_numbered() {
                if self.predates_disconnect(event.peer(), position) {
                    tracing::trace!("Dropping event from disconnected peer {}", event.peer());
                    processed += 1;
                    continue;
                }
                match event {
                    InboundEvent::Datagram(datagram) => self.dispatch_datagram(datagram),
                    InboundEvent::Signal(signal) => self.dispatch_signal(signal),
                }
            } else {
                break;
            }
            processed += 1;
        }
        processed
    }

    fn lock_severed(&self) -> MutexGuard<'_, HashMap<PeerId, u64>> {
        self.severed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// True if the event at `position` comes from a peer we disconnected
    /// after it was queued. Cut-offs the queue has moved past are dropped.
    fn predates_disconnect(&self, peer: PeerId, position: u64) -> bool {
        let mut severed = self.lock_severed();
        if severed.is_empty() {
            return false;
        }
        let hit = severed.get(&peer).is_some_and(|cutoff| position < *cutoff);
        severed.retain(|_, cutoff| *cutoff > position + 1);
        hit
    }

    fn dispatch_datagram(&self, datagram: Datagram) {
        let Datagram {
            sender,
            channel,
            data,
        } = datagram;

        if self.gateway.validate_peer(sender).is_err() {
            tracing::warn!("Dropping datagram with invalid sender {}", sender);
            return;
        }
        if u16::from(channel) >= self.config.channel_count {
            tracing::debug!("Dropping datagram from {} on unknown channel {}", sender, channel);
            return;
        }
        let frame = match Frame::decode(data) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("Malformed datagram from {}: {}", sender, e);
                return;
            }
        };

        let contact = match frame {
            Frame::Hello => Contact::Hello,
            Frame::Welcome => Contact::Welcome,
            Frame::Data(_) | Frame::Sequenced { .. } => Contact::Traffic,
        };
        if !self.admit(sender, contact) {
            return;
        }

        let payloads = match frame {
            Frame::Hello | Frame::Welcome => {
                tracing::trace!("{:?} from {}", contact, sender);
                return;
            }
            Frame::Data(payload) => {
                self.registry.add_received(sender, payload.len());
                vec![payload]
            }
            Frame::Sequenced { seq, payload } => {
                self.registry.add_received(sender, payload.len());
                match self
                    .registry
                    .accept_sequenced(sender, channel, seq, payload)
                {
                    Some(ready) => ready,
                    None => return,
                }
            }
        };

        for payload in payloads {
            // A handler may have disconnected the sender mid-batch
            if !self.registry.contains(sender) {
                break;
            }
            self.fire_packet(InboundPacket {
                sender,
                channel,
                payload,
            });
        }
    }

    /// Run the accept path for traffic from `peer`. Returns false when the
    /// traffic must be dropped.
    fn admit(&self, peer: PeerId, contact: Contact) -> bool {
        match self.registry.admit(peer, contact) {
            Admission::Rejected => {
                tracing::debug!("Ignoring connection request from {} (not accepted)", peer);
                false
            }
            Admission::Ignored => {
                tracing::debug!("Ignoring traffic from failed peer {}", peer);
                false
            }
            Admission::Accepted { established, reply } => {
                if let Some(greeting) = reply {
                    self.send_greeting(peer, greeting);
                }
                if established {
                    tracing::info!("Connection established with peer {}", peer);
                    self.fire_connected(peer);
                }
                self.is_initialized() && self.registry.contains(peer)
            }
        }
    }

    fn dispatch_signal(&self, signal: TransportSignal) {
        let retention = self.config.failed_retention_period();

        match signal {
            TransportSignal::Established { peer, relayed } => {
                if relayed && !self.config.allow_relay {
                    tracing::warn!("Relay route to {} while relay is disabled", peer);
                    self.registry.fail(peer, retention);
                    return;
                }
                self.registry.set_route(peer, relayed);
                if self.admit(peer, Contact::Signal) {
                    // Entries created by the signal itself start out direct
                    self.registry.set_route(peer, relayed);
                }
            }
            TransportSignal::Route { peer, relayed } => {
                if relayed && !self.config.allow_relay {
                    tracing::warn!("Relay route to {} while relay is disabled", peer);
                    self.registry.fail(peer, retention);
                } else {
                    tracing::debug!("Route to {} is now {}", peer, if relayed { "relayed" } else { "direct" });
                    self.registry.set_route(peer, relayed);
                }
            }
            TransportSignal::Latency { peer, rtt_ms } => {
                self.registry.record_latency(peer, rtt_ms);
            }
            TransportSignal::Closed { peer } => {
                self.registry.close(peer, CloseReason::Remote);
            }
            TransportSignal::Unreachable { peer } => {
                if self.registry.fail(peer, retention) {
                    tracing::warn!("Transport gave up reaching {}", peer);
                }
            }
        }
    }

    // ---- handlers ----

    pub fn on_connected(&self, handler: impl FnMut(&P2PSession, PeerId) + Send + 'static) {
        let handler: ConnectedHandler = Box::new(handler);
        self.register(connected_slot, handler);
    }

    pub fn on_closed(
        &self,
        handler: impl FnMut(&P2PSession, PeerId, CloseReason) + Send + 'static,
    ) {
        let handler: ClosedHandler = Box::new(handler);
        self.register(closed_slot, handler);
    }

    pub fn on_packet(&self, handler: impl FnMut(&P2PSession, InboundPacket) + Send + 'static) {
        let handler: PacketHandler = Box::new(handler);
        self.register(packet_slot, handler);
    }

    pub fn clear_handlers(&self) {
        let mut handlers = self.lock_handlers();
        handlers.connected = None;
        handlers.closed = None;
        handlers.packet = None;
        handlers.generation += 1;
    }

    fn lock_handlers(&self) -> MutexGuard<'_, Handlers> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register<H>(&self, slot: fn(&mut Handlers) -> &mut Option<H>, handler: H) {
        let mut handlers = self.lock_handlers();
        *slot(&mut handlers) = Some(handler);
        handlers.generation += 1;
    }

    /// Call a handler with no lock held. The handler is taken out of its slot
    /// for the duration and put back unless registrations changed meanwhile.
    fn invoke<H>(&self, slot: fn(&mut Handlers) -> &mut Option<H>, call: impl FnOnce(&mut H)) {
        let (taken, generation) = {
            let mut handlers = self.lock_handlers();
            (slot(&mut handlers).take(), handlers.generation)
        };
        let Some(mut handler) = taken else {
            return;
        };

        call(&mut handler);

        let mut handlers = self.lock_handlers();
        if handlers.generation == generation {
            *slot(&mut handlers) = Some(handler);
        }
    }

    fn fire_connected(&self, peer: PeerId) {
        self.invoke(connected_slot, |h| h(self, peer));
    }

    fn fire_closed(&self, peer: PeerId, reason: CloseReason) {
        self.invoke(closed_slot, |h| h(self, peer, reason));
    }

    fn fire_packet(&self, packet: InboundPacket) {
        self.invoke(packet_slot, |h| h(self, packet));
    }

    // ---- queries ----

    pub fn connection_of(&self, peer: PeerId) -> Option<ConnectionInfo> {
        self.registry.snapshot(peer)
    }

    pub fn all_connections(&self) -> Vec<ConnectionInfo> {
        self.registry.snapshots()
    }

    pub fn is_connected_to(&self, peer: PeerId) -> bool {
        self.registry
            .snapshot(peer)
            .is_some_and(|c| c.status == ConnectionStatus::Connected)
    }

    pub fn connected_count(&self) -> usize {
        self.registry.connected_count()
    }

    /// Events waiting in the inbound queue
    pub fn queued_events(&self) -> usize {
        self.queue.len()
    }
}

impl Drop for P2PSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}
