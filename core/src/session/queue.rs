//! Inbound Event Queue
//!
//! Bounded hand-off between the transport pump and the dispatch thread.
//! Producers only ever push; the single consumer pops inside `drain`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc::{self, error::TrySendError, Permit};

use crate::peer::PeerId;
use crate::transport::{Datagram, TransportSignal};

/// Something the transport produced for the dispatch loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    Datagram(Datagram),
    Signal(TransportSignal),
}

impl InboundEvent {
    /// Remote peer the event is about
    pub fn peer(&self) -> PeerId {
        match self {
            InboundEvent::Datagram(d) => d.sender,
            InboundEvent::Signal(s) => s.peer(),
        }
    }
}

/// Consumer side of the queue.
///
/// Every event gets a position: the number of events that entered the queue
/// before it. Positions only count completed pushes, never reserved slots.
#[derive(Debug)]
pub struct EventQueue {
    tx: mpsc::Sender<InboundEvent>,
    rx: Mutex<Receiver>,
    pushed: Arc<AtomicU64>,
}

#[derive(Debug)]
struct Receiver {
    rx: mpsc::Receiver<InboundEvent>,
    popped: u64,
}

impl EventQueue {
    pub fn bounded(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        EventQueue {
            tx,
            rx: Mutex::new(Receiver { rx, popped: 0 }),
            pushed: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Producer handle for the transport side
    pub fn sink(&self) -> EventSink {
        EventSink {
            tx: self.tx.clone(),
            pushed: self.pushed.clone(),
        }
    }

    /// Next event in FIFO order, never blocks
    pub fn try_pop(&self) -> Option<InboundEvent> {
        self.pop_numbered().map(|(_, event)| event)
    }

    /// Next event together with its position
    pub fn pop_numbered(&self) -> Option<(u64, InboundEvent)> {
        let mut receiver = self.rx.lock().unwrap_or_else(PoisonError::into_inner);
        let event = receiver.rx.try_recv().ok()?;
        let position = receiver.popped;
        receiver.popped += 1;
        Some((position, event))
    }

    /// Events that completed a push so far; the next one gets this position
    pub fn pushed_count(&self) -> u64 {
        self.pushed.load(Ordering::SeqCst)
    }

    /// Events queued or reserved by producers
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Refuse further pushes and drop whatever is still queued
    pub fn close(&self) {
        let mut receiver = self.rx.lock().unwrap_or_else(PoisonError::into_inner);
        receiver.rx.close();
        while receiver.rx.try_recv().is_ok() {
            receiver.popped += 1;
        }
    }
}

/// Producer side of the queue; cheap to clone and `Send`
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<InboundEvent>,
    pushed: Arc<AtomicU64>,
}

/// Reserved queue slot; the event is counted when it is sent
#[derive(Debug)]
pub struct Slot<'a> {
    permit: Permit<'a, InboundEvent>,
    pushed: &'a AtomicU64,
}

impl Slot<'_> {
    pub fn send(self, event: InboundEvent) {
        self.permit.send(event);
        self.pushed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Why a push did not happen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushError {
    Full,
    Closed,
}

impl EventSink {
    /// Push one event, handing it back when the queue cannot take it
    pub fn try_push(&self, event: InboundEvent) -> Result<(), (PushError, InboundEvent)> {
        self.tx.try_send(event).map_err(|e| match e {
            TrySendError::Full(event) => (PushError::Full, event),
            TrySendError::Closed(event) => (PushError::Closed, event),
        })?;
        self.pushed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Hold a slot before pulling anything off the transport
    pub fn try_reserve(&self) -> Result<Slot<'_>, PushError> {
        let permit = self.tx.try_reserve().map_err(|e| match e {
            TrySendError::Full(()) => PushError::Full,
            TrySendError::Closed(()) => PushError::Closed,
        })?;
        Ok(Slot {
            permit,
            pushed: &self.pushed,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn datagram(n: u8) -> InboundEvent {
        InboundEvent::Datagram(Datagram {
            sender: PeerId::from_raw(1),
            channel: 0,
            data: Bytes::copy_from_slice(&[n]),
        })
    }

    #[test]
    fn test_fifo_and_bound() {
        let queue = EventQueue::bounded(2);
        let sink = queue.sink();

        assert!(sink.try_push(datagram(1)).is_ok());
        assert!(sink.try_push(datagram(2)).is_ok());
        let (err, rejected) = sink.try_push(datagram(3)).unwrap_err();
        assert_eq!(err, PushError::Full);
        assert_eq!(rejected, datagram(3));
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.try_pop(), Some(datagram(1)));
        assert_eq!(queue.try_pop(), Some(datagram(2)));
        assert_eq!(queue.try_pop(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_push_from_other_thread() {
        let queue = EventQueue::bounded(16);
        let sink = queue.sink();

        std::thread::spawn(move || {
            for n in 0..10 {
                sink.try_push(datagram(n)).unwrap();
            }
        })
        .join()
        .unwrap();

        for n in 0..10 {
            assert_eq!(queue.try_pop(), Some(datagram(n)));
        }
    }

    #[test]
    fn test_close_rejects_producers() {
        let queue = EventQueue::bounded(4);
        let sink = queue.sink();
        sink.try_push(datagram(1)).unwrap();

        queue.close();
        assert!(sink.is_closed());
        assert_eq!(queue.try_pop(), None);
        assert_eq!(sink.try_reserve().err(), Some(PushError::Closed));
    }

    #[test]
    fn test_positions_skip_unfilled_reservations() {
        let queue = EventQueue::bounded(4);
        let sink = queue.sink();

        let slot = sink.try_reserve().unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pushed_count(), 0);

        sink.try_push(datagram(1)).unwrap();
        assert_eq!(queue.pushed_count(), 1);
        slot.send(datagram(2));
        assert_eq!(queue.pushed_count(), 2);

        assert_eq!(queue.pop_numbered(), Some((0, datagram(1))));
        assert_eq!(queue.pop_numbered(), Some((1, datagram(2))));
        assert_eq!(queue.pop_numbered(), None);
    }
}
