//! Transport Pump
//!
//! Moves datagrams and connection signals from the transport into the
//! inbound queue. Runs either inline (`pump_once`) or on its own thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::queue::{EventSink, InboundEvent, PushError};
use crate::transport::Transport;

/// Events moved per pass of the background loop before re-checking the stop flag
const PUMP_BATCH: usize = 64;

/// Move up to `budget` events from the transport into the queue.
///
/// Stops early when the transport is idle or the queue is full; a full queue
/// leaves the remaining datagrams in the transport's own buffer.
pub fn pump_once(transport: &dyn Transport, sink: &EventSink, budget: usize) -> usize {
    let mut moved = 0;

    while moved < budget {
        let slot = match sink.try_reserve() {
            Ok(slot) => slot,
            Err(PushError::Full) => {
                tracing::trace!("Inbound queue full, leaving datagrams with the transport");
                break;
            }
            Err(PushError::Closed) => break,
        };

        let event = if let Some(signal) = transport.poll_signal() {
            InboundEvent::Signal(signal)
        } else if let Some(datagram) = transport.poll_received() {
            InboundEvent::Datagram(datagram)
        } else {
            break;
        };

        slot.send(event);
        moved += 1;
    }

    moved
}

/// Background delivery thread
pub struct TransportPump {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl TransportPump {
    pub fn spawn(
        transport: Arc<dyn Transport>,
        sink: EventSink,
        idle_interval: Duration,
    ) -> std::io::Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let thread_running = running.clone();

        let handle = thread::Builder::new()
            .name("peerlink-pump".into())
            .spawn(move || {
                tracing::info!("Transport pump started");

                while thread_running.load(Ordering::SeqCst) {
                    let moved = pump_once(transport.as_ref(), &sink, PUMP_BATCH);
                    if sink.is_closed() {
                        break;
                    }
                    if moved == 0 {
                        thread::sleep(idle_interval);
                    }
                }

                tracing::info!("Transport pump stopped");
            })?;

        Ok(TransportPump {
            running,
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
            && self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Signal the thread and wait for it to exit
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("Transport pump thread panicked");
            }
        }
    }
}

impl Drop for TransportPump {
    fn drop(&mut self) {
        self.stop();
    }
}
