//! Transport Module
//!
//! The delivery seam used by the session, its datagram framing, and an
//! in-memory implementation.

pub mod adapter;
pub mod frame;
pub mod loopback;

// Re-exports for convenience
pub use adapter::{Datagram, Reliability, Transport, TransportError, TransportSignal};
pub use frame::{Frame, FrameError, FrameKind, HELLO_MARKER, WELCOME_MARKER};
pub use loopback::{LoopbackAuthenticator, LoopbackNetwork, LoopbackTransport};
