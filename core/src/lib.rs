//! PeerLink Core Library
//! Peer connections and reliable messaging over a relay transport

pub mod config;
pub mod error;
pub mod peer;
pub mod session;
pub mod transport;

pub use config::{AcceptFilter, FailedRetention, SessionConfig};
pub use error::{SessionError, ValidationError};
pub use peer::{Authenticator, PeerId};
pub use session::{CloseReason, ConnectionInfo, ConnectionStatus, InboundPacket, P2PSession};
pub use transport::{Reliability, Transport, TransportError};

/// Initialize the core library (logging)
pub fn init() {
    // Hosts may call this from several entry points; "already set" is a no-op.
    let _ = tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(tracing::Level::INFO)
            .finish(),
    );

    tracing::info!("PeerLink Core Initialized (logger ready)");
}
