//! Peer Identity
//!
//! Opaque peer identifiers and the authentication seam that provides the
//! local one.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identifier of a remote participant.
///
/// Ids are issued by the identity provider; the session only compares them.
/// The zero value is the nil id and never names a real peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(u64);

impl PeerId {
    /// The nil id
    pub const NIL: PeerId = PeerId(0);

    /// Wrap a raw id handed out by an identity provider
    pub const fn from_raw(raw: u64) -> Self {
        PeerId(raw)
    }

    pub const fn as_raw(&self) -> u64 {
        self.0
    }

    pub const fn is_nil(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Source of the local identity.
///
/// The session refuses to initialize unless the user is authenticated.
pub trait Authenticator {
    fn is_authenticated(&self) -> bool;

    /// Stable id of the local user
    fn local_identity(&self) -> PeerId;
}
