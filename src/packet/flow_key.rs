//! TCP flow identification
//!
//! A `FlowKey` names one bidirectional TCP connection. It remembers the
//! orientation of the packet it was built from, but equality and hashing only
//! look at the unordered endpoint pair, so both directions of a connection
//! land on the same key.

use core::fmt;
use core::hash::{Hash, Hasher};
use core::net::SocketAddr;

/// Identifies a TCP connection by its two endpoints, independent of direction.
#[derive(Debug, Clone, Copy)]
pub struct FlowKey {
    source: SocketAddr,
    destination: SocketAddr,
}

impl FlowKey {
    pub fn new(source: SocketAddr, destination: SocketAddr) -> Self {
        Self {
            source,
            destination,
        }
    }

    /// Sender of the packet this key was built from.
    pub fn source(&self) -> SocketAddr {
        self.source
    }

    /// Receiver of the packet this key was built from.
    pub fn destination(&self) -> SocketAddr {
        self.destination
    }

    /// Endpoints in canonical (lower first) order.
    pub fn endpoints(&self) -> (SocketAddr, SocketAddr) {
        if self.source <= self.destination {
            (self.source, self.destination)
        } else {
            (self.destination, self.source)
        }
    }
}

impl PartialEq for FlowKey {
    fn eq(&self, other: &Self) -> bool {
        self.endpoints() == other.endpoints()
    }
}

impl Eq for FlowKey {}

impl Hash for FlowKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Hash the canonical pair so both orientations collide
        let (low, high) = self.endpoints();
        low.hash(state);
        high.hash(state);
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.source, self.destination)
    }
}
