//! Interfaces to the enclosing overlay node.
//!
//! The bonding core never touches sockets, key material, or the system
//! clock itself; the node hands those capabilities in through the traits
//! here. Everything is fire-and-forget and non-blocking so the core can be
//! driven from hot packet paths.

use std::net::SocketAddr;

use rand::rngs::OsRng;
use rand::RngCore;

use crate::path::LocalSocket;
use crate::proto::Verb;

/// Monotonic millisecond clock.
pub trait Clock: Send + Sync {
    fn now(&self) -> i64;
}

/// Egress and interface resolution provided by the node.
pub trait Transport: Send + Sync {
    /// Frame and transmit a bonding verb to `peer` over a specific path.
    /// Fire-and-forget: errors are swallowed by the transport.
    fn put_packet(
        &self,
        peer: u64,
        local_socket: LocalSocket,
        addr: SocketAddr,
        verb: Verb,
        payload: &[u8],
    );

    /// Resolve a local socket handle to its OS interface name. Names longer
    /// than [`crate::link::IFNAME_MAX_LEN`] bytes are truncated by the
    /// registry.
    fn interface_name(&self, local_socket: LocalSocket) -> Option<String>;
}

/// Source of unpredictable bytes for randomized path selection.
pub trait SecureEntropy: Send + Sync {
    fn fill(&self, buf: &mut [u8]);

    fn byte(&self) -> u8 {
        let mut b = [0u8; 1];
        self.fill(&mut b);
        b[0]
    }
}

/// Default entropy source backed by the operating system RNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsEntropy;

impl SecureEntropy for OsEntropy {
    fn fill(&self, buf: &mut [u8]) {
        OsRng.fill_bytes(buf);
    }
}

/// Identity and capability facts about a remote peer, captured by the node
/// when the bond is created. The bond holds a copy rather than a handle, so
/// peer and bond lifetimes stay independent.
#[derive(Debug, Clone)]
pub struct PeerProfile {
    /// 40-bit overlay address of the peer.
    pub address: u64,
    /// Whether the peer's protocol version supports multipath bonding.
    pub multipath_supported: bool,
    /// Whether the peer's protocol version accepts bare ECHO heartbeats.
    pub echo_supported: bool,
}

impl PeerProfile {
    pub fn new(address: u64) -> Self {
        Self {
            address,
            multipath_supported: true,
            echo_supported: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_os_entropy_fills_buffer() {
        let entropy = OsEntropy;
        let mut a = [0u8; 16];
        let mut b = [0u8; 16];
        entropy.fill(&mut a);
        entropy.fill(&mut b);
        // Two 128-bit draws colliding would mean the source is broken.
        assert_ne!(a, b);
    }
}
