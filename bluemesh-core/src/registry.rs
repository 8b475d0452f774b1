//! Connection registry: which peers currently have a live connection.

use std::collections::HashSet;
use std::fmt;

use parking_lot::Mutex;

/// Opaque caller-supplied token for a remote endpoint. Uniqueness key of the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerIdentity(String);

impl PeerIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        PeerIdentity(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerIdentity {
    fn from(s: &str) -> Self {
        PeerIdentity(s.to_owned())
    }
}

impl From<String> for PeerIdentity {
    fn from(s: String) -> Self {
        PeerIdentity(s)
    }
}

/// Answer to a connection-state query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    None,
}

/// Set of connected peers behind one registry-wide lock.
pub struct ConnectionRegistry {
    peers: Mutex<HashSet<PeerIdentity>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            peers: Mutex::new(HashSet::new()),
        }
    }

    /// Add `peer` unless already present. False means the caller must close its new endpoint.
    pub fn try_register(&self, peer: &PeerIdentity) -> bool {
        let mut peers = self.peers.lock();
        if peers.contains(peer) {
            return false;
        }
        peers.insert(peer.clone())
    }

    /// Remove `peer`. Returns whether it was present.
    pub fn unregister(&self, peer: &PeerIdentity) -> bool {
        self.peers.lock().remove(peer)
    }

    pub fn contains(&self, peer: &PeerIdentity) -> bool {
        self.peers.lock().contains(peer)
    }

    pub fn state(&self, peer: &PeerIdentity) -> ConnectionState {
        if self.contains(peer) {
            ConnectionState::Connected
        } else {
            ConnectionState::None
        }
    }

    /// Snapshot of registered peers, sorted.
    pub fn peers(&self) -> Vec<PeerIdentity> {
        let mut out: Vec<PeerIdentity> = self.peers.lock().iter().cloned().collect();
        out.sort();
        out
    }

    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
