//! The engine's peer table: at most one live [`Node`] per remote key.
use std::collections::HashMap;

use epinet_transport::{Direction, Key, Node};

use crate::error::ProtocolError;

/// Result of a successful [`PeerTable::admit`].
#[derive(Debug)]
pub enum Admission {
    /// The key was not tracked before.
    Inserted,
    /// The incoming node displaced `previous`, which the caller should close.
    Replaced { previous: Node },
}

/// Live peers keyed by identity.
///
/// Admission is insert-if-absent, with two exceptions: a tracked node that
/// is no longer valid gets replaced, and when both ends of a simultaneous
/// cross-dial arrive, the connection dialed by the lower key wins on both
/// sides.
#[derive(Debug)]
pub struct PeerTable {
    local: Key,
    peers: HashMap<Key, Node>,
}

impl PeerTable {
    pub fn new(local: Key) -> Self {
        Self {
            local,
            peers: HashMap::new(),
        }
    }

    /// Try to track `node`. On error the node was not inserted and the
    /// caller owns closing it.
    pub fn admit(&mut self, node: Node) -> Result<Admission, ProtocolError> {
        let key = node.id();
        if key.is_null() {
            return Err(invalid(key, "null key"));
        }
        if key == self.local {
            return Err(invalid(key, "our own key"));
        }
        if !node.is_valid() {
            return Err(invalid(key, "node no longer valid"));
        }

        let Some(existing) = self.peers.get(&key) else {
            self.peers.insert(key, node);
            return Ok(Admission::Inserted);
        };

        if existing.same_connection(&node) {
            return Err(ProtocolError::PeerAlreadyKnown(key));
        }
        if existing.is_valid() && !self.prefers(&node, existing) {
            return Err(ProtocolError::PeerAlreadyKnown(key));
        }

        let previous = self.peers.insert(key, node);
        match previous {
            Some(previous) => Ok(Admission::Replaced { previous }),
            None => Ok(Admission::Inserted),
        }
    }

    /// Key of the side that opened this connection.
    fn dialer_of(&self, node: &Node) -> Key {
        match node.direction() {
            Direction::Outbound => self.local,
            Direction::Inbound => node.id(),
        }
    }

    /// Whether `incoming` should displace a valid `existing` node.
    fn prefers(&self, incoming: &Node, existing: &Node) -> bool {
        self.dialer_of(incoming) < self.dialer_of(existing)
    }

    pub fn get(&self, key: &Key) -> Option<&Node> {
        self.peers.get(key)
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.peers.contains_key(key)
    }

    pub fn remove(&mut self, key: &Key) -> Result<Node, ProtocolError> {
        self.peers
            .remove(key)
            .ok_or(ProtocolError::PeerNotFound(*key))
    }

    /// Reset the liveness clock of the tracked node for `key`.
    pub fn refresh(&self, key: &Key) -> bool {
        match self.peers.get(key) {
            Some(node) => {
                node.refresh();
                true
            }
            None => false,
        }
    }

    /// Drop every node that is no longer valid and hand them back.
    pub fn sweep(&mut self) -> Vec<Node> {
        let dead: Vec<Key> = self
            .peers
            .iter()
            .filter(|(_, node)| !node.is_valid())
            .map(|(key, _)| *key)
            .collect();
        dead.iter().filter_map(|key| self.peers.remove(key)).collect()
    }

    /// Snapshot of all tracked nodes.
    pub fn nodes(&self) -> Vec<Node> {
        self.peers.values().cloned().collect()
    }

    pub fn keys(&self) -> Vec<Key> {
        self.peers.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Empty the table, closing every node.
    pub fn close_all(&mut self) {
        for (_, node) in self.peers.drain() {
            node.close();
        }
    }
}

fn invalid(key: Key, reason: &str) -> ProtocolError {
    ProtocolError::InvalidPeer {
        key,
        reason: reason.to_string(),
    }
}
