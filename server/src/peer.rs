//! Peer bookkeeping for the connection handler
//!
//! This module tracks every peer the transport has accepted, including:
//! - Connection state (connecting, connected, disconnecting, disconnected)
//! - Display name and network address
//! - The last round-trip time measured by the liveness monitor
//!
//! The table enforces the player ceiling and is the single source of truth for
//! whether a peer counts as connected.

use log::info;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Identifier the transport assigns to a peer on accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u32);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

impl PeerState {
    /// True once a disconnect has been requested or completed.
    pub fn is_leaving(self) -> bool {
        matches!(self, PeerState::Disconnecting | PeerState::Disconnected)
    }
}

/// A peer known to the server
#[derive(Debug, Clone)]
pub struct Peer {
    pub id: PeerId,
    /// Network address the transport talks to
    pub addr: SocketAddr,
    /// Display name used in logs, replaced once the peer authenticates
    pub name: String,
    pub state: PeerState,
    /// Most recent ping round trip, if a pong has been matched yet
    pub round_trip: Option<Duration>,
    /// Last time any packet arrived from this peer
    pub last_seen: Instant,
}

impl Peer {
    /// Creates a peer in the `Connecting` state.
    pub fn new(id: PeerId, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            name: format!("Peer {} ({})", id, addr),
            state: PeerState::Connecting,
            round_trip: None,
            last_seen: Instant::now(),
        }
    }
}

/// All peers of one listening server
///
/// Peers are inserted when the transport accepts them and removed when the
/// transport reports the disconnect as complete. Everything in between is a
/// state change on the stored record.
pub struct PeerTable {
    peers: HashMap<PeerId, Peer>,
    max_peers: usize,
}

impl PeerTable {
    pub fn new(max_peers: usize) -> Self {
        Self {
            peers: HashMap::new(),
            max_peers,
        }
    }

    /// Registers a newly accepted peer
    ///
    /// Returns false if the table is full or the id is already taken.
    pub fn add_peer(&mut self, id: PeerId, addr: SocketAddr) -> bool {
        if self.peers.len() >= self.max_peers || self.peers.contains_key(&id) {
            return false;
        }

        info!("Peer {} connected from {}", id, addr);
        self.peers.insert(id, Peer::new(id, addr));
        true
    }

    /// Drops a peer whose disconnect has completed.
    pub fn remove_peer(&mut self, id: PeerId) -> Option<Peer> {
        let mut peer = self.peers.remove(&id)?;
        peer.state = PeerState::Disconnected;
        info!("{} disconnected", peer.name);
        Some(peer)
    }

    pub fn get(&self, id: PeerId) -> Option<&Peer> {
        self.peers.get(&id)
    }

    pub fn state(&self, id: PeerId) -> Option<PeerState> {
        self.peers.get(&id).map(|peer| peer.state)
    }

    pub fn set_state(&mut self, id: PeerId, state: PeerState) -> bool {
        match self.peers.get_mut(&id) {
            Some(peer) => {
                peer.state = state;
                true
            }
            None => false,
        }
    }

    pub fn set_name(&mut self, id: PeerId, name: impl Into<String>) -> bool {
        match self.peers.get_mut(&id) {
            Some(peer) => {
                peer.name = name.into();
                true
            }
            None => false,
        }
    }

    /// Refreshes the last-seen time after a packet from this peer.
    pub fn touch(&mut self, id: PeerId) {
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.last_seen = Instant::now();
        }
    }

    pub fn record_round_trip(&mut self, id: PeerId, round_trip: Duration) -> bool {
        match self.peers.get_mut(&id) {
            Some(peer) => {
                peer.round_trip = Some(round_trip);
                true
            }
            None => false,
        }
    }

    /// Ids of every peer in the `Connected` state, in ascending order.
    pub fn connected(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self
            .peers
            .values()
            .filter(|peer| peer.state == PeerState::Connected)
            .map(|peer| peer.id)
            .collect();
        ids.sort();
        ids
    }

    pub fn snapshot(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self.peers.values().cloned().collect();
        peers.sort_by_key(|peer| peer.id);
        peers
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }

    pub fn max_peers(&self) -> usize {
        self.max_peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_addr() -> SocketAddr {
        "127.0.0.1:8080".parse().unwrap()
    }

    fn test_addr2() -> SocketAddr {
        "127.0.0.1:8081".parse().unwrap()
    }

    #[test]
    fn test_peer_creation() {
        let peer = Peer::new(PeerId(1), test_addr());

        assert_eq!(peer.id, PeerId(1));
        assert_eq!(peer.addr, test_addr());
        assert_eq!(peer.state, PeerState::Connecting);
        assert!(peer.round_trip.is_none());
        assert_eq!(peer.name, "Peer #1 (127.0.0.1:8080)");
    }

    #[test]
    fn test_add_peer_respects_capacity() {
        let mut table = PeerTable::new(1);

        assert!(table.add_peer(PeerId(1), test_addr()));
        assert!(!table.add_peer(PeerId(2), test_addr2()));
        assert_eq!(table.len(), 1);
        assert_eq!(table.max_peers(), 1);
    }

    #[test]
    fn test_add_peer_rejects_duplicate_id() {
        let mut table = PeerTable::new(4);

        assert!(table.add_peer(PeerId(1), test_addr()));
        assert!(!table.add_peer(PeerId(1), test_addr2()));
        assert_eq!(table.get(PeerId(1)).unwrap().addr, test_addr());
    }

    #[test]
    fn test_remove_peer() {
        let mut table = PeerTable::new(2);
        table.add_peer(PeerId(1), test_addr());

        let removed = table.remove_peer(PeerId(1)).unwrap();
        assert_eq!(removed.state, PeerState::Disconnected);
        assert!(table.is_empty());
        assert!(table.remove_peer(PeerId(1)).is_none());
    }

    #[test]
    fn test_connected_only_lists_connected_peers() {
        let mut table = PeerTable::new(4);
        table.add_peer(PeerId(3), test_addr());
        table.add_peer(PeerId(1), test_addr2());
        table.add_peer(PeerId(2), "127.0.0.1:8082".parse().unwrap());

        table.set_state(PeerId(3), PeerState::Connected);
        table.set_state(PeerId(1), PeerState::Connected);
        table.set_state(PeerId(2), PeerState::Disconnecting);

        assert_eq!(table.connected(), vec![PeerId(1), PeerId(3)]);
    }

    #[test]
    fn test_state_updates() {
        let mut table = PeerTable::new(2);
        table.add_peer(PeerId(1), test_addr());

        assert!(table.set_state(PeerId(1), PeerState::Disconnecting));
        assert_eq!(table.state(PeerId(1)), Some(PeerState::Disconnecting));
        assert!(table.state(PeerId(1)).unwrap().is_leaving());
        assert!(!table.set_state(PeerId(9), PeerState::Connected));
        assert_eq!(table.state(PeerId(9)), None);
    }

    #[test]
    fn test_record_round_trip_and_name() {
        let mut table = PeerTable::new(2);
        table.add_peer(PeerId(1), test_addr());

        assert!(table.record_round_trip(PeerId(1), Duration::from_millis(42)));
        assert!(table.set_name(PeerId(1), "76561198000000001"));
        assert!(!table.record_round_trip(PeerId(2), Duration::from_millis(1)));

        let peer = table.get(PeerId(1)).unwrap();
        assert_eq!(peer.round_trip, Some(Duration::from_millis(42)));
        assert_eq!(peer.name, "76561198000000001");
    }

    #[test]
    fn test_touch_refreshes_last_seen() {
        let mut table = PeerTable::new(1);
        table.add_peer(PeerId(1), test_addr());
        let before = table.get(PeerId(1)).unwrap().last_seen;

        std::thread::sleep(Duration::from_millis(2));
        table.touch(PeerId(1));

        assert!(table.get(PeerId(1)).unwrap().last_seen > before);
    }
}
