//! Peer manager module
//!
//! Known peers of one torrent, keyed by address, and the connection slots
//! shared between outbound and incoming connections.

use std::collections::HashMap;
use std::net::SocketAddr;

use tokio::sync::RwLock;
use tracing::{debug, info, trace, warn};

use crate::peer::state::{PeerSession, PeerSource, PeerState, PeerStats};

/// Addresses are banned after this many failed connection attempts
pub const MAX_PEER_FAILURES: u32 = 3;

/// Manages all peers for a torrent
#[derive(Debug)]
pub struct PeerManager {
    peers: RwLock<HashMap<SocketAddr, PeerSession>>,
    max_connections: usize,
}

impl PeerManager {
    pub fn new(max_connections: usize) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            max_connections,
        }
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    fn usable(addr: &SocketAddr) -> bool {
        addr.port() != 0 && !addr.ip().is_unspecified()
    }

    /// Add a peer; returns false for duplicates and unusable addresses
    pub async fn add_peer(&self, addr: SocketAddr, source: PeerSource) -> bool {
        if !Self::usable(&addr) {
            trace!("Ignoring unusable peer address {}", addr);
            return false;
        }
        let mut peers = self.peers.write().await;
        if peers.contains_key(&addr) {
            trace!("Peer {} already known, skipping", addr);
            return false;
        }
        peers.insert(addr, PeerSession::new(addr, source));
        debug!("Added {} peer {} (total: {})", source, addr, peers.len());
        true
    }

    /// Add several peers from one source; returns how many were new
    pub async fn add_peers(&self, addrs: impl IntoIterator<Item = SocketAddr>, source: PeerSource) -> usize {
        let mut peers = self.peers.write().await;
        let mut added = 0;
        for addr in addrs {
            if Self::usable(&addr) && !peers.contains_key(&addr) {
                peers.insert(addr, PeerSession::new(addr, source));
                added += 1;
            }
        }
        if added > 0 {
            info!("Added {} {} peers (total: {})", added, source, peers.len());
        }
        added
    }

    pub async fn remove_peer(&self, addr: SocketAddr) -> Option<PeerSession> {
        let removed = self.peers.write().await.remove(&addr);
        if removed.is_some() {
            debug!("Removed peer {}", addr);
        }
        removed
    }

    fn busy(peers: &HashMap<SocketAddr, PeerSession>) -> usize {
        peers
            .values()
            .filter(|p| matches!(p.state, PeerState::Connecting | PeerState::Connected))
            .count()
    }

    /// Disconnected peers worth dialing, limited to the free slots. Fewer
    /// past failures first.
    pub async fn candidates(&self) -> Vec<SocketAddr> {
        let peers = self.peers.read().await;
        let slots = self.max_connections.saturating_sub(Self::busy(&peers));
        if slots == 0 {
            trace!("No connection slots available (max {})", self.max_connections);
            return Vec::new();
        }
        let mut idle: Vec<&PeerSession> = peers
            .values()
            .filter(|p| p.state == PeerState::Disconnected && p.source != PeerSource::Incoming)
            .collect();
        idle.sort_by_key(|p| p.failures);
        idle.into_iter().take(slots).map(|p| p.addr).collect()
    }

    /// Reserve a slot for `addr`; false if none is free or the peer is busy
    pub async fn mark_connecting(&self, addr: SocketAddr) -> bool {
        let mut peers = self.peers.write().await;
        if Self::busy(&peers) >= self.max_connections {
            return false;
        }
        match peers.get_mut(&addr) {
            Some(peer) if peer.state == PeerState::Disconnected => {
                peer.state = PeerState::Connecting;
                true
            }
            _ => false,
        }
    }

    /// Handshake completed. Incoming peers are registered here.
    pub async fn connected(&self, established: &PeerSession) {
        let addr = established.addr;
        let mut peers = self.peers.write().await;
        let peer = peers
            .entry(addr)
            .or_insert_with(|| PeerSession::new(addr, established.source));
        peer.state = PeerState::Connected;
        peer.peer_id = established.peer_id;
        peer.extensions = established.extensions;
        peer.encrypted = established.encrypted;
        peer.failures = 0;
        debug!(
            "Connected to {} ({}, {})",
            addr,
            peer.source,
            if peer.encrypted { "rc4" } else { "plaintext" }
        );
    }

    /// Connection closed. A failed attempt counts against the address.
    pub async fn disconnected(&self, addr: SocketAddr, failed: bool, stats: Option<PeerStats>) {
        let mut peers = self.peers.write().await;
        let Some(peer) = peers.get_mut(&addr) else { return };
        if let Some(stats) = stats {
            peer.stats = stats;
        }
        peer.bitfield = None;
        peer.flags = Default::default();
        if failed {
            peer.failures += 1;
            if peer.failures >= MAX_PEER_FAILURES {
                warn!("Banning peer {} after {} failures", addr, peer.failures);
                peer.state = PeerState::Banned;
                return;
            }
        }
        peer.state = PeerState::Disconnected;
    }

    /// Apply `f` to a known peer
    pub async fn update<F: FnOnce(&mut PeerSession)>(&self, addr: SocketAddr, f: F) {
        if let Some(peer) = self.peers.write().await.get_mut(&addr) {
            f(peer);
        }
    }

    pub async fn get(&self, addr: SocketAddr) -> Option<PeerSession> {
        self.peers.read().await.get(&addr).cloned()
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn active_count(&self) -> usize {
        self.peers.read().await.values().filter(|p| p.state.is_connected()).count()
    }

    /// Whether an incoming connection can be accepted
    pub async fn can_accept(&self) -> bool {
        Self::busy(&*self.peers.read().await) < self.max_connections
    }

    /// Addresses of connected peers that accept incoming connections, for PEX
    pub async fn connected_addrs(&self) -> Vec<SocketAddr> {
        self.peers
            .read()
            .await
            .values()
            .filter(|p| p.state.is_connected() && p.source != PeerSource::Incoming)
            .map(|p| p.addr)
            .collect()
    }

    /// DHT ports learned from PORT messages
    pub async fn dht_nodes(&self) -> Vec<SocketAddr> {
        self.peers
            .read()
            .await
            .values()
            .filter_map(|p| p.dht_port.map(|port| SocketAddr::new(p.addr.ip(), port)))
            .collect()
    }

    pub async fn sessions(&self) -> Vec<PeerSession> {
        self.peers.read().await.values().cloned().collect()
    }
}

impl Default for PeerManager {
    fn default() -> Self {
        Self::new(50)
    }
}
