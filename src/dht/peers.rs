//! Peers announced to this node, served back as `values` by get_peers

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::torrent::InfoHash;

pub const PEER_ANNOUNCE_LIFETIME: Duration = Duration::from_secs(30 * 60);
pub const MAX_PEERS_PER_TORRENT: usize = 1000;
/// Values returned in one get_peers response
pub const MAX_VALUES_PER_RESPONSE: usize = 50;

#[derive(Debug)]
struct AnnouncedPeer {
    addr: SocketAddr,
    announced_at: Instant,
}

#[derive(Debug, Default)]
pub struct PeerStore {
    peers: HashMap<InfoHash, Vec<AnnouncedPeer>>,
    lifetime: Option<Duration>,
}

impl PeerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lifetime(lifetime: Duration) -> Self {
        Self {
            peers: HashMap::new(),
            lifetime: Some(lifetime),
        }
    }

    fn lifetime(&self) -> Duration {
        self.lifetime.unwrap_or(PEER_ANNOUNCE_LIFETIME)
    }

    /// Record or refresh an announced peer
    pub fn add(&mut self, info_hash: InfoHash, addr: SocketAddr) {
        let lifetime = self.lifetime();
        let peers = self.peers.entry(info_hash).or_default();
        peers.retain(|p| p.addr != addr && p.announced_at.elapsed() < lifetime);
        if peers.len() < MAX_PEERS_PER_TORRENT {
            peers.push(AnnouncedPeer {
                addr,
                announced_at: Instant::now(),
            });
            trace!("Stored peer {} for {}", addr, info_hash);
        }
    }

    /// Live peers for `info_hash`, most recent first
    pub fn get(&mut self, info_hash: &InfoHash) -> Vec<SocketAddr> {
        let lifetime = self.lifetime();
        match self.peers.get_mut(info_hash) {
            Some(peers) => {
                peers.retain(|p| p.announced_at.elapsed() < lifetime);
                peers.iter().rev().take(MAX_VALUES_PER_RESPONSE).map(|p| p.addr).collect()
            }
            None => Vec::new(),
        }
    }

    /// Drop expired entries and empty torrents
    pub fn purge(&mut self) {
        let lifetime = self.lifetime();
        for peers in self.peers.values_mut() {
            peers.retain(|p| p.announced_at.elapsed() < lifetime);
        }
        self.peers.retain(|_, peers| !peers.is_empty());
    }

    pub fn torrent_count(&self) -> usize {
        self.peers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_get() {
        let mut store = PeerStore::new();
        let hash = InfoHash([1u8; 20]);
        let a: SocketAddr = "10.0.0.1:1".parse().unwrap();
        let b: SocketAddr = "10.0.0.2:2".parse().unwrap();
        store.add(hash, a);
        store.add(hash, b);
        store.add(hash, a);
        assert_eq!(store.get(&hash), vec![a, b]);
        assert!(store.get(&InfoHash([2u8; 20])).is_empty());
    }

    #[test]
    fn test_expiry() {
        let mut store = PeerStore::with_lifetime(Duration::ZERO);
        let hash = InfoHash([1u8; 20]);
        store.add(hash, "10.0.0.1:1".parse().unwrap());
        assert!(store.get(&hash).is_empty());
        store.purge();
        assert_eq!(store.torrent_count(), 0);
    }
}
