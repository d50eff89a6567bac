//! Peer state module
//!
//! Per-peer session: where the address came from, choke and interest
//! flags, the extension bits from its handshake and transfer statistics.

use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::protocol::Handshake;
use crate::storage::Bitfield;

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeerState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Gave up on this address
    Banned,
}

impl PeerState {
    pub fn is_connected(&self) -> bool {
        matches!(self, PeerState::Connected)
    }
}

/// Where the peer was discovered from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerSource {
    Dht,
    Tracker,
    Lsd,
    /// Peer exchange (ut_pex)
    Exchange,
    /// The peer connected to us
    Incoming,
}

impl fmt::Display for PeerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PeerSource::Dht => "dht",
            PeerSource::Tracker => "tracker",
            PeerSource::Lsd => "lsd",
            PeerSource::Exchange => "pex",
            PeerSource::Incoming => "incoming",
        };
        f.write_str(name)
    }
}

/// Choke and interest flags, both directions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerFlags {
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
}

impl Default for PeerFlags {
    fn default() -> Self {
        Self {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
        }
    }
}

/// Per-connection transfer statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerStats {
    pub downloaded: u64,
    pub uploaded: u64,
    pub blocks_received: u32,
    pub blocks_sent: u32,
    pub pieces_verified: u32,
    pub pieces_failed: u32,
}

/// One known peer of a torrent
#[derive(Debug, Clone)]
pub struct PeerSession {
    pub addr: SocketAddr,
    pub source: PeerSource,
    pub state: PeerState,
    pub peer_id: Option<[u8; 20]>,
    /// Reserved bytes of the peer's handshake
    pub extensions: [u8; 8],
    pub flags: PeerFlags,
    pub bitfield: Option<Bitfield>,
    pub stats: PeerStats,
    /// DHT port from a PORT message
    pub dht_port: Option<u16>,
    /// Whether the link is RC4-encrypted
    pub encrypted: bool,
    pub failures: u32,
    pub last_seen: Instant,
}

impl PeerSession {
    pub fn new(addr: SocketAddr, source: PeerSource) -> Self {
        Self {
            addr,
            source,
            state: PeerState::Disconnected,
            peer_id: None,
            extensions: [0u8; 8],
            flags: PeerFlags::default(),
            bitfield: None,
            stats: PeerStats::default(),
            dht_port: None,
            encrypted: false,
            failures: 0,
            last_seen: Instant::now(),
        }
    }

    /// Record what the peer's handshake told us
    pub fn handshake_received(&mut self, handshake: &Handshake) {
        self.peer_id = Some(handshake.peer_id);
        self.extensions = handshake.reserved;
        self.state = PeerState::Connected;
        self.last_seen = Instant::now();
    }

    pub fn supports_extension_protocol(&self) -> bool {
        self.extensions[5] & 0x10 != 0
    }

    pub fn supports_dht(&self) -> bool {
        self.extensions[7] & 0x01 != 0
    }

    pub fn has_piece(&self, index: usize) -> bool {
        self.bitfield.as_ref().map(|b| b.get(index)).unwrap_or(false)
    }

    pub fn is_seed(&self) -> bool {
        self.bitfield.as_ref().map(|b| b.is_full()).unwrap_or(false)
    }

    /// Requests may be sent
    pub fn can_request(&self) -> bool {
        self.state.is_connected() && self.flags.am_interested && !self.flags.peer_choking
    }

    pub fn record_download(&mut self, bytes: usize) {
        self.stats.downloaded += bytes as u64;
        self.stats.blocks_received = self.stats.blocks_received.saturating_add(1);
        self.last_seen = Instant::now();
    }

    pub fn record_upload(&mut self, bytes: usize) {
        self.stats.uploaded += bytes as u64;
        self.stats.blocks_sent = self.stats.blocks_sent.saturating_add(1);
    }

    pub fn peer_id_hex(&self) -> Option<String> {
        self.peer_id.map(hex::encode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:6881".parse().unwrap()
    }

    #[test]
    fn test_new_session_defaults() {
        let session = PeerSession::new(addr(), PeerSource::Tracker);
        assert_eq!(session.state, PeerState::Disconnected);
        assert!(session.flags.am_choking);
        assert!(session.flags.peer_choking);
        assert!(!session.can_request());
        assert!(!session.has_piece(0));
        assert_eq!(session.source.to_string(), "tracker");
    }

    #[test]
    fn test_handshake_sets_extension_bits() {
        let mut session = PeerSession::new(addr(), PeerSource::Incoming);
        let handshake = Handshake::with_extensions([1u8; 20], [2u8; 20], true);
        session.handshake_received(&handshake);
        assert!(session.state.is_connected());
        assert!(session.supports_extension_protocol());
        assert!(session.supports_dht());
        assert_eq!(session.peer_id, Some([2u8; 20]));
    }

    #[test]
    fn test_can_request_and_stats() {
        let mut session = PeerSession::new(addr(), PeerSource::Dht);
        session.state = PeerState::Connected;
        session.flags.am_interested = true;
        assert!(!session.can_request());
        session.flags.peer_choking = false;
        assert!(session.can_request());

        session.record_download(16384);
        session.record_upload(100);
        assert_eq!(session.stats.downloaded, 16384);
        assert_eq!(session.stats.blocks_sent, 1);
    }

    #[test]
    fn test_bitfield_and_seed() {
        let mut session = PeerSession::new(addr(), PeerSource::Lsd);
        let mut bits = Bitfield::new(3);
        bits.set(1);
        session.bitfield = Some(bits.clone());
        assert!(session.has_piece(1));
        assert!(!session.is_seed());
        session.bitfield = Some(Bitfield::full(3));
        assert!(session.is_seed());
    }
}
