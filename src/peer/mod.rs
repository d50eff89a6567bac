//! Peer management module
//!
//! Per-peer sessions, the peer manager, the connection driver and local
//! service discovery.

pub mod connection;
pub mod lsd;
pub mod manager;
pub mod state;

// Re-export main types
pub use connection::{PeerConnection, TorrentContext, MAX_REQUEST_LENGTH};
pub use lsd::{build_announce, parse_announce, LsdAnnounce, LsdService};
pub use manager::{PeerManager, MAX_PEER_FAILURES};
pub use state::{PeerFlags, PeerSession, PeerSource, PeerState, PeerStats};
