//! rust-torrent-engine
//!
//! BitTorrent engine: bencode, .torrent and magnet parsing, the Kademlia DHT,
//! the peer wire protocol with MSE encryption, piece storage and tracker
//! clients.

pub mod bencode;
pub mod cli;
pub mod dht;
pub mod download;
pub mod error;
pub mod peer;
pub mod protocol;
pub mod storage;
pub mod torrent;
pub mod tracker;

pub use error::{ErrorKind, TorrentError};

pub use cli::{CliArgs, Command, Config, ProgressDisplay, ProgressSnapshot};
pub use dht::{announce, bootstrap, discover_peers, DhtNode, NodeId};
pub use download::{Downloader, TorrentSource};
pub use peer::{PeerConnection, PeerManager, PeerSession, PeerSource, PeerState, TorrentContext};
pub use protocol::{CodecStack, CryptoPolicy, Handshake, Message, MessageId, MseHandshake};
pub use storage::{Bitfield, DiskBackend, MemoryBackend, PiecePicker, PieceStorage, StorageBackend};
pub use torrent::{InfoHash, MagnetLink, MagnetParser, TorrentInfo, TorrentParser, TorrentRegistry, TorrentSession};
pub use tracker::{AnnounceRequest, TrackerEvent, TrackerManager};
