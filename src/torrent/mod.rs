//! Torrent metadata module
//!
//! Parsing of .torrent files and magnet links, plus the session registry.

pub mod info;
pub mod magnet;
pub mod parser;
pub mod session;

pub use info::{InfoHash, TorrentFile, TorrentInfo};
pub use magnet::{MagnetLink, MagnetParser};
pub use parser::TorrentParser;
pub use session::{TorrentRegistry, TorrentSession, TransferCounters};
