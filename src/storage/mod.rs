//! Storage module
//!
//! Maps pieces onto files, verifies them and decides what to request next.

pub mod backend;
pub mod bitfield;
pub mod engine;
pub mod file;
pub mod picker;
pub mod piece;

pub use backend::{DiskBackend, MemoryBackend, StorageBackend};
pub use bitfield::Bitfield;
pub use engine::{PieceStorage, DEFAULT_RECONCILE_PREFIX};
pub use file::{FileEntry, FileMap, FileSlice};
pub use picker::{DownloadStats, PieceDownload, PiecePicker};
pub use piece::{BlockRequest, Piece, BLOCK_SIZE};
