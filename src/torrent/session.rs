//! Torrent sessions and the per-process registry
//!
//! A [`TorrentSession`] is the shared, immutable description of a loaded
//! torrent plus its transfer counters. The [`TorrentRegistry`] guarantees at
//! most one session per info hash.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::TorrentError;
use crate::torrent::info::{InfoHash, TorrentInfo};

/// Counters reported to trackers
#[derive(Debug, Default)]
pub struct TransferCounters {
    pub uploaded: AtomicU64,
    pub downloaded: AtomicU64,
    pub left: AtomicU64,
}

impl TransferCounters {
    pub fn add_uploaded(&self, bytes: u64) {
        self.uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_downloaded(&self, bytes: u64) {
        self.downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn set_left(&self, bytes: u64) {
        self.left.store(bytes, Ordering::Relaxed);
    }

    /// (uploaded, downloaded, left)
    pub fn snapshot(&self) -> (u64, u64, u64) {
        (
            self.uploaded.load(Ordering::Relaxed),
            self.downloaded.load(Ordering::Relaxed),
            self.left.load(Ordering::Relaxed),
        )
    }
}

/// A loaded torrent
#[derive(Debug)]
pub struct TorrentSession {
    info: TorrentInfo,
    counters: TransferCounters,
    completed: AtomicBool,
}

impl TorrentSession {
    pub fn new(info: TorrentInfo) -> Self {
        let counters = TransferCounters::default();
        counters.set_left(info.total_size());
        Self {
            info,
            counters,
            completed: AtomicBool::new(false),
        }
    }

    pub fn info(&self) -> &TorrentInfo {
        &self.info
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info.info_hash
    }

    pub fn piece_length(&self) -> u64 {
        self.info.piece_length
    }

    pub fn total_length(&self) -> u64 {
        self.info.total_size()
    }

    pub fn piece_hashes(&self) -> &[[u8; 20]] {
        &self.info.pieces
    }

    pub fn is_private(&self) -> bool {
        self.info.private
    }

    pub fn counters(&self) -> &TransferCounters {
        &self.counters
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    pub fn set_completed(&self, completed: bool) {
        self.completed.store(completed, Ordering::Release);
    }
}

/// Registry of active sessions keyed by info hash
#[derive(Debug, Default)]
pub struct TorrentRegistry {
    sessions: RwLock<HashMap<InfoHash, Arc<TorrentSession>>>,
}

impl TorrentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a torrent. Fails if a session for the same info hash exists.
    pub async fn register(&self, info: TorrentInfo) -> Result<Arc<TorrentSession>> {
        let info_hash = info.info_hash;
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&info_hash) {
            warn!("Torrent {} is already registered", info_hash);
            return Err(TorrentError::validation_error_with_field(
                format!("Torrent {} is already registered", info_hash),
                "info_hash",
            )
            .into());
        }
        let session = Arc::new(TorrentSession::new(info));
        sessions.insert(info_hash, session.clone());
        info!("Registered torrent {} ({} active)", info_hash, sessions.len());
        Ok(session)
    }

    pub async fn get(&self, info_hash: &InfoHash) -> Option<Arc<TorrentSession>> {
        self.sessions.read().await.get(info_hash).cloned()
    }

    pub async fn remove(&self, info_hash: &InfoHash) -> Option<Arc<TorrentSession>> {
        let removed = self.sessions.write().await.remove(info_hash);
        if removed.is_some() {
            debug!("Removed torrent {}", info_hash);
        }
        removed
    }

    /// Snapshot of registered info hashes
    pub async fn info_hashes(&self) -> Vec<InfoHash> {
        self.sessions.read().await.keys().copied().collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}
