//! Piece picker
//!
//! Chooses what to request next: pieces already in flight are finished
//! first, then the rarest needed piece the peer has. Tracks outstanding block
//! requests per peer so they can be reissued when a peer goes away.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use tracing::{debug, trace};

use crate::storage::bitfield::Bitfield;
use crate::storage::piece::BlockRequest;

/// Download statistics
#[derive(Debug, Clone, Default)]
pub struct DownloadStats {
    pub pieces_verified: usize,
    pub pieces_failed: usize,
    pub blocks_received: usize,
}

/// In-flight piece
#[derive(Debug, Clone)]
pub struct PieceDownload {
    pub piece_index: u32,
    /// Blocks not yet requested from anyone
    pending: Vec<BlockRequest>,
    /// Requested blocks by offset
    requested: HashMap<u32, (BlockRequest, SocketAddr, Instant)>,
    pub blocks_total: usize,
    pub started_at: Instant,
}

impl PieceDownload {
    pub fn new(piece_index: u32, blocks: Vec<BlockRequest>) -> Self {
        Self {
            piece_index,
            blocks_total: blocks.len(),
            pending: blocks,
            requested: HashMap::new(),
            started_at: Instant::now(),
        }
    }

    /// All blocks have been requested or received
    pub fn fully_requested(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn outstanding(&self) -> usize {
        self.pending.len() + self.requested.len()
    }

    pub fn peers(&self) -> HashSet<SocketAddr> {
        self.requested.values().map(|(_, peer, _)| *peer).collect()
    }
}

/// Rarest-first picker shared by every connection of a torrent
#[derive(Debug)]
pub struct PiecePicker {
    availability: Vec<u32>,
    active: HashMap<u32, PieceDownload>,
    stats: DownloadStats,
}

impl PiecePicker {
    pub fn new(piece_count: usize) -> Self {
        Self {
            availability: vec![0; piece_count],
            active: HashMap::new(),
            stats: DownloadStats::default(),
        }
    }

    /// A peer announced its bitfield
    pub fn add_peer_pieces(&mut self, pieces: &Bitfield) {
        for index in pieces.ones() {
            if let Some(count) = self.availability.get_mut(index) {
                *count += 1;
            }
        }
    }

    /// A peer disconnected
    pub fn remove_peer_pieces(&mut self, pieces: &Bitfield) {
        for index in pieces.ones() {
            if let Some(count) = self.availability.get_mut(index) {
                *count = count.saturating_sub(1);
            }
        }
    }

    /// A peer sent `have`
    pub fn add_have(&mut self, index: u32) {
        if let Some(count) = self.availability.get_mut(index as usize) {
            *count += 1;
        }
    }

    pub fn availability(&self, index: u32) -> u32 {
        self.availability.get(index as usize).copied().unwrap_or(0)
    }

    pub fn is_active(&self, index: u32) -> bool {
        self.active.contains_key(&index)
    }

    /// Next piece to start for a peer: rarest of `needed ∩ peer_has` that is
    /// not already in flight, ties broken at random.
    pub fn pick_piece(&self, peer_has: &Bitfield, needed: &Bitfield) -> Option<u32> {
        let candidates: Vec<u32> = needed
            .intersection(peer_has)
            .ones()
            .map(|i| i as u32)
            .filter(|i| !self.active.contains_key(i))
            .collect();
        let rarest = candidates.iter().map(|&i| self.availability(i)).min()?;
        let rarest: Vec<u32> = candidates
            .into_iter()
            .filter(|&i| self.availability(i) == rarest)
            .collect();
        rarest.choose(&mut rand::thread_rng()).copied()
    }

    /// Begin tracking a piece with the blocks that still need downloading
    pub fn start_piece(&mut self, index: u32, blocks: Vec<BlockRequest>) {
        if blocks.is_empty() || self.active.contains_key(&index) {
            return;
        }
        debug!("Starting piece {} ({} blocks)", index, blocks.len());
        self.active.insert(index, PieceDownload::new(index, blocks));
    }

    /// Up to `max` unrequested blocks from in-flight pieces the peer has
    pub fn next_requests(&mut self, peer: SocketAddr, peer_has: &Bitfield, max: usize) -> Vec<BlockRequest> {
        let mut out = Vec::new();
        let now = Instant::now();
        let mut indices: Vec<u32> = self.active.keys().copied().collect();
        indices.sort_unstable();
        for index in indices {
            if out.len() >= max {
                break;
            }
            if !peer_has.get(index as usize) {
                continue;
            }
            let Some(download) = self.active.get_mut(&index) else { continue };
            while out.len() < max {
                let Some(block) = download.pending.pop() else { break };
                download.requested.insert(block.offset, (block, peer, now));
                out.push(block);
            }
        }
        trace!("Assigned {} requests to {}", out.len(), peer);
        out
    }

    /// A block arrived; returns true if it was outstanding
    pub fn block_received(&mut self, block: &BlockRequest) -> bool {
        let Some(download) = self.active.get_mut(&block.piece) else {
            return false;
        };
        let was_requested = download.requested.remove(&block.offset).is_some();
        download.pending.retain(|b| b.offset != block.offset);
        if was_requested {
            self.stats.blocks_received += 1;
        }
        was_requested
    }

    /// True once nothing of the piece is pending or outstanding
    pub fn piece_received(&self, index: u32) -> bool {
        self.active.get(&index).map(|d| d.outstanding() == 0).unwrap_or(false)
    }

    /// The piece verified; stop tracking it
    pub fn piece_verified(&mut self, index: u32) {
        if self.active.remove(&index).is_some() {
            self.stats.pieces_verified += 1;
        }
    }

    /// The piece failed its hash check; drop it so it is picked again
    pub fn piece_failed(&mut self, index: u32) {
        if self.active.remove(&index).is_some() {
            self.stats.pieces_failed += 1;
        }
    }

    /// Return a peer's outstanding requests to the pending pool
    pub fn release_peer(&mut self, peer: SocketAddr) {
        for download in self.active.values_mut() {
            let offsets: Vec<u32> = download
                .requested
                .iter()
                .filter(|(_, (_, p, _))| *p == peer)
                .map(|(offset, _)| *offset)
                .collect();
            for offset in offsets {
                if let Some((block, _, _)) = download.requested.remove(&offset) {
                    download.pending.push(block);
                }
            }
        }
    }

    /// Requests sent to `peer` more than `timeout` ago, returned to the
    /// pending pool. Requests owned by other peers are left to their own
    /// connections.
    pub fn expire_for(&mut self, peer: SocketAddr, timeout: Duration) -> Vec<BlockRequest> {
        let now = Instant::now();
        let mut expired = Vec::new();
        for download in self.active.values_mut() {
            let stale: Vec<u32> = download
                .requested
                .iter()
                .filter(|(_, (_, owner, at))| *owner == peer && now.duration_since(*at) > timeout)
                .map(|(offset, _)| *offset)
                .collect();
            for offset in stale {
                if let Some((block, _, _)) = download.requested.remove(&offset) {
                    download.pending.push(block);
                    expired.push(block);
                }
            }
        }
        if !expired.is_empty() {
            debug!("Expired {} slow requests to {}", expired.len(), peer);
        }
        expired
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn stats(&self) -> &DownloadStats {
        &self.stats
    }
}
