//! Piece storage engine
//!
//! Accepts out-of-order block writes, serves reads of written ranges and
//! promotes a piece to complete only after its SHA-1 matches. Writes to one
//! piece are serialized by that piece's lock; different pieces proceed
//! concurrently. Completion and selection bitfields are handed out as
//! snapshot copies.

use std::sync::Arc;

use anyhow::Result;
use sha1::{Digest, Sha1};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, trace, warn};

use crate::error::TorrentError;
use crate::storage::backend::StorageBackend;
use crate::storage::bitfield::Bitfield;
use crate::storage::file::{FileEntry, FileMap};
use crate::storage::piece::{BlockRequest, Piece, BLOCK_SIZE};
use crate::torrent::TorrentInfo;

/// Bytes inspected per piece when reconciling existing data at startup
pub const DEFAULT_RECONCILE_PREFIX: usize = 16;

/// Storage for one torrent
pub struct PieceStorage {
    files: FileMap,
    backend: Arc<dyn StorageBackend>,
    pieces: Vec<Mutex<Piece>>,
    piece_length: u64,
    selected: RwLock<Bitfield>,
    completed: RwLock<Bitfield>,
    reconcile_prefix: usize,
}

impl std::fmt::Debug for PieceStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PieceStorage")
            .field("files", &self.files.len())
            .field("pieces", &self.pieces.len())
            .field("piece_length", &self.piece_length)
            .finish()
    }
}

impl PieceStorage {
    /// Every piece touching a non-padding file starts out selected
    pub fn new(info: &TorrentInfo, backend: Arc<dyn StorageBackend>) -> Self {
        let files = FileMap::from_info(info);
        let mut pieces = Vec::with_capacity(info.piece_count());
        for (index, hash) in info.pieces.iter().enumerate() {
            let (begin, end) = info.piece_range(index).unwrap_or((0, 0));
            pieces.push(Mutex::new(Piece::new(index as u32, begin, end, *hash)));
        }
        let selected = Self::pieces_for_files(&files, info.piece_length, pieces.len(), |f| !f.padding);
        debug!(
            "Piece storage for '{}': {} pieces, {} files, {} selected",
            info.name,
            pieces.len(),
            files.len(),
            selected.count()
        );
        Self {
            files,
            backend,
            pieces,
            piece_length: info.piece_length,
            completed: RwLock::new(Bitfield::new(info.piece_count())),
            selected: RwLock::new(selected),
            reconcile_prefix: DEFAULT_RECONCILE_PREFIX,
        }
    }

    pub fn set_reconcile_prefix(&mut self, bytes: usize) {
        self.reconcile_prefix = bytes.max(1);
    }

    fn pieces_for_files(
        files: &FileMap,
        piece_length: u64,
        count: usize,
        include: impl Fn(&FileEntry) -> bool,
    ) -> Bitfield {
        let mut field = Bitfield::new(count);
        for file in files.entries().iter().filter(|f| f.length > 0 && include(f)) {
            let first = file.offset / piece_length;
            let last = (file.end() - 1) / piece_length;
            for index in first..=last {
                field.set(index as usize);
            }
        }
        field
    }

    pub fn files(&self) -> &FileMap {
        &self.files
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    pub fn piece_length(&self) -> u64 {
        self.piece_length
    }

    /// Size of one piece; the last may be short
    pub fn piece_size(&self, index: u32) -> Option<u32> {
        let total = self.files.total_length();
        let begin = index as u64 * self.piece_length;
        if index as usize >= self.pieces.len() || begin > total {
            return None;
        }
        Some((total - begin).min(self.piece_length) as u32)
    }

    fn slot(&self, index: u32) -> Result<&Mutex<Piece>> {
        self.pieces.get(index as usize).ok_or_else(|| {
            TorrentError::validation_error_with_field(
                format!("Piece index {} out of range ({} pieces)", index, self.pieces.len()),
                "piece",
            )
            .into()
        })
    }

    /// Restrict downloading to the given file indices. Padding files are
    /// never selected.
    pub async fn select_files(&self, indices: &[usize]) -> Result<()> {
        if let Some(bad) = indices.iter().find(|&&i| i >= self.files.len()) {
            return Err(TorrentError::validation_error_with_field(
                format!("File index {} out of range ({} files)", bad, self.files.len()),
                "select",
            )
            .into());
        }
        let field = Self::pieces_for_files(&self.files, self.piece_length, self.pieces.len(), |f| {
            !f.padding && indices.contains(&f.index)
        });
        info!("Selected {} files covering {} pieces", indices.len(), field.count());
        *self.selected.write().await = field;
        Ok(())
    }

    /// Create the files backing the selected pieces
    pub async fn allocate(&self) -> Result<()> {
        let selected = self.selected_pieces().await;
        let wanted: Vec<FileEntry> = self
            .files
            .entries()
            .iter()
            .filter(|f| !f.padding && f.length > 0)
            .filter(|f| {
                let first = f.offset / self.piece_length;
                let last = (f.end() - 1) / self.piece_length;
                (first..=last).any(|i| selected.get(i as usize))
            })
            .cloned()
            .collect();
        self.backend.allocate(&wanted).await
    }

    /// Store `data` at `offset` within piece `index`. Rewriting a range is
    /// harmless; data for an already complete piece is ignored.
    pub async fn write(&self, index: u32, offset: u32, data: &[u8]) -> Result<()> {
        let length = u32::try_from(data.len())
            .map_err(|_| TorrentError::validation_error_with_field("Block too large", "length"))?;
        let mut piece = self.slot(index)?.lock().await;
        if !piece.contains(offset, length) {
            warn!(
                "Rejecting write outside piece {} ({} bytes at {}, piece is {} bytes)",
                index,
                length,
                offset,
                piece.len()
            );
            return Err(TorrentError::validation_error_with_field(
                format!("Write of {} bytes at {} exceeds piece {}", length, offset, index),
                "offset",
            )
            .into());
        }
        if piece.is_complete() {
            trace!("Piece {} already complete, ignoring write at {}", index, offset);
            return Ok(());
        }

        let absolute = piece.begin + offset as u64;
        for slice in self.files.slices(absolute, length as u64) {
            let Some(entry) = self.files.get(slice.file) else { continue };
            if entry.padding {
                continue;
            }
            let start = slice.range_offset as usize;
            let chunk = &data[start..start + slice.length as usize];
            self.backend.write_at(entry, slice.file_offset, chunk).await?;
        }
        piece.record(offset, length);
        trace!("Piece {}: wrote {} bytes at {} ({} written)", index, length, offset, piece.written_bytes());
        Ok(())
    }

    /// Read a range of a piece; `None` if any part of it was never written
    pub async fn read(&self, index: u32, offset: u32, length: u32) -> Result<Option<Vec<u8>>> {
        let piece = self.slot(index)?.lock().await;
        if !piece.contains(offset, length) {
            return Err(TorrentError::validation_error_with_field(
                format!("Read of {} bytes at {} exceeds piece {}", length, offset, index),
                "offset",
            )
            .into());
        }
        if !piece.covers(offset, length) {
            return Ok(None);
        }
        let data = self.read_range(piece.begin + offset as u64, length as usize).await?;
        Ok(Some(data))
    }

    async fn read_range(&self, absolute: u64, length: usize) -> Result<Vec<u8>> {
        let mut out = vec![0u8; length];
        for slice in self.files.slices(absolute, length as u64) {
            let Some(entry) = self.files.get(slice.file) else { continue };
            if entry.padding {
                continue;
            }
            let bytes = self
                .backend
                .read_at(entry, slice.file_offset, slice.length as usize)
                .await?;
            let start = slice.range_offset as usize;
            out[start..start + bytes.len()].copy_from_slice(&bytes);
        }
        Ok(out)
    }

    /// Hash a fully written piece. On mismatch the written-range tracking is
    /// cleared so the piece is downloaded again.
    pub async fn verify(&self, index: u32) -> Result<bool> {
        let mut piece = self.slot(index)?.lock().await;
        if piece.is_complete() {
            return Ok(true);
        }
        if !piece.is_fully_written() {
            trace!("Piece {} not fully written ({} of {} bytes)", index, piece.written_bytes(), piece.len());
            return Ok(false);
        }

        let data = self.read_range(piece.begin, piece.len() as usize).await?;
        let expected = piece.hash;
        let matches = tokio::task::spawn_blocking(move || {
            let digest: [u8; 20] = Sha1::digest(&data).into();
            digest == expected
        })
        .await
        .map_err(|e| TorrentError::storage_error(format!("Hash task failed: {}", e)))?;

        if matches {
            piece.mark_complete();
            self.completed.write().await.set(index as usize);
            debug!("Piece {} verified", index);
        } else {
            piece.reset();
            warn!("Piece {} failed hash check, discarding", index);
        }
        Ok(matches)
    }

    /// Unwritten blocks of a piece
    pub async fn missing_blocks(&self, index: u32) -> Result<Vec<BlockRequest>> {
        let piece = self.slot(index)?.lock().await;
        if piece.is_complete() {
            return Ok(Vec::new());
        }
        Ok(piece
            .missing()
            .into_iter()
            .flat_map(|range| BlockRequest::split(index, range, BLOCK_SIZE))
            .collect())
    }

    pub async fn selected_pieces(&self) -> Bitfield {
        self.selected.read().await.clone()
    }

    pub async fn completed_pieces(&self) -> Bitfield {
        self.completed.read().await.clone()
    }

    /// Selected pieces that are not complete yet
    pub async fn needed_pieces(&self) -> Bitfield {
        let selected = self.selected_pieces().await;
        selected.difference(&*self.completed.read().await)
    }

    pub async fn is_complete(&self) -> bool {
        self.needed_pieces().await.none_set()
    }

    /// Bytes of selected pieces still missing
    pub async fn bytes_left(&self) -> u64 {
        self.needed_pieces()
            .await
            .ones()
            .filter_map(|i| self.piece_size(i as u32))
            .map(u64::from)
            .sum()
    }

    /// Classify existing on-disk data. A piece whose first bytes are not all
    /// zero is treated as present and hashed; only a matching hash marks it
    /// complete. Returns the number of recovered pieces.
    pub async fn reconcile(&self) -> Result<usize> {
        let selected = self.selected_pieces().await;
        let mut recovered = 0;
        for index in selected.ones() {
            let index = index as u32;
            let (begin, len) = {
                let piece = self.slot(index)?.lock().await;
                if piece.is_complete() {
                    continue;
                }
                (piece.begin, piece.len())
            };
            let prefix = self.reconcile_prefix.min(len as usize);
            let bytes = match self.read_range(begin, prefix).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    debug!("Reconcile read of piece {} failed: {}", index, e);
                    continue;
                }
            };
            if bytes.iter().all(|&b| b == 0) {
                continue;
            }
            self.slot(index)?.lock().await.record(0, len);
            if self.verify(index).await? {
                recovered += 1;
            }
        }
        info!("Reconciled existing data: {} of {} selected pieces present", recovered, selected.count());
        Ok(recovered)
    }
}
