//! Piece state
//!
//! Byte-range bookkeeping for one piece: which parts have been written,
//! and whether the piece has passed its hash check.

use std::ops::Range;

/// Default request block size (16 KiB)
pub const BLOCK_SIZE: u32 = 16 * 1024;

/// One block request within a piece
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRequest {
    pub piece: u32,
    pub offset: u32,
    pub length: u32,
}

impl BlockRequest {
    pub fn new(piece: u32, offset: u32, length: u32) -> Self {
        Self { piece, offset, length }
    }

    /// Split `range` of a piece into requests of at most `block_size` bytes
    pub fn split(piece: u32, range: Range<u32>, block_size: u32) -> Vec<BlockRequest> {
        let mut out = Vec::new();
        let mut offset = range.start;
        while offset < range.end {
            let length = block_size.min(range.end - offset);
            out.push(BlockRequest::new(piece, offset, length));
            offset += length;
        }
        out
    }
}

/// A piece of the torrent, addressed in absolute torrent offsets
#[derive(Debug, Clone)]
pub struct Piece {
    pub index: u32,
    /// First byte of the piece in the torrent
    pub begin: u64,
    /// One past the last byte
    pub end: u64,
    /// Expected SHA-1
    pub hash: [u8; 20],
    /// Sorted, non-overlapping, non-adjacent written ranges (piece-relative)
    written: Vec<Range<u32>>,
    complete: bool,
}

impl Piece {
    pub fn new(index: u32, begin: u64, end: u64, hash: [u8; 20]) -> Self {
        Self {
            index,
            begin,
            end,
            hash,
            written: Vec::new(),
            complete: false,
        }
    }

    pub fn len(&self) -> u32 {
        (self.end - self.begin) as u32
    }

    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    /// True when `offset..offset+length` lies inside the piece
    pub fn contains(&self, offset: u32, length: u32) -> bool {
        offset
            .checked_add(length)
            .map(|end| end <= self.len())
            .unwrap_or(false)
    }

    /// Record a written range, merging with neighbours
    pub fn record(&mut self, offset: u32, length: u32) {
        if length == 0 {
            return;
        }
        let mut range = offset..offset + length;
        let mut merged = Vec::with_capacity(self.written.len() + 1);
        for existing in self.written.drain(..) {
            if existing.end < range.start || existing.start > range.end {
                merged.push(existing);
            } else {
                range = range.start.min(existing.start)..range.end.max(existing.end);
            }
        }
        merged.push(range);
        merged.sort_by_key(|r| r.start);
        self.written = merged;
    }

    /// True when every byte of the range has been written
    pub fn covers(&self, offset: u32, length: u32) -> bool {
        if length == 0 {
            return true;
        }
        self.written
            .iter()
            .any(|r| r.start <= offset && offset + length <= r.end)
    }

    pub fn is_fully_written(&self) -> bool {
        self.covers(0, self.len())
    }

    /// Bytes written contiguously from the start of the piece
    pub fn write_cursor(&self) -> u32 {
        match self.written.first() {
            Some(r) if r.start == 0 => r.end,
            _ => 0,
        }
    }

    pub fn written_bytes(&self) -> u64 {
        self.written.iter().map(|r| (r.end - r.start) as u64).sum()
    }

    /// Unwritten piece-relative ranges
    pub fn missing(&self) -> Vec<Range<u32>> {
        let mut gaps = Vec::new();
        let mut cursor = 0;
        for r in &self.written {
            if r.start > cursor {
                gaps.push(cursor..r.start);
            }
            cursor = r.end;
        }
        if cursor < self.len() {
            gaps.push(cursor..self.len());
        }
        gaps
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn mark_complete(&mut self) {
        self.written = vec![0..self.len()];
        self.complete = true;
    }

    /// Forget everything written so far
    pub fn reset(&mut self) {
        self.written.clear();
        self.complete = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_split() {
        let blocks = BlockRequest::split(3, 0..40000, BLOCK_SIZE);
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[2], BlockRequest::new(3, 32768, 40000 - 32768));
    }

    #[test]
    fn test_record_merges_ranges() {
        let mut piece = Piece::new(0, 0, 100, [0u8; 20]);
        piece.record(10, 10);
        piece.record(40, 10);
        assert_eq!(piece.missing(), vec![0..10, 20..40, 50..100]);
        piece.record(15, 30);
        assert_eq!(piece.missing(), vec![0..10, 50..100]);
        assert!(piece.covers(12, 30));
        assert!(!piece.covers(5, 10));
        piece.record(0, 10);
        assert_eq!(piece.write_cursor(), 50);
        piece.record(50, 50);
        assert!(piece.is_fully_written());
    }

    #[test]
    fn test_record_is_idempotent() {
        let mut piece = Piece::new(1, 100, 164, [0u8; 20]);
        piece.record(0, 32);
        piece.record(0, 32);
        assert_eq!(piece.written_bytes(), 32);
        assert_eq!(piece.len(), 64);
    }

    #[test]
    fn test_contains_rejects_overflow() {
        let piece = Piece::new(0, 0, 16, [0u8; 20]);
        assert!(piece.contains(0, 16));
        assert!(!piece.contains(8, 9));
        assert!(!piece.contains(u32::MAX, 2));
    }

    #[test]
    fn test_reset_clears_tracking() {
        let mut piece = Piece::new(0, 0, 16, [0u8; 20]);
        piece.mark_complete();
        assert!(piece.is_complete() && piece.is_fully_written());
        piece.reset();
        assert!(!piece.is_complete());
        assert_eq!(piece.written_bytes(), 0);
    }
}
