//! File layout
//!
//! Maps the flat, byte-addressable torrent onto its files. A range of
//! absolute offsets may straddle several files; [`FileMap::slices`] splits
//! it into per-file segments.

use std::path::PathBuf;

use crate::torrent::TorrentInfo;

/// A file of the torrent, positioned in the flat byte space
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Position in the torrent file list
    pub index: usize,
    /// Path relative to the download directory
    pub path: PathBuf,
    /// Absolute offset of the first byte
    pub offset: u64,
    pub length: u64,
    /// Padding files are never stored
    pub padding: bool,
}

impl FileEntry {
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// Part of an absolute range that falls into one file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSlice {
    pub file: usize,
    /// Offset inside the file
    pub file_offset: u64,
    pub length: u64,
    /// Offset of this slice relative to the start of the requested range
    pub range_offset: u64,
}

/// Ordered file list with cumulative offsets
#[derive(Debug, Clone, Default)]
pub struct FileMap {
    entries: Vec<FileEntry>,
    total_length: u64,
}

impl FileMap {
    /// Layout of a torrent: single-file torrents store `name`, multi-file
    /// torrents store `name/<path...>`.
    pub fn from_info(info: &TorrentInfo) -> Self {
        let multi = info.is_multi_file();
        let mut entries = Vec::new();
        let mut offset = 0;
        for (index, file) in info.files().into_iter().enumerate() {
            let mut path = PathBuf::new();
            if multi {
                path.push(&info.name);
            }
            for component in &file.path {
                path.push(component);
            }
            entries.push(FileEntry {
                index,
                path,
                offset,
                length: file.length,
                padding: file.is_padding(),
            });
            offset += file.length;
        }
        Self {
            entries,
            total_length: offset,
        }
    }

    pub fn entries(&self) -> &[FileEntry] {
        &self.entries
    }

    pub fn get(&self, index: usize) -> Option<&FileEntry> {
        self.entries.get(index)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    /// Split `offset..offset+length` into per-file slices. Zero-length files
    /// are skipped; the part beyond the torrent end is dropped.
    pub fn slices(&self, offset: u64, length: u64) -> Vec<FileSlice> {
        let end = (offset + length).min(self.total_length);
        let first = self.entries.partition_point(|e| e.end() <= offset);
        let mut out = Vec::new();
        for entry in &self.entries[first..] {
            if entry.offset >= end {
                break;
            }
            if entry.length == 0 {
                continue;
            }
            let start = offset.max(entry.offset);
            let stop = end.min(entry.end());
            out.push(FileSlice {
                file: entry.index,
                file_offset: start - entry.offset,
                length: stop - start,
                range_offset: start - offset,
            });
        }
        out
    }

    /// Files overlapping `start..end`
    pub fn files_in_range(&self, start: u64, end: u64) -> impl Iterator<Item = &FileEntry> {
        self.entries
            .iter()
            .filter(move |e| e.length > 0 && e.offset < end && e.end() > start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::{InfoHash, TorrentFile};

    fn multi() -> TorrentInfo {
        TorrentInfo {
            announce: None,
            announce_list: vec![],
            info_hash: InfoHash([0u8; 20]),
            piece_length: 16,
            pieces: vec![[0u8; 20]; 2],
            name: "root".to_string(),
            length: None,
            files: Some(vec![
                TorrentFile::new(vec!["a".into()], 10),
                TorrentFile::new(vec!["empty".into()], 0),
                TorrentFile::padding(6),
                TorrentFile::new(vec!["sub".into(), "b".into()], 12),
            ]),
            private: false,
        }
    }

    #[test]
    fn test_layout_paths_and_offsets() {
        let map = FileMap::from_info(&multi());
        assert_eq!(map.total_length(), 28);
        assert_eq!(map.get(0).unwrap().path, PathBuf::from("root/a"));
        assert_eq!(map.get(3).unwrap().path, PathBuf::from("root/sub/b"));
        assert_eq!(map.get(3).unwrap().offset, 16);
        assert!(map.get(2).unwrap().padding);
    }

    #[test]
    fn test_slices_straddle_files() {
        let map = FileMap::from_info(&multi());
        let slices = map.slices(8, 12);
        assert_eq!(
            slices,
            vec![
                FileSlice { file: 0, file_offset: 8, length: 2, range_offset: 0 },
                FileSlice { file: 2, file_offset: 0, length: 6, range_offset: 2 },
                FileSlice { file: 3, file_offset: 0, length: 4, range_offset: 8 },
            ]
        );
    }

    #[test]
    fn test_slices_clamped_to_end() {
        let map = FileMap::from_info(&multi());
        let slices = map.slices(20, 100);
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].length, 8);
        assert_eq!(map.files_in_range(0, 16).count(), 2);
    }
}
