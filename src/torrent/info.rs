//! Torrent information structures
//!
//! InfoHash plus the file and piece layout described by an `info` dictionary.

use std::fmt;

use sha1::{Digest, Sha1};
use anyhow::Result;

use crate::error::TorrentError;

/// 20-byte SHA-1 of the bencoded `info` dictionary
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct InfoHash(pub [u8; 20]);

impl InfoHash {
    /// Hash raw `info` dictionary bytes
    pub fn from_info_bytes(info_dict_bytes: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(info_dict_bytes);
        InfoHash(hasher.finalize().into())
    }

    /// Build from a 20-byte slice
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let array: [u8; 20] = bytes.try_into().map_err(|_| {
            TorrentError::validation_error_with_field(
                format!("Info hash must be 20 bytes, got {}", bytes.len()),
                "info_hash",
            )
        })?;
        Ok(InfoHash(array))
    }

    /// Parse a 40-character hex string
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| {
            TorrentError::validation_error_with_field(format!("Invalid hex info hash: {}", e), "info_hash")
        })?;
        Self::from_slice(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InfoHash({})", self.to_hex())
    }
}

impl From<[u8; 20]> for InfoHash {
    fn from(bytes: [u8; 20]) -> Self {
        InfoHash(bytes)
    }
}

/// Represents a file in a multi-file torrent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentFile {
    /// File path components (e.g., ["folder", "subfolder", "file.txt"])
    pub path: Vec<String>,
    /// File size in bytes
    pub length: u64,
    /// Padding/filler entry (BEP 47 `attr` contains `p`, or a `.pad` directory)
    pub padding: bool,
}

impl TorrentFile {
    pub fn new(path: Vec<String>, length: u64) -> Self {
        let padding = path.first().map(|p| p == ".pad").unwrap_or(false);
        Self { path, length, padding }
    }

    /// Padding entry with the given length
    pub fn padding(length: u64) -> Self {
        Self {
            path: vec![".pad".to_string(), length.to_string()],
            length,
            padding: true,
        }
    }

    pub fn is_padding(&self) -> bool {
        self.padding
    }
}

/// High-level torrent information
#[derive(Debug, Clone)]
pub struct TorrentInfo {
    /// Primary tracker announce URL
    pub announce: Option<String>,
    /// Every tracker URL from `announce-list`, flattened, primary excluded
    pub announce_list: Vec<String>,
    /// SHA1 hash of info dictionary
    pub info_hash: InfoHash,
    /// Size of each piece in bytes
    pub piece_length: u64,
    /// List of piece hashes (each is a 20-byte SHA1 hash)
    pub pieces: Vec<[u8; 20]>,
    /// Torrent name
    pub name: String,
    /// Single file size (None for multi-file torrents)
    pub length: Option<u64>,
    /// Files in multi-file torrents (None for single-file torrents)
    pub files: Option<Vec<TorrentFile>>,
    /// `private` flag; private torrents only use their own trackers
    pub private: bool,
}

impl TorrentInfo {
    /// Calculate total size of all files in torrent
    pub fn total_size(&self) -> u64 {
        if let Some(length) = self.length {
            length
        } else if let Some(files) = &self.files {
            files.iter().map(|f| f.length).sum()
        } else {
            0
        }
    }

    /// Get number of pieces in torrent
    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    /// All files in torrent order; a single-file torrent yields one entry named after the torrent
    pub fn files(&self) -> Vec<TorrentFile> {
        match (&self.files, self.length) {
            (Some(files), _) => files.clone(),
            (None, Some(length)) => vec![TorrentFile::new(vec![self.name.clone()], length)],
            (None, None) => Vec::new(),
        }
    }

    /// Check if this is a multi-file torrent
    pub fn is_multi_file(&self) -> bool {
        self.files.is_some()
    }

    /// Get info hash as a hex string
    pub fn info_hash_hex(&self) -> String {
        self.info_hash.to_hex()
    }

    /// Declared trackers, primary first, without duplicates
    pub fn trackers(&self) -> Vec<String> {
        let mut urls: Vec<String> = Vec::new();
        for url in self.announce.iter().chain(self.announce_list.iter()) {
            if !urls.contains(url) {
                urls.push(url.clone());
            }
        }
        urls
    }

    /// Parse piece hashes from concatenated bytes in torrent file
    pub fn parse_piece_hashes(pieces_bytes: &[u8]) -> Result<Vec<[u8; 20]>> {
        if pieces_bytes.len() % 20 != 0 {
            return Err(TorrentError::parse_error(format!(
                "Pieces field length must be a multiple of 20, got {}",
                pieces_bytes.len()
            ))
            .into());
        }

        let mut pieces = Vec::with_capacity(pieces_bytes.len() / 20);
        for chunk in pieces_bytes.chunks_exact(20) {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(chunk);
            pieces.push(hash);
        }

        Ok(pieces)
    }

    /// Get piece hash for a specific piece index
    pub fn piece_hash(&self, index: usize) -> Option<[u8; 20]> {
        self.pieces.get(index).copied()
    }

    /// Get byte range for a specific piece
    pub fn piece_range(&self, index: usize) -> Option<(u64, u64)> {
        if index >= self.pieces.len() {
            return None;
        }

        let start = (index as u64) * self.piece_length;
        let total = self.total_size();
        let end = std::cmp::min(start + self.piece_length, total);

        Some((start, end))
    }

    /// Length of one piece (the last one may be short)
    pub fn piece_size(&self, index: usize) -> Option<u64> {
        self.piece_range(index).map(|(start, end)| end - start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(length: u64, pieces: usize) -> TorrentInfo {
        TorrentInfo {
            announce: Some("http://tracker.example.com/announce".to_string()),
            announce_list: vec![],
            info_hash: InfoHash([1u8; 20]),
            piece_length: 1024,
            pieces: vec![[2u8; 20]; pieces],
            name: "test".to_string(),
            length: Some(length),
            files: None,
            private: false,
        }
    }

    #[test]
    fn test_info_hash_hex_round_trip() {
        let hash = InfoHash([0xab; 20]);
        let parsed = InfoHash::from_hex(&hash.to_hex()).unwrap();
        assert_eq!(hash, parsed);
        assert!(InfoHash::from_hex("abcd").is_err());
    }

    #[test]
    fn test_info_hash_from_info_bytes() {
        let hash = InfoHash::from_info_bytes(b"d4:name4:teste");
        assert_eq!(hash, InfoHash::from_info_bytes(b"d4:name4:teste"));
        assert_ne!(hash, InfoHash::from_info_bytes(b"d4:name4:tesue"));
    }

    #[test]
    fn test_padding_detection() {
        assert!(TorrentFile::new(vec![".pad".to_string(), "100".to_string()], 100).is_padding());
        assert!(!TorrentFile::new(vec!["data.bin".to_string()], 100).is_padding());
        assert!(TorrentFile::padding(12).is_padding());
    }

    #[test]
    fn test_single_file_files() {
        let info = sample(2048, 2);
        let files = info.files();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, vec!["test"]);
        assert_eq!(info.total_size(), 2048);
        assert!(!info.is_multi_file());
    }

    #[test]
    fn test_trackers_deduplicated() {
        let mut info = sample(10, 1);
        info.announce_list = vec![
            "http://tracker.example.com/announce".to_string(),
            "udp://other.example.com:80".to_string(),
        ];
        assert_eq!(info.trackers().len(), 2);
    }

    #[test]
    fn test_parse_piece_hashes_invalid() {
        let hashes = vec![1u8; 21];
        assert!(TorrentInfo::parse_piece_hashes(&hashes).is_err());
    }

    #[test]
    fn test_piece_range() {
        let info = sample(1500, 2);
        assert_eq!(info.piece_range(0), Some((0, 1024)));
        assert_eq!(info.piece_range(1), Some((1024, 1500)));
        assert_eq!(info.piece_range(2), None);
        assert_eq!(info.piece_size(1), Some(476));
    }
}
