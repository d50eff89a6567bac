//! Torrent file parser
//!
//! Turns `.torrent` files, or a bare `info` dictionary received through
//! metadata exchange, into [`TorrentInfo`].

use anyhow::Result;
use tracing::{debug, error, info, trace};

use crate::bencode::{self, Value};
use crate::error::TorrentError;
use crate::torrent::info::{InfoHash, TorrentFile, TorrentInfo};

/// Parser for .torrent files
pub struct TorrentParser;

impl TorrentParser {
    /// Parse a .torrent file from bytes
    pub fn parse_bytes(data: &[u8]) -> Result<TorrentInfo> {
        info!("Parsing torrent file from {} bytes", data.len());
        trace!("Torrent data (first 100 bytes): {:?}", &data[..data.len().min(100)]);

        let root = bencode::decode(data).map_err(|e| {
            error!("Torrent file is not valid bencode: {}", e);
            TorrentError::parse_error_with_source("Torrent file is not valid bencode", e.to_string())
        })?;
        if root.as_dict().is_none() {
            return Err(TorrentError::parse_error("Root must be a dictionary").into());
        }

        let info_bytes = bencode::raw_dict_value(data, b"info")?
            .ok_or_else(|| TorrentError::parse_error("Missing info dictionary"))?;

        let mut torrent = Self::parse_info(info_bytes)?;

        torrent.announce = root.get_str(b"announce").map(str::to_string);
        if let Some(tiers) = root.get_list(b"announce-list") {
            for url in tiers.iter().filter_map(Value::as_list).flatten().filter_map(Value::as_str) {
                let url = url.trim().to_string();
                if url.is_empty() || Some(&url) == torrent.announce.as_ref() || torrent.announce_list.contains(&url) {
                    continue;
                }
                torrent.announce_list.push(url);
            }
        }

        info!(
            "Parsed torrent '{}' ({}), {} pieces, {} trackers",
            torrent.name,
            torrent.info_hash,
            torrent.piece_count(),
            torrent.trackers().len()
        );
        Ok(torrent)
    }

    /// Parse a .torrent file from a file path
    pub fn parse_file(path: &std::path::Path) -> Result<TorrentInfo> {
        info!("Loading torrent file from: {}", path.display());

        let data = std::fs::read(path)
            .map_err(|e| {
                error!("Failed to read torrent file '{}': {}", path.display(), e);
                TorrentError::storage_error_full("Failed to read torrent file", path.display().to_string(), e.to_string())
            })?;

        debug!("Read {} bytes from torrent file", data.len());
        Self::parse_bytes(&data)
    }

    /// Parse raw `info` dictionary bytes. The info hash is computed over exactly these bytes.
    pub fn parse_info(info_bytes: &[u8]) -> Result<TorrentInfo> {
        let info_hash = InfoHash::from_info_bytes(info_bytes);
        let info = bencode::decode(info_bytes)?;
        if info.as_dict().is_none() {
            return Err(TorrentError::parse_error("info must be a dictionary").into());
        }

        let name = info
            .get_bytes(b"name")
            .map(|b| String::from_utf8_lossy(b).to_string())
            .ok_or_else(|| TorrentError::parse_error("Missing name field"))?;

        let piece_length = info
            .get_int(b"piece length")
            .filter(|&l| l > 0)
            .ok_or_else(|| TorrentError::parse_error("Missing or invalid piece length"))? as u64;

        let pieces_bytes = info
            .get_bytes(b"pieces")
            .ok_or_else(|| TorrentError::parse_error("Missing pieces field"))?;
        let pieces = TorrentInfo::parse_piece_hashes(pieces_bytes)?;

        let private = info.get_int(b"private") == Some(1);

        let (length, files) = if let Some(len) = info.get_int(b"length") {
            if len < 0 {
                return Err(TorrentError::parse_error("Negative length").into());
            }
            (Some(len as u64), None)
        } else if let Some(entries) = info.get_list(b"files") {
            let mut files = Vec::with_capacity(entries.len());
            for entry in entries {
                files.push(Self::parse_file_entry(entry)?);
            }
            (None, Some(files))
        } else {
            return Err(TorrentError::parse_error("Neither length nor files found in info dict").into());
        };

        let torrent = TorrentInfo {
            announce: None,
            announce_list: Vec::new(),
            info_hash,
            piece_length,
            pieces,
            name,
            length,
            files,
            private,
        };

        let expected = torrent.total_size().div_ceil(piece_length);
        if expected != torrent.piece_count() as u64 {
            error!(
                "Piece count mismatch: {} hashes for {} bytes at {} per piece",
                torrent.piece_count(),
                torrent.total_size(),
                piece_length
            );
            return Err(TorrentError::parse_error_with_source(
                "Piece count does not match total size",
                format!("expected {}, got {}", expected, torrent.piece_count()),
            )
            .into());
        }

        debug!("Parsed info dictionary {} ({} bytes)", info_hash, info_bytes.len());
        Ok(torrent)
    }

    fn parse_file_entry(entry: &Value) -> Result<TorrentFile> {
        let length = entry
            .get_int(b"length")
            .filter(|&l| l >= 0)
            .ok_or_else(|| TorrentError::parse_error("Missing file length"))? as u64;

        let path: Vec<String> = entry
            .get_list(b"path")
            .ok_or_else(|| TorrentError::parse_error("Missing file path"))?
            .iter()
            .filter_map(Value::as_bytes)
            .map(|b| String::from_utf8_lossy(b).to_string())
            .collect();
        if path.is_empty() || path.iter().any(|c| c == ".." || c.contains('/') || c.contains('\\')) {
            return Err(TorrentError::parse_error_with_source("Unsafe file path", path.join("/")).into());
        }

        let mut file = TorrentFile::new(path, length);
        if entry.get_bytes(b"attr").map(|a| a.contains(&b'p')).unwrap_or(false) {
            file.padding = true;
        }
        Ok(file)
    }
}
