//! Magnet link parser
//!
//! Extracts the info hash, display name and trackers from `magnet:` URIs.
//! Metadata itself is fetched later from peers over ut_metadata.

use anyhow::Result;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::TorrentError;
use crate::torrent::info::InfoHash;

/// Parsed magnet link information
#[derive(Debug, Clone)]
pub struct MagnetLink {
    /// SHA1 info hash from the `xt` parameter
    pub info_hash: InfoHash,
    /// Display name (dn parameter)
    pub display_name: Option<String>,
    /// Tracker URLs (tr parameters)
    pub trackers: Vec<String>,
    /// Total size in bytes (xl parameter)
    pub total_size: Option<u64>,
}

/// Parser for magnet links
pub struct MagnetParser;

impl MagnetParser {
    /// Parse a magnet link string
    ///
    /// # Example
    /// ```ignore
    /// let magnet = "magnet:?xt=urn:btih:dd8255ecdc7ca55fb0bbf81323d87062db1f6d1c&dn=Big+Buck+Bunny";
    /// let link = MagnetParser::parse(magnet)?;
    /// ```
    pub fn parse(magnet_uri: &str) -> Result<MagnetLink> {
        info!("Parsing magnet link: {}", magnet_uri);

        let url = Url::parse(magnet_uri.trim()).map_err(|e| {
            warn!("Invalid magnet URL format: {}", e);
            TorrentError::validation_error_with_field(format!("Invalid magnet URL format: {}", e), "magnet")
        })?;

        if url.scheme() != "magnet" {
            warn!("URL is not a magnet link: scheme is '{}'", url.scheme());
            return Err(TorrentError::validation_error_with_field("URL is not a magnet link", "magnet").into());
        }

        let mut info_hash = None;
        let mut display_name = None;
        let mut trackers: Vec<String> = Vec::new();
        let mut total_size = None;

        for (key, value) in url.query_pairs().into_owned() {
            match key.as_str() {
                "xt" => {
                    if let Some(hash) = Self::extract_info_hash(&value)? {
                        debug!("Extracted info hash: {}", hash);
                        info_hash = Some(hash);
                    }
                }
                "dn" => display_name = Some(value),
                "tr" => {
                    if !trackers.contains(&value) {
                        trackers.push(value);
                    }
                }
                "xl" => match value.parse::<u64>() {
                    Ok(size) => total_size = Some(size),
                    Err(_) => warn!("Invalid xl parameter value: {}", value),
                },
                _ => debug!("Ignoring magnet parameter: {}", key),
            }
        }

        let info_hash = info_hash.ok_or_else(|| {
            warn!("Magnet link missing required info hash (xt parameter)");
            TorrentError::validation_error_with_field(
                "Magnet link must contain an info hash (xt=urn:btih:<hash>)",
                "xt",
            )
        })?;

        info!(
            "Parsed magnet link: info_hash={}, name={}, trackers={}",
            info_hash,
            display_name.as_deref().unwrap_or("(none)"),
            trackers.len()
        );

        Ok(MagnetLink {
            info_hash,
            display_name,
            trackers,
            total_size,
        })
    }

    /// Extract the info hash from an `xt` value (`urn:btih:<40 hex | 32 base32>`)
    fn extract_info_hash(xt_value: &str) -> Result<Option<InfoHash>> {
        let Some(hash_str) = xt_value.strip_prefix("urn:btih:") else {
            debug!("xt parameter is not a BitTorrent info hash: {}", xt_value);
            return Ok(None);
        };

        match hash_str.len() {
            40 => InfoHash::from_hex(hash_str).map(Some),
            32 => {
                let bytes = base32_decode(hash_str).ok_or_else(|| {
                    TorrentError::validation_error_with_field("Invalid base32 info hash", "xt")
                })?;
                InfoHash::from_slice(&bytes).map(Some)
            }
            len => Err(TorrentError::validation_error_with_field(
                format!("Info hash has invalid length: {} (expected 40 hex or 32 base32)", len),
                "xt",
            )
            .into()),
        }
    }

    /// Check if a string looks like a magnet link
    pub fn is_magnet_link(input: &str) -> bool {
        input.trim().starts_with("magnet:?") || input.trim().starts_with("magnet://")
    }
}

/// RFC 4648 base32 without padding
fn base32_decode(input: &str) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(input.len() * 5 / 8);
    let mut buffer: u32 = 0;
    let mut bits = 0;
    for c in input.bytes() {
        let v = match c.to_ascii_uppercase() {
            b'A'..=b'Z' => c.to_ascii_uppercase() - b'A',
            b'2'..=b'7' => c - b'2' + 26,
            _ => return None,
        };
        buffer = (buffer << 5) | v as u32;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push((buffer >> bits) as u8);
            buffer &= (1 << bits) - 1;
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BIG_BUCK_BUNNY_MAGNET: &str = "magnet:?xt=urn:btih:dd8255ecdc7ca55fb0bbf81323d87062db1f6d1c&dn=Big+Buck+Bunny&tr=udp%3A%2F%2Fexplodie.org%3A6969&tr=udp%3A%2F%2Ftracker.opentrackr.org%3A1337&tr=udp%3A%2F%2Fexplodie.org%3A6969";

    #[test]
    fn test_parse_big_buck_bunny_magnet() {
        let link = MagnetParser::parse(BIG_BUCK_BUNNY_MAGNET).unwrap();
        assert_eq!(link.info_hash.to_hex(), "dd8255ecdc7ca55fb0bbf81323d87062db1f6d1c");
        assert_eq!(link.display_name, Some("Big Buck Bunny".to_string()));
        assert_eq!(link.trackers.len(), 2);
        assert_eq!(link.trackers[0], "udp://explodie.org:6969");
    }

    #[test]
    fn test_parse_base32_hash() {
        let link = MagnetParser::parse("magnet:?xt=urn:btih:77777777777777777777777777777777").unwrap();
        assert_eq!(link.info_hash, InfoHash([0xff; 20]));

        let zero = MagnetParser::parse("magnet:?xt=urn:btih:AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA").unwrap();
        assert_eq!(zero.info_hash, InfoHash([0u8; 20]));
    }

    #[test]
    fn test_parse_magnet_with_size() {
        let magnet = "magnet:?xt=urn:btih:dd8255ecdc7ca55fb0bbf81323d87062db1f6d1c&xl=1234567890";
        let link = MagnetParser::parse(magnet).unwrap();
        assert_eq!(link.total_size, Some(1234567890));
    }

    #[test]
    fn test_parse_invalid_magnets() {
        assert!(MagnetParser::parse("magnet:?dn=Test+Torrent&tr=http://tracker.com").is_err());
        assert!(MagnetParser::parse("not-a-magnet-link").is_err());
        assert!(MagnetParser::parse("http:?xt=urn:btih:dd8255ecdc7ca55fb0bbf81323d87062db1f6d1c").is_err());
        assert!(MagnetParser::parse("magnet:?xt=urn:btih:dd8255ecdc7ca55fb0bbf81323d87062db1f6d").is_err());
    }

    #[test]
    fn test_non_bittorrent_xt_ignored() {
        let xt = "urn:sha1:dd8255ecdc7ca55fb0bbf81323d87062db1f6d1c";
        assert!(MagnetParser::extract_info_hash(xt).unwrap().is_none());
    }

    #[test]
    fn test_is_magnet_link() {
        assert!(MagnetParser::is_magnet_link("  magnet:?xt=urn:btih:dd8255ecdc7ca55fb0bbf81323d87062db1f6d1c  "));
        assert!(!MagnetParser::is_magnet_link("example.torrent"));
    }
}
