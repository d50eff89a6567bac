//! HTTP tracker requests and bencoded replies

use std::net::{IpAddr, SocketAddr};

use anyhow::Result;
use tracing::{debug, warn};

use crate::bencode::{self, Value};
use crate::error::TorrentError;
use crate::protocol::compact::decode_peers;
use crate::torrent::InfoHash;
use crate::tracker::message::{AnnounceMessage, AnnounceRequest, ScrapeMessage};

/// Scrape URL for an announce URL, when the last path segment starts
/// with `announce`
pub fn scrape_url(announce_url: &str) -> Option<String> {
    let slash = announce_url.rfind('/')?;
    let (base, last) = announce_url.split_at(slash + 1);
    last.strip_prefix("announce").map(|rest| format!("{}scrape{}", base, rest))
}

fn join_query(url: &str, query: &str) -> String {
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{}{}{}", url, separator, query)
}

/// Full announce URL with percent-encoded binary parameters
pub fn announce_url(base: &str, request: &AnnounceRequest) -> String {
    let mut query = format!(
        "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1&numwant={}",
        urlencoding::encode_binary(request.info_hash.as_bytes()),
        urlencoding::encode_binary(&request.peer_id),
        request.port,
        request.uploaded,
        request.downloaded,
        request.left,
        request.numwant
    );
    let event = request.event.as_str();
    if !event.is_empty() {
        query.push_str("&event=");
        query.push_str(event);
    }
    join_query(base, &query)
}

pub fn scrape_request_url(scrape_url: &str, info_hash: &InfoHash) -> String {
    join_query(
        scrape_url,
        &format!("info_hash={}", urlencoding::encode_binary(info_hash.as_bytes())),
    )
}

fn failure(root: &Value) -> Option<String> {
    root.get_str(b"failure reason").map(str::to_string)
}

fn count(dict: &Value, key: &[u8]) -> u32 {
    dict.get_int(key).map(|v| v.clamp(0, u32::MAX as i64) as u32).unwrap_or(0)
}

fn dictionary_peers(list: &[Value]) -> Vec<SocketAddr> {
    list.iter()
        .filter_map(|peer| {
            let ip: IpAddr = peer.get_str(b"ip")?.parse().ok()?;
            let port = u16::try_from(peer.get_int(b"port")?).ok()?;
            Some(SocketAddr::new(ip, port))
        })
        .collect()
}

/// Parse an announce body. A `failure reason` comes back as `Err(reason)`
/// inside `Ok` so the caller can tell it apart from a malformed body.
pub fn parse_announce(id: u32, body: &[u8]) -> Result<std::result::Result<AnnounceMessage, String>> {
    let root = bencode::decode(body)?;
    if let Some(reason) = failure(&root) {
        return Ok(Err(reason));
    }
    let interval = root
        .get_int(b"interval")
        .ok_or_else(|| TorrentError::protocol_error("Tracker response missing interval"))?;

    let peers = match root.get(b"peers") {
        Some(Value::Bytes(bytes)) => {
            let usable = bytes.len() - bytes.len() % 6;
            if usable != bytes.len() {
                warn!("Ignoring {} trailing bytes of compact peer list", bytes.len() - usable);
            }
            decode_peers(&bytes[..usable])?
        }
        Some(Value::List(list)) => dictionary_peers(list),
        _ => Vec::new(),
    };
    debug!("HTTP announce reply: {} peers, interval {}", peers.len(), interval);

    Ok(Ok(AnnounceMessage {
        id,
        interval: interval.clamp(0, u32::MAX as i64) as u32,
        seeders: count(&root, b"complete"),
        leechers: count(&root, b"incomplete"),
        peers,
        warning: root.get_str(b"warning message").map(str::to_string),
    }))
}

/// Parse a scrape body for one info hash
pub fn parse_scrape(id: u32, info_hash: &InfoHash, body: &[u8]) -> Result<std::result::Result<ScrapeMessage, String>> {
    let root = bencode::decode(body)?;
    if let Some(reason) = failure(&root) {
        return Ok(Err(reason));
    }
    let stats = root
        .get(b"files")
        .and_then(|files| files.get(info_hash.as_bytes()))
        .ok_or_else(|| TorrentError::protocol_error_with_source("Scrape response lacks torrent", info_hash.to_hex()))?;
    Ok(Ok(ScrapeMessage {
        id,
        seeders: count(stats, b"complete"),
        completed: count(stats, b"downloaded"),
        leechers: count(stats, b"incomplete"),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scrape_url() {
        assert_eq!(
            scrape_url("http://t.example.com/announce").as_deref(),
            Some("http://t.example.com/scrape")
        );
        assert_eq!(
            scrape_url("http://t.example.com/x/announce.php?passkey=1").as_deref(),
            Some("http://t.example.com/x/scrape.php?passkey=1")
        );
        assert_eq!(scrape_url("http://t.example.com/a"), None);
    }

    #[test]
    fn test_announce_url_encoding() {
        let mut hash = [0u8; 20];
        hash[0] = 0x12;
        hash[1] = b'a';
        let mut request = AnnounceRequest::new(InfoHash(hash), *b"-RT0100-abcdefghijkl", 6881);
        request.event = crate::tracker::message::TrackerEvent::Started;
        let url = announce_url("http://t.example.com/announce?key=1", &request);
        assert!(url.starts_with("http://t.example.com/announce?key=1&info_hash=%12a%00"));
        assert!(url.contains("peer_id=-RT0100-abcdefghijkl"));
        assert!(url.ends_with("&event=started"));
    }

    #[test]
    fn test_parse_announce() {
        let body = b"d8:completei4e10:incompletei2e8:intervali1800e5:peers6:\x0a\x00\x00\x01\x1a\xe1e";
        let message = parse_announce(3, body).unwrap().unwrap();
        assert_eq!(message.id, 3);
        assert_eq!(message.interval, 1800);
        assert_eq!(message.seeders, 4);
        assert_eq!(message.leechers, 2);
        assert_eq!(message.peers, vec!["10.0.0.1:6881".parse().unwrap()]);
    }

    #[test]
    fn test_parse_failure_and_dictionary_peers() {
        let failed = parse_announce(1, b"d14:failure reason9:not founde").unwrap();
        assert_eq!(failed, Err("not found".to_string()));

        let body = b"d8:intervali60e5:peersld2:ip8:10.0.0.24:porti80eeee";
        let message = parse_announce(1, body).unwrap().unwrap();
        assert_eq!(message.peers, vec!["10.0.0.2:80".parse().unwrap()]);
        assert!(parse_announce(1, b"de").is_err());
    }

    #[test]
    fn test_parse_scrape() {
        let hash = InfoHash([b'h'; 20]);
        let body = b"d5:filesd20:hhhhhhhhhhhhhhhhhhhhd8:completei5e10:downloadedi9e10:incompletei1eeee";
        let message = parse_scrape(4, &hash, body).unwrap().unwrap();
        assert_eq!((message.seeders, message.completed, message.leechers), (5, 9, 1));
        assert!(parse_scrape(4, &InfoHash([0u8; 20]), body).is_err());
    }
}
