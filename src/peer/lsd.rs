//! Local Service Discovery
//!
//! Announces our torrents to the IPv4 multicast group `239.192.152.143:6771`
//! and reports `BT-SEARCH` announcements from other clients on the LAN.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use anyhow::Result;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::time::{interval, Duration};
use tracing::{debug, info, trace, warn};

use crate::error::TorrentError;
use crate::torrent::InfoHash;

pub const LSD_PORT: u16 = 6771;
pub const LSD_MULTICAST: Ipv4Addr = Ipv4Addr::new(239, 192, 152, 143);
pub const LSD_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(5 * 60);
const LSD_COOKIE_SIZE: usize = 8;
const LSD_CHANNEL_CAPACITY: usize = 64;

/// An announcement heard from a local peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LsdAnnounce {
    pub info_hash: InfoHash,
    pub port: u16,
    pub source: SocketAddr,
}

impl LsdAnnounce {
    /// Address the announcing peer accepts connections on
    pub fn peer_addr(&self) -> SocketAddr {
        SocketAddr::new(self.source.ip(), self.port)
    }
}

/// Format one `BT-SEARCH` message
pub fn build_announce(info_hash: &InfoHash, port: u16, cookie: &str) -> String {
    format!(
        "BT-SEARCH * HTTP/1.1\r\n\
         Host: {}:{}\r\n\
         Port: {}\r\n\
         Infohash: {}\r\n\
         cookie: {}\r\n\
         \r\n",
        LSD_MULTICAST,
        LSD_PORT,
        port,
        info_hash.to_hex(),
        cookie
    )
}

/// Parse a `BT-SEARCH` message. Header names are matched case-insensitively;
/// the cookie is returned so the caller can drop its own announcements.
pub fn parse_announce(data: &[u8], source: SocketAddr) -> Result<(LsdAnnounce, Option<String>)> {
    let text = std::str::from_utf8(data).map_err(|_| TorrentError::protocol_error("LSD message is not UTF-8"))?;
    if !text.starts_with("BT-SEARCH") {
        return Err(TorrentError::protocol_error("Not a BT-SEARCH message").into());
    }

    let mut port = None;
    let mut info_hash = None;
    let mut cookie = None;
    for line in text.lines().skip(1) {
        let Some((name, value)) = line.split_once(':') else { continue };
        let value = value.trim();
        match name.trim().to_ascii_lowercase().as_str() {
            "port" => port = value.parse::<u16>().ok().filter(|p| *p != 0),
            "infohash" => info_hash = InfoHash::from_hex(value).ok(),
            "cookie" => cookie = Some(value.to_string()),
            _ => {}
        }
    }

    let port = port.ok_or_else(|| TorrentError::protocol_error("LSD message missing port"))?;
    let info_hash = info_hash.ok_or_else(|| TorrentError::protocol_error("LSD message missing info hash"))?;
    Ok((
        LsdAnnounce {
            info_hash,
            port,
            source,
        },
        cookie,
    ))
}

/// Multicast announcer and listener
#[derive(Debug)]
pub struct LsdService {
    socket: Arc<UdpSocket>,
    port: u16,
    cookie: String,
    announce_tx: broadcast::Sender<LsdAnnounce>,
}

impl LsdService {
    /// Join the multicast group; `port` is our peer listen port
    pub async fn new(port: u16) -> Result<Self> {
        let socket = Self::bind_v4().await?;
        let cookie = hex::encode(rand::random::<[u8; LSD_COOKIE_SIZE]>());
        let (announce_tx, _) = broadcast::channel(LSD_CHANNEL_CAPACITY);
        info!("LSD joined {}:{} (cookie {})", LSD_MULTICAST, LSD_PORT, cookie);
        Ok(Self {
            socket,
            port,
            cookie,
            announce_tx,
        })
    }

    async fn bind_v4() -> Result<Arc<UdpSocket>> {
        let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, LSD_PORT))
            .await
            .map_err(|e| TorrentError::network_error_with_address(format!("LSD bind failed: {}", e), LSD_PORT.to_string()))?;
        socket.set_multicast_loop_v4(false)?;
        socket.join_multicast_v4(LSD_MULTICAST, Ipv4Addr::UNSPECIFIED)?;
        Ok(Arc::new(socket))
    }

    pub fn cookie(&self) -> &str {
        &self.cookie
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LsdAnnounce> {
        self.announce_tx.subscribe()
    }

    /// Announce `info_hashes` periodically and publish what we hear.
    /// Returns only when the socket fails.
    pub async fn run(&self, info_hashes: Vec<InfoHash>) {
        let mut ticker = interval(LSD_ANNOUNCE_INTERVAL);
        let mut buf = vec![0u8; 1024];
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for hash in &info_hashes {
                        if let Err(e) = self.announce(hash).await {
                            debug!("LSD announce of {} failed: {}", hash, e);
                        }
                    }
                }
                received = self.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((n, source)) => self.on_datagram(&buf[..n], source),
                        Err(e) => {
                            warn!("LSD receive failed: {}", e);
                            return;
                        }
                    }
                }
            }
        }
    }

    fn on_datagram(&self, data: &[u8], source: SocketAddr) {
        match parse_announce(data, source) {
            Ok((_, Some(cookie))) if cookie == self.cookie => trace!("Ignoring our own LSD announce"),
            Ok((announce, _)) => {
                debug!("LSD: {} at {}", announce.info_hash, announce.peer_addr());
                let _ = self.announce_tx.send(announce);
            }
            Err(e) => trace!("Ignoring LSD datagram from {}: {}", source, e),
        }
    }

    pub async fn announce(&self, info_hash: &InfoHash) -> Result<()> {
        let message = build_announce(info_hash, self.port, &self.cookie);
        self.socket
            .send_to(message.as_bytes(), SocketAddrV4::new(LSD_MULTICAST, LSD_PORT))
            .await?;
        trace!("LSD announced {}", info_hash);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> SocketAddr {
        "192.168.1.20:6771".parse().unwrap()
    }

    #[test]
    fn test_build_announce_layout() {
        let hash = InfoHash([0xab; 20]);
        let message = build_announce(&hash, 6881, "cafebabe");
        assert!(message.starts_with("BT-SEARCH * HTTP/1.1\r\nHost: 239.192.152.143:6771\r\n"));
        assert!(message.contains("Port: 6881\r\n"));
        assert!(message.contains(&format!("Infohash: {}\r\n", "ab".repeat(20))));
        assert!(message.ends_with("cookie: cafebabe\r\n\r\n"));
    }

    #[test]
    fn test_parse_announce() {
        let hash = InfoHash([0x11; 20]);
        let message = build_announce(&hash, 51413, "00ff");
        let (announce, cookie) = parse_announce(message.as_bytes(), source()).unwrap();
        assert_eq!(announce.info_hash, hash);
        assert_eq!(announce.peer_addr(), "192.168.1.20:51413".parse().unwrap());
        assert_eq!(cookie.as_deref(), Some("00ff"));
    }

    #[test]
    fn test_parse_headers_case_insensitive() {
        let text = format!("BT-SEARCH * HTTP/1.1\r\nPORT: 7000\r\nINFOHASH: {}\r\n\r\n", "22".repeat(20));
        let (announce, cookie) = parse_announce(text.as_bytes(), source()).unwrap();
        assert_eq!(announce.port, 7000);
        assert_eq!(cookie, None);
    }

    #[test]
    fn test_parse_rejects_bad_messages() {
        assert!(parse_announce(b"NOTIFY * HTTP/1.1\r\n\r\n", source()).is_err());
        let no_port = format!("BT-SEARCH * HTTP/1.1\r\nInfohash: {}\r\n\r\n", "22".repeat(20));
        assert!(parse_announce(no_port.as_bytes(), source()).is_err());
        let bad_hash = "BT-SEARCH * HTTP/1.1\r\nPort: 1\r\nInfohash: zz\r\n\r\n";
        assert!(parse_announce(bad_hash.as_bytes(), source()).is_err());
        assert!(parse_announce(&[0xff, 0xfe], source()).is_err());
    }
}
