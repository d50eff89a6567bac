//! Tracker client manager
//!
//! Owns one client per announce URL and the table of in-flight launchers.
//! HTTP replies and UDP datagrams are both routed through the
//! `on_*_message` callbacks, keyed by launcher id.

use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use anyhow::Result;
use tokio::net::UdpSocket;
use tokio::sync::{oneshot, Mutex, OnceCell, RwLock};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

use crate::cli::config::TrackerConfig;
use crate::error::TorrentError;
use crate::tracker::client::{TrackerClient, TrackerKind};
use crate::tracker::http;
use crate::tracker::launcher::TrackerLauncher;
use crate::tracker::message::{AnnounceMessage, AnnounceRequest, ScrapeMessage, TrackerReply};
use crate::tracker::udp::{self, UdpResponse};

const UDP_BUFFER_SIZE: usize = 2048;

#[derive(Debug)]
pub struct TrackerManager {
    config: TrackerConfig,
    clients: RwLock<Vec<Arc<TrackerClient>>>,
    pending: Mutex<HashMap<u32, oneshot::Sender<TrackerReply>>>,
    next_id: AtomicU32,
    http: reqwest::Client,
    udp: OnceCell<Arc<UdpSocket>>,
    this: Weak<TrackerManager>,
}

impl TrackerManager {
    /// Create the manager and register the default tracker pool
    pub fn new(config: TrackerConfig) -> Result<Arc<Self>> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| TorrentError::tracker_error_full("Failed to build HTTP client", "pool", e.to_string()))?;

        let next_id = AtomicU32::new(rand::random::<u32>() >> 1);
        let mut clients: Vec<Arc<TrackerClient>> = Vec::new();
        for url in &config.default_trackers {
            let url = url.trim();
            if clients.iter().any(|c| c.announce_url() == url) {
                continue;
            }
            match TrackerClient::new(next_id.fetch_add(1, Ordering::Relaxed), url, config.max_failures) {
                Ok(client) => clients.push(Arc::new(client)),
                Err(e) => warn!("Skipping default tracker {}: {}", url, e),
            }
        }
        info!("Tracker pool initialized with {} clients", clients.len());

        Ok(Arc::new_cyclic(|this| Self {
            config,
            clients: RwLock::new(clients),
            pending: Mutex::new(HashMap::new()),
            next_id,
            http,
            udp: OnceCell::new(),
            this: this.clone(),
        }))
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    fn next_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Client for `announce_url`, created on first registration
    pub async fn register(&self, announce_url: &str) -> Result<Arc<TrackerClient>> {
        let announce_url = announce_url.trim();
        let mut clients = self.clients.write().await;
        if let Some(existing) = clients.iter().find(|c| c.announce_url() == announce_url) {
            return Ok(Arc::clone(existing));
        }
        let client = Arc::new(TrackerClient::new(self.next_id(), announce_url, self.config.max_failures)?);
        debug!("Registered tracker {} as {}", announce_url, client.id());
        clients.push(Arc::clone(&client));
        Ok(client)
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Clients for a torrent: its declared trackers, topped up from the
    /// pool by descending weight unless the torrent is private
    pub async fn clients(&self, primary: Option<&str>, urls: &[String], private: bool) -> Vec<Arc<TrackerClient>> {
        let mut declared: Vec<Arc<TrackerClient>> = Vec::new();
        for url in primary.into_iter().chain(urls.iter().map(String::as_str)) {
            if url.trim().is_empty() {
                continue;
            }
            match self.register(url).await {
                Ok(client) => {
                    if client.is_available() && !declared.iter().any(|c| c.id() == client.id()) {
                        declared.push(client);
                    }
                }
                Err(e) => warn!("Ignoring tracker {}: {}", url, e),
            }
        }

        if private {
            debug!("Private torrent, not adding pool trackers");
            return declared;
        }
        let wanted = self.config.min_trackers.saturating_sub(declared.len());
        if wanted == 0 {
            return declared;
        }

        let mut pool: Vec<Arc<TrackerClient>> = self
            .clients
            .read()
            .await
            .iter()
            .filter(|c| c.is_available() && !declared.iter().any(|d| d.id() == c.id()))
            .cloned()
            .collect();
        pool.sort_by_key(|c| Reverse(c.weight()));
        debug!("Adding up to {} pool trackers from {} candidates", wanted, pool.len());
        declared.extend(pool.into_iter().take(wanted));
        declared
    }

    /// New launcher for one exchange with `client`
    pub fn launcher(&self, client: Arc<TrackerClient>, request: AnnounceRequest) -> TrackerLauncher {
        TrackerLauncher::new(self.next_id(), client, request)
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Announce and wait for the reply or the timeout
    pub async fn announce(&self, launcher: &TrackerLauncher) -> Result<AnnounceMessage> {
        let client = launcher.client();
        let outcome = self.exchange(launcher, false).await;
        match outcome {
            Ok(TrackerReply::Announce(message)) => {
                client.record_success();
                info!(
                    "Tracker {} returned {} peers ({} seeders, {} leechers, interval {})",
                    client.announce_url(),
                    message.peers.len(),
                    message.seeders,
                    message.leechers,
                    message.interval
                );
                Ok(message)
            }
            Ok(TrackerReply::Failure(reason)) => {
                client.record_failure(&reason);
                if client.is_udp() {
                    client.clear_connection_id().await;
                }
                Err(TorrentError::tracker_error_full("Tracker rejected announce", client.announce_url(), reason).into())
            }
            Ok(TrackerReply::Scrape(_)) => {
                client.record_failure("scrape reply to announce");
                Err(TorrentError::tracker_error_with_tracker("Unexpected scrape reply", client.announce_url()).into())
            }
            Err(e) => {
                client.record_failure(&e.to_string());
                Err(e)
            }
        }
    }

    /// Scrape and wait for the reply or the timeout
    pub async fn scrape(&self, launcher: &TrackerLauncher) -> Result<ScrapeMessage> {
        let url = launcher.announce_url().to_string();
        match self.exchange(launcher, true).await? {
            TrackerReply::Scrape(message) => {
                debug!(
                    "Scrape {}: {} seeders, {} leechers, {} completed",
                    url, message.seeders, message.leechers, message.completed
                );
                Ok(message)
            }
            TrackerReply::Failure(reason) => Err(TorrentError::tracker_error_full("Tracker rejected scrape", url, reason).into()),
            TrackerReply::Announce(_) => Err(TorrentError::tracker_error_with_tracker("Unexpected announce reply", url).into()),
        }
    }

    /// Announce through every client concurrently and collect distinct peers
    pub async fn find_peers(self: &Arc<Self>, clients: &[Arc<TrackerClient>], request: &AnnounceRequest) -> Vec<SocketAddr> {
        let mut exchanges = JoinSet::new();
        for client in clients.iter().filter(|c| c.is_available()) {
            let launcher = self.launcher(Arc::clone(client), request.clone());
            let manager = Arc::clone(self);
            exchanges.spawn(async move { manager.announce(&launcher).await });
        }
        let mut seen = HashSet::new();
        let mut peers = Vec::new();
        while let Some(joined) = exchanges.join_next().await {
            match joined {
                Ok(Ok(message)) => peers.extend(message.peers.into_iter().filter(|p| seen.insert(*p))),
                Ok(Err(e)) => debug!("Announce failed: {}", e),
                Err(e) => error!("Announce task failed: {}", e),
            }
        }
        peers
    }

    async fn exchange(&self, launcher: &TrackerLauncher, scrape: bool) -> Result<TrackerReply> {
        let client = launcher.client();
        if !client.is_available() {
            return Err(TorrentError::tracker_error_with_tracker("Tracker is disabled", client.announce_url()).into());
        }
        let (sender, receiver) = oneshot::channel();
        self.pending.lock().await.insert(launcher.id(), sender);

        let sent = match (client.kind(), scrape) {
            (TrackerKind::Http, false) => self.http_announce(launcher).await,
            (TrackerKind::Http, true) => self.http_scrape(launcher).await,
            (TrackerKind::Udp { .. }, false) => self.udp_announce(launcher).await,
            (TrackerKind::Udp { .. }, true) => self.udp_scrape(launcher).await,
        };
        if let Err(e) = sent {
            self.pending.lock().await.remove(&launcher.id());
            return Err(e);
        }

        let reply = timeout(self.config.timeout(), receiver).await;
        // The launcher is done either way
        self.pending.lock().await.remove(&launcher.id());
        match reply {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(TorrentError::tracker_error_with_tracker("Exchange abandoned", client.announce_url()).into()),
            Err(_) => Err(TorrentError::tracker_error_with_tracker("No response from tracker", client.announce_url()).into()),
        }
    }

    async fn resolve(&self, id: u32, reply: TrackerReply) -> bool {
        let Some(sender) = self.pending.lock().await.remove(&id) else {
            trace!("No launcher waiting for {}", id);
            return false;
        };
        sender.send(reply).is_ok()
    }

    /// Deliver an announce reply to its launcher
    pub async fn on_announce_message(&self, message: AnnounceMessage) -> bool {
        self.resolve(message.id, TrackerReply::Announce(message)).await
    }

    /// Deliver a scrape reply to its launcher
    pub async fn on_scrape_message(&self, message: ScrapeMessage) -> bool {
        self.resolve(message.id, TrackerReply::Scrape(message)).await
    }

    /// Deliver a tracker-reported failure to its launcher
    pub async fn on_failure_message(&self, id: u32, reason: String) -> bool {
        self.resolve(id, TrackerReply::Failure(reason)).await
    }

    /// Cache a UDP connection id; `client_id` is the connect transaction id
    pub async fn on_connection_id(&self, client_id: u32, connection_id: u64) -> bool {
        let client = self
            .clients
            .read()
            .await
            .iter()
            .find(|c| c.id() == client_id && c.is_udp())
            .cloned();
        match client {
            Some(client) => {
                trace!("Connection id {} for {}", connection_id, client.announce_url());
                client.set_connection_id(connection_id).await;
                true
            }
            None => false,
        }
    }

    async fn http_get(&self, url: &str, tracker: &str) -> Result<bytes::Bytes> {
        let response = self.http.get(url).send().await.map_err(|e| {
            debug!("HTTP tracker request to {} failed: {}", tracker, e);
            TorrentError::tracker_error_full("HTTP tracker request failed", tracker, e.to_string())
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(TorrentError::tracker_error_full("HTTP tracker returned an error status", tracker, status.to_string()).into());
        }
        Ok(response.bytes().await?)
    }

    async fn http_announce(&self, launcher: &TrackerLauncher) -> Result<()> {
        let url = http::announce_url(launcher.announce_url(), launcher.request());
        let body = self.http_get(&url, launcher.announce_url()).await?;
        match http::parse_announce(launcher.id(), &body)? {
            Ok(message) => self.on_announce_message(message).await,
            Err(reason) => self.on_failure_message(launcher.id(), reason).await,
        };
        Ok(())
    }

    async fn http_scrape(&self, launcher: &TrackerLauncher) -> Result<()> {
        let scrape_url = launcher.client().scrape_url().ok_or_else(|| {
            TorrentError::tracker_error_with_tracker("Tracker does not support scrape", launcher.announce_url())
        })?;
        let url = http::scrape_request_url(scrape_url, &launcher.info_hash());
        let body = self.http_get(&url, launcher.announce_url()).await?;
        match http::parse_scrape(launcher.id(), &launcher.info_hash(), &body)? {
            Ok(message) => self.on_scrape_message(message).await,
            Err(reason) => self.on_failure_message(launcher.id(), reason).await,
        };
        Ok(())
    }

    async fn udp_socket(&self) -> Result<Arc<UdpSocket>> {
        let socket = self
            .udp
            .get_or_try_init(|| async {
                let socket = Arc::new(UdpSocket::bind("0.0.0.0:0").await.map_err(|e| {
                    TorrentError::network_error_full("Failed to bind tracker socket", "0.0.0.0:0", e.to_string())
                })?);
                debug!("UDP tracker socket bound to {}", socket.local_addr()?);
                tokio::spawn(udp_receive_loop(self.this.clone(), Arc::clone(&socket)));
                Ok::<_, anyhow::Error>(socket)
            })
            .await?;
        Ok(Arc::clone(socket))
    }

    async fn udp_connection_id(&self, client: &TrackerClient, socket: &UdpSocket, addr: SocketAddr) -> Result<u64> {
        if let Some(id) = client.connection_id().await {
            return Ok(id);
        }
        socket.send_to(&udp::build_connect(client.id()), addr).await?;
        client
            .wait_connected(self.config.timeout())
            .await
            .ok_or_else(|| TorrentError::tracker_error_with_tracker("No connection id from tracker", client.announce_url()).into())
    }

    async fn udp_announce(&self, launcher: &TrackerLauncher) -> Result<()> {
        let client = launcher.client();
        let socket = self.udp_socket().await?;
        let addr = client.socket_addr().await?;
        let connection_id = self.udp_connection_id(client, &socket, addr).await?;
        let packet = udp::build_announce(connection_id, launcher.id(), launcher.request(), rand::random());
        socket.send_to(&packet, addr).await?;
        trace!("Sent UDP announce {} to {}", launcher.id(), addr);
        Ok(())
    }

    async fn udp_scrape(&self, launcher: &TrackerLauncher) -> Result<()> {
        let client = launcher.client();
        let socket = self.udp_socket().await?;
        let addr = client.socket_addr().await?;
        let connection_id = self.udp_connection_id(client, &socket, addr).await?;
        socket
            .send_to(&udp::build_scrape(connection_id, launcher.id(), &launcher.info_hash()), addr)
            .await?;
        Ok(())
    }

    async fn on_udp_datagram(&self, data: &[u8], from: SocketAddr) {
        let response = match udp::decode_response(data) {
            Ok(response) => response,
            Err(e) => {
                debug!("Bad UDP tracker datagram from {}: {}", from, e);
                return;
            }
        };
        let transaction_id = response.transaction_id();
        let delivered = match response {
            UdpResponse::Connect {
                transaction_id,
                connection_id,
            } => self.on_connection_id(transaction_id, connection_id).await,
            UdpResponse::Announce(message) => self.on_announce_message(message).await,
            UdpResponse::Scrape(message) => self.on_scrape_message(message).await,
            UdpResponse::Error { transaction_id, message } => {
                warn!("UDP tracker {} reported: {}", from, message);
                self.on_failure_message(transaction_id, message).await
            }
        };
        if !delivered {
            trace!("Unmatched UDP tracker reply {} from {}", transaction_id, from);
        }
    }
}

async fn udp_receive_loop(manager: Weak<TrackerManager>, socket: Arc<UdpSocket>) {
    let mut buf = vec![0u8; UDP_BUFFER_SIZE];
    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                debug!("UDP tracker receive failed: {}", e);
                continue;
            }
        };
        let Some(manager) = manager.upgrade() else {
            break;
        };
        manager.on_udp_datagram(&buf[..n], from).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::InfoHash;
    use bytes::BufMut;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn config(pool: &[&str]) -> TrackerConfig {
        TrackerConfig {
            timeout_secs: 1,
            default_trackers: pool.iter().map(|s| s.to_string()).collect(),
            ..TrackerConfig::default()
        }
    }

    fn request() -> AnnounceRequest {
        AnnounceRequest::new(InfoHash([3u8; 20]), [4u8; 20], 6881)
    }

    #[tokio::test]
    async fn test_register_returns_existing_client() {
        let manager = TrackerManager::new(config(&[])).unwrap();
        let a = manager.register("http://t.example.com/announce").await.unwrap();
        let b = manager.register(" http://t.example.com/announce ").await.unwrap();
        assert_eq!(a.id(), b.id());
        assert_eq!(manager.client_count().await, 1);
        assert!(manager.register("ftp://t.example.com").await.is_err());
    }

    #[tokio::test]
    async fn test_private_torrent_not_supplemented() {
        let manager = TrackerManager::new(config(&["http://a.example/announce", "http://b.example/announce"])).unwrap();
        let clients = manager
            .clients(Some("http://own.example/announce"), &[], true)
            .await;
        assert_eq!(clients.len(), 1);
    }

    #[tokio::test]
    async fn test_unmatched_messages_ignored() {
        let manager = TrackerManager::new(config(&[])).unwrap();
        assert!(!manager.on_announce_message(AnnounceMessage::default()).await);
        assert!(!manager.on_connection_id(12345, 1).await);
    }

    async fn fake_udp_tracker(peers: Vec<u8>) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            loop {
                let (n, from) = socket.recv_from(&mut buf).await.unwrap();
                let packet = &buf[..n];
                let mut reply = bytes::BytesMut::new();
                if n == udp::CONNECT_LENGTH {
                    reply.put_u32(udp::ACTION_CONNECT);
                    reply.put_slice(&packet[12..16]);
                    reply.put_u64(0xabcdef);
                } else {
                    assert_eq!(&packet[..8], &0xabcdefu64.to_be_bytes());
                    reply.put_u32(udp::ACTION_ANNOUNCE);
                    reply.put_slice(&packet[12..16]);
                    reply.put_u32(900);
                    reply.put_u32(1);
                    reply.put_u32(2);
                    reply.put_slice(&peers);
                }
                socket.send_to(&reply, from).await.unwrap();
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_udp_announce_round_trip() {
        let tracker = fake_udp_tracker(vec![10, 0, 0, 9, 0x1a, 0xe1]).await;
        let manager = TrackerManager::new(config(&[])).unwrap();
        let client = manager
            .register(&format!("udp://{}/announce", tracker))
            .await
            .unwrap();
        let launcher = manager.launcher(Arc::clone(&client), request());
        let message = manager.announce(&launcher).await.unwrap();
        assert_eq!(message.id, launcher.id());
        assert_eq!(message.interval, 900);
        assert_eq!(message.peers, vec!["10.0.0.9:6881".parse().unwrap()]);
        assert_eq!(client.weight(), 1);
        assert_eq!(client.connection_id().await, Some(0xabcdef));
        assert_eq!(manager.pending_count().await, 0);

        // Cached connection id is reused
        let second = manager.launcher(Arc::clone(&client), request());
        assert!(manager.announce(&second).await.is_ok());
        assert_eq!(client.weight(), 2);
    }

    #[tokio::test]
    async fn test_udp_timeout_counts_failure() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let manager = TrackerManager::new(config(&[])).unwrap();
        let client = manager
            .register(&format!("udp://{}/announce", silent.local_addr().unwrap()))
            .await
            .unwrap();
        let launcher = manager.launcher(Arc::clone(&client), request());
        assert!(manager.announce(&launcher).await.is_err());
        assert_eq!(client.weight(), -1);
        assert_eq!(client.failures(), 1);
        assert_eq!(manager.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_http_announce() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let n = stream.read(&mut buf).await.unwrap();
            let head = String::from_utf8_lossy(&buf[..n]).to_string();
            assert!(head.starts_with("GET /announce?info_hash="));
            let body: &[u8] = b"d8:intervali1800e5:peers6:\x0a\x00\x00\x01\x1a\xe1e";
            let response = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n", body.len());
            stream.write_all(response.as_bytes()).await.unwrap();
            stream.write_all(body).await.unwrap();
        });

        let manager = TrackerManager::new(config(&[])).unwrap();
        let client = manager.register(&format!("http://{}/announce", addr)).await.unwrap();
        let launcher = manager.launcher(client, request());
        let message = manager.announce(&launcher).await.unwrap();
        assert_eq!(message.peers, vec!["10.0.0.1:6881".parse().unwrap()]);
    }
}
