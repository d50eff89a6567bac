//! Long-lived per-announce-URL tracker client
//!
//! Holds the bookkeeping the manager uses to rank clients: weight goes up
//! on every success and down on every failure, and a client is disabled
//! after too many consecutive failures.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::net::lookup_host;
use tokio::sync::{Mutex, Notify, OnceCell};
use tracing::{debug, warn};
use url::Url;

use crate::error::TorrentError;
use crate::tracker::http;

/// UDP connection ids are valid for about a minute
pub const CONNECTION_ID_LIFETIME: Duration = Duration::from_secs(60);

/// Transport variant, picked from the URL scheme
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerKind {
    Http,
    /// `host:port` of the tracker
    Udp { host: String },
}

#[derive(Debug)]
pub struct TrackerClient {
    id: u32,
    announce_url: String,
    scrape_url: Option<String>,
    kind: TrackerKind,
    weight: AtomicI64,
    failures: AtomicU32,
    available: AtomicBool,
    max_failures: u32,
    resolved: OnceCell<SocketAddr>,
    connection: Mutex<Option<(u64, Instant)>>,
    connected: Notify,
}

impl TrackerClient {
    /// Build a client for `announce_url`; only http(s) and udp are accepted
    pub fn new(id: u32, announce_url: &str, max_failures: u32) -> Result<Self> {
        let parsed = Url::parse(announce_url).map_err(|e| {
            TorrentError::tracker_error_full("Invalid announce URL", announce_url, e.to_string())
        })?;
        let kind = match parsed.scheme() {
            "http" | "https" => TrackerKind::Http,
            "udp" => {
                let host = parsed
                    .host_str()
                    .ok_or_else(|| TorrentError::tracker_error_with_tracker("Announce URL has no host", announce_url))?;
                let port = parsed.port().unwrap_or(80);
                TrackerKind::Udp {
                    host: format!("{}:{}", host, port),
                }
            }
            other => {
                return Err(TorrentError::tracker_error_with_tracker(
                    format!("Unsupported tracker protocol: {}", other),
                    announce_url,
                )
                .into())
            }
        };
        let scrape_url = match kind {
            TrackerKind::Http => http::scrape_url(announce_url),
            TrackerKind::Udp { .. } => Some(announce_url.to_string()),
        };

        Ok(Self {
            id,
            announce_url: announce_url.to_string(),
            scrape_url,
            kind,
            weight: AtomicI64::new(0),
            failures: AtomicU32::new(0),
            available: AtomicBool::new(true),
            max_failures,
            resolved: OnceCell::new(),
            connection: Mutex::new(None),
            connected: Notify::new(),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn announce_url(&self) -> &str {
        &self.announce_url
    }

    pub fn scrape_url(&self) -> Option<&str> {
        self.scrape_url.as_deref()
    }

    pub fn kind(&self) -> &TrackerKind {
        &self.kind
    }

    pub fn is_udp(&self) -> bool {
        matches!(self.kind, TrackerKind::Udp { .. })
    }

    pub fn weight(&self) -> i64 {
        self.weight.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    pub fn record_success(&self) {
        self.weight.fetch_add(1, Ordering::Relaxed);
        self.failures.store(0, Ordering::Relaxed);
    }

    pub fn record_failure(&self, reason: &str) {
        self.weight.fetch_sub(1, Ordering::Relaxed);
        let failures = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= self.max_failures {
            self.available.store(false, Ordering::Relaxed);
            warn!(
                "Disabling tracker {} after {} failures: {}",
                self.announce_url, failures, reason
            );
        } else {
            debug!("Tracker {} failed ({}): {}", self.announce_url, failures, reason);
        }
    }

    /// Socket address of a UDP tracker, resolved once
    pub async fn socket_addr(&self) -> Result<SocketAddr> {
        let TrackerKind::Udp { host } = &self.kind else {
            return Err(TorrentError::tracker_error_with_tracker("Not a UDP tracker", &self.announce_url).into());
        };
        let addr = self
            .resolved
            .get_or_try_init(|| async {
                lookup_host(host.as_str())
                    .await
                    .map_err(|e| TorrentError::tracker_error_full("Failed to resolve tracker", host.as_str(), e.to_string()))?
                    .find(|a| a.is_ipv4())
                    .ok_or_else(|| TorrentError::tracker_error_with_tracker("Tracker has no IPv4 address", host.as_str()))
            })
            .await?;
        Ok(*addr)
    }

    /// Cached connection id if still fresh
    pub async fn connection_id(&self) -> Option<u64> {
        match *self.connection.lock().await {
            Some((id, at)) if at.elapsed() < CONNECTION_ID_LIFETIME => Some(id),
            _ => None,
        }
    }

    pub async fn set_connection_id(&self, connection_id: u64) {
        *self.connection.lock().await = Some((connection_id, Instant::now()));
        self.connected.notify_waiters();
    }

    pub async fn clear_connection_id(&self) {
        *self.connection.lock().await = None;
    }

    /// Wait until a connect reply stores a connection id
    pub async fn wait_connected(&self, timeout: Duration) -> Option<u64> {
        let notified = self.connected.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if let Some(id) = self.connection_id().await {
            return Some(id);
        }
        let _ = tokio::time::timeout(timeout, notified).await;
        self.connection_id().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_scheme() {
        let http = TrackerClient::new(1, "http://t.example.com/announce", 3).unwrap();
        assert_eq!(http.kind(), &TrackerKind::Http);
        assert_eq!(http.scrape_url(), Some("http://t.example.com/scrape"));

        let udp = TrackerClient::new(2, "udp://t.example.com:1337/announce", 3).unwrap();
        assert_eq!(
            udp.kind(),
            &TrackerKind::Udp {
                host: "t.example.com:1337".to_string()
            }
        );
        assert!(TrackerClient::new(3, "wss://t.example.com", 3).is_err());
        assert!(TrackerClient::new(4, "not a url", 3).is_err());
    }

    #[test]
    fn test_weight_and_disable() {
        let client = TrackerClient::new(1, "http://t.example.com/announce", 3).unwrap();
        client.record_success();
        client.record_success();
        assert_eq!(client.weight(), 2);
        client.record_failure("timeout");
        client.record_failure("timeout");
        assert!(client.is_available());
        client.record_failure("timeout");
        assert!(!client.is_available());
        assert_eq!(client.weight(), -1);
    }

    #[tokio::test]
    async fn test_connection_id_cache() {
        let client = TrackerClient::new(1, "udp://127.0.0.1:6969/announce", 3).unwrap();
        assert_eq!(client.connection_id().await, None);
        client.set_connection_id(99).await;
        assert_eq!(client.wait_connected(Duration::from_millis(10)).await, Some(99));
        client.clear_connection_id().await;
        assert_eq!(client.wait_connected(Duration::from_millis(10)).await, None);
        assert_eq!(client.socket_addr().await.unwrap(), "127.0.0.1:6969".parse().unwrap());
    }
}
