//! Engine configuration
//!
//! Plain structs grouped per subsystem. Defaults carry the protocol
//! constants; a JSON file and the command line can override them.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::cli::args::DownloadArgs;
use crate::error::TorrentError;
use crate::protocol::{CryptoPolicy, MAX_MESSAGE_LENGTH};
use crate::storage::DEFAULT_RECONCILE_PREFIX;

/// DHT settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DhtConfig {
    pub enabled: bool,
    /// UDP port of the DHT node
    pub port: u16,
    pub request_timeout_secs: u64,
    /// A token stays valid for two rotation periods
    pub token_rotation_secs: u64,
    pub table_capacity: usize,
    pub bucket_size: usize,
    /// Good nodes silent for this long become questionable
    pub quiet_interval_secs: u64,
    pub maintenance_interval_secs: u64,
    /// Parallel queries per lookup round
    pub lookup_alpha: usize,
    /// Ask remote nodes to use our UDP source port when announcing
    pub implied_port: bool,
    pub bootstrap_nodes: Vec<String>,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 6881,
            request_timeout_secs: 5,
            token_rotation_secs: 5 * 60,
            table_capacity: 1024,
            bucket_size: 8,
            quiet_interval_secs: 15 * 60,
            maintenance_interval_secs: 60,
            lookup_alpha: 3,
            implied_port: false,
            bootstrap_nodes: vec![
                "router.bittorrent.com:6881".to_string(),
                "dht.transmissionbt.com:6881".to_string(),
                "router.utorrent.com:6881".to_string(),
            ],
        }
    }
}

impl DhtConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn token_rotation(&self) -> Duration {
        Duration::from_secs(self.token_rotation_secs)
    }

    pub fn quiet_interval(&self) -> Duration {
        Duration::from_secs(self.quiet_interval_secs)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }
}

/// Peer connection settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    pub max_connections: usize,
    pub crypto: CryptoPolicy,
    pub handshake_timeout_secs: u64,
    pub max_message_length: usize,
    /// Outstanding block requests per peer
    pub pipeline_depth: usize,
    pub request_timeout_secs: u64,
    pub keep_alive_secs: u64,
    pub lsd_enabled: bool,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            max_connections: 50,
            crypto: CryptoPolicy::default(),
            handshake_timeout_secs: 5,
            max_message_length: MAX_MESSAGE_LENGTH,
            pipeline_depth: 8,
            request_timeout_secs: 30,
            keep_alive_secs: 120,
            lsd_enabled: true,
        }
    }
}

impl PeerConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }
}

/// Tracker settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub enabled: bool,
    pub timeout_secs: u64,
    /// A client is disabled after this many consecutive failures
    pub max_failures: u32,
    /// Torrents declaring fewer trackers get supplemented from the pool
    pub min_trackers: usize,
    /// Supplemental tracker pool
    pub default_trackers: Vec<String>,
    pub numwant: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_secs: 4,
            max_failures: 3,
            min_trackers: 3,
            default_trackers: Vec::new(),
            numwant: 50,
        }
    }
}

impl TrackerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Storage settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub output_dir: PathBuf,
    /// Bytes inspected per piece at startup
    pub reconcile_prefix: usize,
    /// File indices to download; empty means all
    pub selected_files: Vec<usize>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./downloads"),
            reconcile_prefix: DEFAULT_RECONCILE_PREFIX,
            selected_files: Vec::new(),
        }
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// TCP port for incoming peers
    pub listen_port: u16,
    pub dht: DhtConfig,
    pub peer: PeerConfig,
    pub tracker: TrackerConfig,
    pub storage: StorageConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: 6881,
            dht: DhtConfig::default(),
            peer: PeerConfig::default(),
            tracker: TrackerConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl Config {
    /// Load a JSON configuration file; missing fields take defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            error!("Failed to read config file {}: {}", path.display(), e);
            TorrentError::config_error_with_field(format!("Cannot read config file: {}", e), "config")
        })?;
        let config: Config = serde_json::from_str(&text)?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Start from `base` (file or defaults) and apply command-line overrides
    pub fn from_args(args: &DownloadArgs, base: Option<Config>) -> Self {
        let mut config = base.unwrap_or_default();
        if let Some(port) = args.port {
            config.listen_port = port;
        }
        if let Some(port) = args.dht_port {
            config.dht.port = port;
        }
        if let Some(dir) = &args.output_dir {
            config.storage.output_dir = dir.clone();
        }
        if let Some(policy) = args.crypto {
            config.peer.crypto = policy;
        }
        if args.no_dht {
            config.dht.enabled = false;
        }
        if args.no_lsd {
            config.peer.lsd_enabled = false;
        }
        if let Some(min) = args.min_trackers {
            config.tracker.min_trackers = min;
        }
        if !args.tracker.is_empty() {
            config.tracker.default_trackers = args.tracker.clone();
        }
        if !args.select.is_empty() {
            config.storage.selected_files = args.select.clone();
        }
        if let Some(max) = args.max_connections {
            config.peer.max_connections = max;
        }
        config
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.listen_port == 0 {
            return Err(TorrentError::config_error_with_field("Port cannot be 0", "listen_port").into());
        }
        if self.dht.enabled && self.dht.port == 0 {
            return Err(TorrentError::config_error_with_field("Port cannot be 0", "dht.port").into());
        }
        if self.peer.max_connections == 0 {
            return Err(TorrentError::config_error_with_field(
                "max_connections must be at least 1",
                "peer.max_connections",
            )
            .into());
        }
        if self.peer.pipeline_depth == 0 {
            return Err(TorrentError::config_error_with_field(
                "pipeline_depth must be at least 1",
                "peer.pipeline_depth",
            )
            .into());
        }
        if self.peer.max_message_length < 16 * 1024 + 13 {
            return Err(TorrentError::config_error_with_field(
                "max_message_length cannot hold a block",
                "peer.max_message_length",
            )
            .into());
        }
        if self.dht.bucket_size == 0 || self.dht.table_capacity < self.dht.bucket_size {
            return Err(TorrentError::config_error_with_field(
                "table_capacity must hold at least one bucket",
                "dht.table_capacity",
            )
            .into());
        }
        if self.dht.lookup_alpha == 0 {
            return Err(TorrentError::config_error_with_field("lookup_alpha must be at least 1", "dht.lookup_alpha").into());
        }
        if self.tracker.timeout_secs == 0 {
            return Err(TorrentError::config_error_with_field("timeout must be positive", "tracker.timeout_secs").into());
        }
        if self.storage.output_dir.as_os_str().is_empty() {
            return Err(TorrentError::config_error_with_field("output_dir cannot be empty", "storage.output_dir").into());
        }
        Ok(())
    }

    /// Get the listen address for incoming connections
    pub fn listen_addr(&self) -> String {
        format!("0.0.0.0:{}", self.listen_port)
    }

    pub fn dht_addr(&self) -> String {
        format!("0.0.0.0:{}", self.dht.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn download_args() -> DownloadArgs {
        DownloadArgs {
            source: "test.torrent".to_string(),
            output_dir: Some(PathBuf::from("/tmp/downloads")),
            port: Some(6882),
            dht_port: None,
            crypto: Some(CryptoPolicy::Encrypt),
            no_dht: true,
            no_lsd: false,
            min_trackers: Some(5),
            tracker: vec!["udp://tracker.example.com:80/announce".to_string()],
            select: vec![0, 2],
            max_connections: None,
        }
    }

    #[test]
    fn test_defaults_carry_protocol_constants() {
        let config = Config::default();
        assert_eq!(config.dht.request_timeout(), Duration::from_secs(5));
        assert_eq!(config.dht.table_capacity, 1024);
        assert_eq!(config.dht.bucket_size, 8);
        assert_eq!(config.tracker.timeout(), Duration::from_secs(4));
        assert_eq!(config.tracker.max_failures, 3);
        assert_eq!(config.tracker.min_trackers, 3);
        assert_eq!(config.peer.max_message_length, 1024 * 1024 + 13);
        assert_eq!(config.storage.reconcile_prefix, 16);
    }

    #[test]
    fn test_config_from_args() {
        let config = Config::from_args(&download_args(), None);
        assert_eq!(config.listen_port, 6882);
        assert_eq!(config.storage.output_dir, PathBuf::from("/tmp/downloads"));
        assert_eq!(config.peer.crypto, CryptoPolicy::Encrypt);
        assert!(!config.dht.enabled);
        assert!(config.peer.lsd_enabled);
        assert_eq!(config.tracker.min_trackers, 5);
        assert_eq!(config.tracker.default_trackers.len(), 1);
        assert_eq!(config.storage.selected_files, vec![0, 2]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"dht": {"port": 7000, "implied_port": true}, "peer": {"crypto": "prefer-plaintext"}}"#,
        )
        .unwrap();
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.dht.port, 7000);
        assert!(config.dht.implied_port);
        assert_eq!(config.dht.bucket_size, 8);
        assert_eq!(config.peer.crypto, CryptoPolicy::PreferPlaintext);
        assert_eq!(config.listen_port, 6881);

        std::fs::write(&path, "{not json").unwrap();
        assert!(Config::from_file(&path).is_err());
    }

    #[test]
    fn test_validate_names_field() {
        let mut config = Config::default();
        config.peer.max_connections = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_connections"));

        let config = Config { listen_port: 0, ..Config::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_get_listen_addr() {
        let config = Config::default();
        assert_eq!(config.listen_addr(), "0.0.0.0:6881");
    }
}
