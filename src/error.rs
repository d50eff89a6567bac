//! Error types for the torrent engine
//!
//! One error enum covers every subsystem; [`TorrentError::kind`] maps each
//! variant onto the recovery policy the engine applies to it.

use std::fmt;

use crate::bencode::BencodeError;

/// How a failure should be handled by the layer that catches it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed data from a remote; fatal to that connection, never retried
    ProtocolViolation,
    /// Timeouts and refused connections; surfaced as "no result"
    Transient,
    /// Piece hash mismatch; piece is discarded and re-requested
    Verification,
    /// Request refused by policy (bad token, disallowed crypto)
    PolicyRejection,
    /// Local problems: disk, configuration, invalid arguments
    Local,
}

/// Comprehensive error type for torrent operations
#[derive(Debug, Clone)]
pub enum TorrentError {
    /// Bencode or metainfo parsing errors
    ParseError {
        message: String,
        source: Option<String>,
    },

    /// BitTorrent wire protocol violations
    ProtocolError {
        message: String,
        source: Option<String>,
    },

    /// Peer connection errors
    PeerError {
        message: String,
        peer: Option<String>,
        source: Option<String>,
    },

    /// File I/O and storage errors
    StorageError {
        message: String,
        path: Option<String>,
        source: Option<String>,
    },

    /// Piece failed its SHA-1 check
    VerificationError {
        message: String,
        piece: u32,
    },

    /// DHT (Distributed Hash Table) errors
    DHTError {
        message: String,
        node: Option<String>,
        source: Option<String>,
    },

    /// Tracker exchange errors
    TrackerError {
        message: String,
        tracker: Option<String>,
        source: Option<String>,
    },

    /// Rejected by local or remote policy
    PolicyError {
        message: String,
        source: Option<String>,
    },

    /// Configuration errors
    ConfigError {
        message: String,
        field: Option<String>,
    },

    /// Network errors
    NetworkError {
        message: String,
        address: Option<String>,
        source: Option<String>,
    },

    /// Validation errors
    ValidationError {
        message: String,
        field: Option<String>,
    },
}

impl TorrentError {
    /// Create a new ParseError
    pub fn parse_error(message: impl Into<String>) -> Self {
        TorrentError::ParseError {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new ParseError with source
    pub fn parse_error_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::ParseError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a new ProtocolError
    pub fn protocol_error(message: impl Into<String>) -> Self {
        TorrentError::ProtocolError {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new ProtocolError with source
    pub fn protocol_error_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::ProtocolError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a new PeerError
    pub fn peer_error(message: impl Into<String>) -> Self {
        TorrentError::PeerError {
            message: message.into(),
            peer: None,
            source: None,
        }
    }

    /// Create a new PeerError with peer address
    pub fn peer_error_with_peer(message: impl Into<String>, peer: impl Into<String>) -> Self {
        TorrentError::PeerError {
            message: message.into(),
            peer: Some(peer.into()),
            source: None,
        }
    }

    /// Create a new PeerError with peer and source
    pub fn peer_error_full(message: impl Into<String>, peer: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::PeerError {
            message: message.into(),
            peer: Some(peer.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new StorageError
    pub fn storage_error(message: impl Into<String>) -> Self {
        TorrentError::StorageError {
            message: message.into(),
            path: None,
            source: None,
        }
    }

    /// Create a new StorageError with path
    pub fn storage_error_with_path(message: impl Into<String>, path: impl Into<String>) -> Self {
        TorrentError::StorageError {
            message: message.into(),
            path: Some(path.into()),
            source: None,
        }
    }

    /// Create a new StorageError with path and source
    pub fn storage_error_full(message: impl Into<String>, path: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::StorageError {
            message: message.into(),
            path: Some(path.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new VerificationError for a piece
    pub fn verification_error(message: impl Into<String>, piece: u32) -> Self {
        TorrentError::VerificationError {
            message: message.into(),
            piece,
        }
    }

    /// Create a new DHTError
    pub fn dht_error(message: impl Into<String>) -> Self {
        TorrentError::DHTError {
            message: message.into(),
            node: None,
            source: None,
        }
    }

    /// Create a new DHTError with node
    pub fn dht_error_with_node(message: impl Into<String>, node: impl Into<String>) -> Self {
        TorrentError::DHTError {
            message: message.into(),
            node: Some(node.into()),
            source: None,
        }
    }

    /// Create a new DHTError with node and source
    pub fn dht_error_full(message: impl Into<String>, node: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::DHTError {
            message: message.into(),
            node: Some(node.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new TrackerError with tracker URL
    pub fn tracker_error_with_tracker(message: impl Into<String>, tracker: impl Into<String>) -> Self {
        TorrentError::TrackerError {
            message: message.into(),
            tracker: Some(tracker.into()),
            source: None,
        }
    }

    /// Create a new TrackerError with tracker URL and source
    pub fn tracker_error_full(message: impl Into<String>, tracker: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::TrackerError {
            message: message.into(),
            tracker: Some(tracker.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new PolicyError
    pub fn policy_error(message: impl Into<String>) -> Self {
        TorrentError::PolicyError {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new PolicyError with source
    pub fn policy_error_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::PolicyError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a new ConfigError
    pub fn config_error(message: impl Into<String>) -> Self {
        TorrentError::ConfigError {
            message: message.into(),
            field: None,
        }
    }

    /// Create a new ConfigError with field
    pub fn config_error_with_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        TorrentError::ConfigError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a new NetworkError
    pub fn network_error(message: impl Into<String>) -> Self {
        TorrentError::NetworkError {
            message: message.into(),
            address: None,
            source: None,
        }
    }

    /// Create a new NetworkError with address
    pub fn network_error_with_address(message: impl Into<String>, address: impl Into<String>) -> Self {
        TorrentError::NetworkError {
            message: message.into(),
            address: Some(address.into()),
            source: None,
        }
    }

    /// Create a new NetworkError with address and source
    pub fn network_error_full(message: impl Into<String>, address: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::NetworkError {
            message: message.into(),
            address: Some(address.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new ValidationError with field
    pub fn validation_error_with_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        TorrentError::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Recovery class of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            TorrentError::ParseError { .. } | TorrentError::ProtocolError { .. } => {
                ErrorKind::ProtocolViolation
            }
            TorrentError::PeerError { .. }
            | TorrentError::DHTError { .. }
            | TorrentError::TrackerError { .. }
            | TorrentError::NetworkError { .. } => ErrorKind::Transient,
            TorrentError::VerificationError { .. } => ErrorKind::Verification,
            TorrentError::PolicyError { .. } => ErrorKind::PolicyRejection,
            TorrentError::StorageError { .. }
            | TorrentError::ConfigError { .. }
            | TorrentError::ValidationError { .. } => ErrorKind::Local,
        }
    }

    /// Classify an `anyhow` error; errors that did not originate here are transient
    pub fn kind_of(err: &anyhow::Error) -> ErrorKind {
        err.downcast_ref::<TorrentError>()
            .map(TorrentError::kind)
            .unwrap_or(ErrorKind::Transient)
    }

    /// Add context to the error
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        let ctx = context.into();
        match &mut self {
            TorrentError::ParseError { source, .. }
            | TorrentError::ProtocolError { source, .. }
            | TorrentError::PeerError { source, .. }
            | TorrentError::StorageError { source, .. }
            | TorrentError::DHTError { source, .. }
            | TorrentError::TrackerError { source, .. }
            | TorrentError::PolicyError { source, .. }
            | TorrentError::NetworkError { source, .. } => {
                *source = Some(source.as_ref().map_or_else(|| ctx.clone(), |s| format!("{}: {}", s, ctx)));
            }
            _ => {}
        }
        self
    }
}

fn write_with(f: &mut fmt::Formatter<'_>, label: &str, message: &str, parts: &[(&str, &Option<String>)]) -> fmt::Result {
    write!(f, "{}: {}", label, message)?;
    let present: Vec<String> = parts
        .iter()
        .filter_map(|(name, value)| value.as_ref().map(|v| format!("{}: {}", name, v)))
        .collect();
    if !present.is_empty() {
        write!(f, " ({})", present.join(", "))?;
    }
    Ok(())
}

impl fmt::Display for TorrentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TorrentError::ParseError { message, source } => {
                write_with(f, "Parse error", message, &[("source", source)])
            }
            TorrentError::ProtocolError { message, source } => {
                write_with(f, "Protocol error", message, &[("source", source)])
            }
            TorrentError::PeerError { message, peer, source } => {
                write_with(f, "Peer error", message, &[("peer", peer), ("source", source)])
            }
            TorrentError::StorageError { message, path, source } => {
                write_with(f, "Storage error", message, &[("path", path), ("source", source)])
            }
            TorrentError::VerificationError { message, piece } => {
                write!(f, "Verification error: {} (piece: {})", message, piece)
            }
            TorrentError::DHTError { message, node, source } => {
                write_with(f, "DHT error", message, &[("node", node), ("source", source)])
            }
            TorrentError::TrackerError { message, tracker, source } => {
                write_with(f, "Tracker error", message, &[("tracker", tracker), ("source", source)])
            }
            TorrentError::PolicyError { message, source } => {
                write_with(f, "Policy error", message, &[("source", source)])
            }
            TorrentError::ConfigError { message, field } => {
                write_with(f, "Config error", message, &[("field", field)])
            }
            TorrentError::NetworkError { message, address, source } => {
                write_with(f, "Network error", message, &[("address", address), ("source", source)])
            }
            TorrentError::ValidationError { message, field } => {
                write_with(f, "Validation error", message, &[("field", field)])
            }
        }
    }
}

impl std::error::Error for TorrentError {}

// Implement From traits for common error types

impl From<std::io::Error> for TorrentError {
    fn from(err: std::io::Error) -> Self {
        TorrentError::storage_error_full(err.to_string(), "unknown".to_string(), err.kind().to_string())
    }
}

impl From<BencodeError> for TorrentError {
    fn from(err: BencodeError) -> Self {
        TorrentError::parse_error_with_source("Invalid bencode", err.to_string())
    }
}

// Note: serde_bencode::Error is the public type, not de::Error or ser::Error
impl From<serde_bencode::Error> for TorrentError {
    fn from(err: serde_bencode::Error) -> Self {
        TorrentError::parse_error_with_source("Failed to parse bencode data", err.to_string())
    }
}

impl From<serde_json::Error> for TorrentError {
    fn from(err: serde_json::Error) -> Self {
        TorrentError::config_error(format!("Failed to parse JSON configuration: {}", err))
    }
}

impl From<std::net::AddrParseError> for TorrentError {
    fn from(err: std::net::AddrParseError) -> Self {
        TorrentError::network_error_full("Failed to parse address", "unknown".to_string(), err.to_string())
    }
}

impl From<url::ParseError> for TorrentError {
    fn from(err: url::ParseError) -> Self {
        TorrentError::validation_error_with_field(format!("Invalid URL: {}", err), "url")
    }
}

impl From<reqwest::Error> for TorrentError {
    fn from(err: reqwest::Error) -> Self {
        let tracker = err.url().map(|u| u.to_string()).unwrap_or_else(|| "unknown".to_string());
        TorrentError::tracker_error_full("HTTP request failed", tracker, err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for TorrentError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        TorrentError::network_error("Operation timed out")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error() {
        let err = TorrentError::parse_error("Invalid torrent file");
        assert_eq!(err.to_string(), "Parse error: Invalid torrent file");
    }

    #[test]
    fn test_parse_error_with_source() {
        let err = TorrentError::parse_error_with_source("Invalid torrent file", "bencode error");
        assert_eq!(err.to_string(), "Parse error: Invalid torrent file (source: bencode error)");
    }

    #[test]
    fn test_peer_error_full() {
        let err = TorrentError::peer_error_full("Connection failed", "127.0.0.1:6881", "refused");
        assert_eq!(
            err.to_string(),
            "Peer error: Connection failed (peer: 127.0.0.1:6881, source: refused)"
        );
    }

    #[test]
    fn test_storage_error_with_path() {
        let err = TorrentError::storage_error_with_path("File not found", "/path/to/file");
        assert!(err.to_string().contains("Storage error"));
        assert!(err.to_string().contains("/path/to/file"));
    }

    #[test]
    fn test_with_context() {
        let err = TorrentError::parse_error("Invalid data").with_context("while parsing torrent");
        assert!(err.to_string().contains("while parsing torrent"));
    }

    #[test]
    fn test_kind_mapping() {
        assert_eq!(TorrentError::protocol_error("x").kind(), ErrorKind::ProtocolViolation);
        assert_eq!(TorrentError::dht_error("x").kind(), ErrorKind::Transient);
        assert_eq!(TorrentError::verification_error("x", 3).kind(), ErrorKind::Verification);
        assert_eq!(TorrentError::policy_error("x").kind(), ErrorKind::PolicyRejection);
        assert_eq!(TorrentError::config_error("x").kind(), ErrorKind::Local);
        assert_eq!(TorrentError::parse_error("x").kind(), ErrorKind::ProtocolViolation);
        assert_eq!(TorrentError::network_error("x").kind(), ErrorKind::Transient);
    }

    #[test]
    fn test_kind_of_anyhow() {
        let err: anyhow::Error = TorrentError::protocol_error("bad length").into();
        assert_eq!(TorrentError::kind_of(&err), ErrorKind::ProtocolViolation);

        let other = anyhow::anyhow!("plain");
        assert_eq!(TorrentError::kind_of(&other), ErrorKind::Transient);
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "File not found");
        let err: TorrentError = io_err.into();
        assert!(matches!(err, TorrentError::StorageError { .. }));
    }

    #[test]
    fn test_from_bencode_error() {
        let err: TorrentError = BencodeError::UnexpectedEof.into();
        assert!(matches!(err, TorrentError::ParseError { .. }));
    }

    #[test]
    fn test_from_addr_parse_error() {
        let addr_err = "invalid:address".parse::<std::net::SocketAddr>().unwrap_err();
        let err: TorrentError = addr_err.into();
        assert!(matches!(err, TorrentError::NetworkError { .. }));
    }

    #[test]
    fn test_config_error_with_field() {
        let err = TorrentError::config_error_with_field("Invalid value", "max_connections");
        assert_eq!(err.to_string(), "Config error: Invalid value (field: max_connections)");
    }
}
