//! DHT node module
//!
//! Node identifiers, the per-node session kept by the routing table and the
//! 26-byte compact node encoding.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::{Duration, Instant};

use anyhow::Result;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::TorrentError;
use crate::torrent::InfoHash;

/// Length of one compact node entry: id, IPv4 address, port
pub const COMPACT_NODE_LENGTH: usize = 26;

/// Failed queries after which a node is considered bad
pub const MAX_NODE_FAILURES: u32 = 2;

/// DHT node identifier (20 bytes)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub [u8; 20]);

impl NodeId {
    /// Create a new NodeId from bytes
    pub fn new(id: [u8; 20]) -> Self {
        Self(id)
    }

    /// Generate a random NodeId
    pub fn random() -> Self {
        let mut id = [0u8; 20];
        rand::thread_rng().fill(&mut id);
        Self(id)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let id: [u8; 20] = bytes.try_into().map_err(|_| {
            TorrentError::dht_error(format!("Node id must be 20 bytes, got {}", bytes.len()))
        })?;
        Ok(Self(id))
    }

    /// Get the NodeId as bytes
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Get the NodeId as a hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// XOR distance, comparable lexicographically
    pub fn distance(&self, other: &NodeId) -> [u8; 20] {
        let mut distance = [0u8; 20];
        for (d, (a, b)) in distance.iter_mut().zip(self.0.iter().zip(other.0.iter())) {
            *d = a ^ b;
        }
        distance
    }

    /// Number of leading bits shared with `other`
    pub fn common_prefix_len(&self, other: &NodeId) -> usize {
        let distance = self.distance(other);
        for (i, byte) in distance.iter().enumerate() {
            if *byte != 0 {
                return i * 8 + byte.leading_zeros() as usize;
            }
        }
        160
    }
}

impl From<InfoHash> for NodeId {
    fn from(hash: InfoHash) -> Self {
        Self(hash.0)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.to_hex())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Liveness classification of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    /// Learned from a node list, never contacted
    Unknown,
    /// Responded recently
    Good,
    /// Quiet for too long or missed a query
    Questionable,
    /// Repeatedly failed; first to be replaced
    Bad,
}

/// A node known to the routing table
#[derive(Debug, Clone)]
pub struct NodeSession {
    pub id: NodeId,
    pub addr: SocketAddr,
    pub last_contact: Instant,
    pub status: NodeStatus,
    failures: u32,
}

impl NodeSession {
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            last_contact: Instant::now(),
            status: NodeStatus::Unknown,
            failures: 0,
        }
    }

    /// Node that just talked to us
    pub fn responded(id: NodeId, addr: SocketAddr) -> Self {
        let mut node = Self::new(id, addr);
        node.status = NodeStatus::Good;
        node
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn is_bad(&self) -> bool {
        self.status == NodeStatus::Bad
    }

    pub fn mark_responded(&mut self) {
        self.last_contact = Instant::now();
        self.failures = 0;
        self.status = NodeStatus::Good;
    }

    pub fn mark_failed(&mut self) {
        self.failures += 1;
        self.status = if self.failures >= MAX_NODE_FAILURES {
            NodeStatus::Bad
        } else {
            NodeStatus::Questionable
        };
    }

    /// Demote a good node that has been silent for `quiet`
    pub fn decay(&mut self, quiet: Duration) -> bool {
        if self.status == NodeStatus::Good && self.last_contact.elapsed() >= quiet {
            self.status = NodeStatus::Questionable;
            return true;
        }
        false
    }

    /// Get the time since last contact
    pub fn time_since_contact(&self) -> Duration {
        self.last_contact.elapsed()
    }
}

/// Encode nodes as a compact list; IPv6 nodes are skipped
pub fn encode_compact_nodes<'a>(nodes: impl IntoIterator<Item = &'a NodeSession>) -> Vec<u8> {
    let mut out = Vec::new();
    for node in nodes {
        if let SocketAddr::V4(v4) = node.addr {
            out.extend_from_slice(node.id.as_bytes());
            out.extend_from_slice(&v4.ip().octets());
            out.extend_from_slice(&v4.port().to_be_bytes());
        }
    }
    out
}

/// Decode a compact node list into (id, address) pairs
pub fn decode_compact_nodes(bytes: &[u8]) -> Result<Vec<(NodeId, SocketAddr)>> {
    if bytes.len() % COMPACT_NODE_LENGTH != 0 {
        return Err(TorrentError::dht_error(format!(
            "Compact node list length {} is not a multiple of {}",
            bytes.len(),
            COMPACT_NODE_LENGTH
        ))
        .into());
    }
    bytes
        .chunks_exact(COMPACT_NODE_LENGTH)
        .map(|chunk| {
            let id = NodeId::from_slice(&chunk[..20])?;
            let ip = Ipv4Addr::new(chunk[20], chunk[21], chunk[22], chunk[23]);
            let port = u16::from_be_bytes([chunk[24], chunk[25]]);
            Ok((id, SocketAddr::V4(SocketAddrV4::new(ip, port))))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_random() {
        assert_ne!(NodeId::random(), NodeId::random());
    }

    #[test]
    fn test_node_id_hex_and_slice() {
        let id = NodeId::new([0xABu8; 20]);
        assert_eq!(id.to_hex(), "ab".repeat(20));
        assert_eq!(NodeId::from_slice(&[0xAB; 20]).unwrap(), id);
        assert!(NodeId::from_slice(&[0; 19]).is_err());
    }

    #[test]
    fn test_distance_and_prefix() {
        let a = NodeId::new([0xFFu8; 20]);
        let b = NodeId::new([0x00u8; 20]);
        assert_eq!(a.distance(&b), [0xFFu8; 20]);
        assert_eq!(a.common_prefix_len(&b), 0);
        assert_eq!(a.common_prefix_len(&a), 160);
        let mut c = [0u8; 20];
        c[1] = 0x01;
        assert_eq!(b.common_prefix_len(&NodeId(c)), 15);
    }

    #[test]
    fn test_status_transitions() {
        let mut node = NodeSession::new(NodeId::random(), "127.0.0.1:6881".parse().unwrap());
        assert_eq!(node.status, NodeStatus::Unknown);
        node.mark_responded();
        assert_eq!(node.status, NodeStatus::Good);
        assert!(node.decay(Duration::ZERO));
        assert_eq!(node.status, NodeStatus::Questionable);
        node.mark_failed();
        node.mark_failed();
        assert!(node.is_bad());
        node.mark_responded();
        assert_eq!(node.failures(), 0);
        assert!(!node.decay(Duration::from_secs(60)));
    }

    #[test]
    fn test_compact_nodes() {
        let nodes = vec![
            NodeSession::new(NodeId::new([1u8; 20]), "10.0.0.1:6881".parse().unwrap()),
            NodeSession::new(NodeId::new([2u8; 20]), "[::1]:6881".parse().unwrap()),
        ];
        let bytes = encode_compact_nodes(&nodes);
        assert_eq!(bytes.len(), COMPACT_NODE_LENGTH);
        let decoded = decode_compact_nodes(&bytes).unwrap();
        assert_eq!(decoded, vec![(NodeId::new([1u8; 20]), "10.0.0.1:6881".parse().unwrap())]);
        assert!(decode_compact_nodes(&bytes[..25]).is_err());
    }
}
