//! BitTorrent handshake
//!
//! The fixed 68-byte opening exchanged by peers. Always plaintext in form;
//! when MSE is in use it travels inside the encrypted stream.

use bytes::{BufMut, BytesMut};
use anyhow::Result;
use tracing::{debug, error, info, trace, warn};

use crate::error::TorrentError;
use crate::torrent::InfoHash;

/// BitTorrent protocol identifier string
pub const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// Length of the protocol string
pub const PROTOCOL_LENGTH: u8 = 19;

/// Total handshake length on the wire
pub const HANDSHAKE_LENGTH: usize = 68;

/// Reserved bit for the extension protocol (BEP 10), byte 5
const EXTENSION_PROTOCOL_BIT: u8 = 0x10;
/// Reserved bit for DHT support (BEP 5), byte 7
const DHT_BIT: u8 = 0x01;

/// Peer handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Reserved bytes carrying extension flags
    pub reserved: [u8; 8],
    pub info_hash: InfoHash,
    pub peer_id: [u8; 20],
}

impl Handshake {
    /// Handshake without any extension flags
    pub fn new(info_hash: impl Into<InfoHash>, peer_id: [u8; 20]) -> Self {
        Self {
            reserved: [0u8; 8],
            info_hash: info_hash.into(),
            peer_id,
        }
    }

    /// Handshake advertising the extension protocol and, optionally, DHT
    pub fn with_extensions(info_hash: impl Into<InfoHash>, peer_id: [u8; 20], dht: bool) -> Self {
        let mut handshake = Self::new(info_hash, peer_id);
        handshake.reserved[5] |= EXTENSION_PROTOCOL_BIT;
        if dht {
            handshake.reserved[7] |= DHT_BIT;
        }
        debug!("Handshake reserved bytes: {}", hex::encode(handshake.reserved));
        handshake
    }

    pub fn supports_extensions(&self) -> bool {
        self.reserved[5] & EXTENSION_PROTOCOL_BIT != 0
    }

    pub fn supports_dht(&self) -> bool {
        self.reserved[7] & DHT_BIT != 0
    }

    /// Random Azureus-style peer id with a `-RT0100-` prefix
    pub fn generate_peer_id() -> [u8; 20] {
        let mut peer_id = [0u8; 20];
        peer_id[..8].copy_from_slice(b"-RT0100-");
        peer_id[8..].copy_from_slice(&rand::random::<[u8; 12]>());
        info!("Generated peer ID: {}", hex::encode(peer_id));
        peer_id
    }

    /// Serialize the handshake to bytes
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LENGTH);
        buf.put_u8(PROTOCOL_LENGTH);
        buf.put_slice(PROTOCOL_STRING.as_bytes());
        buf.put_slice(&self.reserved);
        buf.put_slice(self.info_hash.as_bytes());
        buf.put_slice(&self.peer_id);
        trace!("Handshake serialized: {} bytes", buf.len());
        buf.to_vec()
    }

    /// Deserialize a handshake from exactly 68 bytes
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() != HANDSHAKE_LENGTH {
            error!("Handshake has wrong length: expected {}, got {}", HANDSHAKE_LENGTH, data.len());
            return Err(TorrentError::protocol_error_with_source(
                "Handshake has wrong length",
                format!("expected {}, got {}", HANDSHAKE_LENGTH, data.len()),
            )
            .into());
        }

        if data[0] != PROTOCOL_LENGTH || &data[1..20] != PROTOCOL_STRING.as_bytes() {
            error!("Invalid protocol header: {}", hex::encode(&data[..20]));
            return Err(TorrentError::protocol_error("Invalid protocol string").into());
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[20..28]);
        let info_hash = InfoHash::from_slice(&data[28..48])?;
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);

        debug!(
            "Handshake from peer {} for {} (reserved {})",
            hex::encode(peer_id),
            info_hash,
            hex::encode(reserved)
        );
        Ok(Self {
            reserved,
            info_hash,
            peer_id,
        })
    }

    /// Check the handshake is for the expected torrent
    pub fn validate(&self, expected_info_hash: &InfoHash) -> bool {
        if self.info_hash != *expected_info_hash {
            warn!(
                "Handshake info hash mismatch: expected {}, got {}",
                expected_info_hash, self.info_hash
            );
            return false;
        }
        true
    }
}
