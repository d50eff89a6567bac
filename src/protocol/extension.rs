//! Extension protocol (BEP 10)
//!
//! The extended handshake negotiates per-connection ids for sub-protocols.
//! Two are implemented: `ut_metadata` (BEP 9) to fetch the info dictionary
//! in 16 KiB slices, and `ut_pex` (BEP 11) to swap peer lists.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace, warn};

use crate::bencode::{self, Value};
use crate::error::TorrentError;
use crate::protocol::compact;
use crate::protocol::message::Message;
use crate::torrent::InfoHash;

/// Extended message id reserved for the handshake
pub const EXTENDED_HANDSHAKE_ID: u8 = 0;
/// Ids we ask peers to use when sending to us
pub const UT_METADATA_ID: u8 = 1;
pub const UT_PEX_ID: u8 = 2;

pub const UT_METADATA: &str = "ut_metadata";
pub const UT_PEX: &str = "ut_pex";

/// Size of one metadata slice
pub const METADATA_SLICE_LENGTH: usize = 16 * 1024;
/// Refuse info dictionaries larger than this
pub const MAX_METADATA_SIZE: usize = 16 * 1024 * 1024;

const CLIENT_VERSION: &str = concat!("rust-torrent-engine/", env!("CARGO_PKG_VERSION"));

/// Extended handshake payload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendedHandshake {
    /// Sub-protocol name to message id; id 0 disables the extension
    #[serde(default)]
    pub m: BTreeMap<String, i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_size: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v: Option<String>,
    /// Listen port of the sender
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p: Option<i64>,
}

impl ExtendedHandshake {
    /// Our handshake advertising the supported extensions
    pub fn local(metadata_size: Option<usize>, listen_port: u16) -> Self {
        let mut m = BTreeMap::new();
        m.insert(UT_METADATA.to_string(), UT_METADATA_ID as i64);
        m.insert(UT_PEX.to_string(), UT_PEX_ID as i64);
        Self {
            m,
            metadata_size: metadata_size.map(|s| s as i64),
            v: Some(CLIENT_VERSION.to_string()),
            p: Some(listen_port as i64),
        }
    }

    /// Id the sender wants for `name`, if it supports it
    pub fn extension_id(&self, name: &str) -> Option<u8> {
        self.m
            .get(name)
            .copied()
            .filter(|id| *id > 0 && *id <= u8::MAX as i64)
            .map(|id| id as u8)
    }

    pub fn supports(&self, name: &str) -> bool {
        self.extension_id(name).is_some()
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_bencode::to_bytes(self)?)
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let handshake: Self = serde_bencode::from_bytes(payload).map_err(|e| {
            error!("Malformed extended handshake: {}", e);
            TorrentError::protocol_error_with_source("Malformed extended handshake", e.to_string())
        })?;
        debug!(
            "Extended handshake: client {:?}, extensions {:?}, metadata_size {:?}",
            handshake.v, handshake.m, handshake.metadata_size
        );
        Ok(handshake)
    }
}

/// ut_metadata message; `Data` carries the slice bytes after the dictionary
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataMessage {
    Request { piece: u32 },
    Data { piece: u32, total_size: u64, data: Vec<u8> },
    Reject { piece: u32 },
}

impl MetadataMessage {
    pub fn piece(&self) -> u32 {
        match self {
            MetadataMessage::Request { piece }
            | MetadataMessage::Data { piece, .. }
            | MetadataMessage::Reject { piece } => *piece,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let (msg_type, piece) = match self {
            MetadataMessage::Request { piece } => (0u32, *piece),
            MetadataMessage::Data { piece, .. } => (1, *piece),
            MetadataMessage::Reject { piece } => (2, *piece),
        };
        let mut header = Value::dict().with("msg_type", msg_type).with("piece", piece);
        if let MetadataMessage::Data { total_size, .. } = self {
            header = header.with("total_size", *total_size as i64);
        }
        let mut out = bencode::encode(&header);
        if let MetadataMessage::Data { data, .. } = self {
            out.extend_from_slice(data);
        }
        out
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let (header, consumed) = bencode::decode_prefix(payload)?;
        let msg_type = header
            .get_int(b"msg_type")
            .ok_or_else(|| TorrentError::protocol_error("ut_metadata message without msg_type"))?;
        let piece = header
            .get_int(b"piece")
            .filter(|p| *p >= 0 && *p <= u32::MAX as i64)
            .ok_or_else(|| TorrentError::protocol_error("ut_metadata message without piece"))?
            as u32;

        match msg_type {
            0 => Ok(MetadataMessage::Request { piece }),
            1 => {
                let total_size = header
                    .get_int(b"total_size")
                    .filter(|s| *s > 0)
                    .ok_or_else(|| TorrentError::protocol_error("ut_metadata data without total_size"))?;
                Ok(MetadataMessage::Data {
                    piece,
                    total_size: total_size as u64,
                    data: payload[consumed..].to_vec(),
                })
            }
            2 => Ok(MetadataMessage::Reject { piece }),
            other => Err(TorrentError::protocol_error_with_source(
                "Unknown ut_metadata msg_type",
                other.to_string(),
            )
            .into()),
        }
    }
}

/// Number of slices for an info dictionary of `total_size` bytes
pub fn metadata_slice_count(total_size: usize) -> usize {
    total_size.div_ceil(METADATA_SLICE_LENGTH)
}

/// Slice `piece` of `info` for answering a request
pub fn metadata_slice(info: &[u8], piece: u32) -> Option<&[u8]> {
    let begin = piece as usize * METADATA_SLICE_LENGTH;
    if begin >= info.len() {
        return None;
    }
    let end = (begin + METADATA_SLICE_LENGTH).min(info.len());
    Some(&info[begin..end])
}

/// Collects ut_metadata slices until the info dictionary is whole
#[derive(Debug)]
pub struct MetadataAssembler {
    info_hash: InfoHash,
    total_size: usize,
    slices: Vec<Option<Vec<u8>>>,
}

impl MetadataAssembler {
    pub fn new(info_hash: InfoHash, total_size: usize) -> Result<Self> {
        if total_size == 0 || total_size > MAX_METADATA_SIZE {
            return Err(TorrentError::protocol_error_with_source(
                "Unacceptable metadata size",
                total_size.to_string(),
            )
            .into());
        }
        Ok(Self {
            info_hash,
            total_size,
            slices: vec![None; metadata_slice_count(total_size)],
        })
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }

    pub fn slice_count(&self) -> usize {
        self.slices.len()
    }

    /// Slices not yet received
    pub fn missing(&self) -> Vec<u32> {
        self.slices
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_none())
            .map(|(i, _)| i as u32)
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.slices.iter().all(Option::is_some)
    }

    fn expected_len(&self, piece: usize) -> usize {
        let begin = piece * METADATA_SLICE_LENGTH;
        (self.total_size - begin).min(METADATA_SLICE_LENGTH)
    }

    /// Store one slice; returns true once every slice is present
    pub fn insert(&mut self, piece: u32, total_size: u64, data: Vec<u8>) -> Result<bool> {
        if total_size as usize != self.total_size {
            return Err(TorrentError::protocol_error_with_source(
                "ut_metadata total_size changed",
                format!("{} != {}", total_size, self.total_size),
            )
            .into());
        }
        let index = piece as usize;
        if index >= self.slices.len() {
            return Err(TorrentError::protocol_error_with_source(
                "ut_metadata piece out of range",
                piece.to_string(),
            )
            .into());
        }
        let expected = self.expected_len(index);
        if data.len() != expected {
            return Err(TorrentError::protocol_error_with_source(
                "ut_metadata slice has wrong length",
                format!("piece {}: expected {}, got {}", piece, expected, data.len()),
            )
            .into());
        }
        trace!("Metadata slice {} of {} received", piece, self.slices.len());
        self.slices[index] = Some(data);
        Ok(self.is_complete())
    }

    /// Concatenate and check the SHA-1 against the info hash.
    ///
    /// A mismatch drops every slice so the caller can start over.
    pub fn finish(&mut self) -> Result<Vec<u8>> {
        if !self.is_complete() {
            return Err(TorrentError::protocol_error("Metadata is incomplete").into());
        }
        let info: Vec<u8> = self.slices.iter().flatten().flatten().copied().collect();
        if InfoHash::from_info_bytes(&info) != self.info_hash {
            warn!("Assembled metadata does not match info hash {}", self.info_hash);
            self.slices.iter_mut().for_each(|s| *s = None);
            return Err(TorrentError::verification_error("Metadata hash mismatch", 0).into());
        }
        debug!("Metadata for {} assembled ({} bytes)", self.info_hash, info.len());
        Ok(info)
    }
}

/// ut_pex message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PexMessage {
    pub added: Vec<SocketAddr>,
    pub dropped: Vec<SocketAddr>,
}

impl PexMessage {
    pub fn encode(&self) -> Vec<u8> {
        let flags = vec![0u8; self.added.iter().filter(|a| a.is_ipv4()).count()];
        let value = Value::dict()
            .with("added", compact::encode_peers(&self.added))
            .with("added.f", flags)
            .with("dropped", compact::encode_peers(&self.dropped));
        bencode::encode(&value)
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let value = bencode::decode(payload)?;
        let added = match value.get_bytes(b"added") {
            Some(bytes) => compact::decode_peers(bytes)?,
            None => Vec::new(),
        };
        let dropped = match value.get_bytes(b"dropped") {
            Some(bytes) => compact::decode_peers(bytes)?,
            None => Vec::new(),
        };
        trace!("PEX: {} added, {} dropped", added.len(), dropped.len());
        Ok(Self { added, dropped })
    }
}

/// Decoded extended message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtensionMessage {
    Handshake(ExtendedHandshake),
    Metadata(MetadataMessage),
    Pex(PexMessage),
}

impl ExtensionMessage {
    /// Decode an inbound message; peers address us with the ids we advertised
    pub fn decode(id: u8, payload: &[u8]) -> Result<Self> {
        match id {
            EXTENDED_HANDSHAKE_ID => Ok(ExtensionMessage::Handshake(ExtendedHandshake::decode(payload)?)),
            UT_METADATA_ID => Ok(ExtensionMessage::Metadata(MetadataMessage::decode(payload)?)),
            UT_PEX_ID => Ok(ExtensionMessage::Pex(PexMessage::decode(payload)?)),
            other => Err(TorrentError::protocol_error_with_source(
                "Unknown extended message id",
                other.to_string(),
            )
            .into()),
        }
    }

    /// Wire message addressed with the ids from the peer's handshake
    pub fn to_message(&self, remote: &ExtendedHandshake) -> Result<Message> {
        let (id, payload) = match self {
            ExtensionMessage::Handshake(handshake) => (EXTENDED_HANDSHAKE_ID, handshake.encode()?),
            ExtensionMessage::Metadata(msg) => (remote_id(remote, UT_METADATA)?, msg.encode()),
            ExtensionMessage::Pex(msg) => (remote_id(remote, UT_PEX)?, msg.encode()),
        };
        Ok(Message::Extended { id, payload })
    }
}

fn remote_id(remote: &ExtendedHandshake, name: &str) -> Result<u8> {
    remote.extension_id(name).ok_or_else(|| {
        TorrentError::protocol_error_with_source("Peer does not support extension", name.to_string()).into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extended_handshake_round_trip() {
        let local = ExtendedHandshake::local(Some(31235), 6881);
        let bytes = local.encode().unwrap();
        assert!(bytes.starts_with(b"d1:md"));
        let parsed = ExtendedHandshake::decode(&bytes).unwrap();
        assert_eq!(parsed, local);
        assert_eq!(parsed.extension_id(UT_METADATA), Some(UT_METADATA_ID));
        assert!(parsed.supports(UT_PEX));
    }

    #[test]
    fn test_extended_handshake_ignores_unknown_and_disabled() {
        let payload = b"d1:md11:ut_metadatai0e6:ut_pexi7ee4:reqqi250ee";
        let parsed = ExtendedHandshake::decode(payload).unwrap();
        assert!(!parsed.supports(UT_METADATA));
        assert_eq!(parsed.extension_id(UT_PEX), Some(7));
        assert_eq!(parsed.metadata_size, None);
    }

    #[test]
    fn test_metadata_message_wire_form() {
        let request = MetadataMessage::Request { piece: 0 };
        assert_eq!(request.encode(), b"d8:msg_typei0e5:piecei0ee".to_vec());
        assert_eq!(MetadataMessage::decode(&request.encode()).unwrap(), request);

        let data = MetadataMessage::Data { piece: 1, total_size: 20000, data: vec![7u8; 3616] };
        assert_eq!(MetadataMessage::decode(&data.encode()).unwrap(), data);
        assert!(MetadataMessage::decode(b"d8:msg_typei9e5:piecei0ee").is_err());
    }

    #[test]
    fn test_metadata_assembly_verifies_hash() {
        let info: Vec<u8> = (0..40000u32).map(|i| (i % 251) as u8).collect();
        let info_hash = InfoHash::from_info_bytes(&info);
        let mut assembler = MetadataAssembler::new(info_hash, info.len()).unwrap();
        assert_eq!(assembler.slice_count(), 3);

        for piece in [2u32, 0] {
            let slice = metadata_slice(&info, piece).unwrap().to_vec();
            assert!(!assembler.insert(piece, info.len() as u64, slice).unwrap());
        }
        assert_eq!(assembler.missing(), vec![1]);
        assert!(assembler.insert(1, info.len() as u64, vec![0u8; 10]).is_err());
        let slice = metadata_slice(&info, 1).unwrap().to_vec();
        assert!(assembler.insert(1, info.len() as u64, slice).unwrap());
        assert_eq!(assembler.finish().unwrap(), info);
        assert!(metadata_slice(&info, 3).is_none());
    }

    #[test]
    fn test_metadata_mismatch_resets() {
        let info = vec![1u8; 100];
        let mut assembler = MetadataAssembler::new(InfoHash([0u8; 20]), 100).unwrap();
        assert!(assembler.insert(0, 100, info).unwrap());
        assert!(assembler.finish().is_err());
        assert_eq!(assembler.missing(), vec![0]);
    }

    #[test]
    fn test_pex_round_trip() {
        let pex = PexMessage {
            added: vec!["1.2.3.4:6881".parse().unwrap(), "5.6.7.8:51413".parse().unwrap()],
            dropped: vec!["9.9.9.9:1".parse().unwrap()],
        };
        assert_eq!(PexMessage::decode(&pex.encode()).unwrap(), pex);
    }

    #[test]
    fn test_dispatch_uses_remote_ids() {
        let mut remote = ExtendedHandshake::default();
        remote.m.insert(UT_METADATA.to_string(), 3);
        let msg = ExtensionMessage::Metadata(MetadataMessage::Reject { piece: 4 });
        match msg.to_message(&remote).unwrap() {
            Message::Extended { id, payload } => {
                assert_eq!(id, 3);
                assert_eq!(
                    ExtensionMessage::decode(UT_METADATA_ID, &payload).unwrap(),
                    ExtensionMessage::Metadata(MetadataMessage::Reject { piece: 4 })
                );
            }
            other => panic!("unexpected {:?}", other),
        }
        let pex = ExtensionMessage::Pex(PexMessage::default());
        assert!(pex.to_message(&remote).is_err());
    }
}
