//! Compact peer encoding
//!
//! 6 bytes per IPv4 peer: address then big-endian port. Shared by tracker
//! responses, DHT `values` and ut_pex.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use anyhow::Result;
use tracing::trace;

use crate::error::TorrentError;

pub const COMPACT_PEER_LENGTH: usize = 6;

pub fn encode_peer(addr: &SocketAddrV4) -> [u8; COMPACT_PEER_LENGTH] {
    let mut out = [0u8; COMPACT_PEER_LENGTH];
    out[..4].copy_from_slice(&addr.ip().octets());
    out[4..].copy_from_slice(&addr.port().to_be_bytes());
    out
}

pub fn decode_peer(bytes: &[u8]) -> Result<SocketAddr> {
    if bytes.len() != COMPACT_PEER_LENGTH {
        return Err(TorrentError::parse_error_with_source(
            "Compact peer has wrong length",
            format!("{} bytes", bytes.len()),
        )
        .into());
    }
    let ip = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
    let port = u16::from_be_bytes([bytes[4], bytes[5]]);
    Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
}

/// Concatenated compact form; IPv6 addresses are skipped
pub fn encode_peers<'a>(peers: impl IntoIterator<Item = &'a SocketAddr>) -> Vec<u8> {
    let mut out = Vec::new();
    for peer in peers {
        if let SocketAddr::V4(v4) = peer {
            out.extend_from_slice(&encode_peer(v4));
        }
    }
    out
}

/// Split a compact list; the length must be a multiple of 6
pub fn decode_peers(bytes: &[u8]) -> Result<Vec<SocketAddr>> {
    if bytes.len() % COMPACT_PEER_LENGTH != 0 {
        return Err(TorrentError::parse_error_with_source(
            "Compact peer list length is not a multiple of 6",
            format!("{} bytes", bytes.len()),
        )
        .into());
    }
    let peers = bytes
        .chunks_exact(COMPACT_PEER_LENGTH)
        .map(decode_peer)
        .collect::<Result<Vec<_>>>()?;
    trace!("Decoded {} compact peers", peers.len());
    Ok(peers)
}
