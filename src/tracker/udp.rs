//! UDP tracker packets
//!
//! Big-endian fixed layouts. Every request carries a transaction id chosen
//! by us; connect uses the client id, announce and scrape use the launcher id.

use anyhow::Result;
use bytes::{Buf, BufMut, BytesMut};

use crate::error::TorrentError;
use crate::protocol::compact::{decode_peers, COMPACT_PEER_LENGTH};
use crate::torrent::InfoHash;
use crate::tracker::message::{AnnounceMessage, AnnounceRequest, ScrapeMessage};

/// Magic constant opening a connect request
pub const PROTOCOL_ID: u64 = 0x41727101980;

pub const ACTION_CONNECT: u32 = 0;
pub const ACTION_ANNOUNCE: u32 = 1;
pub const ACTION_SCRAPE: u32 = 2;
pub const ACTION_ERROR: u32 = 3;

pub const CONNECT_LENGTH: usize = 16;
pub const ANNOUNCE_LENGTH: usize = 98;
pub const SCRAPE_LENGTH: usize = 36;

/// Decoded tracker datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UdpResponse {
    Connect { transaction_id: u32, connection_id: u64 },
    Announce(AnnounceMessage),
    Scrape(ScrapeMessage),
    Error { transaction_id: u32, message: String },
}

impl UdpResponse {
    pub fn transaction_id(&self) -> u32 {
        match self {
            UdpResponse::Connect { transaction_id, .. } => *transaction_id,
            UdpResponse::Announce(message) => message.id,
            UdpResponse::Scrape(message) => message.id,
            UdpResponse::Error { transaction_id, .. } => *transaction_id,
        }
    }
}

pub fn build_connect(transaction_id: u32) -> BytesMut {
    let mut buf = BytesMut::with_capacity(CONNECT_LENGTH);
    buf.put_u64(PROTOCOL_ID);
    buf.put_u32(ACTION_CONNECT);
    buf.put_u32(transaction_id);
    buf
}

pub fn build_announce(connection_id: u64, transaction_id: u32, request: &AnnounceRequest, key: u32) -> BytesMut {
    let mut buf = BytesMut::with_capacity(ANNOUNCE_LENGTH);
    buf.put_u64(connection_id);
    buf.put_u32(ACTION_ANNOUNCE);
    buf.put_u32(transaction_id);
    buf.put_slice(request.info_hash.as_bytes());
    buf.put_slice(&request.peer_id);
    buf.put_u64(request.downloaded);
    buf.put_u64(request.left);
    buf.put_u64(request.uploaded);
    buf.put_u32(request.event.udp_id());
    // IP address: let the tracker use the source address
    buf.put_u32(0);
    buf.put_u32(key);
    buf.put_u32(request.numwant);
    buf.put_u16(request.port);
    buf
}

pub fn build_scrape(connection_id: u64, transaction_id: u32, info_hash: &InfoHash) -> BytesMut {
    let mut buf = BytesMut::with_capacity(SCRAPE_LENGTH);
    buf.put_u64(connection_id);
    buf.put_u32(ACTION_SCRAPE);
    buf.put_u32(transaction_id);
    buf.put_slice(info_hash.as_bytes());
    buf
}

fn too_short(what: &str, len: usize) -> anyhow::Error {
    TorrentError::protocol_error_with_source(format!("UDP tracker {} response too short", what), format!("{} bytes", len))
        .into()
}

pub fn decode_response(data: &[u8]) -> Result<UdpResponse> {
    if data.len() < 8 {
        return Err(too_short("header", data.len()));
    }
    let mut buf = data;
    let action = buf.get_u32();
    let transaction_id = buf.get_u32();

    match action {
        ACTION_CONNECT => {
            if buf.remaining() < 8 {
                return Err(too_short("connect", data.len()));
            }
            Ok(UdpResponse::Connect {
                transaction_id,
                connection_id: buf.get_u64(),
            })
        }
        ACTION_ANNOUNCE => {
            if buf.remaining() < 12 {
                return Err(too_short("announce", data.len()));
            }
            let interval = buf.get_u32();
            let leechers = buf.get_u32();
            let seeders = buf.get_u32();
            let usable = buf.remaining() - buf.remaining() % COMPACT_PEER_LENGTH;
            let peers = decode_peers(&buf[..usable])?;
            Ok(UdpResponse::Announce(AnnounceMessage {
                id: transaction_id,
                interval,
                seeders,
                leechers,
                peers,
                warning: None,
            }))
        }
        ACTION_SCRAPE => {
            if buf.remaining() < 12 {
                return Err(too_short("scrape", data.len()));
            }
            Ok(UdpResponse::Scrape(ScrapeMessage {
                id: transaction_id,
                seeders: buf.get_u32(),
                completed: buf.get_u32(),
                leechers: buf.get_u32(),
            }))
        }
        ACTION_ERROR => Ok(UdpResponse::Error {
            transaction_id,
            message: String::from_utf8_lossy(buf).into_owned(),
        }),
        other => Err(TorrentError::protocol_error(format!("Unknown UDP tracker action {}", other)).into()),
    }
}
