//! DHT message module
//!
//! KRPC datagrams: a bencoded dictionary with transaction id `t`, type `y`
//! and either a query (`q` + `a`), a response (`r`) or an error (`e`).

use std::fmt;
use std::net::SocketAddr;

use anyhow::Result;
use tracing::trace;

use crate::bencode::{self, Value};
use crate::dht::node::{decode_compact_nodes, encode_compact_nodes, NodeId, NodeSession};
use crate::error::TorrentError;
use crate::protocol::compact;
use crate::torrent::InfoHash;

/// Generic error
pub const ERROR_GENERIC: i64 = 201;
/// Server error
pub const ERROR_SERVER: i64 = 202;
/// Malformed packet, invalid arguments or bad token
pub const ERROR_PROTOCOL: i64 = 203;
/// Method unknown
pub const ERROR_METHOD_UNKNOWN: i64 = 204;

/// Query methods
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    Ping,
    FindNode {
        target: NodeId,
    },
    GetPeers {
        info_hash: InfoHash,
    },
    AnnouncePeer {
        info_hash: InfoHash,
        port: u16,
        /// Use the UDP source port instead of `port`
        implied_port: bool,
        token: Vec<u8>,
    },
}

impl Query {
    pub fn method(&self) -> &'static str {
        match self {
            Query::Ping => "ping",
            Query::FindNode { .. } => "find_node",
            Query::GetPeers { .. } => "get_peers",
            Query::AnnouncePeer { .. } => "announce_peer",
        }
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.method())
    }
}

/// Response body; which fields are set depends on the query answered
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    pub id: Option<NodeId>,
    pub nodes: Vec<(NodeId, SocketAddr)>,
    pub values: Vec<SocketAddr>,
    pub token: Option<Vec<u8>>,
}

impl Response {
    pub fn new(id: NodeId) -> Self {
        Self {
            id: Some(id),
            ..Self::default()
        }
    }
}

/// One KRPC datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhtMessage {
    Query {
        transaction_id: Vec<u8>,
        sender: NodeId,
        query: Query,
    },
    Response {
        transaction_id: Vec<u8>,
        response: Response,
    },
    Error {
        transaction_id: Vec<u8>,
        code: i64,
        message: String,
    },
}

fn invalid(message: impl Into<String>) -> anyhow::Error {
    TorrentError::dht_error(message).into()
}

fn required_id(args: &Value, key: &[u8]) -> Result<[u8; 20]> {
    let bytes = args
        .get_bytes(key)
        .ok_or_else(|| invalid(format!("missing {}", String::from_utf8_lossy(key))))?;
    bytes
        .try_into()
        .map_err(|_| invalid(format!("{} must be 20 bytes", String::from_utf8_lossy(key))))
}

impl DhtMessage {
    pub fn transaction_id(&self) -> &[u8] {
        match self {
            DhtMessage::Query { transaction_id, .. }
            | DhtMessage::Response { transaction_id, .. }
            | DhtMessage::Error { transaction_id, .. } => transaction_id,
        }
    }

    /// Get the message type as a string
    pub fn message_type(&self) -> &'static str {
        match self {
            DhtMessage::Query { .. } => "q",
            DhtMessage::Response { .. } => "r",
            DhtMessage::Error { .. } => "e",
        }
    }

    pub fn error(transaction_id: Vec<u8>, code: i64, message: impl Into<String>) -> Self {
        DhtMessage::Error {
            transaction_id,
            code,
            message: message.into(),
        }
    }

    /// Serialize DHT message to bytes
    pub fn encode(&self) -> Vec<u8> {
        let root = match self {
            DhtMessage::Query {
                transaction_id,
                sender,
                query,
            } => {
                let mut args = Value::dict().with("id", sender.0);
                match query {
                    Query::Ping => {}
                    Query::FindNode { target } => args = args.with("target", target.0),
                    Query::GetPeers { info_hash } => args = args.with("info_hash", info_hash.0),
                    Query::AnnouncePeer {
                        info_hash,
                        port,
                        implied_port,
                        token,
                    } => {
                        args = args
                            .with("info_hash", info_hash.0)
                            .with("port", *port)
                            .with("token", token.clone());
                        if *implied_port {
                            args = args.with("implied_port", 1i64);
                        }
                    }
                }
                Value::dict()
                    .with("t", transaction_id.clone())
                    .with("y", "q")
                    .with("q", query.method())
                    .with("a", args)
            }
            DhtMessage::Response {
                transaction_id,
                response,
            } => {
                let mut body = Value::dict();
                if let Some(id) = response.id {
                    body = body.with("id", id.0);
                }
                if !response.nodes.is_empty() {
                    let sessions: Vec<NodeSession> = response
                        .nodes
                        .iter()
                        .map(|(id, addr)| NodeSession::new(*id, *addr))
                        .collect();
                    body = body.with("nodes", encode_compact_nodes(&sessions));
                }
                if !response.values.is_empty() {
                    let values: Vec<Value> = response
                        .values
                        .iter()
                        .filter_map(|addr| match addr {
                            SocketAddr::V4(v4) => Some(Value::Bytes(compact::encode_peer(v4).to_vec())),
                            SocketAddr::V6(_) => None,
                        })
                        .collect();
                    body = body.with("values", values);
                }
                if let Some(token) = &response.token {
                    body = body.with("token", token.clone());
                }
                Value::dict()
                    .with("t", transaction_id.clone())
                    .with("y", "r")
                    .with("r", body)
            }
            DhtMessage::Error {
                transaction_id,
                code,
                message,
            } => Value::dict()
                .with("t", transaction_id.clone())
                .with("y", "e")
                .with("e", vec![Value::Integer(*code), Value::string(message)]),
        };
        bencode::encode(&root)
    }

    /// Deserialize DHT message from bytes
    pub fn decode(data: &[u8]) -> Result<Self> {
        let root = bencode::decode(data)?;
        let transaction_id = root
            .get_bytes(b"t")
            .ok_or_else(|| invalid("missing transaction id"))?
            .to_vec();
        let kind = root.get_bytes(b"y").ok_or_else(|| invalid("missing message type"))?;

        let message = match kind {
            b"q" => {
                let method = root.get_str(b"q").ok_or_else(|| invalid("missing query method"))?;
                let args = root.get(b"a").ok_or_else(|| invalid("missing query arguments"))?;
                let sender = NodeId(required_id(args, b"id")?);
                let query = match method {
                    "ping" => Query::Ping,
                    "find_node" => Query::FindNode {
                        target: NodeId(required_id(args, b"target")?),
                    },
                    "get_peers" => Query::GetPeers {
                        info_hash: InfoHash(required_id(args, b"info_hash")?),
                    },
                    "announce_peer" => {
                        let port = args
                            .get_int(b"port")
                            .filter(|p| (0..=u16::MAX as i64).contains(p))
                            .unwrap_or(0) as u16;
                        let implied_port = args.get_int(b"implied_port").unwrap_or(0) != 0;
                        if port == 0 && !implied_port {
                            return Err(invalid("announce_peer without port"));
                        }
                        Query::AnnouncePeer {
                            info_hash: InfoHash(required_id(args, b"info_hash")?),
                            port,
                            implied_port,
                            token: args
                                .get_bytes(b"token")
                                .ok_or_else(|| invalid("announce_peer without token"))?
                                .to_vec(),
                        }
                    }
                    other => {
                        return Err(TorrentError::dht_error_with_node(
                            format!("unknown method {}", other),
                            hex::encode(sender.0),
                        )
                        .into())
                    }
                };
                DhtMessage::Query {
                    transaction_id,
                    sender,
                    query,
                }
            }
            b"r" => {
                let body = root.get(b"r").ok_or_else(|| invalid("missing response body"))?;
                let id = match body.get_bytes(b"id") {
                    Some(bytes) => Some(NodeId::from_slice(bytes)?),
                    None => None,
                };
                let nodes = match body.get_bytes(b"nodes") {
                    Some(bytes) => decode_compact_nodes(bytes)?,
                    None => Vec::new(),
                };
                let mut values = Vec::new();
                for value in body.get_list(b"values").unwrap_or(&[]) {
                    if let Some(bytes) = value.as_bytes() {
                        values.push(compact::decode_peer(bytes)?);
                    }
                }
                DhtMessage::Response {
                    transaction_id,
                    response: Response {
                        id,
                        nodes,
                        values,
                        token: body.get_bytes(b"token").map(<[u8]>::to_vec),
                    },
                }
            }
            b"e" => {
                let list = root.get_list(b"e").unwrap_or(&[]);
                DhtMessage::Error {
                    transaction_id,
                    code: list.first().and_then(Value::as_int).unwrap_or(ERROR_GENERIC),
                    message: list.get(1).and_then(Value::as_str).unwrap_or_default().to_string(),
                }
            }
            other => return Err(invalid(format!("unknown message type {:?}", String::from_utf8_lossy(other)))),
        };
        trace!("Decoded DHT {} message ({} bytes)", message.message_type(), data.len());
        Ok(message)
    }
}

/// Classify a datagram that failed to decode as a query, for the error reply
pub fn undecodable_query_error(data: &[u8]) -> Option<DhtMessage> {
    let root = bencode::decode(data).ok()?;
    if root.get_bytes(b"y")? != b"q" {
        return None;
    }
    let transaction_id = root.get_bytes(b"t")?.to_vec();
    let code = match root.get_str(b"q") {
        Some("ping" | "find_node" | "get_peers" | "announce_peer") => ERROR_PROTOCOL,
        _ => ERROR_METHOD_UNKNOWN,
    };
    let text = if code == ERROR_PROTOCOL { "Protocol Error" } else { "Method Unknown" };
    Some(DhtMessage::error(transaction_id, code, text))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_wire_form() {
        let ping = DhtMessage::Query {
            transaction_id: b"aa".to_vec(),
            sender: NodeId(*b"abcdefghij0123456789"),
            query: Query::Ping,
        };
        let bytes = ping.encode();
        assert_eq!(bytes, b"d1:ad2:id20:abcdefghij0123456789e1:q4:ping1:t2:aa1:y1:qe".to_vec());
        assert_eq!(DhtMessage::decode(&bytes).unwrap(), ping);
    }

    #[test]
    fn test_announce_peer_flags() {
        let query = DhtMessage::Query {
            transaction_id: vec![0, 1],
            sender: NodeId([1u8; 20]),
            query: Query::AnnouncePeer {
                info_hash: InfoHash([2u8; 20]),
                port: 0,
                implied_port: true,
                token: b"tok".to_vec(),
            },
        };
        assert_eq!(DhtMessage::decode(&query.encode()).unwrap(), query);
    }

    #[test]
    fn test_get_peers_response() {
        let response = DhtMessage::Response {
            transaction_id: vec![9],
            response: Response {
                id: Some(NodeId([3u8; 20])),
                nodes: vec![(NodeId([4u8; 20]), "10.0.0.4:4000".parse().unwrap())],
                values: vec!["10.0.0.5:5000".parse().unwrap()],
                token: Some(b"secret".to_vec()),
            },
        };
        assert_eq!(DhtMessage::decode(&response.encode()).unwrap(), response);
    }

    #[test]
    fn test_error_message() {
        let error = DhtMessage::error(b"xy".to_vec(), ERROR_PROTOCOL, "Bad token");
        let bytes = error.encode();
        assert_eq!(bytes, b"d1:eli203e9:Bad tokene1:t2:xy1:y1:ee".to_vec());
        assert_eq!(DhtMessage::decode(&bytes).unwrap(), error);
    }

    #[test]
    fn test_undecodable_queries() {
        let unknown = b"d1:ad2:id20:abcdefghij0123456789e1:q4:vote1:t2:aa1:y1:qe";
        assert!(DhtMessage::decode(unknown).is_err());
        match undecodable_query_error(unknown) {
            Some(DhtMessage::Error { code, .. }) => assert_eq!(code, ERROR_METHOD_UNKNOWN),
            other => panic!("unexpected {:?}", other),
        }
        let short_id = b"d1:ad2:id3:abce1:q4:ping1:t2:aa1:y1:qe";
        match undecodable_query_error(short_id) {
            Some(DhtMessage::Error { code, .. }) => assert_eq!(code, ERROR_PROTOCOL),
            other => panic!("unexpected {:?}", other),
        }
        assert!(undecodable_query_error(b"d1:t2:aa1:y1:re").is_none());
    }
}
