//! DHT (Distributed Hash Table) module
//!
//! Mainline DHT node: KRPC messages, routing table, tokens, announced peers
//! and iterative lookups.

pub mod bootstrap;
pub mod dht;
pub mod message;
pub mod node;
pub mod peers;
pub mod routing;
pub mod rpc;
pub mod token;
pub mod transport;

pub use bootstrap::{announce, announce_to, bootstrap, discover_peers, find_closest, resolve_bootstrap_nodes, LookupResult};
pub use dht::{DhtNode, GetPeersReply, K};
pub use message::{DhtMessage, Query, Response};
pub use node::{NodeId, NodeSession, NodeStatus};
pub use peers::PeerStore;
pub use routing::{InsertOutcome, KBucket, RoutingTable};
pub use rpc::{RpcReply, RpcTable};
pub use token::TokenManager;
pub use transport::{DatagramTransport, UdpTransport};
