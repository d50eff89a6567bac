//! DHT node
//!
//! Owns the routing table, the outstanding-query table, token secrets and
//! the announced-peer store. One receive loop serves inbound queries and
//! routes replies to the callers awaiting them.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::RwLock;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::cli::config::DhtConfig;
use crate::dht::message::{undecodable_query_error, DhtMessage, Query, Response, ERROR_PROTOCOL};
use crate::dht::node::{NodeId, NodeSession};
use crate::dht::peers::PeerStore;
use crate::dht::routing::{InsertOutcome, RoutingTable};
use crate::dht::rpc::{RpcReply, RpcTable};
use crate::dht::token::TokenManager;
use crate::dht::transport::{DatagramTransport, UdpTransport, MAX_DATAGRAM_SIZE};
use crate::error::TorrentError;
use crate::torrent::InfoHash;

/// Nodes returned by find_node and get_peers
pub const K: usize = 8;

/// What a get_peers query returned
#[derive(Debug, Clone, Default)]
pub struct GetPeersReply {
    pub peers: Vec<SocketAddr>,
    pub nodes: Vec<NodeSession>,
    /// Needed to announce to this node later
    pub token: Option<Vec<u8>>,
}

/// A running DHT node
pub struct DhtNode {
    id: NodeId,
    config: DhtConfig,
    transport: Arc<dyn DatagramTransport>,
    routing: RwLock<RoutingTable>,
    rpc: RpcTable,
    tokens: RwLock<TokenManager>,
    peers: RwLock<PeerStore>,
    running: AtomicBool,
}

impl std::fmt::Debug for DhtNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhtNode")
            .field("id", &self.id)
            .field("local_addr", &self.transport.local_addr().ok())
            .finish()
    }
}

impl DhtNode {
    /// Bind a UDP socket and create a node with a random id
    pub async fn bind(addr: SocketAddr, config: DhtConfig) -> Result<Arc<Self>> {
        let transport = UdpTransport::bind(addr).await?;
        Ok(Self::with_transport(NodeId::random(), Arc::new(transport), config))
    }

    pub fn with_transport(id: NodeId, transport: Arc<dyn DatagramTransport>, config: DhtConfig) -> Arc<Self> {
        info!("DHT node initialized with ID: {}", id.to_hex());
        Arc::new(Self {
            id,
            routing: RwLock::new(RoutingTable::new(id, config.table_capacity, config.bucket_size)),
            rpc: RpcTable::new(),
            tokens: RwLock::new(TokenManager::new(config.token_rotation())),
            peers: RwLock::new(PeerStore::new()),
            running: AtomicBool::new(false),
            config,
            transport,
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn config(&self) -> &DhtConfig {
        &self.config
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.transport.local_addr()
    }

    /// Copy of the routing table
    pub async fn routing_snapshot(&self) -> Vec<NodeSession> {
        self.routing.read().await.snapshot()
    }

    pub async fn node_count(&self) -> usize {
        self.routing.read().await.len()
    }

    pub async fn closest_nodes(&self, target: &NodeId, count: usize) -> Vec<NodeSession> {
        self.routing.read().await.find_closest(target, count)
    }

    /// Offer a node learned from elsewhere (compact lists, PORT messages)
    pub async fn add_node(&self, id: NodeId, addr: SocketAddr) -> InsertOutcome {
        self.routing.write().await.insert(NodeSession::new(id, addr))
    }

    /// Spawn the receive loop and periodic maintenance
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let node = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = node.run().await {
                error!("DHT loop stopped: {}", e);
            }
        })
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub async fn run(self: Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("DHT is already running");
            return Ok(());
        }
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut maintenance = interval(self.config.maintenance_interval());
        maintenance.set_missed_tick_behavior(MissedTickBehavior::Skip);
        maintenance.tick().await;

        while self.running.load(Ordering::SeqCst) {
            tokio::select! {
                received = self.transport.recv_from(&mut buf) => {
                    match received {
                        Ok((n, from)) => self.handle_datagram(&buf[..n], from).await,
                        Err(e) => debug!("DHT receive failed: {}", e),
                    }
                }
                _ = maintenance.tick() => {
                    let node = Arc::clone(&self);
                    tokio::spawn(async move { node.maintain().await });
                }
            }
        }
        info!("DHT node {} stopped", self.id);
        Ok(())
    }

    async fn send(&self, message: &DhtMessage, addr: SocketAddr) -> Result<()> {
        trace!("Sending DHT {} to {}", message.message_type(), addr);
        self.transport.send_to(&message.encode(), addr).await
    }

    /// Process one inbound datagram
    pub async fn handle_datagram(&self, data: &[u8], from: SocketAddr) {
        let message = match DhtMessage::decode(data) {
            Ok(message) => message,
            Err(e) => {
                debug!("Undecodable DHT datagram from {}: {}", from, e);
                if let Some(reply) = undecodable_query_error(data) {
                    if let Err(e) = self.send(&reply, from).await {
                        debug!("Failed to send error reply to {}: {}", from, e);
                    }
                }
                return;
            }
        };

        match message {
            DhtMessage::Query {
                transaction_id,
                sender,
                query,
            } => {
                let reply = self.handle_query(transaction_id, sender, query, from).await;
                if let Err(e) = self.send(&reply, from).await {
                    debug!("Failed to answer {}: {}", from, e);
                }
            }
            DhtMessage::Response {
                transaction_id,
                response,
            } => {
                if !self.rpc.resolve(&transaction_id, from, RpcReply::Response(response)).await {
                    trace!("Dropped unmatched response from {}", from);
                }
            }
            DhtMessage::Error {
                transaction_id,
                code,
                message,
            } => {
                debug!("DHT error {} from {}: {}", code, from, message);
                self.rpc
                    .resolve(&transaction_id, from, RpcReply::Error { code, message })
                    .await;
            }
        }
    }

    async fn handle_query(&self, transaction_id: Vec<u8>, sender: NodeId, query: Query, from: SocketAddr) -> DhtMessage {
        debug!("Received {} query from {} ({})", query, from, sender);
        self.routing.write().await.insert(NodeSession::responded(sender, from));

        let response = match query {
            Query::Ping => Response::new(self.id),
            Query::FindNode { target } => {
                let mut response = Response::new(self.id);
                response.nodes = self.node_list(&target).await;
                response
            }
            Query::GetPeers { info_hash } => {
                let mut response = Response::new(self.id);
                response.token = Some(self.tokens.read().await.issue(&from.ip()));
                response.values = self.peers.write().await.get(&info_hash);
                response.nodes = self.node_list(&NodeId::from(info_hash)).await;
                response
            }
            Query::AnnouncePeer {
                info_hash,
                port,
                implied_port,
                token,
            } => {
                if !self.tokens.read().await.validate(&from.ip(), &token) {
                    warn!("Rejecting announce_peer from {}: invalid token", from);
                    return DhtMessage::error(transaction_id, ERROR_PROTOCOL, "Invalid token");
                }
                let peer_port = if implied_port { from.port() } else { port };
                if peer_port == 0 {
                    warn!("Rejecting announce_peer from {}: port 0", from);
                    return DhtMessage::error(transaction_id, ERROR_PROTOCOL, "Invalid port");
                }
                let peer = SocketAddr::new(from.ip(), peer_port);
                self.peers.write().await.add(info_hash, peer);
                info!("Peer {} announced {}", peer, info_hash);
                Response::new(self.id)
            }
        };
        DhtMessage::Response {
            transaction_id,
            response,
        }
    }

    async fn node_list(&self, target: &NodeId) -> Vec<(NodeId, SocketAddr)> {
        self.routing
            .read()
            .await
            .find_closest(target, K)
            .into_iter()
            .map(|n| (n.id, n.addr))
            .collect()
    }

    /// Send a query and wait for its reply or the request timeout
    async fn query(&self, addr: SocketAddr, query: Query) -> Result<Response> {
        let method = query.method();
        let (transaction_id, receiver) = self.rpc.register(addr, method).await?;
        let message = DhtMessage::Query {
            transaction_id: transaction_id.clone(),
            sender: self.id,
            query,
        };
        if let Err(e) = self.send(&message, addr).await {
            self.rpc.cancel(&transaction_id).await;
            return Err(e);
        }

        match timeout(self.config.request_timeout(), receiver).await {
            Ok(Ok(RpcReply::Response(response))) => {
                if let Some(id) = response.id {
                    self.routing.write().await.insert(NodeSession::responded(id, addr));
                }
                Ok(response)
            }
            Ok(Ok(RpcReply::Error { code, message })) => Err(TorrentError::dht_error_full(
                format!("{} rejected with {}", method, code),
                addr.to_string(),
                message,
            )
            .into()),
            Ok(Err(_)) => Err(TorrentError::dht_error_with_node("Query abandoned", addr.to_string()).into()),
            Err(_) => {
                self.rpc.cancel(&transaction_id).await;
                self.routing.write().await.mark_failed_at(&addr);
                debug!("{} to {} timed out", method, addr);
                Err(TorrentError::dht_error_with_node(format!("No response to {}", method), addr.to_string()).into())
            }
        }
    }

    async fn merge_nodes(&self, nodes: &[(NodeId, SocketAddr)]) -> Vec<NodeSession> {
        let mut routing = self.routing.write().await;
        nodes
            .iter()
            .filter(|(id, _)| *id != self.id)
            .map(|(id, addr)| {
                let session = NodeSession::new(*id, *addr);
                routing.insert(session.clone());
                session
            })
            .collect()
    }

    /// Ping; None when the node did not answer
    pub async fn ping(&self, addr: SocketAddr) -> Option<NodeSession> {
        match self.query(addr, Query::Ping).await {
            Ok(Response { id: Some(id), .. }) => Some(NodeSession::responded(id, addr)),
            Ok(_) => {
                debug!("Ping reply from {} without id", addr);
                None
            }
            Err(e) => {
                debug!("Ping to {} failed: {}", addr, e);
                None
            }
        }
    }

    /// Ask `addr` for the nodes closest to `target`
    pub async fn find_node(&self, addr: SocketAddr, target: NodeId) -> Result<Vec<NodeSession>> {
        let response = self.query(addr, Query::FindNode { target }).await?;
        Ok(self.merge_nodes(&response.nodes).await)
    }

    /// Ask `addr` for peers of `info_hash`
    pub async fn get_peers(&self, addr: SocketAddr, info_hash: InfoHash) -> Result<GetPeersReply> {
        let response = self.query(addr, Query::GetPeers { info_hash }).await?;
        let nodes = self.merge_nodes(&response.nodes).await;
        debug!(
            "get_peers {} via {}: {} peers, {} nodes",
            info_hash,
            addr,
            response.values.len(),
            nodes.len()
        );
        Ok(GetPeersReply {
            peers: response.values,
            nodes,
            token: response.token,
        })
    }

    /// Announce that we serve `info_hash` on `port`
    pub async fn announce_peer(&self, addr: SocketAddr, token: Vec<u8>, info_hash: InfoHash, port: u16) -> Result<()> {
        let query = Query::AnnouncePeer {
            info_hash,
            port,
            implied_port: self.config.implied_port,
            token,
        };
        self.query(addr, query).await?;
        debug!("Announced {} to {}", info_hash, addr);
        Ok(())
    }

    /// Token rotation, status decay, re-pinging and pruning
    pub async fn maintain(self: &Arc<Self>) {
        self.tokens.write().await.maybe_rotate();
        self.peers.write().await.purge();

        let questionable = {
            let mut routing = self.routing.write().await;
            let decayed = routing.decay(self.config.quiet_interval());
            if decayed > 0 {
                debug!("{} nodes became questionable", decayed);
            }
            routing.questionable()
        };

        let mut pings = JoinSet::new();
        for node in questionable {
            let this = Arc::clone(self);
            pings.spawn(async move { this.ping(node.addr).await });
        }
        while pings.join_next().await.is_some() {}

        let pruned = self.routing.write().await.prune();
        trace!("DHT maintenance done, {} pruned, {} nodes", pruned, self.node_count().await);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::Mutex;

    /// Transport that records datagrams and never receives anything
    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<(Vec<u8>, SocketAddr)>>,
    }

    #[async_trait]
    impl DatagramTransport for RecordingTransport {
        async fn send_to(&self, data: &[u8], addr: SocketAddr) -> Result<()> {
            self.sent.lock().await.push((data.to_vec(), addr));
            Ok(())
        }

        async fn recv_from(&self, _buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
            std::future::pending().await
        }

        fn local_addr(&self) -> Result<SocketAddr> {
            Ok("127.0.0.1:6881".parse()?)
        }
    }

    fn config() -> DhtConfig {
        DhtConfig {
            request_timeout_secs: 1,
            ..DhtConfig::default()
        }
    }

    fn node_with_recorder() -> (Arc<DhtNode>, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::default());
        let node = DhtNode::with_transport(NodeId([9u8; 20]), transport.clone(), config());
        (node, transport)
    }

    async fn last_reply(transport: &RecordingTransport) -> DhtMessage {
        let sent = transport.sent.lock().await;
        let (bytes, _) = sent.last().expect("no datagram sent");
        DhtMessage::decode(bytes).unwrap()
    }

    fn query(query: Query) -> Vec<u8> {
        DhtMessage::Query {
            transaction_id: b"tt".to_vec(),
            sender: NodeId([1u8; 20]),
            query,
        }
        .encode()
    }

    #[tokio::test]
    async fn test_ping_answered_and_sender_added() {
        let (node, transport) = node_with_recorder();
        let from: SocketAddr = "10.0.0.1:7000".parse().unwrap();
        node.handle_datagram(&query(Query::Ping), from).await;
        match last_reply(&transport).await {
            DhtMessage::Response { transaction_id, response } => {
                assert_eq!(transaction_id, b"tt".to_vec());
                assert_eq!(response.id, Some(NodeId([9u8; 20])));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(node.node_count().await, 1);
    }

    #[tokio::test]
    async fn test_announce_with_never_issued_token_rejected() {
        let (node, transport) = node_with_recorder();
        let from: SocketAddr = "10.0.0.1:7000".parse().unwrap();
        let info_hash = InfoHash([5u8; 20]);
        node.handle_datagram(
            &query(Query::AnnouncePeer {
                info_hash,
                port: 6881,
                implied_port: false,
                token: b"forged".to_vec(),
            }),
            from,
        )
        .await;
        match last_reply(&transport).await {
            DhtMessage::Error { code, .. } => assert_eq!(code, 203),
            other => panic!("unexpected {:?}", other),
        }
        assert!(node.peers.write().await.get(&info_hash).is_empty());
    }

    #[tokio::test]
    async fn test_get_peers_token_then_announce() {
        let (node, transport) = node_with_recorder();
        let from: SocketAddr = "10.0.0.1:7000".parse().unwrap();
        let info_hash = InfoHash([5u8; 20]);
        node.handle_datagram(&query(Query::GetPeers { info_hash }), from).await;
        let token = match last_reply(&transport).await {
            DhtMessage::Response { response, .. } => response.token.unwrap(),
            other => panic!("unexpected {:?}", other),
        };

        node.handle_datagram(
            &query(Query::AnnouncePeer {
                info_hash,
                port: 0,
                implied_port: true,
                token,
            }),
            from,
        )
        .await;
        assert!(matches!(last_reply(&transport).await, DhtMessage::Response { .. }));
        assert_eq!(node.peers.write().await.get(&info_hash), vec![from]);

        node.handle_datagram(&query(Query::GetPeers { info_hash }), "10.0.0.2:1".parse().unwrap())
            .await;
        match last_reply(&transport).await {
            DhtMessage::Response { response, .. } => assert_eq!(response.values, vec![from]),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_announce_with_port_zero_rejected() {
        let (node, transport) = node_with_recorder();
        let from: SocketAddr = "10.0.0.1:7000".parse().unwrap();
        let info_hash = InfoHash([6u8; 20]);
        node.handle_datagram(&query(Query::GetPeers { info_hash }), from).await;
        let token = match last_reply(&transport).await {
            DhtMessage::Response { response, .. } => response.token.unwrap(),
            other => panic!("unexpected {:?}", other),
        };

        node.handle_datagram(
            &query(Query::AnnouncePeer {
                info_hash,
                port: 0,
                implied_port: false,
                token,
            }),
            from,
        )
        .await;
        match last_reply(&transport).await {
            DhtMessage::Error { code, .. } => assert_eq!(code, 203),
            other => panic!("unexpected {:?}", other),
        }
        assert!(node.peers.write().await.get(&info_hash).is_empty());
    }

    #[tokio::test]
    async fn test_unknown_method_gets_204() {
        let (node, transport) = node_with_recorder();
        node.handle_datagram(
            b"d1:ad2:id20:abcdefghij0123456789e1:q4:vote1:t2:aa1:y1:qe",
            "10.0.0.1:7000".parse().unwrap(),
        )
        .await;
        match last_reply(&transport).await {
            DhtMessage::Error { code, .. } => assert_eq!(code, 204),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_timeout_resolves_once_and_late_reply_is_noop() {
        let (node, transport) = node_with_recorder();
        let peer: SocketAddr = "10.0.0.3:7000".parse().unwrap();
        node.add_node(NodeId([3u8; 20]), peer).await;

        assert!(node.ping(peer).await.is_none());
        assert!(node.rpc.is_empty().await);
        assert_eq!(node.routing.read().await.get(&NodeId([3u8; 20])).unwrap().failures(), 1);

        let transaction_id = {
            let sent = transport.sent.lock().await;
            DhtMessage::decode(&sent[0].0).unwrap().transaction_id().to_vec()
        };
        let late = DhtMessage::Response {
            transaction_id,
            response: Response::new(NodeId([3u8; 20])),
        };
        node.handle_datagram(&late.encode(), peer).await;
        assert!(node.rpc.is_empty().await);
    }

    #[tokio::test]
    async fn test_reply_resolves_waiting_query() {
        let (node, transport) = node_with_recorder();
        let peer: SocketAddr = "10.0.0.4:7000".parse().unwrap();
        let waiter = {
            let node = Arc::clone(&node);
            tokio::spawn(async move { node.find_node(peer, NodeId([7u8; 20])).await })
        };

        let transaction_id = loop {
            if let Some((bytes, _)) = transport.sent.lock().await.first() {
                break DhtMessage::decode(bytes).unwrap().transaction_id().to_vec();
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        let mut response = Response::new(NodeId([4u8; 20]));
        response.nodes = vec![(NodeId([7u8; 20]), "10.0.0.7:7000".parse().unwrap())];
        node.handle_datagram(
            &DhtMessage::Response {
                transaction_id,
                response,
            }
            .encode(),
            peer,
        )
        .await;

        let nodes = waiter.await.unwrap().unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(node.node_count().await, 2);
    }
}
