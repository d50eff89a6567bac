//! DHT bootstrap and iterative lookups
//!
//! Joins the network through router nodes, then walks toward a target
//! id by querying the closest unqueried nodes `alpha` at a time.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio::net::lookup_host;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::dht::dht::{DhtNode, GetPeersReply, K};
use crate::dht::node::{NodeId, NodeSession};
use crate::error::TorrentError;
use crate::torrent::InfoHash;

/// Upper bound on lookup rounds
pub const MAX_LOOKUP_ROUNDS: usize = 10;

/// Outcome of a get_peers lookup
#[derive(Debug, Clone, Default)]
pub struct LookupResult {
    pub peers: Vec<SocketAddr>,
    /// Closest nodes that handed out a token, for announcing
    pub tokens: Vec<(NodeSession, Vec<u8>)>,
    /// Number of nodes queried
    pub queried: usize,
}

/// Resolve `host:port` router names, keeping IPv4 addresses
pub async fn resolve_bootstrap_nodes(hosts: &[String]) -> Vec<SocketAddr> {
    let mut resolved = Vec::new();
    for host in hosts {
        match lookup_host(host.as_str()).await {
            Ok(addrs) => resolved.extend(addrs.filter(|a| a.is_ipv4())),
            Err(e) => warn!("Failed to resolve bootstrap node {}: {}", host, e),
        }
    }
    resolved.dedup();
    resolved
}

struct Lookup {
    target: NodeId,
    candidates: Vec<NodeSession>,
    queried: HashSet<SocketAddr>,
}

impl Lookup {
    fn new(target: NodeId, seeds: Vec<NodeSession>) -> Self {
        let mut lookup = Self {
            target,
            candidates: Vec::new(),
            queried: HashSet::new(),
        };
        lookup.offer(seeds);
        lookup
    }

    fn offer(&mut self, nodes: Vec<NodeSession>) {
        for node in nodes {
            if !self.candidates.iter().any(|c| c.addr == node.addr || c.id == node.id) {
                self.candidates.push(node);
            }
        }
        let target = self.target;
        self.candidates.sort_by_key(|n| n.id.distance(&target));
    }

    fn drop_candidate(&mut self, addr: &SocketAddr) {
        self.candidates.retain(|c| c.addr != *addr);
    }

    /// Up to `alpha` unqueried nodes among the K closest
    fn next_batch(&mut self, alpha: usize) -> Vec<NodeSession> {
        let batch: Vec<NodeSession> = self
            .candidates
            .iter()
            .take(K)
            .filter(|c| !self.queried.contains(&c.addr))
            .take(alpha)
            .cloned()
            .collect();
        for node in &batch {
            self.queried.insert(node.addr);
        }
        batch
    }
}

async fn seeds(node: &Arc<DhtNode>, target: &NodeId) -> Result<Vec<NodeSession>> {
    let seeds = node.closest_nodes(target, K).await;
    if seeds.is_empty() {
        return Err(TorrentError::dht_error("Routing table is empty").into());
    }
    Ok(seeds)
}

/// Iterative find_node toward `target`; returns the closest nodes found
pub async fn find_closest(node: &Arc<DhtNode>, target: NodeId) -> Result<Vec<NodeSession>> {
    let mut lookup = Lookup::new(target, seeds(node, &target).await?);
    let alpha = node.config().lookup_alpha.max(1);

    for round in 0..MAX_LOOKUP_ROUNDS {
        let batch = lookup.next_batch(alpha);
        if batch.is_empty() {
            debug!("find_node lookup for {} converged after {} rounds", target, round);
            break;
        }
        let mut queries = JoinSet::new();
        for candidate in batch {
            let node = Arc::clone(node);
            queries.spawn(async move { (candidate.addr, node.find_node(candidate.addr, target).await) });
        }
        while let Some(joined) = queries.join_next().await {
            let Ok((addr, result)) = joined else { continue };
            match result {
                Ok(found) => lookup.offer(found),
                Err(_) => lookup.drop_candidate(&addr),
            }
        }
    }

    lookup.candidates.truncate(K);
    Ok(lookup.candidates)
}

/// Join the network through `routers`; returns the routing table size
pub async fn bootstrap(node: &Arc<DhtNode>, routers: &[SocketAddr]) -> Result<usize> {
    info!("Bootstrapping DHT through {} routers", routers.len());
    let own_id = node.id();

    let mut queries = JoinSet::new();
    for router in routers.iter().copied() {
        let node = Arc::clone(node);
        queries.spawn(async move { (router, node.find_node(router, own_id).await) });
    }
    let mut answered = 0;
    while let Some(joined) = queries.join_next().await {
        let Ok((router, result)) = joined else { continue };
        match result {
            Ok(nodes) => {
                answered += 1;
                debug!("Router {} returned {} nodes", router, nodes.len());
            }
            Err(e) => debug!("Router {} failed: {}", router, e),
        }
    }

    if node.node_count().await == 0 {
        return Err(TorrentError::dht_error(format!(
            "Bootstrap failed: {} of {} routers answered",
            answered,
            routers.len()
        ))
        .into());
    }

    find_closest(node, own_id).await?;
    let count = node.node_count().await;
    info!("DHT bootstrap complete, {} nodes in routing table", count);
    Ok(count)
}

/// Iterative get_peers for `info_hash`
pub async fn discover_peers(node: &Arc<DhtNode>, info_hash: InfoHash) -> Result<LookupResult> {
    let target = NodeId::from(info_hash);
    let mut lookup = Lookup::new(target, seeds(node, &target).await?);
    let alpha = node.config().lookup_alpha.max(1);
    let mut result = LookupResult::default();
    let mut seen_peers = HashSet::new();

    for _ in 0..MAX_LOOKUP_ROUNDS {
        let batch = lookup.next_batch(alpha);
        if batch.is_empty() {
            break;
        }
        let mut queries = JoinSet::new();
        for candidate in batch {
            let node = Arc::clone(node);
            queries.spawn(async move {
                let reply = node.get_peers(candidate.addr, info_hash).await;
                (candidate, reply)
            });
        }
        while let Some(joined) = queries.join_next().await {
            let Ok((candidate, reply)) = joined else { continue };
            result.queried += 1;
            let GetPeersReply { peers, nodes, token } = match reply {
                Ok(reply) => reply,
                Err(_) => {
                    lookup.drop_candidate(&candidate.addr);
                    continue;
                }
            };
            for peer in peers {
                if seen_peers.insert(peer) {
                    result.peers.push(peer);
                }
            }
            if let Some(token) = token {
                result.tokens.push((candidate, token));
            }
            lookup.offer(nodes);
        }
    }

    result.tokens.sort_by_key(|(n, _)| n.id.distance(&target));
    result.tokens.truncate(K);
    info!(
        "DHT lookup for {} found {} peers after querying {} nodes",
        info_hash,
        result.peers.len(),
        result.queried
    );
    Ok(result)
}

/// Look up `info_hash` and announce `port` to the closest token holders.
/// Returns how many nodes accepted the announce.
pub async fn announce(node: &Arc<DhtNode>, info_hash: InfoHash, port: u16) -> Result<usize> {
    let lookup = discover_peers(node, info_hash).await?;
    Ok(announce_to(node, &lookup, info_hash, port).await)
}

/// Announce `port` to the token holders of a finished lookup
pub async fn announce_to(node: &Arc<DhtNode>, lookup: &LookupResult, info_hash: InfoHash, port: u16) -> usize {
    let mut announces = JoinSet::new();
    for (target, token) in lookup.tokens.iter().cloned() {
        let node = Arc::clone(node);
        announces.spawn(async move { node.announce_peer(target.addr, token, info_hash, port).await });
    }
    let mut accepted = 0;
    while let Some(joined) = announces.join_next().await {
        if let Ok(Ok(())) = joined {
            accepted += 1;
        }
    }
    info!("Announced {} on port {} to {} DHT nodes", info_hash, port, accepted);
    accepted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::config::DhtConfig;

    fn session(first: u8, port: u16) -> NodeSession {
        let mut id = [0u8; 20];
        id[0] = first;
        NodeSession::new(NodeId(id), SocketAddr::from(([127, 0, 0, 1], port)))
    }

    #[test]
    fn test_lookup_orders_by_distance_and_dedups() {
        let mut lookup = Lookup::new(NodeId([0u8; 20]), vec![session(0x80, 1), session(0x01, 2)]);
        lookup.offer(vec![session(0x10, 3), session(0x01, 2)]);
        let firsts: Vec<u8> = lookup.candidates.iter().map(|c| c.id.0[0]).collect();
        assert_eq!(firsts, vec![0x01, 0x10, 0x80]);
    }

    #[test]
    fn test_next_batch_never_repeats() {
        let mut lookup = Lookup::new(NodeId([0u8; 20]), (1..=5).map(|i| session(i, i as u16)).collect());
        let first = lookup.next_batch(3);
        assert_eq!(first.len(), 3);
        let second = lookup.next_batch(3);
        assert_eq!(second.len(), 2);
        assert!(lookup.next_batch(3).is_empty());
    }

    #[tokio::test]
    async fn test_lookup_with_empty_table_fails() {
        let node = DhtNode::bind("127.0.0.1:0".parse().unwrap(), DhtConfig::default())
            .await
            .unwrap();
        assert!(discover_peers(&node, InfoHash([1u8; 20])).await.is_err());
    }

    #[tokio::test]
    async fn test_bootstrap_and_announce_over_loopback() {
        let config = DhtConfig {
            request_timeout_secs: 2,
            ..DhtConfig::default()
        };
        let router = DhtNode::bind("127.0.0.1:0".parse().unwrap(), config.clone()).await.unwrap();
        let other = DhtNode::bind("127.0.0.1:0".parse().unwrap(), config.clone()).await.unwrap();
        let joiner = DhtNode::bind("127.0.0.1:0".parse().unwrap(), config).await.unwrap();
        router.add_node(other.id(), other.local_addr().unwrap()).await;
        let handles = [router.start(), other.start(), joiner.start()];

        let count = bootstrap(&joiner, &[router.local_addr().unwrap()]).await.unwrap();
        assert!(count >= 2);

        let info_hash = InfoHash([0x42; 20]);
        let accepted = announce(&joiner, info_hash, 7000).await.unwrap();
        assert!(accepted >= 1);

        let found = discover_peers(&router, info_hash).await.unwrap();
        assert!(found.peers.contains(&"127.0.0.1:7000".parse().unwrap()));

        for handle in handles {
            handle.abort();
        }
    }
}
