//! A handful of DHT nodes on loopback UDP finding each other and the peers
//! announced among them.

use std::net::SocketAddr;
use std::sync::Arc;

use rust_torrent_engine::cli::DhtConfig;
use rust_torrent_engine::dht::{announce_to, find_closest, NodeId};
use rust_torrent_engine::{bootstrap, discover_peers, DhtNode, InfoHash};
use tokio::task::JoinHandle;

fn config(implied_port: bool) -> DhtConfig {
    DhtConfig {
        request_timeout_secs: 2,
        implied_port,
        bootstrap_nodes: Vec::new(),
        ..DhtConfig::default()
    }
}

async fn spawn_node(implied_port: bool) -> (Arc<DhtNode>, JoinHandle<()>) {
    let node = DhtNode::bind("127.0.0.1:0".parse().unwrap(), config(implied_port))
        .await
        .unwrap();
    let handle = node.start();
    (node, handle)
}

/// A router plus `count` nodes that all bootstrapped through it
async fn network(count: usize) -> (Vec<Arc<DhtNode>>, Vec<JoinHandle<()>>) {
    let (router, handle) = spawn_node(false).await;
    let router_addr = router.local_addr().unwrap();
    let mut nodes = vec![router];
    let mut handles = vec![handle];
    for _ in 0..count {
        let (node, handle) = spawn_node(false).await;
        bootstrap(&node, &[router_addr]).await.unwrap();
        nodes.push(node);
        handles.push(handle);
    }
    (nodes, handles)
}

#[tokio::test]
async fn test_nodes_learn_each_other_through_router() {
    let (nodes, handles) = network(4).await;

    // The last node to join found everyone the router knew about
    let last = nodes.last().unwrap();
    assert!(last.node_count().await >= 3);

    let target = nodes[1].id();
    let closest = find_closest(last, target).await.unwrap();
    assert_eq!(closest.first().map(|n| n.id), Some(target));

    for handle in handles {
        handle.abort();
    }
}

#[tokio::test]
async fn test_announced_peer_discovered_from_another_node() {
    let (nodes, handles) = network(3).await;
    let info_hash = InfoHash([0x5a; 20]);

    let lookup = discover_peers(&nodes[1], info_hash).await.unwrap();
    assert!(lookup.peers.is_empty());
    assert!(!lookup.tokens.is_empty());
    let accepted = announce_to(&nodes[1], &lookup, info_hash, 51413).await;
    assert_eq!(accepted, lookup.tokens.len());

    let found = discover_peers(&nodes[3], info_hash).await.unwrap();
    let expected: SocketAddr = "127.0.0.1:51413".parse().unwrap();
    assert!(found.peers.contains(&expected));

    for handle in handles {
        handle.abort();
    }
}

#[tokio::test]
async fn test_implied_port_uses_udp_source_port() {
    let (router, router_handle) = spawn_node(false).await;
    let (announcer, announcer_handle) = spawn_node(true).await;
    bootstrap(&announcer, &[router.local_addr().unwrap()]).await.unwrap();

    let info_hash = InfoHash([0x77; 20]);
    let lookup = discover_peers(&announcer, info_hash).await.unwrap();
    assert!(announce_to(&announcer, &lookup, info_hash, 1).await >= 1);

    // A node never lists its own store in its lookups, so ask the router
    let source = announcer.local_addr().unwrap();
    let reply = announcer.get_peers(router.local_addr().unwrap(), info_hash).await.unwrap();
    assert!(reply.peers.contains(&source));
    assert!(!reply.peers.iter().any(|p| p.port() == 1));

    router_handle.abort();
    announcer_handle.abort();
}

#[tokio::test]
async fn test_random_ids_are_distinct() {
    let a = NodeId::random();
    let b = NodeId::random();
    assert_ne!(a, b);
    assert_eq!(a.distance(&a), [0u8; 20]);
}
