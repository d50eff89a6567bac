//! Tracker selection across the declared list and the supplemental pool

use std::collections::HashSet;

use rust_torrent_engine::cli::TrackerConfig;
use rust_torrent_engine::TrackerManager;

const POOL: [&str; 4] = [
    "http://pool-a.example/announce",
    "udp://pool-b.example:6969",
    "http://pool-c.example/announce",
    "udp://pool-d.example:1337",
];

fn config(max_failures: u32) -> TrackerConfig {
    TrackerConfig {
        min_trackers: 3,
        max_failures,
        default_trackers: POOL.iter().map(|s| s.to_string()).collect(),
        ..TrackerConfig::default()
    }
}

#[tokio::test]
async fn test_supplements_by_descending_weight() {
    let manager = TrackerManager::new(config(5)).unwrap();

    let b = manager.register(POOL[1]).await.unwrap();
    b.record_success();
    b.record_success();
    let d = manager.register(POOL[3]).await.unwrap();
    d.record_success();
    let a = manager.register(POOL[0]).await.unwrap();
    a.record_failure("unreachable");

    let clients = manager.clients(Some("http://own.example/announce"), &[], false).await;
    assert_eq!(clients.len(), 3);
    assert_eq!(clients[0].announce_url(), "http://own.example/announce");
    assert_eq!(clients[1].announce_url(), POOL[1]);
    assert_eq!(clients[2].announce_url(), POOL[3]);
}

#[tokio::test]
async fn test_declared_pool_tracker_not_duplicated() {
    let manager = TrackerManager::new(config(5)).unwrap();
    manager.register(POOL[2]).await.unwrap().record_success();

    let declared = vec![POOL[2].to_string(), POOL[2].to_string()];
    let clients = manager.clients(None, &declared, false).await;
    assert_eq!(clients.len(), 3);
    let ids: HashSet<u32> = clients.iter().map(|c| c.id()).collect();
    assert_eq!(ids.len(), clients.len());
    assert_eq!(clients[0].announce_url(), POOL[2]);
}

#[tokio::test]
async fn test_disabled_trackers_skipped() {
    let manager = TrackerManager::new(config(2)).unwrap();
    for url in &POOL[..3] {
        let client = manager.register(url).await.unwrap();
        client.record_failure("timeout");
        client.record_failure("timeout");
        assert!(!client.is_available());
    }

    let clients = manager.clients(Some("http://own.example/announce"), &[], false).await;
    let urls: Vec<&str> = clients.iter().map(|c| c.announce_url()).collect();
    assert_eq!(urls, vec!["http://own.example/announce", POOL[3]]);
}

#[tokio::test]
async fn test_enough_declared_trackers_not_supplemented() {
    let manager = TrackerManager::new(config(5)).unwrap();
    let declared: Vec<String> = (0..3).map(|i| format!("http://t{}.example/announce", i)).collect();
    let clients = manager.clients(None, &declared, false).await;
    assert_eq!(clients.len(), 3);
    assert!(clients.iter().all(|c| !POOL.contains(&c.announce_url())));
}
