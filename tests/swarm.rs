//! Two peers, each holding half of a torrent, trade pieces until both are
//! complete.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rust_torrent_engine::cli::PeerConfig;
use rust_torrent_engine::{
    CryptoPolicy, MemoryBackend, PeerConnection, PeerManager, PeerSource, PiecePicker, PieceStorage, TorrentContext,
    TorrentInfo, TorrentParser, TorrentSession,
};
use sha1::{Digest, Sha1};
use tokio::io::duplex;
use tokio::sync::{broadcast, Mutex};

const PIECE_LENGTH: usize = 16384;

fn content() -> Vec<u8> {
    (0..PIECE_LENGTH + 8192).map(|i| (i % 251) as u8).collect()
}

fn torrent(data: &[u8]) -> (TorrentInfo, Vec<u8>) {
    let mut raw = format!(
        "d6:lengthi{}e4:name5:swarm12:piece lengthi{}e6:pieces40:",
        data.len(),
        PIECE_LENGTH
    )
    .into_bytes();
    for chunk in data.chunks(PIECE_LENGTH) {
        let digest: [u8; 20] = Sha1::digest(chunk).into();
        raw.extend_from_slice(&digest);
    }
    raw.push(b'e');
    (TorrentParser::parse_info(&raw).unwrap(), raw)
}

async fn seeded_context(info: &TorrentInfo, raw: &[u8], data: &[u8], piece: u32, peer_id: [u8; 20], crypto: CryptoPolicy) -> TorrentContext {
    let storage = PieceStorage::new(info, Arc::new(MemoryBackend::new()));
    let start = piece as usize * PIECE_LENGTH;
    let end = (start + PIECE_LENGTH).min(data.len());
    storage.write(piece, 0, &data[start..end]).await.unwrap();
    assert!(storage.verify(piece).await.unwrap());

    let session = Arc::new(TorrentSession::new(info.clone()));
    session.counters().set_left(storage.bytes_left().await);
    let (have, _) = broadcast::channel(16);
    TorrentContext {
        session,
        storage: Arc::new(storage),
        picker: Arc::new(Mutex::new(PiecePicker::new(info.piece_count()))),
        peers: Arc::new(PeerManager::new(8)),
        peer_id,
        listen_port: 6881,
        dht_port: None,
        metadata: Some(Arc::new(raw.to_vec())),
        have,
        config: PeerConfig {
            crypto,
            ..PeerConfig::default()
        },
    }
}

async fn trade(crypto: CryptoPolicy) {
    let data = content();
    let (info, raw) = torrent(&data);
    assert_eq!(info.piece_count(), 2);

    let left = seeded_context(&info, &raw, &data, 0, [1u8; 20], crypto).await;
    let right = seeded_context(&info, &raw, &data, 1, [2u8; 20], crypto).await;
    assert!(!left.storage.is_complete().await);
    assert!(!right.storage.is_complete().await);

    let left_addr: SocketAddr = "10.0.0.1:6881".parse().unwrap();
    let right_addr: SocketAddr = "10.0.0.2:6881".parse().unwrap();
    let known = [info.info_hash];
    let (a, b) = duplex(256 * 1024);
    let (outbound, inbound) = tokio::join!(
        PeerConnection::outbound(a, right_addr, PeerSource::Tracker, info.info_hash, left.peer_id, false, &left.config),
        PeerConnection::inbound(b, left_addr, &known, right.peer_id, false, &right.config),
    );
    let outbound = outbound.unwrap();
    let inbound = inbound.unwrap();
    assert_eq!(outbound.is_encrypted(), crypto == CryptoPolicy::Encrypt);

    let (left_stats, right_stats) = tokio::time::timeout(
        Duration::from_secs(20),
        async { tokio::join!(outbound.run(left.clone()), inbound.run(right.clone())) },
    )
    .await
    .unwrap();
    let left_stats = left_stats.unwrap();
    let right_stats = right_stats.unwrap();

    assert!(left.storage.is_complete().await);
    assert!(right.storage.is_complete().await);
    assert!(left.session.is_completed());
    assert!(right.session.is_completed());
    assert_eq!(left_stats.downloaded, 8192);
    assert_eq!(right_stats.downloaded, PIECE_LENGTH as u64);

    for ctx in [&left, &right] {
        let first = ctx.storage.read(0, 0, PIECE_LENGTH as u32).await.unwrap().unwrap();
        let second = ctx.storage.read(1, 0, 8192).await.unwrap().unwrap();
        assert_eq!(first, &data[..PIECE_LENGTH]);
        assert_eq!(second, &data[PIECE_LENGTH..]);
        assert_eq!(ctx.storage.bytes_left().await, 0);
    }

    let (uploaded, downloaded, _) = left.session.counters().snapshot();
    assert_eq!((uploaded, downloaded), (PIECE_LENGTH as u64, 8192));
}

#[tokio::test]
async fn test_two_peers_complete_in_plaintext() {
    trade(CryptoPolicy::Plaintext).await;
}

#[tokio::test]
async fn test_two_peers_complete_encrypted() {
    trade(CryptoPolicy::Encrypt).await;
}
