//! Downloader
//!
//! Ties one torrent's registry entry, piece storage, tracker clients, DHT
//! node, local service discovery and peer connections together for the
//! `download` command.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, sleep, timeout, Duration, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::bencode;
use crate::cli::config::Config;
use crate::cli::progress::ProgressSnapshot;
use crate::dht::{announce_to, bootstrap, discover_peers, resolve_bootstrap_nodes, DhtNode};
use crate::error::TorrentError;
use crate::peer::{LsdService, PeerConnection, PeerManager, PeerSource, TorrentContext};
use crate::protocol::Handshake;
use crate::storage::{DiskBackend, PiecePicker, PieceStorage};
use crate::torrent::{MagnetLink, MagnetParser, TorrentInfo, TorrentParser, TorrentRegistry};
use crate::tracker::{AnnounceRequest, TrackerClient, TrackerEvent, TrackerManager};

const STATUS_INTERVAL: Duration = Duration::from_secs(1);
const CONNECT_INTERVAL: Duration = Duration::from_secs(2);
const TRACKER_INTERVAL: Duration = Duration::from_secs(5 * 60);
const DHT_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Overall deadline for obtaining metadata for a magnet link
const METADATA_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const METADATA_PEER_TIMEOUT: Duration = Duration::from_secs(30);
const METADATA_RETRY: Duration = Duration::from_secs(10);
/// DHT nodes learned from PORT messages pinged per round
const DHT_PINGS_PER_ROUND: usize = 8;
const HAVE_CHANNEL_CAPACITY: usize = 256;

/// What to download
#[derive(Debug, Clone)]
pub enum TorrentSource {
    /// A parsed .torrent file with the exact bytes of its info dictionary
    Metainfo { info: TorrentInfo, raw_info: Vec<u8> },
    /// A magnet link; metadata is fetched from peers
    Magnet(MagnetLink),
}

impl TorrentSource {
    /// Interpret `source` as a magnet link or a .torrent path
    pub fn load(source: &str) -> Result<Self> {
        if MagnetParser::is_magnet_link(source) {
            return Ok(TorrentSource::Magnet(MagnetParser::parse(source)?));
        }
        let data = std::fs::read(source)
            .map_err(|e| TorrentError::storage_error_full("Failed to read torrent file", source, e.to_string()))?;
        Self::from_bytes(&data)
    }

    /// Parse .torrent bytes, keeping the raw info dictionary for ut_metadata
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let info = TorrentParser::parse_bytes(data)?;
        let raw_info = bencode::raw_dict_value(data, b"info")?
            .ok_or_else(|| TorrentError::parse_error("Missing info dictionary"))?
            .to_vec();
        Ok(TorrentSource::Metainfo { info, raw_info })
    }

    pub fn info_hash(&self) -> crate::torrent::InfoHash {
        match self {
            TorrentSource::Metainfo { info, .. } => info.info_hash,
            TorrentSource::Magnet(link) => link.info_hash,
        }
    }
}

/// Drives downloads and publishes progress snapshots
#[derive(Debug)]
pub struct Downloader {
    config: Config,
    peer_id: [u8; 20],
    registry: Arc<TorrentRegistry>,
    trackers: Arc<TrackerManager>,
    status: watch::Sender<ProgressSnapshot>,
}

impl Downloader {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let trackers = TrackerManager::new(config.tracker.clone())?;
        let peer_id = Handshake::generate_peer_id();
        let (status, _) = watch::channel(ProgressSnapshot::default());
        info!("Downloader ready, peer id {}", hex::encode(peer_id));
        Ok(Self {
            config,
            peer_id,
            registry: Arc::new(TorrentRegistry::new()),
            trackers,
            status,
        })
    }

    pub fn peer_id(&self) -> [u8; 20] {
        self.peer_id
    }

    pub fn registry(&self) -> &Arc<TorrentRegistry> {
        &self.registry
    }

    /// Progress snapshots, updated about once a second while running
    pub fn subscribe(&self) -> watch::Receiver<ProgressSnapshot> {
        self.status.subscribe()
    }

    /// Download `source` until every selected piece is verified or the
    /// process is interrupted. Returns the last progress snapshot.
    pub async fn run(&self, source: TorrentSource) -> Result<ProgressSnapshot> {
        let info_hash = source.info_hash();
        let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], self.config.listen_port)))
            .await
            .map_err(|e| {
                TorrentError::network_error_full("Failed to bind peer listener", self.config.listen_port.to_string(), e.to_string())
            })?;
        let listen_port = listener.local_addr()?.port();
        info!("Accepting peers on port {}", listen_port);

        let (dht, dht_task) = match self.start_dht().await {
            Some((node, task)) => (Some(node), Some(task)),
            None => (None, None),
        };
        let peers = Arc::new(PeerManager::new(self.config.peer.max_connections));

        let (info, raw_info) = match source {
            TorrentSource::Metainfo { info, raw_info } => (info, raw_info),
            TorrentSource::Magnet(link) => {
                let raw_info = match self.fetch_metadata(&link, listen_port, &peers, dht.as_ref()).await {
                    Ok(raw_info) => raw_info,
                    Err(e) => {
                        stop_dht(dht.as_ref(), dht_task.as_ref());
                        return Err(e);
                    }
                };
                let mut info = TorrentParser::parse_info(&raw_info)?;
                info.announce_list = link.trackers.clone();
                if let Some(name) = link.display_name.as_ref().filter(|_| info.name.is_empty()) {
                    info.name = name.clone();
                }
                (info, raw_info)
            }
        };
        let session = match self.registry.register(info.clone()).await {
            Ok(session) => session,
            Err(e) => {
                stop_dht(dht.as_ref(), dht_task.as_ref());
                return Err(e);
            }
        };
        let private = session.is_private();
        if private {
            info!("Private torrent: DHT, PEX and LSD are disabled");
        }

        let storage = match self.open_storage(&info).await {
            Ok(storage) => storage,
            Err(e) => {
                self.registry.remove(&info_hash).await;
                stop_dht(dht.as_ref(), dht_task.as_ref());
                return Err(e);
            }
        };
        session.counters().set_left(storage.bytes_left().await);
        if storage.is_complete().await {
            session.set_completed(true);
        }

        let dht = if private {
            stop_dht(dht.as_ref(), dht_task.as_ref());
            None
        } else {
            dht
        };
        let dht_port = match &dht {
            Some(node) => Some(node.local_addr()?.port()),
            None => None,
        };

        let (have, _) = broadcast::channel(HAVE_CHANNEL_CAPACITY);
        let ctx = TorrentContext {
            session: Arc::clone(&session),
            storage: Arc::clone(&storage),
            picker: Arc::new(Mutex::new(PiecePicker::new(info.piece_count()))),
            peers: Arc::clone(&peers),
            peer_id: self.peer_id,
            listen_port,
            dht_port,
            metadata: Some(Arc::new(raw_info)),
            have,
            config: self.config.peer.clone(),
        };

        let clients = if self.config.tracker.enabled {
            self.trackers.clients(info.announce.as_deref(), &info.announce_list, private).await
        } else {
            Vec::new()
        };
        info!("Using {} trackers for {}", clients.len(), info.name);

        let mut tasks = JoinSet::new();
        tasks.spawn(accept_loop(listener, ctx.clone(), Arc::clone(&self.registry)));
        tasks.spawn(connect_loop(ctx.clone()));
        if !clients.is_empty() {
            tasks.spawn(tracker_loop(Arc::clone(&self.trackers), clients.clone(), ctx.clone(), self.config.tracker.numwant));
        }
        if let Some(node) = &dht {
            tasks.spawn(dht_loop(Arc::clone(node), ctx.clone()));
        }
        if self.config.peer.lsd_enabled && !private {
            match LsdService::new(listen_port).await {
                Ok(lsd) => {
                    tasks.spawn(lsd_loop(lsd, ctx.clone()));
                }
                Err(e) => warn!("Local service discovery unavailable: {}", e),
            }
        }

        let summary = self.wait_for_completion(&ctx).await;

        tasks.shutdown().await;
        stop_dht(dht.as_ref(), dht_task.as_ref());
        if !clients.is_empty() {
            let event = if session.is_completed() {
                TrackerEvent::Completed
            } else {
                TrackerEvent::Stopped
            };
            let request = announce_request(&ctx, event, 0);
            self.trackers.find_peers(&clients, &request).await;
        }
        self.registry.remove(&info_hash).await;
        let stats = ctx.picker.lock().await.stats().clone();
        debug!(
            "Picker: {} pieces verified, {} failed, {} blocks received",
            stats.pieces_verified, stats.pieces_failed, stats.blocks_received
        );
        info!(
            "Finished {}: {} downloaded, {} uploaded, {} bytes left",
            summary.name, summary.downloaded, summary.uploaded, summary.left
        );
        Ok(summary)
    }

    async fn start_dht(&self) -> Option<(Arc<DhtNode>, JoinHandle<()>)> {
        if !self.config.dht.enabled {
            return None;
        }
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.dht.port));
        match DhtNode::bind(addr, self.config.dht.clone()).await {
            Ok(node) => {
                let task = node.start();
                Some((node, task))
            }
            Err(e) => {
                warn!("DHT disabled, bind to {} failed: {}", addr, e);
                None
            }
        }
    }

    async fn open_storage(&self, info: &TorrentInfo) -> Result<Arc<PieceStorage>> {
        let backend = Arc::new(DiskBackend::new(&self.config.storage.output_dir));
        let mut storage = PieceStorage::new(info, backend);
        storage.set_reconcile_prefix(self.config.storage.reconcile_prefix);
        if !self.config.storage.selected_files.is_empty() {
            storage.select_files(&self.config.storage.selected_files).await?;
        }
        storage.allocate().await?;
        let recovered = storage.reconcile().await?;
        if recovered > 0 {
            info!("Recovered {} verified pieces from disk", recovered);
        }
        Ok(Arc::new(storage))
    }

    /// Ask peers found through trackers and the DHT for the info dictionary
    async fn fetch_metadata(
        &self,
        link: &MagnetLink,
        listen_port: u16,
        peers: &Arc<PeerManager>,
        dht: Option<&Arc<DhtNode>>,
    ) -> Result<Vec<u8>> {
        info!("Fetching metadata for {}", link.info_hash);
        let clients = if self.config.tracker.enabled {
            self.trackers.clients(None, &link.trackers, false).await
        } else {
            Vec::new()
        };
        let mut request = AnnounceRequest::new(link.info_hash, self.peer_id, listen_port);
        request.event = TrackerEvent::Started;
        request.left = link.total_size.unwrap_or(1);
        request.numwant = self.config.tracker.numwant;

        let deadline = Instant::now() + METADATA_TIMEOUT;
        let mut bootstrapped = false;
        loop {
            if Instant::now() >= deadline {
                return Err(TorrentError::peer_error("Timed out fetching metadata").into());
            }

            if !clients.is_empty() {
                let found = self.trackers.find_peers(&clients, &request).await;
                peers.add_peers(found, PeerSource::Tracker).await;
                request.event = TrackerEvent::None;
            }
            if let Some(node) = dht {
                if !bootstrapped {
                    let routers = resolve_bootstrap_nodes(&node.config().bootstrap_nodes).await;
                    bootstrapped = bootstrap(node, &routers).await.is_ok();
                }
                match discover_peers(node, link.info_hash).await {
                    Ok(lookup) => {
                        peers.add_peers(lookup.peers, PeerSource::Dht).await;
                    }
                    Err(e) => debug!("DHT lookup for metadata failed: {}", e),
                }
            }

            let mut attempts = JoinSet::new();
            let mut launched = Vec::new();
            for addr in peers.candidates().await {
                if !peers.mark_connecting(addr).await {
                    continue;
                }
                launched.push(addr);
                let (info_hash, peer_id, config) = (link.info_hash, self.peer_id, self.config.peer.clone());
                let dht_enabled = dht.is_some();
                attempts.spawn(async move {
                    let fetched = timeout(METADATA_PEER_TIMEOUT, async {
                        let conn = PeerConnection::connect(addr, PeerSource::Tracker, info_hash, peer_id, dht_enabled, &config).await?;
                        conn.fetch_metadata().await
                    })
                    .await
                    .unwrap_or_else(|_| Err(TorrentError::peer_error_with_peer("Metadata exchange timed out", addr.to_string()).into()));
                    (addr, fetched)
                });
            }
            debug!("Asking {} peers for metadata", launched.len());

            while let Some(joined) = attempts.join_next().await {
                match joined {
                    Ok((addr, Ok(raw))) => {
                        info!("Received {} bytes of metadata from {}", raw.len(), addr);
                        attempts.shutdown().await;
                        for other in launched {
                            peers.disconnected(other, false, None).await;
                        }
                        return Ok(raw);
                    }
                    Ok((addr, Err(e))) => {
                        debug!("Metadata from {} failed: {}", addr, e);
                        peers.disconnected(addr, true, None).await;
                    }
                    Err(e) => error!("Metadata task failed: {}", e),
                }
            }
            sleep(METADATA_RETRY).await;
        }
    }

    async fn wait_for_completion(&self, ctx: &TorrentContext) -> ProgressSnapshot {
        let mut ticker = interval(STATUS_INTERVAL);
        let interrupted = tokio::signal::ctrl_c();
        tokio::pin!(interrupted);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snapshot = snapshot(ctx).await;
                    let complete = snapshot.complete;
                    self.status.send_replace(snapshot.clone());
                    if complete {
                        info!("All selected pieces verified");
                        return snapshot;
                    }
                }
                _ = &mut interrupted => {
                    info!("Interrupted, shutting down");
                    let snapshot = snapshot(ctx).await;
                    self.status.send_replace(snapshot.clone());
                    return snapshot;
                }
            }
        }
    }
}

fn stop_dht(node: Option<&Arc<DhtNode>>, task: Option<&JoinHandle<()>>) {
    if let Some(node) = node {
        node.stop();
    }
    if let Some(task) = task {
        task.abort();
    }
}

/// Current progress of the torrent behind `ctx`
pub async fn snapshot(ctx: &TorrentContext) -> ProgressSnapshot {
    let (uploaded, downloaded, _) = ctx.session.counters().snapshot();
    let selected = ctx.storage.selected_pieces().await;
    let needed = ctx.storage.needed_pieces().await;
    let wanted = selected
        .ones()
        .filter_map(|index| ctx.storage.piece_size(index as u32))
        .map(u64::from)
        .sum();
    let left = ctx.storage.bytes_left().await;
    ctx.session.counters().set_left(left);
    ProgressSnapshot {
        name: ctx.session.info().name.clone(),
        downloaded,
        uploaded,
        left,
        wanted,
        pieces_done: selected.count().saturating_sub(needed.count()),
        pieces_wanted: selected.count(),
        peers_known: ctx.peers.peer_count().await,
        peers_active: ctx.peers.active_count().await,
        complete: ctx.session.is_completed() || ctx.storage.is_complete().await,
    }
}

fn announce_request(ctx: &TorrentContext, event: TrackerEvent, numwant: u32) -> AnnounceRequest {
    let (uploaded, downloaded, left) = ctx.session.counters().snapshot();
    let mut request = AnnounceRequest::new(ctx.info_hash(), ctx.peer_id, ctx.listen_port);
    request.uploaded = uploaded;
    request.downloaded = downloaded;
    request.left = left;
    request.event = event;
    request.numwant = numwant;
    request
}

async fn accept_loop(listener: TcpListener, ctx: TorrentContext, registry: Arc<TorrentRegistry>) {
    let mut sessions = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                };
                if !ctx.peers.can_accept().await {
                    debug!("Refusing {}, connection limit reached", addr);
                    continue;
                }
                let ctx = ctx.clone();
                let registry = Arc::clone(&registry);
                sessions.spawn(async move {
                    let known = registry.info_hashes().await;
                    let dht = ctx.dht_port.is_some();
                    match PeerConnection::inbound(stream, addr, &known, ctx.peer_id, dht, &ctx.config).await {
                        Ok(conn) if conn.info_hash() == ctx.info_hash() => {
                            if let Err(e) = conn.run(ctx).await {
                                debug!("Incoming peer {} dropped: {}", addr, e);
                            }
                        }
                        Ok(conn) => debug!("Incoming peer {} wants {}, not ours", addr, conn.info_hash()),
                        Err(e) => debug!("Incoming handshake from {} failed: {}", addr, e),
                    }
                });
            }
            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
        }
    }
}

async fn connect_loop(ctx: TorrentContext) {
    let mut ticker = interval(CONNECT_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut sessions = JoinSet::new();
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for addr in ctx.peers.candidates().await {
                    if !ctx.peers.mark_connecting(addr).await {
                        continue;
                    }
                    let ctx = ctx.clone();
                    sessions.spawn(outbound_session(addr, ctx));
                }
            }
            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
        }
    }
}

async fn outbound_session(addr: SocketAddr, ctx: TorrentContext) {
    let source = ctx.peers.get(addr).await.map(|p| p.source).unwrap_or(PeerSource::Tracker);
    let dht = ctx.dht_port.is_some();
    match PeerConnection::connect(addr, source, ctx.info_hash(), ctx.peer_id, dht, &ctx.config).await {
        Ok(conn) => {
            if let Err(e) = conn.run(ctx).await {
                debug!("Peer {} dropped: {}", addr, e);
            }
        }
        Err(e) => {
            debug!("Could not connect to {}: {}", addr, e);
            ctx.peers.disconnected(addr, true, None).await;
        }
    }
}

async fn tracker_loop(trackers: Arc<TrackerManager>, clients: Vec<Arc<TrackerClient>>, ctx: TorrentContext, numwant: u32) {
    let mut ticker = interval(TRACKER_INTERVAL);
    let mut event = TrackerEvent::Started;
    let mut completed_sent = ctx.session.is_completed();
    loop {
        ticker.tick().await;
        if !completed_sent && ctx.session.is_completed() {
            event = TrackerEvent::Completed;
            completed_sent = true;
        }
        let request = announce_request(&ctx, event, numwant);
        let found = trackers.find_peers(&clients, &request).await;
        let added = ctx.peers.add_peers(found, PeerSource::Tracker).await;
        debug!("Tracker announce ({}) added {} peers", event, added);
        event = TrackerEvent::None;
    }
}

async fn dht_loop(node: Arc<DhtNode>, ctx: TorrentContext) {
    let routers = resolve_bootstrap_nodes(&node.config().bootstrap_nodes).await;
    match bootstrap(&node, &routers).await {
        Ok(count) => info!("DHT bootstrapped with {} nodes", count),
        Err(e) => warn!("DHT bootstrap failed: {}", e),
    }

    let mut ticker = interval(DHT_INTERVAL);
    loop {
        ticker.tick().await;
        for addr in ctx.peers.dht_nodes().await.into_iter().take(DHT_PINGS_PER_ROUND) {
            node.ping(addr).await;
        }
        match discover_peers(&node, ctx.info_hash()).await {
            Ok(lookup) => {
                let added = ctx.peers.add_peers(lookup.peers.iter().copied(), PeerSource::Dht).await;
                debug!("DHT lookup added {} peers", added);
                announce_to(&node, &lookup, ctx.info_hash(), ctx.listen_port).await;
            }
            Err(e) => debug!("DHT lookup failed: {}", e),
        }
    }
}

async fn lsd_loop(lsd: LsdService, ctx: TorrentContext) {
    let mut heard = lsd.subscribe();
    let info_hash = ctx.info_hash();
    let listen = async {
        loop {
            match heard.recv().await {
                Ok(announce) if announce.info_hash == info_hash => {
                    ctx.peers.add_peer(announce.peer_addr(), PeerSource::Lsd).await;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => debug!("Missed {} LSD announces", skipped),
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    };
    tokio::select! {
        _ = lsd.run(vec![info_hash]) => warn!("Local service discovery stopped"),
        _ = listen => {}
    }
}
