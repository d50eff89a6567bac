//! Peer connection module
//!
//! Drives one peer link: MSE or plaintext establishment, the 68-byte
//! handshake, then the message loop that exchanges bitfields, pipelines
//! block requests, serves reads from storage and announces verified pieces.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex};
use tokio::time::{interval, timeout, Duration, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::cli::config::PeerConfig;
use crate::error::{ErrorKind, TorrentError};
use crate::peer::manager::PeerManager;
use crate::peer::state::{PeerSession, PeerSource, PeerState, PeerStats};
use crate::protocol::extension::{metadata_slice, UT_METADATA, UT_METADATA_ID, UT_PEX, UT_PEX_ID};
use crate::protocol::{
    CodecStack, CryptoPolicy, ExtendedHandshake, ExtensionMessage, Handshake, Message, MetadataAssembler,
    MetadataMessage, MseHandshake, PexMessage, WireEvent,
};
use crate::storage::{Bitfield, BlockRequest, PiecePicker, PieceStorage};
use crate::torrent::{InfoHash, TorrentSession};

/// Largest block a peer may ask for
pub const MAX_REQUEST_LENGTH: u32 = 128 * 1024;
/// Peers listed in one outgoing PEX message
const MAX_PEX_PEERS: usize = 50;

/// Everything a connection needs to take part in one torrent
#[derive(Debug, Clone)]
pub struct TorrentContext {
    pub session: Arc<TorrentSession>,
    pub storage: Arc<PieceStorage>,
    pub picker: Arc<Mutex<PiecePicker>>,
    pub peers: Arc<PeerManager>,
    pub peer_id: [u8; 20],
    pub listen_port: u16,
    /// Advertised with a PORT message when set
    pub dht_port: Option<u16>,
    /// Raw info dictionary served over ut_metadata
    pub metadata: Option<Arc<Vec<u8>>>,
    /// Verified piece indices, fanned out to every connection
    pub have: broadcast::Sender<u32>,
    pub config: PeerConfig,
}

impl TorrentContext {
    pub fn info_hash(&self) -> InfoHash {
        self.session.info_hash()
    }
}

/// An established connection to one peer
pub struct PeerConnection<S> {
    addr: SocketAddr,
    stream: S,
    codec: CodecStack,
    info_hash: InfoHash,
    session: PeerSession,
    remote_extensions: Option<ExtendedHandshake>,
    in_flight: HashSet<BlockRequest>,
    /// Our pieces as this peer has been told about them
    local: Bitfield,
    last_sent: Instant,
    last_received: Instant,
}

impl<S> std::fmt::Debug for PeerConnection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("addr", &self.addr)
            .field("info_hash", &self.info_hash)
            .field("encrypted", &self.codec.is_encrypted())
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}

impl PeerConnection<TcpStream> {
    /// Dial `addr`. With the prefer-encrypt policy a failed MSE attempt is
    /// retried once over a fresh plaintext connection.
    pub async fn connect(
        addr: SocketAddr,
        source: PeerSource,
        info_hash: InfoHash,
        peer_id: [u8; 20],
        dht: bool,
        config: &PeerConfig,
    ) -> Result<Self> {
        let stream = Self::dial(addr, config).await?;
        match Self::establish(stream, addr, source, info_hash, peer_id, dht, config.crypto, config).await {
            Ok(conn) => Ok(conn),
            Err(e) if config.crypto == CryptoPolicy::PreferEncrypt => {
                debug!("Encrypted handshake with {} failed ({}), retrying in plaintext", addr, e);
                let stream = Self::dial(addr, config).await?;
                Self::establish(stream, addr, source, info_hash, peer_id, dht, CryptoPolicy::Plaintext, config).await
            }
            Err(e) => Err(e),
        }
    }

    async fn dial(addr: SocketAddr, config: &PeerConfig) -> Result<TcpStream> {
        let stream = timeout(config.handshake_timeout(), TcpStream::connect(addr))
            .await
            .map_err(|_| TorrentError::peer_error_with_peer("Connection timed out", addr.to_string()))?
            .map_err(|e| TorrentError::peer_error_full("Connection failed", addr.to_string(), e.to_string()))?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

impl<S> PeerConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Outbound establishment over an already connected stream
    pub async fn outbound(
        stream: S,
        addr: SocketAddr,
        source: PeerSource,
        info_hash: InfoHash,
        peer_id: [u8; 20],
        dht: bool,
        config: &PeerConfig,
    ) -> Result<Self> {
        Self::establish(stream, addr, source, info_hash, peer_id, dht, config.crypto, config).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn establish(
        mut stream: S,
        addr: SocketAddr,
        source: PeerSource,
        info_hash: InfoHash,
        peer_id: [u8; 20],
        dht: bool,
        policy: CryptoPolicy,
        config: &PeerConfig,
    ) -> Result<Self> {
        let mut codec = if policy.initiates_encrypted() {
            let outcome = timeout(
                config.handshake_timeout(),
                MseHandshake::new(policy).initiate(&mut stream, info_hash),
            )
            .await
            .map_err(|_| TorrentError::peer_error_with_peer("MSE handshake timed out", addr.to_string()))??;
            let mut codec = CodecStack::with_max_length(outcome.cipher, config.max_message_length);
            codec.feed_plaintext(&outcome.initial_payload);
            codec.feed(&outcome.remainder);
            codec
        } else {
            CodecStack::with_max_length(None, config.max_message_length)
        };

        let ours = Handshake::with_extensions(info_hash, peer_id, dht);
        codec.write_event(&mut stream, &WireEvent::Handshake(ours)).await?;
        let theirs = Self::read_handshake(&mut codec, &mut stream, addr, config).await?;
        if !theirs.validate(&info_hash) {
            return Err(TorrentError::peer_error_full(
                "Info hash mismatch in handshake",
                addr.to_string(),
                theirs.info_hash.to_hex(),
            )
            .into());
        }
        Self::finish(stream, codec, addr, source, info_hash, peer_id, theirs)
    }

    /// Accept an incoming connection for one of the `known` torrents
    pub async fn inbound(
        mut stream: S,
        addr: SocketAddr,
        known: &[InfoHash],
        peer_id: [u8; 20],
        dht: bool,
        config: &PeerConfig,
    ) -> Result<Self> {
        let outcome = timeout(
            config.handshake_timeout(),
            MseHandshake::new(config.crypto).respond(&mut stream, known),
        )
        .await
        .map_err(|_| TorrentError::peer_error_with_peer("MSE handshake timed out", addr.to_string()))??;

        let mut codec = CodecStack::with_max_length(outcome.cipher, config.max_message_length);
        codec.feed_plaintext(&outcome.initial_payload);
        codec.feed(&outcome.remainder);

        let theirs = Self::read_handshake(&mut codec, &mut stream, addr, config).await?;
        let info_hash = theirs.info_hash;
        let identified = outcome.info_hash.map(|h| h == info_hash).unwrap_or(true);
        if !identified || !known.contains(&info_hash) {
            warn!("Incoming peer {} asked for unknown torrent {}", addr, info_hash);
            return Err(TorrentError::peer_error_full(
                "Unknown torrent requested",
                addr.to_string(),
                info_hash.to_hex(),
            )
            .into());
        }
        let ours = Handshake::with_extensions(info_hash, peer_id, dht);
        codec.write_event(&mut stream, &WireEvent::Handshake(ours)).await?;
        Self::finish(stream, codec, addr, PeerSource::Incoming, info_hash, peer_id, theirs)
    }

    async fn read_handshake(
        codec: &mut CodecStack,
        stream: &mut S,
        addr: SocketAddr,
        config: &PeerConfig,
    ) -> Result<Handshake> {
        let event = timeout(config.handshake_timeout(), codec.read_event(stream))
            .await
            .map_err(|_| TorrentError::peer_error_with_peer("Handshake timed out", addr.to_string()))??;
        match event {
            WireEvent::Handshake(handshake) => Ok(handshake),
            WireEvent::Message(message) => Err(TorrentError::protocol_error_with_source(
                "Expected handshake",
                format!("{:?}", message.message_id()),
            )
            .into()),
        }
    }

    fn finish(
        stream: S,
        codec: CodecStack,
        addr: SocketAddr,
        source: PeerSource,
        info_hash: InfoHash,
        peer_id: [u8; 20],
        theirs: Handshake,
    ) -> Result<Self> {
        if theirs.peer_id == peer_id {
            return Err(TorrentError::peer_error_with_peer("Connected to ourselves", addr.to_string()).into());
        }
        let mut session = PeerSession::new(addr, source);
        session.handshake_received(&theirs);
        session.encrypted = codec.is_encrypted();
        info!(
            "Handshake with {} complete (peer id {}, {})",
            addr,
            hex::encode(theirs.peer_id),
            if session.encrypted { "rc4" } else { "plaintext" }
        );
        let now = Instant::now();
        Ok(Self {
            addr,
            stream,
            codec,
            info_hash,
            session,
            remote_extensions: None,
            in_flight: HashSet::new(),
            local: Bitfield::default(),
            last_sent: now,
            last_received: now,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    pub fn session(&self) -> &PeerSession {
        &self.session
    }

    pub fn is_encrypted(&self) -> bool {
        self.codec.is_encrypted()
    }

    async fn send(&mut self, message: Message) -> Result<()> {
        trace!("-> {}: {:?}", self.addr, message.message_id());
        self.codec.write_message(&mut self.stream, message).await?;
        self.last_sent = Instant::now();
        Ok(())
    }

    async fn send_extension(&mut self, message: ExtensionMessage) -> Result<()> {
        let Some(remote) = self.remote_extensions.as_ref() else {
            return Ok(());
        };
        let wire = message.to_message(remote)?;
        self.send(wire).await
    }

    /// Download the info dictionary over ut_metadata. Used for magnet links
    /// before the torrent's pieces are known.
    pub async fn fetch_metadata(mut self) -> Result<Vec<u8>> {
        if !self.session.supports_extension_protocol() {
            return Err(TorrentError::peer_error_with_peer("Peer lacks the extension protocol", self.addr.to_string()).into());
        }
        let local = ExtendedHandshake::local(None, 0);
        self.send(Message::Extended {
            id: 0,
            payload: local.encode()?,
        })
        .await?;

        let mut assembler: Option<MetadataAssembler> = None;
        loop {
            let event = self.codec.read_event(&mut self.stream).await?;
            let WireEvent::Message(Message::Extended { id, payload }) = event else {
                continue;
            };
            match id {
                0 => {
                    let remote = ExtendedHandshake::decode(&payload)?;
                    let size = remote
                        .metadata_size
                        .filter(|_| remote.supports(UT_METADATA))
                        .ok_or_else(|| {
                            TorrentError::peer_error_with_peer("Peer cannot serve metadata", self.addr.to_string())
                        })?;
                    let size = usize::try_from(size)
                        .map_err(|_| TorrentError::protocol_error("Negative metadata size"))?;
                    let mut fresh = MetadataAssembler::new(self.info_hash, size)?;
                    self.remote_extensions = Some(remote);
                    for piece in fresh.missing() {
                        self.send_extension(ExtensionMessage::Metadata(MetadataMessage::Request { piece }))
                            .await?;
                    }
                    if fresh.is_complete() {
                        return fresh.finish();
                    }
                    assembler = Some(fresh);
                }
                UT_METADATA_ID => {
                    let Some(assembler) = assembler.as_mut() else { continue };
                    match MetadataMessage::decode(&payload)? {
                        MetadataMessage::Data { piece, total_size, data } => {
                            if assembler.insert(piece, total_size, data)? {
                                info!("Fetched metadata for {} from {}", self.info_hash, self.addr);
                                return assembler.finish();
                            }
                        }
                        MetadataMessage::Reject { piece } => {
                            return Err(TorrentError::peer_error_full(
                                "Metadata request rejected",
                                self.addr.to_string(),
                                format!("piece {}", piece),
                            )
                            .into());
                        }
                        MetadataMessage::Request { piece } => {
                            self.send_extension(ExtensionMessage::Metadata(MetadataMessage::Reject { piece }))
                                .await?;
                        }
                    }
                }
                _ => trace!("Ignoring extended message {} while fetching metadata", id),
            }
        }
    }

    /// Run the message loop until either side closes or both are seeds
    pub async fn run(mut self, ctx: TorrentContext) -> Result<PeerStats> {
        let piece_count = ctx.storage.piece_count();
        let mut have_rx = ctx.have.subscribe();
        self.local = ctx.storage.completed_pieces().await;
        self.session.bitfield = Some(Bitfield::new(piece_count));
        ctx.peers.connected(&self.session).await;

        let result = self.session_loop(&ctx, piece_count, &mut have_rx).await;

        let stats = self.session.stats;
        {
            let mut picker = ctx.picker.lock().await;
            picker.release_peer(self.addr);
            if let Some(bits) = self.session.bitfield.as_ref() {
                picker.remove_peer_pieces(bits);
            }
        }
        ctx.peers.disconnected(self.addr, result.is_err(), Some(stats)).await;
        if let Err(e) = &result {
            // Malformed traffic is never retried
            if TorrentError::kind_of(e) == ErrorKind::ProtocolViolation {
                ctx.peers.update(self.addr, |p| p.state = PeerState::Banned).await;
            }
        }
        match result {
            Ok(()) => {
                debug!("Session with {} finished", self.addr);
                Ok(stats)
            }
            Err(e) => {
                debug!("Session with {} ended: {}", self.addr, e);
                Err(e)
            }
        }
    }

    async fn session_loop(
        &mut self,
        ctx: &TorrentContext,
        piece_count: usize,
        have_rx: &mut broadcast::Receiver<u32>,
    ) -> Result<()> {
        if self.session.supports_extension_protocol() {
            let local = ExtendedHandshake::local(ctx.metadata.as_ref().map(|m| m.len()), ctx.listen_port);
            self.send(Message::Extended {
                id: 0,
                payload: local.encode()?,
            })
            .await?;
        }
        if !self.local.none_set() {
            let bitfield = self.local.as_bytes().to_vec();
            self.send(Message::Bitfield { bitfield }).await?;
        }
        if let Some(port) = ctx.dht_port.filter(|_| self.session.supports_dht() && !ctx.session.is_private()) {
            self.send(Message::Port { listen_port: port }).await?;
        }

        let mut tick = interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if self.finished(ctx).await {
                return Ok(());
            }
            tokio::select! {
                event = self.codec.read_event(&mut self.stream) => {
                    match event {
                        Ok(WireEvent::Message(message)) => {
                            self.last_received = Instant::now();
                            self.handle_message(ctx, piece_count, message).await?;
                        }
                        Ok(WireEvent::Handshake(_)) => {
                            return Err(TorrentError::protocol_error("Second handshake received").into());
                        }
                        Err(e) => {
                            if self.finished(ctx).await {
                                trace!("Seed {} closed: {}", self.addr, e);
                                return Ok(());
                            }
                            return Err(e);
                        }
                    }
                }
                index = have_rx.recv() => {
                    match index {
                        Ok(index) => self.announce_piece(ctx, index).await?,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!("Have channel lagged by {} for {}", skipped, self.addr);
                            self.resync_local(ctx).await?;
                        }
                        Err(broadcast::error::RecvError::Closed) => return Ok(()),
                    }
                }
                _ = tick.tick() => self.on_tick(ctx).await?,
            }
        }
    }

    /// Both sides hold every piece we care about
    async fn finished(&self, ctx: &TorrentContext) -> bool {
        self.session.is_seed() && ctx.storage.is_complete().await
    }

    async fn on_tick(&mut self, ctx: &TorrentContext) -> Result<()> {
        let keep_alive = ctx.config.keep_alive();
        if self.last_received.elapsed() > keep_alive * 2 {
            return Err(TorrentError::peer_error_with_peer("Peer went silent", self.addr.to_string()).into());
        }
        let expired = ctx.picker.lock().await.expire_for(self.addr, ctx.config.request_timeout());
        for block in expired {
            self.in_flight.remove(&block);
        }
        self.fill_requests(ctx).await?;
        if self.last_sent.elapsed() >= keep_alive {
            self.send(Message::KeepAlive).await?;
        }
        Ok(())
    }

    async fn handle_message(&mut self, ctx: &TorrentContext, piece_count: usize, message: Message) -> Result<()> {
        trace!("<- {}: {:?}", self.addr, message.message_id());
        match message {
            Message::KeepAlive => {}
            Message::Choke => {
                self.session.flags.peer_choking = true;
                // Outstanding requests are discarded by a choking peer
                ctx.picker.lock().await.release_peer(self.addr);
                self.in_flight.clear();
            }
            Message::Unchoke => {
                self.session.flags.peer_choking = false;
                self.fill_requests(ctx).await?;
            }
            Message::Interested => {
                self.session.flags.peer_interested = true;
                if self.session.flags.am_choking {
                    self.session.flags.am_choking = false;
                    self.send(Message::Unchoke).await?;
                }
            }
            Message::NotInterested => {
                self.session.flags.peer_interested = false;
            }
            Message::Have { piece_index } => {
                if piece_index as usize >= piece_count {
                    return Err(TorrentError::protocol_error_with_source(
                        "Have index out of range",
                        piece_index.to_string(),
                    )
                    .into());
                }
                let fresh = self
                    .session
                    .bitfield
                    .get_or_insert_with(|| Bitfield::new(piece_count))
                    .set(piece_index as usize);
                if fresh {
                    ctx.picker.lock().await.add_have(piece_index);
                }
                self.update_interest(ctx).await?;
                self.fill_requests(ctx).await?;
            }
            Message::Bitfield { bitfield } => {
                let field = Bitfield::from_bytes(&bitfield, piece_count)?;
                {
                    let mut picker = ctx.picker.lock().await;
                    if let Some(old) = self.session.bitfield.as_ref() {
                        picker.remove_peer_pieces(old);
                    }
                    picker.add_peer_pieces(&field);
                }
                debug!("{} has {}/{} pieces", self.addr, field.count(), piece_count);
                self.session.bitfield = Some(field);
                self.update_interest(ctx).await?;
                self.fill_requests(ctx).await?;
            }
            Message::Request { index, begin, length } => {
                self.serve_request(ctx, piece_count, index, begin, length).await?;
            }
            Message::Piece { index, begin, block } => {
                self.receive_block(ctx, index, begin, block).await?;
            }
            Message::Cancel { index, begin, .. } => {
                // Requests are answered as they arrive, nothing is queued
                trace!("{} cancelled block {}:{}", self.addr, index, begin);
            }
            Message::Port { listen_port } => {
                self.session.dht_port = Some(listen_port);
                ctx.peers.update(self.addr, |p| p.dht_port = Some(listen_port)).await;
            }
            Message::Extended { id, payload } => self.handle_extended(ctx, id, payload).await?,
        }
        Ok(())
    }

    async fn serve_request(
        &mut self,
        ctx: &TorrentContext,
        piece_count: usize,
        index: u32,
        begin: u32,
        length: u32,
    ) -> Result<()> {
        if index as usize >= piece_count || length == 0 || length > MAX_REQUEST_LENGTH {
            return Err(TorrentError::protocol_error_with_source(
                "Invalid block request",
                format!("piece {} offset {} length {}", index, begin, length),
            )
            .into());
        }
        if self.session.flags.am_choking || !self.local.get(index as usize) {
            trace!("Ignoring request for {}:{} from {}", index, begin, self.addr);
            return Ok(());
        }
        let Some(block) = ctx.storage.read(index, begin, length).await? else {
            return Ok(());
        };
        let sent = block.len();
        self.send(Message::Piece { index, begin, block }).await?;
        self.session.record_upload(sent);
        ctx.session.counters().add_uploaded(sent as u64);
        Ok(())
    }

    async fn receive_block(&mut self, ctx: &TorrentContext, index: u32, begin: u32, block: Vec<u8>) -> Result<()> {
        let length = u32::try_from(block.len()).map_err(|_| TorrentError::protocol_error("Block too large"))?;
        let request = BlockRequest::new(index, begin, length);
        self.in_flight.remove(&request);
        ctx.storage.write(index, begin, &block).await?;
        self.session.record_download(block.len());
        ctx.session.counters().add_downloaded(block.len() as u64);

        let complete = {
            let mut picker = ctx.picker.lock().await;
            picker.block_received(&request);
            picker.piece_received(index)
        };
        if complete {
            if ctx.storage.verify(index).await? {
                ctx.picker.lock().await.piece_verified(index);
                self.session.stats.pieces_verified += 1;
                ctx.session.counters().set_left(ctx.storage.bytes_left().await);
                info!("Piece {} verified (from {})", index, self.addr);
                let _ = ctx.have.send(index);
                self.announce_piece(ctx, index).await?;
                if ctx.storage.is_complete().await && !ctx.session.is_completed() {
                    ctx.session.set_completed(true);
                    info!("Torrent {} complete", ctx.info_hash());
                }
            } else {
                ctx.picker.lock().await.piece_failed(index);
                self.session.stats.pieces_failed += 1;
                warn!("Piece {} from {} failed verification", index, self.addr);
            }
        }
        self.fill_requests(ctx).await
    }

    /// Tell the peer about a newly verified piece, once
    async fn announce_piece(&mut self, ctx: &TorrentContext, index: u32) -> Result<()> {
        if !self.local.set(index as usize) {
            return Ok(());
        }
        self.send(Message::Have { piece_index: index }).await?;
        self.update_interest(ctx).await
    }

    async fn resync_local(&mut self, ctx: &TorrentContext) -> Result<()> {
        let completed = ctx.storage.completed_pieces().await;
        for index in completed.difference(&self.local).ones().collect::<Vec<_>>() {
            self.announce_piece(ctx, index as u32).await?;
        }
        Ok(())
    }

    async fn update_interest(&mut self, ctx: &TorrentContext) -> Result<()> {
        let interested = match self.session.bitfield.as_ref() {
            Some(bits) => !ctx.storage.needed_pieces().await.intersection(bits).none_set(),
            None => false,
        };
        if interested != self.session.flags.am_interested {
            self.session.flags.am_interested = interested;
            let message = if interested {
                Message::Interested
            } else {
                Message::NotInterested
            };
            self.send(message).await?;
        }
        Ok(())
    }

    /// Top up the request pipeline, starting new pieces when the in-flight
    /// ones have nothing left for this peer
    async fn fill_requests(&mut self, ctx: &TorrentContext) -> Result<()> {
        let depth = ctx.config.pipeline_depth;
        if !self.session.can_request() || self.in_flight.len() >= depth {
            return Ok(());
        }
        let Some(peer_has) = self.session.bitfield.clone() else {
            return Ok(());
        };
        let needed = ctx.storage.needed_pieces().await;

        let requests = {
            let mut picker = ctx.picker.lock().await;
            let mut requests = picker.next_requests(self.addr, &peer_has, depth - self.in_flight.len());
            // Each pass starts at most one piece
            for _ in 0..depth {
                if self.in_flight.len() + requests.len() >= depth {
                    break;
                }
                let Some(index) = picker.pick_piece(&peer_has, &needed) else { break };
                let blocks = ctx.storage.missing_blocks(index).await?;
                if blocks.is_empty() {
                    break;
                }
                picker.start_piece(index, blocks);
                let room = depth - self.in_flight.len() - requests.len();
                requests.extend(picker.next_requests(self.addr, &peer_has, room));
            }
            requests
        };

        for request in requests {
            self.in_flight.insert(request);
            self.send(Message::Request {
                index: request.piece,
                begin: request.offset,
                length: request.length,
            })
            .await?;
        }
        Ok(())
    }

    async fn handle_extended(&mut self, ctx: &TorrentContext, id: u8, payload: Vec<u8>) -> Result<()> {
        if !matches!(id, 0 | UT_METADATA_ID | UT_PEX_ID) {
            trace!("Ignoring extended message {} from {}", id, self.addr);
            return Ok(());
        }
        match ExtensionMessage::decode(id, &payload)? {
            ExtensionMessage::Handshake(remote) => {
                let pex = remote.supports(UT_PEX);
                self.remote_extensions = Some(remote);
                if pex && !ctx.session.is_private() {
                    let mut added = ctx.peers.connected_addrs().await;
                    added.retain(|a| *a != self.addr && a.is_ipv4());
                    added.truncate(MAX_PEX_PEERS);
                    if !added.is_empty() {
                        self.send_extension(ExtensionMessage::Pex(PexMessage {
                            added,
                            dropped: Vec::new(),
                        }))
                        .await?;
                    }
                }
            }
            ExtensionMessage::Metadata(MetadataMessage::Request { piece }) => {
                let reply = match ctx.metadata.as_ref().and_then(|m| {
                    metadata_slice(m, piece).map(|slice| (m.len(), slice.to_vec()))
                }) {
                    Some((total, data)) => MetadataMessage::Data {
                        piece,
                        total_size: total as u64,
                        data,
                    },
                    None => MetadataMessage::Reject { piece },
                };
                self.send_extension(ExtensionMessage::Metadata(reply)).await?;
            }
            ExtensionMessage::Metadata(other) => {
                trace!("Unsolicited metadata message for piece {} from {}", other.piece(), self.addr);
            }
            ExtensionMessage::Pex(pex) => {
                if ctx.session.is_private() {
                    return Ok(());
                }
                let added = ctx.peers.add_peers(pex.added, PeerSource::Exchange).await;
                debug!("PEX from {}: {} new peers", self.addr, added);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;
    use crate::torrent::TorrentInfo;
    use sha1::{Digest, Sha1};
    use tokio::io::duplex;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn config(crypto: CryptoPolicy) -> PeerConfig {
        PeerConfig {
            crypto,
            ..PeerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_plaintext_establishment() {
        let (a, b) = duplex(64 * 1024);
        let hash = InfoHash([3u8; 20]);
        let cfg = config(CryptoPolicy::Plaintext);
        let known = [hash];
        let (out, inc) = tokio::join!(
            PeerConnection::outbound(a, addr(1), PeerSource::Tracker, hash, [1u8; 20], true, &cfg),
            PeerConnection::inbound(b, addr(2), &known, [2u8; 20], false, &cfg),
        );
        let out = out.unwrap();
        let inc = inc.unwrap();
        assert!(!out.is_encrypted());
        assert_eq!(inc.info_hash(), hash);
        assert_eq!(out.session().peer_id, Some([2u8; 20]));
        assert!(inc.session().supports_dht());
        assert!(!out.session().supports_dht());
        assert_eq!(inc.session().source, PeerSource::Incoming);
    }

    #[tokio::test]
    async fn test_encrypted_establishment() {
        let (a, b) = duplex(64 * 1024);
        let hash = InfoHash([4u8; 20]);
        let cfg = config(CryptoPolicy::Encrypt);
        let known = [InfoHash([9u8; 20]), hash];
        let (out, inc) = tokio::join!(
            PeerConnection::outbound(a, addr(1), PeerSource::Dht, hash, [1u8; 20], false, &cfg),
            PeerConnection::inbound(b, addr(2), &known, [2u8; 20], false, &cfg),
        );
        assert!(out.unwrap().is_encrypted());
        assert!(inc.unwrap().is_encrypted());
    }

    #[tokio::test]
    async fn test_unknown_torrent_rejected() {
        let (a, b) = duplex(64 * 1024);
        let cfg = config(CryptoPolicy::Plaintext);
        let known = [InfoHash([6u8; 20])];
        let (out, inc) = tokio::join!(
            PeerConnection::outbound(a, addr(1), PeerSource::Tracker, InfoHash([5u8; 20]), [1u8; 20], false, &cfg),
            PeerConnection::inbound(b, addr(2), &known, [2u8; 20], false, &cfg),
        );
        assert!(inc.is_err());
        assert!(out.is_err());
    }

    #[tokio::test]
    async fn test_self_connection_rejected() {
        let (a, b) = duplex(64 * 1024);
        let hash = InfoHash([7u8; 20]);
        let cfg = config(CryptoPolicy::Plaintext);
        let known = [hash];
        let (out, inc) = tokio::join!(
            PeerConnection::outbound(a, addr(1), PeerSource::Lsd, hash, [8u8; 20], false, &cfg),
            PeerConnection::inbound(b, addr(2), &known, [8u8; 20], false, &cfg),
        );
        assert!(out.is_err());
        assert!(inc.is_err());
    }

    #[tokio::test]
    async fn test_prefer_encrypt_falls_back_to_plaintext() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_addr = listener.local_addr().unwrap();
        let hash = InfoHash([11u8; 20]);
        let server = tokio::spawn(async move {
            let known = [hash];
            let cfg = config(CryptoPolicy::Plaintext);
            let mut accepted = Vec::new();
            let mut kept = None;
            for _ in 0..2 {
                let (stream, from) = listener.accept().await.unwrap();
                match PeerConnection::inbound(stream, from, &known, [2u8; 20], false, &cfg).await {
                    Ok(conn) => {
                        accepted.push(true);
                        kept = Some(conn);
                    }
                    Err(_) => accepted.push(false),
                }
            }
            (accepted, kept)
        });

        let client = PeerConnection::connect(
            server_addr,
            PeerSource::Tracker,
            hash,
            [1u8; 20],
            false,
            &config(CryptoPolicy::PreferEncrypt),
        )
        .await
        .unwrap();
        assert!(!client.is_encrypted());
        assert_eq!(client.session().peer_id, Some([2u8; 20]));

        let (accepted, kept) = server.await.unwrap();
        assert_eq!(accepted, vec![false, true]);
        assert!(!kept.unwrap().is_encrypted());
    }

    fn info_for(data: &[u8]) -> (TorrentInfo, Vec<u8>) {
        let hash: [u8; 20] = Sha1::digest(data).into();
        let mut raw = format!("d6:lengthi{}e4:name4:file12:piece lengthi16384e6:pieces20:", data.len()).into_bytes();
        raw.extend_from_slice(&hash);
        raw.push(b'e');
        let info = crate::torrent::TorrentParser::parse_info(&raw).unwrap();
        (info, raw)
    }

    #[tokio::test]
    async fn test_fetch_metadata_from_seed() {
        let data = vec![42u8; 1000];
        let (info, raw) = info_for(&data);
        let hash = info.info_hash;
        let session = Arc::new(TorrentSession::new(info.clone()));
        let storage = Arc::new(PieceStorage::new(&info, Arc::new(MemoryBackend::new())));
        storage.write(0, 0, &data).await.unwrap();
        assert!(storage.verify(0).await.unwrap());
        let (have, _) = broadcast::channel(16);
        let ctx = TorrentContext {
            session,
            storage,
            picker: Arc::new(Mutex::new(PiecePicker::new(1))),
            peers: Arc::new(PeerManager::new(5)),
            peer_id: [2u8; 20],
            listen_port: 6881,
            dht_port: None,
            metadata: Some(Arc::new(raw.clone())),
            have,
            config: config(CryptoPolicy::Plaintext),
        };

        let (a, b) = duplex(64 * 1024);
        let cfg = config(CryptoPolicy::Plaintext);
        let known = [hash];
        let (out, inc) = tokio::join!(
            PeerConnection::outbound(a, addr(1), PeerSource::Dht, hash, [1u8; 20], false, &cfg),
            PeerConnection::inbound(b, addr(2), &known, [2u8; 20], false, &cfg),
        );
        let seed = tokio::spawn(inc.unwrap().run(ctx));
        let fetched = out.unwrap().fetch_metadata().await.unwrap();
        assert_eq!(fetched, raw);
        seed.abort();
    }
}
