//! Peer-to-peer network manager.
//!
//! Threads: one non-blocking accept loop, one reader per connection and one
//! maintenance loop. Writes go through a per-peer writer lock; the peer map
//! lock is never held while writing to a socket.

use cinder_consensus::Block;
use cinder_ledger::Transaction;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io::{self, BufReader, Write};
use std::net::{IpAddr, Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::NetworkConfig;
use crate::mempool::{Mempool, MempoolError};
use crate::mining::BlockBroadcaster;
use crate::now_millis;
use crate::peers::{parse_peer_addr, KnownPeer, KnownPeerBook};
use crate::store::{LedgerStore, StoreError};
use crate::wire::{
    decode_message, encode_message, Decoded, FrameReader, GetBlocksPayload, InvPayload, Message,
    PeerAddr, PingPayload, VersionPayload, WireError, PROTOCOL_VERSION,
};

pub const SEEN_CAPACITY: usize = 4096;
pub const MAX_ADDR_REPLY: usize = 10;
pub const MAX_BLOCKS_PER_REPLY: usize = 500;
/// Entries adopted from a single addr message.
pub const MAX_ADDR_ADOPT: usize = 32;
/// Known peers dialed per discovery pass.
pub const MAX_DIALS_PER_PASS: usize = 16;
const ACCEPT_POLL: Duration = Duration::from_millis(50);
const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum P2pError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("mempool error: {0}")]
    Mempool(#[from] MempoolError),
    #[error("connection to {0} timed out")]
    ConnectionTimeout(String),
    #[error("connection refused: {0}")]
    ConnectionRefused(String),
    #[error("handshake incomplete with {0}")]
    HandshakeIncomplete(String),
    #[error("refusing connection to self via {0}")]
    SelfConnection(String),
    #[error("peer limit reached")]
    PeerLimit,
    #[error("lock poisoned: {0}")]
    Lock(&'static str),
    #[error("invalid address: {0}")]
    AddrParse(String),
}

fn lock<'a, T>(m: &'a Mutex<T>, what: &'static str) -> Result<MutexGuard<'a, T>, P2pError> {
    m.lock().map_err(|_| P2pError::Lock(what))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum HandshakeState {
    Connecting,
    VersionExchanged,
    Ready,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub outbound: bool,
    pub is_connected: bool,
    pub last_seen: i64,
    pub version: u32,
    pub handshake: HandshakeState,
    pub height: u64,
    pub listen_addr: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStats {
    pub connected_peers: usize,
    pub ready_peers: usize,
    pub known_peers: usize,
    pub chain_height: u64,
    pub best_peer_height: u64,
    pub protocol_version: u32,
    pub isolated: bool,
    pub can_operate_offline: bool,
}

#[derive(Debug, Clone)]
pub enum NetworkEvent {
    PeerConnected { id: String, outbound: bool },
    PeerReady { id: String, height: u64 },
    PeerDisconnected { id: String },
    Block { from: String, block: Block },
    Tx { from: String, tx: Transaction },
    Inv { from: String, inv: InvPayload },
}

/// Bounded FIFO set of block hashes and txids already processed.
#[derive(Debug)]
struct SeenCache {
    order: VecDeque<String>,
    set: HashSet<String>,
    cap: usize,
}

impl SeenCache {
    fn new(cap: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(cap),
            set: HashSet::with_capacity(cap),
            cap,
        }
    }

    /// Returns true when `key` was not seen before.
    fn insert(&mut self, key: &str) -> bool {
        if self.set.contains(key) {
            return false;
        }
        self.set.insert(key.to_string());
        self.order.push_back(key.to_string());
        while self.order.len() > self.cap {
            if let Some(old) = self.order.pop_front() {
                self.set.remove(&old);
            }
        }
        true
    }

    fn forget(&mut self, key: &str) {
        if self.set.remove(key) {
            self.order.retain(|k| k != key);
        }
    }
}

#[derive(Debug)]
struct PeerState {
    got_version: bool,
    got_verack: bool,
    ready_announced: bool,
    version: u32,
    height: u64,
    listen_addr: Option<PeerAddr>,
    last_seen: Instant,
    last_seen_ms: i64,
    sync_until: Option<u64>,
}

impl PeerState {
    fn handshake(&self) -> HandshakeState {
        match (self.got_version, self.got_verack) {
            (true, true) => HandshakeState::Ready,
            (false, false) => HandshakeState::Connecting,
            _ => HandshakeState::VersionExchanged,
        }
    }
}

pub struct PeerConn {
    id: String,
    addr: SocketAddr,
    outbound: bool,
    writer: Mutex<TcpStream>,
    state: Mutex<PeerState>,
}

impl PeerConn {
    fn new(id: String, addr: SocketAddr, dialed: Option<PeerAddr>, writer: TcpStream) -> Self {
        Self {
            id,
            addr,
            outbound: dialed.is_some(),
            writer: Mutex::new(writer),
            state: Mutex::new(PeerState {
                got_version: false,
                got_verack: false,
                ready_announced: false,
                version: 0,
                height: 0,
                listen_addr: dialed,
                last_seen: Instant::now(),
                last_seen_ms: now_millis(),
                sync_until: None,
            }),
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, PeerState>, P2pError> {
        lock(&self.state, "peer state")
    }

    fn send(&self, msg: &Message) -> Result<(), P2pError> {
        let bytes = encode_message(msg)?;
        self.send_raw(&bytes)
    }

    fn send_raw(&self, bytes: &[u8]) -> Result<(), P2pError> {
        let mut writer = lock(&self.writer, "peer writer")?;
        writer.write_all(bytes)?;
        writer.flush()?;
        Ok(())
    }

    fn close(&self) {
        if let Ok(writer) = self.writer.lock() {
            let _ = writer.shutdown(Shutdown::Both);
        }
    }

    fn touch(&self) {
        if let Ok(mut st) = self.state.lock() {
            st.last_seen = Instant::now();
            st.last_seen_ms = now_millis();
        }
    }

    fn handshake(&self) -> Result<HandshakeState, P2pError> {
        Ok(self.state()?.handshake())
    }

    fn info(&self) -> Result<PeerInfo, P2pError> {
        let st = self.state()?;
        Ok(PeerInfo {
            id: self.id.clone(),
            host: self.addr.ip().to_string(),
            port: self.addr.port(),
            outbound: self.outbound,
            is_connected: true,
            last_seen: st.last_seen_ms,
            version: st.version,
            handshake: st.handshake(),
            height: st.height,
            listen_addr: st.listen_addr.as_ref().map(PeerAddr::id),
        })
    }
}

struct Shared {
    cfg: NetworkConfig,
    node_id: String,
    store: Arc<LedgerStore>,
    mempool: Arc<Mutex<Mempool>>,
    peers: Mutex<HashMap<String, Arc<PeerConn>>>,
    book: Mutex<KnownPeerBook>,
    seen: Mutex<SeenCache>,
    best_height: AtomicU64,
    running: AtomicBool,
    isolated: AtomicBool,
    local_addr: Mutex<Option<SocketAddr>>,
    subscribers: Mutex<Vec<Sender<NetworkEvent>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

pub struct NetworkManager {
    shared: Arc<Shared>,
}

impl NetworkManager {
    pub fn new(
        cfg: NetworkConfig,
        store: Arc<LedgerStore>,
        mempool: Arc<Mutex<Mempool>>,
        book: KnownPeerBook,
    ) -> Self {
        let node_id = format!("{:016x}", rand::random::<u64>());
        Self {
            shared: Arc::new(Shared {
                cfg,
                node_id,
                store,
                mempool,
                peers: Mutex::new(HashMap::new()),
                book: Mutex::new(book),
                seen: Mutex::new(SeenCache::new(SEEN_CAPACITY)),
                best_height: AtomicU64::new(0),
                running: AtomicBool::new(false),
                isolated: AtomicBool::new(false),
                local_addr: Mutex::new(None),
                subscribers: Mutex::new(Vec::new()),
                threads: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.shared.node_id
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.local_addr.lock().ok().and_then(|a| *a)
    }

    /// Bind the listener and start the accept and maintenance threads.
    /// Returns the bound address.
    pub fn start(&self) -> Result<SocketAddr, P2pError> {
        if self.shared.running.load(Ordering::SeqCst) {
            if let Some(addr) = self.local_addr() {
                return Ok(addr);
            }
        }
        let listener = TcpListener::bind(&self.shared.cfg.listen)?;
        listener.set_nonblocking(true)?;
        let local = listener.local_addr()?;
        *lock(&self.shared.local_addr, "local addr")? = Some(local);
        self.shared.running.store(true, Ordering::SeqCst);

        let shared = Arc::clone(&self.shared);
        let accept = thread::Builder::new()
            .name("cinder-accept".to_string())
            .spawn(move || shared.accept_loop(listener))?;
        self.shared.track(accept);

        let shared = Arc::clone(&self.shared);
        let maintenance = thread::Builder::new()
            .name("cinder-maintenance".to_string())
            .spawn(move || shared.maintenance_loop())?;
        self.shared.track(maintenance);

        info!(listen = %local, node_id = %self.shared.node_id, "P2P listening");
        Ok(local)
    }

    /// Dial known peers by trust, then the bootstrap list when nothing is
    /// connected, and fall back to isolated mode. Returns the active peer count.
    pub fn discover(&self) -> Result<usize, P2pError> {
        self.shared.discover()
    }

    pub fn connect_peer(&self, addr: &PeerAddr) -> Result<String, P2pError> {
        self.shared.connect(addr)
    }

    /// Relay a locally produced block to every Ready peer. Returns the number
    /// of peers it was sent to.
    pub fn broadcast_block(&self, block: &Block) -> Result<usize, P2pError> {
        self.shared.broadcast_block(block)
    }

    /// Stamp, admit to the local mempool and relay. Returns the txid.
    pub fn send_transaction(&self, mut tx: Transaction) -> Result<String, P2pError> {
        tx.timestamp = now_millis();
        tx.nonce = rand::random::<u64>();
        let balances = self.shared.store.balance_table()?;
        let txid = lock(&self.shared.mempool, "mempool")?.add_tx(tx.clone(), &balances)?;
        lock(&self.shared.seen, "seen cache")?.insert(&txid);
        let sent = self.shared.relay(&Message::Tx(tx), None)?;
        info!(txid = %txid, peers = sent, "transaction submitted");
        Ok(txid)
    }

    pub fn subscribe(&self) -> Result<Receiver<NetworkEvent>, P2pError> {
        let (tx, rx) = mpsc::channel();
        lock(&self.shared.subscribers, "subscribers")?.push(tx);
        Ok(rx)
    }

    pub fn stats(&self) -> Result<NetworkStats, P2pError> {
        let conns = self.shared.snapshot_peers()?;
        let mut ready_peers = 0;
        let mut best_peer_height = self.shared.best_height.load(Ordering::SeqCst);
        for conn in &conns {
            let st = conn.state()?;
            if st.handshake() == HandshakeState::Ready {
                ready_peers += 1;
            }
            best_peer_height = best_peer_height.max(st.height);
        }
        Ok(NetworkStats {
            connected_peers: conns.len(),
            ready_peers,
            known_peers: lock(&self.shared.book, "peer book")?.len(),
            chain_height: self.shared.store.height()?,
            best_peer_height,
            protocol_version: PROTOCOL_VERSION,
            isolated: self.shared.isolated.load(Ordering::SeqCst),
            can_operate_offline: true,
        })
    }

    /// Known peer book, highest trust first.
    pub fn known_peers(&self) -> Result<Vec<KnownPeer>, P2pError> {
        Ok(lock(&self.shared.book, "peer book")?.ranked())
    }

    pub fn peers(&self) -> Result<Vec<PeerInfo>, P2pError> {
        let mut list = self
            .shared
            .snapshot_peers()?
            .iter()
            .map(|c| c.info())
            .collect::<Result<Vec<_>, _>>()?;
        list.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(list)
    }

    pub fn is_isolated(&self) -> bool {
        self.shared.isolated.load(Ordering::SeqCst)
    }

    /// Close every connection, stop the background threads and persist the
    /// peer book.
    pub fn shutdown(&self) -> Result<(), P2pError> {
        self.shared.running.store(false, Ordering::SeqCst);
        for conn in self.shared.snapshot_peers()? {
            self.shared.drop_peer(&conn);
        }
        let handles: Vec<JoinHandle<()>> =
            lock(&self.shared.threads, "threads")?.drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                warn!("network thread panicked");
            }
        }
        lock(&self.shared.book, "peer book")?.save()?;
        info!("network stopped");
        Ok(())
    }
}

impl BlockBroadcaster for NetworkManager {
    fn broadcast_block(&self, block: &Block) {
        match self.shared.broadcast_block(block) {
            Ok(peers) => debug!(height = block.index, peers, "block relayed"),
            Err(err) => warn!(height = block.index, error = %err, "block relay failed"),
        }
    }
}

impl Shared {
    fn track(&self, handle: JoinHandle<()>) {
        if let Ok(mut threads) = self.threads.lock() {
            threads.retain(|h| !h.is_finished());
            threads.push(handle);
        }
    }

    fn emit(&self, event: NetworkEvent) {
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }

    fn snapshot_peers(&self) -> Result<Vec<Arc<PeerConn>>, P2pError> {
        Ok(lock(&self.peers, "peers")?.values().cloned().collect())
    }

    fn active_count(&self) -> Result<usize, P2pError> {
        Ok(lock(&self.peers, "peers")?.len())
    }

    fn outbound_count(&self) -> Result<usize, P2pError> {
        Ok(lock(&self.peers, "peers")?
            .values()
            .filter(|c| c.outbound)
            .count())
    }

    fn update_best_height(&self, height: u64) {
        self.best_height.fetch_max(height, Ordering::SeqCst);
    }

    fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        while self.running.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, addr)) => {
                    if let Err(err) = self.register(stream, addr, None) {
                        warn!(peer = %addr, error = %err, "rejected inbound connection");
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
                Err(err) => {
                    warn!(error = %err, "accept failed");
                    thread::sleep(ACCEPT_POLL);
                }
            }
        }
        debug!("accept loop stopped");
    }

    fn maintenance_loop(self: Arc<Self>) {
        loop {
            let wake_at = Instant::now() + self.cfg.discovery_interval();
            while Instant::now() < wake_at {
                if !self.running.load(Ordering::SeqCst) {
                    return;
                }
                thread::sleep(ACCEPT_POLL);
            }
            if let Err(err) = self.maintain() {
                warn!(error = %err, "peer maintenance failed");
            }
        }
    }

    fn version_message(&self) -> Result<Message, P2pError> {
        let listen_addr = self
            .local_addr
            .lock()
            .ok()
            .and_then(|a| *a)
            .map(|a| a.to_string())
            .unwrap_or_else(|| self.cfg.listen.clone());
        Ok(Message::Version(VersionPayload {
            version: PROTOCOL_VERSION,
            node_id: self.node_id.clone(),
            listen_addr,
            height: self.store.height()?,
            timestamp: now_millis(),
        }))
    }

    fn register(
        self: &Arc<Self>,
        stream: TcpStream,
        addr: SocketAddr,
        dialed: Option<PeerAddr>,
    ) -> Result<Arc<PeerConn>, P2pError> {
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
        let id = addr.to_string();
        let conn = Arc::new(PeerConn::new(id.clone(), addr, dialed, stream.try_clone()?));
        {
            let mut peers = lock(&self.peers, "peers")?;
            if peers.len() >= self.cfg.max_peers {
                let _ = stream.shutdown(Shutdown::Both);
                return Err(P2pError::PeerLimit);
            }
            peers.insert(id.clone(), Arc::clone(&conn));
        }
        if self.isolated.swap(false, Ordering::SeqCst) {
            info!(peer = %id, "peer connected, leaving isolated mode");
        }

        if let Err(err) = self.version_message().and_then(|msg| conn.send(&msg)) {
            self.drop_peer(&conn);
            return Err(err);
        }
        let shared = Arc::clone(self);
        let reader_conn = Arc::clone(&conn);
        let spawned = thread::Builder::new()
            .name(format!("peer-{id}"))
            .spawn(move || shared.read_loop(reader_conn, stream));
        match spawned {
            Ok(handle) => self.track(handle),
            Err(err) => {
                self.drop_peer(&conn);
                return Err(err.into());
            }
        }
        info!(peer = %id, outbound = conn.outbound, "peer connected");
        self.emit(NetworkEvent::PeerConnected {
            id,
            outbound: conn.outbound,
        });
        Ok(conn)
    }

    fn drop_peer(&self, conn: &Arc<PeerConn>) {
        conn.close();
        let removed = match self.peers.lock() {
            Ok(mut peers) => match peers.get(&conn.id) {
                Some(current) if Arc::ptr_eq(current, conn) => peers.remove(&conn.id).is_some(),
                _ => false,
            },
            Err(_) => false,
        };
        if removed {
            info!(peer = %conn.id, "peer disconnected");
            self.emit(NetworkEvent::PeerDisconnected {
                id: conn.id.clone(),
            });
        }
    }

    fn read_loop(self: Arc<Self>, conn: Arc<PeerConn>, stream: TcpStream) {
        let mut reader = FrameReader::new(BufReader::new(stream));
        loop {
            match reader.next_frame() {
                Ok(Decoded::Frame(frame)) => {
                    conn.touch();
                    let msg = match decode_message(&frame) {
                        Ok(msg) => msg,
                        Err(err) => {
                            debug!(peer = %conn.id, command = %frame.command, error = %err, "dropped undecodable message");
                            continue;
                        }
                    };
                    let command = msg.command();
                    match self.handle_message(&conn, msg) {
                        Ok(()) => {}
                        Err(P2pError::SelfConnection(_)) => {
                            info!(peer = %conn.id, "closing connection to self");
                            break;
                        }
                        Err(err) => {
                            warn!(peer = %conn.id, command, error = %err, "message handling failed")
                        }
                    }
                }
                Ok(Decoded::Dropped(err)) => {
                    debug!(peer = %conn.id, error = %err, "dropped frame");
                }
                Err(err) => {
                    debug!(peer = %conn.id, error = %err, "connection closed");
                    break;
                }
            }
        }
        self.drop_peer(&conn);
    }

    fn handle_message(self: &Arc<Self>, conn: &Arc<PeerConn>, msg: Message) -> Result<(), P2pError> {
        if !matches!(msg, Message::Version(_) | Message::Verack | Message::Ping(_) | Message::Pong(_))
            && !conn.state()?.got_version
        {
            return Err(P2pError::HandshakeIncomplete(conn.id.clone()));
        }
        match msg {
            Message::Version(v) => self.on_version(conn, v),
            Message::Verack => {
                conn.state()?.got_verack = true;
                self.mark_handshake(conn)
            }
            Message::GetAddr => {
                let addrs: Vec<PeerAddr> = {
                    let peers = lock(&self.peers, "peers")?;
                    let mut out = Vec::new();
                    for other in peers.values().filter(|c| c.id != conn.id) {
                        if out.len() >= MAX_ADDR_REPLY {
                            break;
                        }
                        if let Some(listen) = other.state()?.listen_addr.clone() {
                            out.push(listen);
                        }
                    }
                    out
                };
                conn.send(&Message::Addr(addrs))
            }
            Message::Addr(list) => {
                let unknown: Vec<PeerAddr> = {
                    let book = lock(&self.book, "peer book")?;
                    list.into_iter()
                        .filter(|a| !book.contains(a))
                        .take(MAX_ADDR_ADOPT)
                        .collect()
                };
                let candidates: Vec<PeerAddr> =
                    unknown.into_iter().filter(|a| !self.is_self_addr(a)).collect();
                let added = {
                    let mut book = lock(&self.book, "peer book")?;
                    candidates.iter().filter(|a| book.insert(a)).count()
                };
                if added > 0 {
                    debug!(peer = %conn.id, added, "learned peer addresses");
                }
                Ok(())
            }
            Message::Inv(inv) => {
                debug!(peer = %conn.id, blocks = inv.blocks.len(), txs = inv.txs.len(), "inv");
                self.emit(NetworkEvent::Inv {
                    from: conn.id.clone(),
                    inv,
                });
                Ok(())
            }
            Message::Block(block) => self.on_block(conn, block),
            Message::Tx(tx) => self.on_tx(conn, tx),
            Message::GetBlocks(req) => {
                let limit = (req.limit as usize).min(MAX_BLOCKS_PER_REPLY);
                let blocks = self.store.blocks_from(req.from_index, limit)?;
                debug!(peer = %conn.id, from = req.from_index, count = blocks.len(), "serving blocks");
                for block in blocks {
                    conn.send(&Message::Block(block))?;
                }
                Ok(())
            }
            Message::Ping(ping) => conn.send(&Message::Pong(ping)),
            Message::Pong(_) => Ok(()),
        }
    }

    fn on_version(self: &Arc<Self>, conn: &Arc<PeerConn>, v: VersionPayload) -> Result<(), P2pError> {
        if v.node_id == self.node_id {
            return Err(P2pError::SelfConnection(conn.id.clone()));
        }
        if v.version != PROTOCOL_VERSION {
            debug!(peer = %conn.id, version = v.version, "peer speaks a different protocol version");
        }
        {
            let mut st = conn.state()?;
            st.got_version = true;
            st.version = v.version;
            st.height = v.height;
            if !conn.outbound {
                if let Some(advertised) = parse_peer_addr(&v.listen_addr) {
                    st.listen_addr = Some(PeerAddr {
                        host: conn.addr.ip().to_string(),
                        port: advertised.port,
                    });
                }
            }
        }
        self.update_best_height(v.height);
        conn.send(&Message::Verack)?;
        let ours = self.store.height()?;
        if v.height > ours {
            self.request_blocks(conn, ours + 1)?;
        }
        self.mark_handshake(conn)
    }

    fn mark_handshake(&self, conn: &Arc<PeerConn>) -> Result<(), P2pError> {
        let (height, listen) = {
            let mut st = conn.state()?;
            if st.handshake() != HandshakeState::Ready || st.ready_announced {
                return Ok(());
            }
            st.ready_announced = true;
            (st.height, st.listen_addr.clone())
        };
        if let Some(listen) = listen {
            if !self.is_self_addr(&listen) {
                lock(&self.book, "peer book")?.insert(&listen);
            }
        }
        info!(peer = %conn.id, height, "handshake complete");
        self.emit(NetworkEvent::PeerReady {
            id: conn.id.clone(),
            height,
        });
        conn.send(&Message::GetAddr)
    }

    fn request_blocks(&self, conn: &PeerConn, from_index: u64) -> Result<(), P2pError> {
        conn.state()?.sync_until = Some(from_index + MAX_BLOCKS_PER_REPLY as u64 - 1);
        debug!(peer = %conn.id, from = from_index, "requesting blocks");
        conn.send(&Message::GetBlocks(GetBlocksPayload {
            from_index,
            limit: MAX_BLOCKS_PER_REPLY as u32,
        }))
    }

    fn on_block(&self, conn: &Arc<PeerConn>, block: Block) -> Result<(), P2pError> {
        if !lock(&self.seen, "seen cache")?.insert(&block.hash) {
            return Ok(());
        }
        {
            let mut st = conn.state()?;
            st.height = st.height.max(block.index);
        }
        self.update_best_height(block.index);

        let tip = self.store.tip()?;
        if block.index <= tip.index {
            debug!(peer = %conn.id, height = block.index, "ignoring block at or below tip");
            return Ok(());
        }
        if block.index > tip.index + 1 {
            // not applicable yet; let it through again once the gap is filled
            lock(&self.seen, "seen cache")?.forget(&block.hash);
            return self.request_blocks(conn, tip.index + 1);
        }

        if let Err(err) = self.store.commit_block(block.clone()) {
            if !err.is_rejection() {
                lock(&self.seen, "seen cache")?.forget(&block.hash);
            }
            return Err(err.into());
        }
        let removed = lock(&self.mempool, "mempool")?.remove_confirmed(&block);
        info!(peer = %conn.id, height = block.index, hash = %block.hash, confirmed = removed, "accepted block");

        let follow_up = {
            let st = conn.state()?;
            match st.sync_until {
                Some(until) if until == block.index && st.height > block.index => {
                    Some(block.index + 1)
                }
                _ => None,
            }
        };
        if let Some(from) = follow_up {
            self.request_blocks(conn, from)?;
        }

        let sent = self.relay(&Message::Block(block.clone()), Some(&conn.id))?;
        debug!(height = block.index, peers = sent, "block relayed");
        self.emit(NetworkEvent::Block {
            from: conn.id.clone(),
            block,
        });
        Ok(())
    }

    fn on_tx(&self, conn: &Arc<PeerConn>, tx: Transaction) -> Result<(), P2pError> {
        let txid = tx.txid();
        if !lock(&self.seen, "seen cache")?.insert(&txid) {
            return Ok(());
        }
        let balances = self.store.balance_table()?;
        let admitted = lock(&self.mempool, "mempool")?.add_tx(tx.clone(), &balances);
        if let Err(err) = admitted {
            if matches!(err, MempoolError::InsufficientFunds { .. } | MempoolError::Full) {
                // may be admissible once the funding block lands or the pool drains
                lock(&self.seen, "seen cache")?.forget(&txid);
            }
            debug!(peer = %conn.id, txid = %txid, error = %err, "transaction rejected");
            return Ok(());
        }
        self.relay(&Message::Tx(tx.clone()), Some(&conn.id))?;
        self.emit(NetworkEvent::Tx {
            from: conn.id.clone(),
            tx,
        });
        Ok(())
    }

    fn broadcast_block(&self, block: &Block) -> Result<usize, P2pError> {
        lock(&self.seen, "seen cache")?.insert(&block.hash);
        self.relay(&Message::Block(block.clone()), None)
    }

    /// Send to every Ready peer except `except`. Returns how many got it.
    fn relay(&self, msg: &Message, except: Option<&str>) -> Result<usize, P2pError> {
        let bytes = encode_message(msg)?;
        let targets: Vec<Arc<PeerConn>> = self
            .snapshot_peers()?
            .into_iter()
            .filter(|c| Some(c.id.as_str()) != except)
            .collect();
        let mut sent = 0;
        for conn in targets {
            if conn.handshake()? != HandshakeState::Ready {
                continue;
            }
            match conn.send_raw(&bytes) {
                Ok(()) => sent += 1,
                Err(err) => {
                    warn!(peer = %conn.id, error = %err, "relay failed, dropping peer");
                    self.drop_peer(&conn);
                }
            }
        }
        Ok(sent)
    }

    fn is_self_socket(&self, sock: &SocketAddr) -> bool {
        match self.local_addr.lock().ok().and_then(|a| *a) {
            Some(local) => {
                sock.port() == local.port()
                    && (sock.ip().is_loopback() || sock.ip() == local.ip())
            }
            None => false,
        }
    }

    fn is_self_addr(&self, addr: &PeerAddr) -> bool {
        if let Ok(ip) = addr.host.parse::<IpAddr>() {
            return self.is_self_socket(&SocketAddr::new(ip, addr.port));
        }
        (addr.host.as_str(), addr.port)
            .to_socket_addrs()
            .map(|mut it| it.any(|s| self.is_self_socket(&s)))
            .unwrap_or(false)
    }

    fn is_connected_to(&self, addr: &PeerAddr, sock: Option<&SocketAddr>) -> Result<Option<String>, P2pError> {
        let peers = lock(&self.peers, "peers")?;
        if let Some(sock) = sock {
            if peers.contains_key(&sock.to_string()) {
                return Ok(Some(sock.to_string()));
            }
        }
        for conn in peers.values() {
            if conn.state()?.listen_addr.as_ref() == Some(addr) {
                return Ok(Some(conn.id.clone()));
            }
        }
        Ok(None)
    }

    fn connect(self: &Arc<Self>, addr: &PeerAddr) -> Result<String, P2pError> {
        let target = addr.id();
        let sock = (addr.host.as_str(), addr.port)
            .to_socket_addrs()
            .map_err(|e| P2pError::AddrParse(format!("{target}: {e}")))?
            .next()
            .ok_or_else(|| P2pError::AddrParse(target.clone()))?;
        if self.is_self_socket(&sock) {
            return Err(P2pError::SelfConnection(target));
        }
        if let Some(existing) = self.is_connected_to(addr, Some(&sock))? {
            return Ok(existing);
        }
        let stream = TcpStream::connect_timeout(&sock, self.cfg.connect_timeout()).map_err(|e| {
            match e.kind() {
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
                    P2pError::ConnectionTimeout(target.clone())
                }
                _ => P2pError::ConnectionRefused(format!("{target}: {e}")),
            }
        })?;
        let conn = self.register(stream, sock, Some(addr.clone()))?;
        Ok(conn.id.clone())
    }

    fn discover(self: &Arc<Self>) -> Result<usize, P2pError> {
        let known = lock(&self.book, "peer book")?.ranked();
        let mut dials = 0;
        for peer in known {
            if dials >= MAX_DIALS_PER_PASS || self.outbound_count()? >= self.cfg.target_outbound {
                break;
            }
            let addr = peer.addr();
            if self.is_connected_to(&addr, None)?.is_some() {
                continue;
            }
            dials += 1;
            match self.connect(&addr) {
                Ok(id) => {
                    lock(&self.book, "peer book")?.record_success(&addr);
                    debug!(peer = %id, trust = peer.trust_score, "connected to known peer");
                }
                Err(P2pError::SelfConnection(_)) => {}
                Err(err) => {
                    lock(&self.book, "peer book")?.record_failure(&addr);
                    debug!(peer = %addr.id(), error = %err, "known peer unreachable");
                }
            }
        }

        if self.active_count()? == 0 {
            for raw in &self.cfg.bootstrap {
                let Some(addr) = parse_peer_addr(raw) else {
                    warn!(addr = %raw, "invalid bootstrap address");
                    continue;
                };
                match self.connect(&addr) {
                    Ok(id) => {
                        lock(&self.book, "peer book")?.record_success(&addr);
                        info!(peer = %id, "connected to bootstrap peer");
                    }
                    Err(err) => debug!(peer = %raw, error = %err, "bootstrap peer unreachable"),
                }
            }
        }

        let active = self.active_count()?;
        if active == 0 {
            if !self.isolated.swap(true, Ordering::SeqCst) {
                warn!("no peers reachable, running in isolated mode");
            }
        } else {
            self.isolated.store(false, Ordering::SeqCst);
        }
        if let Err(err) = lock(&self.book, "peer book")?.save() {
            warn!(error = %err, "failed to persist peer book");
        }
        Ok(active)
    }

    fn maintain(self: &Arc<Self>) -> Result<(), P2pError> {
        let stale_after = self.cfg.stale_after();
        for conn in self.snapshot_peers()? {
            let idle = conn.state()?.last_seen.elapsed();
            if idle > stale_after {
                info!(peer = %conn.id, idle_secs = idle.as_secs(), "dropping stale peer");
                self.drop_peer(&conn);
                continue;
            }
            if conn.handshake()? != HandshakeState::Ready {
                continue;
            }
            let ping = Message::Ping(PingPayload {
                nonce: rand::random::<u64>(),
            });
            if let Err(err) = conn.send(&ping).and_then(|_| conn.send(&Message::GetAddr)) {
                warn!(peer = %conn.id, error = %err, "keepalive failed");
                self.drop_peer(&conn);
                continue;
            }
            if let Some(listen) = conn.state()?.listen_addr.clone() {
                lock(&self.book, "peer book")?.touch(&listen);
            }
        }
        if self.outbound_count()? < self.cfg.target_outbound {
            self.discover()?;
        } else {
            lock(&self.book, "peer book")?.save()?;
        }
        Ok(())
    }
}
