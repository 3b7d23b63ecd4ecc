//! Node wiring: store, boot-time restore, mempool, network and miner, all
//! handed to each other explicitly.

use cinder_consensus::{ConsensusError, DifficultyPolicy, StaticDifficulty};
use cinder_ledger::Transaction;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::config::{ConfigError, NodeConfig};
use crate::mempool::{Mempool, MempoolConfig};
use crate::mining::{MinerConfig, MiningEngine, MiningError, MiningStats};
use crate::p2p::{NetworkManager, NetworkStats, P2pError};
use crate::peers::KnownPeerBook;
use crate::store::{LedgerStore, StoreConfig, StoreError, PEERS_FILE};

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("consensus error: {0}")]
    Consensus(#[from] ConsensusError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("mining error: {0}")]
    Mining(#[from] MiningError),
    #[error("P2P error: {0}")]
    P2p(#[from] P2pError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct Node {
    cfg: NodeConfig,
    store: Arc<LedgerStore>,
    mempool: Arc<Mutex<Mempool>>,
    network: Arc<NetworkManager>,
    miner: Arc<MiningEngine>,
    restored_on_boot: bool,
    stopping: Arc<AtomicBool>,
}

impl Node {
    /// Validate `cfg` and build a node with a static difficulty policy.
    pub fn open(cfg: NodeConfig) -> Result<Self, NodeError> {
        cfg.validate()?;
        let policy = StaticDifficulty::new(cfg.mining.difficulty_prefix.clone(), cfg.mining.reward)?;
        Self::with_policy(cfg, Arc::new(policy))
    }

    pub fn with_policy(cfg: NodeConfig, policy: Arc<dyn DifficultyPolicy>) -> Result<Self, NodeError> {
        let data_dir = cfg.storage.data_dir.clone();
        let store = Arc::new(LedgerStore::open(
            data_dir.clone(),
            policy,
            StoreConfig::from(&cfg.storage),
        )?);
        let restored_on_boot = store.restore_from_snapshot()?;

        let mempool = Arc::new(Mutex::new(Mempool::new(MempoolConfig::default())));
        let book = KnownPeerBook::load(data_dir.map(|dir| dir.join(PEERS_FILE)))?;
        let network = Arc::new(NetworkManager::new(
            cfg.network.clone(),
            Arc::clone(&store),
            Arc::clone(&mempool),
            book,
        ));
        let miner = Arc::new(MiningEngine::new(
            MinerConfig::from(&cfg.mining),
            Arc::clone(&store),
            Arc::clone(&mempool),
        )?);
        miner.set_broadcaster(network.clone())?;

        info!(
            height = store.height()?,
            supply = store.total_supply()?,
            restored = restored_on_boot,
            "node opened"
        );
        Ok(Self {
            cfg,
            store,
            mempool,
            network,
            miner,
            restored_on_boot,
            stopping: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Start networking, run discovery and autostart mining when configured.
    pub fn start(&self) -> Result<SocketAddr, NodeError> {
        let addr = self.network.start()?;
        let peers = self.network.discover()?;
        info!(listen = %addr, peers, isolated = self.network.is_isolated(), "node started");
        if self.cfg.mining.autostart {
            self.miner.start()?;
        }
        Ok(addr)
    }

    pub fn start_mining(&self) -> Result<bool, NodeError> {
        Ok(self.miner.start()?)
    }

    pub fn stop_mining(&self) -> Result<bool, NodeError> {
        Ok(self.miner.stop()?)
    }

    pub fn mining_stats(&self) -> Result<MiningStats, NodeError> {
        Ok(self.miner.stats()?)
    }

    pub fn balances(&self) -> Result<BTreeMap<String, f64>, NodeError> {
        Ok(self.store.balances()?)
    }

    pub fn transfer(&self, from: &str, to: &str, amount: f64) -> Result<(), NodeError> {
        Ok(self.store.transfer(from, to, amount)?)
    }

    pub fn send_transaction(&self, tx: Transaction) -> Result<String, NodeError> {
        Ok(self.network.send_transaction(tx)?)
    }

    pub fn network_stats(&self) -> Result<NetworkStats, NodeError> {
        Ok(self.network.stats()?)
    }

    pub fn store(&self) -> &Arc<LedgerStore> {
        &self.store
    }

    pub fn mempool(&self) -> &Arc<Mutex<Mempool>> {
        &self.mempool
    }

    pub fn network(&self) -> &Arc<NetworkManager> {
        &self.network
    }

    pub fn miner(&self) -> &Arc<MiningEngine> {
        &self.miner
    }

    pub fn restored_on_boot(&self) -> bool {
        self.restored_on_boot
    }

    /// Log a one-line summary every `interval` until shutdown.
    pub fn spawn_stats_logger(&self, interval: Duration) -> Result<(), NodeError> {
        let store = Arc::clone(&self.store);
        let mempool = Arc::clone(&self.mempool);
        let network = Arc::clone(&self.network);
        let miner = Arc::clone(&self.miner);
        let stopping = Arc::clone(&self.stopping);
        thread::Builder::new()
            .name("cinder-stats".to_string())
            .spawn(move || loop {
                let wake_at = Instant::now() + interval;
                while Instant::now() < wake_at {
                    if stopping.load(Ordering::SeqCst) {
                        return;
                    }
                    thread::sleep(Duration::from_millis(100));
                }
                let peers = network.stats().map(|s| s.connected_peers).unwrap_or(0);
                let mempool_len = mempool.lock().map(|m| m.len()).unwrap_or(0);
                let (height, tip) = store
                    .tip()
                    .map(|b| (b.index, b.hash))
                    .unwrap_or((0, String::new()));
                info!(
                    peers,
                    height,
                    tip = %tip,
                    mempool = mempool_len,
                    mining = miner.is_running(),
                    "[stats]"
                );
            })?;
        Ok(())
    }

    /// Stop mining, close the network and flush the store. Safe to call twice.
    pub fn shutdown(&self) -> Result<(), NodeError> {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("shutting down");
        if let Err(err) = self.miner.shutdown() {
            warn!(error = %err, "miner shutdown failed");
        }
        if let Err(err) = self.network.shutdown() {
            warn!(error = %err, "network shutdown failed");
        }
        self.store.flush()?;
        Ok(())
    }
}
