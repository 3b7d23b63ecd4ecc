//! Mining engine.
//!
//! `start()` spawns a dedicated worker that runs [`MiningEngine::tick`] every
//! interval until `stop()`. A tick builds a candidate on the current tip,
//! searches up to `max_attempts` nonces and commits the first block whose
//! hash meets the policy target. Stop never interrupts a tick in flight.

use cinder_consensus::{mine, Block};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::block_template::{select_transactions, MAX_BLOCK_TXS};
use crate::config::MiningConfig;
use crate::mempool::Mempool;
use crate::now_millis;
use crate::store::{CandidateRequest, LedgerStore, StoreError};

/// Receives every block this node mines.
pub trait BlockBroadcaster: Send + Sync {
    fn broadcast_block(&self, block: &Block);
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MiningStats {
    pub running: bool,
    pub started_at: Option<i64>,
    pub last_block_at: Option<i64>,
    pub total_blocks_mined: u64,
    pub total_hashes: u64,
    pub hashrate: f64,
}

#[derive(Debug, Clone)]
pub struct MinerConfig {
    pub miner_address: String,
    pub interval: Duration,
    pub max_attempts: u64,
}

impl From<&MiningConfig> for MinerConfig {
    fn from(cfg: &MiningConfig) -> Self {
        Self {
            miner_address: cfg.miner_address.clone(),
            interval: cfg.interval(),
            max_attempts: cfg.max_attempts,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MiningError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("lock poisoned: {0}")]
    Lock(&'static str),
    #[error("no miner address configured")]
    MissingMinerAddress,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    Mined(Block),
    Exhausted { attempts: u64 },
}

#[derive(Debug, Default)]
struct Control {
    running: bool,
    generation: u64,
}

struct Inner {
    cfg: MinerConfig,
    store: Arc<LedgerStore>,
    mempool: Arc<Mutex<Mempool>>,
    broadcaster: Mutex<Option<Arc<dyn BlockBroadcaster>>>,
    stats: Mutex<MiningStats>,
    last_measure: Mutex<Instant>,
    control: Mutex<Control>,
    wake: Condvar,
    tick_lock: Mutex<()>,
}

pub struct MiningEngine {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

fn lock<'a, T>(m: &'a Mutex<T>, what: &'static str) -> Result<MutexGuard<'a, T>, MiningError> {
    m.lock().map_err(|_| MiningError::Lock(what))
}

impl MiningEngine {
    /// Counters are reloaded from the store; `running` always starts false.
    pub fn new(
        cfg: MinerConfig,
        store: Arc<LedgerStore>,
        mempool: Arc<Mutex<Mempool>>,
    ) -> Result<Self, MiningError> {
        let mut stats = store.load_mining_stats()?.unwrap_or_default();
        stats.running = false;
        Ok(Self {
            inner: Arc::new(Inner {
                cfg,
                store,
                mempool,
                broadcaster: Mutex::new(None),
                stats: Mutex::new(stats),
                last_measure: Mutex::new(Instant::now()),
                control: Mutex::new(Control::default()),
                wake: Condvar::new(),
                tick_lock: Mutex::new(()),
            }),
            worker: Mutex::new(None),
        })
    }

    pub fn set_broadcaster(&self, broadcaster: Arc<dyn BlockBroadcaster>) -> Result<(), MiningError> {
        *lock(&self.inner.broadcaster, "broadcaster")? = Some(broadcaster);
        Ok(())
    }

    /// Returns false when already running.
    pub fn start(&self) -> Result<bool, MiningError> {
        if self.inner.cfg.miner_address.trim().is_empty() {
            return Err(MiningError::MissingMinerAddress);
        }
        let generation = {
            let mut control = lock(&self.inner.control, "mining control")?;
            if control.running {
                return Ok(false);
            }
            control.running = true;
            control.generation += 1;
            control.generation
        };
        {
            let mut stats = lock(&self.inner.stats, "mining stats")?;
            stats.running = true;
            stats.started_at = Some(now_millis());
            self.inner.store.save_mining_stats(&stats)?;
        }
        *lock(&self.inner.last_measure, "hashrate clock")? = Instant::now();

        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name("cinder-miner".to_string())
            .spawn(move || inner.run_worker(generation))?;
        // a previous worker exits on its own once it sees the new generation
        *lock(&self.worker, "mining worker")? = Some(handle);
        info!(miner = %self.inner.cfg.miner_address, "mining started");
        Ok(true)
    }

    /// Returns false when already stopped.
    pub fn stop(&self) -> Result<bool, MiningError> {
        {
            let mut control = lock(&self.inner.control, "mining control")?;
            if !control.running {
                return Ok(false);
            }
            control.running = false;
        }
        self.inner.wake.notify_all();
        let mut stats = lock(&self.inner.stats, "mining stats")?;
        stats.running = false;
        self.inner.store.save_mining_stats(&stats)?;
        info!(blocks = stats.total_blocks_mined, "mining stopped");
        Ok(true)
    }

    /// Stop and wait for the worker to finish its current tick.
    pub fn shutdown(&self) -> Result<(), MiningError> {
        self.stop()?;
        let handle = lock(&self.worker, "mining worker")?.take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("mining worker panicked");
            }
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .control
            .lock()
            .map(|c| c.running)
            .unwrap_or(false)
    }

    pub fn stats(&self) -> Result<MiningStats, MiningError> {
        Ok(lock(&self.inner.stats, "mining stats")?.clone())
    }

    pub fn tick(&self) -> Result<TickOutcome, MiningError> {
        self.inner.tick()
    }
}

impl Inner {
    fn run_worker(&self, generation: u64) {
        debug!(generation, "mining worker up");
        loop {
            let guard = match self.control.lock() {
                Ok(guard) => guard,
                Err(_) => return,
            };
            let waited = self.wake.wait_timeout_while(guard, self.cfg.interval, |c| {
                c.running && c.generation == generation
            });
            match waited {
                Ok((control, _)) => {
                    if !control.running || control.generation != generation {
                        break;
                    }
                }
                Err(_) => return,
            }
            if let Err(err) = self.tick() {
                warn!(error = %err, "mining tick failed");
            }
        }
        debug!(generation, "mining worker down");
    }

    fn tick(&self) -> Result<TickOutcome, MiningError> {
        let _serial = lock(&self.tick_lock, "mining tick")?;
        if self.cfg.miner_address.trim().is_empty() {
            return Err(MiningError::MissingMinerAddress);
        }
        let policy = self.store.policy();
        let target = policy.current_target();
        let reward = policy.current_reward();

        let balances = self.store.balance_table()?;
        let extra_tx = {
            let mempool = lock(&self.mempool, "mempool")?;
            select_transactions(&mempool, &balances, MAX_BLOCK_TXS)
        };
        let candidate = self.store.build_candidate_block(CandidateRequest {
            miner_address: self.cfg.miner_address.clone(),
            reward_amount: reward,
            extra_tx,
            timestamp: None,
        })?;

        let outcome = mine(&candidate, self.cfg.max_attempts, &target);
        let committed = match outcome.block {
            Some(block) => self.store.commit_block(block.clone()).map(|_| Some(block)),
            None => Ok(None),
        };
        self.record(outcome.attempts, matches!(committed, Ok(Some(_))))?;

        match committed? {
            Some(block) => {
                let removed = lock(&self.mempool, "mempool")?.remove_confirmed(&block);
                info!(
                    height = block.index,
                    hash = %block.hash,
                    nonce = block.nonce,
                    txs = removed,
                    "mined block"
                );
                let broadcaster = lock(&self.broadcaster, "broadcaster")?.clone();
                if let Some(broadcaster) = broadcaster {
                    broadcaster.broadcast_block(&block);
                }
                Ok(TickOutcome::Mined(block))
            }
            None => {
                debug!(attempts = outcome.attempts, target = %target, "no block this tick");
                Ok(TickOutcome::Exhausted {
                    attempts: outcome.attempts,
                })
            }
        }
    }

    fn record(&self, attempts: u64, mined: bool) -> Result<(), MiningError> {
        let elapsed = {
            let mut last = lock(&self.last_measure, "hashrate clock")?;
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };
        let mut stats = lock(&self.stats, "mining stats")?;
        stats.total_hashes = stats.total_hashes.saturating_add(attempts);
        stats.hashrate = attempts as f64 / elapsed.as_secs_f64().max(0.001);
        if mined {
            stats.total_blocks_mined += 1;
            stats.last_block_at = Some(now_millis());
        }
        self.store.save_mining_stats(&stats)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mempool::MempoolConfig;
    use cinder_consensus::StaticDifficulty;
    use cinder_ledger::Transaction;

    fn engine(prefix: &str, max_attempts: u64, interval_ms: u64) -> (Arc<LedgerStore>, Arc<Mutex<Mempool>>, MiningEngine) {
        let policy = Arc::new(StaticDifficulty::new(prefix, 10.0).unwrap());
        let store = Arc::new(LedgerStore::in_memory(policy).unwrap());
        let mempool = Arc::new(Mutex::new(Mempool::new(MempoolConfig::default())));
        let engine = MiningEngine::new(
            MinerConfig {
                miner_address: "miner".into(),
                interval: Duration::from_millis(interval_ms),
                max_attempts,
            },
            Arc::clone(&store),
            Arc::clone(&mempool),
        )
        .unwrap();
        (store, mempool, engine)
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<Block>>);

    impl BlockBroadcaster for Recorder {
        fn broadcast_block(&self, block: &Block) {
            self.0.lock().unwrap().push(block.clone());
        }
    }

    #[test]
    fn tick_mines_and_credits_reward() {
        let (store, _, engine) = engine("0", 100_000, 1_000);
        let recorder = Arc::new(Recorder::default());
        engine.set_broadcaster(recorder.clone()).unwrap();

        let outcome = engine.tick().unwrap();
        let block = match outcome {
            TickOutcome::Mined(block) => block,
            other => panic!("expected a block, got {other:?}"),
        };
        assert_eq!(store.block_count().unwrap(), 2);
        assert_eq!(store.balance("miner").unwrap(), 10.0);
        assert_eq!(store.total_supply().unwrap(), 10.0);
        let stats = engine.stats().unwrap();
        assert_eq!(stats.total_blocks_mined, 1);
        assert!(stats.total_hashes >= 1);
        assert!(stats.last_block_at.is_some());
        assert_eq!(recorder.0.lock().unwrap().as_slice(), &[block]);
    }

    #[test]
    fn tick_includes_and_clears_mempool() {
        let (store, mempool, engine) = engine("0", 100_000, 1_000);
        engine.tick().unwrap();
        let balances = store.balance_table().unwrap();
        mempool
            .lock()
            .unwrap()
            .add_tx(Transaction::transfer("miner", "bob", 4.0), &balances)
            .unwrap();
        engine.tick().unwrap();
        assert!(mempool.lock().unwrap().is_empty());
        assert_eq!(store.balance("bob").unwrap(), 4.0);
        assert_eq!(store.balance("miner").unwrap(), 16.0);
        assert_eq!(store.total_supply().unwrap(), 20.0);
    }

    #[test]
    fn exhausted_tick_counts_hashes_only() {
        let (store, _, engine) = engine(&"0".repeat(64), 5, 1_000);
        assert_eq!(
            engine.tick().unwrap(),
            TickOutcome::Exhausted { attempts: 5 }
        );
        assert_eq!(store.block_count().unwrap(), 1);
        let stats = engine.stats().unwrap();
        assert_eq!(stats.total_hashes, 5);
        assert_eq!(stats.total_blocks_mined, 0);
    }

    #[test]
    fn start_and_stop_are_idempotent() {
        let (_, _, engine) = engine("0", 10, 60_000);
        assert!(engine.start().unwrap());
        assert!(!engine.start().unwrap());
        assert!(engine.is_running());
        assert!(engine.stats().unwrap().running);
        assert!(engine.stop().unwrap());
        assert!(!engine.stop().unwrap());
        assert!(!engine.is_running());
        engine.shutdown().unwrap();
    }

    #[test]
    fn start_requires_miner_address() {
        let policy = Arc::new(StaticDifficulty::default());
        let store = Arc::new(LedgerStore::in_memory(policy).unwrap());
        let engine = MiningEngine::new(
            MinerConfig {
                miner_address: String::new(),
                interval: Duration::from_secs(1),
                max_attempts: 1,
            },
            store,
            Arc::new(Mutex::new(Mempool::default())),
        )
        .unwrap();
        assert!(matches!(engine.start(), Err(MiningError::MissingMinerAddress)));
    }

    #[test]
    fn worker_mines_until_stopped() {
        let (store, _, engine) = engine("0", 100_000, 10);
        engine.start().unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        while store.block_count().unwrap() < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        engine.shutdown().unwrap();

        let blocks = store.block_count().unwrap() as u64;
        assert!(blocks >= 3);
        let supply = store.total_supply().unwrap();
        assert_eq!(supply, 10.0 * (blocks - 1) as f64);
        assert_eq!(engine.stats().unwrap().total_blocks_mined, blocks - 1);

        thread::sleep(Duration::from_millis(100));
        assert_eq!(store.total_supply().unwrap(), supply);
        assert_eq!(store.block_count().unwrap() as u64, blocks);
    }
}
