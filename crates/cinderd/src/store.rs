//! Ledger store: balances, the block list and balance snapshots.
//!
//! One mutex guards the in-memory state and every persisted swap, so a
//! block mined locally and a block relayed by a peer can never interleave.
//! Balances, snapshots and mining stats live in JSON files replaced
//! atomically (temp file, fsync, rename); blocks live in `chain.sled`.
//!
//! A block is written to sled before the balances file, and the balances
//! file records the height of the last block applied to it. `open` replays
//! any block above that height, so a crash between the two writes never
//! leaves a block whose transactions are missing from the balances.

use cinder_consensus::{
    block_hash, candidate_block, genesis_block, seal, validate_successor, verify_linkage, Block,
    ConsensusError, DifficultyPolicy,
};
use cinder_ledger::{BalanceSnapshot, BalanceTable, LedgerError, Transaction};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sled::Db;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::StorageConfig;
use crate::mining::MiningStats;
use crate::now_millis;

const DB_SCHEMA_VERSION: u32 = 1;
pub const BALANCES_FILE: &str = "balances.json";
pub const SNAPSHOTS_FILE: &str = "snapshots.json";
pub const MINING_STATS_FILE: &str = "mining_stats.json";
pub const PEERS_FILE: &str = "peers.json";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
    #[error("invalid prev hash: expected {expected}, got {got}")]
    InvalidPrevHash { expected: String, got: String },
    #[error("invalid block: {0}")]
    InvalidBlock(String),
    #[error("consensus error: {0}")]
    Consensus(ConsensusError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("lock poisoned: {0}")]
    Lock(&'static str),
    #[error("schema error: {0}")]
    Schema(String),
}

impl StoreError {
    /// True when the block or transaction itself is invalid, false for local
    /// failures (I/O, sled, poisoned locks) that may succeed on a retry.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            StoreError::Ledger(_)
                | StoreError::InvalidPrevHash { .. }
                | StoreError::InvalidBlock(_)
                | StoreError::Consensus(_)
        )
    }
}

impl From<ConsensusError> for StoreError {
    fn from(err: ConsensusError) -> Self {
        match err {
            ConsensusError::InvalidPrevHash { expected, got } => {
                StoreError::InvalidPrevHash { expected, got }
            }
            ConsensusError::Ledger(err) => StoreError::Ledger(err),
            other => StoreError::Consensus(other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub snapshot_interval: Duration,
    pub max_snapshots: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            snapshot_interval: Duration::from_secs(300),
            max_snapshots: 200,
        }
    }
}

impl From<&StorageConfig> for StoreConfig {
    fn from(cfg: &StorageConfig) -> Self {
        Self {
            snapshot_interval: Duration::from_secs(cfg.snapshot_interval_secs),
            max_snapshots: cfg.max_snapshots,
        }
    }
}

/// Input for [`LedgerStore::build_candidate_block`].
#[derive(Debug, Clone)]
pub struct CandidateRequest {
    pub miner_address: String,
    pub reward_amount: f64,
    pub extra_tx: Vec<Transaction>,
    pub timestamp: Option<i64>,
}

/// Contents of `balances.json`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalancesFile {
    #[serde(default)]
    pub applied_height: u64,
    #[serde(default)]
    pub balances: BalanceTable,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BalancesFileRef<'a> {
    applied_height: u64,
    balances: &'a BalanceTable,
}

#[derive(Debug)]
struct State {
    balances: BalanceTable,
    applied_height: u64,
    blocks: Vec<Block>,
    snapshots: Vec<BalanceSnapshot>,
    last_snapshot_at: Option<Instant>,
}

pub struct LedgerStore {
    dir: Option<PathBuf>,
    db: Option<Db>,
    policy: Arc<dyn DifficultyPolicy>,
    cfg: StoreConfig,
    state: Mutex<State>,
    stats_lock: Mutex<()>,
}

impl LedgerStore {
    /// Open (or create) a store. `data_dir = None` keeps everything in memory.
    pub fn open(
        data_dir: Option<PathBuf>,
        policy: Arc<dyn DifficultyPolicy>,
        cfg: StoreConfig,
    ) -> Result<Self, StoreError> {
        let (db, blocks, file, snapshots) = match data_dir.as_ref() {
            Some(dir) => {
                fs::create_dir_all(dir)?;
                let db = open_sled(dir)?;
                let mut blocks = load_blocks(&db)?;
                if blocks.is_empty() {
                    let genesis = genesis_block();
                    persist_block(&db, &genesis)?;
                    info!(hash = %genesis.hash, "created genesis block");
                    blocks.push(genesis);
                }
                let file: BalancesFile =
                    read_json_opt(&dir.join(BALANCES_FILE))?.unwrap_or_default();
                let snapshots: Vec<BalanceSnapshot> =
                    read_json_opt(&dir.join(SNAPSHOTS_FILE))?.unwrap_or_default();
                (Some(db), blocks, file, snapshots)
            }
            None => (
                None,
                vec![genesis_block()],
                BalancesFile::default(),
                Vec::new(),
            ),
        };

        if blocks[0] != genesis_block() {
            return Err(StoreError::InvalidBlock(format!(
                "stored genesis {} does not match",
                blocks[0].hash
            )));
        }
        verify_linkage(&blocks)?;

        let tip_height = blocks.last().map_or(0, |b| b.index);
        let BalancesFile {
            mut balances,
            mut applied_height,
        } = file;
        if applied_height < tip_height {
            for block in blocks.iter().filter(|b| b.index > applied_height) {
                balances.apply_all(&block.transactions)?;
            }
            warn!(
                from = applied_height,
                to = tip_height,
                "replayed blocks missing from balances"
            );
            applied_height = tip_height;
            if let Some(dir) = &data_dir {
                write_balances(dir, &balances, applied_height)?;
            }
        } else if applied_height > tip_height {
            warn!(
                applied = applied_height,
                tip = tip_height,
                "balances ahead of the stored chain"
            );
            applied_height = tip_height;
        }
        debug!(
            blocks = blocks.len(),
            accounts = balances.len(),
            snapshots = snapshots.len(),
            "ledger store loaded"
        );

        Ok(Self {
            dir: data_dir,
            db,
            policy,
            cfg,
            state: Mutex::new(State {
                balances,
                applied_height,
                blocks,
                snapshots,
                last_snapshot_at: None,
            }),
            stats_lock: Mutex::new(()),
        })
    }

    pub fn in_memory(policy: Arc<dyn DifficultyPolicy>) -> Result<Self, StoreError> {
        Self::open(None, policy, StoreConfig::default())
    }

    pub fn data_dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    pub fn policy(&self) -> Arc<dyn DifficultyPolicy> {
        Arc::clone(&self.policy)
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        self.state.lock().map_err(|_| StoreError::Lock("ledger state"))
    }

    pub fn balances(&self) -> Result<BTreeMap<String, f64>, StoreError> {
        Ok(self.lock()?.balances.entries().clone())
    }

    pub fn balance_table(&self) -> Result<BalanceTable, StoreError> {
        Ok(self.lock()?.balances.clone())
    }

    pub fn balance(&self, address: &str) -> Result<f64, StoreError> {
        Ok(self.lock()?.balances.get(address))
    }

    pub fn total_supply(&self) -> Result<f64, StoreError> {
        Ok(self.lock()?.balances.total_supply())
    }

    pub fn credit(&self, address: &str, amount: f64) -> Result<f64, StoreError> {
        self.mutate_balances(|table| table.credit(address, amount))
    }

    pub fn debit(&self, address: &str, amount: f64) -> Result<f64, StoreError> {
        self.mutate_balances(|table| table.debit(address, amount))
    }

    /// Debit + credit under one lock with a single persist; a failure leaves
    /// the ledger unchanged.
    pub fn transfer(&self, from: &str, to: &str, amount: f64) -> Result<(), StoreError> {
        self.mutate_balances(|table| table.transfer(from, to, amount))
    }

    fn mutate_balances<T>(
        &self,
        f: impl FnOnce(&mut BalanceTable) -> Result<T, LedgerError>,
    ) -> Result<T, StoreError> {
        let mut state = self.lock()?;
        let mut next = state.balances.clone();
        let out = f(&mut next)?;
        self.persist_balances(&next, state.applied_height)?;
        state.balances = next;
        self.snapshot_quietly(&mut state);
        Ok(out)
    }

    /// Append a block without touching balances.
    pub fn append_block(&self, block: Block) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        self.check_successor(&state, &block)?;
        self.persist_block_and_balances(&block, &state.balances)?;
        info!(height = block.index, hash = %block.hash, "block appended");
        state.applied_height = block.index;
        state.blocks.push(block);
        self.snapshot_quietly(&mut state);
        Ok(())
    }

    /// Append a block and apply its transactions, all-or-nothing.
    pub fn commit_block(&self, block: Block) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        self.check_successor(&state, &block)?;
        let mut next = state.balances.clone();
        next.apply_all(&block.transactions)?;
        self.persist_block_and_balances(&block, &next)?;
        info!(
            height = block.index,
            hash = %block.hash,
            txs = block.transactions.len(),
            "block committed"
        );
        state.balances = next;
        state.applied_height = block.index;
        state.blocks.push(block);
        self.snapshot_quietly(&mut state);
        Ok(())
    }

    /// Block into sled, then balances stamped with its height. A failed
    /// balance write takes the block back out of sled.
    fn persist_block_and_balances(
        &self,
        block: &Block,
        balances: &BalanceTable,
    ) -> Result<(), StoreError> {
        if let Some(db) = &self.db {
            persist_block(db, block)?;
        }
        if let Err(err) = self.persist_balances(balances, block.index) {
            if let Some(db) = &self.db {
                if let Err(undo) = unpersist_block(db, block) {
                    warn!(height = block.index, error = %undo, "failed to roll back block");
                }
            }
            return Err(err);
        }
        Ok(())
    }

    fn check_successor(&self, state: &State, block: &Block) -> Result<(), StoreError> {
        let tip = state
            .blocks
            .last()
            .ok_or_else(|| StoreError::InvalidBlock("empty chain".to_string()))?;
        validate_successor(tip, block, self.policy.as_ref())?;
        Ok(())
    }

    /// Unsealed successor of the current tip with the reward transaction first.
    pub fn build_candidate_block(&self, req: CandidateRequest) -> Result<Block, StoreError> {
        let state = self.lock()?;
        let tip = state
            .blocks
            .last()
            .ok_or_else(|| StoreError::InvalidBlock("empty chain".to_string()))?;
        let timestamp = req.timestamp.unwrap_or_else(now_millis);
        Ok(candidate_block(
            tip,
            &req.miner_address,
            req.reward_amount,
            req.extra_tx,
            timestamp,
        ))
    }

    pub fn seal_block(&self, candidate: &Block, nonce: u64) -> Block {
        seal(candidate, nonce)
    }

    /// Write a snapshot unless one was taken less than the snapshot interval ago.
    pub fn snapshot(&self, force: bool) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        self.take_snapshot(&mut state, force)
    }

    fn snapshot_quietly(&self, state: &mut State) {
        if let Err(err) = self.take_snapshot(state, false) {
            warn!(error = %err, "snapshot failed");
        }
    }

    fn take_snapshot(&self, state: &mut State, force: bool) -> Result<bool, StoreError> {
        if !force {
            if let Some(at) = state.last_snapshot_at {
                if at.elapsed() < self.cfg.snapshot_interval {
                    return Ok(false);
                }
            }
        }
        let mut snapshots = state.snapshots.clone();
        snapshots.push(BalanceSnapshot::capture(&state.balances, now_millis()));
        if snapshots.len() > self.cfg.max_snapshots {
            let excess = snapshots.len() - self.cfg.max_snapshots;
            snapshots.drain(..excess);
        }
        if let Some(dir) = &self.dir {
            write_json_atomic(&dir.join(SNAPSHOTS_FILE), &snapshots)?;
        }
        state.snapshots = snapshots;
        state.last_snapshot_at = Some(Instant::now());
        debug!(
            total_supply = state.balances.total_supply(),
            count = state.snapshots.len(),
            "balance snapshot written"
        );
        Ok(true)
    }

    pub fn snapshots(&self) -> Result<Vec<BalanceSnapshot>, StoreError> {
        Ok(self.lock()?.snapshots.clone())
    }

    /// Restore balances from the latest snapshot when it holds a positive
    /// supply and the current supply is zero or strictly smaller.
    pub fn restore_from_snapshot(&self) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        let latest = match state.snapshots.last() {
            Some(snapshot) if snapshot.total_supply > 0.0 => snapshot.clone(),
            _ => return Ok(false),
        };
        let current = state.balances.total_supply();
        if current > 0.0 && current >= latest.total_supply {
            return Ok(false);
        }
        let restored = latest.to_table();
        self.persist_balances(&restored, state.applied_height)?;
        state.balances = restored;
        warn!(
            from_supply = current,
            to_supply = latest.total_supply,
            snapshot_at = latest.timestamp,
            "balances restored from snapshot"
        );
        Ok(true)
    }

    pub fn tip(&self) -> Result<Block, StoreError> {
        self.lock()?
            .blocks
            .last()
            .cloned()
            .ok_or_else(|| StoreError::InvalidBlock("empty chain".to_string()))
    }

    pub fn height(&self) -> Result<u64, StoreError> {
        Ok(self.tip()?.index)
    }

    pub fn block_count(&self) -> Result<usize, StoreError> {
        Ok(self.lock()?.blocks.len())
    }

    pub fn blocks_from(&self, index: u64, limit: usize) -> Result<Vec<Block>, StoreError> {
        let state = self.lock()?;
        let start = usize::try_from(index).unwrap_or(usize::MAX);
        Ok(state.blocks.iter().skip(start).take(limit).cloned().collect())
    }

    pub fn block_by_hash(&self, hash: &str) -> Result<Option<Block>, StoreError> {
        Ok(self.lock()?.blocks.iter().find(|b| b.hash == hash).cloned())
    }

    pub fn save_mining_stats(&self, stats: &MiningStats) -> Result<(), StoreError> {
        let _guard = self
            .stats_lock
            .lock()
            .map_err(|_| StoreError::Lock("mining stats"))?;
        if let Some(dir) = &self.dir {
            write_json_atomic(&dir.join(MINING_STATS_FILE), stats)?;
        }
        Ok(())
    }

    pub fn load_mining_stats(&self) -> Result<Option<MiningStats>, StoreError> {
        match &self.dir {
            Some(dir) => Ok(read_json_opt(&dir.join(MINING_STATS_FILE))?),
            None => Ok(None),
        }
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        let state = self.lock()?;
        self.persist_balances(&state.balances, state.applied_height)?;
        if let Some(dir) = &self.dir {
            write_json_atomic(&dir.join(SNAPSHOTS_FILE), &state.snapshots)?;
        }
        if let Some(db) = &self.db {
            db.flush()?;
        }
        Ok(())
    }

    fn persist_balances(&self, table: &BalanceTable, applied_height: u64) -> Result<(), StoreError> {
        if let Some(dir) = &self.dir {
            write_balances(dir, table, applied_height)?;
        }
        Ok(())
    }
}

fn write_balances(dir: &Path, balances: &BalanceTable, applied_height: u64) -> std::io::Result<()> {
    write_json_atomic(
        &dir.join(BALANCES_FILE),
        &BalancesFileRef {
            applied_height,
            balances,
        },
    )
}

pub(crate) fn open_sled(dir: &Path) -> Result<Db, StoreError> {
    let db = sled::open(dir.join("chain.sled"))?;
    ensure_db_schema(&db)?;
    Ok(db)
}

fn ensure_db_schema(db: &Db) -> Result<(), StoreError> {
    let meta = db.open_tree("meta")?;
    if let Some(val) = meta.get("schema_version")? {
        let bytes: [u8; 4] = val
            .as_ref()
            .try_into()
            .map_err(|_| StoreError::Schema("invalid schema_version".to_string()))?;
        let ver = u32::from_le_bytes(bytes);
        if ver != DB_SCHEMA_VERSION {
            return Err(StoreError::Schema(format!(
                "unsupported db schema version {ver}"
            )));
        }
        return Ok(());
    }
    meta.insert("schema_version", DB_SCHEMA_VERSION.to_le_bytes().to_vec())?;
    meta.flush()?;
    Ok(())
}

fn load_blocks(db: &Db) -> Result<Vec<Block>, StoreError> {
    let tree = db.open_tree("blocks")?;
    let mut blocks = Vec::new();
    for item in tree.iter() {
        let (_, value) = item?;
        let block: Block = serde_json::from_slice(&value)?;
        if block_hash(&block) != block.hash {
            return Err(StoreError::InvalidBlock(format!(
                "stored block {} has a bad hash",
                block.index
            )));
        }
        blocks.push(block);
    }
    Ok(blocks)
}

fn persist_block(db: &Db, block: &Block) -> Result<(), StoreError> {
    let tree = db.open_tree("blocks")?;
    tree.insert(block.index.to_be_bytes(), serde_json::to_vec(block)?)?;
    tree.flush()?;
    let meta = db.open_tree("meta")?;
    meta.insert("tip_height", block.index.to_le_bytes().to_vec())?;
    meta.flush()?;
    Ok(())
}

fn unpersist_block(db: &Db, block: &Block) -> Result<(), StoreError> {
    let tree = db.open_tree("blocks")?;
    tree.remove(block.index.to_be_bytes())?;
    tree.flush()?;
    let meta = db.open_tree("meta")?;
    meta.insert("tip_height", block.index.saturating_sub(1).to_le_bytes().to_vec())?;
    meta.flush()?;
    Ok(())
}

/// Replace `path` atomically: write `<path>.tmp`, fsync, rename.
pub(crate) fn write_json_atomic<T: Serialize + ?Sized>(
    path: &Path,
    value: &T,
) -> std::io::Result<()> {
    let data = serde_json::to_vec_pretty(value)?;
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);
    {
        let mut file = File::create(&tmp)?;
        file.write_all(&data)?;
        file.flush()?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}

pub fn read_json_opt<T: DeserializeOwned>(path: &Path) -> std::io::Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let data = fs::read(path)?;
    Ok(Some(serde_json::from_slice(&data)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_consensus::{mine, StaticDifficulty};
    use tempfile::tempdir;

    fn easy() -> Arc<dyn DifficultyPolicy> {
        Arc::new(StaticDifficulty::new("0", 10.0).unwrap())
    }

    fn mined_next(store: &LedgerStore, miner: &str, extra: Vec<Transaction>) -> Block {
        let candidate = store
            .build_candidate_block(CandidateRequest {
                miner_address: miner.to_string(),
                reward_amount: 10.0,
                extra_tx: extra,
                timestamp: None,
            })
            .unwrap();
        mine(&candidate, 100_000, "0").block.unwrap()
    }

    #[test]
    fn genesis_created_once() {
        let temp = tempdir().unwrap();
        let dir = temp.path().to_path_buf();
        let first_hash = {
            let store = LedgerStore::open(Some(dir.clone()), easy(), StoreConfig::default()).unwrap();
            assert_eq!(store.block_count().unwrap(), 1);
            store.tip().unwrap().hash
        };
        let store = LedgerStore::open(Some(dir), easy(), StoreConfig::default()).unwrap();
        assert_eq!(store.block_count().unwrap(), 1);
        assert_eq!(store.tip().unwrap().hash, first_hash);
        assert_eq!(store.tip().unwrap(), genesis_block());
    }

    #[test]
    fn balances_survive_reopen() {
        let temp = tempdir().unwrap();
        let dir = temp.path().to_path_buf();
        {
            let store = LedgerStore::open(Some(dir.clone()), easy(), StoreConfig::default()).unwrap();
            store.credit("alice", 7.5).unwrap();
            store.transfer("alice", "bob", 2.5).unwrap();
        }
        let store = LedgerStore::open(Some(dir.clone()), easy(), StoreConfig::default()).unwrap();
        assert_eq!(store.balance("alice").unwrap(), 5.0);
        assert_eq!(store.balance("bob").unwrap(), 2.5);
        assert!(!dir.join("balances.json.tmp").exists());
    }

    #[test]
    fn transfer_is_atomic() {
        let store = LedgerStore::in_memory(easy()).unwrap();
        store.credit("a", 3.0).unwrap();
        let before = store.balances().unwrap();
        let err = store.transfer("a", "b", 5.0).unwrap_err();
        assert!(matches!(
            err,
            StoreError::Ledger(LedgerError::InsufficientBalance { .. })
        ));
        assert_eq!(store.balances().unwrap(), before);
        assert!(matches!(
            store.transfer("a", "a", 1.0),
            Err(StoreError::Ledger(LedgerError::SameAddress(_)))
        ));
        store.transfer("a", "b", 1.0).unwrap();
        assert_eq!(store.total_supply().unwrap(), 3.0);
    }

    #[test]
    fn invalid_amount_rejected() {
        let store = LedgerStore::in_memory(easy()).unwrap();
        assert!(matches!(
            store.credit("a", -1.0),
            Err(StoreError::Ledger(LedgerError::InvalidAmount(_)))
        ));
        assert!(matches!(
            store.debit("a", f64::NAN),
            Err(StoreError::Ledger(LedgerError::InvalidAmount(_)))
        ));
    }

    #[test]
    fn append_rejects_wrong_prev_hash() {
        let store = LedgerStore::in_memory(easy()).unwrap();
        let block = mined_next(&store, "m", vec![]);
        store.append_block(block.clone()).unwrap();
        // same parent again: prevHash now points at genesis, not the tip
        let err = store.append_block(block).unwrap_err();
        assert!(matches!(err, StoreError::InvalidPrevHash { .. }));
        assert_eq!(store.block_count().unwrap(), 2);
        assert_eq!(store.total_supply().unwrap(), 0.0);
    }

    #[test]
    fn commit_block_credits_reward_and_links() {
        let temp = tempdir().unwrap();
        let dir = temp.path().to_path_buf();
        {
            let store = LedgerStore::open(Some(dir.clone()), easy(), StoreConfig::default()).unwrap();
            for _ in 0..3 {
                let block = mined_next(&store, "miner", vec![]);
                store.commit_block(block).unwrap();
            }
            assert_eq!(store.balance("miner").unwrap(), 30.0);
        }
        let store = LedgerStore::open(Some(dir), easy(), StoreConfig::default()).unwrap();
        let blocks = store.blocks_from(0, 100).unwrap();
        assert_eq!(blocks.len(), 4);
        for pair in blocks.windows(2) {
            assert_eq!(pair[1].prev_hash, pair[0].hash);
        }
        for block in &blocks[1..] {
            assert!(block.hash.starts_with('0'));
        }
        assert_eq!(store.height().unwrap(), 3);
        let tip_hash = store.tip().unwrap().hash;
        assert!(store.block_by_hash(&tip_hash).unwrap().is_some());
    }

    #[test]
    fn commit_block_with_bad_transfer_changes_nothing() {
        let store = LedgerStore::in_memory(easy()).unwrap();
        let block = mined_next(&store, "m", vec![Transaction::transfer("nobody", "x", 1.0)]);
        assert!(matches!(
            store.commit_block(block),
            Err(StoreError::Ledger(LedgerError::InsufficientBalance { .. }))
        ));
        assert_eq!(store.block_count().unwrap(), 1);
        assert!(store.balances().unwrap().is_empty());
    }

    #[test]
    fn commit_block_rejects_large_reward() {
        let store = LedgerStore::in_memory(easy()).unwrap();
        let candidate = store
            .build_candidate_block(CandidateRequest {
                miner_address: "m".into(),
                reward_amount: 11.0,
                extra_tx: vec![],
                timestamp: Some(1),
            })
            .unwrap();
        let block = mine(&candidate, 100_000, "0").block.unwrap();
        assert!(matches!(
            store.commit_block(block),
            Err(StoreError::Consensus(ConsensusError::InvalidCoinbase(_)))
        ));
    }

    #[test]
    fn candidate_is_deterministic() {
        let store = LedgerStore::in_memory(easy()).unwrap();
        let req = CandidateRequest {
            miner_address: "m".into(),
            reward_amount: 10.0,
            extra_tx: vec![Transaction::transfer("a", "b", 1.0)],
            timestamp: Some(1_700_000_000_500),
        };
        let a = store.build_candidate_block(req.clone()).unwrap();
        let b = store.build_candidate_block(req).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.index, 1);
        assert!(a.hash.is_empty());
        assert!(a.transactions[0].is_coinbase());
        assert_eq!(store.seal_block(&a, 7).hash, block_hash(&store.seal_block(&a, 7)));
    }

    #[test]
    fn snapshots_rate_limited_and_capped() {
        let store = LedgerStore::open(
            None,
            easy(),
            StoreConfig {
                snapshot_interval: Duration::from_secs(3600),
                max_snapshots: 3,
            },
        )
        .unwrap();
        store.credit("a", 1.0).unwrap();
        assert_eq!(store.snapshots().unwrap().len(), 1);
        store.credit("a", 1.0).unwrap();
        assert!(!store.snapshot(false).unwrap());
        assert_eq!(store.snapshots().unwrap().len(), 1);
        for _ in 0..5 {
            assert!(store.snapshot(true).unwrap());
        }
        let snaps = store.snapshots().unwrap();
        assert_eq!(snaps.len(), 3);
        assert_eq!(snaps.last().unwrap().total_supply, 2.0);
    }

    #[test]
    fn restore_is_idempotent() {
        let store = LedgerStore::in_memory(easy()).unwrap();
        assert!(!store.restore_from_snapshot().unwrap());
        store.credit("a", 10.0).unwrap();
        store.snapshot(true).unwrap();
        store.debit("a", 4.0).unwrap();
        assert!(store.restore_from_snapshot().unwrap());
        assert_eq!(store.balance("a").unwrap(), 10.0);
        assert!(!store.restore_from_snapshot().unwrap());
        assert_eq!(store.balance("a").unwrap(), 10.0);
    }

    #[test]
    fn restore_after_lost_balances_file() {
        let temp = tempdir().unwrap();
        let dir = temp.path().to_path_buf();
        {
            let store = LedgerStore::open(Some(dir.clone()), easy(), StoreConfig::default()).unwrap();
            store.credit("a", 4.0).unwrap();
            store.snapshot(true).unwrap();
            store.flush().unwrap();
        }
        fs::remove_file(dir.join(BALANCES_FILE)).unwrap();
        let store = LedgerStore::open(Some(dir), easy(), StoreConfig::default()).unwrap();
        assert_eq!(store.total_supply().unwrap(), 0.0);
        assert!(store.restore_from_snapshot().unwrap());
        assert_eq!(store.balance("a").unwrap(), 4.0);
    }

    #[test]
    fn mining_stats_round_trip() {
        let temp = tempdir().unwrap();
        let store =
            LedgerStore::open(Some(temp.path().to_path_buf()), easy(), StoreConfig::default())
                .unwrap();
        assert!(store.load_mining_stats().unwrap().is_none());
        let stats = MiningStats {
            total_blocks_mined: 3,
            total_hashes: 99,
            ..MiningStats::default()
        };
        store.save_mining_stats(&stats).unwrap();
        assert_eq!(store.load_mining_stats().unwrap(), Some(stats));
    }

    #[test]
    fn rejection_vs_local_failure() {
        assert!(StoreError::InvalidPrevHash {
            expected: "a".into(),
            got: "b".into()
        }
        .is_rejection());
        assert!(StoreError::Ledger(LedgerError::InvalidAmount(0.0)).is_rejection());
        assert!(!StoreError::Lock("ledger state").is_rejection());
        assert!(!StoreError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk")).is_rejection());
    }

    #[test]
    fn failed_balance_write_rolls_back_block() {
        let temp = tempdir().unwrap();
        let dir = temp.path().to_path_buf();
        {
            let store = LedgerStore::open(Some(dir.clone()), easy(), StoreConfig::default()).unwrap();
            // a non-empty directory in place of the balances file makes the rename fail
            fs::create_dir_all(dir.join(BALANCES_FILE).join("blocker")).unwrap();
            let block = mined_next(&store, "miner", vec![]);
            assert!(matches!(store.commit_block(block), Err(StoreError::Io(_))));
            assert_eq!(store.block_count().unwrap(), 1);
            assert_eq!(store.balance("miner").unwrap(), 0.0);
        }
        fs::remove_dir_all(dir.join(BALANCES_FILE)).unwrap();

        let store = LedgerStore::open(Some(dir.clone()), easy(), StoreConfig::default()).unwrap();
        assert_eq!(store.block_count().unwrap(), 1);
        assert_eq!(store.total_supply().unwrap(), 0.0);
        let block = mined_next(&store, "miner", vec![]);
        store.commit_block(block).unwrap();
        assert_eq!(store.balance("miner").unwrap(), 10.0);
    }

    #[test]
    fn open_replays_blocks_missing_from_balances() {
        let temp = tempdir().unwrap();
        let dir = temp.path().to_path_buf();
        let unapplied = {
            let store = LedgerStore::open(Some(dir.clone()), easy(), StoreConfig::default()).unwrap();
            let block = mined_next(&store, "miner", vec![]);
            store.commit_block(block).unwrap();
            mined_next(&store, "miner", vec![])
        };
        {
            // block reached sled but the balances write never happened
            let db = open_sled(&dir).unwrap();
            persist_block(&db, &unapplied).unwrap();
        }

        let store = LedgerStore::open(Some(dir.clone()), easy(), StoreConfig::default()).unwrap();
        assert_eq!(store.height().unwrap(), 2);
        assert_eq!(store.balance("miner").unwrap(), 20.0);
        let file: BalancesFile = read_json_opt(&dir.join(BALANCES_FILE)).unwrap().unwrap();
        assert_eq!(file.applied_height, 2);
        assert_eq!(file.balances.get("miner"), 20.0);
        drop(store);

        let store = LedgerStore::open(Some(dir), easy(), StoreConfig::default()).unwrap();
        assert_eq!(store.balance("miner").unwrap(), 20.0);
    }

    #[test]
    fn schema_version_mismatch_rejected() {
        let temp = tempdir().unwrap();
        {
            let db = sled::open(temp.path().join("chain.sled")).unwrap();
            let meta = db.open_tree("meta").unwrap();
            meta.insert("schema_version", 9u32.to_le_bytes().to_vec()).unwrap();
            db.flush().unwrap();
        }
        let result = LedgerStore::open(
            Some(temp.path().to_path_buf()),
            easy(),
            StoreConfig::default(),
        );
        assert!(matches!(result, Err(StoreError::Schema(_))));
    }
}
