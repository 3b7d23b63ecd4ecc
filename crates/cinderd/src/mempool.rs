use cinder_consensus::Block;
use cinder_ledger::{BalanceTable, LedgerError, Transaction};
use std::collections::{HashMap, HashSet};

use crate::now_millis;

#[derive(Debug, Clone)]
pub struct MempoolConfig {
    pub max_txs: usize,
}

impl Default for MempoolConfig {
    fn default() -> Self {
        Self { max_txs: 10_000 }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MempoolError {
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
    #[error("coinbase transactions are not relayed")]
    Coinbase,
    #[error("duplicate txid")]
    DuplicateTx,
    #[error("insufficient funds for {address}: available {available}, needed {needed}")]
    InsufficientFunds {
        address: String,
        available: f64,
        needed: f64,
    },
    #[error("mempool full")]
    Full,
}

#[derive(Debug, Clone)]
pub struct MempoolEntry {
    pub tx: Transaction,
    pub txid: String,
    pub received_at: i64,
}

/// Pending transfers in arrival order.
#[derive(Debug, Default)]
pub struct Mempool {
    cfg: MempoolConfig,
    entries: Vec<MempoolEntry>,
    ids: HashSet<String>,
    pending_out: HashMap<String, f64>,
}

impl Mempool {
    pub fn new(cfg: MempoolConfig) -> Self {
        Self {
            cfg,
            entries: Vec::new(),
            ids: HashSet::new(),
            pending_out: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, txid: &str) -> bool {
        self.ids.contains(txid)
    }

    pub fn pending_outgoing(&self, address: &str) -> f64 {
        self.pending_out.get(address).copied().unwrap_or(0.0)
    }

    /// Admit `tx` if its sender can cover it on top of everything already
    /// pending from the same address. Returns the txid.
    pub fn add_tx(&mut self, tx: Transaction, balances: &BalanceTable) -> Result<String, MempoolError> {
        let from = tx.from.clone().ok_or(MempoolError::Coinbase)?;
        tx.validate()?;
        let txid = tx.txid();
        if self.ids.contains(&txid) {
            return Err(MempoolError::DuplicateTx);
        }
        if self.entries.len() >= self.cfg.max_txs {
            return Err(MempoolError::Full);
        }
        let needed = self.pending_outgoing(&from) + tx.amount;
        let available = balances.get(&from);
        if available < needed {
            return Err(MempoolError::InsufficientFunds {
                address: from,
                available,
                needed,
            });
        }

        *self.pending_out.entry(from).or_insert(0.0) += tx.amount;
        self.ids.insert(txid.clone());
        self.entries.push(MempoolEntry {
            tx,
            txid: txid.clone(),
            received_at: now_millis(),
        });
        Ok(txid)
    }

    pub fn remove_tx(&mut self, txid: &str) -> Option<MempoolEntry> {
        if !self.ids.remove(txid) {
            return None;
        }
        let pos = self.entries.iter().position(|e| e.txid == txid)?;
        let entry = self.entries.remove(pos);
        if let Some(from) = &entry.tx.from {
            let drop_key = match self.pending_out.get_mut(from) {
                Some(pending) => {
                    *pending -= entry.tx.amount;
                    *pending <= f64::EPSILON
                }
                None => false,
            };
            if drop_key {
                self.pending_out.remove(from);
            }
        }
        Some(entry)
    }

    /// Drop every transaction included in `block`. Returns how many were removed.
    pub fn remove_confirmed(&mut self, block: &Block) -> usize {
        block
            .transactions
            .iter()
            .filter(|tx| !tx.is_coinbase())
            .filter_map(|tx| self.remove_tx(&tx.txid()))
            .count()
    }

    pub fn entries(&self) -> Vec<MempoolEntry> {
        self.entries.clone()
    }
}
