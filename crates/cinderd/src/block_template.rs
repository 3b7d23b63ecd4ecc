use crate::mempool::{Mempool, MempoolEntry};
use cinder_ledger::{BalanceTable, Transaction};
use std::cmp::Ordering;

pub const MAX_BLOCK_TXS: usize = 10;

/// Pick up to `max` mempool transactions that apply cleanly, in order, on top
/// of `balances`. Ordered by timestamp, ties broken by txid.
pub fn select_transactions(mempool: &Mempool, balances: &BalanceTable, max: usize) -> Vec<Transaction> {
    let mut entries = mempool.entries();
    entries.sort_by(compare_entries);

    let mut simulated = balances.clone();
    let mut txs = Vec::new();
    for entry in entries {
        if txs.len() >= max {
            break;
        }
        if simulated.apply_tx(&entry.tx).is_err() {
            continue;
        }
        txs.push(entry.tx);
    }
    txs
}

fn compare_entries(a: &MempoolEntry, b: &MempoolEntry) -> Ordering {
    a.tx.timestamp
        .cmp(&b.tx.timestamp)
        .then_with(|| a.txid.cmp(&b.txid))
}
