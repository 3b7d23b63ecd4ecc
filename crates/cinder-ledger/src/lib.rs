//! Cinder ledger library
//!
//! Provides the account-model transaction type, its canonical binary
//! encoding, and an in-memory balance table whose mutations are
//! all-or-nothing.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Maximum allowed address length in bytes (DoS mitigation)
pub const MAX_ADDRESS_LEN: usize = 128;

/// Value transfer between two addresses. A transaction without `from` is a
/// coinbase (mining reward).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    pub to: String,
    pub amount: f64,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub nonce: u64,
}

/// Errors for ledger crate
#[derive(thiserror::Error, Debug)]
pub enum LedgerError {
    #[error("invalid amount: {0}")]
    InvalidAmount(f64),
    #[error("insufficient balance for {address}: have {balance}, need {amount}")]
    InsufficientBalance {
        address: String,
        balance: f64,
        amount: f64,
    },
    #[error("sender and recipient are the same address: {0}")]
    SameAddress(String),
    #[error("invalid address: {0:?}")]
    InvalidAddress(String),
    #[error("serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),
}

/// Reject amounts that are not finite or not strictly positive.
pub fn validate_amount(amount: f64) -> Result<(), LedgerError> {
    if !amount.is_finite() || amount <= 0.0 {
        return Err(LedgerError::InvalidAmount(amount));
    }
    Ok(())
}

fn validate_address(address: &str) -> Result<(), LedgerError> {
    if address.is_empty() || address.len() > MAX_ADDRESS_LEN {
        return Err(LedgerError::InvalidAddress(address.to_string()));
    }
    Ok(())
}

impl Transaction {
    /// Reward transaction crediting `to`.
    pub fn coinbase(to: impl Into<String>, amount: f64, timestamp: i64, nonce: u64) -> Self {
        Self {
            from: None,
            to: to.into(),
            amount,
            timestamp,
            nonce,
        }
    }

    pub fn transfer(from: impl Into<String>, to: impl Into<String>, amount: f64) -> Self {
        Self {
            from: Some(from.into()),
            to: to.into(),
            amount,
            timestamp: 0,
            nonce: 0,
        }
    }

    pub fn is_coinbase(&self) -> bool {
        self.from.is_none()
    }

    /// Validate fields: positive finite amount, bounded addresses, distinct endpoints
    pub fn validate(&self) -> Result<(), LedgerError> {
        validate_amount(self.amount)?;
        validate_address(&self.to)?;
        if let Some(from) = &self.from {
            validate_address(from)?;
            if from == &self.to {
                return Err(LedgerError::SameAddress(from.clone()));
            }
        }
        Ok(())
    }

    /// Serialize to JSON bytes
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, LedgerError> {
        serde_json::to_vec(self).map_err(LedgerError::from)
    }

    /// Deserialize from JSON bytes and run validation
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, LedgerError> {
        let tx: Transaction = serde_json::from_slice(bytes)?;
        tx.validate()?;
        Ok(tx)
    }

    /// Canonical bytes (binary deterministic encoding)
    /// Layout (all integers little-endian):
    /// - from: presence u8, then len u64 + utf8 bytes when present
    /// - to: len u64 + utf8 bytes
    /// - amount: f64 bit pattern u64
    /// - timestamp: i64
    /// - nonce: u64
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out: Vec<u8> = Vec::with_capacity(64);
        match &self.from {
            Some(from) => {
                out.push(1);
                put_str(&mut out, from);
            }
            None => out.push(0),
        }
        put_str(&mut out, &self.to);
        out.extend(&self.amount.to_bits().to_le_bytes());
        out.extend(&self.timestamp.to_le_bytes());
        out.extend(&self.nonce.to_le_bytes());
        out
    }

    /// Double-SHA256 of canonical bytes
    pub fn txid_bytes(&self) -> [u8; 32] {
        let first = Sha256::digest(self.canonical_bytes());
        let second = Sha256::digest(first);
        let mut out = [0u8; 32];
        out.copy_from_slice(&second);
        out
    }

    pub fn txid(&self) -> String {
        hex::encode(self.txid_bytes())
    }
}

/// Length-prefixed string, shared with the block encoding.
pub fn put_str(out: &mut Vec<u8>, s: &str) {
    out.extend(&(s.len() as u64).to_le_bytes());
    out.extend(s.as_bytes());
}

/// Address -> balance table. Non-positive or non-finite entries are never kept.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, f64>", into = "BTreeMap<String, f64>")]
pub struct BalanceTable {
    map: BTreeMap<String, f64>,
}

impl From<BTreeMap<String, f64>> for BalanceTable {
    fn from(map: BTreeMap<String, f64>) -> Self {
        Self {
            map: map
                .into_iter()
                .filter(|(_, v)| v.is_finite() && *v > 0.0)
                .collect(),
        }
    }
}

impl From<BalanceTable> for BTreeMap<String, f64> {
    fn from(table: BalanceTable) -> Self {
        table.map
    }
}

impl BalanceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, address: &str) -> f64 {
        self.map.get(address).copied().unwrap_or(0.0)
    }

    pub fn entries(&self) -> &BTreeMap<String, f64> {
        &self.map
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn total_supply(&self) -> f64 {
        self.map.values().fold(0.0, |acc, v| acc + v)
    }

    fn set(&mut self, address: &str, value: f64) {
        if value.is_finite() && value > 0.0 {
            self.map.insert(address.to_string(), value);
        } else {
            self.map.remove(address);
        }
    }

    /// Add `amount` to `address`, returning the new balance
    pub fn credit(&mut self, address: &str, amount: f64) -> Result<f64, LedgerError> {
        validate_amount(amount)?;
        validate_address(address)?;
        let next = self.get(address) + amount;
        if !next.is_finite() {
            return Err(LedgerError::InvalidAmount(amount));
        }
        self.set(address, next);
        Ok(next)
    }

    /// Remove `amount` from `address`, returning the new balance
    pub fn debit(&mut self, address: &str, amount: f64) -> Result<f64, LedgerError> {
        validate_amount(amount)?;
        validate_address(address)?;
        let balance = self.get(address);
        if balance < amount {
            return Err(LedgerError::InsufficientBalance {
                address: address.to_string(),
                balance,
                amount,
            });
        }
        let next = balance - amount;
        self.set(address, next);
        Ok(next)
    }

    /// Move `amount` from `from` to `to`. Every check runs before the first
    /// mutation, so a failed transfer leaves the table untouched.
    pub fn transfer(&mut self, from: &str, to: &str, amount: f64) -> Result<(), LedgerError> {
        if from == to {
            return Err(LedgerError::SameAddress(from.to_string()));
        }
        validate_amount(amount)?;
        validate_address(from)?;
        validate_address(to)?;
        let balance = self.get(from);
        if balance < amount {
            return Err(LedgerError::InsufficientBalance {
                address: from.to_string(),
                balance,
                amount,
            });
        }
        if !(self.get(to) + amount).is_finite() {
            return Err(LedgerError::InvalidAmount(amount));
        }
        self.set(from, balance - amount);
        let credited = self.get(to) + amount;
        self.set(to, credited);
        Ok(())
    }

    /// Apply one transaction: coinbase credits, anything else transfers
    pub fn apply_tx(&mut self, tx: &Transaction) -> Result<(), LedgerError> {
        tx.validate()?;
        match &tx.from {
            None => self.credit(&tx.to, tx.amount).map(|_| ()),
            Some(from) => self.transfer(from, &tx.to, tx.amount),
        }
    }

    /// Apply a batch of transactions atomically
    pub fn apply_all(&mut self, txs: &[Transaction]) -> Result<(), LedgerError> {
        let mut next = self.clone();
        for tx in txs {
            next.apply_tx(tx)?;
        }
        *self = next;
        Ok(())
    }
}

/// Point-in-time copy of the balance table used for crash recovery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceSnapshot {
    pub timestamp: i64,
    pub total_supply: f64,
    pub balances: BTreeMap<String, f64>,
}

impl BalanceSnapshot {
    pub fn capture(table: &BalanceTable, timestamp: i64) -> Self {
        Self {
            timestamp,
            total_supply: table.total_supply(),
            balances: table.entries().clone(),
        }
    }

    pub fn to_table(&self) -> BalanceTable {
        BalanceTable::from(self.balances.clone())
    }
}
