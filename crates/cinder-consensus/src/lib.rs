use cinder_ledger::{put_str, Transaction};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const GENESIS_TIMESTAMP: i64 = 1_700_000_000_000;
pub const ZERO_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Block {
	pub index: u64,
	pub timestamp: i64,
	pub prev_hash: String,
	#[serde(default)]
	pub hash: String,
	#[serde(default)]
	pub nonce: u64,
	#[serde(default)]
	pub transactions: Vec<Transaction>,
	#[serde(default)]
	pub miner: Option<String>,
}

impl Block {
	pub fn is_genesis(&self) -> bool {
		self.index == 0
	}

	/// Sum of coinbase amounts carried by the block.
	pub fn reward(&self) -> f64 {
		self.transactions
			.iter()
			.filter(|tx| tx.is_coinbase())
			.map(|tx| tx.amount)
			.sum()
	}
}

#[derive(Debug, thiserror::Error)]
pub enum ConsensusError {
	#[error("ledger error: {0}")]
	Ledger(#[from] cinder_ledger::LedgerError),
	#[error("invalid prev hash: expected {expected}, got {got}")]
	InvalidPrevHash { expected: String, got: String },
	#[error("invalid index: expected {expected}, got {got}")]
	InvalidIndex { expected: u64, got: u64 },
	#[error("hash mismatch: computed {computed}, claimed {claimed}")]
	HashMismatch { computed: String, claimed: String },
	#[error("insufficient work: {hash} does not start with {target}")]
	InsufficientWork { hash: String, target: String },
	#[error("invalid coinbase: {0}")]
	InvalidCoinbase(String),
	#[error("invalid target: {0:?}")]
	InvalidTarget(String),
}

/// Source of the current difficulty target and block reward.
pub trait DifficultyPolicy: Send + Sync {
	/// Lowercase hex prefix a block hash must start with.
	fn current_target(&self) -> String;
	fn current_reward(&self) -> f64;
}

#[derive(Debug, Clone, PartialEq)]
pub struct StaticDifficulty {
	pub prefix: String,
	pub reward: f64,
}

impl StaticDifficulty {
	pub fn new(prefix: impl Into<String>, reward: f64) -> Result<Self, ConsensusError> {
		let prefix = prefix.into();
		validate_target(&prefix)?;
		cinder_ledger::validate_amount(reward)?;
		Ok(Self { prefix, reward })
	}
}

impl Default for StaticDifficulty {
	fn default() -> Self {
		Self {
			prefix: "0000".to_string(),
			reward: 10.0,
		}
	}
}

impl DifficultyPolicy for StaticDifficulty {
	fn current_target(&self) -> String {
		self.prefix.clone()
	}

	fn current_reward(&self) -> f64 {
		self.reward
	}
}

pub fn validate_target(prefix: &str) -> Result<(), ConsensusError> {
	if prefix.len() > 64 || !prefix.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f')) {
		return Err(ConsensusError::InvalidTarget(prefix.to_string()));
	}
	Ok(())
}

/// Canonical block bytes; the `hash` field is never part of the encoding.
pub fn canonical_bytes(block: &Block) -> Vec<u8> {
	let mut bytes = Vec::with_capacity(128 + block.transactions.len() * 64);
	bytes.extend_from_slice(&block.index.to_le_bytes());
	bytes.extend_from_slice(&block.timestamp.to_le_bytes());
	put_str(&mut bytes, &block.prev_hash);
	bytes.extend_from_slice(&block.nonce.to_le_bytes());
	match &block.miner {
		Some(miner) => {
			bytes.push(1);
			put_str(&mut bytes, miner);
		}
		None => bytes.push(0),
	}
	bytes.extend_from_slice(&(block.transactions.len() as u64).to_le_bytes());
	for tx in &block.transactions {
		bytes.extend_from_slice(&tx.canonical_bytes());
	}
	bytes
}

pub fn block_hash(block: &Block) -> String {
	let first = Sha256::digest(canonical_bytes(block));
	let second = Sha256::digest(first);
	hex::encode(second)
}

pub fn meets_target(hash: &str, prefix: &str) -> bool {
	hash.starts_with(prefix)
}

pub fn genesis_block() -> Block {
	let mut block = Block {
		index: 0,
		timestamp: GENESIS_TIMESTAMP,
		prev_hash: ZERO_HASH.to_string(),
		hash: String::new(),
		nonce: 0,
		transactions: Vec::new(),
		miner: None,
	};
	block.hash = block_hash(&block);
	block
}

/// Unsealed successor of `tip`: hash empty, nonce 0, coinbase first.
pub fn candidate_block(
	tip: &Block,
	miner: &str,
	reward: f64,
	extra_tx: Vec<Transaction>,
	timestamp: i64,
) -> Block {
	let mut transactions = Vec::with_capacity(extra_tx.len() + 1);
	transactions.push(Transaction::coinbase(miner, reward, timestamp, tip.index + 1));
	transactions.extend(extra_tx);
	Block {
		index: tip.index + 1,
		timestamp,
		prev_hash: tip.hash.clone(),
		hash: String::new(),
		nonce: 0,
		transactions,
		miner: Some(miner.to_string()),
	}
}

pub fn seal(candidate: &Block, nonce: u64) -> Block {
	let mut block = candidate.clone();
	block.nonce = nonce;
	block.hash = block_hash(&block);
	block
}

#[derive(Debug, Clone)]
pub struct MineOutcome {
	pub block: Option<Block>,
	pub attempts: u64,
}

/// Try nonces `0..max_attempts`, stopping at the first hash matching `prefix`.
pub fn mine(candidate: &Block, max_attempts: u64, prefix: &str) -> MineOutcome {
	let mut block = candidate.clone();
	for nonce in 0..max_attempts {
		block.nonce = nonce;
		let hash = block_hash(&block);
		if meets_target(&hash, prefix) {
			block.hash = hash;
			return MineOutcome {
				block: Some(block),
				attempts: nonce + 1,
			};
		}
	}
	MineOutcome {
		block: None,
		attempts: max_attempts,
	}
}

/// Check that `block` may extend `tip` under `policy`.
pub fn validate_successor(
	tip: &Block,
	block: &Block,
	policy: &dyn DifficultyPolicy,
) -> Result<(), ConsensusError> {
	if block.prev_hash != tip.hash {
		return Err(ConsensusError::InvalidPrevHash {
			expected: tip.hash.clone(),
			got: block.prev_hash.clone(),
		});
	}
	if block.index != tip.index + 1 {
		return Err(ConsensusError::InvalidIndex {
			expected: tip.index + 1,
			got: block.index,
		});
	}
	let computed = block_hash(block);
	if computed != block.hash {
		return Err(ConsensusError::HashMismatch {
			computed,
			claimed: block.hash.clone(),
		});
	}
	let target = policy.current_target();
	if !meets_target(&block.hash, &target) {
		return Err(ConsensusError::InsufficientWork {
			hash: block.hash.clone(),
			target,
		});
	}
	validate_transactions(block, policy.current_reward())
}

fn validate_transactions(block: &Block, max_reward: f64) -> Result<(), ConsensusError> {
	let mut coinbase_count = 0;
	for tx in &block.transactions {
		tx.validate()?;
		if tx.is_coinbase() {
			coinbase_count += 1;
			if tx.amount > max_reward {
				return Err(ConsensusError::InvalidCoinbase(format!(
					"reward {} exceeds {}",
					tx.amount, max_reward
				)));
			}
		}
	}
	if coinbase_count > 1 {
		return Err(ConsensusError::InvalidCoinbase(format!(
			"{} coinbase transactions",
			coinbase_count
		)));
	}
	Ok(())
}

/// Check prev-hash linkage and hashes across a whole chain, genesis included.
pub fn verify_linkage(blocks: &[Block]) -> Result<(), ConsensusError> {
	for (i, block) in blocks.iter().enumerate() {
		let computed = block_hash(block);
		if computed != block.hash {
			return Err(ConsensusError::HashMismatch {
				computed,
				claimed: block.hash.clone(),
			});
		}
		if block.index != i as u64 {
			return Err(ConsensusError::InvalidIndex {
				expected: i as u64,
				got: block.index,
			});
		}
		let expected_prev = if i == 0 {
			ZERO_HASH
		} else {
			blocks[i - 1].hash.as_str()
		};
		if block.prev_hash != expected_prev {
			return Err(ConsensusError::InvalidPrevHash {
				expected: expected_prev.to_string(),
				got: block.prev_hash.clone(),
			});
		}
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	fn easy() -> StaticDifficulty {
		StaticDifficulty::new("0", 10.0).unwrap()
	}

	#[test]
	fn genesis_is_deterministic() {
		let a = genesis_block();
		let b = genesis_block();
		assert_eq!(a, b);
		assert_eq!(a.prev_hash.len(), 64);
		assert_eq!(a.hash, block_hash(&a));
		assert!(a.miner.is_none());
	}

	#[test]
	fn hash_ignores_hash_field() {
		let mut block = genesis_block();
		let before = block_hash(&block);
		block.hash = "junk".into();
		assert_eq!(block_hash(&block), before);
	}

	#[test]
	fn mined_block_validates() {
		let tip = genesis_block();
		let candidate = candidate_block(&tip, "miner", 10.0, vec![], GENESIS_TIMESTAMP + 1);
		let outcome = mine(&candidate, 10_000, "0");
		let block = outcome.block.expect("prefix 0 is found quickly");
		assert!(outcome.attempts >= 1);
		assert!(block.hash.starts_with('0'));
		assert_eq!(seal(&candidate, block.nonce), block);
		validate_successor(&tip, &block, &easy()).unwrap();
		verify_linkage(&[tip, block]).unwrap();
	}

	#[test]
	fn wrong_prev_hash_rejected() {
		let tip = genesis_block();
		let mut candidate = candidate_block(&tip, "miner", 10.0, vec![], 1);
		candidate.prev_hash = "ff".repeat(32);
		let block = mine(&candidate, 10_000, "0").block.unwrap();
		assert!(matches!(
			validate_successor(&tip, &block, &easy()),
			Err(ConsensusError::InvalidPrevHash { .. })
		));
	}

	#[test]
	fn tampered_block_rejected() {
		let tip = genesis_block();
		let candidate = candidate_block(&tip, "miner", 10.0, vec![], 1);
		let mut block = mine(&candidate, 10_000, "0").block.unwrap();
		block.transactions[0].amount = 5.0;
		assert!(matches!(
			validate_successor(&tip, &block, &easy()),
			Err(ConsensusError::HashMismatch { .. })
		));
	}

	#[test]
	fn oversized_reward_rejected() {
		let tip = genesis_block();
		let candidate = candidate_block(&tip, "miner", 50.0, vec![], 1);
		let block = mine(&candidate, 10_000, "0").block.unwrap();
		assert!(matches!(
			validate_successor(&tip, &block, &easy()),
			Err(ConsensusError::InvalidCoinbase(_))
		));
	}

	#[test]
	fn unmet_target_rejected() {
		let tip = genesis_block();
		let candidate = candidate_block(&tip, "miner", 10.0, vec![], 1);
		let block = mine(&candidate, 10_000, "0").block.unwrap();
		// mined against "0", so it can never start with "1"
		let other = StaticDifficulty::new("1", 10.0).unwrap();
		assert!(matches!(
			validate_successor(&tip, &block, &other),
			Err(ConsensusError::InsufficientWork { .. })
		));
	}

	#[test]
	fn mine_gives_up_after_max_attempts() {
		let candidate = candidate_block(&genesis_block(), "miner", 10.0, vec![], 1);
		let outcome = mine(&candidate, 3, &"0".repeat(64));
		assert!(outcome.block.is_none());
		assert_eq!(outcome.attempts, 3);
	}

	#[test]
	fn target_must_be_lowercase_hex() {
		assert!(StaticDifficulty::new("00G", 1.0).is_err());
		assert!(StaticDifficulty::new("00A", 1.0).is_err());
		assert!(StaticDifficulty::new("", 1.0).is_ok());
		assert!(StaticDifficulty::new("00", 0.0).is_err());
	}

	#[test]
	fn block_json_is_camel_case() {
		let json = serde_json::to_string(&genesis_block()).unwrap();
		assert!(json.contains("\"prevHash\""));
		let back: Block = serde_json::from_str(&json).unwrap();
		assert_eq!(back, genesis_block());
	}
}
