//! Deterministic reference consensus rules.
//!
//! Signatures here are plain SHA-256 digests and carry no cryptographic
//! authority; real deployments supply their own [`ConsensusRules`] and
//! [`ChainWeightScorer`]. The scorer favours higher minter levels and is
//! keyed on the minter public key, so two candidates can never weigh the
//! same.

use num::BigUint;
use sha2::{Digest, Sha256};
use std::{
	collections::HashMap,
	sync::RwLock,
};

use super::{ChainWeightScorer, ConsensusRules, MinterEligibility, ValidationError};
use crate::types::{
	BlockSummary, BlockTiming, FullBlock, MintingIdentity, PublicKey, Signature,
};

const MAX_BLOCK_TRANSACTIONS: usize = 250;

/// Derives a minting identity from an opaque 32-byte seed.
pub fn identity_from_seed(seed: [u8; 32]) -> MintingIdentity {
	let mut hasher = Sha256::new();
	hasher.update(b"mintaka-identity");
	hasher.update(seed);
	MintingIdentity {
		public_key: PublicKey(hasher.finalize().into()),
		seed,
	}
}

/// Builds the fixed genesis block for a chain started at `timestamp`.
pub fn genesis_block(timestamp: u64) -> FullBlock {
	let mut block = FullBlock {
		summary: BlockSummary {
			height: 1,
			signature: Signature::NONE,
			reference: Signature::NONE,
			minter: PublicKey([0u8; 32]),
			minter_level: 0,
			timestamp,
		},
		transactions: vec![],
		state_delta: vec![],
	};
	block.summary.signature = block_digest(&block);
	block
}

fn block_digest(block: &FullBlock) -> Signature {
	let mut hasher = Sha256::new();
	hasher.update(b"mintaka-block");
	hasher.update(block.summary.height.to_be_bytes());
	hasher.update(block.summary.reference.0);
	hasher.update(block.summary.minter.0);
	hasher.update(block.summary.timestamp.to_be_bytes());
	for transaction in &block.transactions {
		hasher.update(transaction.signature.0);
	}
	hasher.update(&block.state_delta);
	Signature(hasher.finalize().into())
}

/// Reference rules backed by an in-memory eligibility registry.
#[derive(Default)]
pub struct BasicRules {
	timing: BlockTiming,
	levels: RwLock<HashMap<PublicKey, u8>>,
}

impl BasicRules {
	pub fn new(timing: BlockTiming) -> Self {
		BasicRules {
			timing,
			levels: RwLock::new(HashMap::new()),
		}
	}

	/// Registers or updates a minter's effective level.
	pub fn register(&self, minter: PublicKey, level: u8) {
		self.levels
			.write()
			.expect("Lock acquired")
			.insert(minter, level);
	}

	/// Revokes a minter's eligibility.
	pub fn revoke(&self, minter: &PublicKey) {
		self.levels.write().expect("Lock acquired").remove(minter);
	}
}

impl MinterEligibility for BasicRules {
	fn effective_level(&self, minter: &PublicKey) -> u8 {
		self.levels
			.read()
			.expect("Lock acquired")
			.get(minter)
			.copied()
			.unwrap_or(0)
	}
}

impl ConsensusRules for BasicRules {
	fn verify_signature(&self, block: &FullBlock) -> bool {
		block.summary.signature == block_digest(block)
	}

	fn validate(&self, parent: &BlockSummary, block: &FullBlock) -> Result<(), ValidationError> {
		if block.summary.reference != parent.signature {
			return Err(ValidationError::ParentMismatch);
		}
		if block.summary.height != parent.height + 1 {
			return Err(ValidationError::HeightMismatch);
		}
		if block.summary.timestamp <= parent.timestamp {
			return Err(ValidationError::TimestampOrder);
		}
		if block.summary.minter_level == 0 {
			return Err(ValidationError::IneligibleMinter);
		}
		if block.transactions.len() > MAX_BLOCK_TRANSACTIONS {
			return Err(ValidationError::TooManyTransactions);
		}
		for transaction in &block.transactions {
			if transaction.timestamp > block.summary.timestamp {
				return Err(ValidationError::TransactionNotYetValid(
					transaction.signature,
				));
			}
			if transaction.deadline <= block.summary.timestamp {
				return Err(ValidationError::TransactionExpired(transaction.signature));
			}
		}
		Ok(())
	}

	fn is_timestamp_valid(&self, block: &FullBlock, now: u64) -> bool {
		block.summary.timestamp <= now
	}

	fn build_candidate(
		&self,
		parent: &BlockSummary,
		identity: &MintingIdentity,
		_now: u64,
	) -> Option<FullBlock> {
		let level = self.effective_level(&identity.public_key);
		if level == 0 {
			return None;
		}

		// Contract-state assembly stands in for the heavy first-candidate
		// work; re-parented candidates reuse it untouched.
		let mut state = Sha256::new();
		state.update(b"mintaka-state");
		state.update(parent.signature.0);
		let state_delta = state.finalize().to_vec();

		let block = FullBlock {
			summary: BlockSummary {
				height: parent.height + 1,
				signature: Signature::NONE,
				reference: parent.signature,
				minter: identity.public_key,
				minter_level: level,
				timestamp: parent.timestamp + self.timing.target,
			},
			transactions: vec![],
			state_delta,
		};
		Some(self.sign(block, identity))
	}

	fn reparent(&self, first: &FullBlock, identity: &MintingIdentity) -> Option<FullBlock> {
		let level = self.effective_level(&identity.public_key);
		if level == 0 {
			return None;
		}

		let mut block = first.clone();
		block.summary.minter = identity.public_key;
		block.summary.minter_level = level;
		Some(self.sign(block, identity))
	}

	fn sign(&self, mut block: FullBlock, identity: &MintingIdentity) -> FullBlock {
		block.summary.minter = identity.public_key;
		block.summary.signature = block_digest(&block);
		block
	}
}

/// Reference chain-weight scorer.
///
/// Per-block weight is the numeric distance between the minter key and a
/// digest of the parent signature and height, shrunk by the minter level.
/// Chain weight accumulates the complement of each block weight, so more
/// blocks and stronger minters always weigh more.
#[derive(Clone, Copy, Default)]
pub struct BasicScorer;

fn max_distance() -> BigUint {
	BigUint::from(2u8).pow(256u32)
}

fn ideal_key(parent_signature: &Signature, height: u32) -> BigUint {
	let mut hasher = Sha256::new();
	hasher.update(b"mintaka-weight");
	hasher.update(parent_signature.0);
	hasher.update(height.to_be_bytes());
	BigUint::from_bytes_be(&hasher.finalize())
}

fn distance(a: BigUint, b: BigUint) -> BigUint {
	if a >= b {
		a - b
	} else {
		b - a
	}
}

impl ChainWeightScorer for BasicScorer {
	fn chain_weight(
		&self,
		ancestor_height: u32,
		ancestor_signature: &Signature,
		summaries: &[BlockSummary],
		max_height: u32,
	) -> BigUint {
		let mut weight = BigUint::from(0u8);
		let mut parent_height = ancestor_height;
		let mut parent_signature = *ancestor_signature;

		for summary in summaries {
			if summary.height > max_height {
				break;
			}
			let block_weight = self.block_weight(parent_height, &parent_signature, summary);
			weight += max_distance() - block_weight;
			parent_height = summary.height;
			parent_signature = summary.signature;
		}

		weight
	}

	fn block_weight(
		&self,
		_parent_height: u32,
		parent_signature: &Signature,
		summary: &BlockSummary,
	) -> BigUint {
		let ideal = ideal_key(parent_signature, summary.height);
		let minter = BigUint::from_bytes_be(&summary.minter.0);
		distance(ideal, minter) / BigUint::from(summary.minter_level.max(1) as u64 + 1)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::rules::ChainWeightScorer;

	fn rules() -> BasicRules {
		BasicRules::new(BlockTiming {
			target: 60_000,
			deviation: 30_000,
		})
	}

	fn identity(seed: u8) -> MintingIdentity {
		identity_from_seed([seed; 32])
	}

	#[test]
	fn candidate_builds_on_parent_and_verifies() {
		let rules = rules();
		let minter = identity(1);
		rules.register(minter.public_key, 3);

		let genesis = genesis_block(1_000);
		let candidate = rules
			.build_candidate(&genesis.summary, &minter, 100_000)
			.unwrap();

		assert_eq!(candidate.summary.height, 2);
		assert_eq!(candidate.summary.reference, genesis.summary.signature);
		assert_eq!(candidate.summary.minter_level, 3);
		assert!(rules.verify_signature(&candidate));
		assert!(rules.validate(&genesis.summary, &candidate).is_ok());
	}

	#[test]
	fn build_candidate_requires_eligibility() {
		let rules = rules();
		let minter = identity(1);
		let genesis = genesis_block(1_000);

		assert!(rules
			.build_candidate(&genesis.summary, &minter, 100_000)
			.is_none());

		rules.register(minter.public_key, 1);
		assert!(rules
			.build_candidate(&genesis.summary, &minter, 100_000)
			.is_some());

		rules.revoke(&minter.public_key);
		assert_eq!(rules.effective_level(&minter.public_key), 0);
	}

	#[test]
	fn reparent_reuses_state_but_changes_minter_and_signature() {
		let rules = rules();
		let first_minter = identity(1);
		let second_minter = identity(2);
		rules.register(first_minter.public_key, 2);
		rules.register(second_minter.public_key, 5);

		let genesis = genesis_block(1_000);
		let first = rules
			.build_candidate(&genesis.summary, &first_minter, 100_000)
			.unwrap();
		let second = rules.reparent(&first, &second_minter).unwrap();

		assert_eq!(second.state_delta, first.state_delta);
		assert_eq!(second.summary.timestamp, first.summary.timestamp);
		assert_eq!(second.summary.minter, second_minter.public_key);
		assert_ne!(second.summary.signature, first.summary.signature);
		assert!(rules.verify_signature(&second));
	}

	#[test]
	fn validate_rejects_wrong_parent_and_stale_timestamp() {
		let rules = rules();
		let minter = identity(1);
		rules.register(minter.public_key, 1);

		let genesis = genesis_block(1_000);
		let candidate = rules
			.build_candidate(&genesis.summary, &minter, 100_000)
			.unwrap();

		let mut wrong_parent = candidate.clone();
		wrong_parent.summary.reference = Signature([9u8; 32]);
		assert_eq!(
			rules.validate(&genesis.summary, &wrong_parent),
			Err(ValidationError::ParentMismatch)
		);

		let mut stale = candidate.clone();
		stale.summary.timestamp = genesis.summary.timestamp;
		assert_eq!(
			rules.validate(&genesis.summary, &stale),
			Err(ValidationError::TimestampOrder)
		);
	}

	#[test]
	fn validate_rejects_expired_transaction() {
		let rules = rules();
		let minter = identity(1);
		rules.register(minter.public_key, 1);

		let genesis = genesis_block(1_000);
		let candidate = rules
			.build_candidate(&genesis.summary, &minter, 100_000)
			.unwrap();

		let expired = crate::types::Transaction {
			signature: Signature([4u8; 32]),
			timestamp: 1_500,
			deadline: candidate.summary.timestamp,
			payload: vec![],
		};
		let block = rules.sign(candidate.with_transaction(expired.clone()), &minter);
		assert_eq!(
			rules.validate(&genesis.summary, &block),
			Err(ValidationError::TransactionExpired(expired.signature))
		);
	}

	#[test]
	fn block_weight_differs_per_minter() {
		let rules = rules();
		let scorer = BasicScorer;
		let first = identity(1);
		let second = identity(2);
		rules.register(first.public_key, 1);
		rules.register(second.public_key, 1);

		let genesis = genesis_block(1_000);
		let a = rules
			.build_candidate(&genesis.summary, &first, 100_000)
			.unwrap();
		let b = rules.reparent(&a, &second).unwrap();

		let weight_a = scorer.block_weight(1, &genesis.summary.signature, &a.summary);
		let weight_b = scorer.block_weight(1, &genesis.summary.signature, &b.summary);
		assert_ne!(weight_a, weight_b);
	}

	#[test]
	fn chain_weight_grows_with_each_block() {
		let rules = rules();
		let scorer = BasicScorer;
		let minter = identity(1);
		rules.register(minter.public_key, 1);

		let genesis = genesis_block(1_000);
		let second = rules
			.build_candidate(&genesis.summary, &minter, 100_000)
			.unwrap();
		let third = rules
			.build_candidate(&second.summary, &minter, 200_000)
			.unwrap();

		let summaries = vec![second.summary.clone(), third.summary.clone()];
		let shorter = scorer.chain_weight(1, &genesis.summary.signature, &summaries, 2);
		let longer = scorer.chain_weight(1, &genesis.summary.signature, &summaries, 3);
		assert!(longer > shorter);
	}

	#[test]
	fn higher_level_shrinks_block_weight() {
		let rules = rules();
		let scorer = BasicScorer;
		let minter = identity(1);
		rules.register(minter.public_key, 1);

		let genesis = genesis_block(1_000);
		let candidate = rules
			.build_candidate(&genesis.summary, &minter, 100_000)
			.unwrap();

		let mut stronger = candidate.summary.clone();
		stronger.minter_level = 9;

		let weak = scorer.block_weight(1, &genesis.summary.signature, &candidate.summary);
		let strong = scorer.block_weight(1, &genesis.summary.signature, &stronger);
		assert!(strong < weak);
	}
}
