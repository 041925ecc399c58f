//! Consensus policy boundary.
//!
//! Block validation, candidate assembly, signing and chain-weight scoring
//! encode economic policy that lives outside this crate's hard-engineering
//! focus. The synchronizer and minter consume them through the traits
//! below; [`basic`] ships a deterministic reference implementation that
//! makes the system runnable and testable.

use num::BigUint;

use crate::types::{BlockSummary, FullBlock, MintingIdentity, PublicKey, Signature};

pub mod basic;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
	#[error("block reference does not match parent signature")]
	ParentMismatch,
	#[error("block height does not follow parent height")]
	HeightMismatch,
	#[error("block timestamp not after parent timestamp")]
	TimestampOrder,
	#[error("block minter is not currently eligible")]
	IneligibleMinter,
	#[error("too many transactions in block")]
	TooManyTransactions,
	#[error("transaction {0} not yet valid at block timestamp")]
	TransactionNotYetValid(Signature),
	#[error("transaction {0} expired before block timestamp")]
	TransactionExpired(Signature),
}

/// Block-level consensus rules: structural/contextual validity, candidate
/// assembly and signing.
pub trait ConsensusRules: Send + Sync {
	/// Whether the block's signature is internally consistent.
	fn verify_signature(&self, block: &FullBlock) -> bool;

	/// Contextual validity of `block` as the immediate child of `parent`.
	fn validate(&self, parent: &BlockSummary, block: &FullBlock) -> Result<(), ValidationError>;

	/// Whether the block's timestamp has been reached yet.
	fn is_timestamp_valid(&self, block: &FullBlock, now: u64) -> bool;

	/// Builds the first block candidate on top of `parent`, including the
	/// heavy contract-state assembly. `None` when minting is not currently
	/// possible for this identity.
	fn build_candidate(
		&self,
		parent: &BlockSummary,
		identity: &MintingIdentity,
		now: u64,
	) -> Option<FullBlock>;

	/// Re-parents an already built candidate for another identity,
	/// reusing the heavy work of the first build.
	fn reparent(&self, first: &FullBlock, identity: &MintingIdentity) -> Option<FullBlock>;

	/// Computes and embeds the block signature for the given identity.
	fn sign(&self, block: FullBlock, identity: &MintingIdentity) -> FullBlock;
}

/// Opaque chain-weight comparator. Any deterministic monotonic scorer
/// satisfies the synchronizer's contracts.
pub trait ChainWeightScorer: Send + Sync {
	/// Cumulative weight of a subchain starting just above the common
	/// ancestor, counting only summaries at or below `max_height`.
	/// Higher is better.
	fn chain_weight(
		&self,
		ancestor_height: u32,
		ancestor_signature: &Signature,
		summaries: &[BlockSummary],
		max_height: u32,
	) -> BigUint;

	/// Weight of a single candidate block relative to its parent. Lower is
	/// better; the minter key makes ties impossible by construction.
	fn block_weight(
		&self,
		parent_height: u32,
		parent_signature: &Signature,
		summary: &BlockSummary,
	) -> BigUint;
}

/// Lookup of a minter's current effective level. Eligibility can be revoked
/// at any time by an external transaction, so callers re-query instead of
/// caching.
pub trait MinterEligibility: Send + Sync {
	/// Effective minting level; 0 means not currently eligible.
	fn effective_level(&self, minter: &PublicKey) -> u8;
}
