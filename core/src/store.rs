//! Durable block storage boundary.
//!
//! The persistent repository engine is an external collaborator; this crate
//! only relies on the narrow contract below. Every mutation happens under
//! the coordinator's chain-mutation lock; reads are safe at any time.

use crate::types::{BlockSummary, FullBlock, Signature};

mod memory;
pub use memory::MemoryStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
	#[error("block not found: {0}")]
	NotFound(String),
	#[error("store backend failure: {0}")]
	Backend(String),
}

pub trait ChainStore: Send + Sync {
	/// Block at the given height, if present.
	fn get_by_height(&self, height: u32) -> Result<Option<FullBlock>, StoreError>;

	/// Block with the given signature, if present.
	fn get_by_signature(&self, signature: &Signature) -> Result<Option<FullBlock>, StoreError>;

	/// Child of the block with the given signature, if present.
	fn get_by_reference(&self, reference: &Signature) -> Result<Option<FullBlock>, StoreError>;

	/// Height of the current chain tip; 0 for an empty chain.
	fn current_height(&self) -> Result<u32, StoreError>;

	/// Current chain tip, if the chain is non-empty.
	fn chain_tip(&self) -> Result<Option<FullBlock>, StoreError>;

	fn contains(&self, signature: &Signature) -> Result<bool, StoreError>;

	/// Summaries for the inclusive height range, in ascending height order.
	fn summaries_range(&self, from: u32, to: u32) -> Result<Vec<BlockSummary>, StoreError>;

	/// Durably appends a block. The block must extend the current tip.
	fn append(&self, block: FullBlock) -> Result<(), StoreError>;

	/// Removes and returns the current tip, rewinding the chain by one.
	fn orphan_tip(&self) -> Result<FullBlock, StoreError>;
}
