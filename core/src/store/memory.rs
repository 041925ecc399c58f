use std::{
	collections::HashMap,
	sync::{Arc, RwLock},
};

use super::{ChainStore, StoreError};
use crate::types::{BlockSummary, FullBlock, Signature};

/// In-memory chain store. Heights are contiguous starting at 1.
#[derive(Clone, Default)]
pub struct MemoryStore {
	inner: Arc<RwLock<Inner>>,
}

#[derive(Default)]
struct Inner {
	// Index 0 holds the block at height 1.
	blocks: Vec<FullBlock>,
	by_signature: HashMap<Signature, usize>,
}

impl MemoryStore {
	pub fn new() -> Self {
		MemoryStore::default()
	}
}

impl ChainStore for MemoryStore {
	fn get_by_height(&self, height: u32) -> Result<Option<FullBlock>, StoreError> {
		let inner = self.inner.read().expect("Lock acquired");
		if height == 0 {
			return Ok(None);
		}
		Ok(inner.blocks.get(height as usize - 1).cloned())
	}

	fn get_by_signature(&self, signature: &Signature) -> Result<Option<FullBlock>, StoreError> {
		let inner = self.inner.read().expect("Lock acquired");
		Ok(inner
			.by_signature
			.get(signature)
			.and_then(|index| inner.blocks.get(*index))
			.cloned())
	}

	fn get_by_reference(&self, reference: &Signature) -> Result<Option<FullBlock>, StoreError> {
		let inner = self.inner.read().expect("Lock acquired");
		let Some(parent_index) = inner.by_signature.get(reference) else {
			return Ok(None);
		};
		Ok(inner.blocks.get(parent_index + 1).cloned())
	}

	fn current_height(&self) -> Result<u32, StoreError> {
		let inner = self.inner.read().expect("Lock acquired");
		Ok(inner.blocks.len() as u32)
	}

	fn chain_tip(&self) -> Result<Option<FullBlock>, StoreError> {
		let inner = self.inner.read().expect("Lock acquired");
		Ok(inner.blocks.last().cloned())
	}

	fn contains(&self, signature: &Signature) -> Result<bool, StoreError> {
		let inner = self.inner.read().expect("Lock acquired");
		Ok(inner.by_signature.contains_key(signature))
	}

	fn summaries_range(&self, from: u32, to: u32) -> Result<Vec<BlockSummary>, StoreError> {
		let inner = self.inner.read().expect("Lock acquired");
		if from == 0 || from > to {
			return Ok(vec![]);
		}
		let start = from as usize - 1;
		let end = (to as usize).min(inner.blocks.len());
		if start >= end {
			return Ok(vec![]);
		}
		Ok(inner.blocks[start..end]
			.iter()
			.map(|block| block.summary.clone())
			.collect())
	}

	fn append(&self, block: FullBlock) -> Result<(), StoreError> {
		let mut inner = self.inner.write().expect("Lock acquired");

		let expected_height = inner.blocks.len() as u32 + 1;
		if block.summary.height != expected_height {
			return Err(StoreError::Backend(format!(
				"append at height {} does not extend tip height {}",
				block.summary.height,
				inner.blocks.len()
			)));
		}

		if let Some(tip) = inner.blocks.last() {
			if block.summary.reference != tip.summary.signature {
				return Err(StoreError::Backend(format!(
					"append reference {} does not match tip signature {}",
					block.summary.reference, tip.summary.signature
				)));
			}
		}

		let index = inner.blocks.len();
		inner
			.by_signature
			.insert(block.summary.signature, index);
		inner.blocks.push(block);
		Ok(())
	}

	fn orphan_tip(&self) -> Result<FullBlock, StoreError> {
		let mut inner = self.inner.write().expect("Lock acquired");
		let Some(block) = inner.blocks.pop() else {
			return Err(StoreError::NotFound("orphan on empty chain".into()));
		};
		inner.by_signature.remove(&block.summary.signature);
		Ok(block)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::PublicKey;

	fn block(height: u32, seed: u8, reference: Signature) -> FullBlock {
		FullBlock {
			summary: BlockSummary {
				height,
				signature: Signature([seed; 32]),
				reference,
				minter: PublicKey([9u8; 32]),
				minter_level: 1,
				timestamp: height as u64 * 1_000,
			},
			transactions: vec![],
			state_delta: vec![],
		}
	}

	#[test]
	fn append_then_lookup_by_all_indexes() {
		let store = MemoryStore::new();
		let genesis = block(1, 1, Signature::NONE);
		let second = block(2, 2, genesis.summary.signature);

		store.append(genesis.clone()).unwrap();
		store.append(second.clone()).unwrap();

		assert_eq!(store.current_height().unwrap(), 2);
		assert_eq!(store.get_by_height(2).unwrap(), Some(second.clone()));
		assert_eq!(
			store.get_by_signature(&second.summary.signature).unwrap(),
			Some(second.clone())
		);
		assert_eq!(
			store.get_by_reference(&genesis.summary.signature).unwrap(),
			Some(second.clone())
		);
		assert_eq!(store.chain_tip().unwrap(), Some(second));
	}

	#[test]
	fn append_rejects_non_extending_block() {
		let store = MemoryStore::new();
		store.append(block(1, 1, Signature::NONE)).unwrap();

		// Wrong height
		assert!(store.append(block(3, 3, Signature([1u8; 32]))).is_err());
		// Wrong reference
		assert!(store.append(block(2, 2, Signature([8u8; 32]))).is_err());
		assert_eq!(store.current_height().unwrap(), 1);
	}

	#[test]
	fn orphan_rewinds_by_exactly_one() {
		let store = MemoryStore::new();
		let genesis = block(1, 1, Signature::NONE);
		let second = block(2, 2, genesis.summary.signature);
		store.append(genesis.clone()).unwrap();
		store.append(second.clone()).unwrap();

		let removed = store.orphan_tip().unwrap();
		assert_eq!(removed, second);
		assert_eq!(store.current_height().unwrap(), 1);
		assert!(!store.contains(&removed.summary.signature).unwrap());
		assert_eq!(store.chain_tip().unwrap(), Some(genesis));
	}

	#[test]
	fn summaries_range_is_inclusive_and_clamped() {
		let store = MemoryStore::new();
		let genesis = block(1, 1, Signature::NONE);
		let second = block(2, 2, genesis.summary.signature);
		let third = block(3, 3, second.summary.signature);
		store.append(genesis).unwrap();
		store.append(second.clone()).unwrap();
		store.append(third.clone()).unwrap();

		let range = store.summaries_range(2, 10).unwrap();
		assert_eq!(range, vec![second.summary, third.summary]);
		assert!(store.summaries_range(0, 3).unwrap().is_empty());
		assert!(store.summaries_range(3, 2).unwrap().is_empty());
	}
}
