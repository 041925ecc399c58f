//! Peer-reconciliation protocol.
//!
//! One [`Synchronizer::synchronize`] call drives a single attempt against a
//! single peer: find the common block, compare cumulative chain weights,
//! then either extend our chain with the peer's new blocks or switch to the
//! peer's fork. All block fetching happens before the chain-mutation lock is
//! taken, so the exclusive window is bounded by local validation and storage
//! cost only.

use std::sync::Arc;
use strum::Display;
use tokio::sync::Mutex;
use tracing::{debug, error, info, trace, warn};

use crate::{
	coordinator::ChainCoordinator,
	network::{PeerError, PeerLink},
	rules::{ChainWeightScorer, ConsensusRules, MinterEligibility},
	shutdown::Controller,
	store::{ChainStore, StoreError},
	types::{BlockSummary, FullBlock, Signature, SyncConfig},
};

/// Outcome of a single synchronization attempt. Policy rejections are not
/// errors; they bias future peer selection instead.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum SyncOutcome {
	Ok,
	NothingToDo,
	NoCommonBlock,
	TooDivergent,
	InferiorChain,
	InvalidData,
	NoReply,
	NoLock,
	ShuttingDown,
	StorageError,
}

/// Internal fault channel; every variant maps onto a [`SyncOutcome`] at the
/// top level, so `synchronize` itself never propagates an error.
#[derive(Debug)]
enum SyncError {
	NoReply,
	InvalidData,
	NoLock,
	ShuttingDown,
	Storage(StoreError),
}

impl From<StoreError> for SyncError {
	fn from(error: StoreError) -> Self {
		SyncError::Storage(error)
	}
}

impl From<PeerError> for SyncError {
	fn from(error: PeerError) -> Self {
		match error {
			PeerError::Timeout | PeerError::Disconnected => SyncError::NoReply,
			PeerError::Malformed(_) => SyncError::InvalidData,
		}
	}
}

enum AncestorSearch {
	/// Summary sequence whose head is the last block both sides share.
	Found(Vec<BlockSummary>),
	NoCommonBlock,
	TooDivergent,
}

pub struct Synchronizer<S, R, W, E> {
	store: Arc<S>,
	rules: Arc<R>,
	scorer: Arc<W>,
	eligibility: Arc<E>,
	coordinator: Arc<ChainCoordinator<S>>,
	config: SyncConfig,
	shutdown: Controller<String>,
	// Serializes whole attempts; the chain-mutation lock is only taken
	// around apply windows.
	attempt_guard: Mutex<()>,
}

impl<S, R, W, E> Synchronizer<S, R, W, E>
where
	S: ChainStore,
	R: ConsensusRules,
	W: ChainWeightScorer,
	E: MinterEligibility,
{
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		store: Arc<S>,
		rules: Arc<R>,
		scorer: Arc<W>,
		eligibility: Arc<E>,
		coordinator: Arc<ChainCoordinator<S>>,
		config: SyncConfig,
		shutdown: Controller<String>,
	) -> Self {
		Synchronizer {
			store,
			rules,
			scorer,
			eligibility,
			coordinator,
			config,
			shutdown,
			attempt_guard: Mutex::new(()),
		}
	}

	/// Attempts to synchronize our chain with the given peer. At most one
	/// attempt runs at a time; a non-forced call that finds another attempt
	/// in flight returns [`SyncOutcome::NoLock`] immediately, a forced call
	/// waits its turn.
	pub async fn synchronize(&self, peer: &dyn PeerLink, force: bool) -> SyncOutcome {
		let _guard = if force {
			self.attempt_guard.lock().await
		} else {
			match self.attempt_guard.try_lock() {
				Ok(guard) => guard,
				Err(_) => return SyncOutcome::NoLock,
			}
		};

		match self.synchronize_inner(peer, force).await {
			Ok(outcome) => outcome,
			Err(SyncError::NoReply) => SyncOutcome::NoReply,
			Err(SyncError::InvalidData) => SyncOutcome::InvalidData,
			Err(SyncError::ShuttingDown) => SyncOutcome::ShuttingDown,
			Err(SyncError::NoLock) => SyncOutcome::NoLock,
			Err(SyncError::Storage(error)) => {
				error!(%error, "Repository issue during synchronization with peer");
				SyncOutcome::StorageError
			},
		}
	}

	async fn synchronize_inner(
		&self,
		peer: &dyn PeerLink,
		force: bool,
	) -> Result<SyncOutcome, SyncError> {
		let Some(our_tip) = self.store.chain_tip()? else {
			return Err(SyncError::Storage(StoreError::NotFound(
				"local chain is empty".into(),
			)));
		};
		let our_tip = our_tip.summary;
		let our_height = our_tip.height;

		let Some(peer_tip) = peer.chain_tip() else {
			return Err(SyncError::NoReply);
		};

		debug!(
			peer = %peer.address(),
			peer_height = peer_tip.height,
			peer_tip = %peer_tip.signature,
			our_height,
			our_tip = %our_tip.signature,
			"Synchronizing with peer"
		);

		let mut summaries = match self
			.fetch_summaries_from_common_block(peer, our_height, force)
			.await?
		{
			AncestorSearch::Found(summaries) => summaries,
			AncestorSearch::NoCommonBlock => {
				info!(peer = %peer.address(), "Failure to find common block with peer");
				return Ok(SyncOutcome::NoCommonBlock);
			},
			AncestorSearch::TooDivergent => {
				info!(peer = %peer.address(), "Blockchain too divergent with peer");
				return Ok(SyncOutcome::TooDivergent);
			},
		};

		// First summary is the common block.
		let common = summaries.remove(0);
		let mut peer_summaries = summaries;
		debug!(
			peer = %peer.address(),
			common_height = common.height,
			common = %common.signature,
			"Common block found"
		);

		// A common block above the peer's reported height means the peer had
		// a very recent sync; adopt the higher value.
		let mut peer_height = peer_tip.height;
		if common.height > peer_height {
			debug!(
				peer_height,
				common_height = common.height,
				"Peer height was lower than common block height - using higher value"
			);
			peer_height = common.height;
		}

		// Common block at the peer's tip means we have the same, or a
		// longer, chain.
		if common.height == peer_height {
			return Ok(SyncOutcome::NothingToDo);
		}

		// Unless forced, both sides having diverged calls for a weight
		// comparison before any mutation.
		if !force && our_height > common.height {
			if let Some(outcome) = self
				.compare_chains(peer, &common, &our_tip, peer_height, &mut peer_summaries)
				.await?
			{
				return Ok(outcome);
			}
		}

		if common.height < our_height {
			// Peer's chain is better; switch to it.
			self.sync_to_fork(peer, &common, &our_tip, peer_height, peer_summaries)
				.await
		} else {
			// Peer simply has new blocks ahead of our tip.
			self.apply_new_blocks(peer, &common, peer_height, peer_summaries)
				.await
		}
	}

	/// Searches for the highest block we share with the peer, probing with
	/// exponentially growing steps. The returned sequence starts with the
	/// common block itself.
	async fn fetch_summaries_from_common_block(
		&self,
		peer: &dyn PeerLink,
		our_height: u32,
		force: bool,
	) -> Result<AncestorSearch, SyncError> {
		let mut step = self.config.initial_block_step;
		let mut test_height = our_height.saturating_sub(step).max(1);

		loop {
			if self.shutdown.is_triggered() {
				return Err(SyncError::ShuttingDown);
			}

			let Some(test_block) = self.store.get_by_height(test_height)? else {
				error!(test_height, "Failed to get block below blockchain tip");
				return Err(SyncError::Storage(StoreError::NotFound(format!(
					"block at height {test_height}"
				))));
			};
			let test_summary = test_block.summary;

			trace!(step, test_height, "Requesting summaries after height");
			let batch = peer
				.request_summaries(test_summary.signature, step)
				.await?;
			trace!(received = batch.len(), "Received summaries");

			if !batch.is_empty() {
				if batch.len() > step as usize {
					info!(peer = %peer.address(), "Peer sent more summaries than requested");
					return Err(SyncError::InvalidData);
				}

				let mut summaries = Vec::with_capacity(batch.len() + 1);
				summaries.push(test_summary);
				summaries.extend(batch);
				verify_sequence(&summaries).map_err(|()| {
					info!(peer = %peer.address(), "Peer sent summaries with broken linkage");
					SyncError::InvalidData
				})?;

				// Trim so the first summary is the true common block: work
				// forward until a block we don't have yet.
				let mut index = 1;
				while index < summaries.len()
					&& self.store.contains(&summaries[index].signature)?
				{
					index += 1;
				}
				summaries.drain(..index - 1);

				// Bound worst-case reorg depth; a hostile peer must not be
				// able to force unbounded rework.
				if !force
					&& summaries[0].height < our_height.saturating_sub(self.config.maximum_common_delta)
				{
					return Ok(AncestorSearch::TooDivergent);
				}

				return Ok(AncestorSearch::Found(summaries));
			}

			// Empty response: the peer does not know the probed signature.
			// No match all the way down to genesis means no blocks in common.
			if test_height == 1 {
				return Ok(AncestorSearch::NoCommonBlock);
			}

			if !force
				&& test_height < our_height.saturating_sub(self.config.maximum_common_delta)
			{
				return Ok(AncestorSearch::TooDivergent);
			}

			step = (step << 1).min(self.config.maximum_block_step);
			test_height = test_height.saturating_sub(step).max(1);
		}
	}

	/// Compares cumulative chain weights from the common block up to the
	/// highest mutual height. Returns `Some(InferiorChain)` when the peer's
	/// chain does not strictly improve on ours.
	async fn compare_chains(
		&self,
		peer: &dyn PeerLink,
		common: &BlockSummary,
		our_tip: &BlockSummary,
		peer_height: u32,
		peer_summaries: &mut Vec<BlockSummary>,
	) -> Result<Option<SyncOutcome>, SyncError> {
		// A very old tip of ours means we are far behind; ditch our fork
		// without comparing.
		let Some(min_timestamp) = self.coordinator.minimum_latest_block_timestamp() else {
			return Err(SyncError::Storage(StoreError::Backend(
				"minimum latest block timestamp unavailable".into(),
			)));
		};
		if our_tip.timestamp < min_timestamp {
			info!(
				common_height = common.height,
				"Ditching our chain after common block as our latest block is very old"
			);
			return Ok(None);
		}

		debug!(
			peer = %peer.address(),
			from_height = common.height + 1,
			"Comparing chains with peer"
		);

		// Fetch the peer's remaining block summaries.
		let peer_block_count = (peer_height - common.height) as usize;
		while peer_summaries.len() < peer_block_count {
			if self.shutdown.is_triggered() {
				return Err(SyncError::ShuttingDown);
			}

			let previous = peer_summaries
				.last()
				.map_or(common.signature, |summary| summary.signature);
			let more = peer
				.request_summaries(previous, (peer_block_count - peer_summaries.len()) as u32)
				.await?;
			if more.is_empty() {
				info!(
					peer = %peer.address(),
					after = %previous,
					"Peer failed to respond with block summaries"
				);
				return Err(SyncError::NoReply);
			}

			let mut expected_height = common.height + peer_summaries.len() as u32 + 1;
			let mut expected_reference = previous;
			for summary in &more {
				if summary.height != expected_height || summary.reference != expected_reference {
					info!(
						peer = %peer.address(),
						height = summary.height,
						"Peer responded with invalid block summary"
					);
					return Err(SyncError::InvalidData);
				}
				expected_height += 1;
				expected_reference = summary.signature;
			}
			peer_summaries.extend(more);
		}

		let mut our_summaries = self
			.store
			.summaries_range(common.height + 1, our_tip.height)?;
		self.fill_minter_levels(&mut our_summaries);
		self.fill_minter_levels(peer_summaries);

		// Both subchains are scored up to the highest mutual block only.
		let mutual_height =
			common.height + our_summaries.len().min(peer_summaries.len()) as u32;
		let our_weight =
			self.scorer
				.chain_weight(common.height, &common.signature, &our_summaries, mutual_height);
		let peer_weight =
			self.scorer
				.chain_weight(common.height, &common.signature, peer_summaries, mutual_height);
		debug!(%our_weight, %peer_weight, "Chain weights (higher is better)");

		// Strict improvement required: equal weights never trigger a switch.
		if our_weight >= peer_weight {
			debug!(peer = %peer.address(), "Not synchronizing with peer as we have better blockchain");
			return Ok(Some(SyncOutcome::InferiorChain));
		}

		Ok(None)
	}

	/// Replaces our chain above the common block with the peer's. All
	/// required blocks are fetched and validated before any local mutation.
	async fn sync_to_fork(
		&self,
		peer: &dyn PeerLink,
		common: &BlockSummary,
		our_tip: &BlockSummary,
		peer_height: u32,
		peer_summaries: Vec<BlockSummary>,
	) -> Result<SyncOutcome, SyncError> {
		debug!(
			peer = %peer.address(),
			from_height = common.height,
			common = %common.signature,
			"Fetching peer's chain to replace ours"
		);

		let required = (peer_height - common.height) as usize;
		let mut signatures: Vec<Signature> = peer_summaries
			.iter()
			.map(|summary| summary.signature)
			.collect();
		signatures.truncate(required);

		let mut expected_reference = signatures.last().copied().unwrap_or(common.signature);
		let mut expected_height = common.height + signatures.len() as u32 + 1;
		while signatures.len() < required {
			if self.shutdown.is_triggered() {
				return Err(SyncError::ShuttingDown);
			}

			let more = peer
				.request_summaries(expected_reference, (required - signatures.len()) as u32)
				.await?;
			if more.is_empty() {
				info!(
					peer = %peer.address(),
					after = %expected_reference,
					"Peer failed to respond with more block summaries"
				);
				return Err(SyncError::NoReply);
			}
			for summary in more {
				if summary.height != expected_height || summary.reference != expected_reference {
					info!(
						peer = %peer.address(),
						height = summary.height,
						"Peer responded with invalid block summary"
					);
					return Err(SyncError::InvalidData);
				}
				expected_reference = summary.signature;
				expected_height += 1;
				signatures.push(summary.signature);
			}
		}

		// Fetch all full blocks before mutating local state; fail fast on
		// any missing or invalid block.
		debug!(peer = %peer.address(), count = signatures.len(), "Fetching new blocks from peer");
		let mut new_blocks: Vec<FullBlock> = Vec::with_capacity(signatures.len());
		for signature in &signatures {
			if self.shutdown.is_triggered() {
				return Err(SyncError::ShuttingDown);
			}

			let block = peer.request_block(*signature).await?;
			if block.summary.signature != *signature || !self.rules.verify_signature(&block) {
				info!(
					peer = %peer.address(),
					signature = %signature,
					"Peer sent block with invalid signature"
				);
				return Err(SyncError::InvalidData);
			}
			new_blocks.push(block);
		}

		// Validate the whole replacement chain before touching local state;
		// a failed attempt must leave the chain exactly as it was.
		let mut parent = common.clone();
		for block in &mut new_blocks {
			self.fill_minter_level(&mut block.summary);
			if let Err(error) = self.rules.validate(&parent, block) {
				info!(
					peer = %peer.address(),
					height = block.summary.height,
					%error,
					"Peer sent invalid block"
				);
				return Err(SyncError::InvalidData);
			}
			parent = block.summary.clone();
		}

		// Apply window: everything from here on is local.
		let Ok(_lock) = tokio::time::timeout(
			self.config.lock_timeout,
			self.coordinator.chain_lock().lock(),
		)
		.await
		else {
			debug!("Couldn't acquire chain-mutation lock for fork apply");
			return Err(SyncError::NoLock);
		};

		let tip = self.store.chain_tip()?.map(|block| block.summary);
		if tip.map(|tip| tip.signature) != Some(our_tip.signature) {
			debug!("Chain tip changed while fetching from peer - aborting");
			return Err(SyncError::NoLock);
		}

		// Unwind to the common block, strictly from the old tip down.
		debug!(
			to_height = common.height,
			common = %common.signature,
			"Orphaning blocks back to common block"
		);
		let mut height = our_tip.height;
		while height > common.height {
			if self.shutdown.is_triggered() {
				return Err(SyncError::ShuttingDown);
			}

			let removed = self.store.orphan_tip()?;
			trace!(height, signature = %removed.summary.signature, "Orphaned block");
			self.coordinator.on_block_orphaned(&removed);
			height -= 1;
		}

		// Apply the peer's blocks strictly from the common block forward.
		for block in new_blocks {
			if self.shutdown.is_triggered() {
				return Err(SyncError::ShuttingDown);
			}

			self.store.append(block.clone())?;
			trace!(
				height = block.summary.height,
				signature = %block.summary.signature,
				"Applied block"
			);
			self.coordinator.on_block_applied(&block);
		}

		self.log_new_tip(peer)?;
		Ok(SyncOutcome::Ok)
	}

	/// Fetches and applies the peer's new blocks in batches. Each batch is
	/// fetched without the lock, then validated and applied all-or-nothing
	/// under it.
	async fn apply_new_blocks(
		&self,
		peer: &dyn PeerLink,
		common: &BlockSummary,
		peer_height: u32,
		peer_summaries: Vec<BlockSummary>,
	) -> Result<SyncOutcome, SyncError> {
		debug!(peer = %peer.address(), "Fetching new blocks from peer");

		let mut height = common.height;
		let mut latest_signature = common.signature;
		let mut pending: Vec<Signature> = peer_summaries
			.iter()
			.map(|summary| summary.signature)
			.collect();
		let mut applied_total = 0usize;

		while height < peer_height {
			if self.shutdown.is_triggered() {
				return finish_partial(applied_total, SyncError::ShuttingDown);
			}

			let batch_target = peer_height.min(height + self.config.sync_batch_size);
			let batch_len = (batch_target - height) as usize;

			// Top up the signature queue for this batch.
			let mut expected_reference = pending.last().copied().unwrap_or(latest_signature);
			let mut expected_height = height + pending.len() as u32 + 1;
			while pending.len() < batch_len {
				if self.shutdown.is_triggered() {
					return finish_partial(applied_total, SyncError::ShuttingDown);
				}

				let more = match peer
					.request_summaries(expected_reference, (batch_len - pending.len()) as u32)
					.await
				{
					Ok(more) => more,
					Err(error) => return finish_partial(applied_total, error.into()),
				};
				if more.is_empty() {
					info!(
						peer = %peer.address(),
						after = %expected_reference,
						"Peer failed to respond with more block summaries"
					);
					return finish_partial(applied_total, SyncError::NoReply);
				}
				for summary in more {
					if summary.height != expected_height
						|| summary.reference != expected_reference
					{
						info!(
							peer = %peer.address(),
							height = summary.height,
							"Peer responded with invalid block summary"
						);
						return finish_partial(applied_total, SyncError::InvalidData);
					}
					expected_reference = summary.signature;
					expected_height += 1;
					pending.push(summary.signature);
				}
			}

			// Fetch this batch's blocks without the lock.
			let batch: Vec<Signature> = pending.drain(..batch_len).collect();
			let mut blocks: Vec<FullBlock> = Vec::with_capacity(batch.len());
			for signature in &batch {
				if self.shutdown.is_triggered() {
					return finish_partial(applied_total, SyncError::ShuttingDown);
				}

				let block = match peer.request_block(*signature).await {
					Ok(block) => block,
					Err(error) => return finish_partial(applied_total, error.into()),
				};
				if block.summary.signature != *signature || !self.rules.verify_signature(&block) {
					info!(
						peer = %peer.address(),
						signature = %signature,
						"Peer sent block with invalid signature"
					);
					return finish_partial(applied_total, SyncError::InvalidData);
				}
				blocks.push(block);
			}

			// Apply window for this batch.
			let Ok(_lock) = tokio::time::timeout(
				self.config.lock_timeout,
				self.coordinator.chain_lock().lock(),
			)
			.await
			else {
				debug!("Couldn't acquire chain-mutation lock for batch apply");
				return finish_partial(applied_total, SyncError::NoLock);
			};

			let Some(tip_block) = self.store.chain_tip()? else {
				return finish_partial(
					applied_total,
					SyncError::Storage(StoreError::NotFound("local chain is empty".into())),
				);
			};
			if tip_block.summary.signature != latest_signature {
				debug!("Chain tip changed while fetching from peer - aborting");
				return finish_partial(applied_total, SyncError::NoLock);
			}

			// Re-validate each block immediately before applying the batch.
			let mut parent = tip_block.summary;
			for block in &mut blocks {
				self.fill_minter_level(&mut block.summary);
				if let Err(error) = self.rules.validate(&parent, block) {
					info!(
						peer = %peer.address(),
						height = block.summary.height,
						%error,
						"Peer sent invalid block"
					);
					return finish_partial(applied_total, SyncError::InvalidData);
				}
				parent = block.summary.clone();
			}

			for block in blocks {
				self.store.append(block.clone())?;
				trace!(
					height = block.summary.height,
					signature = %block.summary.signature,
					"Applied block"
				);
				self.coordinator.on_block_applied(&block);
				height = block.summary.height;
				latest_signature = block.summary.signature;
				applied_total += 1;
			}
		}

		self.log_new_tip(peer)?;
		Ok(SyncOutcome::Ok)
	}

	/// Minter levels carried in peer data are advisory; the local view of
	/// eligibility is authoritative for weighing and validation.
	fn fill_minter_level(&self, summary: &mut BlockSummary) {
		summary.minter_level = match self.eligibility.effective_level(&summary.minter) {
			// A cancelled delegation must not zero the weight out and
			// destabilize the node, so fall back to the lowest level.
			0 => {
				debug!(minter = %summary.minter, "Unknown effective minter level - using 1 instead");
				1
			},
			level => level,
		};
	}

	fn fill_minter_levels(&self, summaries: &mut [BlockSummary]) {
		for summary in summaries {
			self.fill_minter_level(summary);
		}
	}

	fn log_new_tip(&self, peer: &dyn PeerLink) -> Result<(), SyncError> {
		if let Some(tip) = self.store.chain_tip()? {
			info!(
				peer = %peer.address(),
				height = tip.summary.height,
				tip = %tip.summary.signature,
				"Synchronized with peer"
			);
		}
		Ok(())
	}
}

/// Validates parent linkage and height continuity of a summary sequence.
fn verify_sequence(summaries: &[BlockSummary]) -> Result<(), ()> {
	for window in summaries.windows(2) {
		if window[1].reference != window[0].signature
			|| window[1].height != window[0].height + 1
		{
			return Err(());
		}
	}
	Ok(())
}

/// A fault that interrupts an attempt after blocks were already applied is
/// demoted to success: progress was made, and non-`Ok` outcomes guarantee
/// that no local mutation happened.
fn finish_partial(applied: usize, error: SyncError) -> Result<SyncOutcome, SyncError> {
	if applied > 0 {
		warn!(applied, ?error, "Aborting synchronization attempt after partial progress");
		Ok(SyncOutcome::Ok)
	} else {
		Err(error)
	}
}
