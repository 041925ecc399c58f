//! Block-minting candidate loop.
//!
//! Once per tick the minter checks its liveness preconditions, keeps a list
//! of candidate blocks (one per eligible local identity) for the current
//! chain tip, and commits the single best candidate under the
//! chain-mutation lock. Minting is best-effort: an invalidated candidate is
//! silently discarded and rebuilt on the next tip change, never an error.

use num::BigUint;
use std::sync::Arc;
use tokio::time::timeout;
use tracing::{debug, error, info};

use crate::{
	coordinator::ChainCoordinator,
	mempool::TransactionPool,
	network::{Network, PeerLink},
	rules::{ChainWeightScorer, ConsensusRules, MinterEligibility},
	shutdown::Controller,
	store::{ChainStore, StoreError},
	time::NetworkTime,
	types::{BlockSummary, FullBlock, MinterConfig, MintingIdentity},
};

/// Candidate state carried between ticks. Candidates are only valid for the
/// parent they were built on and are discarded whenever the tip changes.
#[derive(Default)]
pub struct TickState {
	previous_tip: Option<BlockSummary>,
	candidates: Vec<FullBlock>,
}

pub struct BlockMinter<S, R, W, E, N, P> {
	store: Arc<S>,
	rules: Arc<R>,
	scorer: Arc<W>,
	eligibility: Arc<E>,
	network: Arc<N>,
	pool: Arc<P>,
	coordinator: Arc<ChainCoordinator<S>>,
	time: Arc<dyn NetworkTime>,
	identities: Vec<MintingIdentity>,
	config: MinterConfig,
}

impl<S, R, W, E, N, P> BlockMinter<S, R, W, E, N, P>
where
	S: ChainStore,
	R: ConsensusRules,
	W: ChainWeightScorer,
	E: MinterEligibility,
	N: Network,
	P: TransactionPool,
{
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		store: Arc<S>,
		rules: Arc<R>,
		scorer: Arc<W>,
		eligibility: Arc<E>,
		network: Arc<N>,
		pool: Arc<P>,
		coordinator: Arc<ChainCoordinator<S>>,
		time: Arc<dyn NetworkTime>,
		identities: Vec<MintingIdentity>,
		config: MinterConfig,
	) -> Self {
		BlockMinter {
			store,
			rules,
			scorer,
			eligibility,
			network,
			pool,
			coordinator,
			time,
			identities,
			config,
		}
	}

	pub fn config(&self) -> &MinterConfig {
		&self.config
	}

	/// One minting iteration. Storage faults abort the tick and are logged;
	/// everything else resolves to a silent skip.
	pub async fn tick(&self, state: &mut TickState) {
		match self.tick_inner(state).await {
			Ok(possible) => self.coordinator.set_minting_possible(possible),
			Err(error) => {
				error!(%error, "Repository issue while minting block");
				self.coordinator.set_minting_possible(false);
			},
		}
	}

	/// Returns whether minting is currently possible at all, regardless of
	/// whether a block was committed this tick.
	async fn tick_inner(&self, state: &mut TickState) -> Result<bool, StoreError> {
		// Without a synchronized clock candidate timestamps are meaningless.
		let Some(now) = self.time.now_millis() else {
			return Ok(false);
		};
		let Some(min_timestamp) = self.coordinator.minimum_latest_block_timestamp() else {
			return Ok(false);
		};

		// No online accounts known, e.g. during startup.
		if self.network.online_account_count() == 0 {
			return Ok(false);
		}

		// Eligibility can be revoked by an external transaction at any time,
		// so recheck every identity on every tick.
		let eligible: Vec<&MintingIdentity> = self
			.identities
			.iter()
			.filter(|identity| self.eligibility.effective_level(&identity.public_key) > 0)
			.collect();
		if eligible.is_empty() {
			return Ok(false);
		}

		let Some(tip_block) = self.store.chain_tip()? else {
			return Ok(false);
		};
		let tip = tip_block.summary;

		// Minting while isolated produces forks nobody will accept: insist
		// on enough well-behaved, up-to-date peers.
		let cooloff = self.coordinator.config().misbehaviour_cooloff.as_millis() as u64;
		let mut peers = self.network.connected_peers();
		peers.retain(|peer| !has_misbehaved(peer.as_ref(), now, cooloff));
		peers.retain(|peer| has_recent_block(peer.as_ref(), min_timestamp));
		if peers.len() < self.config.min_peers {
			return Ok(false);
		}

		// A stale tip of our own means we should synchronize, not mint.
		if tip.timestamp < min_timestamp {
			return Ok(false);
		}

		// From here on minting is considered possible.

		// Discard candidates built for a previous tip.
		if state
			.previous_tip
			.as_ref()
			.map(|previous| previous.signature)
			!= Some(tip.signature)
		{
			state.previous_tip = Some(tip.clone());
			state.candidates.clear();
		}

		// Build missing candidates: the first does the heavy lifting, the
		// rest re-parent it cheaply.
		for identity in eligible {
			let already_built = state
				.candidates
				.iter()
				.any(|candidate| candidate.summary.minter == identity.public_key);
			if already_built {
				continue;
			}

			let candidate = match state.candidates.first() {
				Some(first) => self.rules.reparent(first, identity),
				None => self.rules.build_candidate(&tip, identity, now),
			};
			match candidate {
				Some(candidate) => state.candidates.push(candidate),
				None => debug!(minter = %identity.public_key, "Couldn't build a to-be-minted block"),
			}
		}

		if state.candidates.is_empty() {
			return Ok(true);
		}

		// Bounded wait for the chain-mutation lock; on failure just retry
		// next tick.
		let Ok(_lock) = timeout(self.config.lock_timeout, self.coordinator.chain_lock().lock()).await
		else {
			debug!(
				"Couldn't acquire chain-mutation lock even after waiting {:?}",
				self.config.lock_timeout
			);
			return Ok(true);
		};

		// Final check that the chain hasn't changed under us.
		let latest = self.store.chain_tip()?.map(|block| block.summary);
		if latest.map(|latest| latest.signature) != Some(tip.signature) {
			state.previous_tip = None;
			state.candidates.clear();
			return Ok(true);
		}

		// Keep only candidates that are valid right now.
		let good: Vec<&FullBlock> = state
			.candidates
			.iter()
			.filter(|candidate| self.rules.is_timestamp_valid(candidate, now))
			.filter(|candidate| self.rules.validate(&tip, candidate).is_ok())
			.collect();
		if good.is_empty() {
			return Ok(true);
		}

		// Pick the best candidate; lower block weight wins and the minter
		// key makes ties impossible.
		let mut best: Option<(&FullBlock, BigUint)> = None;
		for candidate in good {
			let weight = self
				.scorer
				.block_weight(tip.height, &tip.signature, &candidate.summary);
			let better = match &best {
				Some((_, best_weight)) => weight < *best_weight,
				None => true,
			};
			if better {
				best = Some((candidate, weight));
			}
		}
		let Some((winner, _)) = best else {
			return Ok(true);
		};
		let mut block = winner.clone();

		let Some(identity) = self
			.identities
			.iter()
			.find(|identity| identity.public_key == block.summary.minter)
		else {
			return Ok(true);
		};

		// Fill with pending unconfirmed transactions, in priority order,
		// stopping (without including it) at the first addition that would
		// make the candidate invalid.
		for transaction in self.pool.unconfirmed() {
			if transaction.timestamp > block.summary.timestamp
				|| transaction.deadline <= block.summary.timestamp
			{
				continue;
			}

			let tentative = self
				.rules
				.sign(block.with_transaction(transaction), identity);
			if self.rules.validate(&tip, &tentative).is_ok() {
				block = tentative;
			} else {
				break;
			}
		}

		// Finalize and re-validate once more.
		let block = self.rules.sign(block, identity);
		if let Err(error) = self.rules.validate(&tip, &block) {
			debug!(%error, "To-be-minted block no longer valid - discarding");
			state.candidates.clear();
			return Ok(true);
		}

		self.store.append(block.clone())?;
		info!(
			height = block.summary.height,
			signature = %block.summary.signature,
			minter = %block.summary.minter,
			"Minted new block"
		);
		self.coordinator.on_block_applied(&block);

		// Broadcast outside the exclusive window.
		drop(_lock);
		self.network.broadcast_tip(&block.summary);

		Ok(true)
	}
}

fn has_misbehaved(peer: &dyn PeerLink, now: u64, cooloff_millis: u64) -> bool {
	peer.last_misbehaved()
		.is_some_and(|last| last > now.saturating_sub(cooloff_millis))
}

fn has_recent_block(peer: &dyn PeerLink, min_timestamp: u64) -> bool {
	peer.chain_tip()
		.is_some_and(|tip| tip.timestamp >= min_timestamp)
}

/// Minter control loop; ticks until shutdown.
pub async fn run<S, R, W, E, N, P>(
	minter: BlockMinter<S, R, W, E, N, P>,
	shutdown: Controller<String>,
) where
	S: ChainStore,
	R: ConsensusRules,
	W: ChainWeightScorer,
	E: MinterEligibility,
	N: Network,
	P: TransactionPool,
{
	info!("Starting block minter...");

	let mut interval = tokio::time::interval(minter.config.tick_interval);
	let mut state = TickState::default();

	loop {
		tokio::select! {
			_ = interval.tick() => {},
			reason = shutdown.triggered_shutdown() => {
				info!(%reason, "Stopping block minter");
				return;
			},
		}

		minter.tick(&mut state).await;
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::mempool::{MemoryPool, TransactionPool};
	use crate::testing::*;
	use crate::types::{MinterConfig, Signature, Transaction};
	use std::sync::Arc;
	use std::time::Duration;

	type TestMinter = BlockMinter<
		crate::store::MemoryStore,
		crate::rules::basic::BasicRules,
		LevelScorer,
		crate::rules::basic::BasicRules,
		TestNetwork,
		MemoryPool,
	>;

	fn test_config() -> MinterConfig {
		MinterConfig {
			tick_interval: Duration::from_millis(10),
			lock_timeout: Duration::from_secs(1),
			min_peers: 1,
		}
	}

	fn minter_over(
		stack: &Stack,
		network: Arc<TestNetwork>,
		pool: Arc<MemoryPool>,
		identities: Vec<crate::types::MintingIdentity>,
	) -> TestMinter {
		BlockMinter::new(
			stack.store.clone(),
			stack.rules.clone(),
			Arc::new(LevelScorer),
			stack.rules.clone(),
			network,
			pool,
			stack.coordinator.clone(),
			stack.time.clone(),
			identities,
			test_config(),
		)
	}

	#[tokio::test]
	async fn best_candidate_among_eligible_identities_wins() {
		let rules = test_rules();
		let weak = registered_identity(&rules, 1, 1);
		let strong = registered_identity(&rules, 2, 5);
		let chain = build_chain(&rules, &weak, 1);

		let stack = Stack::with_chain(rules, &chain);
		// Candidate timestamps land one block interval past genesis.
		stack.time.set(GENESIS_TIMESTAMP + 61_000);

		let network = Arc::new(TestNetwork::with_peers(vec![Arc::new(TestPeer::new(
			chain.clone(),
		))]));
		let pool = Arc::new(MemoryPool::new());
		let minter = minter_over(&stack, network, pool, vec![weak.clone(), strong.clone()]);

		let mut state = TickState::default();
		minter.tick(&mut state).await;

		assert_eq!(stack.store.current_height().unwrap(), 2);
		let minted = stack.store.chain_tip().unwrap().unwrap();
		assert_eq!(minted.summary.minter, strong.public_key);
		assert!(stack.coordinator.is_minting_possible());
	}

	#[tokio::test]
	async fn minting_skipped_without_enough_peers() {
		let rules = test_rules();
		let minter_identity = registered_identity(&rules, 1, 1);
		let chain = build_chain(&rules, &minter_identity, 1);

		let stack = Stack::with_chain(rules, &chain);
		stack.time.set(GENESIS_TIMESTAMP + 61_000);

		let network = Arc::new(TestNetwork::with_peers(vec![]));
		let pool = Arc::new(MemoryPool::new());
		let minter = minter_over(&stack, network, pool, vec![minter_identity]);

		let mut state = TickState::default();
		minter.tick(&mut state).await;

		assert_eq!(stack.store.current_height().unwrap(), 1);
		assert!(!stack.coordinator.is_minting_possible());
	}

	#[tokio::test]
	async fn minting_skipped_when_eligibility_was_revoked() {
		let rules = test_rules();
		let minter_identity = registered_identity(&rules, 1, 1);
		let chain = build_chain(&rules, &minter_identity, 1);

		let stack = Stack::with_chain(rules.clone(), &chain);
		stack.time.set(GENESIS_TIMESTAMP + 61_000);

		let network = Arc::new(TestNetwork::with_peers(vec![Arc::new(TestPeer::new(
			chain.clone(),
		))]));
		let pool = Arc::new(MemoryPool::new());
		let minter = minter_over(&stack, network, pool, vec![minter_identity.clone()]);

		rules.revoke(&minter_identity.public_key);

		let mut state = TickState::default();
		minter.tick(&mut state).await;

		assert_eq!(stack.store.current_height().unwrap(), 1);
		assert!(!stack.coordinator.is_minting_possible());
	}

	#[tokio::test]
	async fn minting_skipped_while_our_tip_is_stale() {
		let rules = test_rules();
		let minter_identity = registered_identity(&rules, 1, 1);
		let chain = build_chain(&rules, &minter_identity, 1);

		let stack = Stack::with_chain(rules, &chain);
		// Far in the future: our tip is no longer recent, so the node
		// should synchronize rather than mint.
		stack.time.set(GENESIS_TIMESTAMP + 10 * 24 * 3_600 * 1_000);

		let network = Arc::new(TestNetwork::with_peers(vec![Arc::new(TestPeer::new(
			chain.clone(),
		))]));
		let pool = Arc::new(MemoryPool::new());
		let minter = minter_over(&stack, network, pool, vec![minter_identity]);

		let mut state = TickState::default();
		minter.tick(&mut state).await;

		assert_eq!(stack.store.current_height().unwrap(), 1);
		assert!(!stack.coordinator.is_minting_possible());
	}

	#[tokio::test]
	async fn transaction_fill_skips_expired_and_future_transactions() {
		let rules = test_rules();
		let minter_identity = registered_identity(&rules, 1, 1);
		let chain = build_chain(&rules, &minter_identity, 1);
		let candidate_timestamp = GENESIS_TIMESTAMP + 60_000;

		let stack = Stack::with_chain(rules, &chain);
		stack.time.set(candidate_timestamp + 1_000);

		let valid = Transaction {
			signature: Signature([10u8; 32]),
			timestamp: GENESIS_TIMESTAMP,
			deadline: candidate_timestamp + 120_000,
			payload: vec![1],
		};
		let expired = Transaction {
			signature: Signature([11u8; 32]),
			timestamp: GENESIS_TIMESTAMP,
			deadline: candidate_timestamp,
			payload: vec![2],
		};
		let not_yet_valid = Transaction {
			signature: Signature([12u8; 32]),
			timestamp: candidate_timestamp + 10_000,
			deadline: candidate_timestamp + 120_000,
			payload: vec![3],
		};

		let pool = Arc::new(MemoryPool::new());
		pool.add(valid.clone());
		pool.add(expired);
		pool.add(not_yet_valid);

		let network = Arc::new(TestNetwork::with_peers(vec![Arc::new(TestPeer::new(
			chain.clone(),
		))]));
		let minter = minter_over(&stack, network, pool.clone(), vec![minter_identity]);

		let mut state = TickState::default();
		minter.tick(&mut state).await;

		let minted = stack.store.chain_tip().unwrap().unwrap();
		assert_eq!(minted.summary.height, 2);
		assert_eq!(minted.transactions, vec![valid]);
		assert_eq!(pool.unconfirmed().len(), 3);
	}

	#[tokio::test]
	async fn candidates_rebuilt_after_tip_change() {
		let rules = test_rules();
		let minter_identity = registered_identity(&rules, 1, 1);
		let chain = build_chain(&rules, &minter_identity, 1);

		let stack = Stack::with_chain(rules, &chain);
		stack.time.set(GENESIS_TIMESTAMP + 61_000);

		let network = Arc::new(TestNetwork::with_peers(vec![Arc::new(TestPeer::new(
			chain.clone(),
		))]));
		let pool = Arc::new(MemoryPool::new());
		let minter = minter_over(&stack, network, pool, vec![minter_identity]);

		let mut state = TickState::default();
		minter.tick(&mut state).await;
		assert_eq!(stack.store.current_height().unwrap(), 2);

		// Next candidate is only due one block interval later.
		minter.tick(&mut state).await;
		assert_eq!(stack.store.current_height().unwrap(), 2);

		stack.time.set(GENESIS_TIMESTAMP + 2 * 61_000);
		minter.tick(&mut state).await;
		assert_eq!(stack.store.current_height().unwrap(), 3);
	}
}
