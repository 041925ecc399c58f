//! Chain coordination: the single chain-mutation lock, the cache of recent
//! chain state, and the decision of *when* to synchronize.
//!
//! The coordinator never mutates the chain itself; the synchronizer and the
//! block minter do, and report every individual block change back through
//! [`ChainCoordinator::on_block_applied`] / [`ChainCoordinator::on_block_orphaned`]
//! so that observers see incremental progress and the recent-blocks cache
//! stays consistent block-by-block.

use rand::Rng;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, info, warn};

use crate::{
	mempool::TransactionPool,
	network::{Network, PeerLink},
	rules::{ChainWeightScorer, ConsensusRules, MinterEligibility},
	shutdown::Controller,
	store::{ChainStore, StoreError},
	synchronizer::{SyncOutcome, Synchronizer},
	time::NetworkTime,
	types::{BlockSummary, ChainEvent, CoordinatorConfig, FullBlock, Signature, BLOCK_CACHE_SIZE},
};

const EVENT_CHANNEL_CAPACITY: usize = 1 << 7;
/// Expired unconfirmed transactions are pruned every this many loop ticks.
const EXPIRED_TRANSACTION_PRUNE_TICKS: u64 = 60;

pub struct ChainCoordinator<S> {
	store: Arc<S>,
	time: Arc<dyn NetworkTime>,
	config: CoordinatorConfig,
	// Exactly one of a sync attempt or a mint commit may mutate the chain
	// at any instant. Never held across a network call.
	chain_lock: Mutex<()>,
	// Guarded separately from the chain lock; read far more often, by
	// message-answering tasks.
	latest_blocks: StdMutex<VecDeque<FullBlock>>,
	inferior_chains: StdMutex<HashSet<Signature>>,
	tip: watch::Sender<Option<BlockSummary>>,
	events: broadcast::Sender<ChainEvent>,
	is_synchronizing: AtomicBool,
	sync_percent: AtomicU8,
	is_minting_possible: AtomicBool,
}

impl<S: ChainStore> ChainCoordinator<S> {
	pub fn new(
		store: Arc<S>,
		time: Arc<dyn NetworkTime>,
		config: CoordinatorConfig,
	) -> Result<Self, StoreError> {
		let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
		let (tip, _) = watch::channel(None);

		let coordinator = ChainCoordinator {
			store,
			time,
			config,
			chain_lock: Mutex::new(()),
			latest_blocks: StdMutex::new(VecDeque::with_capacity(BLOCK_CACHE_SIZE)),
			inferior_chains: StdMutex::new(HashSet::new()),
			tip,
			events,
			is_synchronizing: AtomicBool::new(false),
			sync_percent: AtomicU8::new(0),
			is_minting_possible: AtomicBool::new(false),
		};

		{
			let mut cache = coordinator.latest_blocks.lock().expect("Lock acquired");
			coordinator.refill_cache(&mut cache)?;
			let tip = cache.back().map(|block| block.summary.clone());
			coordinator.tip.send_replace(tip);
		}

		Ok(coordinator)
	}

	pub fn config(&self) -> &CoordinatorConfig {
		&self.config
	}

	/// The chain-mutation lock shared by the synchronizer and the minter.
	pub fn chain_lock(&self) -> &Mutex<()> {
		&self.chain_lock
	}

	/// Current chain tip without taking the mutation lock.
	pub fn chain_tip(&self) -> Option<BlockSummary> {
		self.tip.borrow().clone()
	}

	/// Current chain height, or 0 if the chain is empty.
	pub fn chain_height(&self) -> u32 {
		self.tip.borrow().as_ref().map_or(0, |tip| tip.height)
	}

	pub fn subscribe_events(&self) -> broadcast::Receiver<ChainEvent> {
		self.events.subscribe()
	}

	/// Most recent full blocks, oldest first. Answers peer requests
	/// without repository access.
	pub fn recent_blocks(&self) -> Vec<FullBlock> {
		self.latest_blocks
			.lock()
			.expect("Lock acquired")
			.iter()
			.cloned()
			.collect()
	}

	pub fn is_synchronizing(&self) -> bool {
		self.is_synchronizing.load(Ordering::Relaxed)
	}

	/// Progress of the running synchronization, if one is running.
	pub fn sync_percent(&self) -> Option<u8> {
		self.is_synchronizing()
			.then(|| self.sync_percent.load(Ordering::Relaxed))
	}

	pub fn is_minting_possible(&self) -> bool {
		self.is_minting_possible.load(Ordering::Relaxed)
	}

	pub(crate) fn set_minting_possible(&self, possible: bool) {
		let was = self.is_minting_possible.swap(possible, Ordering::Relaxed);
		if was != possible {
			info!(possible, "Minting possibility changed");
		}
	}

	/// Minimum timestamp for our latest block to be considered recent,
	/// derived from the timing budget of the last few blocks. `None` while
	/// the clock is unsynchronized or the chain is empty.
	pub fn minimum_latest_block_timestamp(&self) -> Option<u64> {
		let now = self.time.now_millis()?;
		let height = self.chain_height();
		if height == 0 {
			return None;
		}

		let blocks = height.min(self.config.max_tip_age_blocks) as u64;
		let offset = blocks * (self.config.block_timing.target + self.config.block_timing.deviation);
		Some(now.saturating_sub(offset))
	}

	/// Whether we think our chain is up to date, judged from our tip age
	/// and the peers we could synchronize with.
	pub fn is_up_to_date(&self, network: &dyn Network) -> bool {
		let Some(min_timestamp) = self.minimum_latest_block_timestamp() else {
			return false;
		};
		let Some(tip) = self.chain_tip() else {
			return false;
		};
		if tip.timestamp < min_timestamp {
			return false;
		}
		let Some(now) = self.time.now_millis() else {
			return false;
		};

		let mut peers = network.connected_peers();
		peers.retain(|peer| !self.has_misbehaved(peer.as_ref(), now));
		peers.retain(|peer| !has_no_recent_block(peer.as_ref(), min_timestamp));
		peers.len() >= self.config.min_peers
	}

	// Recent-blocks cache

	/// Called after every individual block append.
	pub fn on_block_applied(&self, block: &FullBlock) {
		{
			let mut cache = self.latest_blocks.lock().expect("Lock acquired");

			let extends = cache
				.back()
				.is_some_and(|tail| tail.summary.signature == block.summary.reference);

			if extends {
				cache.push_back(block.clone());
				while cache.len() > BLOCK_CACHE_SIZE {
					cache.pop_front();
				}
			} else {
				if let Some(tail) = cache.back() {
					debug!(
						cached_tip = %tail.summary.signature,
						applied = %block.summary.signature,
						reference = %block.summary.reference,
						"Cached chain tip is not parent of newly applied block"
					);
				}
				// Unexpected discontinuity: rebuild wholesale rather than
				// trust the cache incrementally.
				if let Err(error) = self.refill_cache(&mut cache) {
					warn!(%error, "Couldn't refill latest blocks cache");
				}
			}
		}

		self.clear_inferior_tips();
		self.tip.send_replace(Some(block.summary.clone()));
		let _ = self
			.events
			.send(ChainEvent::BlockApplied(block.summary.clone()));
	}

	/// Called after every individual block orphan, with the removed block.
	pub fn on_block_orphaned(&self, removed: &FullBlock) {
		let new_tip = {
			let mut cache = self.latest_blocks.lock().expect("Lock acquired");

			let matches = cache
				.back()
				.is_some_and(|tail| tail.summary.signature == removed.summary.signature);

			if matches {
				cache.pop_back();
				if cache.is_empty() {
					if let Err(error) = self.refill_cache(&mut cache) {
						warn!(%error, "Couldn't refill latest blocks cache");
					}
				}
			} else {
				if let Some(tail) = cache.back() {
					debug!(
						cached_tip = %tail.summary.signature,
						orphaned = %removed.summary.signature,
						"Cached chain tip was not the orphaned block"
					);
				}
				if let Err(error) = self.refill_cache(&mut cache) {
					warn!(%error, "Couldn't refill latest blocks cache");
				}
			}

			cache.back().map(|block| block.summary.clone())
		};

		self.clear_inferior_tips();
		self.tip.send_replace(new_tip);
		let _ = self
			.events
			.send(ChainEvent::BlockOrphaned(removed.summary.clone()));
	}

	fn refill_cache(&self, cache: &mut VecDeque<FullBlock>) -> Result<(), StoreError> {
		cache.clear();

		let Some(tip) = self.store.chain_tip()? else {
			return Ok(());
		};
		let mut height = tip.summary.height;
		cache.push_front(tip);

		for _ in 1..BLOCK_CACHE_SIZE {
			if height <= 1 {
				break;
			}
			height -= 1;
			let Some(block) = self.store.get_by_height(height)? else {
				break;
			};
			cache.push_front(block);
		}

		Ok(())
	}

	// Inferior chain tips

	pub fn record_inferior_tip(&self, signature: Signature) {
		self.inferior_chains
			.lock()
			.expect("Lock acquired")
			.insert(signature);
	}

	pub fn is_inferior_tip(&self, signature: &Signature) -> bool {
		self.inferior_chains
			.lock()
			.expect("Lock acquired")
			.contains(signature)
	}

	fn clear_inferior_tips(&self) {
		self.inferior_chains.lock().expect("Lock acquired").clear();
	}

	// Peer selection

	fn has_misbehaved(&self, peer: &dyn PeerLink, now: u64) -> bool {
		peer.last_misbehaved().is_some_and(|last| {
			last > now.saturating_sub(self.config.misbehaviour_cooloff.as_millis() as u64)
		})
	}

	fn has_inferior_tip(&self, peer: &dyn PeerLink) -> bool {
		match peer.chain_tip() {
			Some(tip) => self.is_inferior_tip(&tip.signature),
			None => true,
		}
	}

	/// Decides whether to synchronize at all, picks a peer, and runs one
	/// attempt against it.
	pub async fn maybe_synchronize<R, W, E>(
		&self,
		network: &dyn Network,
		synchronizer: &Synchronizer<S, R, W, E>,
	) -> Option<SyncOutcome>
	where
		R: ConsensusRules,
		W: ChainWeightScorer,
		E: MinterEligibility,
	{
		// Already synchronizing via another task?
		if self.is_synchronizing() {
			return None;
		}

		let now = self.time.now_millis()?;
		let min_timestamp = self.minimum_latest_block_timestamp()?;
		let our_tip = self.chain_tip()?;

		let mut peers = network.connected_peers();
		peers.retain(|peer| !self.has_misbehaved(peer.as_ref(), now));
		peers.retain(|peer| !has_only_genesis_block(peer.as_ref()));
		peers.retain(|peer| !has_no_recent_block(peer.as_ref(), min_timestamp));

		// A lone node cannot safely determine the canonical chain.
		if peers.len() < self.config.min_peers {
			return None;
		}

		peers.retain(|peer| !has_no_or_same_block(peer.as_ref(), &our_tip.signature));
		peers.retain(|peer| !self.has_inferior_tip(peer.as_ref()));

		if peers.is_empty() {
			return None;
		}

		// Pick a random remaining peer to reduce bias toward any single view.
		let index = rand::thread_rng().gen_range(0..peers.len());
		let peer = peers.swap_remove(index);

		Some(
			self.sync_with_peer(peer.as_ref(), false, synchronizer, network)
				.await,
		)
	}

	/// Administrative forced synchronization, bypassing weight comparison.
	pub async fn force_synchronize<R, W, E>(
		&self,
		peer: &dyn PeerLink,
		synchronizer: &Synchronizer<S, R, W, E>,
		network: &dyn Network,
	) -> SyncOutcome
	where
		R: ConsensusRules,
		W: ChainWeightScorer,
		E: MinterEligibility,
	{
		self.sync_with_peer(peer, true, synchronizer, network).await
	}

	async fn sync_with_peer<R, W, E>(
		&self,
		peer: &dyn PeerLink,
		force: bool,
		synchronizer: &Synchronizer<S, R, W, E>,
		network: &dyn Network,
	) -> SyncOutcome
	where
		R: ConsensusRules,
		W: ChainWeightScorer,
		E: MinterEligibility,
	{
		let prior_tip = self.chain_tip();

		if let (Some(prior), Some(peer_tip)) = (&prior_tip, peer.chain_tip()) {
			if peer_tip.height > 0 {
				let percent = ((prior.height as u64 * 100) / peer_tip.height as u64).min(100) as u8;
				self.sync_percent.store(percent, Ordering::Relaxed);
				// Only flag as synchronizing when height may actually change.
				if percent < 100 {
					self.is_synchronizing.store(true, Ordering::Relaxed);
				}
			}
		}

		let outcome = synchronizer.synchronize(peer, force).await;

		match outcome {
			SyncOutcome::NoCommonBlock | SyncOutcome::TooDivergent | SyncOutcome::InvalidData => {
				// Serious outcomes warrant a cool-off.
				info!(peer = %peer.address(), %outcome, "Failed to synchronize with peer - cooling off");
				peer.report_misbehaviour("serious synchronization failure");
			},
			SyncOutcome::InferiorChain => {
				if let Some(peer_tip) = peer.chain_tip() {
					self.record_inferior_tip(peer_tip.signature);
				}
				debug!(peer = %peer.address(), %outcome, "Refused to synchronize with peer");
				// Notify the peer of our superior chain instead of retrying.
				if let Some(prior) = &prior_tip {
					peer.notify_tip(prior);
				}
			},
			SyncOutcome::NoReply | SyncOutcome::NoLock | SyncOutcome::StorageError => {
				debug!(peer = %peer.address(), %outcome, "Failed to synchronize with peer");
			},
			SyncOutcome::ShuttingDown => {},
			SyncOutcome::Ok | SyncOutcome::NothingToDo => {
				if let Some(peer_tip) = peer.chain_tip() {
					self.record_inferior_tip(peer_tip.signature);
				}
				debug!(peer = %peer.address(), %outcome, "Synchronized with peer");
			},
		}

		let new_tip = self.chain_tip();
		let tip_changed = match (&prior_tip, &new_tip) {
			(Some(prior), Some(new)) => prior.signature != new.signature,
			(None, None) => false,
			_ => true,
		};
		if tip_changed {
			if let Some(tip) = &new_tip {
				network.broadcast_tip(tip);
			}
		}

		self.is_synchronizing.store(false, Ordering::Relaxed);
		outcome
	}
}

fn has_only_genesis_block(peer: &dyn PeerLink) -> bool {
	match peer.chain_tip() {
		Some(tip) => tip.height <= 1,
		None => true,
	}
}

fn has_no_recent_block(peer: &dyn PeerLink, min_timestamp: u64) -> bool {
	match peer.chain_tip() {
		Some(tip) => tip.timestamp < min_timestamp,
		None => true,
	}
}

fn has_no_or_same_block(peer: &dyn PeerLink, our_signature: &Signature) -> bool {
	match peer.chain_tip() {
		Some(tip) => tip.signature == *our_signature,
		None => true,
	}
}

/// Periodic decision loop: checks the clock, potentially synchronizes with
/// one peer, and prunes expired unconfirmed transactions.
pub async fn run<S, R, W, E, N, P>(
	coordinator: Arc<ChainCoordinator<S>>,
	synchronizer: Arc<Synchronizer<S, R, W, E>>,
	network: Arc<N>,
	pool: Arc<P>,
	shutdown: Controller<String>,
) where
	S: ChainStore,
	R: ConsensusRules,
	W: ChainWeightScorer,
	E: MinterEligibility,
	N: Network,
	P: TransactionPool,
{
	info!("Starting chain coordinator...");

	let mut interval = tokio::time::interval(coordinator.config.sync_interval);
	let mut ticks: u64 = 0;

	loop {
		tokio::select! {
			_ = interval.tick() => {},
			reason = shutdown.triggered_shutdown() => {
				info!(%reason, "Stopping chain coordinator");
				return;
			},
		}

		let Some(now) = coordinator.time.now_millis() else {
			debug!("Waiting for clock synchronization");
			continue;
		};

		coordinator
			.maybe_synchronize(network.as_ref(), synchronizer.as_ref())
			.await;

		ticks += 1;
		if ticks % EXPIRED_TRANSACTION_PRUNE_TICKS == 0 {
			let removed = pool.remove_expired(now);
			if removed > 0 {
				info!(removed, "Deleted expired unconfirmed transactions");
			}
		}
	}
}
