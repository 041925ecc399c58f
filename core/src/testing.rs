//! Shared helpers for the crate's test suites: deterministic chains, an
//! in-process peer, and a transparent chain-weight scorer.

use async_trait::async_trait;
use num::BigUint;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use crate::{
	coordinator::ChainCoordinator,
	network::{Network, PeerError, PeerLink},
	rules::basic::{genesis_block, identity_from_seed, BasicRules},
	rules::ChainWeightScorer,
	rules::ConsensusRules,
	shutdown::Controller,
	store::{ChainStore, MemoryStore},
	synchronizer::Synchronizer,
	time::FixedTimeSource,
	types::{
		BlockSummary, BlockTiming, CoordinatorConfig, FullBlock, MintingIdentity, PeerChainTip,
		Signature, SyncConfig,
	},
};

pub const GENESIS_TIMESTAMP: u64 = 1_000_000;

pub fn test_rules() -> Arc<BasicRules> {
	Arc::new(BasicRules::new(BlockTiming::default()))
}

pub fn registered_identity(rules: &BasicRules, seed: u8, level: u8) -> MintingIdentity {
	let identity = identity_from_seed([seed; 32]);
	rules.register(identity.public_key, level);
	identity
}

/// Chain of `length` blocks starting at genesis, minted by one identity.
pub fn build_chain(rules: &BasicRules, minter: &MintingIdentity, length: u32) -> Vec<FullBlock> {
	let mut blocks = vec![genesis_block(GENESIS_TIMESTAMP)];
	extend_chain(rules, minter, &mut blocks, length.saturating_sub(1));
	blocks
}

pub fn extend_chain(
	rules: &BasicRules,
	minter: &MintingIdentity,
	blocks: &mut Vec<FullBlock>,
	count: u32,
) {
	for _ in 0..count {
		let parent = blocks.last().expect("chain is never empty").summary.clone();
		let block = rules
			.build_candidate(&parent, minter, 0)
			.expect("minter is registered");
		blocks.push(block);
	}
}

/// Chain weight as the sum of minter levels; block weight as its
/// complement. Transparent enough to steer every comparison from a test.
#[derive(Clone, Copy, Default)]
pub struct LevelScorer;

impl ChainWeightScorer for LevelScorer {
	fn chain_weight(
		&self,
		_ancestor_height: u32,
		_ancestor_signature: &Signature,
		summaries: &[BlockSummary],
		max_height: u32,
	) -> BigUint {
		summaries
			.iter()
			.filter(|summary| summary.height <= max_height)
			.map(|summary| summary.minter_level as u64)
			.sum::<u64>()
			.into()
	}

	fn block_weight(
		&self,
		_parent_height: u32,
		_parent_signature: &Signature,
		summary: &BlockSummary,
	) -> BigUint {
		BigUint::from(255u16 - summary.minter_level as u16)
	}
}

/// In-process peer serving a fixed chain, with injectable faults.
#[derive(Default)]
pub struct TestPeer {
	pub address: String,
	pub chain: Vec<FullBlock>,
	pub tip_override: Option<PeerChainTip>,
	pub summaries_fault: Option<PeerError>,
	/// Block requests beyond this many time out.
	pub block_fault_after: Option<usize>,
	/// Serve blocks with tampered contents.
	pub corrupt_blocks: bool,
	pub response_delay: Option<Duration>,
	pub last_misbehaved: Option<u64>,
	block_requests: AtomicUsize,
	pub reported: StdMutex<Vec<String>>,
	pub notified: StdMutex<Vec<BlockSummary>>,
}

impl TestPeer {
	pub fn new(chain: Vec<FullBlock>) -> Self {
		TestPeer {
			address: "peer.test:7777".to_string(),
			chain,
			..TestPeer::default()
		}
	}

	fn position_of(&self, signature: &Signature) -> Option<usize> {
		self.chain
			.iter()
			.position(|block| block.summary.signature == *signature)
	}

	async fn simulate_latency(&self) {
		if let Some(delay) = self.response_delay {
			tokio::time::sleep(delay).await;
		}
	}
}

#[async_trait]
impl PeerLink for TestPeer {
	fn address(&self) -> String {
		self.address.clone()
	}

	fn chain_tip(&self) -> Option<PeerChainTip> {
		if let Some(tip) = &self.tip_override {
			return Some(tip.clone());
		}
		self.chain.last().map(|block| PeerChainTip {
			height: block.summary.height,
			signature: block.summary.signature,
			timestamp: block.summary.timestamp,
		})
	}

	fn last_misbehaved(&self) -> Option<u64> {
		self.last_misbehaved
	}

	async fn request_summaries(
		&self,
		after: Signature,
		count: u32,
	) -> Result<Vec<BlockSummary>, PeerError> {
		self.simulate_latency().await;
		if let Some(fault) = &self.summaries_fault {
			return Err(fault.clone());
		}

		let Some(position) = self.position_of(&after) else {
			return Ok(vec![]);
		};
		Ok(self
			.chain
			.iter()
			.skip(position + 1)
			.take(count as usize)
			.map(|block| block.summary.clone())
			.collect())
	}

	async fn request_block(&self, signature: Signature) -> Result<FullBlock, PeerError> {
		self.simulate_latency().await;

		let requests = self.block_requests.fetch_add(1, Ordering::Relaxed) + 1;
		if self.block_fault_after.is_some_and(|after| requests > after) {
			return Err(PeerError::Timeout);
		}

		let Some(position) = self.position_of(&signature) else {
			return Err(PeerError::Timeout);
		};
		let mut block = self.chain[position].clone();
		if self.corrupt_blocks {
			block.state_delta.push(0xff);
		}
		Ok(block)
	}

	fn report_misbehaviour(&self, reason: &str) {
		self.reported
			.lock()
			.expect("Lock acquired")
			.push(reason.to_string());
	}

	fn notify_tip(&self, tip: &BlockSummary) {
		self.notified
			.lock()
			.expect("Lock acquired")
			.push(tip.clone());
	}
}

/// Fixed peer set standing in for the transport layer.
#[derive(Default)]
pub struct TestNetwork {
	pub peers: Vec<Arc<TestPeer>>,
	pub online_accounts: usize,
	pub broadcasts: StdMutex<Vec<BlockSummary>>,
}

impl TestNetwork {
	pub fn with_peers(peers: Vec<Arc<TestPeer>>) -> Self {
		TestNetwork {
			peers,
			online_accounts: 1,
			broadcasts: StdMutex::new(vec![]),
		}
	}
}

impl Network for TestNetwork {
	fn connected_peers(&self) -> Vec<Arc<dyn PeerLink>> {
		self.peers
			.iter()
			.map(|peer| peer.clone() as Arc<dyn PeerLink>)
			.collect()
	}

	fn online_account_count(&self) -> usize {
		self.online_accounts
	}

	fn broadcast_tip(&self, tip: &BlockSummary) {
		self.broadcasts
			.lock()
			.expect("Lock acquired")
			.push(tip.clone());
	}
}

/// Assembled consensus core over an in-memory store and a manual clock.
pub struct Stack {
	pub store: Arc<MemoryStore>,
	pub rules: Arc<BasicRules>,
	pub time: Arc<FixedTimeSource>,
	pub coordinator: Arc<ChainCoordinator<MemoryStore>>,
	pub shutdown: Controller<String>,
}

impl Stack {
	/// Seeds the store with `blocks` and synchronizes the clock just past
	/// the tip timestamp, so the local chain counts as recent.
	pub fn with_chain(rules: Arc<BasicRules>, blocks: &[FullBlock]) -> Self {
		let store = Arc::new(MemoryStore::new());
		for block in blocks {
			store.append(block.clone()).expect("seed chain is linked");
		}

		let tip_timestamp = blocks
			.last()
			.map_or(GENESIS_TIMESTAMP, |block| block.summary.timestamp);
		let time = Arc::new(FixedTimeSource::new(tip_timestamp + 1_000));

		let config = CoordinatorConfig {
			min_peers: 1,
			..CoordinatorConfig::default()
		};
		let coordinator = Arc::new(
			ChainCoordinator::new(store.clone(), time.clone(), config)
				.expect("seeded store is readable"),
		);

		Stack {
			store,
			rules,
			time,
			coordinator,
			shutdown: Controller::new(),
		}
	}

	pub fn synchronizer<W: ChainWeightScorer>(
		&self,
		scorer: Arc<W>,
	) -> Synchronizer<MemoryStore, BasicRules, W, BasicRules> {
		Synchronizer::new(
			self.store.clone(),
			self.rules.clone(),
			scorer,
			self.rules.clone(),
			self.coordinator.clone(),
			SyncConfig::default(),
			self.shutdown.clone(),
		)
	}
}
