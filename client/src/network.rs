//! Stand-in transport layer.
//!
//! Wire-level peer connections are outside this binary; a real deployment
//! plugs its transport in behind [`mintaka_core::network::Network`]. Until
//! then the node runs with an empty peer set, which still exercises the
//! full coordinator/minter machinery in standalone mode.

use mintaka_core::network::{Network, PeerLink};
use mintaka_core::types::BlockSummary;
use std::sync::Arc;
use tracing::debug;

pub struct StandaloneNetwork {
	online_accounts: usize,
}

impl StandaloneNetwork {
	pub fn new(online_accounts: usize) -> Self {
		StandaloneNetwork { online_accounts }
	}
}

impl Network for StandaloneNetwork {
	fn connected_peers(&self) -> Vec<Arc<dyn PeerLink>> {
		vec![]
	}

	fn online_account_count(&self) -> usize {
		self.online_accounts
	}

	fn broadcast_tip(&self, tip: &BlockSummary) {
		debug!(height = tip.height, signature = %tip.signature, "No peers to broadcast tip to");
	}
}
