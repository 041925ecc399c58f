//! Peer messaging boundary.
//!
//! Wire transport and message framing live outside this crate; the
//! synchronizer and coordinator only see the request/response surface
//! below. All requests block the calling task up to the transport's own
//! timeout and must never be issued while holding the chain-mutation lock.

use async_trait::async_trait;
use mockall::automock;
use std::sync::Arc;

use crate::types::{BlockSummary, FullBlock, PeerChainTip, Signature};

#[derive(Debug, Clone, thiserror::Error)]
pub enum PeerError {
	#[error("request timed out")]
	Timeout,
	#[error("peer disconnected")]
	Disconnected,
	#[error("malformed response: {0}")]
	Malformed(String),
}

/// Request/response link to a single remote node.
#[async_trait]
#[automock]
pub trait PeerLink: Send + Sync {
	fn address(&self) -> String;

	/// Chain tip as last announced by this peer, if any.
	fn chain_tip(&self) -> Option<PeerChainTip>;

	/// Timestamp of this peer's most recent misbehaviour, if any.
	fn last_misbehaved(&self) -> Option<u64>;

	/// Up to `count` block summaries following the block with the given
	/// signature. An empty response means the peer does not know the
	/// signature or has nothing after it.
	async fn request_summaries(
		&self,
		after: Signature,
		count: u32,
	) -> Result<Vec<BlockSummary>, PeerError>;

	async fn request_block(&self, signature: Signature) -> Result<FullBlock, PeerError>;

	/// Marks the peer for a cool-off; the transport layer handles
	/// disconnection and retry policy.
	fn report_misbehaviour(&self, reason: &str);

	/// Tells the peer about our chain tip, typically after refusing its
	/// inferior chain.
	fn notify_tip(&self, tip: &BlockSummary);
}

/// View of the connected peer set.
#[automock]
pub trait Network: Send + Sync {
	fn connected_peers(&self) -> Vec<Arc<dyn PeerLink>>;

	/// Number of remote accounts currently known to be online. Minting is
	/// pointless while this is zero (e.g. during startup).
	fn online_account_count(&self) -> usize;

	fn broadcast_tip(&self, tip: &BlockSummary);
}
