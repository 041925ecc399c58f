//! Shared consensus-core structs and enums.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use std::time::Duration;

/// Number of most recent full blocks kept in the coordinator cache.
/// Covers a typical peer summary request plus a few spare.
pub const BLOCK_CACHE_SIZE: usize = 10;

/// Opaque block or transaction signature.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Signature(pub [u8; 32]);

impl Signature {
	/// Reference used by the genesis block, which has no parent.
	pub const NONE: Signature = Signature([0u8; 32]);

	/// Short hex prefix used in logs.
	pub fn short(&self) -> String {
		hex::encode(&self.0[..4])
	}
}

impl Display for Signature {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		f.write_str(&self.short())
	}
}

impl fmt::Debug for Signature {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		write!(f, "Signature({})", self.short())
	}
}

impl FromStr for Signature {
	type Err = hex::FromHexError;

	fn from_str(value: &str) -> Result<Self, Self::Err> {
		let mut bytes = [0u8; 32];
		hex::decode_to_slice(value, &mut bytes)?;
		Ok(Signature(bytes))
	}
}

/// Public key of a minting identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PublicKey(pub [u8; 32]);

impl Display for PublicKey {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		f.write_str(&hex::encode(&self.0[..4]))
	}
}

impl fmt::Debug for PublicKey {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		write!(f, "PublicKey({})", hex::encode(&self.0[..4]))
	}
}

/// Minimal block metadata needed to compare and rank chains without
/// transferring full block bodies.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct BlockSummary {
	pub height: u32,
	pub signature: Signature,
	/// Signature of the parent block.
	pub reference: Signature,
	pub minter: PublicKey,
	/// Effective minting level of the minter; 0 when unknown and filled
	/// locally before any weight comparison.
	pub minter_level: u8,
	/// Milliseconds since the epoch, network-adjusted.
	pub timestamp: u64,
}

/// An unconfirmed or in-block transaction. Only the fields the minting
/// loop needs for timing-based filtering are modelled here; the payload
/// stays opaque to this crate.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Transaction {
	pub signature: Signature,
	pub timestamp: u64,
	/// Transactions are invalid in blocks timestamped at or after this.
	pub deadline: u64,
	pub payload: Vec<u8>,
}

/// Block summary plus transactions and the opaque contract-state delta,
/// fetched lazily only for a winning chain.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct FullBlock {
	pub summary: BlockSummary,
	pub transactions: Vec<Transaction>,
	pub state_delta: Vec<u8>,
}

impl FullBlock {
	/// Returns a copy of this block with one more transaction appended.
	/// The signature is stale afterwards and must be recomputed.
	pub fn with_transaction(&self, transaction: Transaction) -> FullBlock {
		let mut block = self.clone();
		block.transactions.push(transaction);
		block
	}
}

/// Chain tip as last reported by a peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerChainTip {
	pub height: u32,
	pub signature: Signature,
	pub timestamp: u64,
}

/// Chain change notifications published by the coordinator after every
/// individual block change.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChainEvent {
	BlockApplied(BlockSummary),
	BlockOrphaned(BlockSummary),
}

/// A credential entitling its holder to propose blocks. A node may hold
/// several; eligibility is rechecked on every minting tick.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MintingIdentity {
	pub public_key: PublicKey,
	/// Opaque signing seed consumed by the consensus rules.
	pub seed: [u8; 32],
}

/// Expected block cadence, used to derive the minimum acceptable
/// latest-block timestamp.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct BlockTiming {
	/// Target milliseconds between blocks.
	pub target: u64,
	/// Tolerated deviation in milliseconds.
	pub deviation: u64,
}

impl Default for BlockTiming {
	fn default() -> Self {
		BlockTiming {
			target: 60_000,
			deviation: 30_000,
		}
	}
}

/// Synchronizer tuning knobs.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
	/// Summaries requested per probe when searching for a common block.
	pub initial_block_step: u32,
	/// Cap for the exponential probe back-off.
	pub maximum_block_step: u32,
	/// Reorg depth bound; a common block further below our tip than this
	/// aborts a non-forced attempt.
	pub maximum_common_delta: u32,
	/// Blocks fetched and applied per batch when extending our own chain.
	pub sync_batch_size: u32,
	/// Bounded wait for the chain-mutation lock during an apply window.
	#[serde(with = "duration_seconds_format")]
	pub lock_timeout: Duration,
}

impl Default for SyncConfig {
	fn default() -> Self {
		SyncConfig {
			initial_block_step: 8,
			maximum_block_step: 500,
			maximum_common_delta: 240,
			sync_batch_size: 200,
			lock_timeout: Duration::from_secs(30),
		}
	}
}

/// Block minter tuning knobs.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MinterConfig {
	#[serde(with = "duration_seconds_format")]
	pub tick_interval: Duration,
	/// Bounded wait for the chain-mutation lock before giving up on a tick.
	#[serde(with = "duration_seconds_format")]
	pub lock_timeout: Duration,
	/// Minimum number of well-behaved, up-to-date peers required to mint.
	pub min_peers: usize,
}

impl Default for MinterConfig {
	fn default() -> Self {
		MinterConfig {
			tick_interval: Duration::from_secs(1),
			lock_timeout: Duration::from_secs(30),
			min_peers: 3,
		}
	}
}

/// Coordinator tuning knobs.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
	/// Cadence of the synchronization decision loop.
	#[serde(with = "duration_seconds_format")]
	pub sync_interval: Duration,
	/// Minimum number of candidate peers before attempting to synchronize.
	pub min_peers: usize,
	/// Peers that misbehaved within this window are not considered.
	#[serde(with = "duration_seconds_format")]
	pub misbehaviour_cooloff: Duration,
	/// Number of most recent blocks whose timing budget defines a
	/// "recent" chain tip.
	pub max_tip_age_blocks: u32,
	pub block_timing: BlockTiming,
}

impl Default for CoordinatorConfig {
	fn default() -> Self {
		CoordinatorConfig {
			sync_interval: Duration::from_secs(1),
			min_peers: 3,
			misbehaviour_cooloff: Duration::from_secs(10 * 60),
			max_tip_age_blocks: 5,
			block_timing: BlockTiming::default(),
		}
	}
}

pub mod tracing_level_format {
	use serde::{self, Deserialize, Deserializer, Serializer};
	use std::str::FromStr;
	use tracing::Level;

	pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_str(&level.to_string())
	}

	pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
	where
		D: Deserializer<'de>,
	{
		let value = String::deserialize(deserializer)?;
		Level::from_str(&value).map_err(serde::de::Error::custom)
	}
}

pub mod duration_seconds_format {
	use serde::{self, Deserialize, Deserializer, Serializer};
	use std::time::Duration;

	pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_u64(duration.as_secs())
	}

	pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
	where
		D: Deserializer<'de>,
	{
		let value = u64::deserialize(deserializer)?;
		Ok(Duration::from_secs(value))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn signature_display_is_short_hex_prefix() {
		let mut bytes = [0u8; 32];
		bytes[0] = 0xab;
		bytes[1] = 0xcd;
		let signature = Signature(bytes);
		assert_eq!(signature.to_string(), "abcd0000");
	}

	#[test]
	fn signature_roundtrips_through_hex() {
		let signature = Signature([7u8; 32]);
		let encoded = hex::encode(signature.0);
		assert_eq!(encoded.parse::<Signature>().unwrap(), signature);
	}

	#[test]
	fn with_transaction_appends_without_mutating_original() {
		let block = FullBlock {
			summary: BlockSummary {
				height: 1,
				signature: Signature([1u8; 32]),
				reference: Signature::NONE,
				minter: PublicKey([2u8; 32]),
				minter_level: 1,
				timestamp: 1_000,
			},
			transactions: vec![],
			state_delta: vec![],
		};

		let transaction = Transaction {
			signature: Signature([3u8; 32]),
			timestamp: 500,
			deadline: 2_000,
			payload: vec![1, 2, 3],
		};

		let extended = block.with_transaction(transaction.clone());
		assert!(block.transactions.is_empty());
		assert_eq!(extended.transactions, vec![transaction]);
	}
}
