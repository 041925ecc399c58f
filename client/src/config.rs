use mintaka_core::types::{tracing_level_format, CoordinatorConfig, MinterConfig, SyncConfig};
use serde::{Deserialize, Serialize};
use tracing::Level;

/// Representation of a configuration used by this project.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct RuntimeConfig {
	/// Name of the project running the node. (default: "mintaka")
	pub project_name: String,
	/// Log level, default is `INFO`. (default: `INFO`)
	#[serde(with = "tracing_level_format")]
	pub log_level: Level,
	/// If set to true, logs are displayed in JSON format, which is used for
	/// structured logging. Otherwise, plain text format is used (default: false).
	pub log_format_json: bool,
	/// Timestamp of the genesis block created when the store is empty,
	/// milliseconds since the epoch.
	pub genesis_timestamp: u64,
	/// Number of online accounts assumed known before the transport layer
	/// reports real ones (default: 1).
	pub online_accounts: usize,
	/// Hex-encoded 32-byte seeds of this node's minting identities.
	pub minting_seeds: Vec<String>,
	/// Effective level registered for the configured minting identities
	/// (default: 1).
	pub minting_level: u8,
	pub sync: SyncConfig,
	pub minter: MinterConfig,
	pub coordinator: CoordinatorConfig,
}

impl Default for RuntimeConfig {
	fn default() -> Self {
		RuntimeConfig {
			project_name: "mintaka".to_string(),
			log_level: Level::INFO,
			log_format_json: false,
			genesis_timestamp: 1_700_000_000_000,
			online_accounts: 1,
			minting_seeds: vec![],
			minting_level: 1,
			sync: SyncConfig::default(),
			minter: MinterConfig::default(),
			coordinator: CoordinatorConfig::default(),
		}
	}
}
