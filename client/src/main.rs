//! Mintaka node client: loads configuration, assembles the consensus core
//! over an in-memory store and the reference consensus rules, and runs the
//! coordinator and minter loops until shutdown.

use crate::cli::CliOpts;
use crate::config::RuntimeConfig;
use crate::network::StandaloneNetwork;
use clap::Parser;
use color_eyre::{
	eyre::{eyre, WrapErr},
	Result,
};
use mintaka_core::{
	coordinator::{self, ChainCoordinator},
	mempool::MemoryPool,
	minter::{self, BlockMinter},
	rules::basic::{genesis_block, identity_from_seed, BasicRules, BasicScorer},
	shutdown::Controller,
	store::{ChainStore, MemoryStore},
	synchronizer::Synchronizer,
	time::SystemTimeSource,
	types::{ChainEvent, MintingIdentity},
	utils::{default_subscriber, install_panic_hooks, json_subscriber, spawn_in_span},
};
use std::{fs, sync::Arc};
use tracing::{error, info, warn};
use uuid::Uuid;

mod cli;
mod config;
mod network;

pub fn load_runtime_config(opts: &CliOpts) -> Result<RuntimeConfig> {
	let mut cfg: RuntimeConfig = if let Some(config_path) = &opts.config {
		fs::metadata(config_path).map_err(|_| eyre!("Provided config file doesn't exist."))?;
		confy::load_path(config_path)
			.wrap_err(format!("Failed to load configuration from {config_path}"))?
	} else {
		RuntimeConfig::default()
	};

	// Flags override the config parameters
	cfg.log_format_json = opts.logs_json || cfg.log_format_json;
	cfg.log_level = opts.verbosity.unwrap_or(cfg.log_level);

	if let Some(seed) = &opts.minting_seed {
		cfg.minting_seeds.push(seed.clone());
	}

	if opts.standalone {
		cfg.minter.min_peers = 0;
		cfg.coordinator.min_peers = 0;
	}

	Ok(cfg)
}

fn minting_identities(cfg: &RuntimeConfig) -> Result<Vec<MintingIdentity>> {
	cfg.minting_seeds
		.iter()
		.map(|encoded| {
			let mut seed = [0u8; 32];
			hex::decode_to_slice(encoded, &mut seed)
				.wrap_err(format!("Invalid minting seed {encoded}"))?;
			Ok(identity_from_seed(seed))
		})
		.collect()
}

async fn run(cfg: RuntimeConfig, shutdown: Controller<String>, execution_id: Uuid) -> Result<()> {
	let version = clap::crate_version!();
	info!(version, %execution_id, "Running Mintaka node client");
	info!("Using config: {cfg:?}");

	let identities = minting_identities(&cfg)?;
	if identities.is_empty() {
		warn!("No minting identities configured; node will only follow the chain");
	}

	let rules = Arc::new(BasicRules::new(cfg.coordinator.block_timing));
	for identity in &identities {
		rules.register(identity.public_key, cfg.minting_level);
	}

	let store = Arc::new(MemoryStore::new());
	if store.current_height()? == 0 {
		let genesis = genesis_block(cfg.genesis_timestamp);
		info!(signature = %genesis.summary.signature, "Creating genesis block");
		store
			.append(genesis)
			.map_err(|error| eyre!("Failed to store genesis block: {error}"))?;
	}

	let time = Arc::new(SystemTimeSource);
	let scorer = Arc::new(BasicScorer);
	let pool = Arc::new(MemoryPool::new());
	let network = Arc::new(StandaloneNetwork::new(cfg.online_accounts));

	let coordinator = Arc::new(
		ChainCoordinator::new(store.clone(), time.clone(), cfg.coordinator)
			.map_err(|error| eyre!("Failed to initialize chain coordinator: {error}"))?,
	);

	let synchronizer = Arc::new(Synchronizer::new(
		store.clone(),
		rules.clone(),
		scorer.clone(),
		rules.clone(),
		coordinator.clone(),
		cfg.sync,
		shutdown.clone(),
	));

	// Chain event log feed; holds a delay token so shutdown completes only
	// after the feed task wound down.
	let mut events = coordinator.subscribe_events();
	let event_token = shutdown.delay_token();
	let event_feed = async move {
		let _event_token = event_token;
		loop {
			match events.recv().await {
				Ok(ChainEvent::BlockApplied(summary)) => {
					info!(height = summary.height, signature = %summary.signature, "Block applied");
				},
				Ok(ChainEvent::BlockOrphaned(summary)) => {
					info!(height = summary.height, signature = %summary.signature, "Block orphaned");
				},
				Err(error) => {
					error!(%error, "Chain event feed closed");
					return;
				},
			}
		}
	};
	spawn_in_span(shutdown.clone().with_cancel(event_feed));

	spawn_in_span(coordinator::run(
		coordinator.clone(),
		synchronizer,
		network.clone(),
		pool.clone(),
		shutdown.clone(),
	));

	// The reference rules double as the eligibility oracle.
	let block_minter = BlockMinter::new(
		store,
		rules.clone(),
		scorer,
		rules,
		network,
		pool,
		coordinator.clone(),
		time,
		identities,
		cfg.minter,
	);
	spawn_in_span(minter::run(block_minter, shutdown.clone()));

	Ok(())
}

#[tokio::main]
pub async fn main() -> Result<()> {
	let shutdown = Controller::new();
	let opts = CliOpts::parse();
	let cfg = load_runtime_config(&opts)?;

	if cfg.log_format_json {
		tracing::subscriber::set_global_default(json_subscriber(cfg.log_level))?;
	} else {
		tracing::subscriber::set_global_default(default_subscriber(cfg.log_level))?;
	};

	// install custom panic hooks
	install_panic_hooks(shutdown.clone())?;

	let execution_id = Uuid::new_v4();

	// watch for ctrl-c signals from user to trigger the shutdown
	spawn_in_span(
		shutdown
			.clone()
			.on_user_signal("User signaled shutdown".to_string()),
	);

	if let Err(error) = run(cfg, shutdown.clone(), execution_id).await {
		error!("{error:#}");
		return Err(error.wrap_err("Starting Mintaka node failed"));
	};

	let reason = shutdown.completed_shutdown().await;
	info!(%reason, "Node stopped");
	Ok(())
}
