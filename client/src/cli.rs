use clap::{command, Parser};
use tracing::Level;

#[derive(Parser)]
#[command(version)]
pub struct CliOpts {
	/// Path to the toml configuration file
	#[arg(short, long, value_name = "FILE")]
	pub config: Option<String>,
	/// Log level
	#[arg(long)]
	pub verbosity: Option<Level>,
	/// Set logs format to JSON
	#[arg(long)]
	pub logs_json: bool,
	/// Hex-encoded 32-byte seed for an additional minting identity
	#[arg(long)]
	pub minting_seed: Option<String>,
	/// Mint without peers; only sensible on local development networks
	#[arg(long)]
	pub standalone: bool,
}
