//! Ripple - unified CLI entrypoint.
//!
//! Usage:
//!   ripple config validate --config config/ripple.toml
//!   ripple config show --config config/ripple.toml
//!   ripple simulate --nodes 3 --keys 16 --kill 2

use anyhow::Result;
use clap::Parser;
use ripple::cli::commands::{run_config, run_simulate};
use ripple::cli::{Cli, Commands};
use ripple::core::config::ConfigOverrides;
use std::path::PathBuf;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.map(PathBuf::from);
    let overrides = ConfigOverrides {
        log_level: cli.log_level,
        ..ConfigOverrides::default()
    };

    match cli.command {
        Commands::Config(args) => run_config(args),
        Commands::Simulate(args) => run_simulate(args, config_path.as_deref(), &overrides).await,
    }
}
