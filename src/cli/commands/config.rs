//! Config command implementation.

use crate::core::config::Config;
use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use std::path::{Path, PathBuf};

/// Configuration operations.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

/// Config subcommands.
#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Validate configuration file.
    Validate {
        /// Config file path.
        #[arg(short, long, default_value = "config/ripple.toml")]
        config: PathBuf,
    },
    /// Print configuration with defaults filled in.
    Show {
        /// Config file path.
        #[arg(short, long, default_value = "config/ripple.toml")]
        config: PathBuf,
    },
    /// Print a configuration template.
    Generate {
        /// Output file path.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Run the config command.
pub fn run_config(args: ConfigArgs) -> Result<()> {
    match args.command {
        ConfigCommand::Validate { config } => validate_config(&config),
        ConfigCommand::Show { config } => show_config(&config),
        ConfigCommand::Generate { output } => generate_config(output.as_deref()),
    }
}

fn validate_config(path: &Path) -> Result<()> {
    if !path.exists() {
        anyhow::bail!("Config file not found: {:?}", path);
    }

    let config = Config::from_file(path)?;
    println!("✓ Config file is valid");
    println!(
        "  node {} serving cache '{}' (id {:#010x})",
        config.node.node_id,
        config.node.cache_name,
        config.node.cache_id()
    );
    println!(
        "  write_sync_mode = {}, remap_count = {}, backups = {}",
        config.atomic.write_sync_mode, config.atomic.remap_count, config.atomic.backups
    );
    Ok(())
}

fn show_config(path: &Path) -> Result<()> {
    if !path.exists() {
        anyhow::bail!("Config file not found: {:?}", path);
    }

    let config = Config::from_file(path)?;
    print!("{}", config.to_toml()?);
    Ok(())
}

fn generate_config(output: Option<&Path>) -> Result<()> {
    let template = config_template();
    match output {
        Some(path) => {
            std::fs::write(path, &template)
                .with_context(|| format!("failed to write {:?}", path))?;
            println!("Generated config template: {:?}", path);
        }
        None => println!("{}", template),
    }
    Ok(())
}

fn config_template() -> String {
    r#"# Ripple Configuration

[node]
node_id = 1
cache_name = "default"

[atomic]
# full_sync | primary_sync | full_async
write_sync_mode = "full_sync"
remap_count = 32
wait_topology_future = true
# primary | backups
near_relay = "primary"
send_mapping_to_near = false
partitions = 1024
backups = 1
near_cache = false

[telemetry]
log_level = "info"
"#
    .to_string()
}
