//! Simulate command implementation.

use crate::core::config::ConfigOverrides;
use crate::core::types::{NodeId, SyncMode};
use crate::sim::{SimCluster, DEFAULT_CHUNK_SIZE};
use anyhow::{Context, Result};
use clap::Args;
use std::path::Path;
use std::time::Duration;

/// Run writes against an in-process cluster.
#[derive(Args, Debug)]
pub struct SimulateArgs {
    /// Number of nodes.
    #[arg(long, default_value_t = 3)]
    pub nodes: u64,

    /// Number of keys to write.
    #[arg(long, default_value_t = 16)]
    pub keys: u64,

    /// Write synchronization mode (full_sync, primary_sync, full_async).
    #[arg(long, value_parser = parse_sync_mode)]
    pub sync_mode: Option<SyncMode>,

    /// Kill this node halfway through the writes.
    #[arg(long)]
    pub kill: Option<u64>,

    /// Bytes fed to the message decoder at a time.
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    pub chunk_size: usize,
}

fn parse_sync_mode(raw: &str) -> std::result::Result<SyncMode, String> {
    match raw {
        "full_sync" => Ok(SyncMode::FullSync),
        "primary_sync" => Ok(SyncMode::PrimarySync),
        "full_async" => Ok(SyncMode::FullAsync),
        other => Err(format!("unknown sync mode: {}", other)),
    }
}

/// Initialize tracing subscriber if the telemetry feature is enabled.
#[cfg(feature = "telemetry")]
fn init_tracing(level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // A subscriber may already be installed when embedded.
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .try_init();
}

#[cfg(not(feature = "telemetry"))]
fn init_tracing(_level: &str) {}

/// Run the simulate command.
pub async fn run_simulate(
    args: SimulateArgs,
    config_path: Option<&Path>,
    overrides: &ConfigOverrides,
) -> Result<()> {
    let mut config = super::load_config(config_path, overrides)?;
    init_tracing(&config.telemetry.log_level);

    if args.nodes == 0 {
        anyhow::bail!("--nodes must be > 0");
    }
    if let Some(sync_mode) = args.sync_mode {
        config.atomic.write_sync_mode = sync_mode;
    }

    let cluster = SimCluster::start_with_chunk_size(args.nodes, &config, args.chunk_size)
        .context("failed to start simulated cluster")?;
    let kill_at = args.kill.map(|node| (NodeId(node), args.keys / 2));

    let mut succeeded = 0u64;
    let mut failed = 0u64;
    for i in 0..args.keys {
        if let Some((node, at)) = kill_at {
            if i == at && cluster.kill(node) {
                println!("killed {} after {} writes", node, i);
            }
        }

        let live = cluster.node_ids();
        let writer = live[(i as usize) % live.len()];
        let cache = cluster
            .cache(writer)
            .with_context(|| format!("{} is not running", writer))?;

        match cache.put(format!("key-{}", i), format!("value-{}", i)).await {
            Ok(true) => succeeded += 1,
            Ok(false) => failed += 1,
            Err(e) => {
                println!("  key-{} via {}: {}", i, writer, e);
                failed += 1;
            }
        }
    }

    if config.atomic.write_sync_mode != SyncMode::FullSync {
        // Backups are not awaited; give them a moment.
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let mut replicated = 0u64;
    for i in 0..args.keys {
        let key = format!("key-{}", i);
        let value = format!("value-{}", i);
        let owners = cluster.owners(key.as_bytes());
        let everywhere = !owners.is_empty()
            && owners.iter().all(|node| {
                cluster
                    .store(*node)
                    .and_then(|store| store.get(key.as_bytes()))
                    .is_some_and(|stored| stored == value.as_bytes())
            });
        if everywhere {
            replicated += 1;
        }
    }

    println!(
        "{} nodes, sync mode {}, topology {}",
        cluster.node_ids().len(),
        config.atomic.write_sync_mode,
        cluster.topology().version()
    );
    println!("writes: {} succeeded, {} failed", succeeded, failed);
    println!("fully replicated: {}/{}", replicated, args.keys);

    cluster.shutdown();
    Ok(())
}
