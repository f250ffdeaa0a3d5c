//! Command-line interface.
//!
//! Unified CLI for Ripple operations.

pub mod commands;

use clap::{Parser, Subcommand};

/// Ripple - write-path coordination for a partitioned, replicated cache.
#[derive(Parser, Debug)]
#[command(name = "ripple")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path.
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Configuration operations.
    Config(commands::ConfigArgs),
    /// Run writes against an in-process cluster.
    Simulate(commands::SimulateArgs),
}
