//! CLI command implementations.

mod config;
mod simulate;

pub use config::{run_config, ConfigArgs};
pub use simulate::{run_simulate, SimulateArgs};

use crate::core::config::{Config, ConfigOverrides};
use anyhow::{Context, Result};
use std::path::Path;

/// Load `path` if it exists, otherwise start from defaults, then apply `overrides`.
pub fn load_config(path: Option<&Path>, overrides: &ConfigOverrides) -> Result<Config> {
    let mut config = match path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("failed to load config from {:?}", path))?,
        None => Config::for_node(1),
    };
    config.apply_overrides(overrides);
    config.validate()?;
    Ok(config)
}
