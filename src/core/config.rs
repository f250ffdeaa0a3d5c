//! Configuration parsing and validation.
//!
//! Configuration is loaded from TOML files with CLI overrides. The `[atomic]`
//! section holds the defaults every atomic update starts from; individual updates
//! may override them through [`crate::atomic::UpdateOp`].

use crate::core::types::{NearRelay, SyncMode};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::hash::Hasher;
use std::path::Path;
use twox_hash::XxHash64;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Local node identity and cache naming.
    pub node: NodeConfig,

    /// Atomic write path settings.
    #[serde(default)]
    pub atomic: AtomicConfig,

    /// Telemetry and observability configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Local node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// This node's identifier.
    pub node_id: u64,

    /// Name of the cache served by this node.
    #[serde(default = "default_cache_name")]
    pub cache_name: String,
}

impl NodeConfig {
    /// Cache identifier stamped on every message envelope.
    pub fn cache_id(&self) -> u32 {
        cache_id(&self.cache_name)
    }
}

/// Atomic write path configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AtomicConfig {
    /// Default write synchronization contract.
    #[serde(default = "default_write_sync_mode")]
    pub write_sync_mode: SyncMode,

    /// Maximum number of remaps after retryable topology errors.
    #[serde(default = "default_remap_count")]
    pub remap_count: u32,

    /// Wait for an in-flight topology exchange instead of failing fast.
    #[serde(default = "default_true")]
    pub wait_topology_future: bool,

    /// Who reports backup completion to the near node under `full_sync`.
    #[serde(default)]
    pub near_relay: NearRelay,

    /// With backup relay, also send the backup mapping from the primary to the near node.
    #[serde(default)]
    pub send_mapping_to_near: bool,

    /// Number of partitions keys are hashed into.
    #[serde(default = "default_partitions")]
    pub partitions: u32,

    /// Number of backup copies per partition.
    #[serde(default = "default_backups")]
    pub backups: u32,

    /// Keep a near-side read view of written values.
    #[serde(default)]
    pub near_cache: bool,
}

impl Default for AtomicConfig {
    fn default() -> Self {
        Self {
            write_sync_mode: default_write_sync_mode(),
            remap_count: default_remap_count(),
            wait_topology_future: true,
            near_relay: NearRelay::default(),
            send_mapping_to_near: false,
            partitions: default_partitions(),
            backups: default_backups(),
            near_cache: false,
        }
    }
}

/// Telemetry and observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

// Default value functions

fn default_cache_name() -> String {
    "default".to_string()
}

fn default_write_sync_mode() -> SyncMode {
    SyncMode::FullSync
}

fn default_remap_count() -> u32 {
    32
}

fn default_true() -> bool {
    true
}

fn default_partitions() -> u32 {
    1024
}

fn default_backups() -> u32 {
    1
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Cache identifier for a cache name.
pub fn cache_id(cache_name: &str) -> u32 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(cache_name.as_bytes());
    hasher.finish() as u32
}

impl Config {
    /// Configuration for a node with every other setting at its default.
    pub fn for_node(node_id: u64) -> Self {
        Self {
            node: NodeConfig {
                node_id,
                cache_name: default_cache_name(),
            },
            atomic: AtomicConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }

    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| "failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).with_context(|| "failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Render the configuration as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("failed to render config")
    }

    /// Apply CLI overrides to the configuration.
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(ref log_level) = overrides.log_level {
            self.telemetry.log_level = log_level.clone();
        }
        if let Some(node_id) = overrides.node_id {
            self.node.node_id = node_id;
        }
        if let Some(sync_mode) = overrides.write_sync_mode {
            self.atomic.write_sync_mode = sync_mode;
        }
        if let Some(remap_count) = overrides.remap_count {
            self.atomic.remap_count = remap_count;
        }
    }

    /// Validate configuration consistency.
    pub fn validate(&self) -> Result<()> {
        self.validate_node()?;
        self.validate_atomic()?;
        self.validate_telemetry()?;
        Ok(())
    }

    fn validate_node(&self) -> Result<()> {
        if self.node.cache_name.is_empty() {
            anyhow::bail!("node.cache_name must not be empty");
        }
        Ok(())
    }

    fn validate_atomic(&self) -> Result<()> {
        if self.atomic.partitions == 0 {
            anyhow::bail!("atomic.partitions must be > 0");
        }

        if self.atomic.send_mapping_to_near && self.atomic.near_relay != NearRelay::Backups {
            anyhow::bail!("atomic.send_mapping_to_near requires atomic.near_relay = \"backups\"");
        }

        if self.atomic.write_sync_mode != SyncMode::FullSync
            && self.atomic.near_relay == NearRelay::Backups
        {
            tracing::warn!(
                sync_mode = %self.atomic.write_sync_mode,
                "atomic.near_relay = \"backups\" only affects full_sync updates"
            );
        }

        Ok(())
    }

    fn validate_telemetry(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.telemetry.log_level.as_str()) {
            anyhow::bail!(
                "telemetry.log_level must be one of {:?}, got: {}",
                valid_levels,
                self.telemetry.log_level
            );
        }
        Ok(())
    }
}

/// CLI override options that can be applied to configuration.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Override log level.
    pub log_level: Option<String>,
    /// Override node id.
    pub node_id: Option<u64>,
    /// Override default write synchronization mode.
    pub write_sync_mode: Option<SyncMode>,
    /// Override remap count.
    pub remap_count: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_uses_defaults() {
        let config = Config::from_toml("[node]\nnode_id = 3\n").unwrap();
        assert_eq!(config.node.node_id, 3);
        assert_eq!(config.node.cache_name, "default");
        assert_eq!(config.atomic.write_sync_mode, SyncMode::FullSync);
        assert_eq!(config.atomic.remap_count, 32);
        assert!(config.atomic.wait_topology_future);
        assert_eq!(config.atomic.near_relay, NearRelay::Primary);
        assert_eq!(config.telemetry.log_level, "info");
    }

    #[test]
    fn sync_mode_parses_snake_case() {
        let config = Config::from_toml(
            "[node]\nnode_id = 1\n[atomic]\nwrite_sync_mode = \"primary_sync\"\nnear_relay = \"backups\"\n",
        )
        .unwrap();
        assert_eq!(config.atomic.write_sync_mode, SyncMode::PrimarySync);
        assert_eq!(config.atomic.near_relay, NearRelay::Backups);
    }

    #[test]
    fn zero_partitions_rejected() {
        let err = Config::from_toml("[node]\nnode_id = 1\n[atomic]\npartitions = 0\n");
        assert!(err.is_err());
    }

    #[test]
    fn mapping_to_near_requires_backup_relay() {
        let err = Config::from_toml("[node]\nnode_id = 1\n[atomic]\nsend_mapping_to_near = true\n");
        assert!(err.is_err());
    }

    #[test]
    fn overrides_apply() {
        let mut config = Config::for_node(1);
        config.apply_overrides(&ConfigOverrides {
            log_level: Some("debug".to_string()),
            node_id: Some(9),
            write_sync_mode: Some(SyncMode::FullAsync),
            remap_count: Some(2),
        });
        assert_eq!(config.telemetry.log_level, "debug");
        assert_eq!(config.node.node_id, 9);
        assert_eq!(config.atomic.write_sync_mode, SyncMode::FullAsync);
        assert_eq!(config.atomic.remap_count, 2);
    }

    #[test]
    fn cache_id_is_stable() {
        assert_eq!(cache_id("users"), cache_id("users"));
        assert_ne!(cache_id("users"), cache_id("orders"));
    }
}
