//! Common test utilities.
//!
//! This module contains shared helpers for integration tests.
//! Import with `mod common;` in test files.

#![allow(dead_code)]

use parking_lot::Mutex;
use ripple::atomic::{AtomicCache, CacheContext, Transport};
use ripple::control::affinity::AffinityResolver;
use ripple::control::topology::TopologyTracker;
use ripple::core::config::Config;
use ripple::core::error::SendError;
use ripple::core::types::{NodeId, TopologyVersion};
use ripple::sim::store::MemoryStore;
use ripple::wire::messages::{BackupUpdateRequest, NearUpdateRequest};
use ripple::wire::CacheMessage;
use std::collections::HashSet;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;

/// How long a test waits for an asynchronous step before giving up.
pub const WAIT: Duration = Duration::from_secs(5);

/// Create a minimal valid configuration file.
pub fn create_minimal_config() -> NamedTempFile {
    let config_content = r#"
[node]
node_id = 1
"#;

    let mut file = NamedTempFile::new().expect("Failed to create temp file");
    file.write_all(config_content.as_bytes())
        .expect("Failed to write config");
    file
}

/// Create a configuration with custom settings.
pub fn create_config_with_settings(
    node_id: u64,
    write_sync_mode: &str,
    remap_count: u32,
    log_level: &str,
) -> NamedTempFile {
    let config_content = format!(
        r#"
[node]
node_id = {}
cache_name = "test"

[atomic]
write_sync_mode = "{}"
remap_count = {}

[telemetry]
log_level = "{}"
"#,
        node_id, write_sync_mode, remap_count, log_level
    );

    let mut file = NamedTempFile::new().expect("Failed to create temp file");
    file.write_all(config_content.as_bytes())
        .expect("Failed to write config");
    file
}

/// Load a config from a temp file.
pub fn load_config(file: &NamedTempFile) -> Config {
    Config::from_file(file.path()).expect("Failed to load config")
}

// ============================================================================
// Recording transport
// ============================================================================

/// Transport that records every message instead of delivering it.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<(NodeId, CacheMessage)>>,
    down: Mutex<HashSet<NodeId>>,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail every send to `node` as if it had left.
    pub fn take_down(&self, node: NodeId) {
        self.down.lock().insert(node);
    }

    /// Drain the recorded messages.
    pub fn take(&self) -> Vec<(NodeId, CacheMessage)> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub fn is_empty(&self) -> bool {
        self.sent.lock().is_empty()
    }

    /// Drain recorded near update requests.
    pub fn take_near_requests(&self) -> Vec<(NodeId, NearUpdateRequest)> {
        self.take()
            .into_iter()
            .filter_map(|(node, message)| match message {
                CacheMessage::NearUpdateRequest(request) => Some((node, request)),
                _ => None,
            })
            .collect()
    }

    /// Wait until a near update request was sent and return it.
    pub async fn next_near_request(&self) -> (NodeId, NearUpdateRequest) {
        let found = tokio::time::timeout(WAIT, async {
            loop {
                let mut requests = self.take_near_requests();
                if let Some(request) = requests.pop() {
                    return request;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await;
        found.expect("no near update request was sent")
    }
}

impl Transport for RecordingTransport {
    fn send(&self, node: NodeId, message: CacheMessage) -> Result<(), SendError> {
        if self.down.lock().contains(&node) {
            return Err(SendError::NodeLeft(node));
        }
        self.sent.lock().push((node, message));
        Ok(())
    }
}

/// Split recorded messages into backup update requests and everything else.
pub fn backup_requests(
    messages: Vec<(NodeId, CacheMessage)>,
) -> (Vec<(NodeId, BackupUpdateRequest)>, Vec<(NodeId, CacheMessage)>) {
    let mut requests = Vec::new();
    let mut rest = Vec::new();
    for (node, message) in messages {
        match message {
            CacheMessage::BackupUpdateRequest(request) => requests.push((node, request)),
            other => rest.push((node, other)),
        }
    }
    (requests, rest)
}

// ============================================================================
// Fixed affinity
// ============================================================================

/// Affinity returning the same owners for every key and version.
pub struct FixedAffinity {
    owners: Mutex<Vec<NodeId>>,
}

impl FixedAffinity {
    pub fn new(owners: &[u64]) -> Arc<Self> {
        Arc::new(Self {
            owners: Mutex::new(owners.iter().copied().map(NodeId).collect()),
        })
    }

    pub fn set_owners(&self, owners: &[u64]) {
        *self.owners.lock() = owners.iter().copied().map(NodeId).collect();
    }
}

impl AffinityResolver for FixedAffinity {
    fn partition(&self, _key: &[u8]) -> u32 {
        0
    }

    fn nodes(&self, _partition: u32, _version: TopologyVersion) -> Vec<NodeId> {
        self.owners.lock().clone()
    }
}

// ============================================================================
// Test node
// ============================================================================

/// One cache node wired to a recording transport and fixed owners.
pub struct TestNode {
    pub cache: AtomicCache,
    pub transport: Arc<RecordingTransport>,
    pub affinity: Arc<FixedAffinity>,
    pub topology: Arc<TopologyTracker>,
    pub store: Arc<MemoryStore>,
}

impl TestNode {
    /// Start node `local` in a cluster of `nodes`, owners `owners`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: &Config, nodes: &[u64], owners: &[u64]) -> Self {
        let transport = RecordingTransport::new();
        let affinity = FixedAffinity::new(owners);
        let topology = Arc::new(TopologyTracker::new(nodes.iter().copied().map(NodeId)));
        let store = Arc::new(MemoryStore::new());

        let ctx = CacheContext::new(
            config,
            transport.clone(),
            affinity.clone(),
            topology.clone(),
            store.clone(),
        )
        .expect("Failed to create cache context");

        Self {
            cache: AtomicCache::new(ctx),
            transport,
            affinity,
            topology,
            store,
        }
    }

    pub fn ctx(&self) -> &Arc<CacheContext> {
        self.cache.context()
    }

    pub fn cache_id(&self) -> u32 {
        self.ctx().cache_id
    }
}

/// Config for node `node_id` with `remap_count` remaps.
pub fn node_config(node_id: u64, remap_count: u32) -> Config {
    let mut config = Config::for_node(node_id);
    config.atomic.remap_count = remap_count;
    config
}

// ============================================================================
// Assertions
// ============================================================================

/// Assert that a result is Ok and return the value.
#[track_caller]
pub fn assert_ok<T, E: std::fmt::Debug>(result: Result<T, E>) -> T {
    match result {
        Ok(v) => v,
        Err(e) => panic!("Expected Ok, got Err: {:?}", e),
    }
}

/// Assert that a result is Err.
#[track_caller]
pub fn assert_err<T: std::fmt::Debug, E>(result: Result<T, E>) -> E {
    match result {
        Ok(v) => panic!("Expected Err, got Ok: {:?}", v),
        Err(e) => e,
    }
}

/// Await `future`, failing the test if it takes longer than [`WAIT`].
pub async fn within<F: std::future::Future>(future: F) -> F::Output {
    tokio::time::timeout(WAIT, future)
        .await
        .expect("timed out waiting for completion")
}

/// Poll `condition` until it holds or [`WAIT`] elapses.
pub async fn eventually<F: Fn() -> bool>(condition: F) {
    within(async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
}
