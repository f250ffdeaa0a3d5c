//! In-process cluster.
//!
//! Runs several nodes of one cache inside a single tokio runtime:
//!
//! - [`transport`] - Loopback transport through the wire codec
//! - [`store`] - In-memory storage engine and near cache
//!
//! All nodes share one [`TopologyTracker`], standing in for the membership layer.
//! Killing a node detaches it from the router, runs a topology exchange without it
//! and notifies every surviving node.

pub mod store;
pub mod transport;

pub use store::{MemoryNearCache, MemoryStore, Processor};
pub use transport::{LoopbackRouter, LoopbackTransport};

use crate::atomic::{AtomicCache, CacheContext};
use crate::control::affinity::{AffinityResolver, RendezvousAffinity};
use crate::control::topology::TopologyTracker;
use crate::core::config::Config;
use crate::core::error::CacheResult;
use crate::core::types::NodeId;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Bytes fed to a decoder at a time.
pub const DEFAULT_CHUNK_SIZE: usize = 7;

/// One simulated node.
#[derive(Debug)]
pub struct SimNode {
    pub id: NodeId,
    pub cache: AtomicCache,
    pub store: Arc<MemoryStore>,
    pub near_cache: Option<Arc<MemoryNearCache>>,
    inbox: JoinHandle<()>,
}

/// Cluster of simulated nodes.
pub struct SimCluster {
    router: Arc<LoopbackRouter>,
    topology: Arc<TopologyTracker>,
    affinity: Arc<RendezvousAffinity>,
    nodes: RwLock<BTreeMap<NodeId, SimNode>>,
}

impl SimCluster {
    /// Start `node_count` nodes with ids `1..=node_count`, all configured from `config`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(node_count: u64, config: &Config) -> CacheResult<Self> {
        Self::start_with_chunk_size(node_count, config, DEFAULT_CHUNK_SIZE)
    }

    pub fn start_with_chunk_size(
        node_count: u64,
        config: &Config,
        chunk_size: usize,
    ) -> CacheResult<Self> {
        let ids: Vec<NodeId> = (1..=node_count).map(NodeId).collect();
        let router = LoopbackRouter::new();
        let topology = Arc::new(TopologyTracker::new(ids.iter().copied()));
        let affinity = Arc::new(RendezvousAffinity::new(
            topology.clone(),
            config.atomic.partitions,
            config.atomic.backups,
        ));

        let mut nodes = BTreeMap::new();
        for id in ids {
            let mut node_config = config.clone();
            node_config.node.node_id = id.0;

            let store = Arc::new(MemoryStore::new());
            let mut ctx = CacheContext::new(
                &node_config,
                Arc::new(router.transport(id)),
                affinity.clone(),
                topology.clone(),
                store.clone(),
            )?;

            let near_cache = config.atomic.near_cache.then(|| Arc::new(MemoryNearCache::new()));
            if let Some(near) = &near_cache {
                ctx = ctx.with_near_cache(near.clone());
            }

            let cache = AtomicCache::new(ctx);
            let inbox = tokio::spawn(transport::run_inbox(
                cache.clone(),
                router.register(id),
                chunk_size,
            ));

            nodes.insert(
                id,
                SimNode {
                    id,
                    cache,
                    store,
                    near_cache,
                    inbox,
                },
            );
        }

        tracing::info!(nodes = nodes.len(), "simulated cluster started");

        Ok(Self {
            router,
            topology,
            affinity,
            nodes: RwLock::new(nodes),
        })
    }

    pub fn router(&self) -> &Arc<LoopbackRouter> {
        &self.router
    }

    pub fn topology(&self) -> &Arc<TopologyTracker> {
        &self.topology
    }

    /// Cache handle of `node`, if it is alive.
    pub fn cache(&self, node: NodeId) -> Option<AtomicCache> {
        self.nodes.read().get(&node).map(|n| n.cache.clone())
    }

    /// Storage engine of `node`, if it is alive.
    pub fn store(&self, node: NodeId) -> Option<Arc<MemoryStore>> {
        self.nodes.read().get(&node).map(|n| n.store.clone())
    }

    /// Near cache of `node`, if it is alive and keeps one.
    pub fn near_cache(&self, node: NodeId) -> Option<Arc<MemoryNearCache>> {
        self.nodes
            .read()
            .get(&node)
            .and_then(|n| n.near_cache.clone())
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.read().keys().copied().collect()
    }

    /// Owners of `key` at the current topology version: primary first.
    pub fn owners(&self, key: &[u8]) -> Vec<NodeId> {
        let partition = self.affinity.partition(key);
        self.affinity.nodes(partition, self.topology.version())
    }

    /// Make an entry processor available on every node.
    pub fn register_processor(&self, name: &str, processor: Processor) {
        for node in self.nodes.read().values() {
            node.store.register_processor(name, processor.clone());
        }
    }

    /// Drop every message from `from` to `to`.
    pub fn block(&self, from: NodeId, to: NodeId) {
        self.router.block(from, to);
    }

    pub fn unblock(&self, from: NodeId, to: NodeId) {
        self.router.unblock(from, to);
    }

    /// Take `node` out of the cluster.
    ///
    /// Returns `false` if it was not running.
    pub fn kill(&self, node: NodeId) -> bool {
        let Some(removed) = self.nodes.write().remove(&node) else {
            return false;
        };
        self.router.unregister(node);
        removed.inbox.abort();

        let version = self.topology.node_left(node);
        tracing::info!(node = %node, topology_version = %version, "node killed");

        let survivors: Vec<AtomicCache> =
            self.nodes.read().values().map(|n| n.cache.clone()).collect();
        for cache in survivors {
            cache.on_node_left(node);
        }
        true
    }

    /// Stop every node.
    pub fn shutdown(&self) {
        self.topology.stop();
        let mut nodes = self.nodes.write();
        for (id, node) in std::mem::take(&mut *nodes) {
            self.router.unregister(id);
            node.inbox.abort();
        }
    }
}

impl Drop for SimCluster {
    fn drop(&mut self) {
        for node in self.nodes.get_mut().values() {
            node.inbox.abort();
        }
    }
}

impl std::fmt::Debug for SimCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimCluster")
            .field("nodes", &self.node_ids())
            .field("topology_version", &self.topology.version())
            .finish_non_exhaustive()
    }
}
