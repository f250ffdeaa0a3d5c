//! Per-cache context shared by every coordinator of a node.
//!
//! Coordinators never reach for globals: the transport, affinity, topology view,
//! future registry and storage engine all come from the [`CacheContext`] they were
//! created with.

use crate::atomic::registry::FutureRegistry;
use crate::atomic::result::InvokeOutcome;
use crate::control::affinity::AffinityResolver;
use crate::control::topology::TopologyTracker;
use crate::core::config::{AtomicConfig, Config};
use crate::core::error::{CacheError, CacheResult, FailureCause, SendError};
use crate::core::types::{
    EntryFilter, ExpiryPolicy, Key, NodeId, Operation, ProcessorRef, TopologyVersion, Value,
    WriteVersion, WriteVersionGenerator,
};
use crate::wire::messages::BackupEntry;
use crate::wire::CacheMessage;
use bytes::Bytes;
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::Handle;

/// Reliable, ordered, asynchronous node-to-node message transport.
pub trait Transport: Send + Sync {
    /// Hand `message` to the transport for delivery to `node`.
    fn send(&self, node: NodeId, message: CacheMessage) -> Result<(), SendError>;
}

/// Near-side read view of cache values.
pub trait NearCache: Send + Sync {
    /// Apply an update; `None` removes the key.
    fn apply_update(&self, key: &Key, value: Option<Value>, version: WriteVersion, ttl: i64);
}

/// One update applied by the primary.
#[derive(Debug, Clone)]
pub struct StoreWrite {
    pub key: Key,
    pub operation: Operation,
    pub value: Option<Value>,
    pub processor: Option<ProcessorRef>,
    pub invoke_args: Vec<Bytes>,
    pub filters: Vec<EntryFilter>,
    pub expiry: Option<ExpiryPolicy>,
    pub version: WriteVersion,
}

/// Effect of an update applied by the primary.
#[derive(Debug, Clone, Default)]
pub struct AppliedWrite {
    /// Value before the update.
    pub previous: Option<Value>,
    /// Value after the update.
    pub new_value: Option<Value>,
    /// Entry processor result, for transforms.
    pub invoke: Option<InvokeOutcome>,
    /// A filter rejected the update; nothing changed.
    pub filtered: bool,
    /// Partition update counter after the update.
    pub update_counter: u64,
    /// TTL to replicate.
    pub ttl: i64,
}

/// Storage engine applying writes on primaries and backups.
pub trait StorageEngine: Send + Sync {
    /// Apply an update on the primary.
    fn apply(&self, partition: u32, write: StoreWrite) -> Result<AppliedWrite, FailureCause>;

    /// Apply a replicated update on a backup. Updates older than the stored
    /// version are ignored.
    fn apply_backup(&self, partition: u32, entry: &BackupEntry, version: WriteVersion);

    /// Nodes holding a near-side read view of `key`.
    fn readers(&self, _key: &Key) -> Vec<NodeId> {
        Vec::new()
    }
}

/// Lifecycle-scoped context of one cache on one node.
pub struct CacheContext {
    pub cache_id: u32,
    pub cache_name: String,
    pub local_node: NodeId,
    pub config: AtomicConfig,
    pub transport: Arc<dyn Transport>,
    pub affinity: Arc<dyn AffinityResolver>,
    pub topology: Arc<TopologyTracker>,
    pub registry: Arc<FutureRegistry>,
    pub store: Arc<dyn StorageEngine>,
    pub near_cache: Option<Arc<dyn NearCache>>,
    versions: WriteVersionGenerator,
    runtime: Handle,
}

impl CacheContext {
    /// Create a context. Must be called from within a tokio runtime.
    pub fn new(
        config: &Config,
        transport: Arc<dyn Transport>,
        affinity: Arc<dyn AffinityResolver>,
        topology: Arc<TopologyTracker>,
        store: Arc<dyn StorageEngine>,
    ) -> CacheResult<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| CacheError::internal(format!("no tokio runtime: {}", e)))?;

        Ok(Self {
            cache_id: config.node.cache_id(),
            cache_name: config.node.cache_name.clone(),
            local_node: NodeId(config.node.node_id),
            config: config.atomic.clone(),
            transport,
            affinity,
            topology,
            registry: Arc::new(FutureRegistry::new()),
            store,
            near_cache: None,
            versions: WriteVersionGenerator::new(config.node.node_id as u32),
            runtime,
        })
    }

    /// Attach a near-side read view.
    pub fn with_near_cache(mut self, near_cache: Arc<dyn NearCache>) -> Self {
        self.near_cache = Some(near_cache);
        self
    }

    /// Assign the write version of a new logical update.
    pub fn next_write_version(&self, topology: TopologyVersion) -> WriteVersion {
        self.versions.next(topology)
    }

    /// Send a message through the transport.
    pub fn send(&self, node: NodeId, message: CacheMessage) -> Result<(), SendError> {
        let kind = message.kind();
        let future_id = message.future_id();
        self.transport.send(node, message).map_err(|e| {
            tracing::debug!(
                node = %node,
                kind = %kind,
                future_id,
                error = %e,
                "failed to send message"
            );
            e
        })
    }

    /// Run `future` on the cache's runtime.
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.runtime.spawn(future);
    }

    /// Error for operations on a stopping cache.
    pub fn stopped_error(&self) -> CacheError {
        CacheError::CacheStopped {
            cache: self.cache_name.clone(),
        }
    }
}

impl std::fmt::Debug for CacheContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheContext")
            .field("cache_id", &self.cache_id)
            .field("cache_name", &self.cache_name)
            .field("local_node", &self.local_node)
            .finish_non_exhaustive()
    }
}
