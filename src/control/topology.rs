//! Local topology view.
//!
//! The membership layer drives a [`TopologyTracker`] through exchanges: a membership
//! change starts an exchange at the next major version (not ready), and the exchange
//! completes once partition assignment for that version is known. Write-path
//! coordinators only map requests against a ready version, and park on
//! [`TopologyTracker::wait_ready`] otherwise.

use crate::core::error::{CacheError, CacheResult};
use crate::core::types::{NodeId, TopologyVersion};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::watch;

/// Number of past node sets kept for resolving owners at older versions.
const HISTORY_LIMIT: usize = 64;

/// Snapshot of the local topology state.
#[derive(Debug, Clone)]
pub struct TopologySnapshot {
    /// Current topology version.
    pub version: TopologyVersion,
    /// Whether the exchange for `version` has finished.
    pub ready: bool,
    /// Whether the cache is stopping.
    pub stopping: bool,
    /// Server nodes alive at `version`.
    pub nodes: Arc<BTreeSet<NodeId>>,
}

impl TopologySnapshot {
    pub fn contains(&self, node: NodeId) -> bool {
        self.nodes.contains(&node)
    }
}

/// Tracks topology versions and exchange readiness for one node.
pub struct TopologyTracker {
    tx: watch::Sender<TopologySnapshot>,
    history: RwLock<BTreeMap<TopologyVersion, Arc<BTreeSet<NodeId>>>>,
}

impl TopologyTracker {
    /// Create a tracker whose first version (1.0) is already ready.
    pub fn new<I>(nodes: I) -> Self
    where
        I: IntoIterator<Item = NodeId>,
    {
        let nodes: Arc<BTreeSet<NodeId>> = Arc::new(nodes.into_iter().collect());
        let version = TopologyVersion::new(1, 0);
        let snapshot = TopologySnapshot {
            version,
            ready: true,
            stopping: false,
            nodes: nodes.clone(),
        };
        let (tx, _rx) = watch::channel(snapshot);
        let mut history = BTreeMap::new();
        history.insert(version, nodes);
        Self {
            tx,
            history: RwLock::new(history),
        }
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> TopologySnapshot {
        self.tx.borrow().clone()
    }

    /// Current topology version.
    pub fn version(&self) -> TopologyVersion {
        self.tx.borrow().version
    }

    /// Subscribe to topology changes.
    pub fn subscribe(&self) -> watch::Receiver<TopologySnapshot> {
        self.tx.subscribe()
    }

    /// Whether `node` is alive in the current topology.
    pub fn is_alive(&self, node: NodeId) -> bool {
        self.tx.borrow().contains(node)
    }

    /// Node set at `version`, falling back to the newest version not after it.
    pub fn nodes_at(&self, version: TopologyVersion) -> Option<Arc<BTreeSet<NodeId>>> {
        let history = self.history.read();
        history
            .range(..=version)
            .next_back()
            .map(|(_, nodes)| nodes.clone())
    }

    /// Start an exchange for a new membership; the new version is not ready yet.
    pub fn begin_exchange<I>(&self, nodes: I) -> TopologyVersion
    where
        I: IntoIterator<Item = NodeId>,
    {
        let nodes: Arc<BTreeSet<NodeId>> = Arc::new(nodes.into_iter().collect());
        let mut next = TopologyVersion::ZERO;
        self.tx.send_modify(|snapshot| {
            next = snapshot.version.next_major();
            snapshot.version = next;
            snapshot.ready = false;
            snapshot.nodes = nodes.clone();
        });
        self.record(next, nodes);

        tracing::info!(topology_version = %next, "topology exchange started");
        next
    }

    /// Finish the exchange for the current version.
    pub fn complete_exchange(&self) -> TopologyVersion {
        let mut version = TopologyVersion::ZERO;
        self.tx.send_modify(|snapshot| {
            snapshot.ready = true;
            version = snapshot.version;
        });

        tracing::info!(topology_version = %version, "topology exchange completed");
        version
    }

    /// Bump the minor version for an assignment-only change; completes immediately.
    pub fn bump_minor(&self) -> TopologyVersion {
        let mut next = TopologyVersion::ZERO;
        let mut nodes = Arc::new(BTreeSet::new());
        self.tx.send_modify(|snapshot| {
            next = snapshot.version.next_minor();
            snapshot.version = next;
            snapshot.ready = true;
            nodes = snapshot.nodes.clone();
        });
        self.record(next, nodes);
        next
    }

    /// Membership change: `node` left. Runs a full exchange.
    pub fn node_left(&self, node: NodeId) -> TopologyVersion {
        let nodes: Vec<NodeId> = self
            .snapshot()
            .nodes
            .iter()
            .copied()
            .filter(|n| *n != node)
            .collect();
        self.begin_exchange(nodes);
        self.complete_exchange()
    }

    /// Membership change: `node` joined. Runs a full exchange.
    pub fn node_joined(&self, node: NodeId) -> TopologyVersion {
        let mut nodes: Vec<NodeId> = self.snapshot().nodes.iter().copied().collect();
        nodes.push(node);
        self.begin_exchange(nodes);
        self.complete_exchange()
    }

    /// Mark the cache as stopping; waiters are released with `CacheStopped`.
    pub fn stop(&self) {
        self.tx.send_modify(|snapshot| snapshot.stopping = true);
    }

    /// Wait until a version at or after `min_version` is ready.
    pub async fn wait_ready(&self, min_version: TopologyVersion) -> CacheResult<TopologyVersion> {
        let mut rx = self.tx.subscribe();
        let snapshot = rx
            .wait_for(|s| s.stopping || (s.ready && s.version >= min_version))
            .await
            .map_err(|_| CacheError::internal("topology tracker dropped"))?;
        if snapshot.stopping {
            return Err(CacheError::CacheStopped {
                cache: String::new(),
            });
        }
        Ok(snapshot.version)
    }

    fn record(&self, version: TopologyVersion, nodes: Arc<BTreeSet<NodeId>>) {
        let mut history = self.history.write();
        history.insert(version, nodes);
        while history.len() > HISTORY_LIMIT {
            let oldest = history.keys().next().copied();
            match oldest {
                Some(v) => {
                    history.remove(&v);
                }
                None => break,
            }
        }
    }
}
