//! In-flight coordinator table.
//!
//! Every attempt of a near-side update and every primary-side fan-out registers
//! under a fresh id from the same monotonic counter. Responses are routed by id;
//! an id that is no longer registered belongs to a finished or superseded attempt
//! and its messages are dropped.

use crate::atomic::fanout::BackupUpdateFuture;
use crate::atomic::near::NearUpdateFuture;
use crate::core::types::{FutureId, NodeId, TopologyVersion};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A registered coordinator.
#[derive(Clone)]
pub enum RegisteredFuture {
    Near(Arc<NearUpdateFuture>),
    Backup(Arc<BackupUpdateFuture>),
}

/// Registry of in-flight coordinators on one node.
pub struct FutureRegistry {
    next_id: AtomicU64,
    futures: RwLock<HashMap<FutureId, RegisteredFuture>>,
}

impl FutureRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            futures: RwLock::new(HashMap::new()),
        }
    }

    /// Allocate a new future id.
    pub fn next_id(&self) -> FutureId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn add_near(&self, id: FutureId, future: Arc<NearUpdateFuture>) {
        self.futures.write().insert(id, RegisteredFuture::Near(future));
    }

    pub fn add_backup(&self, id: FutureId, future: Arc<BackupUpdateFuture>) {
        self.futures
            .write()
            .insert(id, RegisteredFuture::Backup(future));
    }

    pub fn get(&self, id: FutureId) -> Option<RegisteredFuture> {
        self.futures.read().get(&id).cloned()
    }

    pub fn near(&self, id: FutureId) -> Option<Arc<NearUpdateFuture>> {
        match self.get(id) {
            Some(RegisteredFuture::Near(future)) => Some(future),
            _ => None,
        }
    }

    pub fn backup(&self, id: FutureId) -> Option<Arc<BackupUpdateFuture>> {
        match self.get(id) {
            Some(RegisteredFuture::Backup(future)) => Some(future),
            _ => None,
        }
    }

    /// Deregister `id`. Returns `false` if it was not registered.
    pub fn remove(&self, id: FutureId) -> bool {
        self.futures.write().remove(&id).is_some()
    }

    pub fn contains(&self, id: FutureId) -> bool {
        self.futures.read().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.futures.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.futures.read().is_empty()
    }

    /// Fan-outs an exchange to `version` has to wait for.
    pub fn fanouts_blocking(&self, version: TopologyVersion) -> Vec<Arc<BackupUpdateFuture>> {
        self.futures
            .read()
            .values()
            .filter_map(|future| match future {
                RegisteredFuture::Backup(future) if future.complete_future(version) => {
                    Some(future.clone())
                }
                _ => None,
            })
            .collect()
    }

    /// Notify every registered coordinator that `node` left.
    pub fn on_node_left(&self, node: NodeId) {
        // Callbacks may deregister futures, so run them outside the lock.
        let futures: Vec<RegisteredFuture> = self.futures.read().values().cloned().collect();

        tracing::debug!(node = %node, futures = futures.len(), "notifying futures of node departure");

        for future in futures {
            match future {
                RegisteredFuture::Near(future) => future.on_node_left(node),
                RegisteredFuture::Backup(future) => {
                    future.on_node_left(node);
                }
            }
        }
    }
}

impl Default for FutureRegistry {
    fn default() -> Self {
        Self::new()
    }
}
