//! Atomic write path.
//!
//! Single-key updates of a partitioned, replicated cache, coordinated without locks
//! or transactions:
//!
//! - [`near`] - Near-side coordinator owning the caller's future
//! - [`fanout`] - Primary-side replication to backups and near readers
//! - [`primary`] / [`backup`] - Request processing on primary and backup nodes
//! - [`registry`] - In-flight coordinators keyed by future id
//! - [`context`] - Per-cache context and the transport, storage and near-cache seams
//! - [`result`] - Operation results
//! - [`latch`] - Exactly-once completion and the caller's handle
//!
//! # Message flow
//!
//! ```text
//!  near                 primary                 backup
//!   │ NearUpdateRequest    │                       │
//!   ├─────────────────────►│ BackupUpdateRequest   │
//!   │                      ├──────────────────────►│
//!   │                      │ UpdateResponse (ack)  │
//!   │ UpdateResponse       │◄──────────────────────┤
//!   │◄─────────────────────┤                       │
//! ```
//!
//! With `near_relay = "backups"` the primary may answer before the backups, and
//! backups notify the near node directly with a `BackupNearResponse`.

pub mod backup;
pub mod context;
pub mod fanout;
pub mod latch;
pub mod near;
pub mod primary;
pub mod registry;
pub mod result;

pub use context::{AppliedWrite, CacheContext, NearCache, StorageEngine, StoreWrite, Transport};
pub use fanout::BackupUpdateFuture;
pub use latch::UpdateHandle;
pub use near::{NearUpdateFuture, UpdateOp};
pub use registry::{FutureRegistry, RegisteredFuture};
pub use result::{CacheReturn, InvokeOutcome, ReturnValue, UpdateOutcome};

use crate::core::error::CacheResult;
use crate::core::types::{Key, NodeId, ProcessorRef, TopologyVersion, Value};
use crate::wire::CacheMessage;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Atomic cache on one node: the caller-facing operations plus message dispatch.
#[derive(Debug, Clone)]
pub struct AtomicCache {
    ctx: Arc<CacheContext>,
}

impl AtomicCache {
    pub fn new(ctx: CacheContext) -> Self {
        Self { ctx: Arc::new(ctx) }
    }

    pub fn context(&self) -> &Arc<CacheContext> {
        &self.ctx
    }

    pub fn local_node(&self) -> NodeId {
        self.ctx.local_node
    }

    /// Start an update and return its handle.
    pub fn update(&self, op: UpdateOp) -> CacheResult<UpdateHandle> {
        NearUpdateFuture::submit(&self.ctx, op)
    }

    /// Store `value` under `key`. Returns the success flag.
    pub async fn put(&self, key: impl Into<Key>, value: impl Into<Value>) -> CacheResult<bool> {
        let outcome = self.update(UpdateOp::put(key, value))?.await?;
        Ok(outcome.is_success())
    }

    /// Store `value` under `key`, returning the previous value.
    pub async fn get_and_put(
        &self,
        key: impl Into<Key>,
        value: impl Into<Value>,
    ) -> CacheResult<Option<Value>> {
        let outcome = self
            .update(UpdateOp::put(key, value).return_previous())?
            .await?;
        Ok(match outcome {
            UpdateOutcome::Previous(previous) => previous,
            _ => None,
        })
    }

    /// Remove `key`. Returns the success flag.
    pub async fn remove(&self, key: impl Into<Key>) -> CacheResult<bool> {
        let outcome = self.update(UpdateOp::remove(key))?.await?;
        Ok(outcome.is_success())
    }

    /// Run an entry processor against `key`.
    pub async fn invoke(
        &self,
        key: impl Into<Key>,
        processor: ProcessorRef,
        args: Vec<Bytes>,
    ) -> CacheResult<BTreeMap<Key, InvokeOutcome>> {
        let outcome = self
            .update(UpdateOp::invoke(key, processor, args))?
            .await?;
        Ok(match outcome {
            UpdateOutcome::Transform(results) => results,
            _ => BTreeMap::new(),
        })
    }

    /// Dispatch a message received from `from`.
    pub fn on_message(&self, from: NodeId, message: CacheMessage) {
        if message.cache_id() != self.ctx.cache_id {
            tracing::debug!(
                node = %from,
                cache_id = message.cache_id(),
                "dropping message for unknown cache"
            );
            return;
        }

        tracing::debug!(
            node = %from,
            kind = %message.kind(),
            future_id = message.future_id(),
            "received cache message"
        );

        match message {
            CacheMessage::NearUpdateRequest(request) => {
                primary::process_near_update(&self.ctx, from, request)
            }
            CacheMessage::BackupUpdateRequest(request) => {
                backup::process_backup_update(&self.ctx, from, request)
            }
            CacheMessage::CheckUpdateRequest(request) => {
                primary::process_check_update(&self.ctx, from, request)
            }
            CacheMessage::UpdateResponse(response) => {
                match self.ctx.registry.get(response.future_id) {
                    Some(RegisteredFuture::Backup(future)) => future.on_result(from, &response),
                    Some(RegisteredFuture::Near(future)) => {
                        future.on_primary_response(from, response, false)
                    }
                    None => self.drop_stale(from, response.future_id),
                }
            }
            CacheMessage::NearMappingResponse(response) => {
                match self.ctx.registry.near(response.future_id) {
                    Some(future) => future.on_mapping_received(from, response),
                    None => self.drop_stale(from, response.future_id),
                }
            }
            CacheMessage::BackupNearResponse(response) => {
                match self.ctx.registry.near(response.future_id) {
                    Some(future) => future.on_backup_response(from, response),
                    None => self.drop_stale(from, response.future_id),
                }
            }
        }
    }

    /// A cluster node left.
    pub fn on_node_left(&self, node: NodeId) {
        self.ctx.registry.on_node_left(node);
    }

    /// In-flight replications an exchange to `version` has to wait for.
    pub fn pending_fanouts(&self, version: TopologyVersion) -> Vec<Arc<BackupUpdateFuture>> {
        self.ctx.registry.fanouts_blocking(version)
    }

    fn drop_stale(&self, from: NodeId, future_id: u64) {
        tracing::debug!(node = %from, future_id, "no future for message, dropping");
    }
}
