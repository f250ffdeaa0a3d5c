//! Primary-side fan-out of an update to backups and near readers.
//!
//! The primary applies an update locally, then a [`BackupUpdateFuture`] groups the
//! replicated entries per destination node, sends one [`BackupUpdateRequest`] to
//! each, and counts acknowledgments. A node that leaves counts as having
//! acknowledged. The future is done once every mapped node is accounted for.
//!
//! When the primary answers the near node depends on the synchronization mode:
//!
//! | Mode | Near relay | Primary answers |
//! |------|------------|-----------------|
//! | `full_sync` | `primary` | after every backup acknowledged |
//! | `full_sync` | `backups` | at once if it returns a value or the near node is local, otherwise backups notify the near node |
//! | `primary_sync` | any | at once |
//! | `full_async` | any | at once (local near nodes only) |

use crate::atomic::context::CacheContext;
use crate::atomic::result::CacheReturn;
use crate::core::types::{
    FutureId, NearRelay, NodeId, SyncMode, TopologyVersion, WriteVersion,
};
use crate::wire::messages::{
    BackupEntry, BackupFlags, BackupNearResponse, BackupUpdateRequest, NearEntry,
    NearMappingResponse, NearUpdateRequest, RequestFlags, UpdateResponse,
};
use crate::wire::CacheMessage;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Sends the primary's response to the near node.
pub type ReplyCallback = Box<dyn FnOnce(UpdateResponse) + Send>;

/// Continuation run at the terminal transition with the success flag.
pub type CompletionListener = Box<dyn FnOnce(bool) + Send>;

#[derive(Debug)]
struct PendingBackup {
    request: BackupUpdateRequest,
    responded: bool,
}

struct FanoutState {
    mappings: BTreeMap<NodeId, PendingBackup>,
    mapped: bool,
    /// The near node no longer needs to hear about backup failures.
    replied_to_near: bool,
    success: bool,
    /// Reply held back until every backup acknowledged.
    deferred: Option<(ReplyCallback, UpdateResponse)>,
    listeners: Vec<CompletionListener>,
}

/// Primary-side coordinator replicating one update.
pub struct BackupUpdateFuture {
    ctx: Arc<CacheContext>,
    future_id: FutureId,
    write_version: WriteVersion,
    near_node: NodeId,
    near_future_id: FutureId,
    partition: u32,
    topology_version: TopologyVersion,
    sync_mode: SyncMode,
    topology_locked: bool,
    flags: BackupFlags,
    invoke_args: Vec<Bytes>,
    subject_id: u64,
    task_name_hash: u32,
    response_count: AtomicUsize,
    done: AtomicBool,
    state: Mutex<FanoutState>,
}

impl BackupUpdateFuture {
    /// Create the fan-out for `request`, received from `near_node`.
    pub fn new(ctx: &Arc<CacheContext>, near_node: NodeId, request: &NearUpdateRequest) -> Arc<Self> {
        let mut flags = BackupFlags::empty();
        flags.set(
            BackupFlags::KEEP_BINARY,
            request.flags.contains(RequestFlags::KEEP_BINARY),
        );
        flags.set(
            BackupFlags::SKIP_STORE,
            request.flags.contains(RequestFlags::SKIP_STORE),
        );

        Arc::new(Self {
            ctx: ctx.clone(),
            future_id: ctx.registry.next_id(),
            write_version: request.write_version,
            near_node,
            near_future_id: request.future_id,
            partition: request.partition,
            topology_version: request.topology_version,
            sync_mode: request.sync_mode,
            topology_locked: request.topology_locked(),
            flags,
            invoke_args: request.payload.invoke_args().to_vec(),
            subject_id: request.subject_id,
            task_name_hash: request.task_name_hash,
            response_count: AtomicUsize::new(0),
            done: AtomicBool::new(false),
            state: Mutex::new(FanoutState {
                mappings: BTreeMap::new(),
                mapped: false,
                replied_to_near: false,
                success: true,
                deferred: None,
                listeners: Vec::new(),
            }),
        })
    }

    pub fn future_id(&self) -> FutureId {
        self.future_id
    }

    pub fn write_version(&self) -> WriteVersion {
        self.write_version
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Nodes the update is sent to.
    pub fn mapped_nodes(&self) -> Vec<NodeId> {
        self.state.lock().mappings.keys().copied().collect()
    }

    /// Acknowledgments registered so far.
    pub fn response_count(&self) -> usize {
        self.response_count.load(Ordering::Acquire)
    }

    fn new_request(&self) -> BackupUpdateRequest {
        BackupUpdateRequest {
            cache_id: self.ctx.cache_id,
            partition: self.partition,
            future_id: self.future_id,
            near_future_id: self.near_future_id,
            near_node: self.near_node,
            write_version: self.write_version,
            topology_version: self.topology_version,
            sync_mode: self.sync_mode,
            flags: self.flags,
            invoke_args: self.invoke_args.clone(),
            subject_id: self.subject_id,
            task_name_hash: self.task_name_hash,
            ..BackupUpdateRequest::default()
        }
    }

    /// Replicate `entry` to every other owner of its partition.
    pub fn add_write_entry(&self, entry: BackupEntry) {
        let partition = self.ctx.affinity.partition(&entry.key);
        let owners = self.ctx.affinity.nodes(partition, self.topology_version);

        let mut state = self.state.lock();
        for node in owners {
            if node == self.ctx.local_node {
                continue;
            }
            state
                .mappings
                .entry(node)
                .or_insert_with(|| PendingBackup {
                    request: self.new_request(),
                    responded: false,
                })
                .request
                .entries
                .push(entry.clone());
        }
    }

    /// Push `entry` to the nodes holding a near-side read view of it.
    ///
    /// Readers that already left are skipped.
    pub fn add_near_write_entries(&self, readers: &[NodeId], entry: NearEntry) {
        let mut state = self.state.lock();
        for &node in readers {
            if node == self.ctx.local_node || !self.ctx.topology.is_alive(node) {
                continue;
            }
            state
                .mappings
                .entry(node)
                .or_insert_with(|| PendingBackup {
                    request: self.new_request(),
                    responded: false,
                })
                .request
                .near_entries
                .push(entry.clone());
        }
    }

    /// Send the per-node requests and arrange the reply to the near node.
    ///
    /// `completion` receives `response` when the near node is to be answered, never
    /// before the backup requests went out. When backups relay to the near node the
    /// primary does not answer at all.
    pub fn map(self: &Arc<Self>, mut response: UpdateResponse, ret: &CacheReturn, completion: ReplyCallback) {
        let full_sync = self.sync_mode == SyncMode::FullSync;
        let backups_relay = full_sync && self.ctx.config.near_relay == NearRelay::Backups;
        let reply_now = match self.sync_mode {
            SyncMode::FullSync => {
                backups_relay && (ret.has_value() || self.near_node == self.ctx.local_node)
            }
            SyncMode::PrimarySync | SyncMode::FullAsync => true,
        };

        let mut reply = None;
        let mut send_mapping = None;
        let requests: Vec<(NodeId, BackupUpdateRequest)> = {
            let mut state = self.state.lock();
            state.mapped = true;
            state.success = ret.success;
            state.replied_to_near = !full_sync;

            if state.mappings.is_empty() {
                reply = Some((completion, response));
                Vec::new()
            } else {
                if backups_relay {
                    let nodes: Vec<NodeId> = state.mappings.keys().copied().collect();
                    for pending in state.mappings.values_mut() {
                        pending.request.flags.insert(BackupFlags::NEAR_REPLY);
                        pending.request.mapping = Some(nodes.clone());
                        if !reply_now {
                            pending.request.set_result(ret.success);
                        }
                    }
                    if reply_now {
                        response.mapping = Some(nodes);
                    } else if self.ctx.config.send_mapping_to_near {
                        send_mapping = Some(nodes);
                    }
                }

                // Relayed updates are answered by the backups alone.
                if reply_now {
                    reply = Some((completion, response));
                } else if !backups_relay {
                    state.deferred = Some((completion, response));
                }

                state
                    .mappings
                    .iter()
                    .filter(|(_, pending)| !pending.responded)
                    .map(|(node, pending)| (*node, pending.request.clone()))
                    .collect()
            }
        };

        if requests.is_empty() {
            if let Some((callback, response)) = reply {
                callback(response);
            }
            self.on_done();
            return;
        }

        self.ctx.registry.add_backup(self.future_id, self.clone());

        for (node, request) in requests {
            tracing::debug!(
                future_id = self.future_id,
                node = %node,
                write_version = %self.write_version,
                entries = request.entries.len(),
                near_entries = request.near_entries.len(),
                "sending backup update request"
            );
            if self
                .ctx
                .send(node, CacheMessage::BackupUpdateRequest(request))
                .is_err()
            {
                self.register_response(node, true);
            }
        }

        if let Some(mapping) = send_mapping {
            let notice = NearMappingResponse {
                cache_id: self.ctx.cache_id,
                partition: self.partition,
                future_id: self.near_future_id,
                mapping,
            };
            if let Err(e) = self
                .ctx
                .send(self.near_node, CacheMessage::NearMappingResponse(notice))
            {
                tracing::warn!(
                    node = %self.near_node,
                    future_id = self.near_future_id,
                    error = %e,
                    "failed to send mapping to near node"
                );
            }
        }

        if let Some((callback, response)) = reply {
            callback(response);
        }
    }

    /// Acknowledgment from a backup.
    pub fn on_result(self: &Arc<Self>, node: NodeId, response: &UpdateResponse) {
        if response.has_error() {
            tracing::debug!(
                future_id = self.future_id,
                node = %node,
                failed_keys = response.failed_keys.len(),
                "backup reported failed keys"
            );
        }
        self.register_response(node, false);
    }

    /// A cluster node left. Returns `true` if it was awaited.
    pub fn on_node_left(self: &Arc<Self>, node: NodeId) -> bool {
        self.register_response(node, true)
    }

    /// Record the response of `node`, or its departure when `node_error` is set.
    ///
    /// Returns `false` if `node` is not mapped or was already recorded.
    pub fn register_response(self: &Arc<Self>, node: NodeId, node_error: bool) -> bool {
        let (notice, total, mapped) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(pending) = state.mappings.get_mut(&node) else {
                return false;
            };
            if pending.responded {
                return false;
            }
            pending.responded = true;

            let notice = (node_error && !state.replied_to_near).then(|| BackupNearResponse {
                cache_id: self.ctx.cache_id,
                partition: self.partition,
                future_id: self.near_future_id,
                primary_id: self.ctx.local_node,
                mapping: state.mappings.keys().copied().collect(),
                failed_node: Some(node),
                ..BackupNearResponse::default()
            });
            (notice, state.mappings.len(), state.mapped)
        };

        let count = self.response_count.fetch_add(1, Ordering::AcqRel) + 1;

        tracing::debug!(
            future_id = self.future_id,
            node = %node,
            node_error,
            count,
            total,
            "backup response registered"
        );

        if let Some(notice) = notice {
            if let Err(e) = self
                .ctx
                .send(self.near_node, CacheMessage::BackupNearResponse(notice))
            {
                tracing::warn!(
                    node = %self.near_node,
                    future_id = self.near_future_id,
                    error = %e,
                    "failed to notify near node of failed backup"
                );
            }
        }

        if mapped && count >= total {
            self.on_done();
        }
        true
    }

    /// Register a continuation run with the success flag on completion.
    ///
    /// Returns `false`, without registering, if the future is already done.
    pub fn add_listener(&self, listener: CompletionListener) -> bool {
        let mut state = self.state.lock();
        if self.is_done() {
            return false;
        }
        state.listeners.push(listener);
        true
    }

    /// Whether an exchange to `version` has to wait for this update.
    pub fn complete_future(&self, version: TopologyVersion) -> bool {
        !self.topology_locked && self.topology_version < version && !self.is_done()
    }

    /// Terminal transition. Returns `true` only the first time.
    fn on_done(&self) -> bool {
        if self.done.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.ctx.registry.remove(self.future_id);

        let (deferred, listeners, success) = {
            let mut state = self.state.lock();
            (
                state.deferred.take(),
                std::mem::take(&mut state.listeners),
                state.success,
            )
        };

        tracing::debug!(
            future_id = self.future_id,
            write_version = %self.write_version,
            success,
            "backup update future done"
        );

        if let Some((callback, response)) = deferred {
            callback(response);
        }
        for listener in listeners {
            listener(success);
        }
        true
    }
}

impl std::fmt::Debug for BackupUpdateFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupUpdateFuture")
            .field("future_id", &self.future_id)
            .field("near_node", &self.near_node)
            .field("write_version", &self.write_version)
            .field("done", &self.is_done())
            .finish_non_exhaustive()
    }
}
