//! Near-side update coordinator.
//!
//! A [`NearUpdateFuture`] runs on the node that accepted a single-key update. It
//! resolves the primary at the current topology version, sends the request and
//! completes the client handle from the primary's answer, or from direct backup
//! notifications when backups relay completion.
//!
//! # Attempts
//!
//! Each mapping of the update is one attempt with its own future id, registered
//! in the [`FutureRegistry`](crate::atomic::registry::FutureRegistry). A remap
//! deregisters the attempt, drops its request state and maps again on a newer
//! topology version; messages carrying the old id are ignored from then on.
//! Per-key failures from every attempt are accumulated and reported together.
//!
//! ```text
//! submit ──► map_on_topology ──► map ──► send to primary
//!                ▲                            │
//!                │   remap (new future id)    ▼
//!                └──────────────────── on_primary_response ──► complete
//! ```

use crate::atomic::context::CacheContext;
use crate::atomic::latch::{CompletionLatch, UpdateHandle};
use crate::atomic::result::{CacheReturn, UpdateOutcome};
use crate::core::error::{CacheError, CacheResult, FailureCause, PartialUpdateError, SendError};
use crate::core::types::{
    EntryFilter, ExpiryPolicy, FutureId, Key, NearRelay, NodeId, Operation, ProcessorRef,
    SyncMode, TopologyVersion, Value, WriteVersion, TTL_NOT_CHANGED,
};
use crate::wire::messages::{
    BackupNearResponse, CheckUpdateRequest, NearMappingResponse, NearUpdateRequest, RequestFlags,
    UpdateEntry, UpdatePayload, UpdateResponse,
};
use crate::wire::CacheMessage;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

/// A single-key atomic update as issued by a caller.
#[derive(Debug, Clone)]
pub struct UpdateOp {
    pub operation: Operation,
    pub key: Key,
    pub value: Option<Value>,
    pub processor: Option<ProcessorRef>,
    pub invoke_args: Vec<Bytes>,
    pub filters: Vec<EntryFilter>,
    pub expiry: Option<ExpiryPolicy>,
    /// Overrides the cache's default synchronization contract.
    pub sync_mode: Option<SyncMode>,
    /// Return the previous value instead of a success flag.
    pub return_value: bool,
    /// Return the primary's result as is.
    pub raw_return: bool,
    /// Fail instead of remapping when the topology changes.
    pub topology_locked: bool,
    pub skip_store: bool,
    pub keep_binary: bool,
    pub task_name_hash: u32,
}

impl UpdateOp {
    fn new(operation: Operation, key: Key) -> Self {
        Self {
            operation,
            key,
            value: None,
            processor: None,
            invoke_args: Vec::new(),
            filters: Vec::new(),
            expiry: None,
            sync_mode: None,
            return_value: false,
            raw_return: false,
            topology_locked: false,
            skip_store: false,
            keep_binary: false,
            task_name_hash: 0,
        }
    }

    /// Store `value` under `key`.
    pub fn put(key: impl Into<Key>, value: impl Into<Value>) -> Self {
        let mut op = Self::new(Operation::Update, key.into());
        op.value = Some(value.into());
        op
    }

    /// Remove `key`.
    pub fn remove(key: impl Into<Key>) -> Self {
        Self::new(Operation::Delete, key.into())
    }

    /// Transform `key` with a registered entry processor.
    pub fn invoke(key: impl Into<Key>, processor: ProcessorRef, args: Vec<Bytes>) -> Self {
        let mut op = Self::new(Operation::Transform, key.into());
        op.processor = Some(processor);
        op.invoke_args = args;
        op
    }

    pub fn with_filter(mut self, filter: EntryFilter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_expiry(mut self, expiry: ExpiryPolicy) -> Self {
        self.expiry = Some(expiry);
        self
    }

    pub fn with_sync_mode(mut self, sync_mode: SyncMode) -> Self {
        self.sync_mode = Some(sync_mode);
        self
    }

    pub fn return_previous(mut self) -> Self {
        self.return_value = true;
        self
    }

    pub fn raw(mut self) -> Self {
        self.raw_return = true;
        self
    }

    pub fn topology_locked(mut self) -> Self {
        self.topology_locked = true;
        self
    }

    /// Reject malformed updates before anything is sent.
    pub fn validate(&self) -> CacheResult<()> {
        if self.key.is_empty() {
            return Err(CacheError::invalid_argument("null key"));
        }
        match self.operation {
            Operation::Update if self.value.is_none() => {
                Err(CacheError::invalid_argument("null value"))
            }
            Operation::Transform if self.processor.is_none() => {
                Err(CacheError::invalid_argument("null entry processor"))
            }
            _ => Ok(()),
        }
    }

    fn flags(&self) -> RequestFlags {
        let mut flags = RequestFlags::empty();
        flags.set(RequestFlags::TOPOLOGY_LOCKED, self.topology_locked);
        flags.set(RequestFlags::RETURN_VALUE, self.return_value);
        flags.set(RequestFlags::SKIP_STORE, self.skip_store);
        flags.set(RequestFlags::KEEP_BINARY, self.keep_binary);
        flags
    }
}

/// Where the outstanding request stands after an event.
#[derive(Debug, PartialEq, Eq)]
enum Progress {
    Pending,
    Finished,
    /// Every awaited backup is gone and no result was seen: ask the primary.
    CheckUpdate,
}

/// Near-side record of the one request outstanding at the primary.
#[derive(Debug)]
struct PrimaryRequestState {
    request: Arc<NearUpdateRequest>,
    primary: NodeId,
    primary_responded: bool,
    has_result: bool,
    /// Backups still to hear from, once known.
    backups: Option<HashSet<NodeId>>,
    /// Backups heard from (or gone) before the mapping was known.
    received: HashSet<NodeId>,
    /// Backups answer the near node directly; otherwise the primary always replies.
    relayed: bool,
    check_sent: bool,
}

impl PrimaryRequestState {
    fn new(request: Arc<NearUpdateRequest>, primary: NodeId, relayed: bool) -> Self {
        Self {
            request,
            primary,
            primary_responded: false,
            has_result: false,
            backups: None,
            received: HashSet::new(),
            relayed,
            check_sent: false,
        }
    }

    /// The request, if `node` is its primary and has not answered yet.
    fn pending_primary(&self, node: NodeId) -> Option<Arc<NearUpdateRequest>> {
        (self.primary == node && !self.primary_responded).then(|| self.request.clone())
    }

    fn init_backups(&mut self, mapping: &[NodeId]) {
        if self.backups.is_none() {
            let pending = mapping
                .iter()
                .copied()
                .filter(|node| !self.received.contains(node))
                .collect();
            self.backups = Some(pending);
        }
    }

    /// Successful primary answer. Returns `true` if nothing else is awaited.
    fn on_primary_response(&mut self, response: &UpdateResponse) -> bool {
        self.has_result = true;
        match &response.mapping {
            Some(mapping) => {
                self.init_backups(mapping);
                self.progress(false) == Progress::Finished
            }
            None => true,
        }
    }

    fn on_mapping(&mut self, mapping: &[NodeId]) -> Progress {
        self.init_backups(mapping);
        self.progress(false)
    }

    fn on_backup_response(&mut self, node: NodeId, response: &BackupNearResponse) -> Progress {
        if response.result().is_some() {
            self.has_result = true;
        }
        self.init_backups(&response.mapping);

        let gone = response.failed_node.unwrap_or(node);
        self.received.insert(gone);
        if let Some(backups) = self.backups.as_mut() {
            backups.remove(&gone);
        }
        self.progress(response.failed_node.is_some())
    }

    fn on_node_left(&mut self, node: NodeId) -> Progress {
        match self.backups.as_mut() {
            Some(backups) => {
                if backups.remove(&node) {
                    self.progress(true)
                } else {
                    Progress::Pending
                }
            }
            None => {
                self.received.insert(node);
                Progress::Pending
            }
        }
    }

    fn progress(&mut self, after_failure: bool) -> Progress {
        match &self.backups {
            Some(backups) if backups.is_empty() => {
                if self.has_result {
                    Progress::Finished
                } else if after_failure
                    && self.relayed
                    && !self.check_sent
                    && self.request.sync_mode == SyncMode::FullSync
                {
                    self.check_sent = true;
                    Progress::CheckUpdate
                } else {
                    Progress::Pending
                }
            }
            _ => Progress::Pending,
        }
    }
}

/// Mutable state of a near future, guarded by one lock.
#[derive(Debug)]
struct NearState {
    /// Id of the current attempt; `None` between attempts and after completion.
    future_id: Option<FutureId>,
    topology_version: TopologyVersion,
    request_state: Option<PrimaryRequestState>,
    op_result: Option<CacheReturn>,
    /// Failures of the current attempt.
    error: Option<PartialUpdateError>,
    /// Failures of earlier attempts.
    history: PartialUpdateError,
    remaps_left: u32,
    remaps_done: u32,
    /// Newest topology version a primary refused; never mapped on again.
    map_error_topology: Option<TopologyVersion>,
}

/// Work decided under the lock and carried out after releasing it.
enum Action {
    Nothing,
    Complete(CacheResult<UpdateOutcome>),
    /// Backups completed the update without an answer from the primary.
    CompleteFromBackups(CacheResult<UpdateOutcome>),
    CheckUpdate(NodeId, Arc<NearUpdateRequest>),
}

/// Near-side coordinator of one single-key update.
pub struct NearUpdateFuture {
    ctx: Arc<CacheContext>,
    op: UpdateOp,
    sync_mode: SyncMode,
    write_version: WriteVersion,
    latch: CompletionLatch<CacheResult<UpdateOutcome>>,
    state: Mutex<NearState>,
}

impl NearUpdateFuture {
    /// Validate and start an update.
    ///
    /// Invalid updates fail here, before anything is sent.
    pub fn submit(ctx: &Arc<CacheContext>, op: UpdateOp) -> CacheResult<UpdateHandle> {
        let (_, handle) = Self::start(ctx, op)?;
        Ok(handle)
    }

    /// Like [`submit`](Self::submit), also returning the coordinator.
    pub fn start(
        ctx: &Arc<CacheContext>,
        op: UpdateOp,
    ) -> CacheResult<(Arc<Self>, UpdateHandle)> {
        op.validate()?;

        let (latch, rx) = CompletionLatch::new();
        let sync_mode = op.sync_mode.unwrap_or(ctx.config.write_sync_mode);
        let write_version = ctx.next_write_version(ctx.topology.version());

        let future = Arc::new(Self {
            ctx: ctx.clone(),
            op,
            sync_mode,
            write_version,
            latch,
            state: Mutex::new(NearState {
                future_id: None,
                topology_version: TopologyVersion::ZERO,
                request_state: None,
                op_result: None,
                error: None,
                history: PartialUpdateError::new(),
                remaps_left: ctx.config.remap_count,
                remaps_done: 0,
                map_error_topology: None,
            }),
        });

        tracing::debug!(
            write_version = %future.write_version,
            sync_mode = %sync_mode,
            "near update submitted"
        );

        future.map_on_topology();
        Ok((future, UpdateHandle::new(rx)))
    }

    /// Id of the current attempt.
    pub fn future_id(&self) -> Option<FutureId> {
        self.state.lock().future_id
    }

    /// Topology version of the current attempt.
    pub fn topology_version(&self) -> TopologyVersion {
        self.state.lock().topology_version
    }

    pub fn write_version(&self) -> WriteVersion {
        self.write_version
    }

    /// Remaps performed so far.
    pub fn remaps(&self) -> u32 {
        self.state.lock().remaps_done
    }

    pub fn is_done(&self) -> bool {
        self.latch.is_done()
    }

    /// Map the update on the current topology, waiting for a pending exchange.
    fn map_on_topology(self: &Arc<Self>) {
        if self.latch.is_done() {
            return;
        }

        let snapshot = self.ctx.topology.snapshot();
        if snapshot.stopping {
            self.complete(Err(self.ctx.stopped_error()));
            return;
        }

        let rejected = self.state.lock().map_error_topology;
        let above_rejected = rejected.map_or(true, |version| snapshot.version > version);

        if !(snapshot.ready && above_rejected) {
            let min_version = match rejected {
                Some(version) => version.next_minor().max(snapshot.version),
                None => snapshot.version,
            };
            self.remap(min_version);
            return;
        }

        let future_id = self.ctx.registry.next_id();
        {
            let mut state = self.state.lock();
            state.future_id = Some(future_id);
            state.topology_version = snapshot.version;
        }
        self.ctx.registry.add_near(future_id, self.clone());

        // Completed concurrently before the attempt was registered.
        if self.latch.is_done() {
            self.ctx.registry.remove(future_id);
            return;
        }

        self.map(snapshot.version, future_id);
    }

    /// Send the request of attempt `future_id` to the primary.
    fn map(self: &Arc<Self>, topology_version: TopologyVersion, future_id: FutureId) {
        let partition = self.ctx.affinity.partition(&self.op.key);
        let Some(primary) = self.ctx.affinity.primary(&self.op.key, topology_version) else {
            self.complete(Err(CacheError::NoPrimaryAvailable {
                partition,
                topology_version,
            }));
            return;
        };

        let request = Arc::new(self.build_request(future_id, topology_version, partition));
        {
            let mut state = self.state.lock();
            if state.future_id != Some(future_id) {
                return;
            }
            let relayed = self.sync_mode == SyncMode::FullSync
                && self.ctx.config.near_relay == NearRelay::Backups;
            state.request_state = Some(PrimaryRequestState::new(request.clone(), primary, relayed));
        }

        tracing::debug!(
            future_id,
            node = %primary,
            write_version = %self.write_version,
            topology_version = %topology_version,
            "sending near update request"
        );

        match self
            .ctx
            .send(primary, CacheMessage::NearUpdateRequest((*request).clone()))
        {
            Ok(()) => {
                if self.sync_mode == SyncMode::FullAsync && primary != self.ctx.local_node {
                    self.complete(Ok(self.outcome(Some(CacheReturn::success(true)))));
                }
            }
            Err(e) => self.on_send_error(primary, &request, e),
        }
    }

    fn build_request(
        &self,
        future_id: FutureId,
        topology_version: TopologyVersion,
        partition: u32,
    ) -> NearUpdateRequest {
        let entry = UpdateEntry::new(
            self.op.key.clone(),
            self.op.value.clone(),
            self.op.processor.clone(),
        );

        NearUpdateRequest {
            cache_id: self.ctx.cache_id,
            partition,
            future_id,
            write_version: self.write_version,
            topology_version,
            sync_mode: self.sync_mode,
            operation: self.op.operation,
            flags: self.op.flags(),
            payload: UpdatePayload::build(
                vec![entry],
                self.op.filters.clone(),
                self.op.invoke_args.clone(),
                self.op.expiry,
            ),
            subject_id: self.ctx.local_node.0,
            task_name_hash: self.op.task_name_hash,
        }
    }

    /// The request never reached the primary: answer it locally as a node error.
    fn on_send_error(self: &Arc<Self>, primary: NodeId, request: &NearUpdateRequest, err: SendError) {
        let cause = match err {
            SendError::NodeLeft(node) => FailureCause::NodeDeparted { node },
            SendError::Failed { message, .. } => FailureCause::topology_changed(message),
        };

        let mut response =
            UpdateResponse::new(self.ctx.cache_id, request.partition, request.future_id, primary);
        response.add_failed_keys(request.keys(), cause);
        self.on_primary_response(primary, response, true);
    }

    /// Handle the primary's answer, real or synthesized (`node_error`).
    pub fn on_primary_response(
        self: &Arc<Self>,
        node: NodeId,
        response: UpdateResponse,
        node_error: bool,
    ) {
        let request;
        let remap_keys = response.needs_remap();
        let mut remap_to = None;
        let completion;

        {
            let mut guard = self.state.lock();
            let state = &mut *guard;

            if state.future_id != Some(response.future_id) {
                tracing::debug!(
                    future_id = response.future_id,
                    node = %node,
                    "ignoring stale primary response"
                );
                return;
            }
            let Some(req_state) = state.request_state.as_mut() else {
                return;
            };
            let Some(pending) = req_state.pending_primary(node) else {
                return;
            };
            req_state.primary_responded = true;
            request = pending;

            if remap_keys {
                let rejected = request.topology_version;
                if state.map_error_topology.map_or(true, |v| v < rejected) {
                    state.map_error_topology = Some(rejected);
                }
            } else if response.has_error() {
                if !response.failed_keys.is_empty() {
                    let error = state.error.get_or_insert_with(PartialUpdateError::new);
                    for (key, cause) in &response.failed_keys {
                        error.add([key.clone()], cause.clone(), request.topology_version);
                    }
                }
            } else {
                if let Some(ret) = response.ret.clone() {
                    match (&mut state.op_result, self.op.operation) {
                        (Some(existing), Operation::Transform) => existing.merge(ret),
                        (slot, _) => *slot = Some(ret),
                    }
                }
                if !req_state.on_primary_response(&response) {
                    // Backups report directly; wait for them.
                    return;
                }
            }

            if remap_keys {
                let local = self.ctx.topology.version();
                remap_to = Some(local.max(response.remap_topology_version));
            } else if let Some(error) = state.error.take() {
                if error.is_retryable() && state.remaps_left > 0 {
                    let failed_at = error
                        .topology_version()
                        .unwrap_or(request.topology_version);
                    state.remaps_left -= 1;
                    state.remaps_done += 1;
                    state.history.merge(error);
                    remap_to = Some(failed_at.next_major());
                } else {
                    state.error = Some(error);
                }
            }

            if let Some(version) = remap_to {
                if let Some(id) = state.future_id.take() {
                    self.ctx.registry.remove(id);
                }
                state.request_state = None;
                state.op_result = None;
                state.topology_version = TopologyVersion::ZERO;

                tracing::debug!(
                    future_id = response.future_id,
                    write_version = %self.write_version,
                    topology_version = %version,
                    remaps_left = state.remaps_left,
                    "remapping near update"
                );
                completion = None;
            } else if let (Some(cause), true) = (&response.error, response.failed_keys.is_empty()) {
                completion = Some(Err(CacheError::Remote {
                    message: cause.to_string(),
                }));
            } else {
                completion = Some(self.terminal_result(state));
            }
        }

        if !node_error && !remap_keys && !response.has_error() {
            self.update_near(&request, &response);
        }

        if let Some(version) = remap_to {
            self.remap(version);
            return;
        }
        if let Some(result) = completion {
            self.complete(result);
        }
    }

    /// The primary reports the backups of the update.
    pub fn on_mapping_received(self: &Arc<Self>, node: NodeId, response: NearMappingResponse) {
        let action = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.future_id != Some(response.future_id) {
                return;
            }
            let Some(req_state) = state.request_state.as_mut() else {
                return;
            };

            tracing::debug!(
                future_id = response.future_id,
                node = %node,
                backups = response.mapping.len(),
                "near update mapping received"
            );

            let progress = req_state.on_mapping(&response.mapping);
            self.action_for(state, progress)
        };
        self.run(action);
    }

    /// A backup (or the primary, for a failed backup) notifies the near node directly.
    pub fn on_backup_response(self: &Arc<Self>, node: NodeId, response: BackupNearResponse) {
        let action = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.future_id != Some(response.future_id) {
                return;
            }
            let Some(req_state) = state.request_state.as_mut() else {
                return;
            };
            if req_state.primary != response.primary_id {
                return;
            }

            let progress = req_state.on_backup_response(node, &response);
            if let Some(success) = response.result() {
                state.op_result.get_or_insert_with(|| CacheReturn::success(success));
            }
            self.action_for(state, progress)
        };
        self.run(action);
    }

    /// A cluster node left.
    pub fn on_node_left(self: &Arc<Self>, node: NodeId) {
        let mut synthesized = None;
        let action = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(req_state) = state.request_state.as_mut() else {
                return;
            };

            match req_state.pending_primary(node) {
                Some(request) => {
                    let mut response = UpdateResponse::new(
                        self.ctx.cache_id,
                        request.partition,
                        request.future_id,
                        node,
                    );
                    response.add_failed_keys(request.keys(), FailureCause::NodeDeparted { node });
                    synthesized = Some(response);
                    Action::Nothing
                }
                None => {
                    let progress = req_state.on_node_left(node);
                    self.action_for(state, progress)
                }
            }
        };

        if let Some(response) = synthesized {
            tracing::debug!(
                future_id = response.future_id,
                write_version = %self.write_version,
                node = %node,
                "primary left before responding"
            );
            self.on_primary_response(node, response, true);
            return;
        }
        self.run(action);
    }

    fn action_for(&self, state: &mut NearState, progress: Progress) -> Action {
        match progress {
            Progress::Pending => Action::Nothing,
            Progress::Finished => {
                let from_backups = state
                    .request_state
                    .as_ref()
                    .is_some_and(|req_state| !req_state.primary_responded);
                let result = self.terminal_result(state);
                if from_backups {
                    Action::CompleteFromBackups(result)
                } else {
                    Action::Complete(result)
                }
            }
            Progress::CheckUpdate => match &state.request_state {
                Some(req_state) => {
                    Action::CheckUpdate(req_state.primary, req_state.request.clone())
                }
                None => Action::Nothing,
            },
        }
    }

    fn run(&self, action: Action) {
        match action {
            Action::Nothing => {}
            Action::Complete(result) => {
                self.complete(result);
            }
            Action::CompleteFromBackups(result) => {
                if result.as_ref().is_ok_and(UpdateOutcome::is_success) {
                    self.write_own_value(self.write_version);
                }
                self.complete(result);
            }
            Action::CheckUpdate(primary, request) => {
                tracing::debug!(
                    future_id = request.future_id,
                    node = %primary,
                    "all backups failed, checking update with primary"
                );
                // A departed primary is handled by the node-left path.
                let _ = self.ctx.send(
                    primary,
                    CacheMessage::CheckUpdateRequest(CheckUpdateRequest::new(request)),
                );
            }
        }
    }

    /// Remap onto `version` once it is ready, if the update allows waiting.
    fn remap(self: &Arc<Self>, version: TopologyVersion) {
        if !self.ctx.config.wait_topology_future || self.op.topology_locked {
            self.complete(Err(CacheError::ConcurrentTopologyChange {
                topology_version: version,
                key: Some(self.op.key.clone()),
            }));
            return;
        }

        let future = self.clone();
        self.ctx.spawn(async move {
            match future.ctx.topology.wait_ready(version).await {
                Ok(_) => future.map_on_topology(),
                Err(CacheError::CacheStopped { .. }) => {
                    future.complete(Err(future.ctx.stopped_error()));
                }
                Err(e) => {
                    future.complete(Err(e));
                }
            }
        });
    }

    /// Final result of the current attempt.
    fn terminal_result(&self, state: &mut NearState) -> CacheResult<UpdateOutcome> {
        match state.error.take() {
            Some(error) => {
                let retryable = error.is_retryable();
                let mut failure = std::mem::take(&mut state.history);
                failure.merge(error);
                if retryable && state.remaps_done > 0 {
                    Err(CacheError::RemapBudgetExhausted {
                        remaps: state.remaps_done,
                        failure,
                    })
                } else {
                    Err(CacheError::PartialUpdateFailure(failure))
                }
            }
            None => Ok(self.outcome(state.op_result.take())),
        }
    }

    fn outcome(&self, ret: Option<CacheReturn>) -> UpdateOutcome {
        UpdateOutcome::from_return(
            ret.unwrap_or_else(|| CacheReturn::success(true)),
            self.op.operation,
            self.op.return_value,
            self.op.raw_return,
        )
    }

    /// Push the written value into the near cache.
    fn update_near(&self, request: &NearUpdateRequest, response: &UpdateResponse) {
        let Some(near) = &self.ctx.near_cache else {
            return;
        };
        if response.ret.as_ref().is_some_and(|ret| !ret.success) {
            return;
        }

        let version = response.near_version.unwrap_or(request.write_version);
        if !response.near_values.is_empty() {
            for entry in &response.near_values {
                near.apply_update(&entry.key, entry.value.clone(), version, entry.ttl);
            }
            return;
        }

        self.write_own_value(version);
    }

    /// Push the caller's own value into the near cache at `version`.
    fn write_own_value(&self, version: WriteVersion) {
        let Some(near) = &self.ctx.near_cache else {
            return;
        };
        let ttl = self
            .op
            .expiry
            .map_or(TTL_NOT_CHANGED, |expiry| expiry.ttl_for_write(true));
        match self.op.operation {
            Operation::Update => near.apply_update(&self.op.key, self.op.value.clone(), version, ttl),
            Operation::Delete => near.apply_update(&self.op.key, None, version, ttl),
            Operation::Transform => {}
        }
    }

    /// Latch `result` and deregister the current attempt.
    fn complete(&self, result: CacheResult<UpdateOutcome>) -> bool {
        let success = result.is_ok();
        if !self.latch.complete(result) {
            return false;
        }

        let future_id = self.state.lock().future_id.take();
        if let Some(id) = future_id {
            self.ctx.registry.remove(id);
        }

        tracing::debug!(
            future_id,
            write_version = %self.write_version,
            success,
            "near update completed"
        );
        true
    }
}

impl std::fmt::Debug for NearUpdateFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NearUpdateFuture")
            .field("key", &self.op.key)
            .field("operation", &self.op.operation)
            .field("write_version", &self.write_version)
            .field("done", &self.latch.is_done())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(sync_mode: SyncMode) -> Arc<NearUpdateRequest> {
        Arc::new(NearUpdateRequest {
            sync_mode,
            future_id: 1,
            ..NearUpdateRequest::default()
        })
    }

    #[test]
    fn validation_rejects_null_key_and_value() {
        assert!(UpdateOp::put(Bytes::new(), "v").validate().is_err());

        let mut missing_value = UpdateOp::put("k", "v");
        missing_value.value = None;
        assert!(matches!(
            missing_value.validate(),
            Err(CacheError::InvalidArgument { .. })
        ));

        assert!(UpdateOp::remove("k").validate().is_ok());
    }

    #[test]
    fn validation_requires_processor_for_transform() {
        let mut op = UpdateOp::invoke("k", ProcessorRef::new("incr"), Vec::new());
        assert!(op.validate().is_ok());
        op.processor = None;
        assert!(op.validate().is_err());
    }

    #[test]
    fn primary_response_without_mapping_finishes() {
        let mut state = PrimaryRequestState::new(request(SyncMode::FullSync), NodeId(1), true);
        assert!(state.pending_primary(NodeId(1)).is_some());
        assert!(state.pending_primary(NodeId(2)).is_none());
        assert!(state.on_primary_response(&UpdateResponse::default()));
    }

    #[test]
    fn primary_response_with_mapping_waits_for_backups() {
        let mut state = PrimaryRequestState::new(request(SyncMode::FullSync), NodeId(1), true);
        let response = UpdateResponse {
            mapping: Some(vec![NodeId(2), NodeId(3)]),
            ..UpdateResponse::default()
        };
        assert!(!state.on_primary_response(&response));

        let mut ack = BackupNearResponse {
            primary_id: NodeId(1),
            mapping: vec![NodeId(2), NodeId(3)],
            ..BackupNearResponse::default()
        };
        ack.set_result(true);
        assert_eq!(state.on_backup_response(NodeId(2), &ack), Progress::Pending);
        assert_eq!(state.on_backup_response(NodeId(3), &ack), Progress::Finished);
    }

    #[test]
    fn backup_heard_before_mapping_is_not_awaited() {
        let mut state = PrimaryRequestState::new(request(SyncMode::FullSync), NodeId(1), true);
        let early = BackupNearResponse {
            primary_id: NodeId(1),
            ..BackupNearResponse::default()
        };
        assert_eq!(state.on_backup_response(NodeId(2), &early), Progress::Pending);

        let response = UpdateResponse {
            mapping: Some(vec![NodeId(2)]),
            ..UpdateResponse::default()
        };
        assert!(state.on_primary_response(&response));
    }

    #[test]
    fn losing_every_backup_without_result_checks_once() {
        let mut state = PrimaryRequestState::new(request(SyncMode::FullSync), NodeId(1), true);
        assert_eq!(state.on_mapping(&[NodeId(2)]), Progress::Pending);
        assert_eq!(state.on_node_left(NodeId(2)), Progress::CheckUpdate);
        assert_eq!(state.progress(true), Progress::Pending);
    }

    #[test]
    fn departure_of_unawaited_node_changes_nothing() {
        let mut state = PrimaryRequestState::new(request(SyncMode::FullSync), NodeId(1), true);
        assert_eq!(state.on_mapping(&[NodeId(2), NodeId(3)]), Progress::Pending);
        assert_eq!(state.on_node_left(NodeId(9)), Progress::Pending);
        assert_eq!(state.on_node_left(NodeId(2)), Progress::Pending);
        assert_eq!(state.on_node_left(NodeId(2)), Progress::Pending);
        assert_eq!(state.on_node_left(NodeId(3)), Progress::CheckUpdate);
    }

    #[test]
    fn primary_relay_never_checks_update() {
        let mut state = PrimaryRequestState::new(request(SyncMode::FullSync), NodeId(1), false);
        let notice = BackupNearResponse {
            primary_id: NodeId(1),
            mapping: vec![NodeId(2)],
            failed_node: Some(NodeId(2)),
            ..BackupNearResponse::default()
        };
        assert_eq!(state.on_backup_response(NodeId(1), &notice), Progress::Pending);

        // The primary's own reply still finishes the request.
        assert!(state.on_primary_response(&UpdateResponse::default()));
    }

    #[test]
    fn failed_backup_notice_removes_failed_node() {
        let mut state = PrimaryRequestState::new(request(SyncMode::FullSync), NodeId(1), true);
        state.has_result = true;
        let notice = BackupNearResponse {
            primary_id: NodeId(1),
            mapping: vec![NodeId(2)],
            failed_node: Some(NodeId(2)),
            ..BackupNearResponse::default()
        };
        assert_eq!(state.on_backup_response(NodeId(1), &notice), Progress::Finished);
    }
}
