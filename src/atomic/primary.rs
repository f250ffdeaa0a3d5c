//! Update processing on the primary.
//!
//! The primary checks that the request was mapped on the topology it is at, applies
//! every entry through the storage engine, and hands replication to a
//! [`BackupUpdateFuture`]. The response to the near node is sent by the fan-out
//! once its synchronization mode allows.

use crate::atomic::context::{CacheContext, StoreWrite};
use crate::atomic::fanout::BackupUpdateFuture;
use crate::atomic::result::CacheReturn;
use crate::core::error::FailureCause;
use crate::core::types::{NodeId, Operation, SyncMode, EXPIRE_TIME_CALCULATE};
use crate::wire::messages::{
    BackupEntry, CheckUpdateRequest, NearEntry, NearUpdateRequest, UpdateResponse,
};
use crate::wire::CacheMessage;
use std::sync::Arc;

/// Handle an update request from the near node `from`.
pub fn process_near_update(ctx: &Arc<CacheContext>, from: NodeId, request: NearUpdateRequest) {
    let snapshot = ctx.topology.snapshot();
    let mut response =
        UpdateResponse::new(ctx.cache_id, request.partition, request.future_id, ctx.local_node);

    if snapshot.stopping {
        response.error = Some(FailureCause::rejected(format!(
            "cache {} is stopping",
            ctx.cache_name
        )));
        send_response(ctx, from, response);
        return;
    }

    let keys = request.keys();
    let locked = request.topology_locked();

    // The near node is ahead of us: finish our exchange first.
    if !locked && (request.topology_version > snapshot.version || !snapshot.ready) {
        let task_ctx = ctx.clone();
        let target = request.topology_version;
        ctx.spawn(async move {
            let ctx = task_ctx;
            match ctx.topology.wait_ready(target).await {
                Ok(_) => process_near_update(&ctx, from, request),
                Err(e) => {
                    let mut response = UpdateResponse::new(
                        ctx.cache_id,
                        request.partition,
                        request.future_id,
                        ctx.local_node,
                    );
                    response.error = Some(FailureCause::rejected(e.to_string()));
                    send_response(&ctx, from, response);
                }
            }
        });
        return;
    }

    let is_primary = keys
        .iter()
        .all(|key| ctx.affinity.primary(key, snapshot.version) == Some(ctx.local_node));

    if !locked && (request.topology_version != snapshot.version || !is_primary) {
        tracing::debug!(
            future_id = request.future_id,
            node = %from,
            request_version = %request.topology_version,
            topology_version = %snapshot.version,
            "asking near node to remap"
        );
        response.remap_keys = keys;
        response.remap_topology_version = snapshot.version;
        send_response(ctx, from, response);
        return;
    }

    if !is_primary {
        response.add_failed_keys(
            keys,
            FailureCause::topology_changed(format!(
                "node {} is not primary at {}",
                ctx.local_node, snapshot.version
            )),
        );
        send_response(ctx, from, response);
        return;
    }

    let fanout = BackupUpdateFuture::new(ctx, from, &request);
    let mut ret = CacheReturn::success(true);
    let mut near_values = Vec::new();

    for entry in request.payload.entries() {
        let write = StoreWrite {
            key: entry.key.clone(),
            operation: request.operation,
            value: entry.value.clone(),
            processor: entry.processor.clone(),
            invoke_args: request.payload.invoke_args().to_vec(),
            filters: request.payload.filters().to_vec(),
            expiry: request.payload.expiry(),
            version: request.write_version,
        };

        let applied = match ctx.store.apply(request.partition, write) {
            Ok(applied) => applied,
            Err(cause) => {
                tracing::debug!(
                    future_id = request.future_id,
                    error = %cause,
                    "primary failed to apply entry"
                );
                response.add_failed_keys([entry.key], cause);
                continue;
            }
        };

        if let Some(outcome) = applied.invoke {
            ret.add_invoke_result(entry.key.clone(), outcome);
        } else if request.return_value() {
            ret = CacheReturn::previous(applied.previous.clone(), ret.success);
        }
        if applied.filtered {
            ret.success = false;
            continue;
        }

        fanout.add_write_entry(BackupEntry {
            key: entry.key.clone(),
            value: applied.new_value.clone(),
            ttl: applied.ttl,
            conflict_expire_time: EXPIRE_TIME_CALCULATE,
            conflict_version: None,
            send_previous: false,
            previous: None,
            update_counter: applied.update_counter,
        });

        let near_entry = NearEntry {
            key: entry.key.clone(),
            value: applied.new_value,
            ttl: applied.ttl,
            expire_time: EXPIRE_TIME_CALCULATE,
        };
        let readers: Vec<NodeId> = ctx
            .store
            .readers(&entry.key)
            .into_iter()
            .filter(|reader| *reader != from)
            .collect();
        if !readers.is_empty() {
            fanout.add_near_write_entries(&readers, near_entry.clone());
        }
        if request.operation == Operation::Transform {
            near_values.push(near_entry);
        }
    }

    response.ret = Some(ret.clone());
    response.near_version = Some(request.write_version);
    response.near_values = near_values;

    // A remote near node running full_async already completed.
    let reply = !(request.sync_mode == SyncMode::FullAsync && from != ctx.local_node);
    let reply_ctx = ctx.clone();
    fanout.map(
        response,
        &ret,
        Box::new(move |response| {
            if reply {
                send_response(&reply_ctx, from, response);
            }
        }),
    );
}

/// Confirm to the near node that an update whose backups all failed was applied.
pub fn process_check_update(ctx: &Arc<CacheContext>, from: NodeId, request: CheckUpdateRequest) {
    let mut response =
        UpdateResponse::new(ctx.cache_id, request.partition, request.future_id, ctx.local_node);
    response.ret = Some(CacheReturn::success(true));
    send_response(ctx, from, response);
}

fn send_response(ctx: &CacheContext, node: NodeId, response: UpdateResponse) {
    let future_id = response.future_id;
    if let Err(e) = ctx.send(node, CacheMessage::UpdateResponse(response)) {
        tracing::warn!(
            node = %node,
            future_id,
            error = %e,
            "failed to send update response to near node"
        );
    }
}
