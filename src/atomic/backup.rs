//! Update processing on backups and near readers.

use crate::atomic::context::CacheContext;
use crate::core::types::NodeId;
use crate::wire::messages::{BackupNearResponse, BackupUpdateRequest, UpdateResponse};
use crate::wire::CacheMessage;

/// Apply a replicated update sent by the primary `from` and acknowledge it.
pub fn process_backup_update(ctx: &CacheContext, from: NodeId, request: BackupUpdateRequest) {
    for entry in &request.entries {
        ctx.store
            .apply_backup(request.partition, entry, request.write_version);
    }

    if let Some(near) = &ctx.near_cache {
        for entry in &request.near_entries {
            near.apply_update(&entry.key, entry.value.clone(), request.write_version, entry.ttl);
        }
    }

    tracing::debug!(
        future_id = request.future_id,
        node = %from,
        write_version = %request.write_version,
        entries = request.entries.len(),
        "applied backup update"
    );

    let ack = UpdateResponse::new(ctx.cache_id, request.partition, request.future_id, ctx.local_node);
    if let Err(e) = ctx.send(from, CacheMessage::UpdateResponse(ack)) {
        tracing::warn!(node = %from, error = %e, "failed to acknowledge backup update");
    }

    if !request.near_reply() {
        return;
    }

    let mut notice = BackupNearResponse {
        cache_id: ctx.cache_id,
        partition: request.partition,
        future_id: request.near_future_id,
        primary_id: from,
        mapping: request.mapping.clone().unwrap_or_default(),
        ..BackupNearResponse::default()
    };
    if let Some(success) = request.result() {
        notice.set_result(success);
    }

    if let Err(e) = ctx.send(request.near_node, CacheMessage::BackupNearResponse(notice)) {
        tracing::warn!(
            node = %request.near_node,
            future_id = request.near_future_id,
            error = %e,
            "failed to notify near node"
        );
    }
}
