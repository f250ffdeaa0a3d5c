//! Atomic write path tests.
//!
//! Each test drives one node through a recording transport and plays the other
//! nodes by hand.

mod common;

use bytes::Bytes;
use common::{assert_err, assert_ok, backup_requests, node_config, within, TestNode};
use parking_lot::Mutex;
use ripple::atomic::fanout::ReplyCallback;
use ripple::atomic::{
    BackupUpdateFuture, CacheReturn, InvokeOutcome, NearUpdateFuture, UpdateOp, UpdateOutcome,
};
use ripple::core::error::{CacheError, FailureCause};
use ripple::core::types::{
    EntryFilter, NearRelay, NodeId, Operation, ProcessorRef, SyncMode, TopologyVersion,
};
use ripple::sim::Processor;
use ripple::wire::messages::{
    BackupEntry, BackupNearResponse, NearMappingResponse, NearUpdateRequest, RequestFlags,
    UpdatePayload, UpdateResponse,
};
use ripple::wire::CacheMessage;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn b(s: &'static str) -> Bytes {
    Bytes::from_static(s.as_bytes())
}

/// Answer `request` on behalf of its primary.
fn answer(node: &TestNode, from: NodeId, request: &NearUpdateRequest, ret: CacheReturn) {
    let mut response = UpdateResponse::new(node.cache_id(), request.partition, request.future_id, from);
    response.ret = Some(ret);
    node.cache.on_message(from, CacheMessage::UpdateResponse(response));
}

/// Fail every key of `request` because `from` departed.
fn fail_departed(node: &TestNode, from: NodeId, request: &NearUpdateRequest) {
    let mut response = UpdateResponse::new(node.cache_id(), request.partition, request.future_id, from);
    response.add_failed_keys(request.keys(), FailureCause::NodeDeparted { node: from });
    node.cache.on_message(from, CacheMessage::UpdateResponse(response));
}

/// Request as the primary would receive it from near node 1.
fn incoming_request(node: &TestNode, future_id: u64, sync_mode: SyncMode) -> NearUpdateRequest {
    NearUpdateRequest {
        cache_id: node.cache_id(),
        partition: 0,
        future_id,
        write_version: node.ctx().next_write_version(node.topology.version()),
        topology_version: node.topology.version(),
        sync_mode,
        operation: Operation::Update,
        flags: RequestFlags::empty(),
        payload: UpdatePayload::Single {
            key: b("k"),
            value: Some(b("v")),
        },
        subject_id: 1,
        task_name_hash: 0,
    }
}

fn backup_entry(key: &'static str) -> BackupEntry {
    BackupEntry {
        key: b(key),
        value: Some(b("v")),
        ttl: -1,
        conflict_expire_time: -1,
        conflict_version: None,
        send_previous: false,
        previous: None,
        update_counter: 1,
    }
}

/// Reply callback recording every response it is handed.
fn recording_callback() -> (ReplyCallback, Arc<Mutex<Vec<UpdateResponse>>>) {
    let replies = Arc::new(Mutex::new(Vec::new()));
    let sink = replies.clone();
    (Box::new(move |response| sink.lock().push(response)), replies)
}

/// Start a fan-out on primary node 2 for a request from near node 1.
fn start_fanout(node: &TestNode, sync_mode: SyncMode) -> Arc<BackupUpdateFuture> {
    let request = incoming_request(node, 77, sync_mode);
    let fanout = BackupUpdateFuture::new(node.ctx(), NodeId(1), &request);
    fanout.add_write_entry(backup_entry("k"));
    fanout
}

/// Response the primary would send back to near node 1.
fn primary_response(node: &TestNode) -> UpdateResponse {
    UpdateResponse::new(node.cache_id(), 0, 77, NodeId(2))
}

// ============================================================================
// Near coordinator tests
// ============================================================================

#[tokio::test]
async fn put_completes_from_primary_response() {
    let node = TestNode::start(&node_config(1, 32), &[1, 2, 3], &[2, 3]);

    let handle = assert_ok(node.cache.update(UpdateOp::put("k", "v")));
    let (primary, request) = node.transport.next_near_request().await;

    assert_eq!(primary, NodeId(2));
    assert_eq!(request.topology_version, TopologyVersion::new(1, 0));
    assert_eq!(request.payload.keys(), vec![b("k")]);
    assert!(node.ctx().registry.contains(request.future_id));

    answer(&node, primary, &request, CacheReturn::success(true));

    assert_eq!(assert_ok(within(handle).await), UpdateOutcome::Success(true));
    assert!(node.ctx().registry.is_empty());
}

#[tokio::test]
async fn invalid_updates_fail_before_sending() {
    let node = TestNode::start(&node_config(1, 32), &[1, 2], &[2]);

    let err = assert_err(node.cache.update(UpdateOp::put("", "v")));
    assert!(matches!(err, CacheError::InvalidArgument { .. }));

    let mut op = UpdateOp::put("k", "v");
    op.value = None;
    assert!(matches!(
        node.cache.update(op),
        Err(CacheError::InvalidArgument { .. })
    ));

    let mut op = UpdateOp::invoke("k", ProcessorRef::new("p"), Vec::new());
    op.processor = None;
    assert!(node.cache.update(op).is_err());

    assert!(node.transport.is_empty());
    assert!(node.ctx().registry.is_empty());
}

#[tokio::test]
async fn no_owner_fails_terminally() {
    let node = TestNode::start(&node_config(1, 32), &[1], &[]);

    let handle = assert_ok(node.cache.update(UpdateOp::remove("k")));
    let err = assert_err(within(handle).await);

    assert!(matches!(err, CacheError::NoPrimaryAvailable { .. }));
    assert!(node.transport.is_empty());
}

#[tokio::test]
async fn stale_future_id_is_ignored() {
    let node = TestNode::start(&node_config(1, 32), &[1, 2], &[2]);

    let (future, mut handle) =
        assert_ok(NearUpdateFuture::start(node.ctx(), UpdateOp::put("k", "v")));
    let (primary, request) = node.transport.next_near_request().await;

    let mut stale = UpdateResponse::new(node.cache_id(), 0, request.future_id + 1000, primary);
    stale.ret = Some(CacheReturn::success(false));
    future.on_primary_response(primary, stale, false);
    assert!(!future.is_done());
    assert!(handle.try_result().is_none());

    // Only the primary of the attempt may answer it.
    let mut wrong_node = UpdateResponse::new(node.cache_id(), 0, request.future_id, NodeId(9));
    wrong_node.ret = Some(CacheReturn::success(false));
    future.on_primary_response(NodeId(9), wrong_node, false);
    assert!(!future.is_done());

    answer(&node, primary, &request, CacheReturn::success(true));
    assert_eq!(assert_ok(within(handle).await), UpdateOutcome::Success(true));
}

#[tokio::test]
async fn completion_happens_once_under_concurrent_responses() {
    let node = TestNode::start(&node_config(1, 0), &[1, 2], &[2]);

    let (future, handle) = assert_ok(NearUpdateFuture::start(node.ctx(), UpdateOp::put("k", "v")));
    let (primary, request) = node.transport.next_near_request().await;

    let threads: Vec<_> = (0..16)
        .map(|i| {
            let future = future.clone();
            let mut response =
                UpdateResponse::new(request.cache_id, request.partition, request.future_id, primary);
            if i % 2 == 0 {
                response.ret = Some(CacheReturn::success(true));
            } else {
                response.add_failed_keys(request.keys(), FailureCause::rejected("filtered"));
            }
            std::thread::spawn(move || future.on_primary_response(primary, response, false))
        })
        .collect();
    for thread in threads {
        thread.join().unwrap();
    }

    assert!(future.is_done());
    match within(handle).await {
        Ok(outcome) => assert_eq!(outcome, UpdateOutcome::Success(true)),
        Err(err) => assert!(matches!(err, CacheError::PartialUpdateFailure(_))),
    }
    assert!(node.ctx().registry.is_empty());
}

#[tokio::test]
async fn previous_value_is_returned_when_requested() {
    let node = TestNode::start(&node_config(1, 32), &[1, 2], &[2]);

    let handle = assert_ok(node.cache.update(UpdateOp::put("k", "new").return_previous()));
    let (primary, request) = node.transport.next_near_request().await;
    assert!(request.return_value());

    answer(&node, primary, &request, CacheReturn::previous(Some(b("old")), true));
    assert_eq!(
        assert_ok(within(handle).await),
        UpdateOutcome::Previous(Some(b("old")))
    );
}

#[tokio::test]
async fn full_async_completes_once_sent() {
    let node = TestNode::start(&node_config(1, 32), &[1, 2], &[2]);

    let handle = assert_ok(
        node.cache
            .update(UpdateOp::put("k", "v").with_sync_mode(SyncMode::FullAsync)),
    );

    assert_eq!(assert_ok(within(handle).await), UpdateOutcome::Success(true));
    let (_, request) = node.transport.next_near_request().await;
    assert_eq!(request.sync_mode, SyncMode::FullAsync);
    assert!(node.ctx().registry.is_empty());
}

#[tokio::test]
async fn key_failures_complete_with_partial_failure() {
    let node = TestNode::start(&node_config(1, 32), &[1, 2], &[2]);

    let handle = assert_ok(node.cache.update(UpdateOp::put("k", "v")));
    let (primary, request) = node.transport.next_near_request().await;

    let mut response = UpdateResponse::new(node.cache_id(), 0, request.future_id, primary);
    response.add_failed_keys(request.keys(), FailureCause::rejected("store is read-only"));
    node.cache.on_message(primary, CacheMessage::UpdateResponse(response));

    match assert_err(within(handle).await) {
        CacheError::PartialUpdateFailure(failure) => {
            assert_eq!(failure.len(), 1);
            assert!(!failure.is_retryable());
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(node.transport.take_near_requests().is_empty());
}

// ============================================================================
// Remap tests
// ============================================================================

#[tokio::test]
async fn remap_budget_allows_exactly_n_remaps() {
    let node = TestNode::start(&node_config(1, 2), &[1, 2, 3], &[2]);

    let (future, handle) = assert_ok(NearUpdateFuture::start(node.ctx(), UpdateOp::put("k", "v")));

    let mut seen_ids = Vec::new();
    for attempt in 0..3u64 {
        let (primary, request) = node.transport.next_near_request().await;
        assert_eq!(request.topology_version, TopologyVersion::new(1 + attempt, 0));
        assert_eq!(request.write_version, future.write_version());
        seen_ids.push(request.future_id);

        fail_departed(&node, primary, &request);
        if attempt < 2 {
            // Stand-in exchange so the remap has a newer version to map on.
            node.topology.node_left(NodeId(9));
        }
    }

    let err = assert_err(within(handle).await);
    match &err {
        CacheError::RemapBudgetExhausted { remaps, failure } => {
            assert_eq!(*remaps, 2);
            let keys: Vec<&Bytes> = failure.failed_keys().collect();
            assert_eq!(keys, vec![&b("k")]);
            assert_eq!(failure.topology_version(), Some(TopologyVersion::new(3, 0)));
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(err.is_retriable());
    assert_eq!(future.remaps(), 2);

    seen_ids.dedup();
    assert_eq!(seen_ids.len(), 3);
    assert!(node.transport.take_near_requests().is_empty());
    assert!(node.ctx().registry.is_empty());
}

#[tokio::test]
async fn zero_budget_fails_without_remapping() {
    let node = TestNode::start(&node_config(1, 0), &[1, 2], &[2]);

    let handle = assert_ok(node.cache.update(UpdateOp::put("k", "v")));
    let (primary, request) = node.transport.next_near_request().await;
    fail_departed(&node, primary, &request);

    let err = assert_err(within(handle).await);
    assert!(matches!(err, CacheError::PartialUpdateFailure(_)));
}

#[tokio::test]
async fn responses_to_an_abandoned_attempt_are_ignored() {
    let node = TestNode::start(&node_config(1, 32), &[1, 2, 3], &[2]);

    let (future, handle) = assert_ok(NearUpdateFuture::start(node.ctx(), UpdateOp::put("k", "v")));
    let (primary, first) = node.transport.next_near_request().await;

    fail_departed(&node, primary, &first);
    assert!(!node.ctx().registry.contains(first.future_id));
    node.topology.node_left(NodeId(9));

    let (_, second) = node.transport.next_near_request().await;
    assert_ne!(first.future_id, second.future_id);
    assert_eq!(future.future_id(), Some(second.future_id));

    // A late answer for the first attempt changes nothing.
    let mut late = UpdateResponse::new(node.cache_id(), 0, first.future_id, primary);
    late.ret = Some(CacheReturn::success(false));
    future.on_primary_response(primary, late, false);
    assert!(!future.is_done());

    answer(&node, primary, &second, CacheReturn::success(true));
    assert_eq!(assert_ok(within(handle).await), UpdateOutcome::Success(true));
    assert_eq!(future.remaps(), 1);
}

#[tokio::test]
async fn remap_request_moves_to_primary_topology() {
    let node = TestNode::start(&node_config(1, 0), &[1, 2, 3], &[2]);

    let (future, handle) = assert_ok(NearUpdateFuture::start(node.ctx(), UpdateOp::put("k", "v")));
    let (primary, request) = node.transport.next_near_request().await;

    let newer = node.topology.node_left(NodeId(9));
    node.affinity.set_owners(&[3]);

    let mut response = UpdateResponse::new(node.cache_id(), 0, request.future_id, primary);
    response.remap_keys = request.keys();
    response.remap_topology_version = newer;
    node.cache.on_message(primary, CacheMessage::UpdateResponse(response));

    let (new_primary, retry) = node.transport.next_near_request().await;
    assert_eq!(new_primary, NodeId(3));
    assert_eq!(retry.topology_version, newer);

    answer(&node, new_primary, &retry, CacheReturn::success(true));
    assert_eq!(assert_ok(within(handle).await), UpdateOutcome::Success(true));
    // Remap requests do not consume the retry budget.
    assert_eq!(future.remaps(), 0);
}

#[tokio::test]
async fn primary_departure_remaps_to_new_primary() {
    let node = TestNode::start(&node_config(1, 32), &[1, 2, 3], &[2, 3]);

    let handle = assert_ok(node.cache.update(UpdateOp::put("k", "v")));
    let (primary, request) = node.transport.next_near_request().await;
    assert_eq!(primary, NodeId(2));

    node.affinity.set_owners(&[3]);
    let newer = node.topology.node_left(NodeId(2));
    node.cache.on_node_left(NodeId(2));

    let (new_primary, retry) = node.transport.next_near_request().await;
    assert_eq!(new_primary, NodeId(3));
    assert_eq!(retry.topology_version, newer);
    assert_ne!(retry.future_id, request.future_id);

    answer(&node, new_primary, &retry, CacheReturn::success(true));
    assert_eq!(assert_ok(within(handle).await), UpdateOutcome::Success(true));
}

#[tokio::test]
async fn send_failure_counts_as_departure() {
    let node = TestNode::start(&node_config(1, 32), &[1, 2, 3], &[2]);
    node.transport.take_down(NodeId(2));

    let handle = assert_ok(node.cache.update(UpdateOp::put("k", "v")));
    assert!(node.transport.is_empty());

    node.affinity.set_owners(&[3]);
    node.topology.node_left(NodeId(2));

    let (new_primary, retry) = node.transport.next_near_request().await;
    assert_eq!(new_primary, NodeId(3));
    answer(&node, new_primary, &retry, CacheReturn::success(true));
    assert_eq!(assert_ok(within(handle).await), UpdateOutcome::Success(true));
}

#[tokio::test]
async fn topology_locked_update_fails_instead_of_remapping() {
    let node = TestNode::start(&node_config(1, 32), &[1, 2, 3], &[2]);

    let handle = assert_ok(node.cache.update(UpdateOp::put("k", "v").topology_locked()));
    let (primary, request) = node.transport.next_near_request().await;
    assert!(request.topology_locked());

    fail_departed(&node, primary, &request);

    let err = assert_err(within(handle).await);
    assert!(matches!(
        err,
        CacheError::ConcurrentTopologyChange { key: Some(ref key), .. } if key == &b("k")
    ));
}

#[tokio::test]
async fn no_wait_fails_on_pending_exchange() {
    let mut config = node_config(1, 32);
    config.atomic.wait_topology_future = false;
    let node = TestNode::start(&config, &[1, 2], &[2]);

    node.topology.begin_exchange([NodeId(1), NodeId(2)]);

    let handle = assert_ok(node.cache.update(UpdateOp::put("k", "v")));
    let err = assert_err(within(handle).await);
    assert!(matches!(err, CacheError::ConcurrentTopologyChange { .. }));
    assert!(node.transport.is_empty());
}

#[tokio::test]
async fn update_waits_for_pending_exchange() {
    let node = TestNode::start(&node_config(1, 32), &[1, 2], &[2]);
    let pending = node.topology.begin_exchange([NodeId(1), NodeId(2)]);

    let handle = assert_ok(node.cache.update(UpdateOp::put("k", "v")));
    tokio::task::yield_now().await;
    assert!(node.transport.is_empty());

    node.topology.complete_exchange();
    let (primary, request) = node.transport.next_near_request().await;
    assert_eq!(request.topology_version, pending);

    answer(&node, primary, &request, CacheReturn::success(true));
    assert_ok(within(handle).await);
}

#[tokio::test]
async fn stopping_cache_fails_pending_remap() {
    let node = TestNode::start(&node_config(1, 32), &[1, 2], &[2]);

    let handle = assert_ok(node.cache.update(UpdateOp::put("k", "v")));
    let (primary, request) = node.transport.next_near_request().await;
    fail_departed(&node, primary, &request);

    node.topology.stop();
    let err = assert_err(within(handle).await);
    assert!(matches!(err, CacheError::CacheStopped { .. }));
}

// ============================================================================
// Backup relay tests (near side)
// ============================================================================

fn relay_config() -> ripple::core::config::Config {
    let mut config = node_config(1, 32);
    config.atomic.near_relay = NearRelay::Backups;
    config
}

#[tokio::test]
async fn near_waits_for_backups_named_in_mapping() {
    let node = TestNode::start(&relay_config(), &[1, 2, 3], &[2, 3]);

    let (future, handle) = assert_ok(NearUpdateFuture::start(node.ctx(), UpdateOp::put("k", "v")));
    let (primary, request) = node.transport.next_near_request().await;

    let mut response = UpdateResponse::new(node.cache_id(), 0, request.future_id, primary);
    response.ret = Some(CacheReturn::success(true));
    response.mapping = Some(vec![NodeId(3)]);
    node.cache.on_message(primary, CacheMessage::UpdateResponse(response));
    assert!(!future.is_done());

    let notice = BackupNearResponse {
        cache_id: node.cache_id(),
        partition: 0,
        future_id: request.future_id,
        primary_id: primary,
        mapping: vec![NodeId(3)],
        ..BackupNearResponse::default()
    };
    node.cache
        .on_message(NodeId(3), CacheMessage::BackupNearResponse(notice));

    assert_eq!(assert_ok(within(handle).await), UpdateOutcome::Success(true));
}

#[tokio::test]
async fn backups_alone_complete_the_update() {
    let node = TestNode::start(&relay_config(), &[1, 2, 3, 4], &[2, 3, 4]);

    let handle = assert_ok(node.cache.update(UpdateOp::put("k", "v")));
    let (primary, request) = node.transport.next_near_request().await;

    for backup in [3, 4] {
        let mut notice = BackupNearResponse {
            cache_id: node.cache_id(),
            partition: 0,
            future_id: request.future_id,
            primary_id: primary,
            mapping: vec![NodeId(3), NodeId(4)],
            ..BackupNearResponse::default()
        };
        notice.set_result(true);
        node.cache
            .on_message(NodeId(backup), CacheMessage::BackupNearResponse(notice));
    }

    assert_eq!(assert_ok(within(handle).await), UpdateOutcome::Success(true));
}

#[tokio::test]
async fn check_update_sent_when_every_backup_failed() {
    let node = TestNode::start(&relay_config(), &[1, 2, 3], &[2, 3]);

    let (future, handle) = assert_ok(NearUpdateFuture::start(node.ctx(), UpdateOp::put("k", "v")));
    let (primary, request) = node.transport.next_near_request().await;

    let mapping = NearMappingResponse {
        cache_id: node.cache_id(),
        partition: 0,
        future_id: request.future_id,
        mapping: vec![NodeId(3)],
    };
    node.cache
        .on_message(primary, CacheMessage::NearMappingResponse(mapping));
    node.cache.on_node_left(NodeId(3));

    let sent = node.transport.take();
    let checks: Vec<_> = sent
        .iter()
        .filter_map(|(to, message)| match message {
            CacheMessage::CheckUpdateRequest(check) => Some((*to, check.future_id)),
            _ => None,
        })
        .collect();
    assert_eq!(checks, vec![(primary, request.future_id)]);
    assert!(!future.is_done());

    // The primary confirms the update.
    answer(&node, primary, &request, CacheReturn::success(true));
    assert_eq!(assert_ok(within(handle).await), UpdateOutcome::Success(true));
}

#[tokio::test]
async fn failed_backup_notice_waits_for_primary_reply() {
    let node = TestNode::start(&node_config(1, 32), &[1, 2, 3], &[2, 3]);

    let (future, handle) = assert_ok(NearUpdateFuture::start(node.ctx(), UpdateOp::put("k", "v")));
    let (primary, request) = node.transport.next_near_request().await;

    let notice = BackupNearResponse {
        cache_id: node.cache_id(),
        partition: 0,
        future_id: request.future_id,
        primary_id: primary,
        mapping: vec![NodeId(3)],
        failed_node: Some(NodeId(3)),
        ..BackupNearResponse::default()
    };
    node.cache
        .on_message(primary, CacheMessage::BackupNearResponse(notice));
    node.cache.on_node_left(NodeId(3));

    // Without backup relay the primary always replies, so no check-update is sent.
    assert!(node.transport.is_empty());
    assert!(!future.is_done());

    answer(&node, primary, &request, CacheReturn::success(true));
    assert_eq!(assert_ok(within(handle).await), UpdateOutcome::Success(true));
}

#[tokio::test]
async fn notices_from_another_primary_are_ignored() {
    let node = TestNode::start(&relay_config(), &[1, 2, 3], &[2, 3]);

    let (future, _handle) = assert_ok(NearUpdateFuture::start(node.ctx(), UpdateOp::put("k", "v")));
    let (_, request) = node.transport.next_near_request().await;

    let mut notice = BackupNearResponse {
        cache_id: node.cache_id(),
        partition: 0,
        future_id: request.future_id,
        primary_id: NodeId(7),
        mapping: vec![NodeId(3)],
        ..BackupNearResponse::default()
    };
    notice.set_result(true);
    future.on_backup_response(NodeId(3), notice);

    assert!(!future.is_done());
}

// ============================================================================
// Fan-out tests
// ============================================================================

#[tokio::test]
async fn fanout_completes_after_every_backup_acknowledges() {
    let node = TestNode::start(&node_config(2, 32), &[1, 2, 3, 4], &[2, 3, 4]);
    let fanout = start_fanout(&node, SyncMode::FullSync);
    assert_eq!(fanout.mapped_nodes(), vec![NodeId(3), NodeId(4)]);

    let (callback, replies) = recording_callback();
    fanout.map(primary_response(&node), &CacheReturn::success(true), callback);

    let (requests, rest) = backup_requests(node.transport.take());
    assert!(rest.is_empty());
    let targets: Vec<NodeId> = requests.iter().map(|(to, _)| *to).collect();
    assert_eq!(targets, vec![NodeId(3), NodeId(4)]);
    assert!(requests
        .iter()
        .all(|(_, r)| r.future_id == fanout.future_id() && r.near_future_id == 77));
    assert!(node.ctx().registry.contains(fanout.future_id()));

    assert!(fanout.register_response(NodeId(3), false));
    assert!(!fanout.register_response(NodeId(3), false));
    assert!(!fanout.register_response(NodeId(9), false));
    assert_eq!(fanout.response_count(), 1);
    assert!(!fanout.is_done());
    assert!(replies.lock().is_empty());

    assert!(fanout.register_response(NodeId(4), false));
    assert!(fanout.is_done());
    assert_eq!(replies.lock().len(), 1);
    assert!(!node.ctx().registry.contains(fanout.future_id()));
}

#[tokio::test]
async fn departed_backup_counts_as_ack_and_notifies_near() {
    let node = TestNode::start(&node_config(2, 32), &[1, 2, 3, 4], &[2, 3, 4]);
    let fanout = start_fanout(&node, SyncMode::FullSync);

    let (callback, replies) = recording_callback();
    fanout.map(primary_response(&node), &CacheReturn::success(true), callback);
    node.transport.take();

    assert!(fanout.on_node_left(NodeId(4)));
    assert!(!fanout.on_node_left(NodeId(4)));

    let notices: Vec<_> = node
        .transport
        .take()
        .into_iter()
        .filter_map(|(to, message)| match message {
            CacheMessage::BackupNearResponse(notice) => Some((to, notice)),
            _ => None,
        })
        .collect();
    assert_eq!(notices.len(), 1);
    let (to, notice) = &notices[0];
    assert_eq!(*to, NodeId(1));
    assert_eq!(notice.future_id, 77);
    assert_eq!(notice.failed_node, Some(NodeId(4)));
    assert_eq!(notice.primary_id, NodeId(2));

    fanout.on_result(NodeId(3), &UpdateResponse::new(node.cache_id(), 0, fanout.future_id(), NodeId(3)));
    assert!(fanout.is_done());
    assert_eq!(replies.lock().len(), 1);
}

#[tokio::test]
async fn empty_mapping_completes_immediately() {
    let node = TestNode::start(&node_config(2, 32), &[1, 2], &[2]);
    let fanout = start_fanout(&node, SyncMode::FullSync);
    assert!(fanout.mapped_nodes().is_empty());

    let (callback, replies) = recording_callback();
    fanout.map(primary_response(&node), &CacheReturn::success(true), callback);

    assert!(fanout.is_done());
    assert_eq!(replies.lock().len(), 1);
    assert!(node.transport.is_empty());
    assert!(node.ctx().registry.is_empty());
}

#[tokio::test]
async fn primary_sync_replies_before_backups() {
    let node = TestNode::start(&node_config(2, 32), &[1, 2, 3], &[2, 3]);
    let fanout = start_fanout(&node, SyncMode::PrimarySync);

    let (callback, replies) = recording_callback();
    fanout.map(primary_response(&node), &CacheReturn::success(true), callback);
    assert_eq!(replies.lock().len(), 1);
    assert!(!fanout.is_done());

    // Under primary_sync a failed backup is not reported to the near node.
    fanout.on_node_left(NodeId(3));
    let (requests, rest) = backup_requests(node.transport.take());
    assert_eq!(requests.len(), 1);
    assert!(rest.is_empty());
    assert!(fanout.is_done());
    assert_eq!(replies.lock().len(), 1);
}

#[tokio::test]
async fn backup_relay_marks_requests_for_near_reply() {
    let mut config = node_config(2, 32);
    config.atomic.near_relay = NearRelay::Backups;
    config.atomic.send_mapping_to_near = true;
    let node = TestNode::start(&config, &[1, 2, 3, 4], &[2, 3, 4]);
    let fanout = start_fanout(&node, SyncMode::FullSync);

    let (callback, replies) = recording_callback();
    fanout.map(primary_response(&node), &CacheReturn::success(true), callback);

    // No value to return and a remote near node: backups answer it.
    assert!(replies.lock().is_empty());
    let (requests, rest) = backup_requests(node.transport.take());
    assert_eq!(requests.len(), 2);
    for (_, request) in &requests {
        assert!(request.near_reply());
        assert_eq!(request.result(), Some(true));
        assert_eq!(request.mapping, Some(vec![NodeId(3), NodeId(4)]));
    }
    match rest.as_slice() {
        [(to, CacheMessage::NearMappingResponse(mapping))] => {
            assert_eq!(*to, NodeId(1));
            assert_eq!(mapping.future_id, 77);
            assert_eq!(mapping.mapping, vec![NodeId(3), NodeId(4)]);
        }
        other => panic!("unexpected messages: {:?}", other),
    }

    // The backups already told the near node; the primary stays silent.
    for backup in [3, 4] {
        assert!(fanout.register_response(NodeId(backup), false));
    }
    assert!(fanout.is_done());
    assert!(replies.lock().is_empty());
    assert!(node.transport.is_empty());
}

#[tokio::test]
async fn backup_requests_go_out_before_the_reply() {
    let node = TestNode::start(&node_config(2, 32), &[1, 2, 3, 4], &[2, 3, 4]);
    let fanout = start_fanout(&node, SyncMode::PrimarySync);

    let transport = node.transport.clone();
    let sent_before_reply = Arc::new(Mutex::new(None));
    let seen = sent_before_reply.clone();
    let callback: ReplyCallback = Box::new(move |_| {
        let (requests, _) = backup_requests(transport.take());
        *seen.lock() = Some(requests.len());
    });
    fanout.map(primary_response(&node), &CacheReturn::success(true), callback);

    assert_eq!(*sent_before_reply.lock(), Some(2));
}

#[tokio::test]
async fn backup_relay_replies_at_once_with_a_value() {
    let mut config = node_config(2, 32);
    config.atomic.near_relay = NearRelay::Backups;
    let node = TestNode::start(&config, &[1, 2, 3], &[2, 3]);
    let fanout = start_fanout(&node, SyncMode::FullSync);

    let (callback, replies) = recording_callback();
    let ret = CacheReturn::previous(Some(b("old")), true);
    fanout.map(primary_response(&node), &ret, callback);

    let replies = replies.lock();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].mapping, Some(vec![NodeId(3)]));
    let (requests, _) = backup_requests(node.transport.take());
    assert!(requests[0].1.near_reply());
    assert_eq!(requests[0].1.result(), None);
}

#[tokio::test]
async fn send_failure_to_backup_counts_as_departure() {
    let node = TestNode::start(&node_config(2, 32), &[1, 2, 3], &[2, 3]);
    node.transport.take_down(NodeId(3));
    let fanout = start_fanout(&node, SyncMode::FullSync);

    let (callback, replies) = recording_callback();
    fanout.map(primary_response(&node), &CacheReturn::success(true), callback);

    assert!(fanout.is_done());
    assert_eq!(replies.lock().len(), 1);
    assert!(node.ctx().registry.is_empty());
}

#[tokio::test]
async fn listeners_run_once_with_success_flag() {
    let node = TestNode::start(&node_config(2, 32), &[1, 2, 3, 4, 5], &[2, 3, 4, 5]);
    let fanout = start_fanout(&node, SyncMode::FullSync);

    let calls = Arc::new(AtomicUsize::new(0));
    let flags = Arc::new(Mutex::new(Vec::new()));
    for _ in 0..3 {
        let calls = calls.clone();
        let flags = flags.clone();
        assert!(fanout.add_listener(Box::new(move |success| {
            calls.fetch_add(1, Ordering::SeqCst);
            flags.lock().push(success);
        })));
    }

    let (callback, replies) = recording_callback();
    fanout.map(primary_response(&node), &CacheReturn::success(false), callback);

    let threads: Vec<_> = [3u64, 4, 5, 3, 4, 5]
        .into_iter()
        .map(|backup| {
            let fanout = fanout.clone();
            std::thread::spawn(move || fanout.register_response(NodeId(backup), backup == 5))
        })
        .collect();
    let registered = threads
        .into_iter()
        .map(|t| t.join().unwrap())
        .filter(|r| *r)
        .count();

    assert_eq!(registered, 3);
    assert!(fanout.is_done());
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(*flags.lock(), vec![false, false, false]);
    assert_eq!(replies.lock().len(), 1);

    assert!(!fanout.add_listener(Box::new(|_| panic!("listener after completion"))));
}

#[tokio::test]
async fn exchange_waits_only_for_older_unlocked_fanouts() {
    let node = TestNode::start(&node_config(2, 32), &[1, 2, 3], &[2, 3]);
    let fanout = start_fanout(&node, SyncMode::FullSync);
    let (callback, _replies) = recording_callback();
    fanout.map(primary_response(&node), &CacheReturn::success(true), callback);

    let current = TopologyVersion::new(1, 0);
    assert!(!fanout.complete_future(current));
    assert!(fanout.complete_future(current.next_major()));
    assert_eq!(node.cache.pending_fanouts(current.next_major()).len(), 1);
    assert!(node.cache.pending_fanouts(current).is_empty());

    let mut locked = incoming_request(&node, 78, SyncMode::FullSync);
    locked.flags = RequestFlags::TOPOLOGY_LOCKED;
    let locked = BackupUpdateFuture::new(node.ctx(), NodeId(1), &locked);
    assert!(!locked.complete_future(current.next_major()));

    fanout.register_response(NodeId(3), false);
    assert!(!fanout.complete_future(current.next_major()));
    assert!(node.cache.pending_fanouts(current.next_major()).is_empty());
}

// ============================================================================
// Primary and backup processing tests
// ============================================================================

#[tokio::test]
async fn primary_applies_replicates_and_answers() {
    let node = TestNode::start(&node_config(2, 32), &[1, 2, 3], &[2, 3]);
    let request = incoming_request(&node, 5, SyncMode::FullSync);
    node.cache
        .on_message(NodeId(1), CacheMessage::NearUpdateRequest(request.clone()));

    assert_eq!(node.store.get(b"k"), Some(b("v")));
    assert_eq!(node.store.version(b"k"), Some(request.write_version));

    let (requests, rest) = backup_requests(node.transport.take());
    assert!(rest.is_empty(), "primary answered before the backup acknowledged");
    let (backup, backup_request) = &requests[0];
    assert_eq!(*backup, NodeId(3));
    assert_eq!(backup_request.entries[0].key, b("k"));
    assert_eq!(backup_request.write_version, request.write_version);

    let ack = UpdateResponse::new(node.cache_id(), 0, backup_request.future_id, NodeId(3));
    node.cache.on_message(NodeId(3), CacheMessage::UpdateResponse(ack));

    match node.transport.take().as_slice() {
        [(to, CacheMessage::UpdateResponse(response))] => {
            assert_eq!(*to, NodeId(1));
            assert_eq!(response.future_id, 5);
            assert_eq!(response.ret, Some(CacheReturn::success(true)));
            assert_eq!(response.near_version, Some(request.write_version));
        }
        other => panic!("unexpected messages: {:?}", other),
    }
    assert!(node.ctx().registry.is_empty());
}

#[tokio::test]
async fn backup_entries_carry_no_previous_value() {
    let node = TestNode::start(&node_config(2, 32), &[1, 2, 3], &[2, 3]);
    for future_id in [5, 6] {
        let request = incoming_request(&node, future_id, SyncMode::PrimarySync);
        node.cache
            .on_message(NodeId(1), CacheMessage::NearUpdateRequest(request));
    }

    let (requests, _) = backup_requests(node.transport.take());
    assert_eq!(requests.len(), 2);
    let overwrite = &requests[1].1.entries[0];
    assert_eq!(overwrite.value, Some(b("v")));
    assert!(!overwrite.send_previous);
    assert_eq!(overwrite.previous, None);
    assert_eq!(overwrite.conflict_version, None);
}

#[tokio::test]
async fn primary_asks_for_remap_on_stale_topology() {
    let node = TestNode::start(&node_config(2, 32), &[1, 2, 3], &[2, 3]);
    let request = incoming_request(&node, 5, SyncMode::FullSync);
    let current = node.topology.node_left(NodeId(9));

    node.cache
        .on_message(NodeId(1), CacheMessage::NearUpdateRequest(request));

    match node.transport.take().as_slice() {
        [(_, CacheMessage::UpdateResponse(response))] => {
            assert_eq!(response.remap_keys, vec![b("k")]);
            assert_eq!(response.remap_topology_version, current);
            assert!(response.ret.is_none());
        }
        other => panic!("unexpected messages: {:?}", other),
    }
    assert!(node.store.get(b"k").is_none());
}

#[tokio::test]
async fn primary_rejects_locked_request_it_does_not_own() {
    let node = TestNode::start(&node_config(2, 32), &[1, 2, 3], &[3]);
    let mut request = incoming_request(&node, 5, SyncMode::FullSync);
    request.flags = RequestFlags::TOPOLOGY_LOCKED;

    node.cache
        .on_message(NodeId(1), CacheMessage::NearUpdateRequest(request));

    match node.transport.take().as_slice() {
        [(_, CacheMessage::UpdateResponse(response))] => {
            assert_eq!(response.failed_keys.len(), 1);
            assert!(matches!(
                response.failed_keys[0].1,
                FailureCause::TopologyChanged { .. }
            ));
        }
        other => panic!("unexpected messages: {:?}", other),
    }
}

#[tokio::test]
async fn filtered_update_fails_without_replicating() {
    let node = TestNode::start(&node_config(2, 32), &[1, 2, 3], &[2, 3]);
    let mut request = incoming_request(&node, 5, SyncMode::FullSync);
    request.payload = UpdatePayload::SingleFilter {
        key: b("k"),
        value: Some(b("v")),
        filters: vec![EntryFilter::HasValue],
    };

    node.cache
        .on_message(NodeId(1), CacheMessage::NearUpdateRequest(request));

    match node.transport.take().as_slice() {
        [(to, CacheMessage::UpdateResponse(response))] => {
            assert_eq!(*to, NodeId(1));
            assert_eq!(response.ret, Some(CacheReturn::success(false)));
        }
        other => panic!("unexpected messages: {:?}", other),
    }
    assert!(node.store.get(b"k").is_none());
}

fn append(current: Option<&Bytes>, args: &[Bytes]) -> Result<(Option<Bytes>, Option<Bytes>), String> {
    let mut value = current.map(|v| v.to_vec()).unwrap_or_default();
    for arg in args {
        value.extend_from_slice(arg);
    }
    let value = Bytes::from(value);
    Ok((Some(value.clone()), Some(value)))
}

#[tokio::test]
async fn primary_runs_entry_processor() {
    let node = TestNode::start(&node_config(2, 32), &[1, 2], &[2]);
    let processor: Processor = Arc::new(append);
    node.store.register_processor("append", processor);

    let mut request = incoming_request(&node, 5, SyncMode::FullSync);
    request.operation = Operation::Transform;
    request.payload = UpdatePayload::SingleInvoke {
        key: b("k"),
        processor: ProcessorRef::new("append"),
        invoke_args: vec![b("ab"), b("c")],
    };

    node.cache
        .on_message(NodeId(1), CacheMessage::NearUpdateRequest(request));

    assert_eq!(node.store.get(b"k"), Some(b("abc")));
    match node.transport.take().as_slice() {
        [(_, CacheMessage::UpdateResponse(response))] => {
            let results = response
                .ret
                .as_ref()
                .and_then(|ret| ret.invoke_results())
                .cloned()
                .unwrap_or_default();
            assert_eq!(
                results.get(&b("k")),
                Some(&InvokeOutcome::Value(Some(b("abc"))))
            );
            assert_eq!(response.near_values.len(), 1);
        }
        other => panic!("unexpected messages: {:?}", other),
    }
}

#[tokio::test]
async fn backup_applies_and_acknowledges() {
    let node = TestNode::start(&node_config(3, 32), &[1, 2, 3], &[2, 3]);
    let mut request = ripple::wire::messages::BackupUpdateRequest {
        cache_id: node.cache_id(),
        partition: 0,
        future_id: 11,
        near_future_id: 77,
        near_node: NodeId(1),
        write_version: node.ctx().next_write_version(node.topology.version()),
        topology_version: node.topology.version(),
        sync_mode: SyncMode::FullSync,
        entries: vec![backup_entry("k")],
        mapping: Some(vec![NodeId(3)]),
        ..Default::default()
    };
    request.flags.insert(ripple::wire::messages::BackupFlags::NEAR_REPLY);
    request.set_result(true);

    node.cache
        .on_message(NodeId(2), CacheMessage::BackupUpdateRequest(request));
    assert_eq!(node.store.get(b"k"), Some(b("v")));

    let sent = node.transport.take();
    assert_eq!(sent.len(), 2);
    match &sent[0] {
        (to, CacheMessage::UpdateResponse(ack)) => {
            assert_eq!(*to, NodeId(2));
            assert_eq!(ack.future_id, 11);
        }
        other => panic!("unexpected message: {:?}", other),
    }
    match &sent[1] {
        (to, CacheMessage::BackupNearResponse(notice)) => {
            assert_eq!(*to, NodeId(1));
            assert_eq!(notice.future_id, 77);
            assert_eq!(notice.primary_id, NodeId(2));
            assert_eq!(notice.result(), Some(true));
        }
        other => panic!("unexpected message: {:?}", other),
    }
}

#[tokio::test]
async fn messages_for_another_cache_are_dropped() {
    let node = TestNode::start(&node_config(2, 32), &[1, 2], &[2]);
    let mut request = incoming_request(&node, 5, SyncMode::FullSync);
    request.cache_id = request.cache_id.wrapping_add(1);

    node.cache
        .on_message(NodeId(1), CacheMessage::NearUpdateRequest(request));
    assert!(node.transport.is_empty());
    assert!(node.store.is_empty());
}

// ============================================================================
// Result tests
// ============================================================================

#[test]
fn transform_results_merge_across_partial_returns() {
    let mut first = CacheReturn::success(true);
    first.add_invoke_result(b("a"), InvokeOutcome::Value(Some(b("1"))));
    let mut second = CacheReturn::success(true);
    second.add_invoke_result(b("b"), InvokeOutcome::Error("boom".to_string()));

    let mut left = first.clone();
    left.merge(second.clone());
    let mut right = second;
    right.merge(first);
    assert_eq!(left, right);

    let expected: BTreeMap<Bytes, InvokeOutcome> = [
        (b("a"), InvokeOutcome::Value(Some(b("1")))),
        (b("b"), InvokeOutcome::Error("boom".to_string())),
    ]
    .into_iter()
    .collect();
    assert_eq!(
        UpdateOutcome::from_return(left, Operation::Transform, false, false),
        UpdateOutcome::Transform(expected)
    );
}

#[test]
fn raw_return_is_passed_through() {
    let ret = CacheReturn::previous(Some(b("old")), false);
    assert_eq!(
        UpdateOutcome::from_return(ret.clone(), Operation::Update, true, true),
        UpdateOutcome::Raw(ret)
    );
}
