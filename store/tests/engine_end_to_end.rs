//! End-to-end exercises of the fully wired `Engine`, driven the way a
//! front-end would: build a node over a fresh in-memory backend and the
//! single-node `LocalRaftGlue` stand-in, then drive its public operations.

use std::{sync::Arc, time::Duration};

use engine::MemoryEngine;
use store::{
    raft_glue::LocalRaftGlue,
    rpc::{
        compare::TargetUnion, request_op, Compare, CompareResult, CompareTarget,
        DeleteRangeRequest, EventType, LeaseGrantRequest, PutRequest, RangeRequest, RequestOp,
        TxnRequest, WatchCreateRequest,
    },
    storage::db::TABLES,
    Engine,
};
use utils::config::EngineConfig;

fn wire_up() -> Engine<MemoryEngine, LocalRaftGlue> {
    let storage = Arc::new(MemoryEngine::new(TABLES));
    let (glue, committed_rx) = LocalRaftGlue::new(1, 64);
    Engine::new(1, 1, storage, Arc::new(glue), committed_rx, EngineConfig::default())
        .expect("fresh store recovers cleanly")
}

fn range_req(key: &[u8]) -> RangeRequest {
    RangeRequest {
        key: key.to_vec(),
        range_end: Vec::new(),
        limit: 0,
        revision: 0,
        sort_order: 0,
        sort_target: 0,
        count_only: false,
        keys_only: false,
    }
}

fn put_req(key: &[u8], value: &[u8]) -> PutRequest {
    PutRequest {
        key: key.to_vec(),
        value: value.to_vec(),
        lease: 0,
        prev_kv: false,
        ignore_value: false,
        ignore_lease: false,
    }
}

#[tokio::test]
async fn put_then_get_round_trips_a_value() {
    let engine = wire_up();
    engine.put(put_req(b"greeting", b"hello")).await.unwrap();

    let resp = engine.range(range_req(b"greeting")).await.unwrap();
    assert_eq!(resp.kvs.len(), 1);
    assert_eq!(resp.kvs[0].value, b"hello");
    assert_eq!(resp.kvs[0].version, 1);
    assert_eq!(resp.kvs[0].create_revision, resp.kvs[0].mod_revision);
}

#[tokio::test]
async fn a_deleted_key_can_be_recreated_with_a_fresh_create_revision() {
    let engine = wire_up();
    engine.put(put_req(b"k", b"v1")).await.unwrap();
    let first = engine.range(range_req(b"k")).await.unwrap();
    let first_create_revision = first.kvs[0].create_revision;

    engine
        .delete_range(DeleteRangeRequest {
            key: b"k".to_vec(),
            range_end: Vec::new(),
            prev_kv: false,
        })
        .await
        .unwrap();
    let gone = engine.range(range_req(b"k")).await.unwrap();
    assert!(gone.kvs.is_empty());

    engine.put(put_req(b"k", b"v2")).await.unwrap();
    let recreated = engine.range(range_req(b"k")).await.unwrap();
    assert_eq!(recreated.kvs.len(), 1);
    assert_eq!(recreated.kvs[0].value, b"v2");
    assert_eq!(recreated.kvs[0].version, 1);
    assert!(recreated.kvs[0].create_revision > first_create_revision);
}

#[tokio::test]
async fn a_txn_only_applies_its_success_branch_when_the_compare_holds() {
    let engine = wire_up();
    engine.put(put_req(b"counter", b"1")).await.unwrap();
    let before = engine.range(range_req(b"counter")).await.unwrap();
    let mod_revision = before.kvs[0].mod_revision;

    // CAS: if counter's mod_revision is still what we last observed, bump it.
    let resp = engine
        .txn(TxnRequest {
            compare: vec![Compare {
                result: CompareResult::Equal as i32,
                target: CompareTarget::Mod as i32,
                key: b"counter".to_vec(),
                range_end: Vec::new(),
                target_union: Some(TargetUnion::ModRevision(mod_revision)),
            }],
            success: vec![RequestOp {
                request: Some(request_op::Request::RequestPut(put_req(b"counter", b"2"))),
            }],
            failure: vec![RequestOp {
                request: Some(request_op::Request::RequestRange(range_req(b"counter"))),
            }],
        })
        .await
        .unwrap();
    assert!(resp.succeeded);

    let after = engine.range(range_req(b"counter")).await.unwrap();
    assert_eq!(after.kvs[0].value, b"2");

    // Retrying the same CAS against the now-stale mod_revision must fail
    // and fall through to the failure branch instead.
    let retried = engine
        .txn(TxnRequest {
            compare: vec![Compare {
                result: CompareResult::Equal as i32,
                target: CompareTarget::Mod as i32,
                key: b"counter".to_vec(),
                range_end: Vec::new(),
                target_union: Some(TargetUnion::ModRevision(mod_revision)),
            }],
            success: vec![RequestOp {
                request: Some(request_op::Request::RequestPut(put_req(b"counter", b"3"))),
            }],
            failure: vec![RequestOp {
                request: Some(request_op::Request::RequestRange(range_req(b"counter"))),
            }],
        })
        .await
        .unwrap();
    assert!(!retried.succeeded);
    let untouched = engine.range(range_req(b"counter")).await.unwrap();
    assert_eq!(untouched.kvs[0].value, b"2");
}

#[tokio::test]
async fn a_lease_bound_key_is_deleted_and_its_watcher_notified_on_expiry() {
    let engine = wire_up();
    let grant = engine
        .lease_grant(LeaseGrantRequest { ttl: 0, id: 0 })
        .await
        .unwrap();

    let (_watch_id, mut watch_rx) = engine
        .watch(WatchCreateRequest {
            key: b"session".to_vec(),
            range_end: Vec::new(),
            start_revision: 0,
            progress_notify: false,
            filters: Vec::new(),
            prev_kv: false,
            watch_id: 0,
            fragment: false,
        })
        .unwrap();
    let _created = watch_rx.recv().await.unwrap();

    engine
        .put(PutRequest {
            key: b"session".to_vec(),
            value: b"token".to_vec(),
            lease: grant.id,
            prev_kv: false,
            ignore_value: false,
            ignore_lease: false,
        })
        .await
        .unwrap();
    let put_event = tokio::time::timeout(Duration::from_secs(1), watch_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(put_event.events[0].r#type, EventType::Put as i32);

    let delete_event = tokio::time::timeout(Duration::from_secs(3), watch_rx.recv())
        .await
        .expect("lease expiry should delete the bound key")
        .unwrap();
    assert_eq!(delete_event.events[0].r#type, EventType::Delete as i32);

    let after = engine.range(range_req(b"session")).await.unwrap();
    assert!(after.kvs.is_empty());
}

#[tokio::test]
async fn a_historical_watch_synthesizes_a_put_for_every_currently_live_key_in_range() {
    let engine = wire_up();
    engine.put(put_req(b"alpha", b"1")).await.unwrap();
    engine.put(put_req(b"beta", b"2")).await.unwrap();
    let after_puts = engine.range(range_req(b"alpha")).await.unwrap();
    let revision_so_far = after_puts.kvs[0].mod_revision;

    let (_watch_id, mut watch_rx) = engine
        .watch(WatchCreateRequest {
            key: b"alpha".to_vec(),
            range_end: b"gamma".to_vec(),
            start_revision: revision_so_far,
            progress_notify: false,
            filters: Vec::new(),
            prev_kv: false,
            watch_id: 0,
            fragment: false,
        })
        .unwrap();

    let created = watch_rx.recv().await.unwrap();
    assert!(created.created);

    let catch_up = tokio::time::timeout(Duration::from_secs(1), watch_rx.recv())
        .await
        .unwrap()
        .unwrap();
    let mut keys: Vec<_> = catch_up
        .events
        .iter()
        .map(|e| e.kv.as_ref().unwrap().key.clone())
        .collect();
    keys.sort();
    assert_eq!(keys, vec![b"alpha".to_vec(), b"beta".to_vec()]);
    assert!(catch_up
        .events
        .iter()
        .all(|e| e.r#type == EventType::Put as i32));

    engine.put(put_req(b"alpha", b"3")).await.unwrap();
    let live_update = tokio::time::timeout(Duration::from_secs(1), watch_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(live_update.events[0].kv.as_ref().unwrap().value, b"3");
}

#[tokio::test]
async fn compact_rejects_a_revision_that_is_already_compacted() {
    let engine = wire_up();
    engine.put(put_req(b"k1", b"v1")).await.unwrap();
    let after_first = engine.range(range_req(b"k1")).await.unwrap();
    let first_revision = after_first.kvs[0].mod_revision;
    engine.put(put_req(b"k2", b"v2")).await.unwrap();

    engine.compact(first_revision).unwrap();

    let retry = engine.compact(first_revision);
    assert!(retry.is_err());

    let stale_read = engine
        .range(RangeRequest {
            revision: first_revision,
            ..range_req(b"k1")
        })
        .await;
    assert!(stale_read.is_err());
}
