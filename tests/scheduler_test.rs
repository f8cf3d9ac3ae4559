//! Write scheduler integration tests: debounce coalescing, persistence
//! identity, dependency ordering, and retry behavior against the
//! in-memory store.

mod common;

use common::{fast_engine, fast_engine_with};
use outline_core::db::{MemoryStore, NodeStore, StoreOp};
use outline_core::models::{Node, NodeUpdate};
use outline_core::services::{
    CreateNodeParams, NodeCache, SchedulerConfig, WriteOutcome, WriteRequest, WriteScheduler,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_rapid_edits_coalesce_into_one_create() {
    let (engine, store) = fast_engine();
    let id = engine
        .create_node(CreateNodeParams::new("text", "h"))
        .unwrap();
    for content in ["he", "hel", "hell", "hello"] {
        engine
            .update_node(&id, NodeUpdate::new().with_content(content))
            .unwrap();
    }
    engine.flush().await;

    // Five mutations, one store write carrying the final state
    let counts = store.op_counts();
    assert_eq!(counts.creates, 1);
    assert_eq!(counts.updates, 0);
    assert_eq!(
        store.get_node(&id).await.unwrap().unwrap().content,
        "hello"
    );
}

#[tokio::test]
async fn test_edits_after_persistence_coalesce_into_one_update() {
    let (engine, store) = fast_engine();
    let id = engine
        .create_node(CreateNodeParams::new("text", "v1"))
        .unwrap();
    engine.flush().await;

    for content in ["v2", "v3", "v4"] {
        engine
            .update_node(&id, NodeUpdate::new().with_content(content))
            .unwrap();
    }
    engine.flush().await;

    let counts = store.op_counts();
    assert_eq!(counts.creates, 1);
    assert_eq!(counts.updates, 1);
    assert_eq!(store.get_node(&id).await.unwrap().unwrap().content, "v4");
}

#[tokio::test]
async fn test_node_is_created_exactly_once_across_sessions_of_edits() {
    let (engine, store) = fast_engine();
    let id = engine
        .create_node(CreateNodeParams::new("text", "start"))
        .unwrap();

    // Interleave edits and flushes; identity must settle after the first
    // durable create no matter how the lifecycle cycles
    for round in 0..4 {
        engine
            .update_node(&id, NodeUpdate::new().with_content(format!("round {round}")))
            .unwrap();
        engine.flush().await;
    }

    assert_eq!(store.op_counts().creates, 1);
    assert_eq!(
        store.get_node(&id).await.unwrap().unwrap().content,
        "round 3"
    );
}

#[tokio::test]
async fn test_child_write_waits_for_unpersisted_parent() {
    // Long debounce keeps the parent's create pending while the child's
    // structural write dispatches immediately and must park
    let (engine, store) = fast_engine_with(Duration::from_millis(100));
    let parent = engine
        .create_node(CreateNodeParams::new("text", "parent"))
        .unwrap();
    let child = engine
        .create_node(CreateNodeParams::new("text", "child").under(parent.clone()))
        .unwrap();

    engine.flush().await;

    assert_eq!(store.node_count(), 2);
    let stored_child = store.get_node(&child).await.unwrap().unwrap();
    assert_eq!(stored_child.parent_id.as_deref(), Some(parent.as_str()));
    assert!(store.get_node(&parent).await.unwrap().is_some());
}

#[tokio::test]
async fn test_abandoned_dependency_releases_waiter() {
    let cache = Arc::new(NodeCache::new());
    let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
    let scheduler = WriteScheduler::new(
        cache.clone(),
        store.clone(),
        SchedulerConfig {
            debounce: Duration::from_secs(60),
            ..Default::default()
        },
    );
    cache.wire_sink(scheduler.clone());

    let dep = Node::new("text".to_string(), "doomed".to_string(), None, json!({}));
    let waiter = Node::new("text".to_string(), "waiter".to_string(), None, json!({}));
    let (dep_id, waiter_id) = (dep.id.clone(), waiter.id.clone());
    cache.set(dep, true);
    cache.set(waiter, true);

    let mut outcomes = scheduler.subscribe_outcomes();
    scheduler.submit_request(WriteRequest {
        id: waiter_id.clone(),
        update: NodeUpdate::new().with_content("w2"),
        deps: vec![dep_id.clone()],
        structural: true,
    });
    // Let the dispatch park before the dependency disappears
    tokio::time::sleep(Duration::from_millis(5)).await;
    scheduler.abandon(&dep_id);
    scheduler.flush().await;

    let outcome = outcomes.recv().await.unwrap();
    match outcome {
        WriteOutcome::Abandoned { id, dependency } => {
            assert_eq!(id, waiter_id);
            assert_eq!(dependency, dep_id);
        }
        other => panic!("expected abandonment, got {other:?}"),
    }
    assert_eq!(store.node_count(), 0);
}

#[tokio::test]
async fn test_transient_store_failure_is_retried() {
    let (engine, store) = fast_engine();
    let id = engine
        .create_node(CreateNodeParams::new("text", "v1"))
        .unwrap();
    engine.flush().await;

    store.inject_failures(StoreOp::Update, 1);
    engine
        .update_node(&id, NodeUpdate::new().with_content("v2"))
        .unwrap();
    engine.flush().await;

    assert_eq!(store.get_node(&id).await.unwrap().unwrap().content, "v2");
}

#[tokio::test]
async fn test_version_conflict_retries_with_fresh_version() {
    let (engine, store) = fast_engine();
    let id = engine
        .create_node(CreateNodeParams::new("text", "v1"))
        .unwrap();
    engine.flush().await;

    // Another writer bumps the stored version behind the engine's back
    store
        .update_node(&id, 1, NodeUpdate::new().with_content("external"))
        .await
        .unwrap();

    engine
        .update_node(&id, NodeUpdate::new().with_content("mine"))
        .unwrap();
    engine.flush().await;

    let stored = store.get_node(&id).await.unwrap().unwrap();
    assert_eq!(stored.content, "mine");
    assert_eq!(stored.version, 3);
}

#[tokio::test]
async fn test_update_against_missing_record_falls_back_to_create() {
    let (engine, store) = fast_engine();
    let id = engine
        .create_node(CreateNodeParams::new("text", "v1"))
        .unwrap();
    engine.flush().await;

    // Simulate a store that lost the record after acknowledging the create
    store.drop_record(&id);

    engine
        .update_node(&id, NodeUpdate::new().with_content("v2"))
        .unwrap();
    engine.flush().await;

    let stored = store.get_node(&id).await.unwrap().unwrap();
    assert_eq!(stored.content, "v2");
    assert_eq!(store.op_counts().creates, 2);
}

#[tokio::test]
async fn test_edit_during_flight_is_written_after_completion() {
    let (engine, store) = fast_engine();
    let id = engine
        .create_node(CreateNodeParams::new("text", "v1"))
        .unwrap();
    engine.flush().await;

    // Two injected failures hold the first update in its backoff window
    // long enough for a second edit to land while it is in flight
    store.inject_failures(StoreOp::Update, 2);
    engine
        .update_node(&id, NodeUpdate::new().with_content("v2"))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    engine
        .update_node(&id, NodeUpdate::new().with_content("v3"))
        .unwrap();
    engine.flush().await;

    // The flight finished with v2, then the accumulated edit dispatched
    let counts = store.op_counts();
    assert_eq!(counts.creates, 1);
    assert_eq!(counts.updates, 2);
    assert_eq!(store.get_node(&id).await.unwrap().unwrap().content, "v3");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parked_writes_always_released_across_threads() {
    // Parent completions and child parks race on real threads; every
    // flush must still terminate
    for _ in 0..25 {
        let (engine, store) = fast_engine_with(Duration::from_millis(1));
        let parent = engine
            .create_node(CreateNodeParams::new("text", "parent"))
            .unwrap();
        let child = engine
            .create_node(CreateNodeParams::new("text", "child").under(parent.clone()))
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), engine.flush())
            .await
            .expect("flush hung: a parked write was never released");
        assert_eq!(store.node_count(), 2);
        assert!(store.get_node(&child).await.unwrap().is_some());
    }
}

#[tokio::test]
async fn test_failures_are_isolated_per_node() {
    let (engine, store) = fast_engine();
    let healthy = engine
        .create_node(CreateNodeParams::new("text", "healthy"))
        .unwrap();
    engine.flush().await;

    // Exhaust the retry budget for the next node's create
    store.inject_failures(StoreOp::Create, 10);
    let doomed = engine
        .create_node(CreateNodeParams::new("text", "doomed"))
        .unwrap();
    engine
        .update_node(&healthy, NodeUpdate::new().with_content("still fine"))
        .unwrap();
    engine.flush().await;

    assert!(store.get_node(&doomed).await.unwrap().is_none());
    assert_eq!(
        store.get_node(&healthy).await.unwrap().unwrap().content,
        "still fine"
    );
}
