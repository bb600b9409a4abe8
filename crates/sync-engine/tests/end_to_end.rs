//! Orders scenario against the in-process change feed.

use local_cache::FileBackend;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use sync_engine::{
    ChangeEvent, ChangeFeedPayload, EngineConfig, LocalCache, MemoryTransport, Record, RecordId,
    Snapshot, SubscriptionEvent, SubscriptionState, SubscriptionStatus, SyncEngine, SyncError,
    WatchHandle, WatchOptions,
};

fn order(id: &str, total: i64) -> Record {
    Record::new(id).with_field("total", json!(total))
}

fn engine_with(cache: LocalCache) -> (SyncEngine, MemoryTransport) {
    let transport = MemoryTransport::new();
    let engine = SyncEngine::new(EngineConfig::default(), cache, Arc::new(transport.clone()));
    (engine, transport)
}

fn fast_retries() -> WatchOptions {
    WatchOptions::default()
        .with_max_retries(3)
        .with_initial_retry_delay(Duration::from_millis(500))
}

async fn wait_for_state(handle: &WatchHandle, state: SubscriptionState) -> SubscriptionStatus {
    let mut statuses = handle.statuses();
    let status = statuses
        .wait_for(|status| status.state == state)
        .await
        .expect("subscription stopped")
        .clone();
    status
}

async fn wait_for_snapshot<F>(handle: &WatchHandle, mut predicate: F) -> Snapshot
where
    F: FnMut(&Snapshot) -> bool,
{
    let mut snapshots = handle.snapshots();
    let snapshot = snapshots
        .wait_for(|snapshot| predicate(snapshot))
        .await
        .expect("subscription stopped")
        .clone();
    snapshot
}

#[tokio::test(start_paused = true)]
async fn orders_insert_update_delete_then_transport_failure() {
    let cache = LocalCache::in_memory();
    let (engine, transport) = engine_with(cache.clone());
    let orders = engine.watch("orders", None, fast_retries()).unwrap();
    wait_for_state(&orders, SubscriptionState::Subscribed).await;

    transport.push("orders", ChangeFeedPayload::insert("orders", &order("1", 10)));
    wait_for_snapshot(&orders, |s| s.len() == 1).await;
    assert_eq!(cache.get("orders"), Some(json!([{"id": "1", "total": 10}])));

    transport.push("orders", ChangeFeedPayload::update("orders", &order("1", 25)));
    wait_for_snapshot(&orders, |s| {
        s.get(&RecordId::new("1"))
            .and_then(|r| r.get("total"))
            .is_some_and(|total| total == &json!(25))
    })
    .await;
    assert_eq!(cache.get("orders"), Some(json!([{"id": "1", "total": 25}])));

    transport.push("orders", ChangeFeedPayload::delete("orders", &RecordId::new("1")));
    wait_for_snapshot(&orders, |s| s.is_empty()).await;
    assert_eq!(cache.get("orders"), Some(json!([])));

    transport.disconnect("orders");
    let status = wait_for_state(&orders, SubscriptionState::Reconnecting).await;
    assert_eq!(status.attempt, 1);
    assert!(status.is_stale());

    let status = wait_for_state(&orders, SubscriptionState::Subscribed).await;
    assert_eq!(status.attempt, 0);
    assert_eq!(orders.last_error(), None);

    engine.shutdown().await;
}

#[tokio::test]
async fn duplicate_and_unknown_changes_are_idempotent() {
    let (engine, transport) = engine_with(LocalCache::in_memory());
    let orders = engine
        .watch("orders", None, WatchOptions::default().notify_on_change())
        .unwrap();
    let mut events = orders.events();
    wait_for_state(&orders, SubscriptionState::Subscribed).await;

    transport.push("orders", ChangeFeedPayload::insert("orders", &order("1", 10)));
    transport.push("orders", ChangeFeedPayload::insert("orders", &order("1", 99)));
    transport.push("orders", ChangeFeedPayload::update("orders", &order("404", 1)));
    transport.push("orders", ChangeFeedPayload::delete("orders", &RecordId::new("404")));
    transport.push("orders", ChangeFeedPayload::insert("orders", &order("2", 20)));

    let snapshot = wait_for_snapshot(&orders, |s| s.len() == 2).await;
    assert_eq!(
        snapshot.to_value(),
        json!([{"id": "1", "total": 10}, {"id": "2", "total": 20}])
    );

    // Only the two effective inserts are announced
    let mut changed = Vec::new();
    while changed.len() < 2 {
        if let SubscriptionEvent::Changed { record_id, .. } = events.recv().await.unwrap() {
            changed.push(record_id);
        }
    }
    assert_eq!(changed, vec![RecordId::new("1"), RecordId::new("2")]);
}

#[tokio::test]
async fn cached_snapshot_survives_engine_restart() {
    let dir = tempfile::tempdir().unwrap();
    let open_cache = || LocalCache::new(Arc::new(FileBackend::open(dir.path()).unwrap()));

    {
        let (engine, transport) = engine_with(open_cache());
        let orders = engine.watch("orders", None, WatchOptions::default()).unwrap();
        wait_for_state(&orders, SubscriptionState::Subscribed).await;
        transport.push("orders", ChangeFeedPayload::insert("orders", &order("1", 10)));
        wait_for_snapshot(&orders, |s| s.len() == 1).await;
        engine.shutdown().await;
    }

    let (engine, _) = engine_with(open_cache());
    let seed = Snapshot::from_records(vec![order("seed", 0)]);
    let orders = engine.watch("orders", Some(seed), WatchOptions::default()).unwrap();
    assert_eq!(orders.snapshot().to_value(), json!([{"id": "1", "total": 10}]));
    assert!(orders.status().has_data);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_surface_as_failed() {
    let (engine, transport) = engine_with(LocalCache::in_memory());
    transport.fail_subscribes("orders", 10);
    let orders = engine.watch("orders", None, fast_retries()).unwrap();

    let status = wait_for_state(&orders, SubscriptionState::Failed).await;
    assert_eq!(
        status.last_error,
        Some(SyncError::ExhaustedRetries { attempts: 3 })
    );
    assert!(!status.is_loading);

    // Manual recovery starts a fresh sequence
    transport.fail_subscribes("orders", 0);
    orders.resubscribe().await;
    wait_for_state(&orders, SubscriptionState::Subscribed).await;
}

#[tokio::test(start_paused = true)]
async fn offline_suspends_retries_until_online() {
    let (engine, transport) = engine_with(LocalCache::in_memory());
    let orders = engine.watch("orders", None, fast_retries()).unwrap();
    wait_for_state(&orders, SubscriptionState::Subscribed).await;

    engine.set_online(false);
    wait_for_state(&orders, SubscriptionState::Reconnecting).await;

    // No retries are scheduled while offline
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(transport.subscribe_calls("orders"), 1);
    assert_eq!(orders.state(), SubscriptionState::Reconnecting);

    engine.set_online(true);
    wait_for_state(&orders, SubscriptionState::Subscribed).await;
    assert_eq!(transport.subscribe_calls("orders"), 2);
}

#[tokio::test]
async fn optimistic_write_reaches_other_watchers_through_the_cache() {
    let cache = LocalCache::in_memory();
    let (engine, _) = engine_with(cache.clone());
    let (other_engine, _) = engine_with(cache);

    let mine = engine.watch("orders", None, WatchOptions::default()).unwrap();
    let theirs = other_engine
        .watch("orders", None, WatchOptions::default())
        .unwrap();
    wait_for_state(&theirs, SubscriptionState::Subscribed).await;

    mine.apply_optimistic(ChangeEvent::insert(order("7", 70)))
        .await
        .unwrap();
    let snapshot = wait_for_snapshot(&theirs, |s| s.len() == 1).await;
    assert!(snapshot.contains(&RecordId::new("7")));
}

#[tokio::test]
async fn consumer_scope_teardown_cancels_operations() {
    let (engine, _) = engine_with(LocalCache::in_memory());
    let scope = engine.scope();
    let session = scope.new_token("check-session");
    let auth = scope.new_token("authenticate");

    assert!(engine.is_live(&session));
    drop(scope);
    assert!(!engine.is_live(&session));
    assert!(!engine.is_live(&auth));
    assert!(session.is_cancelled());
}
