//! Dispatcher lifecycle: shutdown, non-reentrant cycles, timeouts,
//! partitions and maintenance.

mod common;

use common::{dispatcher, drain, fast_retry, test_config, ScriptedIndex};
use relay_database::AsyncDatabase;
use relay_dispatcher::DispatchError;
use relay_outbox::{EventType, NewOutboxEvent, OutboxStatus, RetryPolicy};
use relay_outbox::OutboxStore;
use std::time::Duration;
use tempfile::tempdir;
use tokio::sync::watch;

fn event(aggregate_type: &str, id: &str) -> NewOutboxEvent {
    NewOutboxEvent::new(aggregate_type, id, EventType::Created, r#"{"title":"x"}"#)
}

#[tokio::test]
async fn shutdown_leaves_unprocessed_events_claimed() {
    let db = AsyncDatabase::open_in_memory().await.unwrap();
    let index = ScriptedIndex::new();
    index.set_delay(Duration::from_millis(150));
    let mut config = test_config("relay-1");
    config.worker_pool_size = 1;
    let relay = dispatcher(db, index.clone(), config, RetryPolicy::default());
    relay.store().append(event("order", "a")).await.unwrap();
    relay.store().append(event("order", "b")).await.unwrap();

    let (tx, rx) = watch::channel(false);
    let cycle = {
        let relay = relay.clone();
        tokio::spawn(async move { relay.run_cycle(&rx).await })
    };
    tokio::time::sleep(Duration::from_millis(40)).await;
    tx.send(true).unwrap();

    let report = cycle.await.unwrap().unwrap();
    assert_eq!(report.claimed, 2);
    // The in-flight write finishes and is recorded; the queued one is not started.
    assert_eq!(report.dispatched, 1);
    assert_eq!(report.left_claimed, 1);

    let stats = relay.store().stats().await.unwrap();
    assert_eq!((stats.dispatched, stats.claimed), (1, 1));

    // The next instance's liveness sweep picks it up.
    tokio::time::sleep(Duration::from_millis(20)).await;
    let requeued = relay
        .store()
        .sweep_expired_claims(Duration::from_millis(10))
        .await
        .unwrap();
    assert_eq!(requeued, 1);
}

#[tokio::test]
async fn run_loop_dispatches_until_shutdown() {
    let db = AsyncDatabase::open_in_memory().await.unwrap();
    let index = ScriptedIndex::new();
    let relay = dispatcher(db, index.clone(), test_config("relay-1"), RetryPolicy::default());

    let (tx, rx) = watch::channel(false);
    let handle = {
        let relay = relay.clone();
        tokio::spawn(async move { relay.run(rx).await })
    };

    relay.store().append(event("order", "a")).await.unwrap();
    relay.store().append(event("order", "b")).await.unwrap();

    let mut dispatched = 0;
    for _ in 0..200 {
        dispatched = relay.store().stats().await.unwrap().dispatched;
        if dispatched == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(dispatched, 2);

    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("dispatcher did not stop")
        .unwrap();
}

#[tokio::test]
async fn overlapping_cycles_are_refused() {
    let db = AsyncDatabase::open_in_memory().await.unwrap();
    let index = ScriptedIndex::new();
    index.set_delay(Duration::from_millis(100));
    let relay = dispatcher(db, index.clone(), test_config("relay-1"), RetryPolicy::default());
    relay.store().append(event("order", "a")).await.unwrap();

    let (_tx, rx) = watch::channel(false);
    let (first, second) = tokio::join!(relay.run_cycle(&rx), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        relay.run_cycle(&rx).await
    });

    assert_eq!(first.unwrap().dispatched, 1);
    assert!(matches!(second, Err(DispatchError::CycleInProgress)));
    // The guard is released once the first cycle ends.
    assert!(relay.run_cycle(&rx).await.unwrap().is_empty());
}

#[tokio::test]
async fn slow_index_write_times_out_as_transient_failure() {
    let db = AsyncDatabase::open_in_memory().await.unwrap();
    let index = ScriptedIndex::new();
    index.set_delay(Duration::from_millis(300));
    let mut config = test_config("relay-1");
    config.apply_timeout = Duration::from_millis(30);
    let relay = dispatcher(db, index.clone(), config, fast_retry(5));
    let appended = relay.store().append(event("order", "a")).await.unwrap();

    let (_tx, rx) = watch::channel(false);
    let report = relay.run_cycle(&rx).await.unwrap();
    assert_eq!((report.failed, report.dispatched), (1, 0));

    let stored = relay.store().get(&appended.event_id).await.unwrap().unwrap();
    assert_eq!(stored.status, OutboxStatus::Failed);
    assert_eq!(stored.retry_count, 1);
    assert!(stored.last_error.unwrap().contains("timed out"));
    assert!(index.inner().writes().is_empty());
}

#[tokio::test]
async fn partitioned_dispatcher_only_claims_its_aggregate_type() {
    let db = AsyncDatabase::open_in_memory().await.unwrap();
    let index = ScriptedIndex::new();
    let mut config = test_config("jobs-relay");
    config.partition = Some("job".to_string());
    let relay = dispatcher(db, index.clone(), config, RetryPolicy::default());

    relay.store().append(event("order", "1")).await.unwrap();
    relay.store().append(event("job", "1")).await.unwrap();
    relay.store().append(event("job", "2")).await.unwrap();

    let report = drain(&relay, 10).await;
    assert_eq!(report.dispatched, 2);
    assert!(index.inner().live_source("job", "1").is_some());
    assert!(index.inner().live_source("order", "1").is_none());
    assert_eq!(relay.store().stats().await.unwrap().pending, 1);
}

#[tokio::test]
async fn maintenance_sweeps_purges_and_advances_checkpoint() {
    let db = AsyncDatabase::open_in_memory().await.unwrap();
    let index = ScriptedIndex::new();
    let mut config = test_config("relay-1");
    config.claim_liveness_timeout = Duration::from_millis(10);
    config.retention = Some(Duration::from_millis(10));
    let relay = dispatcher(db, index.clone(), config, RetryPolicy::default());

    relay.store().append(event("order", "done")).await.unwrap();
    drain(&relay, 10).await;

    let stuck = relay.store().append(event("order", "stuck")).await.unwrap();
    relay
        .store()
        .claim_batch(10, None, 0, "crashed-relay")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    let report = relay.run_maintenance().await.unwrap();
    assert_eq!(report.requeued, 1);
    assert_eq!(report.purged, 1);
    assert_eq!(report.low_water_position, stuck.position);

    let report = drain(&relay, 10).await;
    assert_eq!(report.dispatched, 1);
}

#[tokio::test]
async fn store_failure_aborts_the_cycle() {
    let db = AsyncDatabase::open_in_memory().await.unwrap();
    let index = ScriptedIndex::new();
    let relay = dispatcher(db.clone(), index, test_config("relay-1"), RetryPolicy::default());
    db.close().await.unwrap();

    let (_tx, rx) = watch::channel(false);
    let err = relay.run_cycle(&rx).await.unwrap_err();
    assert!(err.is_infrastructure());
}

#[tokio::test]
async fn long_running_group_keeps_its_claim_across_sweeps() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("outbox.sqlite");
    let index = ScriptedIndex::new();
    index.set_delay(Duration::from_millis(500));

    let writer = OutboxStore::new(AsyncDatabase::open(&path).await.unwrap());
    for event_type in [EventType::Created, EventType::Updated, EventType::Updated] {
        writer
            .append(NewOutboxEvent::new("order", "order-42", event_type, r#"{"price":12}"#))
            .await
            .unwrap();
    }

    // The whole group takes longer than the liveness timeout; each apply does not.
    let mut config_a = test_config("relay-a");
    config_a.apply_timeout = Duration::from_millis(800);
    config_a.claim_liveness_timeout = Duration::from_secs(1);
    let mut config_b = config_a.clone();
    config_b.instance_id = "relay-b".to_string();

    let relay_a = dispatcher(
        AsyncDatabase::open(&path).await.unwrap(),
        index.clone(),
        config_a,
        RetryPolicy::default(),
    );
    let relay_b = dispatcher(
        AsyncDatabase::open(&path).await.unwrap(),
        index.clone(),
        config_b,
        RetryPolicy::default(),
    );

    let (_tx, rx) = watch::channel(false);
    let cycle_a = {
        let relay = relay_a.clone();
        let rx = rx.clone();
        tokio::spawn(async move { relay.run_cycle(&rx).await })
    };

    tokio::time::sleep(Duration::from_millis(1100)).await;
    let maintenance = relay_b.run_maintenance().await.unwrap();
    assert_eq!(maintenance.requeued, 0);
    let report_b = relay_b.run_cycle(&rx).await.unwrap();
    assert_eq!(report_b.claimed, 0);

    let report_a = cycle_a.await.unwrap().unwrap();
    assert_eq!(report_a.claimed, 3);
    assert_eq!(report_a.dispatched, 3);
    assert_eq!(report_a.lost, 0);
    for version in 1..=3 {
        assert_eq!(index.attempts("order-42", version), 1);
    }
}

#[tokio::test]
async fn group_stops_when_its_claim_was_swept() {
    let db = AsyncDatabase::open_in_memory().await.unwrap();
    let index = ScriptedIndex::new();
    index.set_delay(Duration::from_millis(100));
    let mut config = test_config("relay-1");
    config.apply_timeout = Duration::from_millis(500);
    let relay = dispatcher(db, index.clone(), config, RetryPolicy::default());
    relay.store().append(event("order", "a")).await.unwrap();
    relay
        .store()
        .append(NewOutboxEvent::new("order", "a", EventType::Updated, "{}"))
        .await
        .unwrap();

    let (_tx, rx) = watch::channel(false);
    let cycle = {
        let relay = relay.clone();
        tokio::spawn(async move { relay.run_cycle(&rx).await })
    };

    // Another instance sweeps while the first write is in flight.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let swept = relay
        .store()
        .sweep_expired_claims(Duration::from_millis(1))
        .await
        .unwrap();
    assert_eq!(swept, 2);

    let report = cycle.await.unwrap().unwrap();
    assert_eq!(report.dispatched, 0);
    assert_eq!(report.lost, 2);
    // The second event was never handed to the index by the old owner.
    assert_eq!(index.attempts("a", 2), 0);
    assert_eq!(relay.store().stats().await.unwrap().pending, 2);
}
