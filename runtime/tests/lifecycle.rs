//! Integration tests for the pool manager lifecycle and mirror behaviour
//!
//! Each test wires a `PoolManager` to the in-memory stores the way a client session
//! would, then checks what the mirror, the sink and the stores end up showing.

use droppool_core::ids::PoolItemId;
use droppool_core::pool_store::PoolChange;
use droppool_runtime::{
    GcOutcome, PoolConfig, PoolEnvironment, PoolError, PoolManager, RetainReason, RetryPolicy,
};
use droppool_testing::fixtures::{new_item, pool_item, product, target_order};
use droppool_testing::{
    InMemoryHoldStore, InMemoryPoolStore, ManualTimer, RecordingNotifier, RecordingSink,
    run_pending_tasks, test_clock,
};
use std::sync::Arc;
use std::time::Duration;

struct Session {
    pool: InMemoryPoolStore,
    holds: InMemoryHoldStore,
    sink: Arc<RecordingSink>,
    notifier: Arc<RecordingNotifier>,
    manager: PoolManager,
}

fn session_with(timer: Option<ManualTimer>, config: PoolConfig) -> Session {
    let pool = InMemoryPoolStore::new();
    let holds = InMemoryHoldStore::new();
    let sink = Arc::new(RecordingSink::new());
    let notifier = Arc::new(RecordingNotifier::new());
    let mut env = PoolEnvironment::new(
        Arc::new(pool.clone()),
        Arc::new(holds.clone()),
        sink.clone(),
        notifier.clone(),
    )
    .with_clock(Arc::new(test_clock()));
    if let Some(timer) = timer {
        env = env.with_timer(Arc::new(timer));
    }
    Session {
        pool,
        holds,
        sink,
        notifier,
        manager: PoolManager::new(env, config),
    }
}

fn session(timer: &ManualTimer) -> Session {
    session_with(
        Some(timer.clone()),
        PoolConfig::default().with_subscribe_retry(RetryPolicy::no_retry()),
    )
}

#[tokio::test]
async fn unavailable_store_fails_init() {
    let timer = ManualTimer::new();
    let s = session(&timer);
    s.pool.faults().set_unavailable(true);

    let result = s.manager.init().await;

    assert!(matches!(result, Err(PoolError::StoreUnavailable(_))));
    assert!(!s.manager.is_initialized().await);
    assert_eq!(s.pool.subscriber_count(), 0);
    assert_eq!(s.notifier.errors().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn init_retries_until_the_store_comes_back() {
    let s = session_with(
        None,
        PoolConfig::default().with_subscribe_retry(
            RetryPolicy::builder()
                .max_retries(3)
                .initial_delay(Duration::from_millis(100))
                .build(),
        ),
    );
    s.pool.faults().set_unavailable(true);

    let pool = s.pool.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.faults().set_unavailable(false);
    });

    s.manager.init().await.unwrap();

    assert!(s.manager.is_initialized().await);
    assert_eq!(s.pool.subscriber_count(), 1);
    assert!(s.notifier.errors().is_empty());
}

#[tokio::test]
async fn teardown_unsubscribes_and_clears_the_mirror() {
    let timer = ManualTimer::new();
    let s = session(&timer);
    s.pool.seed(new_item("p-1", 2));

    s.manager.init().await.unwrap();
    run_pending_tasks().await;
    assert_eq!(s.pool.subscriber_count(), 1);
    assert_eq!(s.manager.snapshot().await.len(), 1);

    s.manager.teardown().await;
    run_pending_tasks().await;

    assert_eq!(s.pool.subscriber_count(), 0);
    assert!(s.manager.snapshot().await.is_empty());
    assert!(!s.manager.is_initial_sync_settled().await);
    assert_eq!(timer.pending(), 0);
    assert_eq!(
        s.manager.add_item(product("p-2"), 1, "damaged box").await,
        Err(PoolError::NotInitialized)
    );
}

#[tokio::test]
async fn manager_can_be_initialized_again_after_teardown() {
    let timer = ManualTimer::new();
    let s = session(&timer);
    s.pool.seed(new_item("p-1", 2));

    s.manager.init().await.unwrap();
    s.manager.teardown().await;
    s.manager.init().await.unwrap();
    run_pending_tasks().await;

    assert_eq!(s.pool.subscriber_count(), 1);
    assert_eq!(s.manager.snapshot().await.len(), 1);
}

#[tokio::test]
async fn replayed_initial_sync_does_not_duplicate_entries() {
    let timer = ManualTimer::new();
    let s = session(&timer);
    s.pool.seed(new_item("p-1", 2));
    s.pool.seed(new_item("p-2", 4));
    s.pool.replay_initial_sync(true);

    s.manager.init().await.unwrap();
    run_pending_tasks().await;

    let snapshot = s.manager.snapshot().await;
    assert_eq!(snapshot.len(), 2);
    assert_eq!(snapshot.iter().map(|item| item.quantity).sum::<u32>(), 6);
}

#[tokio::test]
async fn stale_events_leave_the_mirror_alone() {
    let timer = ManualTimer::new();
    let s = session(&timer);
    let id = s.pool.seed(new_item("p-1", 2));
    s.manager.init().await.unwrap();
    run_pending_tasks().await;

    s.pool.emit_raw(PoolChange::Changed(pool_item("ghost", "p-9", 7)));
    s.pool.emit_raw(PoolChange::Removed(PoolItemId::new("never-added")));
    run_pending_tasks().await;

    let snapshot = s.manager.snapshot().await;
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].id, id);
}

#[tokio::test]
async fn mirror_recovers_after_the_feed_lags() {
    let timer = ManualTimer::new();
    let s = session(&timer);
    s.manager.init().await.unwrap();

    // More changes than the feed buffers, with no chance for the consumer to run.
    for n in 0..1100 {
        s.pool.seed(new_item(&format!("p-{n}"), 1));
    }
    for _ in 0..500 {
        run_pending_tasks().await;
        if s.manager.snapshot().await.len() == s.pool.len() {
            break;
        }
    }

    let snapshot = s.manager.snapshot().await;
    assert_eq!(snapshot.len(), 1100);
    assert_eq!(snapshot.len(), s.pool.len());
    assert_eq!(s.pool.subscriber_count(), 1);

    s.pool.seed(new_item("p-late", 2));
    run_pending_tasks().await;
    assert_eq!(s.manager.snapshot().await.len(), 1101);
}

#[tokio::test]
async fn confirmed_changes_reach_the_mirror() {
    let timer = ManualTimer::new();
    let s = session(&timer);
    s.manager.init().await.unwrap();

    let id = s.manager.add_item(product("p-1"), 2, "short expiry").await.unwrap();
    run_pending_tasks().await;
    s.manager
        .adjust_quantity(&id, droppool_runtime::QuantityAdjustment::Set(6))
        .await
        .unwrap();
    run_pending_tasks().await;

    let snapshot = s.manager.snapshot().await;
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].quantity, 6);

    s.manager.remove_item(&id).await.unwrap();
    run_pending_tasks().await;
    assert!(s.manager.snapshot().await.is_empty());
}

#[tokio::test]
async fn burst_of_ten_events_in_fifty_ms_refreshes_once() {
    let timer = ManualTimer::new();
    let s = session(&timer);
    s.manager.init().await.unwrap();

    for n in 0..10 {
        s.pool.seed(new_item(&format!("p-{n}"), 1));
        run_pending_tasks().await;
        timer.advance(Duration::from_millis(5));
    }
    timer.advance(Duration::from_millis(150));
    run_pending_tasks().await;

    assert_eq!(s.sink.count(), 1);
    let view = s.sink.last().unwrap();
    assert_eq!(view.items.len(), 10);
    assert_eq!(view.free_units(), 10);
}

#[tokio::test(start_paused = true)]
async fn real_time_burst_refreshes_once() {
    let s = session_with(
        None,
        PoolConfig::default().with_subscribe_retry(RetryPolicy::no_retry()),
    );
    s.manager.init().await.unwrap();

    for n in 0..10 {
        s.pool.seed(new_item(&format!("p-{n}"), 1));
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_eq!(s.sink.count(), 1);
    assert_eq!(s.manager.refresh_count(), 1);
}

#[tokio::test]
async fn released_hold_lets_the_empty_record_go() {
    let timer = ManualTimer::new();
    let s = session(&timer);
    let id = s.pool.seed(new_item("p-1", 1));
    s.manager.init().await.unwrap();
    run_pending_tasks().await;

    let order = target_order("o-1", "u-1", "Ana");
    let receipt = s.manager.transfer_to_order(&id, &order).await.unwrap();
    assert_eq!(receipt.remaining, 0);
    assert_eq!(receipt.gc, Some(GcOutcome::Retained(RetainReason::StillHeld)));
    assert!(s.pool.contains(&id));
    run_pending_tasks().await;

    let outcomes = s.manager.release_hold(&receipt.hold_key).await.unwrap();

    assert_eq!(outcomes, vec![GcOutcome::Deleted]);
    assert!(!s.pool.contains(&id));
    assert!(s.holds.is_empty());
}

#[tokio::test]
async fn holders_are_listed_per_order() {
    let timer = ManualTimer::new();
    let s = session(&timer);
    let id = s.pool.seed(new_item("p-1", 5));
    s.manager.init().await.unwrap();

    let ana = target_order("o-1", "u-1", "Ana");
    let ben = target_order("o-2", "u-2", "Ben");
    s.manager.transfer_to_order(&id, &ana).await.unwrap();
    s.manager.transfer_to_order(&id, &ana).await.unwrap();
    s.manager.transfer_to_order(&id, &ben).await.unwrap();

    let holders = s.manager.get_holders(&"p-1".into()).await.unwrap();
    assert_eq!(holders.len(), 2);
    assert_eq!(holders.iter().map(|h| h.quantity).sum::<u32>(), 3);
    assert!(s.manager.is_still_held(&"p-1".into()).await.unwrap());
    assert_eq!(s.pool.quantity_of(&id), Some(2));
}
