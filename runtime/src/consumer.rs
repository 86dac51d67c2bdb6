//! The imperative shell around the mirror reducer.
//!
//! [`MirrorConsumer`] drains the pool change feed, runs each change through
//! [`MirrorReducer`] and executes the effects it returns: anomalies are logged and
//! counted, refresh requests go to the [`DebounceScheduler`]. Nothing here renders.
//! Rendering happens later in [`RefreshJob`], when the scheduler's quiet window elapses.
//!
//! A feed that reports dropped events can no longer be trusted incrementally, so the
//! consumer opens a fresh subscription and rebuilds the mirror from its replay.

use crate::ledger::LedgerScanner;
use crate::metrics::MirrorMetrics;
use crate::retry::{RetryPolicy, retry_with_predicate};
use crate::scheduler::DebounceScheduler;
use droppool_core::effect::Effect;
use droppool_core::environment::{PoolItemView, PoolView, RefreshSink, Timer};
use droppool_core::mirror::{MirrorAction, MirrorAnomaly, MirrorReducer, MirrorState};
use droppool_core::pool_store::{ChangeStream, PoolChange, PoolStore, PoolStoreError};
use droppool_core::reducer::Reducer;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Applies change events to the shared mirror.
pub struct MirrorConsumer {
    mirror: Arc<RwLock<MirrorState>>,
    scheduler: Arc<DebounceScheduler>,
    store: Arc<dyn PoolStore>,
    timer: Arc<dyn Timer>,
    resubscribe_retry: RetryPolicy,
    reducer: MirrorReducer,
}

impl MirrorConsumer {
    /// Consumer writing into `mirror` and asking `scheduler` for refreshes.
    ///
    /// `store` is resubscribed through `resubscribe_retry` when the feed lags.
    #[must_use]
    pub fn new(
        mirror: Arc<RwLock<MirrorState>>,
        scheduler: Arc<DebounceScheduler>,
        store: Arc<dyn PoolStore>,
        timer: Arc<dyn Timer>,
        resubscribe_retry: RetryPolicy,
    ) -> Self {
        Self {
            mirror,
            scheduler,
            store,
            timer,
            resubscribe_retry,
            reducer: MirrorReducer::new(),
        }
    }

    /// Drain `stream` until it ends.
    ///
    /// On [`PoolStoreError::Lagged`] the stream is replaced by a fresh subscription and
    /// the mirror is cleared ahead of its replay. If resubscribing fails the consumer
    /// stops. Other feed errors are logged and counted; consumption carries on.
    pub async fn run(self: Arc<Self>, mut stream: ChangeStream) {
        while let Some(next) = stream.next().await {
            match next {
                Ok(change) => self.apply(change).await,
                Err(PoolStoreError::Lagged(skipped)) => {
                    MirrorMetrics::record_stream_error();
                    tracing::warn!(skipped, "Change feed lagged, resubscribing");
                    match self.resubscribe().await {
                        Ok(fresh) => {
                            stream = fresh;
                            self.dispatch(MirrorAction::Resync).await;
                        },
                        Err(err) => {
                            tracing::error!(
                                error = %err,
                                "Resubscribe failed, mirror consumer stopping"
                            );
                            return;
                        },
                    }
                },
                Err(err) => {
                    MirrorMetrics::record_stream_error();
                    tracing::error!(error = %err, "Change feed delivered an error");
                },
            }
        }
        tracing::info!("Change feed ended, mirror consumer stopping");
    }

    async fn resubscribe(&self) -> Result<ChangeStream, PoolStoreError> {
        retry_with_predicate(
            &self.resubscribe_retry,
            self.timer.as_ref(),
            || self.store.subscribe(),
            PoolStoreError::is_transient,
        )
        .await
    }

    /// Apply one change event.
    pub async fn apply(&self, change: PoolChange) {
        let kind = change.kind();
        let item_id = change.id().clone();
        let settled = self.dispatch(MirrorAction::Apply(change)).await;

        MirrorMetrics::record_event(kind);
        if settled {
            tracing::debug!(item_id = %item_id, kind, "Mirror updated");
        } else {
            tracing::trace!(item_id = %item_id, kind, "Mirror updated during initial sync");
        }
    }

    /// Run one action through the reducer and execute its effects.
    ///
    /// Returns whether the initial sync had settled when the action was applied.
    pub async fn dispatch(&self, action: MirrorAction) -> bool {
        let (effects, settled) = {
            let mut state = self.mirror.write().await;
            let effects = self.reducer.reduce(&mut state, action, &());
            (effects, state.is_initial_sync_settled())
        };

        for effect in effects {
            self.execute(effect);
        }
        settled
    }

    fn execute(&self, effect: Effect) {
        match effect {
            Effect::None => {},
            Effect::ScheduleRefresh => self.scheduler.trigger(),
            Effect::Anomaly(anomaly) => Self::report(&anomaly),
        }
    }

    fn report(anomaly: &MirrorAnomaly) {
        MirrorMetrics::record_anomaly();
        if anomaly.is_warning() {
            tracing::warn!(item_id = %anomaly.id(), "{anomaly}");
        } else {
            tracing::debug!(item_id = %anomaly.id(), "{anomaly}");
        }
    }
}

/// The coalesced refresh: snapshot the mirror, count holders, hand the view to the sink.
pub struct RefreshJob {
    mirror: Arc<RwLock<MirrorState>>,
    scanner: LedgerScanner,
    sink: Arc<dyn RefreshSink>,
    holder_counts: bool,
}

impl RefreshJob {
    /// Job reading `mirror` and delivering to `sink`.
    #[must_use]
    pub fn new(
        mirror: Arc<RwLock<MirrorState>>,
        scanner: LedgerScanner,
        sink: Arc<dyn RefreshSink>,
        holder_counts: bool,
    ) -> Self {
        Self {
            mirror,
            scanner,
            sink,
            holder_counts,
        }
    }

    /// Build the current view and deliver it.
    ///
    /// A failed holder scan leaves that item's holder list empty; the refresh itself
    /// still goes out.
    pub async fn run(&self) {
        let items = self.mirror.read().await.items().to_vec();

        let mut views = Vec::with_capacity(items.len());
        for item in items {
            let holders = if self.holder_counts {
                self.scanner
                    .get_holders(&item.product_id)
                    .await
                    .unwrap_or_else(|err| {
                        tracing::warn!(
                            product_id = %item.product_id,
                            error = %err,
                            "Holder recount failed"
                        );
                        Vec::new()
                    })
            } else {
                Vec::new()
            };
            views.push(PoolItemView { item, holders });
        }

        let view = PoolView { items: views };
        tracing::debug!(
            items = view.items.len(),
            free = view.free_units(),
            held = view.held_units(),
            "Refreshing pool view"
        );
        self.sink.refresh(view);
        MirrorMetrics::record_refresh();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TokioTimer;
    use droppool_core::environment::Clock;
    use droppool_core::ids::PoolItemId;
    use droppool_testing::fixtures::{new_item, pool_item, target_order};
    use droppool_testing::{
        InMemoryHoldStore, InMemoryPoolStore, ManualTimer, RecordingSink, run_pending_tasks,
        test_clock,
    };
    use futures::FutureExt;
    use std::time::Duration;

    fn idle_scheduler() -> Arc<DebounceScheduler> {
        Arc::new(DebounceScheduler::new(
            Duration::from_millis(150),
            Arc::new(ManualTimer::new()),
            Arc::new(|| async {}.boxed()),
        ))
    }

    fn consumer_on(
        store: &InMemoryPoolStore,
        mirror: &Arc<RwLock<MirrorState>>,
        scheduler: Arc<DebounceScheduler>,
    ) -> MirrorConsumer {
        MirrorConsumer::new(
            Arc::clone(mirror),
            scheduler,
            Arc::new(store.clone()),
            Arc::new(ManualTimer::new()),
            RetryPolicy::no_retry(),
        )
    }

    fn consumer(
        mirror: &Arc<RwLock<MirrorState>>,
        scheduler: Arc<DebounceScheduler>,
    ) -> MirrorConsumer {
        consumer_on(&InMemoryPoolStore::new(), mirror, scheduler)
    }

    #[tokio::test]
    async fn events_update_the_mirror_and_request_one_refresh() {
        let mirror = Arc::new(RwLock::new(MirrorState::new()));
        let scheduler = idle_scheduler();
        let consumer = consumer(&mirror, Arc::clone(&scheduler));

        consumer.apply(PoolChange::Added(pool_item("a", "p-1", 3))).await;
        consumer.apply(PoolChange::Added(pool_item("b", "p-2", 1))).await;
        consumer.apply(PoolChange::Removed(PoolItemId::new("a"))).await;

        let state = mirror.read().await;
        assert_eq!(state.len(), 1);
        assert_eq!(state.items()[0].id, PoolItemId::new("b"));
        assert!(scheduler.is_pending());
        assert_eq!(scheduler.fire_count(), 0);
    }

    #[tokio::test]
    async fn stale_events_are_ignored() {
        let mirror = Arc::new(RwLock::new(MirrorState::new()));
        let consumer = consumer(&mirror, idle_scheduler());

        consumer.apply(PoolChange::Changed(pool_item("x", "p-1", 3))).await;
        consumer.apply(PoolChange::Removed(PoolItemId::new("y"))).await;

        assert!(mirror.read().await.is_empty());
    }

    #[tokio::test]
    async fn settle_flag_is_reported_back() {
        let mirror = Arc::new(RwLock::new(MirrorState::new()));
        let consumer = consumer(&mirror, idle_scheduler());

        assert!(consumer.dispatch(MirrorAction::InitialSyncSettled).await);
        assert!(!consumer.dispatch(MirrorAction::Reset).await);
    }

    #[tokio::test]
    async fn refresh_job_attaches_holders() {
        let mirror = Arc::new(RwLock::new(MirrorState::new()));
        let consumer = consumer(&mirror, idle_scheduler());
        consumer.apply(PoolChange::Added(pool_item("a", "p-1", 2))).await;

        let holds = InMemoryHoldStore::new();
        let order = target_order("o-1", "u-1", "Ana");
        holds.seed(
            order.hold_key(&"p-1".into()),
            order.merge_unit(None, test_clock().now()),
        );

        let sink = Arc::new(RecordingSink::new());
        let job = RefreshJob::new(
            Arc::clone(&mirror),
            LedgerScanner::new(Arc::new(holds)),
            sink.clone(),
            true,
        );
        job.run().await;

        let view = sink.last().unwrap();
        assert_eq!(view.free_units(), 2);
        assert_eq!(view.held_units(), 1);
        assert_eq!(view.items[0].holders[0].name, "Ana");
    }

    #[tokio::test]
    async fn run_survives_feed_errors() {
        let mirror = Arc::new(RwLock::new(MirrorState::new()));
        let scheduler = Arc::new(DebounceScheduler::new(
            Duration::from_millis(1),
            Arc::new(TokioTimer),
            Arc::new(|| async {}.boxed()),
        ));
        let consumer = Arc::new(consumer(&mirror, scheduler));

        let feed: ChangeStream = Box::pin(futures::stream::iter(vec![
            Err(PoolStoreError::Backend("decode failed".to_string())),
            Ok(PoolChange::Added(pool_item("a", "p-1", 1))),
        ]));
        consumer.run(feed).await;
        run_pending_tasks().await;

        assert_eq!(mirror.read().await.len(), 1);
    }

    #[tokio::test]
    async fn lagged_feed_is_replaced_and_the_mirror_rebuilt() {
        let store = InMemoryPoolStore::new();
        let kept = store.seed(new_item("p-1", 2));
        let kept_item = store.items().remove(0);
        let mirror = Arc::new(RwLock::new(MirrorState::new()));
        let consumer = Arc::new(consumer_on(&store, &mirror, idle_scheduler()));

        // The lost events would have removed "gone"; only a fresh replay can tell.
        let feed: ChangeStream = Box::pin(futures::stream::iter(vec![
            Ok(PoolChange::Added(pool_item("gone", "p-9", 1))),
            Ok(PoolChange::Added(kept_item)),
            Err(PoolStoreError::Lagged(7)),
        ]));
        let task = tokio::spawn(consumer.run(feed));
        run_pending_tasks().await;

        {
            let state = mirror.read().await;
            assert_eq!(state.len(), 1);
            assert_eq!(state.items()[0].id, kept);
        }
        assert_eq!(store.subscriber_count(), 1);

        store.seed(new_item("p-2", 1));
        run_pending_tasks().await;
        assert_eq!(mirror.read().await.len(), 2);

        task.abort();
    }

    #[tokio::test]
    async fn failed_resubscribe_stops_the_consumer() {
        let store = InMemoryPoolStore::new();
        store.faults().set_unavailable(true);
        let mirror = Arc::new(RwLock::new(MirrorState::new()));
        let consumer = Arc::new(consumer_on(&store, &mirror, idle_scheduler()));

        let feed: ChangeStream = Box::pin(futures::stream::iter(vec![
            Ok(PoolChange::Added(pool_item("a", "p-1", 1))),
            Err(PoolStoreError::Lagged(2)),
            Ok(PoolChange::Added(pool_item("b", "p-2", 1))),
        ]));
        consumer.run(feed).await;

        let state = mirror.read().await;
        assert_eq!(state.len(), 1);
        assert_eq!(state.items()[0].id, PoolItemId::new("a"));
    }
}
