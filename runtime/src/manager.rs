//! The pool manager: one owned instance per client session.
//!
//! [`PoolManager`] wires the components together and exposes the operations staff
//! clients call. It follows a remote-first discipline: operations only write to the
//! stores, and the local mirror changes exclusively through confirmed change events
//! coming back on the feed.

use crate::config::PoolConfig;
use crate::consumer::{MirrorConsumer, RefreshJob};
use crate::error::{PoolError, Result};
use crate::gc::{GarbageCollector, GcOutcome};
use crate::ledger::LedgerScanner;
use crate::retry::retry_with_predicate;
use crate::scheduler::{DebounceScheduler, ScheduledAction};
use crate::TokioTimer;
use crate::transaction::{AdjustOutcome, ClampPolicy, QuantityAdjustment, TransactionExecutor};
use crate::transfer::{HoldTransfer, TransferReceipt};
use droppool_core::environment::{
    Clock, Notification, Notifier, RefreshSink, SystemClock, Timer,
};
use droppool_core::hold_store::{HoldKey, HoldStore, Holder, TargetOrder};
use droppool_core::ids::{PoolItemId, ProductId};
use droppool_core::mirror::{MirrorAction, MirrorState};
use droppool_core::pool_store::{NewPoolItem, PoolItem, PoolStore, PoolStoreError, ProductInfo};
use futures::FutureExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

/// Injected collaborators of a [`PoolManager`].
#[derive(Clone)]
pub struct PoolEnvironment {
    /// The replicated pool collection
    pub pool_store: Arc<dyn PoolStore>,
    /// The per-order hold namespaces
    pub hold_store: Arc<dyn HoldStore>,
    /// Wall clock for `added_at` and hold timestamps
    pub clock: Arc<dyn Clock>,
    /// Delay source for debouncing and the settle period
    pub timer: Arc<dyn Timer>,
    /// Receiver of coalesced refreshes
    pub sink: Arc<dyn RefreshSink>,
    /// User-visible notifications
    pub notifier: Arc<dyn Notifier>,
}

impl PoolEnvironment {
    /// Production environment: system clock and tokio timer.
    #[must_use]
    pub fn new(
        pool_store: Arc<dyn PoolStore>,
        hold_store: Arc<dyn HoldStore>,
        sink: Arc<dyn RefreshSink>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            pool_store,
            hold_store,
            clock: Arc::new(SystemClock),
            timer: Arc::new(TokioTimer),
            sink,
            notifier,
        }
    }

    /// Replace the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the timer.
    #[must_use]
    pub fn with_timer(mut self, timer: Arc<dyn Timer>) -> Self {
        self.timer = timer;
        self
    }
}

/// Background tasks that exist between `init` and `teardown`.
struct Session {
    consumer: JoinHandle<()>,
    settle: JoinHandle<()>,
}

/// Shared-pool client.
///
/// # Lifecycle
///
/// `new` → [`init`](Self::init) (subscribes, starts the mirror consumer) → operations →
/// [`teardown`](Self::teardown) (unsubscribes, cancels timers, clears the mirror). A torn
/// down manager can be initialised again.
///
/// # Example
///
/// ```
/// use droppool_runtime::{PoolConfig, PoolEnvironment, PoolManager};
/// use droppool_testing::{
///     InMemoryHoldStore, InMemoryPoolStore, RecordingNotifier, RecordingSink, fixtures,
/// };
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), droppool_runtime::PoolError> {
/// let env = PoolEnvironment::new(
///     Arc::new(InMemoryPoolStore::new()),
///     Arc::new(InMemoryHoldStore::new()),
///     Arc::new(RecordingSink::new()),
///     Arc::new(RecordingNotifier::new()),
/// );
/// let manager = PoolManager::new(env, PoolConfig::default());
/// manager.init().await?;
///
/// let id = manager.add_item(fixtures::product("p-1"), 3, "short expiry").await?;
/// let order = fixtures::target_order("o-1", "u-1", "Ana");
/// let receipt = manager.transfer_to_order(&id, &order).await?;
/// assert_eq!(receipt.remaining, 2);
///
/// manager.teardown().await;
/// # Ok(())
/// # }
/// ```
pub struct PoolManager {
    env: PoolEnvironment,
    config: PoolConfig,
    mirror: Arc<RwLock<MirrorState>>,
    scheduler: Arc<DebounceScheduler>,
    consumer: Arc<MirrorConsumer>,
    executor: TransactionExecutor,
    scanner: LedgerScanner,
    gc: GarbageCollector,
    transfer: HoldTransfer,
    session: Mutex<Option<Session>>,
    /// Records this manager pushed that may not have reached the mirror yet.
    unmirrored_adds: Mutex<HashMap<ProductId, PoolItemId>>,
}

impl PoolManager {
    /// Build a manager. Nothing is subscribed until [`init`](Self::init).
    #[must_use]
    pub fn new(env: PoolEnvironment, config: PoolConfig) -> Self {
        let mirror = Arc::new(RwLock::new(MirrorState::new()));
        let scanner = LedgerScanner::new(Arc::clone(&env.hold_store));

        let job = Arc::new(RefreshJob::new(
            Arc::clone(&mirror),
            scanner.clone(),
            Arc::clone(&env.sink),
            config.refresh_holder_counts,
        ));
        let action: ScheduledAction = Arc::new(move || {
            let job = Arc::clone(&job);
            async move { job.run().await }.boxed()
        });
        let scheduler = Arc::new(DebounceScheduler::new(
            config.debounce_window,
            Arc::clone(&env.timer),
            action,
        ));

        let consumer = Arc::new(MirrorConsumer::new(
            Arc::clone(&mirror),
            Arc::clone(&scheduler),
            Arc::clone(&env.pool_store),
            Arc::clone(&env.timer),
            config.subscribe_retry.clone(),
        ));
        let executor = TransactionExecutor::new(Arc::clone(&env.pool_store));
        let gc = GarbageCollector::new(Arc::clone(&env.pool_store), scanner.clone());
        let transfer = HoldTransfer::new(
            Arc::clone(&env.pool_store),
            Arc::clone(&env.hold_store),
            gc.clone(),
            Arc::clone(&env.clock),
        );

        Self {
            env,
            config,
            mirror,
            scheduler,
            consumer,
            executor,
            scanner,
            gc,
            transfer,
            session: Mutex::new(None),
            unmirrored_adds: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe to the pool and start mirroring it.
    ///
    /// Opening the feed is retried per the configured policy while the store reports
    /// transient failures. Calling `init` on an initialised manager does nothing.
    ///
    /// # Errors
    ///
    /// [`PoolError::StoreUnavailable`] if the feed cannot be opened. There is no
    /// local-only mode: the manager stays uninitialised.
    #[tracing::instrument(skip(self))]
    pub async fn init(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        if session.is_some() {
            tracing::debug!("Pool manager already initialized");
            return Ok(());
        }

        let store = Arc::clone(&self.env.pool_store);
        let stream = retry_with_predicate(
            &self.config.subscribe_retry,
            self.env.timer.as_ref(),
            || store.subscribe(),
            PoolStoreError::is_transient,
        )
        .await
        .map_err(|err| self.fail(PoolError::StoreUnavailable(err)))?;

        let consumer = tokio::spawn(Arc::clone(&self.consumer).run(stream));

        let settle_delay = self.config.initial_sync_delay;
        let sleep = self.env.timer.sleep(settle_delay);
        let settling = Arc::clone(&self.consumer);
        let settle = tokio::spawn(async move {
            sleep.await;
            settling.dispatch(MirrorAction::InitialSyncSettled).await;
            tracing::info!(
                delay_ms = u64::try_from(settle_delay.as_millis()).unwrap_or(u64::MAX),
                "Initial sync settled"
            );
        });

        *session = Some(Session { consumer, settle });
        tracing::info!("Pool manager initialized");
        Ok(())
    }

    /// Unsubscribe, cancel pending timers and clear the mirror.
    #[tracing::instrument(skip(self))]
    pub async fn teardown(&self) {
        let Some(session) = self.session.lock().await.take() else {
            return;
        };

        session.settle.abort();
        session.consumer.abort();
        // Wait for the consumer to drop its stream, which releases the subscription.
        let _ = session.consumer.await;
        let _ = session.settle.await;

        self.scheduler.cancel();
        self.unmirrored_adds.lock().await.clear();
        self.consumer.dispatch(MirrorAction::Reset).await;
        tracing::info!("Pool manager torn down");
    }

    /// Whether `init` has completed and `teardown` has not run since.
    pub async fn is_initialized(&self) -> bool {
        self.session.lock().await.is_some()
    }

    /// Contribute `quantity` units of `product` to the pool.
    ///
    /// If the mirror already shows a record for the product, or this manager pushed one
    /// whose change event has not arrived yet, the units are merged into it. If that
    /// record turns out to have been deleted meanwhile, a new one is created. Adds from
    /// one manager are serialized.
    ///
    /// # Errors
    ///
    /// [`PoolError::Validation`] for a zero quantity or a blank reason, otherwise store
    /// failures.
    #[tracing::instrument(skip(self, product), fields(product_id = %product.product_id))]
    pub async fn add_item(
        &self,
        product: ProductInfo,
        quantity: u32,
        reason: &str,
    ) -> Result<PoolItemId> {
        let result = self.add_item_inner(product, quantity, reason).await;
        self.report(result)
    }

    async fn add_item_inner(
        &self,
        product: ProductInfo,
        quantity: u32,
        reason: &str,
    ) -> Result<PoolItemId> {
        self.ensure_initialized().await?;
        if quantity == 0 {
            return Err(PoolError::Validation("quantity must be at least 1".to_string()));
        }
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(PoolError::Validation("a reason is required".to_string()));
        }

        let mut unmirrored = self.unmirrored_adds.lock().await;
        let mirrored = self
            .mirror
            .read()
            .await
            .for_product(&product.product_id)
            .next()
            .map(|item| item.id.clone());
        let existing = match mirrored {
            Some(id) => {
                unmirrored.remove(&product.product_id);
                Some(id)
            },
            None => unmirrored.get(&product.product_id).cloned(),
        };

        if let Some(id) = existing {
            let delta = QuantityAdjustment::Delta(i64::from(quantity));
            match self.executor.adjust(&id, delta, ClampPolicy::Manual).await? {
                AdjustOutcome::Applied { quantity: total } => {
                    tracing::info!(item_id = %id, added = quantity, total, "Merged into existing record");
                    self.env.notifier.notify(Notification::success(format!(
                        "Added {quantity} to {}",
                        product.display_name
                    )));
                    return Ok(id);
                },
                AdjustOutcome::Missing => {
                    unmirrored.remove(&product.product_id);
                    tracing::debug!(item_id = %id, "Merge target deleted, creating a new record");
                },
            }
        }

        let product_id = product.product_id.clone();
        let display_name = product.display_name.clone();
        let id = self
            .env
            .pool_store
            .push(NewPoolItem {
                product,
                quantity,
                reason: reason.to_string(),
                added_at: self.env.clock.now(),
            })
            .await?;
        unmirrored.insert(product_id, id.clone());
        tracing::info!(item_id = %id, quantity, "Record added to pool");
        self.env
            .notifier
            .notify(Notification::success(format!("{display_name} added to pool")));
        Ok(id)
    }

    /// Delete a pool record outright.
    ///
    /// # Errors
    ///
    /// Store failures.
    #[tracing::instrument(skip(self), fields(item_id = %id))]
    pub async fn remove_item(&self, id: &PoolItemId) -> Result<()> {
        let result = async {
            self.ensure_initialized().await?;
            self.env.pool_store.remove(id).await?;
            tracing::info!("Record removed from pool");
            Ok(())
        }
        .await;
        self.report(result)
    }

    /// Change a record's quantity by hand. The result never drops below 1.
    ///
    /// A record deleted concurrently yields [`AdjustOutcome::Missing`], not an error.
    ///
    /// # Errors
    ///
    /// Store failures.
    #[tracing::instrument(skip(self), fields(item_id = %id))]
    pub async fn adjust_quantity(
        &self,
        id: &PoolItemId,
        adjustment: QuantityAdjustment,
    ) -> Result<AdjustOutcome> {
        let result = async {
            self.ensure_initialized().await?;
            Ok(self.executor.adjust(id, adjustment, ClampPolicy::Manual).await?)
        }
        .await;
        self.report(result)
    }

    /// Move one unit of a record into `target`.
    ///
    /// # Errors
    ///
    /// See [`HoldTransfer::transfer_to_order`].
    #[tracing::instrument(skip(self, target), fields(item_id = %id))]
    pub async fn transfer_to_order(
        &self,
        id: &PoolItemId,
        target: &TargetOrder,
    ) -> Result<TransferReceipt> {
        let result = async {
            self.ensure_initialized().await?;
            self.transfer.transfer_to_order(id, target).await
        }
        .await;
        if result.is_ok() {
            self.env
                .notifier
                .notify(Notification::success(format!("Moved to order {}", target.order_id)));
        }
        self.report(result)
    }

    /// Remove a hold (the order released it) and garbage-collect the product's records.
    ///
    /// # Errors
    ///
    /// Ledger failures while removing the hold. Garbage collection failures are
    /// logged and leave the records for a later [`sweep`](Self::sweep).
    #[tracing::instrument(skip(self), fields(hold = %key))]
    pub async fn release_hold(&self, key: &HoldKey) -> Result<Vec<GcOutcome>> {
        let result = async {
            self.ensure_initialized().await?;
            self.env.hold_store.remove(key).await?;
            tracing::info!("Hold released");

            let candidates: Vec<PoolItemId> = self
                .mirror
                .read()
                .await
                .for_product(&key.product_id)
                .map(|item| item.id.clone())
                .collect();
            Ok(self.collect_all(&key.product_id, candidates).await)
        }
        .await;
        self.report(result)
    }

    /// Current holders of a product.
    ///
    /// # Errors
    ///
    /// Ledger failures.
    pub async fn get_holders(&self, product_id: &ProductId) -> Result<Vec<Holder>> {
        let result = self.scanner.get_holders(product_id).await.map_err(PoolError::from);
        self.report(result)
    }

    /// Whether any order holds units of a product.
    ///
    /// # Errors
    ///
    /// Ledger failures.
    pub async fn is_still_held(&self, product_id: &ProductId) -> Result<bool> {
        let result = self.scanner.is_still_held(product_id).await.map_err(PoolError::from);
        self.report(result)
    }

    /// Run the garbage collector over every exhausted record in the mirror.
    ///
    /// # Errors
    ///
    /// [`PoolError::NotInitialized`] only; per-record failures are logged and skipped.
    #[tracing::instrument(skip(self))]
    pub async fn sweep(&self) -> Result<Vec<(PoolItemId, GcOutcome)>> {
        self.report(self.ensure_initialized().await)?;

        let candidates: Vec<(ProductId, PoolItemId)> = self
            .mirror
            .read()
            .await
            .items()
            .iter()
            .filter(|item| item.is_exhausted())
            .map(|item| (item.product_id.clone(), item.id.clone()))
            .collect();

        let mut outcomes = Vec::with_capacity(candidates.len());
        for (product_id, item_id) in candidates {
            match self.gc.collect(&product_id, &item_id).await {
                Ok(outcome) => outcomes.push((item_id, outcome)),
                Err(err) => {
                    tracing::warn!(item_id = %item_id, error = %err, "Sweep skipped record");
                },
            }
        }
        tracing::debug!(checked = outcomes.len(), "Sweep finished");
        Ok(outcomes)
    }

    /// Delete every record currently in the mirror. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// The first store failure; records before it stay deleted.
    #[tracing::instrument(skip(self))]
    pub async fn clear_all(&self) -> Result<usize> {
        let result = async {
            self.ensure_initialized().await?;
            let ids: Vec<PoolItemId> = self
                .mirror
                .read()
                .await
                .items()
                .iter()
                .map(|item| item.id.clone())
                .collect();
            for id in &ids {
                self.env.pool_store.remove(id).await?;
            }
            tracing::info!(removed = ids.len(), "Pool cleared");
            Ok(ids.len())
        }
        .await;
        self.report(result)
    }

    /// Copy of the mirror, in arrival order.
    pub async fn snapshot(&self) -> Vec<PoolItem> {
        self.mirror.read().await.items().to_vec()
    }

    /// Mirror entries whose name, code or reason contains `query`, ignoring case.
    ///
    /// A blank query returns the whole snapshot.
    pub async fn filter(&self, query: &str) -> Vec<PoolItem> {
        let needle = query.trim().to_lowercase();
        let mirror = self.mirror.read().await;
        if needle.is_empty() {
            return mirror.items().to_vec();
        }
        mirror
            .items()
            .iter()
            .filter(|item| item.matches_lowercase(&needle))
            .cloned()
            .collect()
    }

    /// Whether the initial bulk load is considered over.
    pub async fn is_initial_sync_settled(&self) -> bool {
        self.mirror.read().await.is_initial_sync_settled()
    }

    /// Refreshes delivered to the sink since construction.
    #[must_use]
    pub fn refresh_count(&self) -> u64 {
        self.scheduler.fire_count()
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &PoolConfig {
        &self.config
    }

    async fn collect_all(
        &self,
        product_id: &ProductId,
        candidates: Vec<PoolItemId>,
    ) -> Vec<GcOutcome> {
        let mut outcomes = Vec::with_capacity(candidates.len());
        for item_id in candidates {
            match self.gc.collect(product_id, &item_id).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => {
                    tracing::warn!(item_id = %item_id, error = %err, "Garbage collection deferred");
                },
            }
        }
        outcomes
    }

    async fn ensure_initialized(&self) -> Result<()> {
        if self.session.lock().await.is_some() {
            Ok(())
        } else {
            Err(PoolError::NotInitialized)
        }
    }

    /// Log and notify a failed operation; pass the result through.
    fn report<T>(&self, result: Result<T>) -> Result<T> {
        result.map_err(|err| self.fail(err))
    }

    fn fail(&self, err: PoolError) -> PoolError {
        tracing::error!(error = %err, "Pool operation failed");
        self.env.notifier.notify(err.notification());
        err
    }
}

impl Drop for PoolManager {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            session.settle.abort();
            session.consumer.abort();
        }
    }
}
