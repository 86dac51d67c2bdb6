//! In-memory pool store with racing writers.
//!
//! Transactions follow the optimistic pattern real replicated stores use: read the record
//! and its revision, run the update function, and commit only if nobody else wrote in
//! between, otherwise start over. A randomised yield between read and commit lets
//! concurrent tasks interleave inside that window, so conflicts actually happen in tests.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Panics only on poisoned locks

use crate::faults::Faults;
use droppool_core::ids::{PoolItemId, Revision};
use droppool_core::pool_store::{
    ChangeStream, NewPoolItem, PoolChange, PoolItem, PoolStore, PoolStoreError,
    PoolStoreFuture, PoolUpdateFn, TransactionOutcome,
};
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;

/// Attempts before a transaction reports [`PoolStoreError::Conflict`].
const DEFAULT_MAX_ATTEMPTS: u32 = 64;

/// Most yields inserted between a transaction's read and its commit.
const DEFAULT_RACE_YIELDS: u32 = 3;

/// In-memory [`PoolStore`] for tests and demos.
///
/// Clones share state, so several "clients" can hold the same store.
///
/// # Example
///
/// ```
/// use droppool_testing::InMemoryPoolStore;
/// use droppool_core::pool_store::PoolStore;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = InMemoryPoolStore::new();
/// let id = store.push(droppool_testing::fixtures::new_item("p-1", 3)).await?;
/// assert_eq!(store.quantity_of(&id), Some(3));
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct InMemoryPoolStore {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    records: RwLock<BTreeMap<PoolItemId, (Revision, PoolItem)>>,
    changes: broadcast::Sender<PoolChange>,
    next_id: AtomicU64,
    conflicts: AtomicU64,
    replay_initial_sync: AtomicBool,
    max_attempts: u32,
    race_yields: u32,
    faults: Faults,
}

impl InMemoryPoolStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_ATTEMPTS, DEFAULT_RACE_YIELDS)
    }

    /// Create a store with explicit retry and contention settings.
    ///
    /// `race_yields == 0` makes transactions effectively serial.
    #[must_use]
    pub fn with_limits(max_attempts: u32, race_yields: u32) -> Self {
        let (changes, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(Inner {
                records: RwLock::new(BTreeMap::new()),
                changes,
                next_id: AtomicU64::new(1),
                conflicts: AtomicU64::new(0),
                replay_initial_sync: AtomicBool::new(false),
                max_attempts,
                race_yields,
                faults: Faults::default(),
            }),
        }
    }

    /// Failure switches.
    #[must_use]
    pub fn faults(&self) -> &Faults {
        &self.inner.faults
    }

    /// Deliver every initial-sync record twice, as a flaky subscription replay would.
    pub fn replay_initial_sync(&self, replay: bool) {
        self.inner.replay_initial_sync.store(replay, Ordering::SeqCst);
    }

    /// Push a raw change to every subscriber without touching stored records.
    ///
    /// Used to simulate stale or out-of-order delivery.
    pub fn emit_raw(&self, change: PoolChange) {
        let _ = self.inner.changes.send(change);
    }

    /// Insert a record synchronously (test setup).
    pub fn seed(&self, item: NewPoolItem) -> PoolItemId {
        let id = self.allocate_id();
        let item = item.into_item(id.clone());
        let mut records = self.inner.records.write().unwrap();
        records.insert(id.clone(), (Revision::INITIAL, item.clone()));
        let _ = self.inner.changes.send(PoolChange::Added(item));
        id
    }

    /// Current quantity of a record.
    #[must_use]
    pub fn quantity_of(&self, id: &PoolItemId) -> Option<u32> {
        self.inner
            .records
            .read()
            .unwrap()
            .get(id)
            .map(|(_, item)| item.quantity)
    }

    /// Whether a record exists.
    #[must_use]
    pub fn contains(&self, id: &PoolItemId) -> bool {
        self.inner.records.read().unwrap().contains_key(id)
    }

    /// All records, ordered by id.
    #[must_use]
    pub fn items(&self) -> Vec<PoolItem> {
        self.inner
            .records
            .read()
            .unwrap()
            .values()
            .map(|(_, item)| item.clone())
            .collect()
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.records.read().unwrap().len()
    }

    /// No records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write conflicts observed (and retried) so far.
    #[must_use]
    pub fn conflict_count(&self) -> u64 {
        self.inner.conflicts.load(Ordering::SeqCst)
    }

    /// Live change-feed subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.changes.receiver_count()
    }

    fn allocate_id(&self) -> PoolItemId {
        let n = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        PoolItemId::new(format!("item-{n:06}"))
    }

    fn check_available(&self) -> Result<(), PoolStoreError> {
        if self.inner.faults.is_unavailable() {
            return Err(PoolStoreError::Unavailable("in-memory store offline".to_string()));
        }
        Ok(())
    }

    fn check_write(&self) -> Result<(), PoolStoreError> {
        self.check_available()?;
        match self.inner.faults.take_write_failure() {
            Some(message) => Err(PoolStoreError::Backend(message)),
            None => Ok(()),
        }
    }

    async fn race_window(&self) {
        if self.inner.race_yields == 0 {
            return;
        }
        let spins = rand::thread_rng().gen_range(0..=self.inner.race_yields);
        for _ in 0..spins {
            tokio::task::yield_now().await;
        }
    }

    fn read_versioned(&self, id: &PoolItemId) -> (Option<Revision>, Option<PoolItem>) {
        match self.inner.records.read().unwrap().get(id) {
            Some((revision, item)) => (Some(*revision), Some(item.clone())),
            None => (None, None),
        }
    }

    async fn run_transaction(
        &self,
        id: PoolItemId,
        mut update: PoolUpdateFn,
    ) -> Result<TransactionOutcome, PoolStoreError> {
        self.check_write()?;

        let mut attempts = 0;
        loop {
            attempts += 1;
            let (seen, current) = self.read_versioned(&id);

            self.race_window().await;

            let Some(mut next) = update(current.clone()) else {
                return Ok(TransactionOutcome {
                    committed: false,
                    snapshot: current,
                });
            };
            next.id = id.clone();

            let mut records = self.inner.records.write().unwrap();
            let actual = records.get(&id).map(|(revision, _)| *revision);
            if actual != seen {
                drop(records);
                self.inner.conflicts.fetch_add(1, Ordering::SeqCst);
                if attempts >= self.inner.max_attempts {
                    return Err(PoolStoreError::Conflict { id, attempts });
                }
                continue;
            }

            let revision = seen.map_or(Revision::INITIAL, Revision::next);
            records.insert(id.clone(), (revision, next.clone()));
            let change = if seen.is_some() {
                PoolChange::Changed(next.clone())
            } else {
                PoolChange::Added(next.clone())
            };
            let _ = self.inner.changes.send(change);

            return Ok(TransactionOutcome {
                committed: true,
                snapshot: Some(next),
            });
        }
    }
}

impl Default for InMemoryPoolStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolStore for InMemoryPoolStore {
    fn subscribe(&self) -> PoolStoreFuture<'_, ChangeStream> {
        Box::pin(async move {
            self.check_available()?;

            // Snapshot and subscribe under one lock: writers need the write lock to
            // publish, so nothing is missed or seen twice between the two.
            let (existing, mut rx) = {
                let records = self.inner.records.read().unwrap();
                let rx = self.inner.changes.subscribe();
                let existing: Vec<PoolItem> =
                    records.values().map(|(_, item)| item.clone()).collect();
                (existing, rx)
            };
            let replay = self.inner.replay_initial_sync.load(Ordering::SeqCst);

            let stream = async_stream::stream! {
                for item in &existing {
                    yield Ok(PoolChange::Added(item.clone()));
                }
                if replay {
                    for item in existing {
                        yield Ok(PoolChange::Added(item));
                    }
                }
                loop {
                    match rx.recv().await {
                        Ok(change) => yield Ok(change),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            yield Err(PoolStoreError::Lagged(skipped));
                        },
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            };
            Ok(Box::pin(stream) as ChangeStream)
        })
    }

    fn get(&self, id: &PoolItemId) -> PoolStoreFuture<'_, Option<PoolItem>> {
        let id = id.clone();
        Box::pin(async move {
            self.check_available()?;
            Ok(self.read_versioned(&id).1)
        })
    }

    fn push(&self, item: NewPoolItem) -> PoolStoreFuture<'_, PoolItemId> {
        Box::pin(async move {
            self.check_write()?;
            Ok(self.seed(item))
        })
    }

    fn transaction(
        &self,
        id: &PoolItemId,
        update: PoolUpdateFn,
    ) -> PoolStoreFuture<'_, TransactionOutcome> {
        Box::pin(self.run_transaction(id.clone(), update))
    }

    fn remove(&self, id: &PoolItemId) -> PoolStoreFuture<'_, ()> {
        let id = id.clone();
        Box::pin(async move {
            self.check_write()?;
            let mut records = self.inner.records.write().unwrap();
            if records.remove(&id).is_some() {
                let _ = self.inner.changes.send(PoolChange::Removed(id));
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::new_item;
    use futures::StreamExt;

    fn add(delta: u32) -> PoolUpdateFn {
        Box::new(move |current: Option<PoolItem>| {
            current.map(|mut item| {
                item.quantity += delta;
                item
            })
        })
    }

    #[tokio::test]
    async fn transaction_on_missing_record_is_a_noop() {
        let store = InMemoryPoolStore::new();
        let outcome = store
            .transaction(&PoolItemId::new("nope"), add(1))
            .await
            .unwrap();
        assert!(!outcome.committed);
        assert!(outcome.snapshot.is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn racing_transactions_lose_no_updates() {
        let store = InMemoryPoolStore::new();
        let id = store.seed(new_item("p-1", 0));

        let tasks: Vec<_> = (0..20)
            .map(|_| {
                let store = store.clone();
                let id = id.clone();
                tokio::spawn(async move { store.transaction(&id, add(1)).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(store.quantity_of(&id), Some(20));
    }

    #[tokio::test]
    async fn subscribe_replays_existing_then_streams_live_changes() {
        let store = InMemoryPoolStore::new();
        let first = store.seed(new_item("p-1", 1));
        let mut feed = store.subscribe().await.unwrap();

        let second = store.push(new_item("p-2", 2)).await.unwrap();
        store.remove(&first).await.unwrap();

        let seen: Vec<PoolChange> = feed.by_ref().take(3).map(Result::unwrap).collect().await;
        assert!(matches!(&seen[0], PoolChange::Added(i) if i.id == first));
        assert!(matches!(&seen[1], PoolChange::Added(i) if i.id == second));
        assert_eq!(seen[2], PoolChange::Removed(first));
    }

    #[tokio::test]
    async fn offline_store_rejects_calls() {
        let store = InMemoryPoolStore::new();
        store.faults().set_unavailable(true);
        assert!(matches!(
            store.subscribe().await,
            Err(PoolStoreError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn armed_write_failure_fires_once() {
        let store = InMemoryPoolStore::new();
        store.faults().fail_next_write("disk full");
        assert!(store.push(new_item("p-1", 1)).await.is_err());
        assert!(store.push(new_item("p-1", 1)).await.is_ok());
    }

    #[tokio::test]
    async fn dropping_the_feed_unsubscribes() {
        let store = InMemoryPoolStore::new();
        let feed = store.subscribe().await.unwrap();
        assert_eq!(store.subscriber_count(), 1);
        drop(feed);
        assert_eq!(store.subscriber_count(), 0);
    }
}
