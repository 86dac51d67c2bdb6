//! In-memory reservation ledger.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Panics only on poisoned locks

use crate::faults::Faults;
use droppool_core::hold_store::{
    HoldKey, HoldRecord, HoldStore, HoldStoreError, HoldStoreFuture, HoldUpdateFn,
};
use droppool_core::ids::{OrderId, ProductId, Revision};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

/// Attempts before a transaction reports [`HoldStoreError::Conflict`].
const MAX_ATTEMPTS: u32 = 64;

/// In-memory [`HoldStore`]; clones share state.
///
/// Transactions use the same optimistic read/compare/commit loop as
/// [`InMemoryPoolStore`](crate::InMemoryPoolStore), with a yield in the race window so
/// concurrent holders on one key really do collide.
#[derive(Clone, Debug, Default)]
pub struct InMemoryHoldStore {
    records: Arc<RwLock<BTreeMap<HoldKey, (Revision, HoldRecord)>>>,
    faults: Arc<Faults>,
}

impl InMemoryHoldStore {
    /// Create an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Failure switches.
    #[must_use]
    pub fn faults(&self) -> &Faults {
        &self.faults
    }

    /// Insert a hold synchronously (test setup).
    pub fn seed(&self, key: HoldKey, record: HoldRecord) {
        self.records
            .write()
            .unwrap()
            .insert(key, (Revision::INITIAL, record));
    }

    /// Units of `product_id` held across every order.
    #[must_use]
    pub fn total_held(&self, product_id: &ProductId) -> u64 {
        self.records
            .read()
            .unwrap()
            .iter()
            .filter(|(key, _)| &key.product_id == product_id)
            .map(|(_, (_, record))| u64::from(record.quantity))
            .sum()
    }

    /// Units of `product_id` held by one order.
    #[must_use]
    pub fn held_by_order(&self, product_id: &ProductId, order_id: &OrderId) -> u64 {
        self.records
            .read()
            .unwrap()
            .iter()
            .filter(|(key, _)| &key.product_id == product_id && &key.order_id == order_id)
            .map(|(_, (_, record))| u64::from(record.quantity))
            .sum()
    }

    /// Number of hold records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().unwrap().len()
    }

    /// No hold records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> Result<(), HoldStoreError> {
        if self.faults.is_unavailable() {
            return Err(HoldStoreError::Unavailable("in-memory ledger offline".to_string()));
        }
        Ok(())
    }

    fn check_write(&self) -> Result<(), HoldStoreError> {
        self.check_available()?;
        match self.faults.take_write_failure() {
            Some(message) => Err(HoldStoreError::Backend(message)),
            None => Ok(()),
        }
    }

    fn read_versioned(&self, key: &HoldKey) -> (Option<Revision>, Option<HoldRecord>) {
        match self.records.read().unwrap().get(key) {
            Some((revision, record)) => (Some(*revision), Some(record.clone())),
            None => (None, None),
        }
    }

    async fn run_transaction(
        &self,
        key: HoldKey,
        mut update: HoldUpdateFn,
    ) -> Result<Option<HoldRecord>, HoldStoreError> {
        self.check_write()?;

        let mut attempts = 0;
        loop {
            attempts += 1;
            let (seen, current) = self.read_versioned(&key);

            tokio::task::yield_now().await;

            let Some(next) = update(current.clone()) else {
                return Ok(current);
            };

            let mut records = self.records.write().unwrap();
            let actual = records.get(&key).map(|(revision, _)| *revision);
            if actual != seen {
                drop(records);
                if attempts >= MAX_ATTEMPTS {
                    return Err(HoldStoreError::Conflict { key, attempts });
                }
                continue;
            }
            let revision = seen.map_or(Revision::INITIAL, Revision::next);
            records.insert(key, (revision, next.clone()));
            return Ok(Some(next));
        }
    }
}

impl HoldStore for InMemoryHoldStore {
    fn transaction(
        &self,
        key: &HoldKey,
        update: HoldUpdateFn,
    ) -> HoldStoreFuture<'_, Option<HoldRecord>> {
        Box::pin(self.run_transaction(key.clone(), update))
    }

    fn read(&self, key: &HoldKey) -> HoldStoreFuture<'_, Option<HoldRecord>> {
        let key = key.clone();
        Box::pin(async move {
            self.check_available()?;
            Ok(self.read_versioned(&key).1)
        })
    }

    fn list_holds(
        &self,
        product_id: &ProductId,
    ) -> HoldStoreFuture<'_, Vec<(HoldKey, HoldRecord)>> {
        let product_id = product_id.clone();
        Box::pin(async move {
            self.check_available()?;
            let records = self.records.read().unwrap();
            Ok(records
                .iter()
                .filter(|(key, _)| key.product_id == product_id)
                .map(|(key, (_, record))| (key.clone(), record.clone()))
                .collect())
        })
    }

    fn remove(&self, key: &HoldKey) -> HoldStoreFuture<'_, ()> {
        let key = key.clone();
        Box::pin(async move {
            self.check_write()?;
            self.records.write().unwrap().remove(&key);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::target_order;
    use chrono::Utc;

    #[tokio::test]
    async fn concurrent_merges_on_one_key_all_land() {
        let store = InMemoryHoldStore::new();
        let target = target_order("o-1", "u-1", "Ana");
        let key = target.hold_key(&ProductId::new("p-1"));

        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let store = store.clone();
                let target = target.clone();
                let key = key.clone();
                tokio::spawn(async move {
                    let update: HoldUpdateFn = Box::new(move |current: Option<HoldRecord>| {
                        Some(target.merge_unit(current, Utc::now()))
                    });
                    store.transaction(&key, update).await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(store.read(&key).await.unwrap().unwrap().quantity, 10);
    }

    #[tokio::test]
    async fn list_holds_scans_every_order_for_one_product() {
        let store = InMemoryHoldStore::new();
        let now = Utc::now();
        for (order, product) in [("o-1", "p-1"), ("o-2", "p-1"), ("o-3", "p-2")] {
            let target = target_order(order, "u-1", "Ana");
            store.seed(
                target.hold_key(&ProductId::new(product)),
                target.merge_unit(None, now),
            );
        }

        let holds = store.list_holds(&ProductId::new("p-1")).await.unwrap();
        assert_eq!(holds.len(), 2);
        assert_eq!(store.total_held(&ProductId::new("p-2")), 1);
    }

    #[tokio::test]
    async fn remove_missing_hold_succeeds() {
        let store = InMemoryHoldStore::new();
        let key = HoldKey::new("p-1", "o-1", "u-1");
        assert!(store.remove(&key).await.is_ok());
    }
}
