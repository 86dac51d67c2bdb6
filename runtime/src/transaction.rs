//! Atomic quantity adjustments on a single pool record.
//!
//! This is the only real concurrency-safety primitive in the system: everything that
//! changes a quantity goes through the store's single-record transaction, so racing
//! writers never lose each other's updates.

use crate::metrics::TransactionMetrics;
use droppool_core::ids::PoolItemId;
use droppool_core::pool_store::{PoolItem, PoolStore, PoolStoreError, PoolUpdateFn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Lower bound applied to the result of an adjustment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClampPolicy {
    /// Staff editing a quantity by hand: never below 1.
    Manual,
    /// Moving a unit into an order: may reach 0, the only way to deplete a record.
    Transfer,
}

impl ClampPolicy {
    /// Smallest quantity this policy allows.
    #[must_use]
    pub const fn floor(self) -> u32 {
        match self {
            Self::Manual => 1,
            Self::Transfer => 0,
        }
    }
}

/// Requested change to a record's quantity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuantityAdjustment {
    /// Add (or, if negative, subtract) units.
    Delta(i64),
    /// Replace the quantity.
    Set(u32),
}

impl QuantityAdjustment {
    /// Quantity after applying this adjustment to `current` under `policy`.
    ///
    /// Saturates at `u32::MAX` and never goes below the policy floor.
    #[must_use]
    pub fn resolve(self, current: u32, policy: ClampPolicy) -> u32 {
        let raw = match self {
            Self::Delta(delta) => i64::from(current).saturating_add(delta),
            Self::Set(value) => i64::from(value),
        };
        let clamped = raw.clamp(i64::from(policy.floor()), i64::from(u32::MAX));
        u32::try_from(clamped).unwrap_or(u32::MAX)
    }
}

/// What an adjustment did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdjustOutcome {
    /// The record existed and now has `quantity` units.
    Applied {
        /// Quantity after the transaction
        quantity: u32,
    },
    /// The record had been deleted; nothing was written.
    Missing,
}

impl AdjustOutcome {
    /// Quantity after the transaction, if the record existed.
    #[must_use]
    pub const fn quantity(self) -> Option<u32> {
        match self {
            Self::Applied { quantity } => Some(quantity),
            Self::Missing => None,
        }
    }
}

/// Runs read-modify-write transactions against the pool store.
#[derive(Clone)]
pub struct TransactionExecutor {
    store: Arc<dyn PoolStore>,
}

impl TransactionExecutor {
    /// Executor over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn PoolStore>) -> Self {
        Self { store }
    }

    /// Apply `update` to one record atomically.
    ///
    /// `update` only sees existing records; a record deleted concurrently makes the
    /// whole call a no-op reported as [`AdjustOutcome::Missing`].
    ///
    /// # Errors
    ///
    /// Store failures, including giving up after repeated write conflicts.
    pub async fn atomic_adjust<F>(
        &self,
        id: &PoolItemId,
        mut update: F,
    ) -> Result<AdjustOutcome, PoolStoreError>
    where
        F: FnMut(PoolItem) -> PoolItem + Send + 'static,
    {
        let update: PoolUpdateFn =
            Box::new(move |current: Option<PoolItem>| current.map(&mut update));
        let outcome = self.store.transaction(id, update).await?;

        match outcome.snapshot {
            Some(item) => {
                TransactionMetrics::record_applied();
                tracing::debug!(item_id = %id, quantity = item.quantity, "Pool record adjusted");
                Ok(AdjustOutcome::Applied {
                    quantity: item.quantity,
                })
            },
            None => {
                TransactionMetrics::record_noop();
                tracing::debug!(item_id = %id, "Pool record gone, adjustment skipped");
                Ok(AdjustOutcome::Missing)
            },
        }
    }

    /// Adjust a record's quantity under `policy`.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn adjust(
        &self,
        id: &PoolItemId,
        adjustment: QuantityAdjustment,
        policy: ClampPolicy,
    ) -> Result<AdjustOutcome, PoolStoreError> {
        self.atomic_adjust(id, move |mut item| {
            item.quantity = adjustment.resolve(item.quantity, policy);
            item
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use droppool_testing::{InMemoryPoolStore, fixtures::new_item};
    use proptest::prelude::*;

    #[test]
    fn manual_floor_is_one() {
        assert_eq!(QuantityAdjustment::Delta(-10).resolve(3, ClampPolicy::Manual), 1);
        assert_eq!(QuantityAdjustment::Set(0).resolve(3, ClampPolicy::Manual), 1);
        assert_eq!(QuantityAdjustment::Delta(2).resolve(3, ClampPolicy::Manual), 5);
    }

    #[test]
    fn transfer_floor_is_zero() {
        assert_eq!(QuantityAdjustment::Delta(-1).resolve(1, ClampPolicy::Transfer), 0);
        assert_eq!(QuantityAdjustment::Delta(-1).resolve(0, ClampPolicy::Transfer), 0);
    }

    #[test]
    fn additions_saturate() {
        assert_eq!(
            QuantityAdjustment::Delta(i64::MAX).resolve(u32::MAX - 1, ClampPolicy::Manual),
            u32::MAX
        );
    }

    proptest! {
        #[test]
        fn resolved_quantity_respects_the_floor(
            current in any::<u32>(),
            delta in any::<i64>(),
            manual in any::<bool>(),
        ) {
            let policy = if manual { ClampPolicy::Manual } else { ClampPolicy::Transfer };
            let next = QuantityAdjustment::Delta(delta).resolve(current, policy);
            prop_assert!(next >= policy.floor());
        }
    }

    #[tokio::test]
    async fn adjust_on_deleted_record_is_a_noop() {
        let store = Arc::new(InMemoryPoolStore::new());
        let id = store.seed(new_item("p-1", 2));
        store.remove(&id).await.unwrap();

        let executor = TransactionExecutor::new(store.clone());
        let outcome = executor
            .adjust(&id, QuantityAdjustment::Delta(1), ClampPolicy::Manual)
            .await
            .unwrap();

        assert_eq!(outcome, AdjustOutcome::Missing);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn adjust_reports_the_committed_quantity() {
        let store = Arc::new(InMemoryPoolStore::new());
        let id = store.seed(new_item("p-1", 2));

        let executor = TransactionExecutor::new(store.clone());
        let outcome = executor
            .adjust(&id, QuantityAdjustment::Delta(-5), ClampPolicy::Transfer)
            .await
            .unwrap();

        assert_eq!(outcome.quantity(), Some(0));
        assert_eq!(store.quantity_of(&id), Some(0));
    }
}
