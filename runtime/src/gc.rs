//! Garbage collection of exhausted, unheld pool records.
//!
//! A record at quantity 0 stays in the pool while any order still holds units of its
//! product, so the holders stay visible to everyone. Once the last hold is gone the
//! record is deleted.

use crate::error::PoolError;
use crate::ledger::LedgerScanner;
use crate::metrics::GcMetrics;
use droppool_core::ids::{PoolItemId, ProductId};
use droppool_core::pool_store::PoolStore;
use std::fmt;
use std::sync::Arc;

/// Why a record was kept.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetainReason {
    /// Some order still holds units of the product.
    StillHeld,
    /// The record has free units.
    HasStock,
}

impl RetainReason {
    /// Label for logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::StillHeld => "still_held",
            Self::HasStock => "has_stock",
        }
    }
}

/// Result of one collection check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GcOutcome {
    /// The record was deleted.
    Deleted,
    /// The record was kept.
    Retained(RetainReason),
    /// The record no longer existed.
    AlreadyGone,
}

impl fmt::Display for GcOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deleted => f.write_str("deleted"),
            Self::Retained(reason) => write!(f, "retained ({})", reason.as_str()),
            Self::AlreadyGone => f.write_str("already gone"),
        }
    }
}

/// Deletes pool records that are empty and unheld.
#[derive(Clone)]
pub struct GarbageCollector {
    pool: Arc<dyn PoolStore>,
    scanner: LedgerScanner,
}

impl GarbageCollector {
    /// Collector over the pool and the ledger scanner.
    #[must_use]
    pub fn new(pool: Arc<dyn PoolStore>, scanner: LedgerScanner) -> Self {
        Self { pool, scanner }
    }

    /// Check one record and delete it if it is exhausted and nobody holds its product.
    ///
    /// The holder scan runs first; the record itself is then re-read from the store, so
    /// a stale mirror can never cause a deletion.
    ///
    /// # Errors
    ///
    /// Ledger or pool store failures. Nothing is deleted when an error is returned.
    #[tracing::instrument(skip(self), fields(product_id = %product_id, item_id = %item_id))]
    pub async fn collect(
        &self,
        product_id: &ProductId,
        item_id: &PoolItemId,
    ) -> Result<GcOutcome, PoolError> {
        if self.scanner.is_still_held(product_id).await? {
            return Ok(Self::retained(RetainReason::StillHeld));
        }

        let Some(item) = self.pool.get(item_id).await? else {
            tracing::debug!("Record already removed");
            return Ok(GcOutcome::AlreadyGone);
        };
        if item.quantity > 0 {
            return Ok(Self::retained(RetainReason::HasStock));
        }

        self.pool.remove(item_id).await?;
        GcMetrics::record_deleted();
        tracing::info!("Exhausted record with no holders deleted");
        Ok(GcOutcome::Deleted)
    }

    fn retained(reason: RetainReason) -> GcOutcome {
        GcMetrics::record_retained(reason.as_str());
        tracing::debug!(reason = reason.as_str(), "Record retained");
        GcOutcome::Retained(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use droppool_core::environment::Clock;
    use droppool_testing::fixtures::{new_item, target_order};
    use droppool_testing::{InMemoryHoldStore, InMemoryPoolStore, test_clock};

    fn collector(pool: &InMemoryPoolStore, holds: &InMemoryHoldStore) -> GarbageCollector {
        GarbageCollector::new(
            Arc::new(pool.clone()),
            LedgerScanner::new(Arc::new(holds.clone())),
        )
    }

    #[tokio::test]
    async fn empty_unheld_record_is_deleted() {
        let pool = InMemoryPoolStore::new();
        let holds = InMemoryHoldStore::new();
        let id = pool.seed(new_item("p-1", 0));

        let outcome = collector(&pool, &holds)
            .collect(&ProductId::new("p-1"), &id)
            .await
            .unwrap();

        assert_eq!(outcome, GcOutcome::Deleted);
        assert!(!pool.contains(&id));
    }

    #[tokio::test]
    async fn empty_but_held_record_is_kept() {
        let pool = InMemoryPoolStore::new();
        let holds = InMemoryHoldStore::new();
        let id = pool.seed(new_item("p-1", 0));
        let order = target_order("o-1", "u-1", "Ana");
        holds.seed(
            order.hold_key(&ProductId::new("p-1")),
            order.merge_unit(None, test_clock().now()),
        );

        let outcome = collector(&pool, &holds)
            .collect(&ProductId::new("p-1"), &id)
            .await
            .unwrap();

        assert_eq!(outcome, GcOutcome::Retained(RetainReason::StillHeld));
        assert!(pool.contains(&id));
    }

    #[tokio::test]
    async fn record_with_stock_is_kept() {
        let pool = InMemoryPoolStore::new();
        let holds = InMemoryHoldStore::new();
        let id = pool.seed(new_item("p-1", 2));

        let outcome = collector(&pool, &holds)
            .collect(&ProductId::new("p-1"), &id)
            .await
            .unwrap();

        assert_eq!(outcome, GcOutcome::Retained(RetainReason::HasStock));
    }

    #[tokio::test]
    async fn missing_record_is_already_gone() {
        let pool = InMemoryPoolStore::new();
        let holds = InMemoryHoldStore::new();

        let outcome = collector(&pool, &holds)
            .collect(&ProductId::new("p-1"), &PoolItemId::new("ghost"))
            .await
            .unwrap();

        assert_eq!(outcome, GcOutcome::AlreadyGone);
    }

    #[tokio::test]
    async fn ledger_failure_deletes_nothing() {
        let pool = InMemoryPoolStore::new();
        let holds = InMemoryHoldStore::new();
        let id = pool.seed(new_item("p-1", 0));
        holds.faults().set_unavailable(true);

        let result = collector(&pool, &holds)
            .collect(&ProductId::new("p-1"), &id)
            .await;

        assert!(matches!(result, Err(PoolError::Hold(_))));
        assert!(pool.contains(&id));
    }
}
