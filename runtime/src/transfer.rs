//! Moving one pool unit into an order.
//!
//! A transfer is three independent writes: merge a hold into the target order, take one
//! unit off the pool record, then let the garbage collector look at the product. The
//! store offers no transaction spanning the ledger and the pool, so a failure between
//! the first two steps leaves the ledger one unit ahead. That state is reported, not
//! repaired.

use crate::error::PoolError;
use crate::gc::{GarbageCollector, GcOutcome};
use crate::metrics::TransferMetrics;
use crate::transaction::{AdjustOutcome, ClampPolicy, QuantityAdjustment, TransactionExecutor};
use droppool_core::environment::Clock;
use droppool_core::hold_store::{
    HoldKey, HoldRecord, HoldStore, HoldStoreError, HoldUpdateFn, TargetOrder,
};
use droppool_core::ids::PoolItemId;
use droppool_core::pool_store::PoolStore;
use std::sync::Arc;

/// What a completed transfer left behind.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferReceipt {
    /// Ledger key that received the unit
    pub hold_key: HoldKey,
    /// The hold after the merge
    pub hold: HoldRecord,
    /// Free units left on the pool record
    pub remaining: u32,
    /// Garbage collector verdict (`None` if the check itself failed)
    pub gc: Option<GcOutcome>,
}

/// Runs hold transfers.
#[derive(Clone)]
pub struct HoldTransfer {
    pool: Arc<dyn PoolStore>,
    holds: Arc<dyn HoldStore>,
    executor: TransactionExecutor,
    gc: GarbageCollector,
    clock: Arc<dyn Clock>,
}

impl HoldTransfer {
    /// Orchestrator over the given collaborators.
    #[must_use]
    pub fn new(
        pool: Arc<dyn PoolStore>,
        holds: Arc<dyn HoldStore>,
        gc: GarbageCollector,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let executor = TransactionExecutor::new(Arc::clone(&pool));
        Self {
            pool,
            holds,
            executor,
            gc,
            clock,
        }
    }

    /// Move one unit of `item_id` into `target`.
    ///
    /// # Errors
    ///
    /// - [`PoolError::NotFound`] / [`PoolError::Exhausted`] before anything is written
    /// - [`PoolError::Hold`] if the hold write fails (nothing was changed)
    /// - [`PoolError::PartialTransfer`] if the hold landed but the pool decrement failed
    ///
    /// A failing garbage collector check does not fail the transfer.
    #[tracing::instrument(skip(self, target), fields(order_id = %target.order_id, user_id = %target.user_id))]
    pub async fn transfer_to_order(
        &self,
        item_id: &PoolItemId,
        target: &TargetOrder,
    ) -> Result<TransferReceipt, PoolError> {
        let item = self
            .pool
            .get(item_id)
            .await?
            .ok_or_else(|| PoolError::NotFound(item_id.clone()))?;
        if item.is_exhausted() {
            return Err(PoolError::Exhausted(item_id.clone()));
        }

        let hold_key = target.hold_key(&item.product_id);
        let now = self.clock.now();
        let merging = target.clone();
        let update: HoldUpdateFn = Box::new(move |current: Option<HoldRecord>| {
            Some(merging.merge_unit(current, now))
        });
        let hold = self
            .holds
            .transaction(&hold_key, update)
            .await?
            .ok_or_else(|| {
                HoldStoreError::Backend(format!("hold transaction on {hold_key} stored nothing"))
            })?;
        tracing::debug!(hold = %hold_key, quantity = hold.quantity, "Hold merged");

        let remaining = match self
            .executor
            .adjust(item_id, QuantityAdjustment::Delta(-1), ClampPolicy::Transfer)
            .await
        {
            Ok(AdjustOutcome::Applied { quantity }) => quantity,
            Ok(AdjustOutcome::Missing) => {
                tracing::warn!(
                    item_id = %item_id,
                    hold = %hold_key,
                    "Pool record vanished after the hold was written"
                );
                0
            },
            Err(source) => {
                TransferMetrics::record_partial_failure();
                tracing::error!(
                    item_id = %item_id,
                    hold = %hold_key,
                    error = %source,
                    "Hold written but pool decrement failed; ledger is one unit ahead"
                );
                return Err(PoolError::PartialTransfer {
                    item_id: item_id.clone(),
                    hold: hold_key,
                    source,
                });
            },
        };

        let gc = match self.gc.collect(&item.product_id, item_id).await {
            Ok(outcome) => Some(outcome),
            Err(err) => {
                tracing::warn!(item_id = %item_id, error = %err, "Garbage collection check failed");
                None
            },
        };

        TransferMetrics::record_completed();
        tracing::info!(item_id = %item_id, remaining, "Unit transferred to order");
        Ok(TransferReceipt {
            hold_key,
            hold,
            remaining,
            gc,
        })
    }
}
