//! The reservation ledger contract.
//!
//! Every order owns a hold namespace; inside it a record is addressed by
//! (product, user). A [`HoldRecord`] is one staff member's claim on some units of one
//! product for one order. The ledger lives in the same external store as the pool but is
//! written independently: nothing ties a hold write to a pool write atomically.

use crate::ids::{OrderId, ProductId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors surfaced by a [`HoldStore`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HoldStoreError {
    /// The store cannot be reached.
    #[error("Hold store unavailable: {0}")]
    Unavailable(String),

    /// A transaction gave up after repeated write conflicts.
    #[error("Hold transaction on {key} abandoned after {attempts} conflicting attempts")]
    Conflict {
        /// Record the transaction targeted
        key: HoldKey,
        /// Number of attempts made
        attempts: u32,
    },

    /// Any other backend failure.
    #[error("Hold store error: {0}")]
    Backend(String),
}

/// Address of one hold record: `orders/{order}/holds/{product}/{user}`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HoldKey {
    /// Product being held
    pub product_id: ProductId,
    /// Order the hold belongs to
    pub order_id: OrderId,
    /// Staff member who placed it
    pub user_id: UserId,
}

impl HoldKey {
    /// Build a key.
    #[must_use]
    pub fn new(
        product_id: impl Into<ProductId>,
        order_id: impl Into<OrderId>,
        user_id: impl Into<UserId>,
    ) -> Self {
        Self {
            product_id: product_id.into(),
            order_id: order_id.into(),
            user_id: user_id.into(),
        }
    }
}

impl fmt::Display for HoldKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "orders/{}/holds/{}/{}",
            self.order_id, self.product_id, self.user_id
        )
    }
}

/// One user's claim against one product for one order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HoldRecord {
    /// Units held (positive while the record exists)
    pub quantity: u32,
    /// Order not yet finalised
    pub is_draft: bool,
    /// Name of the holder as shown to other staff
    pub display_name: String,
    /// Campaign / sequence label of the order
    pub order_label: String,
    /// Last write time
    pub timestamp: DateTime<Utc>,
}

/// The order receiving a unit in a hold transfer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetOrder {
    /// Receiving order
    pub order_id: OrderId,
    /// Staff member doing the transfer
    pub user_id: UserId,
    /// Holder name shown to other staff
    pub display_name: String,
    /// Campaign / sequence label
    pub order_label: String,
    /// Order still a draft
    pub is_draft: bool,
}

impl TargetOrder {
    /// Ledger key of this order's hold on `product_id`.
    #[must_use]
    pub fn hold_key(&self, product_id: &ProductId) -> HoldKey {
        HoldKey {
            product_id: product_id.clone(),
            order_id: self.order_id.clone(),
            user_id: self.user_id.clone(),
        }
    }

    /// Merge one more unit into `current`, or open a new hold of one unit.
    #[must_use]
    pub fn merge_unit(&self, current: Option<HoldRecord>, now: DateTime<Utc>) -> HoldRecord {
        match current {
            Some(mut record) => {
                record.quantity = record.quantity.saturating_add(1);
                record.timestamp = now;
                record
            },
            None => HoldRecord {
                quantity: 1,
                is_draft: self.is_draft,
                display_name: self.display_name.clone(),
                order_label: self.order_label.clone(),
                timestamp: now,
            },
        }
    }
}

/// One row of a holder scan.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Holder {
    /// Holder name
    pub name: String,
    /// Order label
    pub order_label: String,
    /// Units held
    pub quantity: u32,
}

/// Update function handed to [`HoldStore::transaction`]; same contract as the pool's:
/// `None` in means absent, `None` out means "write nothing". May run more than once.
pub type HoldUpdateFn = Box<dyn FnMut(Option<HoldRecord>) -> Option<HoldRecord> + Send>;

/// Boxed future returned by every ledger call.
pub type HoldStoreFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, HoldStoreError>> + Send + 'a>>;

/// Contract of the per-order hold namespaces.
///
/// `list_holds` is the repository view of "scan every order for this product". Whether
/// an implementation walks all orders or consults an index is its own business; callers
/// only rely on it being a point-in-time read.
pub trait HoldStore: Send + Sync {
    /// Atomically read-modify-write one hold record. Returns the record as stored after
    /// the transaction.
    ///
    /// # Errors
    ///
    /// [`HoldStoreError::Conflict`] if the store gives up retrying, or backend failures.
    fn transaction(
        &self,
        key: &HoldKey,
        update: HoldUpdateFn,
    ) -> HoldStoreFuture<'_, Option<HoldRecord>>;

    /// One-shot read of a hold record.
    ///
    /// # Errors
    ///
    /// Backend failures.
    fn read(&self, key: &HoldKey) -> HoldStoreFuture<'_, Option<HoldRecord>>;

    /// One-shot scan of every order's hold on `product_id`.
    ///
    /// # Errors
    ///
    /// Backend failures.
    fn list_holds(&self, product_id: &ProductId)
    -> HoldStoreFuture<'_, Vec<(HoldKey, HoldRecord)>>;

    /// Delete a hold record (the order released it). Deleting a missing record succeeds.
    ///
    /// # Errors
    ///
    /// Backend failures.
    fn remove(&self, key: &HoldKey) -> HoldStoreFuture<'_, ()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> TargetOrder {
        TargetOrder {
            order_id: OrderId::new("o-7"),
            user_id: UserId::new("u-ana"),
            display_name: "Ana".to_string(),
            order_label: "Spring/07".to_string(),
            is_draft: true,
        }
    }

    #[test]
    fn merge_opens_a_new_hold_with_one_unit() {
        let now = Utc::now();
        let record = target().merge_unit(None, now);
        assert_eq!(record.quantity, 1);
        assert!(record.is_draft);
        assert_eq!(record.order_label, "Spring/07");
    }

    #[test]
    fn merge_increments_an_existing_hold() {
        let now = Utc::now();
        let first = target().merge_unit(None, now);
        let second = target().merge_unit(Some(first), now);
        assert_eq!(second.quantity, 2);
    }

    #[test]
    fn key_renders_as_ledger_path() {
        let key = target().hold_key(&ProductId::new("p-1"));
        assert_eq!(key.to_string(), "orders/o-7/holds/p-1/u-ana");
    }
}
