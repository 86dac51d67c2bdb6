//! The pool collection contract and its record types.
//!
//! The pool is a replicated collection of [`PoolItem`] records shared by every client.
//! The backing store is an external collaborator; this module fixes only what the
//! reconciliation logic needs from it:
//!
//! - `subscribe`: a change feed of added/changed/removed records
//! - `get` / `push` / `remove`: plain single-record access
//! - `transaction`: atomic read-modify-write of one record, retried by the store on
//!   write conflicts
//!
//! There is no multi-record transaction and no query by product. Anything that spans
//! records (a hold transfer, a merge-on-add) is a sequence of independent calls.
//!
//! # Implementations
//!
//! - `InMemoryPoolStore` (in `droppool-testing`): racing-writer store for tests and demos

use crate::ids::{PoolItemId, ProductId};
use chrono::{DateTime, Utc};
use futures::Stream;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors surfaced by a [`PoolStore`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolStoreError {
    /// The store cannot be reached.
    #[error("Pool store unavailable: {0}")]
    Unavailable(String),

    /// A transaction gave up after repeated write conflicts.
    #[error("Transaction on {id} abandoned after {attempts} conflicting attempts")]
    Conflict {
        /// Record the transaction targeted
        id: PoolItemId,
        /// Number of attempts made
        attempts: u32,
    },

    /// The change feed dropped events (the subscriber fell behind).
    #[error("Change feed lagged, {0} events skipped")]
    Lagged(u64),

    /// Any other backend failure.
    #[error("Pool store error: {0}")]
    Backend(String),
}

impl PoolStoreError {
    /// Whether retrying the same call later can reasonably succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Conflict { .. })
    }
}

/// Product fields a collaborator supplies when contributing stock to the pool.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductInfo {
    /// Catalogue id
    pub product_id: ProductId,
    /// Name shown to staff
    pub display_name: String,
    /// Article code / SKU
    pub code: String,
    /// Product image, if any
    pub image_url: Option<String>,
    /// Discounted unit price
    pub unit_price: Decimal,
    /// Unit of measure ("pcs", "kg", ...)
    pub unit: String,
}

impl ProductInfo {
    /// Minimal product description; image and price can be set with the builders.
    #[must_use]
    pub fn new(
        product_id: impl Into<ProductId>,
        display_name: impl Into<String>,
        code: impl Into<String>,
    ) -> Self {
        Self {
            product_id: product_id.into(),
            display_name: display_name.into(),
            code: code.into(),
            image_url: None,
            unit_price: Decimal::ZERO,
            unit: "pcs".to_string(),
        }
    }

    /// Set the unit price.
    #[must_use]
    pub fn with_unit_price(mut self, unit_price: Decimal) -> Self {
        self.unit_price = unit_price;
        self
    }

    /// Set the image URL.
    #[must_use]
    pub fn with_image_url(mut self, url: impl Into<String>) -> Self {
        self.image_url = Some(url.into());
        self
    }

    /// Set the unit of measure.
    #[must_use]
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }
}

/// A pool record before the store has assigned it an id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPoolItem {
    /// Product description
    pub product: ProductInfo,
    /// Units contributed
    pub quantity: u32,
    /// Why the stock was dropped into the pool
    pub reason: String,
    /// When it was contributed
    pub added_at: DateTime<Utc>,
}

impl NewPoolItem {
    /// Attach the store-assigned id.
    #[must_use]
    pub fn into_item(self, id: PoolItemId) -> PoolItem {
        PoolItem {
            id,
            product_id: self.product.product_id,
            display_name: self.product.display_name,
            code: self.product.code,
            image_url: self.product.image_url,
            unit_price: self.product.unit_price,
            quantity: self.quantity,
            unit: self.product.unit,
            reason: self.reason,
            added_at: self.added_at,
        }
    }
}

/// One entry of the shared pool.
///
/// `quantity == 0` means every unit is currently allocated to in-progress orders; the
/// record survives until the garbage collector finds no remaining holders.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolItem {
    /// Store-assigned key
    pub id: PoolItemId,
    /// Catalogue id
    pub product_id: ProductId,
    /// Name shown to staff
    pub display_name: String,
    /// Article code / SKU
    pub code: String,
    /// Product image, if any
    pub image_url: Option<String>,
    /// Discounted unit price
    pub unit_price: Decimal,
    /// Free units
    pub quantity: u32,
    /// Unit of measure
    pub unit: String,
    /// Why the stock was dropped into the pool
    pub reason: String,
    /// When it was first contributed
    pub added_at: DateTime<Utc>,
}

impl PoolItem {
    /// No free units left.
    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        self.quantity == 0
    }

    /// Case-insensitive match of an already lower-cased needle against the display
    /// name, code and reason.
    #[must_use]
    pub fn matches_lowercase(&self, needle: &str) -> bool {
        [&self.display_name, &self.code, &self.reason]
            .iter()
            .any(|field| field.to_lowercase().contains(needle))
    }
}

/// A change notification from the pool collection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolChange {
    /// A record appeared (also replayed for every existing record on subscribe).
    Added(PoolItem),
    /// A record was rewritten; carries the full new value.
    Changed(PoolItem),
    /// A record was deleted.
    Removed(PoolItemId),
}

impl PoolChange {
    /// Id of the record this change concerns.
    #[must_use]
    pub const fn id(&self) -> &PoolItemId {
        match self {
            Self::Added(item) | Self::Changed(item) => &item.id,
            Self::Removed(id) => id,
        }
    }

    /// Short label for logs and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Added(_) => "added",
            Self::Changed(_) => "changed",
            Self::Removed(_) => "removed",
        }
    }
}

/// Result of a single-record transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransactionOutcome {
    /// Whether a new value was written.
    pub committed: bool,
    /// The record as it stands after the transaction (`None` if absent).
    pub snapshot: Option<PoolItem>,
}

/// Update function handed to [`PoolStore::transaction`].
///
/// Receives the current value (`None` if the record does not exist) and returns the
/// value to write. Returning `None` aborts without writing, which is how a transaction
/// on a concurrently deleted record becomes a no-op. The store may call it several times
/// when it retries after a conflict, so it must be free of side effects.
pub type PoolUpdateFn = Box<dyn FnMut(Option<PoolItem>) -> Option<PoolItem> + Send>;

/// Stream of changes from a subscription. Dropping it unsubscribes.
pub type ChangeStream = Pin<Box<dyn Stream<Item = Result<PoolChange, PoolStoreError>> + Send>>;

/// Boxed future returned by every store call.
pub type PoolStoreFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, PoolStoreError>> + Send + 'a>>;

/// Contract of the replicated pool collection.
///
/// # Ordering
///
/// Changes for one record arrive in the order writes were applied. Changes for
/// different records carry no relative ordering guarantee.
///
/// # Dyn Compatibility
///
/// Methods return boxed futures so the store can be shared as `Arc<dyn PoolStore>`.
pub trait PoolStore: Send + Sync {
    /// Open a change feed. Existing records are delivered first as
    /// [`PoolChange::Added`], followed by live changes.
    ///
    /// # Errors
    ///
    /// [`PoolStoreError::Unavailable`] if the store cannot be reached.
    fn subscribe(&self) -> PoolStoreFuture<'_, ChangeStream>;

    /// Read one record.
    ///
    /// # Errors
    ///
    /// Backend failures.
    fn get(&self, id: &PoolItemId) -> PoolStoreFuture<'_, Option<PoolItem>>;

    /// Create a record and return its store-assigned id.
    ///
    /// # Errors
    ///
    /// Backend failures.
    fn push(&self, item: NewPoolItem) -> PoolStoreFuture<'_, PoolItemId>;

    /// Atomically read-modify-write one record, retrying internally on conflicts.
    ///
    /// # Errors
    ///
    /// [`PoolStoreError::Conflict`] if the store gives up retrying, or backend failures.
    /// A missing record is not an error.
    fn transaction(
        &self,
        id: &PoolItemId,
        update: PoolUpdateFn,
    ) -> PoolStoreFuture<'_, TransactionOutcome>;

    /// Delete a record. Deleting a missing record succeeds.
    ///
    /// # Errors
    ///
    /// Backend failures.
    fn remove(&self, id: &PoolItemId) -> PoolStoreFuture<'_, ()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(name: &str, code: &str, reason: &str) -> PoolItem {
        NewPoolItem {
            product: ProductInfo::new("p-1", name, code),
            quantity: 1,
            reason: reason.to_string(),
            added_at: Utc::now(),
        }
        .into_item(PoolItemId::new("i-1"))
    }

    #[test]
    fn matches_any_searchable_field() {
        let it = item("Olive Oil 1L", "OO-100", "Dented can");
        assert!(it.matches_lowercase("olive"));
        assert!(it.matches_lowercase("oo-1"));
        assert!(it.matches_lowercase("dented"));
        assert!(!it.matches_lowercase("vinegar"));
    }

    #[test]
    fn change_reports_its_record_id() {
        let it = item("Olive Oil", "OO", "x");
        assert_eq!(PoolChange::Added(it.clone()).id().as_str(), "i-1");
        assert_eq!(PoolChange::Removed(it.id.clone()).kind(), "removed");
    }

    #[test]
    fn transient_errors() {
        assert!(PoolStoreError::Unavailable("down".into()).is_transient());
        assert!(!PoolStoreError::Backend("bad".into()).is_transient());
    }
}
