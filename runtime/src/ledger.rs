//! Point-in-time scans of the reservation ledger.

use droppool_core::hold_store::{HoldStore, HoldStoreError, Holder};
use droppool_core::ids::ProductId;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Answers "who holds units of this product right now".
///
/// Both queries are one-shot reads across every order's hold namespace. They see the
/// ledger as it was at the moment of the scan; a transfer landing a millisecond later
/// is not reflected.
#[derive(Clone)]
pub struct LedgerScanner {
    store: Arc<dyn HoldStore>,
}

impl LedgerScanner {
    /// Scanner over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn HoldStore>) -> Self {
        Self { store }
    }

    /// Current holders of `product_id`, one row per (holder name, order label).
    ///
    /// Records with the same name and label (one person holding through several user
    /// accounts, or a label shared by two orders) are merged and their quantities
    /// summed. Rows are ordered by name, then label.
    ///
    /// # Errors
    ///
    /// Ledger read failures.
    pub async fn get_holders(&self, product_id: &ProductId) -> Result<Vec<Holder>, HoldStoreError> {
        let holds = self.store.list_holds(product_id).await?;

        let mut merged: BTreeMap<(String, String), u32> = BTreeMap::new();
        for (_, record) in holds.into_iter().filter(|(_, r)| r.quantity > 0) {
            let slot = merged
                .entry((record.display_name, record.order_label))
                .or_default();
            *slot = slot.saturating_add(record.quantity);
        }

        let holders: Vec<Holder> = merged
            .into_iter()
            .map(|((name, order_label), quantity)| Holder {
                name,
                order_label,
                quantity,
            })
            .collect();
        tracing::trace!(product_id = %product_id, holders = holders.len(), "Ledger scanned");
        Ok(holders)
    }

    /// Whether any order holds at least one unit of `product_id`.
    ///
    /// # Errors
    ///
    /// Ledger read failures.
    pub async fn is_still_held(&self, product_id: &ProductId) -> Result<bool, HoldStoreError> {
        let holds = self.store.list_holds(product_id).await?;
        Ok(holds.iter().any(|(_, record)| record.quantity > 0))
    }
}
