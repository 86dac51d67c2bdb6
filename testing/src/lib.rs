//! # Droppool Testing
//!
//! Testing utilities and helpers for the shared dropped-stock pool.
//!
//! This crate provides:
//! - In-memory [`PoolStore`](droppool_core::pool_store::PoolStore) and
//!   [`HoldStore`](droppool_core::hold_store::HoldStore) with real write races
//! - A [`ManualTimer`] for deterministic debounce tests
//! - Recording mocks for the refresh sink and the notifier
//! - A Given-When-Then harness for reducers
//! - Fixtures and proptest strategies
//!
//! ## Example
//!
//! ```
//! use droppool_testing::{InMemoryPoolStore, fixtures};
//!
//! let store = InMemoryPoolStore::new();
//! let id = store.seed(fixtures::new_item("p-1", 3));
//! assert_eq!(store.quantity_of(&id), Some(3));
//! ```

use chrono::{DateTime, Utc};
use droppool_core::environment::Clock;

pub mod faults;
pub mod hold_store;
pub mod pool_store;
pub mod timer;

/// Mock implementations of Environment traits.
pub mod mocks {
    #![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
    #![allow(clippy::missing_panics_doc)] // Panics only on poisoned locks

    use super::{Clock, DateTime, Utc};
    use droppool_core::environment::{
        Notification, NotificationLevel, Notifier, PoolView, RefreshSink,
    };
    use std::sync::Mutex;

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use droppool_testing::mocks::FixedClock;
    /// use droppool_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }

    /// Refresh sink that keeps every view it receives.
    #[derive(Debug, Default)]
    pub struct RecordingSink {
        views: Mutex<Vec<PoolView>>,
    }

    impl RecordingSink {
        /// Empty recorder.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Refreshes received so far.
        #[must_use]
        pub fn count(&self) -> usize {
            self.views.lock().unwrap().len()
        }

        /// Most recent view.
        #[must_use]
        pub fn last(&self) -> Option<PoolView> {
            self.views.lock().unwrap().last().cloned()
        }

        /// Every view, oldest first.
        #[must_use]
        pub fn views(&self) -> Vec<PoolView> {
            self.views.lock().unwrap().clone()
        }
    }

    impl RefreshSink for RecordingSink {
        fn refresh(&self, view: PoolView) {
            self.views.lock().unwrap().push(view);
        }
    }

    /// Notifier that keeps every notification.
    #[derive(Debug, Default)]
    pub struct RecordingNotifier {
        notifications: Mutex<Vec<Notification>>,
    }

    impl RecordingNotifier {
        /// Empty recorder.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Every notification, oldest first.
        #[must_use]
        pub fn notifications(&self) -> Vec<Notification> {
            self.notifications.lock().unwrap().clone()
        }

        /// Notifications at one level.
        #[must_use]
        pub fn at_level(&self, level: NotificationLevel) -> Vec<Notification> {
            self.notifications
                .lock()
                .unwrap()
                .iter()
                .filter(|n| n.level == level)
                .cloned()
                .collect()
        }

        /// Error notifications.
        #[must_use]
        pub fn errors(&self) -> Vec<Notification> {
            self.at_level(NotificationLevel::Error)
        }
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, notification: Notification) {
            self.notifications.lock().unwrap().push(notification);
        }
    }
}

/// Builders for common test records.
pub mod fixtures {
    use chrono::Utc;
    use droppool_core::Decimal;
    use droppool_core::hold_store::TargetOrder;
    use droppool_core::ids::PoolItemId;
    use droppool_core::pool_store::{NewPoolItem, PoolItem, ProductInfo};

    /// Product named after its id.
    #[must_use]
    pub fn product(product_id: &str) -> ProductInfo {
        ProductInfo::new(product_id, format!("Product {product_id}"), product_id.to_uppercase())
            .with_unit_price(Decimal::new(499, 2))
    }

    /// New pool record for `product_id` with `quantity` units.
    #[must_use]
    pub fn new_item(product_id: &str, quantity: u32) -> NewPoolItem {
        NewPoolItem {
            product: product(product_id),
            quantity,
            reason: "short expiry".to_string(),
            added_at: Utc::now(),
        }
    }

    /// Stored pool record with an explicit id.
    #[must_use]
    pub fn pool_item(id: &str, product_id: &str, quantity: u32) -> PoolItem {
        new_item(product_id, quantity).into_item(PoolItemId::new(id))
    }

    /// Draft order receiving transferred units.
    #[must_use]
    pub fn target_order(order_id: &str, user_id: &str, display_name: &str) -> TargetOrder {
        TargetOrder {
            order_id: order_id.into(),
            user_id: user_id.into(),
            display_name: display_name.to_string(),
            order_label: format!("Campaign {order_id}"),
            is_draft: true,
        }
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use proptest::prelude::*;

    /// Starting stock for a pool record.
    pub fn stock() -> impl Strategy<Value = u32> {
        0u32..50
    }

    /// Signed quantity deltas as applied by staff adjustments.
    pub fn deltas(max_len: usize) -> impl Strategy<Value = Vec<i64>> {
        prop::collection::vec(-5i64..=5, 1..=max_len)
    }
}

/// Yield to the scheduler enough times for freshly woken tasks to run to their next
/// await point.
pub async fn run_pending_tasks() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

/// Install a test-friendly tracing subscriber. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

// Re-export commonly used items
pub use hold_store::InMemoryHoldStore;
pub use mocks::{FixedClock, RecordingNotifier, RecordingSink, test_clock};
pub use pool_store::InMemoryPoolStore;
pub use reducer_test::{ReducerTest, assertions};
pub use timer::ManualTimer;
