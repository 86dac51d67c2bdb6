//! # Droppool Core
//!
//! Core types and contracts for the shared dropped-stock pool.
//!
//! Several staff members browse one pool of discounted items and move units into their
//! own in-progress orders at the same time. The only coordination available is a
//! replicated record store offering per-record atomic transactions and a change feed.
//! This crate fixes the vocabulary every other crate speaks:
//!
//! - **Records**: [`PoolItem`](pool_store::PoolItem) and [`HoldRecord`](hold_store::HoldRecord)
//! - **Store contracts**: [`PoolStore`](pool_store::PoolStore) and [`HoldStore`](hold_store::HoldStore)
//! - **Mirror**: the pure [`MirrorReducer`](mirror::MirrorReducer) that rebuilds local
//!   state from the change feed
//! - **Environment**: injected collaborators (clock, timer, refresh sink, notifier)
//!
//! ## Architecture Principles
//!
//! - Remote first: local state changes only through confirmed change events
//! - Functional core: reconciliation is a reducer returning effect descriptions
//! - Dependency injection: every external collaborator is a trait object
//!
//! ## Example
//!
//! ```
//! use droppool_core::mirror::{MirrorAction, MirrorReducer, MirrorState};
//! use droppool_core::reducer::Reducer;
//!
//! let mut state = MirrorState::new();
//! let effects = MirrorReducer::new().reduce(&mut state, MirrorAction::InitialSyncSettled, &());
//! assert!(state.is_initial_sync_settled());
//! assert_eq!(effects.len(), 1);
//! ```

pub mod hold_store;
pub mod ids;
pub mod mirror;
pub mod pool_store;

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use rust_decimal::Decimal;
pub use serde::{Deserialize, Serialize};
pub use smallvec::{SmallVec, smallvec};

/// Reducer module - the core trait for pure state transitions
///
/// Reducers are pure functions: `(State, Action, Environment) → (State, Effects)`.
/// They never touch the network, the clock or a logger; whatever should happen as a
/// consequence is returned as [`Effect`](crate::effect::Effect) values.
pub mod reducer {
    use super::SmallVec;
    use super::effect::Effect;

    /// The Reducer trait
    ///
    /// # Type Parameters
    ///
    /// - `State`: The state this reducer operates on
    /// - `Action`: The inputs it accepts
    /// - `Environment`: Injected dependencies (often `()`)
    pub trait Reducer {
        /// The state type this reducer operates on
        type State;

        /// The action type this reducer processes
        type Action;

        /// The environment type with injected dependencies
        type Environment;

        /// Reduce an action into state changes and effects
        ///
        /// # Arguments
        ///
        /// - `state`: Mutable reference to current state
        /// - `action`: The action to process
        /// - `env`: Reference to injected dependencies
        ///
        /// # Returns
        ///
        /// Effects for the runtime shell to execute, in order
        fn reduce(
            &self,
            state: &mut Self::State,
            action: Self::Action,
            env: &Self::Environment,
        ) -> SmallVec<[Effect; 4]>;
    }
}

/// Effect module - side effect descriptions
///
/// Effects are values, not execution. The runtime decides how to perform them.
pub mod effect {
    use crate::mirror::MirrorAnomaly;

    /// A side effect requested by a reducer.
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum Effect {
        /// Nothing to do
        None,

        /// Request a coalesced refresh (render + holder recount).
        ///
        /// Always routed through the debounce scheduler; nothing renders synchronously
        /// from inside event handling.
        ScheduleRefresh,

        /// A change event that could not be applied as-is
        Anomaly(MirrorAnomaly),
    }

    impl Effect {
        /// Whether this effect asks for a refresh.
        #[must_use]
        pub const fn is_refresh(&self) -> bool {
            matches!(self, Self::ScheduleRefresh)
        }
    }
}

/// Environment module - dependency injection traits
///
/// All external collaborators are abstracted behind traits and injected, so tests can
/// swap in deterministic versions.
pub mod environment {
    use crate::hold_store::Holder;
    use crate::pool_store::PoolItem;
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Serialize};
    use std::future::Future;
    use std::pin::Pin;
    use std::time::Duration;

    /// Clock trait - abstracts wall-clock time for testability
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time.
    #[derive(Clone, Copy, Debug, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }

    /// Future returned by [`Timer::sleep`].
    pub type Sleep = Pin<Box<dyn Future<Output = ()> + Send>>;

    /// Timer trait - source of delays for debouncing and settle periods.
    ///
    /// The deadline is fixed when `sleep` is called, not when the future is first
    /// polled. A deterministic test timer relies on this.
    pub trait Timer: Send + Sync {
        /// A future completing once `duration` has elapsed.
        fn sleep(&self, duration: Duration) -> Sleep;
    }

    /// One pool entry together with who currently holds units of its product.
    #[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
    pub struct PoolItemView {
        /// The mirrored record
        pub item: PoolItem,
        /// Current holders (empty when holder recount is disabled)
        pub holders: Vec<Holder>,
    }

    impl PoolItemView {
        /// Units of this product held across all orders.
        #[must_use]
        pub fn held_units(&self) -> u64 {
            self.holders.iter().map(|h| u64::from(h.quantity)).sum()
        }
    }

    /// Payload of one coalesced refresh.
    #[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct PoolView {
        /// Entries in mirror order
        pub items: Vec<PoolItemView>,
    }

    impl PoolView {
        /// Free units across the pool.
        #[must_use]
        pub fn free_units(&self) -> u64 {
            self.items.iter().map(|v| u64::from(v.item.quantity)).sum()
        }

        /// Held units across the pool.
        #[must_use]
        pub fn held_units(&self) -> u64 {
            self.items.iter().map(PoolItemView::held_units).sum()
        }
    }

    /// Receiver of coalesced refreshes (the rendering layer).
    pub trait RefreshSink: Send + Sync {
        /// Replace whatever is displayed with `view`.
        fn refresh(&self, view: PoolView);
    }

    /// Severity of a user-visible notification.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
    pub enum NotificationLevel {
        /// Operation succeeded
        Success,
        /// Something needs attention
        Warning,
        /// Operation failed
        Error,
    }

    /// A toast-style message for the user.
    #[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Notification {
        /// Severity
        pub level: NotificationLevel,
        /// Human-readable text
        pub message: String,
    }

    impl Notification {
        /// Error notification.
        #[must_use]
        pub fn error(message: impl Into<String>) -> Self {
            Self {
                level: NotificationLevel::Error,
                message: message.into(),
            }
        }

        /// Warning notification.
        #[must_use]
        pub fn warning(message: impl Into<String>) -> Self {
            Self {
                level: NotificationLevel::Warning,
                message: message.into(),
            }
        }

        /// Success notification.
        #[must_use]
        pub fn success(message: impl Into<String>) -> Self {
            Self {
                level: NotificationLevel::Success,
                message: message.into(),
            }
        }
    }

    /// User-visible notification surface.
    pub trait Notifier: Send + Sync {
        /// Show `notification` to the user.
        fn notify(&self, notification: Notification);
    }
}
