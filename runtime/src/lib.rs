//! # Droppool Runtime
//!
//! The imperative shell of the shared stock pool.
//!
//! `droppool-core` describes the data and the pure mirror reducer. This crate runs them:
//! it subscribes to the pool store, feeds change events through the reducer, debounces
//! refreshes, and implements the operations staff clients call (adding stock, moving a
//! unit into an order, garbage-collecting exhausted records).
//!
//! ## Core Components
//!
//! - **[`PoolManager`]**: lifecycle (`init` / `teardown`) and every pool operation
//! - **[`MirrorConsumer`]**: drains the change feed into the local mirror
//! - **[`DebounceScheduler`]**: coalesces bursts of changes into one refresh
//! - **[`TransactionExecutor`]**: atomic read-modify-write on a single pool record
//! - **[`HoldTransfer`]**: hold merge, pool decrement, garbage collection
//! - **[`LedgerScanner`]** / **[`GarbageCollector`]**: who holds what, and when a record can go
//!
//! ## Example
//!
//! ```ignore
//! use droppool_runtime::{PoolConfig, PoolEnvironment, PoolManager};
//!
//! let env = PoolEnvironment::new(pool_store, hold_store, sink, notifier);
//! let manager = PoolManager::new(env, PoolConfig::from_env());
//! manager.init().await?;
//!
//! let id = manager.add_item(product, 3, "short expiry").await?;
//! manager.transfer_to_order(&id, &order).await?;
//!
//! manager.teardown().await;
//! ```

use droppool_core::environment::{Sleep, Timer};
use std::time::Duration;

/// Configuration loaded from the environment
pub mod config;

/// Change feed consumer and the coalesced refresh job
pub mod consumer;

/// Error types for pool operations
pub mod error;

/// Garbage collection of exhausted pool records
pub mod gc;

/// Read-only scans over the hold ledger
pub mod ledger;

/// The pool manager and its environment
pub mod manager;

/// Prometheus metrics for observability
pub mod metrics;

/// Retry logic with exponential backoff
pub mod retry;

/// Trailing-edge debounce
pub mod scheduler;

/// Atomic quantity adjustments
pub mod transaction;

/// Moving pool units into orders
pub mod transfer;

pub use config::PoolConfig;
pub use consumer::{MirrorConsumer, RefreshJob};
pub use error::{PoolError, Result};
pub use gc::{GarbageCollector, GcOutcome, RetainReason};
pub use ledger::LedgerScanner;
pub use manager::{PoolEnvironment, PoolManager};
pub use metrics::MetricsRecorder;
pub use retry::RetryPolicy;
pub use scheduler::{DebounceScheduler, ScheduledAction};
pub use transaction::{AdjustOutcome, ClampPolicy, QuantityAdjustment, TransactionExecutor};
pub use transfer::{HoldTransfer, TransferReceipt};

/// [`Timer`] backed by `tokio::time`.
///
/// Honours paused time, so `#[tokio::test(start_paused = true)]` works with it.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioTimer;

impl Timer for TokioTimer {
    fn sleep(&self, duration: Duration) -> Sleep {
        Box::pin(tokio::time::sleep(duration))
    }
}
