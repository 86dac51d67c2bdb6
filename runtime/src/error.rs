//! Errors returned by pool operations.

use droppool_core::environment::Notification;
use droppool_core::hold_store::{HoldKey, HoldStoreError};
use droppool_core::ids::PoolItemId;
use droppool_core::pool_store::PoolStoreError;
use thiserror::Error;

/// Failure of a [`PoolManager`](crate::PoolManager) operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// Caller input rejected before touching the store.
    #[error("Invalid input: {0}")]
    Validation(String),

    /// The pool record does not exist.
    #[error("Pool item {0} not found")]
    NotFound(PoolItemId),

    /// The pool record has no free units to transfer.
    #[error("Pool item {0} has no free units")]
    Exhausted(PoolItemId),

    /// The hold was written but the pool decrement failed.
    ///
    /// The ledger now shows one more unit than the pool released. Nothing repairs this
    /// automatically; the garbage collector sweep keeps the pool side tidy.
    #[error("Transfer of {item_id} wrote hold {hold} but the pool decrement failed: {source}")]
    PartialTransfer {
        /// Pool record that should have been decremented
        item_id: PoolItemId,
        /// Hold that was written
        hold: HoldKey,
        /// Why the decrement failed
        #[source]
        source: PoolStoreError,
    },

    /// The pool store could not be reached during initialization.
    #[error("Pool store unavailable at startup: {0}")]
    StoreUnavailable(#[source] PoolStoreError),

    /// `init` has not completed (or `teardown` already ran).
    #[error("Pool manager is not initialized")]
    NotInitialized,

    /// Pool store failure.
    #[error(transparent)]
    Pool(#[from] PoolStoreError),

    /// Ledger failure.
    #[error(transparent)]
    Hold(#[from] HoldStoreError),
}

impl PoolError {
    /// User-facing notification for this failure.
    #[must_use]
    pub fn notification(&self) -> Notification {
        Notification::error(self.to_string())
    }
}

/// Shorthand for pool operation results.
pub type Result<T> = std::result::Result<T, PoolError>;
