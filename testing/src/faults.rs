//! Failure injection shared by the in-memory stores.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Switches a test flips to make a store misbehave.
#[derive(Debug, Default)]
pub struct Faults {
    unavailable: AtomicBool,
    next_write: Mutex<Option<String>>,
}

impl Faults {
    /// Make every call fail as if the store were unreachable (or recover).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Whether the store currently pretends to be unreachable.
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        self.unavailable.load(Ordering::SeqCst)
    }

    /// Fail the next write (push/transaction/remove) with `message`.
    pub fn fail_next_write(&self, message: impl Into<String>) {
        *self.next_write.lock().unwrap() = Some(message.into());
    }

    /// Consume a pending write failure, if armed.
    #[must_use]
    pub fn take_write_failure(&self) -> Option<String> {
        self.next_write.lock().unwrap().take()
    }
}
