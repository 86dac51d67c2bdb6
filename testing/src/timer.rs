//! Deterministic timer for debounce and settle-period tests.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Panics only on poisoned locks

use droppool_core::environment::{Sleep, Timer};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

/// A [`Timer`] whose time only moves when the test calls [`ManualTimer::advance`].
///
/// Each `sleep` registers its deadline immediately. `advance` moves virtual time forward
/// and completes every sleep whose deadline has been reached. Tasks woken that way still
/// need a chance to run; follow `advance` with [`run_pending_tasks`](crate::run_pending_tasks).
///
/// # Example
///
/// ```
/// use droppool_testing::ManualTimer;
/// use droppool_core::environment::Timer;
/// use std::time::Duration;
///
/// let timer = ManualTimer::new();
/// let _sleep = timer.sleep(Duration::from_millis(150));
/// assert_eq!(timer.pending(), 1);
/// timer.advance(Duration::from_millis(150));
/// assert_eq!(timer.pending(), 0);
/// ```
#[derive(Clone, Debug, Default)]
pub struct ManualTimer {
    state: Arc<Mutex<TimerState>>,
}

#[derive(Debug, Default)]
struct TimerState {
    now: Duration,
    sleepers: Vec<(Duration, oneshot::Sender<()>)>,
}

impl ManualTimer {
    /// Timer at virtual time zero with nothing pending.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Move virtual time forward, waking every sleep that is now due.
    pub fn advance(&self, by: Duration) {
        let mut state = self.state.lock().unwrap();
        state.now += by;
        let now = state.now;
        let (due, waiting): (Vec<_>, Vec<_>) = state
            .sleepers
            .drain(..)
            .partition(|(deadline, _)| *deadline <= now);
        state.sleepers = waiting;
        for (_, waker) in due {
            let _ = waker.send(());
        }
    }

    /// Virtual time elapsed since creation.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.state.lock().unwrap().now
    }

    /// Sleeps still waiting whose futures have not been dropped (cancelled).
    #[must_use]
    pub fn pending(&self) -> usize {
        let mut state = self.state.lock().unwrap();
        state.sleepers.retain(|(_, waker)| !waker.is_closed());
        state.sleepers.len()
    }
}

impl Timer for ManualTimer {
    fn sleep(&self, duration: Duration) -> Sleep {
        let (waker, wait) = oneshot::channel();
        {
            let mut state = self.state.lock().unwrap();
            let deadline = state.now + duration;
            if duration.is_zero() {
                let _ = waker.send(());
            } else {
                state.sleepers.push((deadline, waker));
            }
        }
        Box::pin(async move {
            let _ = wait.await;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn sleep_completes_only_after_deadline() {
        let timer = ManualTimer::new();
        let done = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&done);
        let sleep = timer.sleep(Duration::from_millis(100));
        tokio::spawn(async move {
            sleep.await;
            flag.store(true, Ordering::SeqCst);
        });

        timer.advance(Duration::from_millis(99));
        crate::run_pending_tasks().await;
        assert!(!done.load(Ordering::SeqCst));

        timer.advance(Duration::from_millis(1));
        crate::run_pending_tasks().await;
        assert!(done.load(Ordering::SeqCst));
        assert_eq!(timer.elapsed(), Duration::from_millis(100));
    }

    #[test]
    fn dropped_sleep_is_not_pending() {
        let timer = ManualTimer::new();
        let sleep = timer.sleep(Duration::from_secs(1));
        drop(sleep);
        assert_eq!(timer.pending(), 0);
    }
}
