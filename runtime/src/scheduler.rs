//! Trailing-edge debounce for refreshes.
//!
//! Change events arrive in bursts (initial sync, a colleague adding twenty items). Each
//! one asks for a refresh; the scheduler turns a burst into a single refresh that runs
//! once the feed has been quiet for the configured window.

use droppool_core::environment::Timer;
use futures::future::BoxFuture;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Work run when the quiet window elapses.
pub type ScheduledAction = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Holds at most one pending run; every trigger restarts the window.
///
/// Must be used from inside a tokio runtime (triggering spawns a task).
///
/// # Example
///
/// ```
/// use droppool_runtime::{DebounceScheduler, TokioTimer};
/// use futures::FutureExt;
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # async fn example() {
/// let scheduler = DebounceScheduler::new(
///     Duration::from_millis(150),
///     Arc::new(TokioTimer),
///     Arc::new(|| async { println!("refresh") }.boxed()),
/// );
/// for _ in 0..10 {
///     scheduler.trigger();
/// }
/// tokio::time::sleep(Duration::from_millis(300)).await;
/// assert_eq!(scheduler.fire_count(), 1);
/// # }
/// ```
pub struct DebounceScheduler {
    window: Duration,
    timer: Arc<dyn Timer>,
    action: ScheduledAction,
    pending: Mutex<Option<PendingRun>>,
    running: Arc<tokio::sync::Mutex<()>>,
    fires: Arc<AtomicU64>,
}

/// The most recently scheduled run.
struct PendingRun {
    handle: JoinHandle<()>,
    /// Set once the quiet window elapsed; from then on the run is left to finish.
    fired: Arc<AtomicBool>,
}

impl PendingRun {
    fn is_waiting(&self) -> bool {
        !self.fired.load(Ordering::SeqCst)
    }
}

impl DebounceScheduler {
    /// Create an idle scheduler.
    #[must_use]
    pub fn new(window: Duration, timer: Arc<dyn Timer>, action: ScheduledAction) -> Self {
        Self {
            window,
            timer,
            action,
            pending: Mutex::new(None),
            running: Arc::new(tokio::sync::Mutex::new(())),
            fires: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Restart the quiet window.
    ///
    /// A run still waiting out its window is cancelled. A run whose window already
    /// elapsed is left to finish; the new run starts after it.
    pub fn trigger(&self) {
        // Deadline is fixed now, before the task is first polled.
        let sleep = self.timer.sleep(self.window);
        let action = Arc::clone(&self.action);
        let running = Arc::clone(&self.running);
        let fires = Arc::clone(&self.fires);
        let fired = Arc::new(AtomicBool::new(false));
        let fired_flag = Arc::clone(&fired);

        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = pending.take().filter(PendingRun::is_waiting) {
            previous.handle.abort();
        }
        let handle = tokio::spawn(async move {
            sleep.await;
            fired_flag.store(true, Ordering::SeqCst);
            let _serial = running.lock().await;
            action().await;
            fires.fetch_add(1, Ordering::SeqCst);
        });
        *pending = Some(PendingRun { handle, fired });
    }

    /// Drop the pending run, if any, including one whose action is under way.
    pub fn cancel(&self) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = pending.take() {
            previous.handle.abort();
        }
    }

    /// A run is scheduled and has not finished.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|run| !run.handle.is_finished())
    }

    /// Number of runs whose action completed.
    #[must_use]
    pub fn fire_count(&self) -> u64 {
        self.fires.load(Ordering::SeqCst)
    }

    /// Configured quiet window.
    #[must_use]
    pub const fn window(&self) -> Duration {
        self.window
    }
}

impl Drop for DebounceScheduler {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for DebounceScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DebounceScheduler")
            .field("window", &self.window)
            .field("fires", &self.fire_count())
            .finish_non_exhaustive()
    }
}
