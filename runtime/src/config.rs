//! Runtime configuration.
//!
//! Loads configuration from environment variables with sensible defaults. Unparseable
//! values fall back to the default rather than failing startup.

use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Quiet window of the refresh debounce.
pub const DEFAULT_DEBOUNCE_WINDOW: Duration = Duration::from_millis(150);

/// Delay after subscribing before the initial load counts as settled.
pub const DEFAULT_INITIAL_SYNC_DELAY: Duration = Duration::from_millis(1500);

/// Settings of one [`PoolManager`](crate::PoolManager).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Refresh debounce quiet window
    pub debounce_window: Duration,
    /// Time after subscribing until per-item logging is promoted from trace to debug
    pub initial_sync_delay: Duration,
    /// Backoff for opening the change feed
    pub subscribe_retry: RetryPolicy,
    /// Recompute holders for every item on each refresh
    pub refresh_holder_counts: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            debounce_window: DEFAULT_DEBOUNCE_WINDOW,
            initial_sync_delay: DEFAULT_INITIAL_SYNC_DELAY,
            subscribe_retry: RetryPolicy::default(),
            refresh_holder_counts: true,
        }
    }
}

impl PoolConfig {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `DROPPOOL_DEBOUNCE_MS` | 150 |
    /// | `DROPPOOL_INITIAL_SYNC_DELAY_MS` | 1500 |
    /// | `DROPPOOL_SUBSCRIBE_RETRIES` | 3 |
    /// | `DROPPOOL_SUBSCRIBE_BACKOFF_MS` | 100 |
    /// | `DROPPOOL_REFRESH_HOLDERS` | true |
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an explicit variable source.
    #[must_use]
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let millis = |key: &str| {
            lookup(key)
                .and_then(|s| s.trim().parse::<u64>().ok())
                .map(Duration::from_millis)
        };

        let subscribe_retry = RetryPolicy::builder()
            .max_retries(
                lookup("DROPPOOL_SUBSCRIBE_RETRIES")
                    .and_then(|s| s.trim().parse().ok())
                    .unwrap_or(defaults.subscribe_retry.max_retries),
            )
            .initial_delay(
                millis("DROPPOOL_SUBSCRIBE_BACKOFF_MS")
                    .unwrap_or(defaults.subscribe_retry.initial_delay),
            )
            .build();

        Self {
            debounce_window: millis("DROPPOOL_DEBOUNCE_MS").unwrap_or(defaults.debounce_window),
            initial_sync_delay: millis("DROPPOOL_INITIAL_SYNC_DELAY_MS")
                .unwrap_or(defaults.initial_sync_delay),
            subscribe_retry,
            refresh_holder_counts: lookup("DROPPOOL_REFRESH_HOLDERS")
                .and_then(|s| parse_bool(&s))
                .unwrap_or(defaults.refresh_holder_counts),
        }
    }

    /// Set the debounce window.
    #[must_use]
    pub const fn with_debounce_window(mut self, window: Duration) -> Self {
        self.debounce_window = window;
        self
    }

    /// Set the initial sync settle delay.
    #[must_use]
    pub const fn with_initial_sync_delay(mut self, delay: Duration) -> Self {
        self.initial_sync_delay = delay;
        self
    }

    /// Set the subscribe retry policy.
    #[must_use]
    pub fn with_subscribe_retry(mut self, policy: RetryPolicy) -> Self {
        self.subscribe_retry = policy;
        self
    }

    /// Enable or disable per-refresh holder recounts.
    #[must_use]
    pub const fn with_holder_counts(mut self, enabled: bool) -> Self {
        self.refresh_holder_counts = enabled;
        self
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
