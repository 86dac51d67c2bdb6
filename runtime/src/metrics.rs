//! Prometheus metrics for the pool runtime.
//!
//! Every component records through the `metrics` facade; nothing is collected unless a
//! recorder is installed. [`MetricsRecorder`] installs the Prometheus exporter and
//! renders the text exposition for whoever serves it.
//!
//! # Example
//!
//! ```rust,no_run
//! use droppool_runtime::metrics::MetricsRecorder;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut recorder = MetricsRecorder::new();
//! recorder.install()?;
//! if let Some(text) = recorder.render() {
//!     println!("{text}");
//! }
//! # Ok(())
//! # }
//! ```

use metrics::{counter, describe_counter};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use thiserror::Error;

/// Errors from metrics setup.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to install the Prometheus recorder
    #[error("Failed to install metrics recorder: {0}")]
    Install(String),
}

/// Owner of the installed Prometheus recorder.
#[derive(Default)]
pub struct MetricsRecorder {
    handle: Option<PrometheusHandle>,
}

impl MetricsRecorder {
    /// Recorder that has not been installed yet.
    #[must_use]
    pub const fn new() -> Self {
        Self { handle: None }
    }

    /// Describe all pool metrics and install the Prometheus recorder globally.
    ///
    /// # Errors
    ///
    /// [`MetricsError::Install`] if installation fails for a reason other than a
    /// recorder already being present (tests commonly install more than once).
    pub fn install(&mut self) -> Result<(), MetricsError> {
        match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                register_metrics();
                tracing::info!("Prometheus metrics recorder installed");
                Ok(())
            },
            Err(e) => {
                let message = e.to_string();
                if message.contains("already") {
                    tracing::warn!("Metrics recorder already installed, skipping");
                    Ok(())
                } else {
                    Err(MetricsError::Install(message))
                }
            },
        }
    }

    /// Handle of the installed recorder, if this instance installed it.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Current metrics in the Prometheus text format.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Describe every metric the runtime emits.
pub fn register_metrics() {
    describe_counter!(
        "pool_transactions_total",
        "Atomic pool adjustments that found their record"
    );
    describe_counter!(
        "pool_transaction_noops_total",
        "Atomic pool adjustments whose record had been deleted"
    );
    describe_counter!(
        "mirror_events_applied_total",
        "Change events applied to the local mirror"
    );
    describe_counter!(
        "mirror_anomalies_total",
        "Duplicate, stale or out-of-order change events"
    );
    describe_counter!("refresh_runs_total", "Coalesced refreshes delivered");
    describe_counter!("gc_deleted_total", "Pool records deleted by the garbage collector");
    describe_counter!("gc_retained_total", "Garbage collector checks that kept the record");
    describe_counter!("transfers_total", "Completed hold transfers");
    describe_counter!(
        "transfer_partial_failures_total",
        "Hold transfers that wrote the hold but not the pool decrement"
    );
    describe_counter!(
        "store_stream_errors_total",
        "Errors delivered by the pool change feed"
    );
}

/// Transaction executor metrics.
pub struct TransactionMetrics;

impl TransactionMetrics {
    /// Record an adjustment that found its record.
    pub fn record_applied() {
        counter!("pool_transactions_total").increment(1);
    }

    /// Record an adjustment against a deleted record.
    pub fn record_noop() {
        counter!("pool_transaction_noops_total").increment(1);
    }
}

/// Mirror consumer metrics.
pub struct MirrorMetrics;

impl MirrorMetrics {
    /// Record one applied change event.
    pub fn record_event(kind: &'static str) {
        counter!("mirror_events_applied_total", "kind" => kind).increment(1);
    }

    /// Record an anomalous change event.
    pub fn record_anomaly() {
        counter!("mirror_anomalies_total").increment(1);
    }

    /// Record a change-feed error.
    pub fn record_stream_error() {
        counter!("store_stream_errors_total").increment(1);
    }

    /// Record a delivered refresh.
    pub fn record_refresh() {
        counter!("refresh_runs_total").increment(1);
    }
}

/// Garbage collector metrics.
pub struct GcMetrics;

impl GcMetrics {
    /// Record a deletion.
    pub fn record_deleted() {
        counter!("gc_deleted_total").increment(1);
    }

    /// Record a retained record.
    pub fn record_retained(reason: &'static str) {
        counter!("gc_retained_total", "reason" => reason).increment(1);
    }
}

/// Hold transfer metrics.
pub struct TransferMetrics;

impl TransferMetrics {
    /// Record a completed transfer.
    pub fn record_completed() {
        counter!("transfers_total").increment(1);
    }

    /// Record a transfer that stopped after the hold write.
    pub fn record_partial_failure() {
        counter!("transfer_partial_failures_total").increment(1);
    }
}
