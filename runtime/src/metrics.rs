//! Prometheus metrics for the order engine.
//!
//! Counters and histograms are recorded through the `metrics` facade from the
//! ledger, the lifecycle manager and the reconciler. Installing the Prometheus
//! recorder is up to the host process.
//!
//! # Example
//!
//! ```rust,no_run
//! use boxoffice_runtime::metrics::PrometheusMetrics;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let metrics = PrometheusMetrics::install()?;
//! if let Some(text) = metrics.render() {
//!     println!("{text}");
//! }
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, histogram};

/// Orders inserted.
pub const ORDERS_CREATED: &str = "boxoffice_orders_created_total";
/// Creations answered with an existing order.
pub const ORDERS_DEDUPLICATED: &str = "boxoffice_orders_deduplicated_total";
/// Status transitions, labelled by `to`.
pub const ORDER_TRANSITIONS: &str = "boxoffice_order_transitions_total";
/// Units reserved.
pub const QUOTA_RESERVED_UNITS: &str = "boxoffice_quota_reserved_units_total";
/// Reservations refused for lack of capacity.
pub const QUOTA_EXCEEDED: &str = "boxoffice_quota_exceeded_total";
/// Ledger invariant violations.
pub const QUOTA_INVARIANT_VIOLATIONS: &str = "boxoffice_quota_invariant_violations_total";
/// Orders whose reserved quota was released.
pub const QUOTA_RESTORED: &str = "boxoffice_quota_restored_total";
/// Orders whose reserved quota was committed to sold.
pub const QUOTA_COMMITTED: &str = "boxoffice_quota_committed_total";
/// Reservations that could not be compensated and remain held.
pub const QUOTA_LEAKED: &str = "boxoffice_quota_leaked_total";
/// Audit records the sink refused.
pub const AUDIT_FAILURES: &str = "boxoffice_audit_failures_total";
/// Completed sweeps.
pub const SWEEP_RUNS: &str = "boxoffice_sweep_runs_total";
/// Per-order sweep failures, labelled by `pass`.
pub const SWEEP_FAILURES: &str = "boxoffice_sweep_failures_total";
/// Sweep wall time.
pub const SWEEP_DURATION: &str = "boxoffice_sweep_duration_seconds";

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Installed Prometheus recorder.
pub struct PrometheusMetrics {
    handle: Option<PrometheusHandle>,
}

impl PrometheusMetrics {
    /// Describe all metrics and install the Prometheus recorder globally.
    ///
    /// If a recorder is already installed (e.g. by another test), the existing one
    /// keeps receiving metrics and [`render`](Self::render) returns `None`.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] if the exporter cannot be built or installed.
    pub fn install() -> Result<Self, MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => Ok(Self {
                handle: Some(handle),
            }),
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(Self { handle: None })
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Render current metrics in Prometheus text format.
    ///
    /// Returns `None` if this instance did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    describe_counter!(ORDERS_CREATED, "Total number of orders created");
    describe_counter!(
        ORDERS_DEDUPLICATED,
        "Total number of creation requests answered with an existing order"
    );
    describe_counter!(ORDER_TRANSITIONS, "Total number of order status transitions");
    describe_counter!(QUOTA_RESERVED_UNITS, "Total number of ticket units reserved");
    describe_counter!(QUOTA_EXCEEDED, "Total number of reservations refused");
    describe_counter!(
        QUOTA_INVARIANT_VIOLATIONS,
        "Total number of quota ledger invariant violations"
    );
    describe_counter!(QUOTA_RESTORED, "Total number of orders whose quota was released");
    describe_counter!(QUOTA_COMMITTED, "Total number of orders whose quota was committed");
    describe_counter!(
        QUOTA_LEAKED,
        "Total number of reservations left held after a failed compensation"
    );
    describe_counter!(AUDIT_FAILURES, "Total number of audit records refused by the sink");
    describe_counter!(SWEEP_RUNS, "Total number of reconciliation sweeps");
    describe_counter!(SWEEP_FAILURES, "Total number of per-order sweep failures");
    describe_histogram!(SWEEP_DURATION, "Time taken by one reconciliation sweep");
}

/// Reconciler metrics recorder.
pub struct SweepMetrics;

impl SweepMetrics {
    /// Record a finished sweep.
    pub fn record_run(duration: Duration) {
        counter!(SWEEP_RUNS).increment(1);
        histogram!(SWEEP_DURATION).record(duration.as_secs_f64());
    }

    /// Record a per-order failure in `pass`.
    pub fn record_failure(pass: &'static str) {
        counter!(SWEEP_FAILURES, "pass" => pass).increment(1);
    }
}
