//! Tunables for the lifecycle manager and the reconciler.

use chrono::Duration as TimeDelta;
use std::time::Duration;

/// Lifecycle manager configuration.
///
/// # Default Values
///
/// - `payment_window`: 15 minutes
/// - `persistence_timeout`: 5 seconds
#[derive(Debug, Clone, Copy)]
pub struct LifecycleConfig {
    /// Time a buyer has to pay; `expires_at = created_at + payment_window`
    pub payment_window: TimeDelta,
    /// Budget for every single persistence call; exceeding it is a transient failure
    pub persistence_timeout: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            payment_window: TimeDelta::minutes(15),
            persistence_timeout: Duration::from_secs(5),
        }
    }
}

impl LifecycleConfig {
    /// Set the payment window.
    #[must_use]
    pub const fn with_payment_window(mut self, window: TimeDelta) -> Self {
        self.payment_window = window;
        self
    }

    /// Set the per-call persistence budget.
    #[must_use]
    pub const fn with_persistence_timeout(mut self, timeout: Duration) -> Self {
        self.persistence_timeout = timeout;
        self
    }
}

/// Expiration reconciler configuration.
///
/// # Default Values
///
/// - `interval`: 60 seconds
/// - `batch_size`: 500 orders per query
/// - `settle_grace`: 60 seconds
/// - `unrestored_lookback`: unbounded
#[derive(Debug, Clone, Copy)]
pub struct ReconcilerConfig {
    /// Time between sweeps when spawned as a periodic task
    pub interval: Duration,
    /// Maximum orders fetched by each listing query in one sweep
    pub batch_size: u32,
    /// Recovery passes ignore orders written more recently than this, so a live
    /// request that is still settling quota is not duplicated by the sweep
    pub settle_grace: TimeDelta,
    /// Optional bound on how far back the unrestored-order scan looks
    pub unrestored_lookback: Option<TimeDelta>,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            batch_size: 500,
            settle_grace: TimeDelta::seconds(60),
            unrestored_lookback: None,
        }
    }
}

impl ReconcilerConfig {
    /// Set the sweep interval.
    #[must_use]
    pub const fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the per-query batch size (at least 1).
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = if batch_size == 0 { 1 } else { batch_size };
        self
    }

    /// Set the settle grace window.
    #[must_use]
    pub const fn with_settle_grace(mut self, grace: TimeDelta) -> Self {
        self.settle_grace = grace;
        self
    }

    /// Bound the unrestored-order scan to orders written within `lookback`.
    #[must_use]
    pub const fn with_unrestored_lookback(mut self, lookback: Option<TimeDelta>) -> Self {
        self.unrestored_lookback = lookback;
        self
    }
}
