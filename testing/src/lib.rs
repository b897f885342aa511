//! # Boxoffice Testing
//!
//! Test doubles for the order engine.
//!
//! This crate provides:
//! - Deterministic clocks ([`FixedClock`], [`ManualClock`])
//! - In-memory stores honouring the atomicity contracts of the store traits
//!   ([`InMemoryQuotaStore`], [`InMemoryOrderStore`])
//! - Audit recorders that capture or refuse events
//! - Fault-injecting wrappers for timeout and crash scenarios
//!
//! ## Example
//!
//! ```ignore
//! use boxoffice_testing::{InMemoryOrderStore, InMemoryQuotaStore, ManualClock, RecordingAuditRecorder};
//!
//! let clock = Arc::new(ManualClock::default());
//! let manager = OrderLifecycleManager::new(
//!     Arc::new(InMemoryQuotaStore::new()),
//!     Arc::new(InMemoryOrderStore::new()),
//!     clock.clone(),
//!     Arc::new(RecordingAuditRecorder::new()),
//!     LifecycleConfig::default(),
//! );
//!
//! clock.advance(chrono::Duration::minutes(16));
//! ```

use boxoffice_core::environment::Clock;
use chrono::{DateTime, Utc};

/// Captured and failing audit sinks
pub mod audit;

/// Fault-injecting store wrappers
pub mod faults;

/// In-memory store implementations
pub mod stores;

/// Mock implementations of environment traits.
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::sync::RwLock;

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use boxoffice_testing::mocks::FixedClock;
    /// use boxoffice_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Clock that only moves when told to.
    ///
    /// Starts at the [`test_clock`] instant by default.
    #[derive(Debug)]
    pub struct ManualClock {
        time: RwLock<DateTime<Utc>>,
    }

    impl ManualClock {
        /// Create a clock frozen at `time`
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: RwLock::new(time),
            }
        }

        /// Move the clock forward (or backward, for a negative delta)
        #[allow(clippy::unwrap_used)]
        pub fn advance(&self, by: chrono::Duration) {
            let mut time = self.time.write().unwrap();
            *time += by;
        }

        /// Jump to `time`
        #[allow(clippy::unwrap_used)]
        pub fn set(&self, time: DateTime<Utc>) {
            *self.time.write().unwrap() = time;
        }
    }

    impl Default for ManualClock {
        fn default() -> Self {
            Self::new(test_clock().now())
        }
    }

    impl Clock for ManualClock {
        #[allow(clippy::unwrap_used)]
        fn now(&self) -> DateTime<Utc> {
            *self.time.read().unwrap()
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

/// Install a `tracing` subscriber that writes through the test harness.
///
/// Honours `RUST_LOG`; safe to call from every test.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "boxoffice=debug".into()),
        )
        .with_test_writer()
        .try_init()
        .ok();
}

// Re-export commonly used items
pub use audit::{FailingAuditRecorder, RecordingAuditRecorder};
pub use faults::{FaultyOrderStore, FaultyQuotaStore, OrderFault};
pub use mocks::{FixedClock, ManualClock, test_clock};
pub use stores::{InMemoryOrderStore, InMemoryQuotaStore};
