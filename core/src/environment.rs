//! Injected collaborators: time and audit.
//!
//! Everything the engine cannot decide on its own is abstracted behind a trait
//! so tests can substitute deterministic implementations.

use crate::types::AuditEvent;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Clock trait - abstracts time operations for testability
///
/// # Examples
///
/// ```
/// use boxoffice_core::environment::Clock;
/// use chrono::{DateTime, Utc};
///
/// struct FixedClock { time: DateTime<Utc> }
///
/// impl Clock for FixedClock {
///     fn now(&self) -> DateTime<Utc> {
///         self.time
///     }
/// }
///
/// let clock = FixedClock { time: Utc::now() };
/// assert_eq!(clock.now(), clock.now());
/// ```
pub trait Clock: Send + Sync {
    /// Get the current time
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Failure to hand an audit record to its sink.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuditError {
    /// The sink is not accepting records (closed, full, unreachable).
    #[error("Audit sink unavailable: {0}")]
    Unavailable(String),
}

/// Receives a record of every order status transition.
///
/// Fire-and-forget from the engine's perspective: an error is logged and never
/// rolls back the transition that produced the record. Implementations must
/// not block; buffer or hand off instead.
pub trait AuditRecorder: Send + Sync {
    /// Record one transition.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError`] if the record could not be accepted.
    fn record(&self, event: AuditEvent) -> Result<(), AuditError>;
}
