//! Error taxonomy for the order engine.
//!
//! Two layers:
//!
//! - [`StoreError`]: what a persistence backend reports (I/O, timeouts, uniqueness).
//! - [`OrderError`]: what the engine reports to its callers. Persistence failures are
//!   wrapped verbatim in [`OrderError::Persistence`].
//!
//! A repeated idempotency key is *not* an error; creation returns
//! `Creation::Duplicate` for it.

use crate::types::{CategoryId, OrderId, OrderStatus};
use std::time::Duration;
use thiserror::Error;

/// Errors reported by [`QuotaStore`](crate::store::QuotaStore) and
/// [`OrderStore`](crate::store::OrderStore) implementations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Database connection or query failed.
    #[error("Database error: {0}")]
    Database(String),

    /// The operation did not complete within its time budget.
    ///
    /// The outcome is unknown: the write may or may not have been applied.
    #[error("Persistence operation '{operation}' timed out after {budget:?}")]
    Timeout {
        /// Store operation that timed out
        operation: &'static str,
        /// Budget that elapsed
        budget: Duration,
    },

    /// Another order already owns this idempotency key.
    #[error("Idempotency key already in use: {0}")]
    DuplicateIdempotencyKey(String),

    /// No category with this id.
    #[error("Ticket category not found: {0}")]
    CategoryNotFound(CategoryId),

    /// A stored row could not be decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Whether the write may have been applied even though an error was returned.
    #[must_use]
    pub const fn is_ambiguous(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Database(_))
    }
}

/// Errors returned by the quota ledger, idempotency guard and lifecycle manager.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OrderError {
    /// Reservation refused; nothing was mutated.
    #[error(
        "Quota exceeded for category {category}: requested {requested}, available {available}"
    )]
    QuotaExceeded {
        /// Category that ran out
        category: CategoryId,
        /// Units asked for
        requested: u32,
        /// Units that were available
        available: u32,
    },

    /// The order was not in the source status of the requested transition.
    ///
    /// Expected under races (payment vs. expiration); callers treat it as
    /// "already handled".
    #[error("Invalid state transition for order {order_id}: {from} -> {to}")]
    InvalidStateTransition {
        /// Order that was addressed
        order_id: OrderId,
        /// Status the order actually had
        from: OrderStatus,
        /// Status that was requested
        to: OrderStatus,
    },

    /// Ledger counters contradict the operation (e.g. committing more than is reserved).
    ///
    /// Indicates corrupted state. Never auto-corrected.
    #[error(
        "Quota invariant violated for category {category}: reserved {reserved}, operation needs {requested}"
    )]
    InvariantViolation {
        /// Category whose counters are inconsistent
        category: CategoryId,
        /// Units currently reserved
        reserved: u32,
        /// Units the operation needed
        requested: u32,
    },

    /// Transient persistence failure; retry with the same idempotency key.
    #[error(transparent)]
    Persistence(#[from] StoreError),

    /// No order with this id.
    #[error("Order not found: {0}")]
    OrderNotFound(OrderId),

    /// No category with this id.
    #[error("Ticket category not found: {0}")]
    CategoryNotFound(CategoryId),

    /// Malformed request (no items, zero quantity, price overflow).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl OrderError {
    /// Whether the caller may retry the same request.
    ///
    /// Only transient persistence failures qualify.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Persistence(StoreError::Database(_) | StoreError::Timeout { .. })
        )
    }

    /// Whether the error means another flow already moved the order on.
    #[must_use]
    pub const fn is_already_handled(&self) -> bool {
        matches!(self, Self::InvalidStateTransition { .. })
    }

    /// Short machine-readable code, used as a metrics label.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::InvalidStateTransition { .. } => "invalid_state_transition",
            Self::InvariantViolation { .. } => "invariant_violation",
            Self::Persistence(_) => "persistence",
            Self::OrderNotFound(_) => "order_not_found",
            Self::CategoryNotFound(_) => "category_not_found",
            Self::InvalidRequest(_) => "invalid_request",
        }
    }
}
