//! Persistence traits for quota counters and orders.
//!
//! The engine is agnostic to the backend; it relies only on the atomic and
//! conditional semantics documented on each method.
//!
//! # Implementations
//!
//! - `PostgresQuotaStore` / `PostgresOrderStore` (in `boxoffice-postgres`): production
//! - `InMemoryQuotaStore` / `InMemoryOrderStore` (in `boxoffice-testing`): tests
//!
//! # Dyn Compatibility
//!
//! Methods return explicit `Pin<Box<dyn Future>>` instead of `async fn` so the
//! stores can be shared as `Arc<dyn QuotaStore>` / `Arc<dyn OrderStore>`.

use crate::error::StoreError;
use crate::query::{ExpiredOrderQuery, OrderFilter, UnsettledOrderQuery};
use crate::types::{
    CategoryId, IdempotencyKey, Order, OrderId, OrderLine, OrderStatus, TicketCategory,
};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by every store method.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Result of a reservation attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReserveOutcome {
    /// Units were added to `reserved`; carries the category after the write.
    Reserved(TicketCategory),
    /// Capacity check failed; nothing was written.
    Insufficient {
        /// Units available when the check ran
        available: u32,
    },
}

/// Result of a commit or release (both consume `reserved`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SettleOutcome {
    /// Counters were updated; carries the category after the write.
    Applied(TicketCategory),
    /// Fewer units are reserved than the operation needs; nothing was written.
    Short {
        /// Units reserved when the check ran
        reserved: u32,
    },
}

/// How an order's reserved units leave `reserved`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SettlementKind {
    /// Units go back to the available pool (canceled, failed, expired orders).
    Release,
    /// Units move to `sold` (paid orders).
    Commit,
}

impl SettlementKind {
    /// Lowercase name, as stored.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Release => "release",
            Self::Commit => "commit",
        }
    }
}

impl std::fmt::Display for SettlementKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of settling every line of one order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SettlementOutcome {
    /// Every line was applied and the settlement recorded.
    Applied,
    /// The order was settled this way before; nothing was written.
    AlreadySettled,
    /// A category holds fewer reserved units than its line; nothing was written.
    Short {
        /// Category that came up short
        category: CategoryId,
        /// Units reserved when the check ran
        reserved: u32,
        /// Units the line needed
        requested: u32,
    },
}

/// Per-category inventory counters.
///
/// # Atomicity
///
/// Each `try_*` method is a single check-and-write unit for one category: no
/// other mutation of the same category may observe or interleave with its
/// intermediate state. Mutations of *different* categories must not block each
/// other (serialize per row, never globally).
pub trait QuotaStore: Send + Sync {
    /// Insert a new category.
    ///
    /// # Errors
    ///
    /// - `Database`: write failed
    fn insert_category(&self, category: TicketCategory) -> StoreFuture<'_, ()>;

    /// Read a category snapshot.
    ///
    /// # Errors
    ///
    /// - `Database`: read failed
    fn category(&self, id: CategoryId) -> StoreFuture<'_, Option<TicketCategory>>;

    /// `reserved += quantity` if `reserved + sold + quantity <= total`.
    ///
    /// # Errors
    ///
    /// - `CategoryNotFound`: unknown category
    /// - `Database`: write failed
    fn try_reserve(
        &self,
        id: CategoryId,
        quantity: u32,
        at: DateTime<Utc>,
    ) -> StoreFuture<'_, ReserveOutcome>;

    /// `reserved -= quantity; sold += quantity` if `reserved >= quantity`.
    ///
    /// # Errors
    ///
    /// - `CategoryNotFound`: unknown category
    /// - `Database`: write failed
    fn try_commit(
        &self,
        id: CategoryId,
        quantity: u32,
        at: DateTime<Utc>,
    ) -> StoreFuture<'_, SettleOutcome>;

    /// `reserved -= quantity` if `reserved >= quantity`.
    ///
    /// # Errors
    ///
    /// - `CategoryNotFound`: unknown category
    /// - `Database`: write failed
    fn try_release(
        &self,
        id: CategoryId,
        quantity: u32,
        at: DateTime<Utc>,
    ) -> StoreFuture<'_, SettleOutcome>;

    /// Release or commit every line of `order_id`, at most once per order and kind.
    ///
    /// The counter writes and the record of the settlement are one atomic unit:
    /// either every line is applied and `(order_id, kind)` is recorded, or nothing
    /// changes. A repeated call, including one that follows a lost
    /// acknowledgement, reports [`SettlementOutcome::AlreadySettled`].
    ///
    /// # Errors
    ///
    /// - `CategoryNotFound`: a line names an unknown category (nothing written)
    /// - `Database`: write failed (nothing written)
    fn settle_order(
        &self,
        order_id: OrderId,
        kind: SettlementKind,
        lines: Vec<OrderLine>,
        at: DateTime<Utc>,
    ) -> StoreFuture<'_, SettlementOutcome>;
}

/// Orders and their items.
///
/// # Conditional writes
///
/// Status and flag changes are compare-and-swap: the store applies the write
/// only if the row still holds the expected value, and reports whether it did.
/// Callers never infer success from a prior read.
pub trait OrderStore: Send + Sync {
    /// Insert an order together with its items, atomically.
    ///
    /// Either the order and every item become visible, or nothing does.
    ///
    /// # Errors
    ///
    /// - `DuplicateIdempotencyKey`: another order owns the key (nothing written)
    /// - `Database`: write failed
    fn insert_order(&self, order: Order) -> StoreFuture<'_, Order>;

    /// Load an order with its items.
    ///
    /// # Errors
    ///
    /// - `Database`: read failed
    fn find_by_id(&self, id: OrderId) -> StoreFuture<'_, Option<Order>>;

    /// Load the order that owns `key`.
    ///
    /// # Errors
    ///
    /// - `Database`: read failed
    fn find_by_idempotency_key(&self, key: IdempotencyKey) -> StoreFuture<'_, Option<Order>>;

    /// `status = to where id = id and status = from`.
    ///
    /// Sets `updated_at = at`, and `paid_at = at` when `to` is `Paid`.
    ///
    /// # Returns
    ///
    /// The updated order, or `None` if no row matched (wrong status or unknown id).
    ///
    /// # Errors
    ///
    /// - `Database`: write failed
    fn transition_status(
        &self,
        id: OrderId,
        from: OrderStatus,
        to: OrderStatus,
        at: DateTime<Utc>,
    ) -> StoreFuture<'_, Option<Order>>;

    /// `quota_restored = true where id = id and quota_restored = false` and the
    /// status is one of [`OrderStatus::RESTORING`].
    ///
    /// # Returns
    ///
    /// `true` if this call flipped the flag.
    ///
    /// # Errors
    ///
    /// - `Database`: write failed
    fn mark_quota_restored(&self, id: OrderId, at: DateTime<Utc>) -> StoreFuture<'_, bool>;

    /// `quota_committed = true where id = id and quota_committed = false` and the
    /// status is one of [`OrderStatus::SELLING`].
    ///
    /// # Returns
    ///
    /// `true` if this call flipped the flag.
    ///
    /// # Errors
    ///
    /// - `Database`: write failed
    fn mark_quota_committed(&self, id: OrderId, at: DateTime<Utc>) -> StoreFuture<'_, bool>;

    /// Pending orders with `expires_at < query.now`, oldest deadline first.
    ///
    /// # Errors
    ///
    /// - `Database`: read failed
    fn list_pending_expired(&self, query: ExpiredOrderQuery) -> StoreFuture<'_, Vec<Order>>;

    /// Canceled, Failed or Expired orders with `quota_restored = false` inside the
    /// query's update window, oldest update first.
    ///
    /// # Errors
    ///
    /// - `Database`: read failed
    fn list_unrestored_terminal(&self, query: UnsettledOrderQuery) -> StoreFuture<'_, Vec<Order>>;

    /// Paid or Completed orders with `quota_committed = false` inside the query's
    /// update window, oldest update first.
    ///
    /// # Errors
    ///
    /// - `Database`: read failed
    fn list_uncommitted_paid(&self, query: UnsettledOrderQuery) -> StoreFuture<'_, Vec<Order>>;

    /// Orders matching `filter`, newest first.
    ///
    /// # Errors
    ///
    /// - `Database`: read failed
    fn list_orders(&self, filter: OrderFilter) -> StoreFuture<'_, Vec<Order>>;
}
