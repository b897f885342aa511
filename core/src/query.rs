//! Structured query objects for order listings.
//!
//! Every listing operation takes a value object with an enumerated set of
//! recognized fields instead of a free-form parameter map.

use crate::types::{BuyerId, Order, OrderStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Default page size for [`OrderFilter`].
pub const DEFAULT_LIST_LIMIT: u32 = 50;

/// Upper bound for any page size.
pub const MAX_LIST_LIMIT: u32 = 1_000;

/// Pending orders whose payment window closed before `now`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExpiredOrderQuery {
    /// Cut-off: `expires_at < now`
    pub now: DateTime<Utc>,
    /// Maximum number of orders returned
    pub limit: u32,
}

/// Terminal orders whose quota settlement never completed.
///
/// Used by the reconciler both for unrestored non-paid orders and for paid
/// orders whose reservation was never committed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UnsettledOrderQuery {
    /// Only orders last written strictly before this instant
    pub updated_before: DateTime<Utc>,
    /// Optional lookback bound: only orders last written at or after this instant
    pub updated_since: Option<DateTime<Utc>>,
    /// Maximum number of orders returned
    pub limit: u32,
}

impl UnsettledOrderQuery {
    /// Whether `order` falls inside the update window.
    #[must_use]
    pub fn in_window(&self, order: &Order) -> bool {
        order.updated_at < self.updated_before
            && self.updated_since.is_none_or(|since| order.updated_at >= since)
    }
}

/// Filter for the general order listing.
///
/// Recognized fields: status set, buyer, creation range, page (limit + offset).
/// Results are ordered by `created_at` descending.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderFilter {
    /// Match any of these statuses; empty matches all
    pub statuses: SmallVec<[OrderStatus; 2]>,
    /// Only this buyer's orders
    pub buyer_id: Option<BuyerId>,
    /// Created at or after
    pub created_from: Option<DateTime<Utc>>,
    /// Created strictly before
    pub created_to: Option<DateTime<Utc>>,
    /// Page size
    pub limit: u32,
    /// Rows to skip
    pub offset: u32,
}

impl Default for OrderFilter {
    fn default() -> Self {
        Self {
            statuses: SmallVec::new(),
            buyer_id: None,
            created_from: None,
            created_to: None,
            limit: DEFAULT_LIST_LIMIT,
            offset: 0,
        }
    }
}

impl OrderFilter {
    /// Filter matching every order (first page).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a status to match.
    #[must_use]
    pub fn with_status(mut self, status: OrderStatus) -> Self {
        if !self.statuses.contains(&status) {
            self.statuses.push(status);
        }
        self
    }

    /// Restrict to one buyer.
    #[must_use]
    pub const fn with_buyer(mut self, buyer_id: BuyerId) -> Self {
        self.buyer_id = Some(buyer_id);
        self
    }

    /// Restrict to orders created in `[from, to)`.
    #[must_use]
    pub const fn created_between(mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        self.created_from = Some(from);
        self.created_to = Some(to);
        self
    }

    /// Set the page; `limit` is clamped to `1..=MAX_LIST_LIMIT`.
    #[must_use]
    pub fn page(mut self, limit: u32, offset: u32) -> Self {
        self.limit = limit.clamp(1, MAX_LIST_LIMIT);
        self.offset = offset;
        self
    }

    /// Whether `order` satisfies every set field (paging excluded).
    #[must_use]
    pub fn matches(&self, order: &Order) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&order.status))
            && self.buyer_id.is_none_or(|buyer| buyer == order.buyer_id)
            && self.created_from.is_none_or(|from| order.created_at >= from)
            && self.created_to.is_none_or(|to| order.created_at < to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{IdempotencyKey, Money, OrderId};
    use chrono::Duration;

    fn order(status: OrderStatus, buyer_id: BuyerId, created_at: DateTime<Utc>) -> Order {
        let id = OrderId::new();
        Order {
            id,
            order_code: Order::code_for(id, created_at),
            buyer_id,
            status,
            idempotency_key: IdempotencyKey::parse(None),
            total_amount: Money::ZERO,
            quota_restored: false,
            quota_committed: false,
            expires_at: created_at + Duration::minutes(15),
            paid_at: None,
            created_at,
            updated_at: created_at,
            items: Vec::new(),
        }
    }

    #[test]
    fn empty_filter_matches_everything() {
        let filter = OrderFilter::new();
        assert!(filter.matches(&order(OrderStatus::Pending, BuyerId::new(), Utc::now())));
        assert_eq!(filter.limit, DEFAULT_LIST_LIMIT);
    }

    #[test]
    fn filter_combines_fields() {
        let buyer = BuyerId::new();
        let now = Utc::now();
        let filter = OrderFilter::new()
            .with_status(OrderStatus::Paid)
            .with_status(OrderStatus::Completed)
            .with_status(OrderStatus::Paid)
            .with_buyer(buyer)
            .created_between(now - Duration::hours(1), now);

        assert_eq!(filter.statuses.len(), 2);
        assert!(filter.matches(&order(OrderStatus::Paid, buyer, now - Duration::minutes(5))));
        assert!(!filter.matches(&order(OrderStatus::Pending, buyer, now - Duration::minutes(5))));
        assert!(!filter.matches(&order(OrderStatus::Paid, BuyerId::new(), now - Duration::minutes(5))));
        assert!(!filter.matches(&order(OrderStatus::Paid, buyer, now)));
    }

    #[test]
    fn page_is_clamped() {
        assert_eq!(OrderFilter::new().page(0, 0).limit, 1);
        assert_eq!(OrderFilter::new().page(50_000, 10).limit, MAX_LIST_LIMIT);
    }

    #[test]
    fn unsettled_window_honours_lookback() {
        let now = Utc::now();
        let query = UnsettledOrderQuery {
            updated_before: now - Duration::seconds(60),
            updated_since: Some(now - Duration::hours(1)),
            limit: 10,
        };
        let mut o = order(OrderStatus::Canceled, BuyerId::new(), now);
        o.updated_at = now - Duration::minutes(5);
        assert!(query.in_window(&o));
        o.updated_at = now;
        assert!(!query.in_window(&o));
        o.updated_at = now - Duration::hours(2);
        assert!(!query.in_window(&o));
    }
}
