//! Idempotent order creation.
//!
//! A client retrying a creation request with the same idempotency key gets the
//! order the first attempt created, never a second one.
//!
//! # Protocol
//!
//! 1. Key present: look up the owning order. Found → `Creation::Duplicate`, no side effects.
//! 2. Run the builder: it reserves quota and produces a complete draft order.
//! 3. Insert order + items atomically under the store's unique key constraint.
//! 4. Lost the insert race on the key → release the builder's hold, refetch the
//!    winner (already complete, because inserts are atomic) → `Creation::Duplicate`.
//!
//! Absent keys skip steps 1 and 4: every call creates a new order.
//!
//! # Ambiguous inserts
//!
//! If the insert fails in a way that may still have been applied (timeout,
//! dropped connection), the guard refetches the draft's id. Releasing the hold is
//! only safe once the order is known to be absent; when even that cannot be
//! established the hold is kept and the error surfaces.

use crate::bounded;
use crate::ledger::{QuotaHold, QuotaLedger};
use crate::metrics::{ORDERS_CREATED, ORDERS_DEDUPLICATED, QUOTA_LEAKED, counter};
use boxoffice_core::store::OrderStore;
use boxoffice_core::{IdempotencyKey, Order, OrderError, StoreError};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Outcome of an idempotent creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Creation {
    /// This call inserted the order.
    Created(Order),
    /// The key already belonged to this order; nothing was changed.
    Duplicate(Order),
}

impl Creation {
    /// The order, regardless of who created it.
    #[must_use]
    pub const fn order(&self) -> &Order {
        match self {
            Self::Created(order) | Self::Duplicate(order) => order,
        }
    }

    /// Consume into the order.
    #[must_use]
    pub fn into_order(self) -> Order {
        match self {
            Self::Created(order) | Self::Duplicate(order) => order,
        }
    }

    /// Whether this call inserted the order.
    #[must_use]
    pub const fn is_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }

    /// Whether the key matched an existing order.
    #[must_use]
    pub const fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate(_))
    }
}

/// A complete draft order plus the quota reserved for it.
#[derive(Debug)]
pub struct PreparedOrder {
    /// Draft to insert, status `Pending`
    pub order: Order,
    /// Reservations backing the draft's items
    pub hold: QuotaHold,
}

/// Maps idempotency keys to orders.
pub struct IdempotencyGuard {
    orders: Arc<dyn OrderStore>,
    ledger: Arc<QuotaLedger>,
    timeout: Duration,
}

impl IdempotencyGuard {
    /// Create a guard over `orders`, releasing lost holds through `ledger`.
    #[must_use]
    pub fn new(orders: Arc<dyn OrderStore>, ledger: Arc<QuotaLedger>, timeout: Duration) -> Self {
        Self {
            orders,
            ledger,
            timeout,
        }
    }

    /// Return the order owning `key`, or build and insert a new one.
    ///
    /// `build` runs only when no order owns the key yet. Concurrent callers with
    /// the same unseen key may both build, but exactly one insert wins; the
    /// other releases its hold and returns the winner.
    ///
    /// # Errors
    ///
    /// - Any error from `build` (e.g. `QuotaExceeded`), with nothing persisted
    /// - `Persistence`: lookup or insert failed
    pub async fn create_or_find<F, Fut>(
        &self,
        key: Option<&IdempotencyKey>,
        build: F,
    ) -> Result<Creation, OrderError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<PreparedOrder, OrderError>>,
    {
        if let Some(key) = key {
            if let Some(existing) = self.find_by_key(key).await? {
                counter!(ORDERS_DEDUPLICATED).increment(1);
                debug!(
                    order_id = %existing.id,
                    idempotency_key = %key,
                    "Idempotency key matched existing order"
                );
                return Ok(Creation::Duplicate(existing));
            }
        }

        let PreparedOrder { order, hold } = build().await?;
        let order_id = order.id;

        match bounded(self.timeout, "insert_order", self.orders.insert_order(order)).await {
            Ok(stored) => {
                counter!(ORDERS_CREATED).increment(1);
                Ok(Creation::Created(stored))
            }
            Err(StoreError::DuplicateIdempotencyKey(raw)) => {
                self.release_lost_hold(hold).await;
                let Some(key) = key else {
                    return Err(StoreError::DuplicateIdempotencyKey(raw).into());
                };
                match self.find_by_key(key).await? {
                    Some(winner) => {
                        counter!(ORDERS_DEDUPLICATED).increment(1);
                        debug!(
                            order_id = %winner.id,
                            idempotency_key = %key,
                            "Lost idempotency race; returning winner"
                        );
                        Ok(Creation::Duplicate(winner))
                    }
                    None => Err(StoreError::Database(format!(
                        "idempotency key {key} conflicted but owns no order"
                    ))
                    .into()),
                }
            }
            Err(e) if e.is_ambiguous() => self.resolve_ambiguous_insert(order_id, hold, e).await,
            Err(e) => {
                self.release_lost_hold(hold).await;
                Err(e.into())
            }
        }
    }

    async fn find_by_key(&self, key: &IdempotencyKey) -> Result<Option<Order>, OrderError> {
        Ok(bounded(
            self.timeout,
            "find_by_idempotency_key",
            self.orders.find_by_idempotency_key(key.clone()),
        )
        .await?)
    }

    async fn resolve_ambiguous_insert(
        &self,
        order_id: boxoffice_core::OrderId,
        hold: QuotaHold,
        insert_error: StoreError,
    ) -> Result<Creation, OrderError> {
        match bounded(self.timeout, "find_by_id", self.orders.find_by_id(order_id)).await {
            Ok(Some(stored)) => {
                counter!(ORDERS_CREATED).increment(1);
                info!(
                    order_id = %order_id,
                    error = %insert_error,
                    "Order insert reported an error but was applied"
                );
                Ok(Creation::Created(stored))
            }
            Ok(None) => {
                self.release_lost_hold(hold).await;
                Err(insert_error.into())
            }
            Err(lookup_error) => {
                counter!(QUOTA_LEAKED).increment(1);
                warn!(
                    order_id = %order_id,
                    error = %insert_error,
                    lookup_error = %lookup_error,
                    units = hold.units(),
                    "Order insert outcome unknown; keeping its reservations"
                );
                Err(insert_error.into())
            }
        }
    }

    async fn release_lost_hold(&self, hold: QuotaHold) {
        if let Err(e) = self.ledger.release_hold(hold).await {
            counter!(QUOTA_LEAKED).increment(1);
            error!(error = %e, "Failed to release reservations of an unpersisted order");
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use boxoffice_core::environment::Clock;
    use boxoffice_core::store::QuotaStore;
    use boxoffice_core::{
        BuyerId, CategoryId, EventId, Money, OrderItem, OrderLine, OrderStatus, TicketCategory,
    };
    use boxoffice_testing::{
        FaultyOrderStore, InMemoryOrderStore, InMemoryQuotaStore, OrderFault, test_clock,
    };
    use chrono::Duration as TimeDelta;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        guard: IdempotencyGuard,
        ledger: Arc<QuotaLedger>,
        category: CategoryId,
    }

    async fn fixture(orders: Arc<dyn OrderStore>) -> Fixture {
        let clock = Arc::new(test_clock());
        let quotas = Arc::new(InMemoryQuotaStore::new());
        let category = TicketCategory::new(EventId::new(), "GA", Money::from_cents(500), 10, clock.now());
        let category_id = category.id;
        quotas.insert_category(category).await.unwrap();
        let ledger = Arc::new(QuotaLedger::new(quotas, clock, Duration::from_secs(1)));
        Fixture {
            guard: IdempotencyGuard::new(orders, ledger.clone(), Duration::from_secs(1)),
            ledger,
            category: category_id,
        }
    }

    fn draft(key: Option<&IdempotencyKey>, category: CategoryId) -> Order {
        let now = test_clock().now();
        let id = boxoffice_core::OrderId::new();
        Order {
            id,
            order_code: Order::code_for(id, now),
            buyer_id: BuyerId::new(),
            status: OrderStatus::Pending,
            idempotency_key: key.cloned(),
            total_amount: Money::from_cents(500),
            quota_restored: false,
            quota_committed: false,
            expires_at: now + TimeDelta::minutes(15),
            paid_at: None,
            created_at: now,
            updated_at: now,
            items: vec![OrderItem::new(id, category, 1, Money::from_cents(500))],
        }
    }

    async fn prepare(f: &Fixture, key: Option<&IdempotencyKey>) -> Result<PreparedOrder, OrderError> {
        let hold = f.ledger.reserve_all(&[OrderLine::new(f.category, 1)]).await?;
        Ok(PreparedOrder {
            order: draft(key, f.category),
            hold,
        })
    }

    #[tokio::test]
    async fn existing_key_skips_builder() {
        let f = fixture(Arc::new(InMemoryOrderStore::new())).await;
        let key = IdempotencyKey::parse(Some("checkout-1")).unwrap();

        let first = f.guard.create_or_find(Some(&key), || prepare(&f, Some(&key))).await.unwrap();
        assert!(first.is_created());

        let calls = AtomicUsize::new(0);
        let second = f
            .guard
            .create_or_find(Some(&key), || {
                calls.fetch_add(1, Ordering::SeqCst);
                prepare(&f, Some(&key))
            })
            .await
            .unwrap();

        assert!(second.is_duplicate());
        assert_eq!(second.order().id, first.order().id);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(f.ledger.category(f.category).await.unwrap().reserved_quantity, 1);
    }

    #[tokio::test]
    async fn absent_key_always_creates() {
        let f = fixture(Arc::new(InMemoryOrderStore::new())).await;
        let a = f.guard.create_or_find(None, || prepare(&f, None)).await.unwrap();
        let b = f.guard.create_or_find(None, || prepare(&f, None)).await.unwrap();
        assert!(a.is_created() && b.is_created());
        assert_ne!(a.order().id, b.order().id);
    }

    #[tokio::test]
    async fn builder_error_propagates_without_insert() {
        let orders = Arc::new(InMemoryOrderStore::new());
        let f = fixture(orders.clone()).await;
        let err = f
            .guard
            .create_or_find(None, || async {
                Err(OrderError::InvalidRequest("nope".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, OrderError::InvalidRequest(_)));
        assert_eq!(orders.len(), 0);
    }

    #[tokio::test]
    async fn lost_insert_race_releases_hold_and_returns_winner() {
        let inner = Arc::new(InMemoryOrderStore::new());
        let key = IdempotencyKey::parse(Some("race")).unwrap();
        // The winner lands between our lookup and our insert.
        let orders = Arc::new(FaultyOrderStore::new(inner.clone()));
        let f = fixture(orders.clone()).await;
        let winner = draft(Some(&key), f.category);
        orders.inject(OrderFault::InsertBeforeNextInsert(Box::new(winner.clone())));

        let creation = f.guard.create_or_find(Some(&key), || prepare(&f, Some(&key))).await.unwrap();

        assert_eq!(creation, Creation::Duplicate(winner));
        assert_eq!(inner.len(), 1);
        assert_eq!(f.ledger.category(f.category).await.unwrap().reserved_quantity, 0);
    }

    #[tokio::test]
    async fn ambiguous_insert_that_landed_counts_as_created() {
        let inner = Arc::new(InMemoryOrderStore::new());
        let orders = Arc::new(FaultyOrderStore::new(inner.clone()));
        orders.inject(OrderFault::ApplyThenFailNextInsert);
        let f = fixture(orders).await;

        let creation = f.guard.create_or_find(None, || prepare(&f, None)).await.unwrap();

        assert!(creation.is_created());
        assert_eq!(inner.len(), 1);
        assert_eq!(f.ledger.category(f.category).await.unwrap().reserved_quantity, 1);
    }

    #[tokio::test]
    async fn failed_insert_that_did_not_land_releases_hold() {
        let inner = Arc::new(InMemoryOrderStore::new());
        let orders = Arc::new(FaultyOrderStore::new(inner.clone()));
        orders.inject(OrderFault::FailNextInsert);
        let f = fixture(orders).await;

        let err = f.guard.create_or_find(None, || prepare(&f, None)).await.unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(inner.len(), 0);
        assert_eq!(f.ledger.category(f.category).await.unwrap().reserved_quantity, 0);
    }

    #[tokio::test]
    async fn unresolved_ambiguous_insert_keeps_hold() {
        let inner = Arc::new(InMemoryOrderStore::new());
        let orders = Arc::new(FaultyOrderStore::new(inner.clone()));
        orders.inject(OrderFault::ApplyThenFailNextInsert);
        orders.inject(OrderFault::FailNextLookup);
        let f = fixture(orders).await;

        let err = f.guard.create_or_find(None, || prepare(&f, None)).await.unwrap_err();

        // The insert landed but could not be confirmed; its units stay reserved.
        assert!(matches!(
            err,
            OrderError::Persistence(StoreError::Timeout {
                operation: "insert_order",
                ..
            })
        ));
        assert_eq!(inner.len(), 1);
        assert_eq!(f.ledger.category(f.category).await.unwrap().reserved_quantity, 1);
    }
}
