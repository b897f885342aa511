//! Fault-injecting store wrappers.
//!
//! Wrap a real store and make selected calls slow, fail, or fail *after*
//! applying their write, to reproduce timeouts, lost races and crashes between
//! two persistence steps.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use boxoffice_core::query::{ExpiredOrderQuery, OrderFilter, UnsettledOrderQuery};
use boxoffice_core::store::{
    OrderStore, QuotaStore, ReserveOutcome, SettleOutcome, SettlementKind, SettlementOutcome,
    StoreFuture,
};
use boxoffice_core::{
    CategoryId, DateTime, IdempotencyKey, Order, OrderId, OrderLine, OrderStatus, StoreError,
    TicketCategory, Utc,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn injected(operation: &str) -> StoreError {
    StoreError::Database(format!("injected failure in {operation}"))
}

/// Consume one unit of a failure budget, if any is left.
fn take(budget: &AtomicUsize) -> bool {
    budget
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// One-shot fault for [`FaultyOrderStore`].
#[derive(Debug, Clone)]
pub enum OrderFault {
    /// Next insert fails without writing anything.
    FailNextInsert,
    /// Next insert is written, then reported as timed out.
    ApplyThenFailNextInsert,
    /// Before the next insert, this order is inserted as if by a concurrent request.
    InsertBeforeNextInsert(Box<Order>),
    /// Next `find_by_id` fails.
    FailNextLookup,
    /// Next status transition fails without writing anything.
    FailNextTransition,
    /// Next `mark_quota_restored` / `mark_quota_committed` fails without writing.
    FailNextFlag,
}

/// Order store that misbehaves on demand.
pub struct FaultyOrderStore {
    inner: Arc<dyn OrderStore>,
    faults: Mutex<VecDeque<OrderFault>>,
    delay: Mutex<Option<Duration>>,
}

impl FaultyOrderStore {
    /// Wrap `inner`; behaves identically until a fault is injected.
    #[must_use]
    pub fn new(inner: Arc<dyn OrderStore>) -> Self {
        Self {
            inner,
            faults: Mutex::new(VecDeque::new()),
            delay: Mutex::new(None),
        }
    }

    /// Queue a one-shot fault.
    pub fn inject(&self, fault: OrderFault) {
        self.faults.lock().unwrap().push_back(fault);
    }

    /// Delay every call by `delay` (`None` to stop).
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().unwrap() = delay;
    }

    /// Remove and return the first queued fault matching `wanted`.
    fn take_fault(&self, wanted: impl Fn(&OrderFault) -> bool) -> Option<OrderFault> {
        let mut faults = self.faults.lock().unwrap();
        let index = faults.iter().position(wanted)?;
        faults.remove(index)
    }

    async fn pause(&self) {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

impl OrderStore for FaultyOrderStore {
    fn insert_order(&self, order: Order) -> StoreFuture<'_, Order> {
        Box::pin(async move {
            self.pause().await;
            let fault = self.take_fault(|f| {
                matches!(
                    f,
                    OrderFault::FailNextInsert
                        | OrderFault::ApplyThenFailNextInsert
                        | OrderFault::InsertBeforeNextInsert(_)
                )
            });
            match fault {
                Some(OrderFault::FailNextInsert) => Err(injected("insert_order")),
                Some(OrderFault::ApplyThenFailNextInsert) => {
                    self.inner.insert_order(order).await?;
                    Err(StoreError::Timeout {
                        operation: "insert_order",
                        budget: Duration::ZERO,
                    })
                }
                Some(OrderFault::InsertBeforeNextInsert(winner)) => {
                    self.inner.insert_order(*winner).await?;
                    self.inner.insert_order(order).await
                }
                _ => self.inner.insert_order(order).await,
            }
        })
    }

    fn find_by_id(&self, id: OrderId) -> StoreFuture<'_, Option<Order>> {
        Box::pin(async move {
            self.pause().await;
            if self
                .take_fault(|f| matches!(f, OrderFault::FailNextLookup))
                .is_some()
            {
                return Err(injected("find_by_id"));
            }
            self.inner.find_by_id(id).await
        })
    }

    fn find_by_idempotency_key(&self, key: IdempotencyKey) -> StoreFuture<'_, Option<Order>> {
        Box::pin(async move {
            self.pause().await;
            self.inner.find_by_idempotency_key(key).await
        })
    }

    fn transition_status(
        &self,
        id: OrderId,
        from: OrderStatus,
        to: OrderStatus,
        at: DateTime<Utc>,
    ) -> StoreFuture<'_, Option<Order>> {
        Box::pin(async move {
            self.pause().await;
            if self
                .take_fault(|f| matches!(f, OrderFault::FailNextTransition))
                .is_some()
            {
                return Err(injected("transition_status"));
            }
            self.inner.transition_status(id, from, to, at).await
        })
    }

    fn mark_quota_restored(&self, id: OrderId, at: DateTime<Utc>) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            self.pause().await;
            if self.take_fault(|f| matches!(f, OrderFault::FailNextFlag)).is_some() {
                return Err(injected("mark_quota_restored"));
            }
            self.inner.mark_quota_restored(id, at).await
        })
    }

    fn mark_quota_committed(&self, id: OrderId, at: DateTime<Utc>) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            self.pause().await;
            if self.take_fault(|f| matches!(f, OrderFault::FailNextFlag)).is_some() {
                return Err(injected("mark_quota_committed"));
            }
            self.inner.mark_quota_committed(id, at).await
        })
    }

    fn list_pending_expired(&self, query: ExpiredOrderQuery) -> StoreFuture<'_, Vec<Order>> {
        Box::pin(async move {
            self.pause().await;
            self.inner.list_pending_expired(query).await
        })
    }

    fn list_unrestored_terminal(&self, query: UnsettledOrderQuery) -> StoreFuture<'_, Vec<Order>> {
        Box::pin(async move {
            self.pause().await;
            self.inner.list_unrestored_terminal(query).await
        })
    }

    fn list_uncommitted_paid(&self, query: UnsettledOrderQuery) -> StoreFuture<'_, Vec<Order>> {
        Box::pin(async move {
            self.pause().await;
            self.inner.list_uncommitted_paid(query).await
        })
    }

    fn list_orders(&self, filter: OrderFilter) -> StoreFuture<'_, Vec<Order>> {
        Box::pin(async move {
            self.pause().await;
            self.inner.list_orders(filter).await
        })
    }
}

/// Quota store that misbehaves on demand.
pub struct FaultyQuotaStore {
    inner: Arc<dyn QuotaStore>,
    delay: Mutex<Option<Duration>>,
    failing_reserves: AtomicUsize,
    failing_releases: AtomicUsize,
    failing_settlements: AtomicUsize,
    unacknowledged_settlements: AtomicUsize,
}

impl FaultyQuotaStore {
    /// Wrap `inner`; behaves identically until a fault is injected.
    #[must_use]
    pub fn new(inner: Arc<dyn QuotaStore>) -> Self {
        Self {
            inner,
            delay: Mutex::new(None),
            failing_reserves: AtomicUsize::new(0),
            failing_releases: AtomicUsize::new(0),
            failing_settlements: AtomicUsize::new(0),
            unacknowledged_settlements: AtomicUsize::new(0),
        }
    }

    /// Delay every counter mutation by `delay` (`None` to stop).
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().unwrap() = delay;
    }

    /// Fail the next `n` reservations without writing.
    pub fn fail_next_reserves(&self, n: usize) {
        self.failing_reserves.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` single-category releases without writing.
    pub fn fail_next_releases(&self, n: usize) {
        self.failing_releases.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` order settlements without writing.
    pub fn fail_next_settlements(&self, n: usize) {
        self.failing_settlements.store(n, Ordering::SeqCst);
    }

    /// Apply the next `n` order settlements, then report them as timed out.
    pub fn lose_next_settlement_acks(&self, n: usize) {
        self.unacknowledged_settlements.store(n, Ordering::SeqCst);
    }

    async fn pause(&self) {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

impl QuotaStore for FaultyQuotaStore {
    fn insert_category(&self, category: TicketCategory) -> StoreFuture<'_, ()> {
        self.inner.insert_category(category)
    }

    fn category(&self, id: CategoryId) -> StoreFuture<'_, Option<TicketCategory>> {
        self.inner.category(id)
    }

    fn try_reserve(
        &self,
        id: CategoryId,
        quantity: u32,
        at: DateTime<Utc>,
    ) -> StoreFuture<'_, ReserveOutcome> {
        Box::pin(async move {
            self.pause().await;
            if take(&self.failing_reserves) {
                return Err(injected("try_reserve"));
            }
            self.inner.try_reserve(id, quantity, at).await
        })
    }

    fn try_commit(
        &self,
        id: CategoryId,
        quantity: u32,
        at: DateTime<Utc>,
    ) -> StoreFuture<'_, SettleOutcome> {
        Box::pin(async move {
            self.pause().await;
            self.inner.try_commit(id, quantity, at).await
        })
    }

    fn try_release(
        &self,
        id: CategoryId,
        quantity: u32,
        at: DateTime<Utc>,
    ) -> StoreFuture<'_, SettleOutcome> {
        Box::pin(async move {
            self.pause().await;
            if take(&self.failing_releases) {
                return Err(injected("try_release"));
            }
            self.inner.try_release(id, quantity, at).await
        })
    }

    fn settle_order(
        &self,
        order_id: OrderId,
        kind: SettlementKind,
        lines: Vec<OrderLine>,
        at: DateTime<Utc>,
    ) -> StoreFuture<'_, SettlementOutcome> {
        Box::pin(async move {
            self.pause().await;
            if take(&self.failing_settlements) {
                return Err(injected("settle_order"));
            }
            let outcome = self.inner.settle_order(order_id, kind, lines, at).await?;
            if take(&self.unacknowledged_settlements) {
                return Err(StoreError::Timeout {
                    operation: "settle_order",
                    budget: Duration::ZERO,
                });
            }
            Ok(outcome)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InMemoryOrderStore, InMemoryQuotaStore, test_clock};
    use boxoffice_core::environment::Clock;
    use boxoffice_core::{EventId, Money};

    #[test]
    fn failure_budget_counts_down() {
        let budget = AtomicUsize::new(2);
        assert!(take(&budget));
        assert!(take(&budget));
        assert!(!take(&budget));
    }

    #[tokio::test]
    async fn release_failures_are_one_shot() {
        let inner = Arc::new(InMemoryQuotaStore::new());
        let category = TicketCategory::new(EventId::new(), "GA", Money::ZERO, 5, test_clock().now());
        let id = category.id;
        inner.insert_category(category).await.unwrap();
        let store = FaultyQuotaStore::new(inner);
        let at = test_clock().now();

        store.try_reserve(id, 2, at).await.unwrap();
        store.fail_next_releases(1);
        assert!(store.try_release(id, 1, at).await.is_err());
        assert!(store.try_release(id, 1, at).await.is_ok());
    }

    #[tokio::test]
    async fn lost_settlement_ack_still_applies_the_write() {
        let inner = Arc::new(InMemoryQuotaStore::new());
        let category = TicketCategory::new(EventId::new(), "GA", Money::ZERO, 5, test_clock().now());
        let id = category.id;
        inner.insert_category(category).await.unwrap();
        let store = FaultyQuotaStore::new(inner.clone());
        let at = test_clock().now();
        let order_id = OrderId::new();
        store.try_reserve(id, 2, at).await.unwrap();

        store.fail_next_settlements(1);
        let lines = vec![OrderLine::new(id, 2)];
        assert!(
            store
                .settle_order(order_id, SettlementKind::Release, lines.clone(), at)
                .await
                .is_err()
        );
        assert_eq!(inner.snapshot(id).unwrap().reserved_quantity, 2);

        store.lose_next_settlement_acks(1);
        assert!(matches!(
            store
                .settle_order(order_id, SettlementKind::Release, lines.clone(), at)
                .await,
            Err(StoreError::Timeout { .. })
        ));
        assert_eq!(inner.snapshot(id).unwrap().reserved_quantity, 0);
        assert_eq!(
            store
                .settle_order(order_id, SettlementKind::Release, lines, at)
                .await,
            Ok(SettlementOutcome::AlreadySettled)
        );
    }

    #[tokio::test]
    async fn lookup_fault_hits_only_find_by_id() {
        let store = FaultyOrderStore::new(Arc::new(InMemoryOrderStore::new()));
        store.inject(OrderFault::FailNextLookup);

        assert!(store.list_orders(OrderFilter::new()).await.unwrap().is_empty());
        assert!(store.find_by_id(OrderId::new()).await.is_err());
        assert_eq!(store.find_by_id(OrderId::new()).await, Ok(None));
    }
}
