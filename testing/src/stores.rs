//! In-memory store implementations.
//!
//! Both stores honour the contracts of the store traits:
//!
//! - [`InMemoryQuotaStore`] serializes mutations per category behind a
//!   per-category mutex; different categories never block each other. Order
//!   settlements lock the settlement journal, then their categories in
//!   ascending id order.
//! - [`InMemoryOrderStore`] keeps orders and the idempotency key index under
//!   one lock, so inserts are atomic and status writes are compare-and-swap.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Lock poisoning only follows a panicking test

use boxoffice_core::query::{ExpiredOrderQuery, OrderFilter, UnsettledOrderQuery};
use boxoffice_core::store::{
    OrderStore, QuotaStore, ReserveOutcome, SettleOutcome, SettlementKind, SettlementOutcome,
    StoreFuture,
};
use boxoffice_core::{
    CategoryId, DateTime, IdempotencyKey, Order, OrderId, OrderLine, OrderStatus, StoreError,
    TicketCategory, Utc,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

/// Ticket categories held in memory.
#[derive(Debug, Default)]
pub struct InMemoryQuotaStore {
    categories: RwLock<HashMap<CategoryId, Arc<Mutex<TicketCategory>>>>,
    settlements: Mutex<HashSet<(OrderId, SettlementKind)>>,
}

impl InMemoryQuotaStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a category's counters wholesale, bypassing every check.
    ///
    /// Used to stage corrupted or half-settled state.
    pub fn overwrite(&self, category: TicketCategory) {
        self.categories
            .write()
            .unwrap()
            .insert(category.id, Arc::new(Mutex::new(category)));
    }

    /// Snapshot of a category, if present
    #[must_use]
    pub fn snapshot(&self, id: CategoryId) -> Option<TicketCategory> {
        self.slot(id).map(|slot| slot.lock().unwrap().clone())
    }

    /// Whether `order_id` has been settled as `kind`
    #[must_use]
    pub fn is_settled(&self, order_id: OrderId, kind: SettlementKind) -> bool {
        self.settlements.lock().unwrap().contains(&(order_id, kind))
    }

    fn slot(&self, id: CategoryId) -> Option<Arc<Mutex<TicketCategory>>> {
        self.categories.read().unwrap().get(&id).cloned()
    }

    /// Run `apply` against one category while holding its lock.
    fn with_category<T>(
        &self,
        id: CategoryId,
        apply: impl FnOnce(&mut TicketCategory) -> T,
    ) -> Result<T, StoreError> {
        let slot = self.slot(id).ok_or(StoreError::CategoryNotFound(id))?;
        let mut category = slot.lock().unwrap();
        Ok(apply(&mut category))
    }
}

impl QuotaStore for InMemoryQuotaStore {
    fn insert_category(&self, category: TicketCategory) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut categories = self.categories.write().unwrap();
            if categories.contains_key(&category.id) {
                return Err(StoreError::Database(format!(
                    "category {} already exists",
                    category.id
                )));
            }
            categories.insert(category.id, Arc::new(Mutex::new(category)));
            Ok(())
        })
    }

    fn category(&self, id: CategoryId) -> StoreFuture<'_, Option<TicketCategory>> {
        Box::pin(async move { Ok(self.snapshot(id)) })
    }

    fn try_reserve(
        &self,
        id: CategoryId,
        quantity: u32,
        at: DateTime<Utc>,
    ) -> StoreFuture<'_, ReserveOutcome> {
        Box::pin(async move {
            self.with_category(id, |category| {
                if !category.can_reserve(quantity) {
                    return ReserveOutcome::Insufficient {
                        available: category.available(),
                    };
                }
                category.reserved_quantity += quantity;
                category.updated_at = at;
                ReserveOutcome::Reserved(category.clone())
            })
        })
    }

    fn try_commit(
        &self,
        id: CategoryId,
        quantity: u32,
        at: DateTime<Utc>,
    ) -> StoreFuture<'_, SettleOutcome> {
        Box::pin(async move {
            self.with_category(id, |category| {
                if category.reserved_quantity < quantity {
                    return SettleOutcome::Short {
                        reserved: category.reserved_quantity,
                    };
                }
                category.reserved_quantity -= quantity;
                category.sold_quantity += quantity;
                category.updated_at = at;
                SettleOutcome::Applied(category.clone())
            })
        })
    }

    fn try_release(
        &self,
        id: CategoryId,
        quantity: u32,
        at: DateTime<Utc>,
    ) -> StoreFuture<'_, SettleOutcome> {
        Box::pin(async move {
            self.with_category(id, |category| {
                if category.reserved_quantity < quantity {
                    return SettleOutcome::Short {
                        reserved: category.reserved_quantity,
                    };
                }
                category.reserved_quantity -= quantity;
                category.updated_at = at;
                SettleOutcome::Applied(category.clone())
            })
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
            let mut settlements = self.settlements.lock().unwrap();
            if settlements.contains(&(order_id, kind)) {
                return Ok(SettlementOutcome::AlreadySettled);
            }

            let mut merged: BTreeMap<CategoryId, u32> = BTreeMap::new();
            for line in &lines {
                *merged.entry(line.category_id).or_insert(0) += line.quantity;
            }
            let slots = merged
                .keys()
                .map(|id| self.slot(*id).ok_or(StoreError::CategoryNotFound(*id)))
                .collect::<Result<Vec<_>, _>>()?;
            let mut guards: Vec<MutexGuard<'_, TicketCategory>> =
                slots.iter().map(|slot| slot.lock().unwrap()).collect();

            for (category, (id, quantity)) in guards.iter().zip(&merged) {
                if category.reserved_quantity < *quantity {
                    return Ok(SettlementOutcome::Short {
                        category: *id,
                        reserved: category.reserved_quantity,
                        requested: *quantity,
                    });
                }
            }
            for (category, quantity) in guards.iter_mut().zip(merged.values()) {
                category.reserved_quantity -= quantity;
                if kind == SettlementKind::Commit {
                    category.sold_quantity += quantity;
                }
                category.updated_at = at;
            }
            settlements.insert((order_id, kind));
            Ok(SettlementOutcome::Applied)
        })
    }
}

#[derive(Debug, Default)]
struct OrderTable {
    orders: HashMap<OrderId, Order>,
    keys: HashMap<IdempotencyKey, OrderId>,
}

/// Orders held in memory.
#[derive(Debug, Default)]
pub struct InMemoryOrderStore {
    table: RwLock<OrderTable>,
}

impl InMemoryOrderStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored orders
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.read().unwrap().orders.len()
    }

    /// Whether no order is stored
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.read().unwrap().orders.is_empty()
    }

    /// Snapshot of every stored order
    #[must_use]
    pub fn all(&self) -> Vec<Order> {
        self.table.read().unwrap().orders.values().cloned().collect()
    }

    /// Replace a stored order wholesale, bypassing every check.
    ///
    /// Used to stage crash states (e.g. canceled but never restored).
    pub fn overwrite(&self, order: Order) {
        let mut table = self.table.write().unwrap();
        if let Some(key) = &order.idempotency_key {
            table.keys.insert(key.clone(), order.id);
        }
        table.orders.insert(order.id, order);
    }

    fn update_where(
        &self,
        id: OrderId,
        applies: impl FnOnce(&Order) -> bool,
        apply: impl FnOnce(&mut Order),
    ) -> Option<Order> {
        let mut table = self.table.write().unwrap();
        let order = table.orders.get_mut(&id)?;
        if !applies(order) {
            return None;
        }
        apply(order);
        Some(order.clone())
    }

    fn select(
        &self,
        keep: impl Fn(&Order) -> bool,
        sort_key: impl Fn(&Order) -> (DateTime<Utc>, OrderId),
        limit: u32,
    ) -> Vec<Order> {
        let table = self.table.read().unwrap();
        let mut orders: Vec<Order> = table.orders.values().filter(|o| keep(o)).cloned().collect();
        orders.sort_by_key(sort_key);
        orders.truncate(limit as usize);
        orders
    }
}

impl OrderStore for InMemoryOrderStore {
    fn insert_order(&self, order: Order) -> StoreFuture<'_, Order> {
        Box::pin(async move {
            let mut table = self.table.write().unwrap();
            if let Some(key) = &order.idempotency_key {
                if table.keys.contains_key(key) {
                    return Err(StoreError::DuplicateIdempotencyKey(key.to_string()));
                }
            }
            if table.orders.contains_key(&order.id) {
                return Err(StoreError::Database(format!("order {} already exists", order.id)));
            }
            if let Some(key) = &order.idempotency_key {
                table.keys.insert(key.clone(), order.id);
            }
            table.orders.insert(order.id, order.clone());
            Ok(order)
        })
    }

    fn find_by_id(&self, id: OrderId) -> StoreFuture<'_, Option<Order>> {
        Box::pin(async move { Ok(self.table.read().unwrap().orders.get(&id).cloned()) })
    }

    fn find_by_idempotency_key(&self, key: IdempotencyKey) -> StoreFuture<'_, Option<Order>> {
        Box::pin(async move {
            let table = self.table.read().unwrap();
            Ok(table
                .keys
                .get(&key)
                .and_then(|id| table.orders.get(id))
                .cloned())
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
            Ok(self.update_where(
                id,
                |order| order.status == from,
                |order| {
                    order.status = to;
                    order.updated_at = at;
                    if to == OrderStatus::Paid {
                        order.paid_at = Some(at);
                    }
                },
            ))
        })
    }

    fn mark_quota_restored(&self, id: OrderId, at: DateTime<Utc>) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            Ok(self
                .update_where(
                    id,
                    |order| order.status.restores_quota() && !order.quota_restored,
                    |order| {
                        order.quota_restored = true;
                        order.updated_at = at;
                    },
                )
                .is_some())
        })
    }

    fn mark_quota_committed(&self, id: OrderId, at: DateTime<Utc>) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            Ok(self
                .update_where(
                    id,
                    |order| OrderStatus::SELLING.contains(&order.status) && !order.quota_committed,
                    |order| {
                        order.quota_committed = true;
                        order.updated_at = at;
                    },
                )
                .is_some())
        })
    }

    fn list_pending_expired(&self, query: ExpiredOrderQuery) -> StoreFuture<'_, Vec<Order>> {
        Box::pin(async move {
            Ok(self.select(
                |order| order.status == OrderStatus::Pending && order.is_past_due(query.now),
                |order| (order.expires_at, order.id),
                query.limit,
            ))
        })
    }

    fn list_unrestored_terminal(&self, query: UnsettledOrderQuery) -> StoreFuture<'_, Vec<Order>> {
        Box::pin(async move {
            Ok(self.select(
                |order| {
                    order.status.restores_quota() && !order.quota_restored && query.in_window(order)
                },
                |order| (order.updated_at, order.id),
                query.limit,
            ))
        })
    }

    fn list_uncommitted_paid(&self, query: UnsettledOrderQuery) -> StoreFuture<'_, Vec<Order>> {
        Box::pin(async move {
            Ok(self.select(
                |order| {
                    OrderStatus::SELLING.contains(&order.status)
                        && !order.quota_committed
                        && query.in_window(order)
                },
                |order| (order.updated_at, order.id),
                query.limit,
            ))
        })
    }

    fn list_orders(&self, filter: OrderFilter) -> StoreFuture<'_, Vec<Order>> {
        Box::pin(async move {
            let table = self.table.read().unwrap();
            let mut orders: Vec<Order> = table
                .orders
                .values()
                .filter(|order| filter.matches(order))
                .cloned()
                .collect();
            orders.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
            Ok(orders
                .into_iter()
                .skip(filter.offset as usize)
                .take(filter.limit as usize)
                .collect())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_clock;
    use boxoffice_core::environment::Clock;
    use boxoffice_core::{BuyerId, EventId, Money, OrderItem};
    use chrono::Duration;

    fn category(total: u32) -> TicketCategory {
        TicketCategory::new(EventId::new(), "GA", Money::from_cents(100), total, test_clock().now())
    }

    fn order(key: Option<&str>) -> Order {
        let now = test_clock().now();
        let id = OrderId::new();
        Order {
            id,
            order_code: Order::code_for(id, now),
            buyer_id: BuyerId::new(),
            status: OrderStatus::Pending,
            idempotency_key: IdempotencyKey::parse(key),
            total_amount: Money::from_cents(100),
            quota_restored: false,
            quota_committed: false,
            expires_at: now + Duration::minutes(15),
            paid_at: None,
            created_at: now,
            updated_at: now,
            items: vec![OrderItem::new(id, CategoryId::new(), 1, Money::from_cents(100))],
        }
    }

    #[tokio::test]
    async fn reserve_respects_capacity() {
        let store = InMemoryQuotaStore::new();
        let c = category(2);
        let id = c.id;
        store.insert_category(c).await.unwrap();
        let at = test_clock().now();

        assert!(matches!(store.try_reserve(id, 2, at).await.unwrap(), ReserveOutcome::Reserved(_)));
        assert_eq!(
            store.try_reserve(id, 1, at).await.unwrap(),
            ReserveOutcome::Insufficient { available: 0 }
        );
        assert_eq!(
            store.try_commit(id, 3, at).await.unwrap(),
            SettleOutcome::Short { reserved: 2 }
        );
        let missing = CategoryId::new();
        assert_eq!(
            store.try_reserve(missing, 1, at).await.unwrap_err(),
            StoreError::CategoryNotFound(missing)
        );
    }

    #[tokio::test]
    async fn order_settlement_is_all_or_nothing_and_recorded_once() {
        let store = InMemoryQuotaStore::new();
        let (a, b) = (category(5), category(5));
        let (a_id, b_id) = (a.id, b.id);
        store.insert_category(a).await.unwrap();
        store.insert_category(b).await.unwrap();
        let at = test_clock().now();
        store.try_reserve(a_id, 3, at).await.unwrap();
        store.try_reserve(b_id, 1, at).await.unwrap();
        let order_id = OrderId::new();

        let short = store
            .settle_order(
                order_id,
                SettlementKind::Commit,
                vec![OrderLine::new(a_id, 3), OrderLine::new(b_id, 2)],
                at,
            )
            .await
            .unwrap();
        assert_eq!(
            short,
            SettlementOutcome::Short {
                category: b_id,
                reserved: 1,
                requested: 2,
            }
        );
        assert_eq!(store.snapshot(a_id).unwrap().reserved_quantity, 3);
        assert!(!store.is_settled(order_id, SettlementKind::Commit));

        let lines = vec![OrderLine::new(a_id, 3), OrderLine::new(b_id, 1)];
        assert_eq!(
            store
                .settle_order(order_id, SettlementKind::Commit, lines.clone(), at)
                .await
                .unwrap(),
            SettlementOutcome::Applied
        );
        assert_eq!(
            store
                .settle_order(order_id, SettlementKind::Commit, lines, at)
                .await
                .unwrap(),
            SettlementOutcome::AlreadySettled
        );
        let a = store.snapshot(a_id).unwrap();
        assert_eq!((a.reserved_quantity, a.sold_quantity), (0, 3));
        let b = store.snapshot(b_id).unwrap();
        assert_eq!((b.reserved_quantity, b.sold_quantity), (0, 1));
    }

    #[tokio::test]
    async fn order_settlement_with_unknown_category_writes_nothing() {
        let store = InMemoryQuotaStore::new();
        let c = category(5);
        let id = c.id;
        store.insert_category(c).await.unwrap();
        let at = test_clock().now();
        store.try_reserve(id, 2, at).await.unwrap();
        let missing = CategoryId::new();
        let order_id = OrderId::new();

        let err = store
            .settle_order(
                order_id,
                SettlementKind::Release,
                vec![OrderLine::new(id, 2), OrderLine::new(missing, 1)],
                at,
            )
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::CategoryNotFound(missing));
        assert_eq!(store.snapshot(id).unwrap().reserved_quantity, 2);
        assert!(!store.is_settled(order_id, SettlementKind::Release));
    }

    #[tokio::test]
    async fn insert_is_unique_per_key() {
        let store = InMemoryOrderStore::new();
        let first = order(Some("k"));
        store.insert_order(first.clone()).await.unwrap();

        let err = store.insert_order(order(Some("k"))).await.unwrap_err();
        assert_eq!(err, StoreError::DuplicateIdempotencyKey("k".to_string()));
        assert_eq!(store.len(), 1);

        let key = IdempotencyKey::parse(Some("k")).unwrap();
        assert_eq!(store.find_by_idempotency_key(key).await.unwrap(), Some(first));
    }

    #[tokio::test]
    async fn transition_is_compare_and_swap() {
        let store = InMemoryOrderStore::new();
        let o = order(None);
        store.insert_order(o.clone()).await.unwrap();
        let at = test_clock().now() + Duration::minutes(1);

        let paid = store
            .transition_status(o.id, OrderStatus::Pending, OrderStatus::Paid, at)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(paid.paid_at, Some(at));
        assert!(
            store
                .transition_status(o.id, OrderStatus::Pending, OrderStatus::Expired, at)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn restored_flag_flips_once_and_only_for_restoring_statuses() {
        let store = InMemoryOrderStore::new();
        let o = order(None);
        store.insert_order(o.clone()).await.unwrap();
        let at = test_clock().now();

        assert!(!store.mark_quota_restored(o.id, at).await.unwrap());
        store
            .transition_status(o.id, OrderStatus::Pending, OrderStatus::Canceled, at)
            .await
            .unwrap();
        assert!(store.mark_quota_restored(o.id, at).await.unwrap());
        assert!(!store.mark_quota_restored(o.id, at).await.unwrap());
        assert!(!store.mark_quota_committed(o.id, at).await.unwrap());
    }
}
