//! Order lifecycle manager.
//!
//! Owns the order state machine and keeps quota consistent with it:
//!
//! | Transition           | Quota effect                        | Flag              |
//! |----------------------|-------------------------------------|-------------------|
//! | create → Pending     | reserve every line                  |                   |
//! | Pending → Paid       | commit every line (reserved → sold) | `quota_committed` |
//! | Pending → Canceled   | release every line                  | `quota_restored`  |
//! | Pending → Failed     | release every line                  | `quota_restored`  |
//! | Pending → Expired    | release every line                  | `quota_restored`  |
//! | Paid → Completed     | none                                |                   |
//!
//! Status changes are compare-and-swap writes; when two flows race on the same
//! order exactly one of them observes `Pending`. The loser gets
//! [`OrderError::InvalidStateTransition`].
//!
//! Quota is settled *after* the status write and flagged *after* the quota
//! write. The store records each order's settlement atomically with its counter
//! writes, so settling again is a no-op. A crash or error anywhere along the way
//! leaves the flag unset, and the reconciler finishes the job without touching
//! the counters twice.

use crate::bounded;
use crate::config::LifecycleConfig;
use crate::idempotency::{Creation, IdempotencyGuard, PreparedOrder};
use crate::ledger::{QuotaLedger, normalize_lines};
use crate::metrics::{AUDIT_FAILURES, ORDER_TRANSITIONS, QUOTA_COMMITTED, QUOTA_RESTORED, counter};
use boxoffice_core::environment::{AuditRecorder, Clock};
use boxoffice_core::query::{ExpiredOrderQuery, OrderFilter, UnsettledOrderQuery};
use boxoffice_core::store::{OrderStore, QuotaStore, SettlementKind};
use boxoffice_core::{
    Actor, AuditEvent, BuyerId, DateTime, IdempotencyKey, Money, Order, OrderError, OrderId,
    OrderItem, OrderLine, OrderStatus, Utc,
};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// The order state machine.
///
/// Cheap to share behind an `Arc`; every method takes `&self`.
pub struct OrderLifecycleManager {
    orders: Arc<dyn OrderStore>,
    ledger: Arc<QuotaLedger>,
    guard: IdempotencyGuard,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditRecorder>,
    config: LifecycleConfig,
}

impl OrderLifecycleManager {
    /// Wire a manager over the given stores and collaborators.
    #[must_use]
    pub fn new(
        quotas: Arc<dyn QuotaStore>,
        orders: Arc<dyn OrderStore>,
        clock: Arc<dyn Clock>,
        audit: Arc<dyn AuditRecorder>,
        config: LifecycleConfig,
    ) -> Self {
        let ledger = Arc::new(QuotaLedger::new(
            quotas,
            clock.clone(),
            config.persistence_timeout,
        ));
        let guard = IdempotencyGuard::new(
            orders.clone(),
            ledger.clone(),
            config.persistence_timeout,
        );
        Self {
            orders,
            ledger,
            guard,
            clock,
            audit,
            config,
        }
    }

    /// The quota ledger this manager settles through.
    #[must_use]
    pub fn ledger(&self) -> &QuotaLedger {
        &self.ledger
    }

    /// Configuration in effect.
    #[must_use]
    pub const fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Current time according to the injected clock.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Create a pending order, or return the one that already owns `key`.
    ///
    /// Lines are merged per category and reserved in ascending category order.
    /// Prices come from the categories at creation time. If any reservation
    /// fails, the ones already made are released and nothing is persisted.
    ///
    /// # Errors
    ///
    /// - `InvalidRequest`: no lines, zero quantity, or total overflow
    /// - `CategoryNotFound`: a line names an unknown category
    /// - `QuotaExceeded`: some category lacks capacity
    /// - `Persistence`: store failure or timeout (retry with the same key)
    pub async fn create(
        &self,
        buyer_id: BuyerId,
        lines: &[OrderLine],
        key: Option<IdempotencyKey>,
    ) -> Result<Creation, OrderError> {
        let lines = normalize_lines(lines)?;

        let creation = self
            .guard
            .create_or_find(key.as_ref(), || self.prepare(buyer_id, &lines, key.clone()))
            .await?;

        if let Creation::Created(order) = &creation {
            counter!(ORDER_TRANSITIONS, "to" => OrderStatus::Pending.as_str()).increment(1);
            info!(
                order_id = %order.id,
                order_code = %order.order_code,
                buyer_id = %buyer_id,
                total = %order.total_amount,
                expires_at = %order.expires_at,
                "Order created"
            );
            self.record(order, None, Actor::Buyer(buyer_id));
        }

        Ok(creation)
    }

    /// Confirm payment: `Pending → Paid`, then commit the reserved quota.
    ///
    /// # Errors
    ///
    /// - `InvalidStateTransition`: the order is no longer pending (already paid,
    ///   canceled, expired, ...)
    /// - `OrderNotFound`: unknown id
    /// - `InvariantViolation`: the ledger holds fewer reserved units than the
    ///   order; the order stays `Paid` with `quota_committed = false`
    /// - `Persistence`: store failure or timeout
    pub async fn mark_paid(&self, order_id: OrderId) -> Result<Order, OrderError> {
        let Some(order) = self
            .transition(order_id, OrderStatus::Pending, OrderStatus::Paid)
            .await?
        else {
            let current = self.get(order_id).await?;
            debug!(
                order_id = %order_id,
                status = %current.status,
                "Payment confirmation for an order that is no longer pending"
            );
            return Err(OrderError::InvalidStateTransition {
                order_id,
                from: current.status,
                to: OrderStatus::Paid,
            });
        };

        info!(order_id = %order.id, order_code = %order.order_code, "Order paid");
        self.record(&order, Some(OrderStatus::Pending), Actor::PaymentProvider);
        self.settle_payment(order).await
    }

    /// Cancel a pending order and release its quota.
    ///
    /// Canceling an already canceled order returns it unchanged.
    ///
    /// # Errors
    ///
    /// - `InvalidStateTransition`: the order left `Pending` another way
    /// - `OrderNotFound`: unknown id
    /// - `Persistence`: store failure or timeout
    pub async fn cancel(&self, order_id: OrderId, actor: Actor) -> Result<Order, OrderError> {
        self.abandon(order_id, OrderStatus::Canceled, actor).await
    }

    /// Record a failed payment: `Pending → Failed`, releasing quota.
    ///
    /// # Errors
    ///
    /// Same as [`cancel`](Self::cancel).
    pub async fn mark_failed(&self, order_id: OrderId) -> Result<Order, OrderError> {
        self.abandon(order_id, OrderStatus::Failed, Actor::PaymentProvider)
            .await
    }

    /// Hand a paid order over to fulfilment: `Paid → Completed`.
    ///
    /// Completing an already completed order returns it unchanged.
    ///
    /// # Errors
    ///
    /// - `InvalidStateTransition`: the order is not paid
    /// - `OrderNotFound`: unknown id
    /// - `Persistence`: store failure or timeout
    pub async fn complete(&self, order_id: OrderId, actor: Actor) -> Result<Order, OrderError> {
        if let Some(order) = self
            .transition(order_id, OrderStatus::Paid, OrderStatus::Completed)
            .await?
        {
            info!(order_id = %order.id, order_code = %order.order_code, "Order completed");
            self.record(&order, Some(OrderStatus::Paid), actor);
            return Ok(order);
        }

        let current = self.get(order_id).await?;
        if current.status == OrderStatus::Completed {
            return Ok(current);
        }
        Err(OrderError::InvalidStateTransition {
            order_id,
            from: current.status,
            to: OrderStatus::Completed,
        })
    }

    /// Expire a pending order whose payment window has closed.
    ///
    /// Returns `true` if this call performed the transition and released the
    /// quota, `false` if the order was already expired.
    ///
    /// # Errors
    ///
    /// - `InvalidStateTransition`: the order is not pending, or its deadline has
    ///   not passed yet
    /// - `OrderNotFound`: unknown id
    /// - `Persistence`: store failure or timeout
    pub async fn expire(&self, order_id: OrderId) -> Result<bool, OrderError> {
        let current = self.get(order_id).await?;
        match current.status {
            OrderStatus::Expired => return Ok(false),
            OrderStatus::Pending if current.is_past_due(self.now()) => {}
            from => {
                return Err(OrderError::InvalidStateTransition {
                    order_id,
                    from,
                    to: OrderStatus::Expired,
                });
            }
        }

        let Some(order) = self
            .transition(order_id, OrderStatus::Pending, OrderStatus::Expired)
            .await?
        else {
            let current = self.get(order_id).await?;
            if current.status == OrderStatus::Expired {
                return Ok(false);
            }
            return Err(OrderError::InvalidStateTransition {
                order_id,
                from: current.status,
                to: OrderStatus::Expired,
            });
        };

        info!(
            order_id = %order.id,
            order_code = %order.order_code,
            expires_at = %order.expires_at,
            "Order expired"
        );
        self.record(&order, Some(OrderStatus::Pending), Actor::Reconciler);
        self.restore_quota(order).await?;
        Ok(true)
    }

    /// Load an order with its items.
    ///
    /// # Errors
    ///
    /// - `OrderNotFound`: unknown id
    /// - `Persistence`: store failure or timeout
    pub async fn get(&self, order_id: OrderId) -> Result<Order, OrderError> {
        bounded(self.timeout(), "find_by_id", self.orders.find_by_id(order_id))
            .await?
            .ok_or(OrderError::OrderNotFound(order_id))
    }

    /// Orders matching `filter`, newest first.
    ///
    /// # Errors
    ///
    /// - `Persistence`: store failure or timeout
    pub async fn list(&self, filter: OrderFilter) -> Result<Vec<Order>, OrderError> {
        Ok(bounded(self.timeout(), "list_orders", self.orders.list_orders(filter)).await?)
    }

    /// Release an abandoned order's quota, then flag it restored.
    ///
    /// Safe to repeat: the release lands once per order however often this
    /// runs, and the conditional flag write reports only one caller.
    pub(crate) async fn restore_quota(&self, mut order: Order) -> Result<Order, OrderError> {
        let released = match self
            .ledger
            .settle_order(order.id, SettlementKind::Release, &order.quota_lines())
            .await
        {
            Ok(released) => released,
            Err(e) => {
                log_settlement_error(&order, "release", &e);
                return Err(e);
            }
        };
        if released {
            counter!(QUOTA_RESTORED).increment(1);
        }

        let at = self.now();
        if bounded(
            self.timeout(),
            "mark_quota_restored",
            self.orders.mark_quota_restored(order.id, at),
        )
        .await?
        {
            debug!(order_id = %order.id, status = %order.status, released, "Quota restored");
            order.quota_restored = true;
            order.updated_at = at;
        }
        Ok(order)
    }

    /// Commit a paid order's reservations, then flag it committed.
    pub(crate) async fn settle_payment(&self, mut order: Order) -> Result<Order, OrderError> {
        let committed = match self
            .ledger
            .settle_order(order.id, SettlementKind::Commit, &order.quota_lines())
            .await
        {
            Ok(committed) => committed,
            Err(e) => {
                log_settlement_error(&order, "commit", &e);
                return Err(e);
            }
        };
        if committed {
            counter!(QUOTA_COMMITTED).increment(1);
        }

        let at = self.now();
        if bounded(
            self.timeout(),
            "mark_quota_committed",
            self.orders.mark_quota_committed(order.id, at),
        )
        .await?
        {
            debug!(order_id = %order.id, committed, "Quota committed");
            order.quota_committed = true;
            order.updated_at = at;
        }
        Ok(order)
    }

    pub(crate) async fn pending_expired(
        &self,
        query: ExpiredOrderQuery,
    ) -> Result<Vec<Order>, OrderError> {
        Ok(bounded(
            self.timeout(),
            "list_pending_expired",
            self.orders.list_pending_expired(query),
        )
        .await?)
    }

    pub(crate) async fn unrestored_terminal(
        &self,
        query: UnsettledOrderQuery,
    ) -> Result<Vec<Order>, OrderError> {
        Ok(bounded(
            self.timeout(),
            "list_unrestored_terminal",
            self.orders.list_unrestored_terminal(query),
        )
        .await?)
    }

    pub(crate) async fn uncommitted_paid(
        &self,
        query: UnsettledOrderQuery,
    ) -> Result<Vec<Order>, OrderError> {
        Ok(bounded(
            self.timeout(),
            "list_uncommitted_paid",
            self.orders.list_uncommitted_paid(query),
        )
        .await?)
    }

    const fn timeout(&self) -> std::time::Duration {
        self.config.persistence_timeout
    }

    /// Price the lines, reserve them, and assemble the draft order.
    async fn prepare(
        &self,
        buyer_id: BuyerId,
        lines: &[OrderLine],
        key: Option<IdempotencyKey>,
    ) -> Result<PreparedOrder, OrderError> {
        // Prices are read before reserving so an unknown category or an
        // overflowing total fails without touching any counter.
        let mut priced = Vec::with_capacity(lines.len());
        let mut total = Money::ZERO;
        for line in lines {
            let category = self.ledger.category(line.category_id).await?;
            total = category
                .unit_price
                .checked_mul(line.quantity)
                .and_then(|subtotal| total.checked_add(subtotal))
                .ok_or_else(|| OrderError::InvalidRequest("order total overflows".to_string()))?;
            priced.push((*line, category.unit_price));
        }

        let hold = self.ledger.reserve_all(lines).await?;

        let now = self.now();
        let id = OrderId::new();
        let items = priced
            .into_iter()
            .map(|(line, unit_price)| OrderItem::new(id, line.category_id, line.quantity, unit_price))
            .collect();

        Ok(PreparedOrder {
            order: Order {
                id,
                order_code: Order::code_for(id, now),
                buyer_id,
                status: OrderStatus::Pending,
                idempotency_key: key,
                total_amount: total,
                quota_restored: false,
                quota_committed: false,
                expires_at: now + self.config.payment_window,
                paid_at: None,
                created_at: now,
                updated_at: now,
                items,
            },
            hold,
        })
    }

    /// `Pending → to` for the non-paid terminal statuses, then release quota.
    async fn abandon(
        &self,
        order_id: OrderId,
        to: OrderStatus,
        actor: Actor,
    ) -> Result<Order, OrderError> {
        let Some(order) = self.transition(order_id, OrderStatus::Pending, to).await? else {
            let current = self.get(order_id).await?;
            if current.status == to {
                debug!(order_id = %order_id, status = %to, "Order already in requested status");
                return Ok(current);
            }
            return Err(OrderError::InvalidStateTransition {
                order_id,
                from: current.status,
                to,
            });
        };

        info!(
            order_id = %order.id,
            order_code = %order.order_code,
            status = %to,
            actor = %actor,
            "Order abandoned"
        );
        self.record(&order, Some(OrderStatus::Pending), actor);
        self.restore_quota(order).await
    }

    async fn transition(
        &self,
        order_id: OrderId,
        from: OrderStatus,
        to: OrderStatus,
    ) -> Result<Option<Order>, OrderError> {
        let updated = bounded(
            self.timeout(),
            "transition_status",
            self.orders.transition_status(order_id, from, to, self.now()),
        )
        .await?;
        if updated.is_some() {
            counter!(ORDER_TRANSITIONS, "to" => to.as_str()).increment(1);
        }
        Ok(updated)
    }

    /// Hand the transition to the audit sink. Failures never undo it.
    fn record(&self, order: &Order, from: Option<OrderStatus>, actor: Actor) {
        let event = AuditEvent {
            order_id: order.id,
            from_status: from,
            to_status: order.status,
            timestamp: order.updated_at,
            actor,
        };
        if let Err(e) = self.audit.record(event) {
            counter!(AUDIT_FAILURES).increment(1);
            warn!(order_id = %order.id, status = %order.status, error = %e, "Failed to record audit event");
        }
    }
}

fn log_settlement_error(order: &Order, operation: &'static str, e: &OrderError) {
    if matches!(e, OrderError::InvariantViolation { .. }) {
        error!(
            order_id = %order.id,
            status = %order.status,
            operation,
            error = %e,
            "Order quota could not be settled"
        );
    } else {
        warn!(
            order_id = %order.id,
            status = %order.status,
            operation,
            error = %e,
            "Order quota settlement interrupted; the reconciler will retry"
        );
    }
}
