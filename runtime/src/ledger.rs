//! Quota ledger: the only way ticket-category counters change.
//!
//! Every oversell hazard is concentrated here. The ledger turns the store's
//! per-category check-and-write outcomes into [`OrderError`]s and adds the
//! multi-category operations the lifecycle manager needs:
//!
//! - [`QuotaLedger::reserve_all`] reserves every line of an order in ascending
//!   category order and rolls back its own partial progress on failure.
//! - [`QuotaLedger::release_hold`] returns a hold's inventory.
//! - [`QuotaLedger::settle_order`] releases or commits a persisted order's
//!   lines as one unit, at most once per order.
//!
//! Single-category releases and holds are not remembered; releasing those
//! exactly once is the caller's job. Order settlements are recorded by the
//! store together with their counter writes, so retrying one is always safe.

use crate::bounded;
use crate::metrics::{
    QUOTA_EXCEEDED, QUOTA_INVARIANT_VIOLATIONS, QUOTA_LEAKED, QUOTA_RESERVED_UNITS, counter,
};
use boxoffice_core::environment::Clock;
use boxoffice_core::store::{
    QuotaStore, ReserveOutcome, SettleOutcome, SettlementKind, SettlementOutcome,
};
use boxoffice_core::{CategoryId, OrderError, OrderId, OrderLine, StoreError, TicketCategory};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

/// Reservations made for one draft order.
///
/// Lines are merged per category and sorted by category id. A hold is either
/// persisted with its order or handed back through [`QuotaLedger::release_hold`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use = "a quota hold must be persisted with its order or released"]
pub struct QuotaHold {
    lines: Vec<OrderLine>,
}

impl QuotaHold {
    /// Reserved lines, ascending by category.
    pub fn lines(&self) -> &[OrderLine] {
        &self.lines
    }

    /// Total units held.
    #[must_use]
    pub fn units(&self) -> u64 {
        self.lines.iter().map(|line| u64::from(line.quantity)).sum()
    }
}

/// Merge lines per category and sort them by category id.
///
/// Sorting gives every request the same lock acquisition order, so two orders
/// touching the same categories cannot deadlock each other.
///
/// # Errors
///
/// Returns [`OrderError::InvalidRequest`] if `lines` is empty, a quantity is zero,
/// or a merged quantity overflows.
pub fn normalize_lines(lines: &[OrderLine]) -> Result<Vec<OrderLine>, OrderError> {
    if lines.is_empty() {
        return Err(OrderError::InvalidRequest("order has no items".to_string()));
    }

    let mut merged: BTreeMap<CategoryId, u32> = BTreeMap::new();
    for line in lines {
        if line.quantity == 0 {
            return Err(OrderError::InvalidRequest(format!(
                "quantity for category {} must be positive",
                line.category_id
            )));
        }
        let total = merged.entry(line.category_id).or_insert(0);
        *total = total.checked_add(line.quantity).ok_or_else(|| {
            OrderError::InvalidRequest(format!(
                "quantity for category {} overflows",
                line.category_id
            ))
        })?;
    }

    Ok(merged
        .into_iter()
        .map(|(category_id, quantity)| OrderLine::new(category_id, quantity))
        .collect())
}

/// Per-category inventory counters with atomic reserve, commit and release.
pub struct QuotaLedger {
    store: Arc<dyn QuotaStore>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl QuotaLedger {
    /// Create a ledger over `store`; every store call is bounded by `timeout`.
    #[must_use]
    pub fn new(store: Arc<dyn QuotaStore>, clock: Arc<dyn Clock>, timeout: Duration) -> Self {
        Self {
            store,
            clock,
            timeout,
        }
    }

    /// Read a category snapshot.
    ///
    /// # Errors
    ///
    /// - `CategoryNotFound`: unknown id
    /// - `Persistence`: store failure or timeout
    pub async fn category(&self, id: CategoryId) -> Result<TicketCategory, OrderError> {
        bounded(self.timeout, "category", self.store.category(id))
            .await?
            .ok_or(OrderError::CategoryNotFound(id))
    }

    /// Reserve `quantity` units of `id`.
    ///
    /// Succeeds only if `reserved + sold + quantity <= total`; the check and the
    /// increment are one atomic unit in the store.
    ///
    /// # Errors
    ///
    /// - `QuotaExceeded`: not enough capacity, nothing mutated
    /// - `InvalidRequest`: zero quantity
    /// - `CategoryNotFound`: unknown id
    /// - `Persistence`: store failure or timeout
    pub async fn reserve(&self, id: CategoryId, quantity: u32) -> Result<TicketCategory, OrderError> {
        reject_zero(id, quantity)?;
        let outcome = bounded(
            self.timeout,
            "try_reserve",
            self.store.try_reserve(id, quantity, self.clock.now()),
        )
        .await
        .map_err(|e| category_error(id, e))?;

        match outcome {
            ReserveOutcome::Reserved(category) => {
                counter!(QUOTA_RESERVED_UNITS).increment(u64::from(quantity));
                debug!(
                    category_id = %id,
                    quantity,
                    reserved = category.reserved_quantity,
                    sold = category.sold_quantity,
                    "Quota reserved"
                );
                Ok(category)
            }
            ReserveOutcome::Insufficient { available } => {
                counter!(QUOTA_EXCEEDED).increment(1);
                debug!(category_id = %id, quantity, available, "Quota exceeded");
                Err(OrderError::QuotaExceeded {
                    category: id,
                    requested: quantity,
                    available,
                })
            }
        }
    }

    /// Move `quantity` units of `id` from reserved to sold.
    ///
    /// # Errors
    ///
    /// - `InvariantViolation`: fewer units reserved than `quantity`, nothing mutated
    /// - `InvalidRequest`: zero quantity
    /// - `CategoryNotFound`: unknown id
    /// - `Persistence`: store failure or timeout
    pub async fn commit(&self, id: CategoryId, quantity: u32) -> Result<TicketCategory, OrderError> {
        reject_zero(id, quantity)?;
        let outcome = bounded(
            self.timeout,
            "try_commit",
            self.store.try_commit(id, quantity, self.clock.now()),
        )
        .await
        .map_err(|e| category_error(id, e))?;
        settled(id, quantity, outcome, "commit")
    }

    /// Return `quantity` reserved units of `id` to the available pool.
    ///
    /// # Errors
    ///
    /// - `InvariantViolation`: fewer units reserved than `quantity`, nothing mutated
    /// - `InvalidRequest`: zero quantity
    /// - `CategoryNotFound`: unknown id
    /// - `Persistence`: store failure or timeout
    pub async fn release(&self, id: CategoryId, quantity: u32) -> Result<TicketCategory, OrderError> {
        reject_zero(id, quantity)?;
        let outcome = bounded(
            self.timeout,
            "try_release",
            self.store.try_release(id, quantity, self.clock.now()),
        )
        .await
        .map_err(|e| category_error(id, e))?;
        settled(id, quantity, outcome, "release")
    }

    /// Reserve every line, all or nothing.
    ///
    /// Lines are normalized (merged, ascending category order) first. If any
    /// reservation fails, the ones already made by this call are released before
    /// the error is returned.
    ///
    /// # Errors
    ///
    /// The first reservation error (`QuotaExceeded`, `CategoryNotFound`,
    /// `Persistence`), or `InvalidRequest` for malformed lines.
    pub async fn reserve_all(&self, lines: &[OrderLine]) -> Result<QuotaHold, OrderError> {
        let lines = normalize_lines(lines)?;
        let mut reserved: Vec<OrderLine> = Vec::with_capacity(lines.len());

        for line in &lines {
            if let Err(e) = self.reserve(line.category_id, line.quantity).await {
                self.compensate(&reserved).await;
                return Err(e);
            }
            reserved.push(*line);
        }

        Ok(QuotaHold { lines })
    }

    /// Release every line of an unused hold.
    ///
    /// # Errors
    ///
    /// The first release error; the remaining lines are still attempted.
    pub async fn release_hold(&self, hold: QuotaHold) -> Result<(), OrderError> {
        let mut first_error = None;
        for line in &hold.lines {
            if let Err(e) = self.release(line.category_id, line.quantity).await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Release or commit every line of `order_id` in one atomic store write.
    ///
    /// Returns `true` if this call moved the counters, `false` if the order
    /// had already been settled the same way. A call that failed with a
    /// persistence error may or may not have landed; calling again settles it
    /// exactly once either way.
    ///
    /// # Errors
    ///
    /// - `InvariantViolation`: some category holds fewer reserved units than its
    ///   line, nothing mutated
    /// - `InvalidRequest`: malformed lines
    /// - `CategoryNotFound`: a line names an unknown category
    /// - `Persistence`: store failure or timeout
    pub async fn settle_order(
        &self,
        order_id: OrderId,
        kind: SettlementKind,
        lines: &[OrderLine],
    ) -> Result<bool, OrderError> {
        let lines = normalize_lines(lines)?;
        let units: u64 = lines.iter().map(|line| u64::from(line.quantity)).sum();
        let outcome = bounded(
            self.timeout,
            "settle_order",
            self.store.settle_order(order_id, kind, lines, self.clock.now()),
        )
        .await
        .map_err(|e| match e {
            StoreError::CategoryNotFound(id) => OrderError::CategoryNotFound(id),
            other => OrderError::Persistence(other),
        })?;

        match outcome {
            SettlementOutcome::Applied => {
                debug!(order_id = %order_id, kind = %kind, units, "Order quota settled");
                Ok(true)
            }
            SettlementOutcome::AlreadySettled => {
                debug!(order_id = %order_id, kind = %kind, "Order quota was already settled");
                Ok(false)
            }
            SettlementOutcome::Short {
                category,
                reserved,
                requested,
            } => {
                counter!(QUOTA_INVARIANT_VIOLATIONS, "operation" => kind.as_str()).increment(1);
                error!(
                    order_id = %order_id,
                    category_id = %category,
                    quantity = requested,
                    reserved,
                    operation = kind.as_str(),
                    "Quota invariant violated: fewer units reserved than the order holds"
                );
                Err(OrderError::InvariantViolation {
                    category,
                    reserved,
                    requested,
                })
            }
        }
    }

    /// Undo this call's own reservations after a failed `reserve_all`.
    async fn compensate(&self, reserved: &[OrderLine]) {
        for line in reserved {
            if let Err(e) = self.release(line.category_id, line.quantity).await {
                counter!(QUOTA_LEAKED).increment(1);
                error!(
                    category_id = %line.category_id,
                    quantity = line.quantity,
                    error = %e,
                    "Failed to roll back reservation; units remain reserved"
                );
            }
        }
    }
}

fn reject_zero(id: CategoryId, quantity: u32) -> Result<(), OrderError> {
    if quantity == 0 {
        return Err(OrderError::InvalidRequest(format!(
            "quantity for category {id} must be positive"
        )));
    }
    Ok(())
}

fn category_error(id: CategoryId, error: StoreError) -> OrderError {
    match error {
        StoreError::CategoryNotFound(_) => OrderError::CategoryNotFound(id),
        other => OrderError::Persistence(other),
    }
}

fn settled(
    id: CategoryId,
    quantity: u32,
    outcome: SettleOutcome,
    operation: &'static str,
) -> Result<TicketCategory, OrderError> {
    match outcome {
        SettleOutcome::Applied(category) => {
            debug!(
                category_id = %id,
                quantity,
                operation,
                reserved = category.reserved_quantity,
                sold = category.sold_quantity,
                "Quota settled"
            );
            Ok(category)
        }
        SettleOutcome::Short { reserved } => {
            counter!(QUOTA_INVARIANT_VIOLATIONS, "operation" => operation).increment(1);
            error!(
                category_id = %id,
                quantity,
                reserved,
                operation,
                "Quota invariant violated: fewer units reserved than the operation needs"
            );
            Err(OrderError::InvariantViolation {
                category: id,
                reserved,
                requested: quantity,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use boxoffice_core::{EventId, Money};
    use boxoffice_testing::{InMemoryQuotaStore, test_clock};

    async fn ledger_with(totals: &[u32]) -> (QuotaLedger, Arc<InMemoryQuotaStore>, Vec<CategoryId>) {
        let clock = Arc::new(test_clock());
        let store = Arc::new(InMemoryQuotaStore::new());
        let mut ids = Vec::new();
        for total in totals {
            let category = TicketCategory::new(
                EventId::new(),
                "GA",
                Money::from_cents(1_000),
                *total,
                clock.now(),
            );
            ids.push(category.id);
            store.insert_category(category).await.unwrap();
        }
        let ledger = QuotaLedger::new(store.clone(), clock, Duration::from_secs(1));
        (ledger, store, ids)
    }

    #[test]
    fn normalize_merges_and_sorts() {
        let a = CategoryId::new();
        let b = CategoryId::new();
        let (low, high) = if a < b { (a, b) } else { (b, a) };

        let lines = normalize_lines(&[
            OrderLine::new(high, 1),
            OrderLine::new(low, 2),
            OrderLine::new(high, 3),
        ])
        .unwrap();

        assert_eq!(lines, vec![OrderLine::new(low, 2), OrderLine::new(high, 4)]);
    }

    #[test]
    fn normalize_rejects_empty_and_zero() {
        assert!(matches!(normalize_lines(&[]), Err(OrderError::InvalidRequest(_))));
        assert!(matches!(
            normalize_lines(&[OrderLine::new(CategoryId::new(), 0)]),
            Err(OrderError::InvalidRequest(_))
        ));
        let id = CategoryId::new();
        assert!(matches!(
            normalize_lines(&[OrderLine::new(id, u32::MAX), OrderLine::new(id, 1)]),
            Err(OrderError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn reserve_until_exhausted() {
        let (ledger, _, ids) = ledger_with(&[2]).await;
        ledger.reserve(ids[0], 1).await.unwrap();
        let category = ledger.reserve(ids[0], 1).await.unwrap();
        assert_eq!(category.reserved_quantity, 2);

        let err = ledger.reserve(ids[0], 1).await.unwrap_err();
        assert_eq!(
            err,
            OrderError::QuotaExceeded {
                category: ids[0],
                requested: 1,
                available: 0,
            }
        );
    }

    #[tokio::test]
    async fn commit_and_release_move_reserved_units() {
        let (ledger, _, ids) = ledger_with(&[5]).await;
        ledger.reserve(ids[0], 3).await.unwrap();
        let category = ledger.commit(ids[0], 2).await.unwrap();
        assert_eq!((category.reserved_quantity, category.sold_quantity), (1, 2));
        let category = ledger.release(ids[0], 1).await.unwrap();
        assert_eq!((category.reserved_quantity, category.sold_quantity), (0, 2));
        assert_eq!(category.available(), 3);
    }

    #[tokio::test]
    async fn over_commit_is_an_invariant_violation_and_changes_nothing() {
        let (ledger, _, ids) = ledger_with(&[5]).await;
        ledger.reserve(ids[0], 1).await.unwrap();

        let err = ledger.commit(ids[0], 2).await.unwrap_err();
        assert_eq!(
            err,
            OrderError::InvariantViolation {
                category: ids[0],
                reserved: 1,
                requested: 2,
            }
        );
        assert!(matches!(
            ledger.release(ids[0], 2).await,
            Err(OrderError::InvariantViolation { .. })
        ));

        let category = ledger.category(ids[0]).await.unwrap();
        assert_eq!((category.reserved_quantity, category.sold_quantity), (1, 0));
    }

    #[tokio::test]
    async fn unknown_category_and_zero_quantity() {
        let (ledger, _, ids) = ledger_with(&[5]).await;
        let missing = CategoryId::new();
        assert_eq!(
            ledger.reserve(missing, 1).await.unwrap_err(),
            OrderError::CategoryNotFound(missing)
        );
        assert!(matches!(
            ledger.reserve(ids[0], 0).await,
            Err(OrderError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn reserve_all_rolls_back_partial_progress() {
        let (ledger, _, ids) = ledger_with(&[5, 1]).await;

        let err = ledger
            .reserve_all(&[OrderLine::new(ids[0], 2), OrderLine::new(ids[1], 2)])
            .await
            .unwrap_err();
        assert!(matches!(err, OrderError::QuotaExceeded { category, .. } if category == ids[1]));

        for id in &ids {
            assert_eq!(ledger.category(*id).await.unwrap().reserved_quantity, 0);
        }
    }

    #[tokio::test]
    async fn order_settlement_applies_once() {
        let (ledger, store, ids) = ledger_with(&[5, 5]).await;
        let lines = [OrderLine::new(ids[0], 2), OrderLine::new(ids[1], 1)];
        let hold = ledger.reserve_all(&lines).await.unwrap();
        assert_eq!(hold.units(), 3);
        let order_id = OrderId::new();

        assert!(ledger.settle_order(order_id, SettlementKind::Commit, &lines).await.unwrap());
        assert!(!ledger.settle_order(order_id, SettlementKind::Commit, &lines).await.unwrap());
        assert!(store.is_settled(order_id, SettlementKind::Commit));

        let first = ledger.category(ids[0]).await.unwrap();
        assert_eq!((first.reserved_quantity, first.sold_quantity), (0, 2));
        let second = ledger.category(ids[1]).await.unwrap();
        assert_eq!((second.reserved_quantity, second.sold_quantity), (0, 1));
    }

    #[tokio::test]
    async fn short_order_settlement_changes_no_line() {
        let (ledger, store, ids) = ledger_with(&[5, 5]).await;
        ledger.reserve(ids[0], 2).await.unwrap();
        ledger.reserve(ids[1], 1).await.unwrap();
        let order_id = OrderId::new();

        let err = ledger
            .settle_order(
                order_id,
                SettlementKind::Release,
                &[OrderLine::new(ids[0], 2), OrderLine::new(ids[1], 3)],
            )
            .await
            .unwrap_err();
        assert_eq!(
            err,
            OrderError::InvariantViolation {
                category: ids[1],
                reserved: 1,
                requested: 3,
            }
        );
        assert_eq!(ledger.category(ids[0]).await.unwrap().reserved_quantity, 2);
        assert_eq!(ledger.category(ids[1]).await.unwrap().reserved_quantity, 1);
        assert!(!store.is_settled(order_id, SettlementKind::Release));
    }

    #[tokio::test]
    async fn hold_round_trip() {
        let (ledger, _, ids) = ledger_with(&[5, 5]).await;
        let hold = ledger
            .reserve_all(&[
                OrderLine::new(ids[0], 2),
                OrderLine::new(ids[1], 1),
                OrderLine::new(ids[0], 1),
            ])
            .await
            .unwrap();
        assert_eq!(hold.units(), 4);
        assert_eq!(hold.lines().len(), 2);
        assert_eq!(ledger.category(ids[0]).await.unwrap().reserved_quantity, 3);

        ledger.release_hold(hold).await.unwrap();
        assert_eq!(ledger.category(ids[0]).await.unwrap().reserved_quantity, 0);
        assert_eq!(ledger.category(ids[1]).await.unwrap().reserved_quantity, 0);
    }
}
