//! Orders and order items in `PostgreSQL`.

use crate::db_error;
use crate::rows::{
    ITEM_COLUMNS, ItemRow, ORDER_COLUMNS, OrderRow, sql_cents, sql_int, status_names,
};
use boxoffice_core::query::{ExpiredOrderQuery, OrderFilter, UnsettledOrderQuery};
use boxoffice_core::store::{OrderStore, StoreFuture};
use boxoffice_core::{
    DateTime, IdempotencyKey, Order, OrderId, OrderItem, OrderStatus, StoreError, Utc,
};
use sqlx::PgPool;
use std::collections::HashMap;
use uuid::Uuid;

/// Name of the partial unique index guarding idempotency keys.
const IDEMPOTENCY_INDEX: &str = "orders_idempotency_key_idx";

/// `OrderStore` backed by the `orders` and `order_items` tables.
#[derive(Clone)]
pub struct PostgresOrderStore {
    pool: PgPool,
}

impl PostgresOrderStore {
    /// Create a store over `pool`.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Access the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled migrations to this store's database.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if a migration fails.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        crate::migrate(&self.pool).await
    }

    async fn insert(&self, order: Order) -> Result<Order, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("begin transaction", &e))?;

        sqlx::query(
            "INSERT INTO orders
                 (id, order_code, buyer_id, status, idempotency_key, total_amount_cents,
                  quota_restored, quota_committed, expires_at, paid_at, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        )
        .bind(order.id.as_uuid())
        .bind(&order.order_code)
        .bind(order.buyer_id.as_uuid())
        .bind(order.status.as_str())
        .bind(order.idempotency_key.as_ref().map(IdempotencyKey::as_str))
        .bind(sql_cents(order.total_amount, "total_amount_cents")?)
        .bind(order.quota_restored)
        .bind(order.quota_committed)
        .bind(order.expires_at)
        .bind(order.paid_at)
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| insert_error(&order, &e))?;

        for item in &order.items {
            sqlx::query(
                "INSERT INTO order_items
                     (id, order_id, category_id, quantity, unit_price_cents, qr_code)
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(item.id.as_uuid())
            .bind(item.order_id.as_uuid())
            .bind(item.category_id.as_uuid())
            .bind(sql_int(item.quantity, "quantity")?)
            .bind(sql_cents(item.unit_price, "unit_price_cents")?)
            .bind(&item.qr_code)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("insert order item", &e))?;
        }

        tx.commit()
            .await
            .map_err(|e| db_error("commit order", &e))?;

        tracing::debug!(order_id = %order.id, items = order.items.len(), "Order inserted");
        Ok(order)
    }

    async fn find(&self, id: OrderId) -> Result<Option<Order>, StoreError> {
        let row: Option<OrderRow> = sqlx::query_as(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("load order", &e))?;

        self.single(row).await
    }

    async fn single(&self, row: Option<OrderRow>) -> Result<Option<Order>, StoreError> {
        match row {
            Some(row) => Ok(self.with_items(vec![row]).await?.pop()),
            None => Ok(None),
        }
    }

    /// Load the items of every row in one query and assemble orders, keeping row order.
    async fn with_items(&self, rows: Vec<OrderRow>) -> Result<Vec<Order>, StoreError> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<Uuid> = rows.iter().map(|row| row.id).collect();
        let item_rows: Vec<ItemRow> = sqlx::query_as(&format!(
            "SELECT {ITEM_COLUMNS} FROM order_items
             WHERE order_id = ANY($1)
             ORDER BY category_id, id"
        ))
        .bind(&ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("load order items", &e))?;

        let mut items: HashMap<Uuid, Vec<OrderItem>> = HashMap::with_capacity(rows.len());
        for row in item_rows {
            let order_id = row.order_id;
            items
                .entry(order_id)
                .or_default()
                .push(OrderItem::try_from(row)?);
        }

        rows.into_iter()
            .map(|row| {
                let own = items.remove(&row.id).unwrap_or_default();
                row.into_order(own)
            })
            .collect()
    }

    async fn transition(
        &self,
        id: OrderId,
        from: OrderStatus,
        to: OrderStatus,
        at: DateTime<Utc>,
    ) -> Result<Option<Order>, StoreError> {
        let row: Option<OrderRow> = sqlx::query_as(&format!(
            "UPDATE orders
             SET status = $3,
                 updated_at = $4,
                 paid_at = CASE WHEN $3 = 'paid' THEN $4 ELSE paid_at END
             WHERE id = $1 AND status = $2
             RETURNING {ORDER_COLUMNS}"
        ))
        .bind(id.as_uuid())
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("transition order status", &e))?;

        self.single(row).await
    }

    /// Flip a settlement flag from false to true for an order in one of `statuses`.
    async fn set_flag(
        &self,
        column: &str,
        id: OrderId,
        statuses: &[OrderStatus],
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(&format!(
            "UPDATE orders
             SET {column} = TRUE, updated_at = $2
             WHERE id = $1 AND {column} = FALSE AND status = ANY($3)"
        ))
        .bind(id.as_uuid())
        .bind(at)
        .bind(status_names(statuses))
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("mark order quota", &e))?;

        Ok(result.rows_affected() == 1)
    }

    async fn unsettled(
        &self,
        flag: &str,
        statuses: &[OrderStatus],
        query: UnsettledOrderQuery,
    ) -> Result<Vec<Order>, StoreError> {
        let rows: Vec<OrderRow> = sqlx::query_as(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders
             WHERE {flag} = FALSE
               AND status = ANY($1)
               AND updated_at < $2
               AND ($3::timestamptz IS NULL OR updated_at >= $3)
             ORDER BY updated_at, id
             LIMIT $4"
        ))
        .bind(status_names(statuses))
        .bind(query.updated_before)
        .bind(query.updated_since)
        .bind(i64::from(query.limit))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("list unsettled orders", &e))?;

        self.with_items(rows).await
    }
}

/// Map an order insert failure, recognizing a lost idempotency-key race.
fn insert_error(order: &Order, e: &sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db_err) = e {
        if db_err.is_unique_violation() && db_err.constraint() == Some(IDEMPOTENCY_INDEX) {
            if let Some(key) = &order.idempotency_key {
                return StoreError::DuplicateIdempotencyKey(key.to_string());
            }
        }
    }
    db_error("insert order", e)
}

impl OrderStore for PostgresOrderStore {
    fn insert_order(&self, order: Order) -> StoreFuture<'_, Order> {
        Box::pin(self.insert(order))
    }

    fn find_by_id(&self, id: OrderId) -> StoreFuture<'_, Option<Order>> {
        Box::pin(self.find(id))
    }

    fn find_by_idempotency_key(&self, key: IdempotencyKey) -> StoreFuture<'_, Option<Order>> {
        Box::pin(async move {
            let row: Option<OrderRow> = sqlx::query_as(&format!(
                "SELECT {ORDER_COLUMNS} FROM orders WHERE idempotency_key = $1"
            ))
            .bind(key.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error("load order by idempotency key", &e))?;

            self.single(row).await
        })
    }

    fn transition_status(
        &self,
        id: OrderId,
        from: OrderStatus,
        to: OrderStatus,
        at: DateTime<Utc>,
    ) -> StoreFuture<'_, Option<Order>> {
        Box::pin(self.transition(id, from, to, at))
    }

    fn mark_quota_restored(&self, id: OrderId, at: DateTime<Utc>) -> StoreFuture<'_, bool> {
        Box::pin(self.set_flag("quota_restored", id, &OrderStatus::RESTORING, at))
    }

    fn mark_quota_committed(&self, id: OrderId, at: DateTime<Utc>) -> StoreFuture<'_, bool> {
        Box::pin(self.set_flag("quota_committed", id, &OrderStatus::SELLING, at))
    }

    fn list_pending_expired(&self, query: ExpiredOrderQuery) -> StoreFuture<'_, Vec<Order>> {
        Box::pin(async move {
            let rows: Vec<OrderRow> = sqlx::query_as(&format!(
                "SELECT {ORDER_COLUMNS} FROM orders
                 WHERE status = 'pending' AND expires_at < $1
                 ORDER BY expires_at, id
                 LIMIT $2"
            ))
            .bind(query.now)
            .bind(i64::from(query.limit))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_error("list expired orders", &e))?;

            self.with_items(rows).await
        })
    }

    fn list_unrestored_terminal(&self, query: UnsettledOrderQuery) -> StoreFuture<'_, Vec<Order>> {
        Box::pin(self.unsettled("quota_restored", &OrderStatus::RESTORING, query))
    }

    fn list_uncommitted_paid(&self, query: UnsettledOrderQuery) -> StoreFuture<'_, Vec<Order>> {
        Box::pin(self.unsettled("quota_committed", &OrderStatus::SELLING, query))
    }

    fn list_orders(&self, filter: OrderFilter) -> StoreFuture<'_, Vec<Order>> {
        Box::pin(async move {
            let rows: Vec<OrderRow> = sqlx::query_as(&format!(
                "SELECT {ORDER_COLUMNS} FROM orders
                 WHERE (cardinality($1::text[]) = 0 OR status = ANY($1))
                   AND ($2::uuid IS NULL OR buyer_id = $2)
                   AND ($3::timestamptz IS NULL OR created_at >= $3)
                   AND ($4::timestamptz IS NULL OR created_at < $4)
                 ORDER BY created_at DESC, id DESC
                 LIMIT $5 OFFSET $6"
            ))
            .bind(status_names(&filter.statuses))
            .bind(filter.buyer_id.map(|buyer| *buyer.as_uuid()))
            .bind(filter.created_from)
            .bind(filter.created_to)
            .bind(i64::from(filter.limit))
            .bind(i64::from(filter.offset))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_error("list orders", &e))?;

            self.with_items(rows).await
        })
    }
}
