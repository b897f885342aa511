//! Ticket-category counters in `PostgreSQL`.

use crate::db_error;
use crate::rows::{CATEGORY_COLUMNS, CategoryRow, sql_cents, sql_int};
use boxoffice_core::store::{
    QuotaStore, ReserveOutcome, SettleOutcome, SettlementKind, SettlementOutcome, StoreFuture,
};
use boxoffice_core::{CategoryId, DateTime, OrderId, OrderLine, StoreError, TicketCategory, Utc};
use sqlx::PgPool;

const COMMIT_SQL: &str = "UPDATE ticket_categories
     SET reserved_quantity = reserved_quantity - $2,
         sold_quantity = sold_quantity + $2,
         updated_at = $3
     WHERE id = $1 AND reserved_quantity >= $2";

const RELEASE_SQL: &str = "UPDATE ticket_categories
     SET reserved_quantity = reserved_quantity - $2, updated_at = $3
     WHERE id = $1 AND reserved_quantity >= $2";

const fn settle_sql(kind: SettlementKind) -> &'static str {
    match kind {
        SettlementKind::Release => RELEASE_SQL,
        SettlementKind::Commit => COMMIT_SQL,
    }
}

/// `QuotaStore` backed by the `ticket_categories` table.
///
/// Each per-category mutation is one conditional `UPDATE`; Postgres row locking
/// serializes concurrent writers of the same category and nothing else. Order
/// settlements run their updates and the `quota_settlements` insert in one
/// transaction.
#[derive(Clone)]
pub struct PostgresQuotaStore {
    pool: PgPool,
}

impl PostgresQuotaStore {
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

    async fn fetch(&self, id: CategoryId) -> Result<Option<TicketCategory>, StoreError> {
        let row: Option<CategoryRow> = sqlx::query_as(&format!(
            "SELECT {CATEGORY_COLUMNS} FROM ticket_categories WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("load ticket category", &e))?;

        row.map(TicketCategory::try_from).transpose()
    }

    /// Read the category after a conditional update matched nothing.
    async fn refused(&self, id: CategoryId) -> Result<TicketCategory, StoreError> {
        self.fetch(id).await?.ok_or(StoreError::CategoryNotFound(id))
    }

    /// Run one conditional counter update; `None` means the condition failed.
    async fn conditional_update(
        &self,
        sql: &str,
        id: CategoryId,
        quantity: u32,
        at: DateTime<Utc>,
    ) -> Result<Option<TicketCategory>, StoreError> {
        let row: Option<CategoryRow> = sqlx::query_as(sql)
            .bind(id.as_uuid())
            .bind(sql_int(quantity, "quantity")?)
            .bind(at)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error("update ticket category", &e))?;

        row.map(TicketCategory::try_from).transpose()
    }
}

impl QuotaStore for PostgresQuotaStore {
    fn insert_category(&self, category: TicketCategory) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query(
                "INSERT INTO ticket_categories
                     (id, event_id, name, unit_price_cents, total_quantity,
                      reserved_quantity, sold_quantity, created_at, updated_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            )
            .bind(category.id.as_uuid())
            .bind(category.event_id.as_uuid())
            .bind(&category.name)
            .bind(sql_cents(category.unit_price, "unit_price_cents")?)
            .bind(sql_int(category.total_quantity, "total_quantity")?)
            .bind(sql_int(category.reserved_quantity, "reserved_quantity")?)
            .bind(sql_int(category.sold_quantity, "sold_quantity")?)
            .bind(category.created_at)
            .bind(category.updated_at)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("insert ticket category", &e))?;
            Ok(())
        })
    }

    fn category(&self, id: CategoryId) -> StoreFuture<'_, Option<TicketCategory>> {
        Box::pin(self.fetch(id))
    }

    fn try_reserve(
        &self,
        id: CategoryId,
        quantity: u32,
        at: DateTime<Utc>,
    ) -> StoreFuture<'_, ReserveOutcome> {
        Box::pin(async move {
            let sql = format!(
                "UPDATE ticket_categories
                 SET reserved_quantity = reserved_quantity + $2, updated_at = $3
                 WHERE id = $1 AND reserved_quantity + sold_quantity + $2 <= total_quantity
                 RETURNING {CATEGORY_COLUMNS}"
            );
            match self.conditional_update(&sql, id, quantity, at).await? {
                Some(category) => Ok(ReserveOutcome::Reserved(category)),
                None => Ok(ReserveOutcome::Insufficient {
                    available: self.refused(id).await?.available(),
                }),
            }
        })
    }

    fn try_commit(
        &self,
        id: CategoryId,
        quantity: u32,
        at: DateTime<Utc>,
    ) -> StoreFuture<'_, SettleOutcome> {
        Box::pin(async move {
            let sql = format!("{COMMIT_SQL} RETURNING {CATEGORY_COLUMNS}");
            match self.conditional_update(&sql, id, quantity, at).await? {
                Some(category) => Ok(SettleOutcome::Applied(category)),
                None => Ok(SettleOutcome::Short {
                    reserved: self.refused(id).await?.reserved_quantity,
                }),
            }
        })
    }

    fn try_release(
        &self,
        id: CategoryId,
        quantity: u32,
        at: DateTime<Utc>,
    ) -> StoreFuture<'_, SettleOutcome> {
        Box::pin(async move {
            let sql = format!("{RELEASE_SQL} RETURNING {CATEGORY_COLUMNS}");
            match self.conditional_update(&sql, id, quantity, at).await? {
                Some(category) => Ok(SettleOutcome::Applied(category)),
                None => Ok(SettleOutcome::Short {
                    reserved: self.refused(id).await?.reserved_quantity,
                }),
            }
        })
    }

    fn settle_order(
        &self,
        order_id: OrderId,
        kind: SettlementKind,
        mut lines: Vec<OrderLine>,
        at: DateTime<Utc>,
    ) -> StoreFuture<'_, SettlementOutcome> {
        Box::pin(async move {
            lines.sort_by_key(|line| line.category_id);
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| db_error("begin transaction", &e))?;

            let recorded = sqlx::query(
                "INSERT INTO quota_settlements (order_id, kind, settled_at)
                 VALUES ($1, $2, $3)
                 ON CONFLICT DO NOTHING",
            )
            .bind(order_id.as_uuid())
            .bind(kind.as_str())
            .bind(at)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("record quota settlement", &e))?
            .rows_affected();
            if recorded == 0 {
                return Ok(SettlementOutcome::AlreadySettled);
            }

            for line in &lines {
                let updated = sqlx::query(settle_sql(kind))
                    .bind(line.category_id.as_uuid())
                    .bind(sql_int(line.quantity, "quantity")?)
                    .bind(at)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| db_error("settle ticket category", &e))?
                    .rows_affected();
                if updated == 0 {
                    tx.rollback()
                        .await
                        .map_err(|e| db_error("roll back quota settlement", &e))?;
                    return Ok(SettlementOutcome::Short {
                        category: line.category_id,
                        reserved: self.refused(line.category_id).await?.reserved_quantity,
                        requested: line.quantity,
                    });
                }
            }

            tx.commit()
                .await
                .map_err(|e| db_error("commit quota settlement", &e))?;
            tracing::debug!(order_id = %order_id, kind = %kind, lines = lines.len(), "Order quota settled");
            Ok(SettlementOutcome::Applied)
        })
    }
}
