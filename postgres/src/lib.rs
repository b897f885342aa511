//! `PostgreSQL` stores for the boxoffice engine.
//!
//! Implements the `QuotaStore` and `OrderStore` traits from `boxoffice-core`
//! on top of sqlx:
//!
//! - Quota mutations are single conditional `UPDATE … RETURNING` statements, so
//!   the capacity check and the write are one atomic unit per row.
//! - An order's release or commit updates its categories and inserts its
//!   `quota_settlements` row in one transaction, so it lands at most once.
//! - Orders and their items are inserted in one transaction; a partial unique
//!   index on `idempotency_key` arbitrates concurrent creations.
//! - Status and flag changes are `UPDATE … WHERE <expected>`; the affected row
//!   count decides who won.
//!
//! # Example
//!
//! ```ignore
//! use boxoffice_postgres::{PostgresOrderStore, PostgresQuotaStore, connect};
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let pool = connect("postgres://localhost/boxoffice", 10).await?;
//!     let orders = PostgresOrderStore::new(pool.clone());
//!     orders.migrate().await?;
//!     let quotas = PostgresQuotaStore::new(pool);
//!     Ok(())
//! }
//! ```

use boxoffice_core::StoreError;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

mod order_store;
mod quota_store;
mod rows;

pub use order_store::PostgresOrderStore;
pub use quota_store::PostgresQuotaStore;

/// Open a connection pool.
///
/// # Errors
///
/// Returns [`StoreError::Database`] if the database is unreachable.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, StoreError> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
        .map_err(|e| db_error("connect", &e))
}

/// Apply the bundled migrations.
///
/// # Errors
///
/// Returns [`StoreError::Database`] if a migration fails.
pub async fn migrate(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| StoreError::Database(format!("Migration failed: {e}")))?;
    tracing::info!("Database migrations applied");
    Ok(())
}

pub(crate) fn db_error(operation: &str, e: &sqlx::Error) -> StoreError {
    StoreError::Database(format!("Failed to {operation}: {e}"))
}
