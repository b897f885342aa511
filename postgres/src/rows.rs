//! Row types and their conversion into domain types.
//!
//! Counters and prices are stored as signed SQL integers; negative values never
//! pass the table constraints, but decoding still refuses them.

use boxoffice_core::{
    BuyerId, CategoryId, DateTime, EventId, IdempotencyKey, Money, Order, OrderId, OrderItem,
    OrderItemId, OrderStatus, StoreError, TicketCategory, Utc,
};
use uuid::Uuid;

pub(crate) const CATEGORY_COLUMNS: &str = "id, event_id, name, unit_price_cents, total_quantity, \
     reserved_quantity, sold_quantity, created_at, updated_at";

pub(crate) const ORDER_COLUMNS: &str = "id, order_code, buyer_id, status, idempotency_key, \
     total_amount_cents, quota_restored, quota_committed, expires_at, paid_at, created_at, updated_at";

pub(crate) const ITEM_COLUMNS: &str =
    "id, order_id, category_id, quantity, unit_price_cents, qr_code";

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct CategoryRow {
    id: Uuid,
    event_id: Uuid,
    name: String,
    unit_price_cents: i64,
    total_quantity: i32,
    reserved_quantity: i32,
    sold_quantity: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<CategoryRow> for TicketCategory {
    type Error = StoreError;

    fn try_from(row: CategoryRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: CategoryId::from_uuid(row.id),
            event_id: EventId::from_uuid(row.event_id),
            name: row.name,
            unit_price: Money::from_cents(unsigned_cents(row.unit_price_cents, "unit_price_cents")?),
            total_quantity: count(row.total_quantity, "total_quantity")?,
            reserved_quantity: count(row.reserved_quantity, "reserved_quantity")?,
            sold_quantity: count(row.sold_quantity, "sold_quantity")?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct OrderRow {
    pub(crate) id: Uuid,
    order_code: String,
    buyer_id: Uuid,
    status: String,
    idempotency_key: Option<String>,
    total_amount_cents: i64,
    quota_restored: bool,
    quota_committed: bool,
    expires_at: DateTime<Utc>,
    paid_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl OrderRow {
    /// Assemble the order from its row and already-decoded items.
    pub(crate) fn into_order(self, items: Vec<OrderItem>) -> Result<Order, StoreError> {
        let status = OrderStatus::parse(&self.status).ok_or_else(|| {
            StoreError::Serialization(format!("unknown order status '{}'", self.status))
        })?;
        Ok(Order {
            id: OrderId::from_uuid(self.id),
            order_code: self.order_code,
            buyer_id: BuyerId::from_uuid(self.buyer_id),
            status,
            idempotency_key: IdempotencyKey::parse(self.idempotency_key.as_deref()),
            total_amount: Money::from_cents(unsigned_cents(
                self.total_amount_cents,
                "total_amount_cents",
            )?),
            quota_restored: self.quota_restored,
            quota_committed: self.quota_committed,
            expires_at: self.expires_at,
            paid_at: self.paid_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
            items,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ItemRow {
    id: Uuid,
    pub(crate) order_id: Uuid,
    category_id: Uuid,
    quantity: i32,
    unit_price_cents: i64,
    qr_code: String,
}

impl TryFrom<ItemRow> for OrderItem {
    type Error = StoreError;

    fn try_from(row: ItemRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: OrderItemId::from_uuid(row.id),
            order_id: OrderId::from_uuid(row.order_id),
            category_id: CategoryId::from_uuid(row.category_id),
            quantity: count(row.quantity, "quantity")?,
            unit_price: Money::from_cents(unsigned_cents(row.unit_price_cents, "unit_price_cents")?),
            qr_code: row.qr_code,
        })
    }
}

fn count(value: i32, column: &str) -> Result<u32, StoreError> {
    u32::try_from(value)
        .map_err(|_| StoreError::Serialization(format!("negative {column}: {value}")))
}

fn unsigned_cents(value: i64, column: &str) -> Result<u64, StoreError> {
    u64::try_from(value)
        .map_err(|_| StoreError::Serialization(format!("negative {column}: {value}")))
}

/// Encode a counter or quantity for an `INTEGER` column.
pub(crate) fn sql_int(value: u32, column: &str) -> Result<i32, StoreError> {
    i32::try_from(value)
        .map_err(|_| StoreError::Serialization(format!("{column} out of range: {value}")))
}

/// Encode an amount for a `BIGINT` column.
pub(crate) fn sql_cents(value: Money, column: &str) -> Result<i64, StoreError> {
    i64::try_from(value.cents())
        .map_err(|_| StoreError::Serialization(format!("{column} out of range: {value}")))
}

/// Status names for `status = ANY($n)`.
pub(crate) fn status_names(statuses: &[OrderStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}
