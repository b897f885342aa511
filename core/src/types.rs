//! Domain types for the order engine.
//!
//! Identifiers, money, ticket categories (quota counters), orders and their items,
//! and the audit record emitted on every order status transition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            #[doc = concat!("Creates a new random `", stringify!($name), "`")]
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            #[doc = concat!("Create a `", stringify!($name), "` from a `Uuid`")]
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Get the inner UUID
            #[must_use]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for an order
    OrderId
);
uuid_id!(
    /// Unique identifier for an order line item
    OrderItemId
);
uuid_id!(
    /// Unique identifier for a ticket category (one quota counter)
    CategoryId
);
uuid_id!(
    /// Unique identifier for the event a category belongs to
    EventId
);
uuid_id!(
    /// Unique identifier for a buyer
    BuyerId
);

/// Client-supplied token that deduplicates order creation.
///
/// Blank keys are never constructed: [`IdempotencyKey::parse`] maps them to `None`,
/// which bypasses deduplication entirely.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Parse an optional raw key, trimming whitespace.
    ///
    /// Returns `None` for absent, empty, or whitespace-only input.
    #[must_use]
    pub fn parse(raw: Option<&str>) -> Option<Self> {
        raw.map(str::trim)
            .filter(|key| !key.is_empty())
            .map(|key| Self(key.to_string()))
    }

    /// The key as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Money
// ============================================================================

/// Amount in minor currency units (cents).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Money(u64);

impl Money {
    /// Zero amount
    pub const ZERO: Self = Self(0);

    /// Creates a `Money` value from cents
    #[must_use]
    pub const fn from_cents(cents: u64) -> Self {
        Self(cents)
    }

    /// Returns the amount in cents
    #[must_use]
    pub const fn cents(&self) -> u64 {
        self.0
    }

    /// Adds two money amounts with overflow checking
    #[must_use]
    pub const fn checked_add(self, other: Self) -> Option<Self> {
        match self.0.checked_add(other.0) {
            Some(result) => Some(Self(result)),
            None => None,
        }
    }

    /// Multiplies by a ticket quantity with overflow checking
    #[must_use]
    pub const fn checked_mul(self, quantity: u32) -> Option<Self> {
        match self.0.checked_mul(quantity as u64) {
            Some(result) => Some(Self(result)),
            None => None,
        }
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.0 / 100, self.0 % 100)
    }
}

// ============================================================================
// Ticket categories
// ============================================================================

/// A ticket category and its quota counters.
///
/// Invariant: `reserved + sold <= total`. Counters change only through the quota
/// ledger; `available` is always derived.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketCategory {
    /// Category identifier
    pub id: CategoryId,
    /// Event this category sells tickets for
    pub event_id: EventId,
    /// Display name ("VIP", "Floor", ...)
    pub name: String,
    /// Price of one ticket
    pub unit_price: Money,
    /// Sellable capacity
    pub total_quantity: u32,
    /// Held by pending orders
    pub reserved_quantity: u32,
    /// Committed by paid orders
    pub sold_quantity: u32,
    /// When the category was created
    pub created_at: DateTime<Utc>,
    /// Last counter mutation
    pub updated_at: DateTime<Utc>,
}

impl TicketCategory {
    /// Create a category with no reservations or sales.
    #[must_use]
    pub fn new(
        event_id: EventId,
        name: impl Into<String>,
        unit_price: Money,
        total_quantity: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: CategoryId::new(),
            event_id,
            name: name.into(),
            unit_price,
            total_quantity,
            reserved_quantity: 0,
            sold_quantity: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Units neither reserved nor sold.
    #[must_use]
    pub const fn available(&self) -> u32 {
        self.total_quantity
            .saturating_sub(self.reserved_quantity)
            .saturating_sub(self.sold_quantity)
    }

    /// Whether `quantity` more units fit under the capacity.
    #[must_use]
    pub const fn can_reserve(&self, quantity: u32) -> bool {
        match self.reserved_quantity.checked_add(self.sold_quantity) {
            Some(held) => match held.checked_add(quantity) {
                Some(after) => after <= self.total_quantity,
                None => false,
            },
            None => false,
        }
    }
}

// ============================================================================
// Orders
// ============================================================================

/// Order status.
///
/// ```text
/// Pending ──pay──▶ Paid ──complete──▶ Completed
///    │
///    ├──cancel──▶ Canceled
///    ├──expire──▶ Expired
///    └──fail────▶ Failed
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    /// Created, quota reserved, awaiting payment
    Pending,
    /// Payment confirmed, quota committed to sold
    Paid,
    /// Fulfilled
    Completed,
    /// Canceled before payment
    Canceled,
    /// Payment window elapsed
    Expired,
    /// Payment reported as failed
    Failed,
}

impl OrderStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [Self; 6] = [
        Self::Pending,
        Self::Paid,
        Self::Completed,
        Self::Canceled,
        Self::Expired,
        Self::Failed,
    ];

    /// Statuses whose reserved quota must be returned to the ledger.
    pub const RESTORING: [Self; 3] = [Self::Canceled, Self::Failed, Self::Expired];

    /// Statuses whose reserved quota is committed as sold.
    pub const SELLING: [Self; 2] = [Self::Paid, Self::Completed];

    /// Convert status to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Paid => "paid",
            Self::Completed => "completed",
            Self::Canceled => "canceled",
            Self::Expired => "expired",
            Self::Failed => "failed",
        }
    }

    /// Parse status from its database string.
    ///
    /// Returns `None` for unknown values.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "paid" => Some(Self::Paid),
            "completed" => Some(Self::Completed),
            "canceled" => Some(Self::Canceled),
            "expired" => Some(Self::Expired),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// No lifecycle transition leaves a terminal status.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Canceled | Self::Expired | Self::Failed
        )
    }

    /// Terminal without payment: reserved quota goes back to the ledger.
    #[must_use]
    pub const fn restores_quota(&self) -> bool {
        matches!(self, Self::Canceled | Self::Expired | Self::Failed)
    }

    /// Whether `self -> to` is an edge of the state machine.
    #[must_use]
    pub const fn can_transition_to(&self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::Paid | Self::Canceled | Self::Expired | Self::Failed)
                | (Self::Paid, Self::Completed)
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Requested line of a new order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    /// Category to buy from
    pub category_id: CategoryId,
    /// Number of tickets
    pub quantity: u32,
}

impl OrderLine {
    /// Create a new order line
    #[must_use]
    pub const fn new(category_id: CategoryId, quantity: u32) -> Self {
        Self {
            category_id,
            quantity,
        }
    }
}

/// Persisted line item, owned by exactly one order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    /// Item identifier
    pub id: OrderItemId,
    /// Owning order
    pub order_id: OrderId,
    /// Category the tickets come from
    pub category_id: CategoryId,
    /// Number of tickets
    pub quantity: u32,
    /// Price per ticket at creation time
    pub unit_price: Money,
    /// Code printed on the ticket
    pub qr_code: String,
}

impl OrderItem {
    /// Create an item for `order_id` with a fresh QR code.
    #[must_use]
    pub fn new(order_id: OrderId, category_id: CategoryId, quantity: u32, unit_price: Money) -> Self {
        Self {
            id: OrderItemId::new(),
            order_id,
            category_id,
            quantity,
            unit_price,
            qr_code: format!("TKT-{}", Uuid::new_v4().simple()),
        }
    }

    /// `quantity * unit_price`, `None` on overflow.
    #[must_use]
    pub const fn subtotal(&self) -> Option<Money> {
        self.unit_price.checked_mul(self.quantity)
    }
}

/// An order and its items.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    /// Order identifier
    pub id: OrderId,
    /// Human-readable code, e.g. `ORD-20250101-1A2B3C4D`
    pub order_code: String,
    /// Who is buying
    pub buyer_id: BuyerId,
    /// Lifecycle status
    pub status: OrderStatus,
    /// Deduplication key, unique when present
    pub idempotency_key: Option<IdempotencyKey>,
    /// Sum of item subtotals
    pub total_amount: Money,
    /// Reserved quota of a non-paid terminal order has been released
    pub quota_restored: bool,
    /// Reserved quota of a paid order has been committed to sold
    pub quota_committed: bool,
    /// Deadline for payment
    pub expires_at: DateTime<Utc>,
    /// When payment was confirmed
    pub paid_at: Option<DateTime<Utc>>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last write
    pub updated_at: DateTime<Utc>,
    /// Line items
    pub items: Vec<OrderItem>,
}

impl Order {
    /// Human-readable order code derived from the id and creation date.
    #[must_use]
    pub fn code_for(id: OrderId, created_at: DateTime<Utc>) -> String {
        let hex = id.as_uuid().simple().to_string();
        format!(
            "ORD-{}-{}",
            created_at.format("%Y%m%d"),
            hex[..8].to_ascii_uppercase()
        )
    }

    /// Whether the payment window has closed at `now`.
    #[must_use]
    pub fn is_past_due(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }

    /// Quota still held on behalf of this order, per category.
    #[must_use]
    pub fn quota_lines(&self) -> Vec<OrderLine> {
        self.items
            .iter()
            .map(|item| OrderLine::new(item.category_id, item.quantity))
            .collect()
    }
}

// ============================================================================
// Audit
// ============================================================================

/// Who caused a transition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Actor {
    /// The buyer, through the storefront
    Buyer(BuyerId),
    /// Payment callback
    PaymentProvider,
    /// The expiration reconciler
    Reconciler,
    /// Back-office operator
    Operator(String),
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buyer(id) => write!(f, "buyer:{id}"),
            Self::PaymentProvider => f.write_str("payment-provider"),
            Self::Reconciler => f.write_str("reconciler"),
            Self::Operator(name) => write!(f, "operator:{name}"),
        }
    }
}

/// Record of one order status transition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Order that moved
    pub order_id: OrderId,
    /// Previous status, `None` on creation
    pub from_status: Option<OrderStatus>,
    /// New status
    pub to_status: OrderStatus,
    /// When the transition was written
    pub timestamp: DateTime<Utc>,
    /// Who caused it
    pub actor: Actor,
}
