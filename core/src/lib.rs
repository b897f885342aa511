//! # Boxoffice Core
//!
//! Domain types, error taxonomy and persistence traits for the Boxoffice order
//! lifecycle and quota-consistency engine.
//!
//! This crate performs no I/O. It defines:
//!
//! - **Types**: ticket categories (quota counters), orders, order items, statuses
//! - **Errors**: [`OrderError`] for engine callers, [`StoreError`] for backends
//! - **Environment**: [`Clock`](environment::Clock) and
//!   [`AuditRecorder`](environment::AuditRecorder)
//! - **Stores**: [`QuotaStore`](store::QuotaStore) and [`OrderStore`](store::OrderStore),
//!   whose conditional-write contracts the engine relies on
//! - **Queries**: structured filter objects for order listings
//!
//! The engine itself lives in `boxoffice-runtime`; backends live in
//! `boxoffice-postgres` and `boxoffice-testing`.

pub mod environment;
pub mod error;
pub mod query;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use error::{OrderError, StoreError};
pub use types::{
    Actor, AuditEvent, BuyerId, CategoryId, EventId, IdempotencyKey, Money, Order, OrderId,
    OrderItem, OrderItemId, OrderLine, OrderStatus, TicketCategory,
};
