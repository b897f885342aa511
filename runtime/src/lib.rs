//! # Boxoffice Runtime
//!
//! The order lifecycle and quota-consistency engine.
//!
//! ## Core Components
//!
//! - **[`QuotaLedger`]**: atomic reserve / commit / release per ticket category
//! - **[`IdempotencyGuard`]**: one order per client idempotency key
//! - **[`OrderLifecycleManager`]**: the order state machine (create, pay, cancel,
//!   fail, complete, expire)
//! - **[`ExpirationReconciler`]**: periodic sweep expiring unpaid orders and
//!   repairing quota left unsettled by interrupted transitions
//!
//! ## Concurrency
//!
//! There are no global locks. Quota counters serialize per category inside the
//! store; order status changes are compare-and-swap writes, so a payment and an
//! expiration racing on the same order have exactly one winner. Every store call
//! runs under the configured persistence budget.
//!
//! ## Example
//!
//! ```ignore
//! use boxoffice_runtime::{ExpirationReconciler, LifecycleConfig, OrderLifecycleManager};
//!
//! let manager = Arc::new(OrderLifecycleManager::new(
//!     quota_store,
//!     order_store,
//!     Arc::new(SystemClock),
//!     Arc::new(TracingAuditRecorder),
//!     LifecycleConfig::default(),
//! ));
//!
//! let creation = manager
//!     .create(buyer_id, &[OrderLine::new(category_id, 2)], IdempotencyKey::parse(Some("req-1")))
//!     .await?;
//! manager.mark_paid(creation.order().id).await?;
//!
//! let handle = ExpirationReconciler::new(manager, ReconcilerConfig::default()).spawn();
//! // ...
//! handle.shutdown().await;
//! ```

use boxoffice_core::StoreError;
use std::future::Future;
use std::time::Duration;

/// Audit sinks shipped with the runtime
pub mod audit;

/// Lifecycle and reconciler tunables
pub mod config;

/// Idempotent order creation
pub mod idempotency;

/// Per-category quota counters
pub mod ledger;

/// Order state machine
pub mod lifecycle;

/// Prometheus metrics for observability
pub mod metrics;

/// Expiration and recovery sweeps
pub mod reconciler;

pub use audit::TracingAuditRecorder;
pub use config::{LifecycleConfig, ReconcilerConfig};
pub use idempotency::{Creation, IdempotencyGuard, PreparedOrder};
pub use ledger::{QuotaHold, QuotaLedger};
pub use lifecycle::OrderLifecycleManager;
pub use reconciler::{ExpirationReconciler, ReconcilerHandle, SweepReport};

/// Run one store call under a time budget.
///
/// An elapsed budget becomes [`StoreError::Timeout`]; the outcome of the
/// underlying write is then unknown.
pub(crate) async fn bounded<T, F>(
    budget: Duration,
    operation: &'static str,
    call: F,
) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    tokio::time::timeout(budget, call)
        .await
        .unwrap_or(Err(StoreError::Timeout { operation, budget }))
}
