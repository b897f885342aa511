//! Expiration reconciler.
//!
//! A periodic sweep with three passes:
//!
//! 1. **expire**: pending orders past their deadline → `Expired`, quota released.
//! 2. **restore**: canceled, failed or expired orders with `quota_restored = false`
//!    → release quota and set the flag (a crash hit between the two writes).
//! 3. **commit**: paid or completed orders with `quota_committed = false` → commit
//!    quota and set the flag.
//!
//! Passes 2 and 3 skip orders written within the settle grace window, leaving
//! them to the request that is still settling them. Every order is handled on
//! its own; one failure is logged and counted, and the sweep moves on.
//!
//! Run a single sweep with [`ExpirationReconciler::run_sweep_once`] or schedule
//! it with [`ExpirationReconciler::spawn`].

use crate::config::ReconcilerConfig;
use crate::lifecycle::OrderLifecycleManager;
use crate::metrics::SweepMetrics;
use boxoffice_core::query::{ExpiredOrderQuery, UnsettledOrderQuery};
use boxoffice_core::{Order, OrderError};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Orders this sweep moved to `Expired`
    pub expired: usize,
    /// Orders another flow handled first (paid, canceled, already expired)
    pub skipped: usize,
    /// Orders whose quota this sweep released and flagged
    pub restored: usize,
    /// Paid orders whose quota this sweep committed and flagged
    pub committed: usize,
    /// Orders (or listings) that failed and will be retried next sweep
    pub failed: usize,
}

impl SweepReport {
    /// Whether the sweep changed anything.
    #[must_use]
    pub const fn is_idle(&self) -> bool {
        self.expired == 0 && self.restored == 0 && self.committed == 0
    }
}

/// Periodic expiration and quota-recovery sweep.
pub struct ExpirationReconciler {
    manager: Arc<OrderLifecycleManager>,
    config: ReconcilerConfig,
    sweep_lock: Mutex<()>,
}

impl ExpirationReconciler {
    /// Create a reconciler driving `manager`.
    #[must_use]
    pub fn new(manager: Arc<OrderLifecycleManager>, config: ReconcilerConfig) -> Self {
        Self {
            manager,
            config,
            sweep_lock: Mutex::new(()),
        }
    }

    /// Configuration in effect.
    #[must_use]
    pub const fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Run all three passes once.
    ///
    /// Sweeps of the same reconciler never overlap; a second caller waits for
    /// the first to finish.
    pub async fn run_sweep_once(&self) -> SweepReport {
        let _sweep = self.sweep_lock.lock().await;
        let started = Instant::now();
        let mut report = SweepReport::default();

        self.expire_pass(&mut report).await;
        self.restore_pass(&mut report).await;
        self.commit_pass(&mut report).await;

        SweepMetrics::record_run(started.elapsed());
        if report.is_idle() && report.failed == 0 {
            debug!(skipped = report.skipped, "Sweep finished with nothing to do");
        } else {
            info!(
                expired = report.expired,
                skipped = report.skipped,
                restored = report.restored,
                committed = report.committed,
                failed = report.failed,
                elapsed_ms = started.elapsed().as_millis(),
                "Sweep finished"
            );
        }
        report
    }

    /// Run sweeps every `config.interval` on a background task.
    ///
    /// The first sweep starts immediately. Shutting the handle down stops
    /// scheduling; a sweep already running finishes first.
    #[must_use]
    pub fn spawn(self) -> ReconcilerHandle {
        let (shutdown_tx, mut shutdown) = watch::channel(false);
        let reconciler = self;

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(reconciler.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                interval_secs = reconciler.config.interval.as_secs(),
                batch_size = reconciler.config.batch_size,
                "Starting expiration reconciler"
            );

            while !*shutdown.borrow() {
                tokio::select! {
                    biased;

                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("Shutdown signal received");
                            break;
                        }
                    }

                    _ = ticker.tick() => {
                        reconciler.run_sweep_once().await;
                    }
                }
            }

            info!("Expiration reconciler stopped");
        });

        ReconcilerHandle { shutdown_tx, join }
    }

    async fn expire_pass(&self, report: &mut SweepReport) {
        let query = ExpiredOrderQuery {
            now: self.manager.now(),
            limit: self.config.batch_size,
        };
        let orders = match self.manager.pending_expired(query).await {
            Ok(orders) => orders,
            Err(e) => return listing_failed(report, "expire", &e),
        };

        for order in orders {
            match self.manager.expire(order.id).await {
                Ok(true) => report.expired += 1,
                Ok(false) => report.skipped += 1,
                Err(e) if e.is_already_handled() => {
                    debug!(order_id = %order.id, error = %e, "Order left pending before it could expire");
                    report.skipped += 1;
                }
                Err(e) => order_failed(report, "expire", &order, &e),
            }
        }
    }

    async fn restore_pass(&self, report: &mut SweepReport) {
        let query = self.unsettled_query(self.config.unrestored_lookback);
        let orders = match self.manager.unrestored_terminal(query).await {
            Ok(orders) => orders,
            Err(e) => return listing_failed(report, "restore", &e),
        };

        for order in orders {
            let order_id = order.id;
            match self.manager.restore_quota(order).await {
                Ok(order) if order.quota_restored => {
                    info!(order_id = %order_id, status = %order.status, "Recovered unrestored quota");
                    report.restored += 1;
                }
                Ok(_) => report.skipped += 1,
                Err(e) => {
                    SweepMetrics::record_failure("restore");
                    warn!(order_id = %order_id, error = %e, "Failed to restore quota");
                    report.failed += 1;
                }
            }
        }
    }

    async fn commit_pass(&self, report: &mut SweepReport) {
        let query = self.unsettled_query(None);
        let orders = match self.manager.uncommitted_paid(query).await {
            Ok(orders) => orders,
            Err(e) => return listing_failed(report, "commit", &e),
        };

        for order in orders {
            let order_id = order.id;
            match self.manager.settle_payment(order).await {
                Ok(order) if order.quota_committed => {
                    info!(order_id = %order_id, status = %order.status, "Recovered uncommitted quota");
                    report.committed += 1;
                }
                Ok(_) => report.skipped += 1,
                Err(e) => {
                    SweepMetrics::record_failure("commit");
                    warn!(order_id = %order_id, error = %e, "Failed to commit quota");
                    report.failed += 1;
                }
            }
        }
    }

    fn unsettled_query(&self, lookback: Option<chrono::Duration>) -> UnsettledOrderQuery {
        let now = self.manager.now();
        UnsettledOrderQuery {
            updated_before: now - self.config.settle_grace,
            updated_since: lookback.map(|window| now - window),
            limit: self.config.batch_size,
        }
    }
}

fn listing_failed(report: &mut SweepReport, pass: &'static str, e: &OrderError) {
    SweepMetrics::record_failure(pass);
    warn!(pass, error = %e, "Sweep listing failed; pass skipped");
    report.failed += 1;
}

fn order_failed(report: &mut SweepReport, pass: &'static str, order: &Order, e: &OrderError) {
    SweepMetrics::record_failure(pass);
    warn!(pass, order_id = %order.id, error = %e, "Sweep failed for order");
    report.failed += 1;
}

/// Handle to a spawned reconciler task.
pub struct ReconcilerHandle {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl ReconcilerHandle {
    /// Stop scheduling sweeps, wait for a running sweep, and join the task.
    pub async fn shutdown(self) {
        self.shutdown_tx.send(true).ok();
        if let Err(e) = self.join.await {
            error!(error = %e, "Reconciler task ended abnormally");
        }
    }

    /// Whether the background task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}
