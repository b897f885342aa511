//! Audit recorder that writes transitions to the tracing pipeline.
//!
//! The audit log store itself (listing, export) lives outside the engine; this
//! sink keeps every transition visible in structured logs when no dedicated
//! store is wired in.

use boxoffice_core::AuditEvent;
use boxoffice_core::environment::{AuditError, AuditRecorder};

/// Emits each [`AuditEvent`] as an `info` event on the `boxoffice::audit` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditRecorder;

impl AuditRecorder for TracingAuditRecorder {
    fn record(&self, event: AuditEvent) -> Result<(), AuditError> {
        tracing::info!(
            target: "boxoffice::audit",
            order_id = %event.order_id,
            from = event.from_status.map_or("none", |status| status.as_str()),
            to = %event.to_status,
            actor = %event.actor,
            at = %event.timestamp,
            "Order transition"
        );
        Ok(())
    }
}
