//! Audit sinks for tests.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity

use boxoffice_core::environment::{AuditError, AuditRecorder};
use boxoffice_core::{AuditEvent, OrderId};
use std::sync::Mutex;

/// Keeps every recorded event in memory.
#[derive(Debug, Default)]
pub struct RecordingAuditRecorder {
    events: Mutex<Vec<AuditEvent>>,
}

impl RecordingAuditRecorder {
    /// Create an empty recorder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all events, in recording order
    #[must_use]
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Events recorded for one order
    #[must_use]
    pub fn events_for(&self, order_id: OrderId) -> Vec<AuditEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|event| event.order_id == order_id)
            .cloned()
            .collect()
    }

    /// Number of recorded events
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    /// Whether nothing was recorded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.lock().unwrap().is_empty()
    }
}

impl AuditRecorder for RecordingAuditRecorder {
    fn record(&self, event: AuditEvent) -> Result<(), AuditError> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

/// Refuses every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailingAuditRecorder;

impl AuditRecorder for FailingAuditRecorder {
    fn record(&self, _event: AuditEvent) -> Result<(), AuditError> {
        Err(AuditError::Unavailable("audit sink offline".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use boxoffice_core::{Actor, OrderStatus, Utc};

    fn event(order_id: OrderId) -> AuditEvent {
        AuditEvent {
            order_id,
            from_status: Some(OrderStatus::Pending),
            to_status: OrderStatus::Paid,
            timestamp: Utc::now(),
            actor: Actor::PaymentProvider,
        }
    }

    #[test]
    fn recording_recorder_keeps_order() {
        let recorder = RecordingAuditRecorder::new();
        let a = OrderId::new();
        let b = OrderId::new();
        recorder.record(event(a)).unwrap();
        recorder.record(event(b)).unwrap();

        assert_eq!(recorder.len(), 2);
        assert_eq!(recorder.events()[0].order_id, a);
        assert_eq!(recorder.events_for(b).len(), 1);
    }

    #[test]
    fn failing_recorder_refuses() {
        assert!(FailingAuditRecorder.record(event(OrderId::new())).is_err());
    }
}
