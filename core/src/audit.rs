//! Audit sinks: where RiskEvents go.

use crate::{
    event::{EventLogEntry, RiskEvent},
    store::RiskStore,
};
use chrono::Utc;
use std::sync::{Arc, Mutex};

pub trait AuditSink: Send + Sync {
    /// Deliver one event. Must not fail the caller.
    fn emit(&self, event: RiskEvent);
}

/// Writes every event through the `log` facade.
pub struct LogSink;

impl AuditSink for LogSink {
    fn emit(&self, event: RiskEvent) {
        match &event {
            RiskEvent::DetectorDegraded { transaction_id, detector, reason } => {
                log::warn!("txn={transaction_id} detector {detector} degraded: {reason}");
            }
            RiskEvent::DecisionRendered { transaction_id, decision, risk_score, .. } => {
                log::info!("txn={transaction_id} decision={decision:?} risk={risk_score:.1}");
            }
            other => log::debug!("txn={} {}", other.transaction_id(), other.type_name()),
        }
    }
}

/// Appends events to the `event_log` table.
pub struct StoreSink {
    store: Arc<RiskStore>,
}

impl StoreSink {
    pub fn new(store: Arc<RiskStore>) -> Self {
        Self { store }
    }
}

impl AuditSink for StoreSink {
    fn emit(&self, event: RiskEvent) {
        let payload = match serde_json::to_string(&event) {
            Ok(p) => p,
            Err(e) => {
                log::warn!("Cannot serialize {} event: {e}", event.type_name());
                return;
            }
        };
        let entry = EventLogEntry {
            id:             None,
            transaction_id: event.transaction_id().to_string(),
            event_type:     event.type_name().to_string(),
            payload,
            created_at:     Utc::now(),
        };
        if let Err(e) = self.store.append_event(&entry) {
            log::warn!("Dropped {} event for txn={}: {e}", entry.event_type, entry.transaction_id);
        }
    }
}

/// Keeps events in memory. Used by tests and the runner's summary.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<RiskEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RiskEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl AuditSink for MemorySink {
    fn emit(&self, event: RiskEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

/// Fans one event out to several sinks.
pub struct FanOutSink {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl FanOutSink {
    pub fn new(sinks: Vec<Arc<dyn AuditSink>>) -> Self {
        Self { sinks }
    }
}

impl AuditSink for FanOutSink {
    fn emit(&self, event: RiskEvent) {
        for sink in &self.sinks {
            sink.emit(event.clone());
        }
    }
}
