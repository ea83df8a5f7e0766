//! Audit trail for admission and authentication decisions.
//!
//! Every event is logged under the `audit` target and kept in a bounded in-process sink that
//! tests and operators can snapshot.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use tracing::event;

/// Events retained before the oldest are dropped.
pub const AUDIT_CAPACITY: usize = 4_096;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditEvent {
    pub event_type: String,
    pub client_id: String,
    pub peer: String,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct AuditSink {
    events: Mutex<VecDeque<AuditEvent>>,
    dropped: AtomicU64,
}

impl AuditSink {
    pub fn record(&self, event: AuditEvent) {
        let mut events = self.events.lock();
        if events.len() >= AUDIT_CAPACITY {
            events.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        events.push_back(event);
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

static AUDIT_SINK: OnceLock<AuditSink> = OnceLock::new();

fn sink() -> &'static AuditSink {
    AUDIT_SINK.get_or_init(AuditSink::default)
}

pub fn sink_len() -> usize {
    sink().len()
}

/// Copy of the retained events, oldest first.
pub fn snapshot() -> Vec<AuditEvent> {
    sink().events.lock().iter().cloned().collect()
}

/// Events evicted because the sink was full.
pub fn dropped() -> u64 {
    sink().dropped.load(Ordering::Relaxed)
}

pub fn emit(event_type: &str, client_id: &str, peer: &str, message: &str) {
    event!(
        target: "audit",
        tracing::Level::INFO,
        %event_type,
        %client_id,
        %peer,
        %message
    );
    sink().record(AuditEvent {
        event_type: event_type.to_string(),
        client_id: client_id.to_string(),
        peer: peer.to_string(),
        message: message.to_string(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emitted_events_reach_the_sink() {
        emit("connection_refused", "", "127.0.0.1:9", "unit-test-marker");
        assert!(snapshot()
            .iter()
            .any(|e| e.event_type == "connection_refused" && e.message == "unit-test-marker"));
        assert!(sink_len() >= 1);
    }

    #[test]
    fn full_sink_drops_the_oldest() {
        let sink = AuditSink::default();
        for i in 0..=AUDIT_CAPACITY {
            sink.record(AuditEvent {
                event_type: "e".into(),
                client_id: i.to_string(),
                peer: String::new(),
                message: String::new(),
            });
        }
        assert_eq!(sink.len(), AUDIT_CAPACITY);
        assert_eq!(sink.dropped.load(Ordering::Relaxed), 1);
        assert_eq!(sink.events.lock().front().unwrap().client_id, "1");
    }
}
