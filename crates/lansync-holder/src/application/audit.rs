//! Audit trail for every request the holder serves.
//!
//! The router reports each inbound request, each pairing outcome, and how
//! many records each data response carried.  The production sink writes them
//! through `tracing` under the `lansync::audit` target so operators can route
//! them separately (`RUST_LOG=lansync::audit=info`); tests use
//! [`MemoryAuditSink`] to assert on exactly what happened.

use std::sync::Mutex;

use tracing::info;

/// One auditable occurrence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditEvent {
    /// Recorded before routing, for every request including rejected ones.
    Request { method: String, path: String },
    /// A code was exchanged for a token.
    Paired { device_id: String },
    /// A pairing attempt was refused.
    PairingRejected,
    /// A data endpoint answered successfully.
    DataServed { data_type: String, count: usize },
}

/// Destination for audit events.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Writes audit events to the `lansync::audit` tracing target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        match event {
            AuditEvent::Request { method, path } => {
                info!(target: "lansync::audit", %method, %path, "request");
            }
            AuditEvent::Paired { device_id } => {
                info!(target: "lansync::audit", %device_id, "device paired");
            }
            AuditEvent::PairingRejected => {
                info!(target: "lansync::audit", "pairing rejected");
            }
            AuditEvent::DataServed { data_type, count } => {
                info!(target: "lansync::audit", %data_type, count, "data served");
            }
        }
    }
}

/// Collects audit events in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded so far, oldest first.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Paths of recorded requests, oldest first.
    pub fn request_paths(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                AuditEvent::Request { path, .. } => Some(path),
                _ => None,
            })
            .collect()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: AuditEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink_keeps_order() {
        // Arrange
        let sink = MemoryAuditSink::new();

        // Act
        sink.record(AuditEvent::Request {
            method: "GET".into(),
            path: "/status".into(),
        });
        sink.record(AuditEvent::PairingRejected);

        // Assert
        assert_eq!(sink.events().len(), 2);
        assert_eq!(sink.events()[1], AuditEvent::PairingRejected);
        assert_eq!(sink.request_paths(), vec!["/status".to_string()]);
    }

    #[test]
    fn test_tracing_sink_accepts_every_event() {
        // No subscriber is installed; this only checks the match is total.
        let sink = TracingAuditSink;
        sink.record(AuditEvent::Paired {
            device_id: "d".into(),
        });
        sink.record(AuditEvent::DataServed {
            data_type: "steps".into(),
            count: 3,
        });
    }
}
