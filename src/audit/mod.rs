//! Audit Module
//!
//! Leadership and membership events are reported to an [`AuditSink`].
//! [`TracingAudit`] turns them into structured log lines, [`StateLog`]
//! persists them to SQLite and [`FanoutAudit`] feeds several sinks.

mod state_log;

pub use state_log::{StateLog, StateLogEntry};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Kind of audited event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuditKind {
    NodeStarted,
    NodeStopped,
    LeadershipAcquired,
    LeadershipLost,
    Registered,
    RegistrationFailed,
    MemberAdded,
    MemberRemoved,
}

impl AuditKind {
    /// Stable name used in logs and the state log table
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditKind::NodeStarted => "NODE_STARTED",
            AuditKind::NodeStopped => "NODE_STOPPED",
            AuditKind::LeadershipAcquired => "MASTER",
            AuditKind::LeadershipLost => "UN_MASTER",
            AuditKind::Registered => "REGISTERED",
            AuditKind::RegistrationFailed => "REGISTRATION_FAILED",
            AuditKind::MemberAdded => "MEMBER_ADDED",
            AuditKind::MemberRemoved => "MEMBER_REMOVED",
        }
    }
}

impl fmt::Display for AuditKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One audited event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Identity of the reporting node
    pub node: String,
    pub kind: AuditKind,
    /// Free-form detail (member identity, failure reason, ...)
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(node: impl Into<String>, kind: AuditKind) -> Self {
        Self {
            node: node.into(),
            kind,
            detail: None,
            at: Utc::now(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Destination for audit events
///
/// Recording never fails from the caller's point of view; sinks log their
/// own errors.
#[async_trait::async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: AuditEvent);
}

/// Audit sink writing structured tracing events
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAudit;

#[async_trait::async_trait]
impl AuditSink for TracingAudit {
    async fn record(&self, event: AuditEvent) {
        match event.kind {
            AuditKind::RegistrationFailed => tracing::warn!(
                node = %event.node,
                kind = event.kind.as_str(),
                detail = event.detail.as_deref().unwrap_or(""),
                "audit"
            ),
            _ => tracing::info!(
                node = %event.node,
                kind = event.kind.as_str(),
                detail = event.detail.as_deref().unwrap_or(""),
                "audit"
            ),
        }
    }
}

/// Audit sink forwarding to several sinks at once
#[derive(Default, Clone)]
pub struct FanoutAudit {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl FanoutAudit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

#[async_trait::async_trait]
impl AuditSink for FanoutAudit {
    async fn record(&self, event: AuditEvent) {
        futures::future::join_all(self.sinks.iter().map(|sink| sink.record(event.clone()))).await;
    }
}

/// Audit sink keeping events in memory, for tests and embedders
#[derive(Default)]
pub struct MemoryAudit {
    events: tokio::sync::Mutex<Vec<AuditEvent>>,
}

impl MemoryAudit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events recorded so far
    pub async fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().await.clone()
    }

    /// Kinds recorded so far, in order
    pub async fn kinds(&self) -> Vec<AuditKind> {
        self.events.lock().await.iter().map(|e| e.kind).collect()
    }
}

#[async_trait::async_trait]
impl AuditSink for MemoryAudit {
    async fn record(&self, event: AuditEvent) {
        self.events.lock().await.push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names() {
        assert_eq!(AuditKind::LeadershipAcquired.as_str(), "MASTER");
        assert_eq!(AuditKind::LeadershipLost.to_string(), "UN_MASTER");
    }

    #[tokio::test]
    async fn test_fanout_reaches_every_sink() {
        let a = Arc::new(MemoryAudit::new());
        let b = Arc::new(MemoryAudit::new());
        let fanout = FanoutAudit::new()
            .with(Arc::new(TracingAudit))
            .with(a.clone())
            .with(b.clone());

        fanout
            .record(AuditEvent::new("10.0.0.1:1", AuditKind::MemberAdded).with_detail("10.0.0.2:2"))
            .await;

        assert_eq!(a.kinds().await, vec![AuditKind::MemberAdded]);
        assert_eq!(b.events().await[0].detail.as_deref(), Some("10.0.0.2:2"));
    }
}
