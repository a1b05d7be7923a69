//! Lifecycle and capability event streams.
//!
//! Both managers publish every state change on a `tokio::sync::broadcast`
//! channel so operators can subscribe without this layer knowing who is
//! listening. A lagging subscriber drops old events; publishing never
//! blocks.

use crate::lifecycle::LifecycleState;
use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};

/// Buffered events per subscriber before the oldest are dropped.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// What happened to a capability record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityEventKind {
    Discovered,
    Enabled,
    Disabled,
    Updated,
    Removed,
}

/// A capability state change on one backend.
#[derive(Debug, Clone, Serialize)]
pub struct CapabilityEvent {
    pub backend_id: String,
    pub capability: String,
    pub kind: CapabilityEventKind,
    pub timestamp_ms: u64,
}

impl CapabilityEvent {
    pub fn new(
        backend_id: impl Into<String>,
        capability: impl Into<String>,
        kind: CapabilityEventKind,
    ) -> Self {
        Self {
            backend_id: backend_id.into(),
            capability: capability.into(),
            kind,
            timestamp_ms: now_ms(),
        }
    }
}

/// A lifecycle transition on one backend.
#[derive(Debug, Clone, Serialize)]
pub struct LifecycleEvent {
    pub backend_id: String,
    /// The operator command that drove the transition
    pub command: String,
    pub from: LifecycleState,
    pub to: LifecycleState,
    /// Present when the transition landed in the error state
    pub error: Option<String>,
    pub timestamp_ms: u64,
}

impl LifecycleEvent {
    pub fn new(
        backend_id: impl Into<String>,
        command: impl Into<String>,
        from: LifecycleState,
        to: LifecycleState,
        error: Option<String>,
    ) -> Self {
        Self {
            backend_id: backend_id.into(),
            command: command.into(),
            from,
            to,
            error,
            timestamp_ms: now_ms(),
        }
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_event_serializes_kind_snake_case() {
        let event = CapabilityEvent::new("svc-a", "tools", CapabilityEventKind::Discovered);
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"kind\":\"discovered\""));
        assert!(json.contains("\"backend_id\":\"svc-a\""));
    }

    #[test]
    fn test_lifecycle_event_carries_error() {
        let event = LifecycleEvent::new(
            "svc-a",
            "start",
            LifecycleState::Starting,
            LifecycleState::Error,
            Some("connect refused".to_string()),
        );
        assert_eq!(event.error.as_deref(), Some("connect refused"));
        assert!(event.timestamp_ms > 0);
    }
}
