// Activation event stream.
//
// The engine publishes a single broadcast stream of lifecycle events.
// Subscribers observe the events of one activation in monotonic sequence
// order; delivery is at-least-once for subscribers that keep up with the
// channel capacity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::module_metadata::{ActivationId, ModuleId, TenantId};

/// Kinds of events emitted during module lifecycle transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    BeforeActivate,
    StepStarted,
    StepCompleted,
    StepFailed,
    TrafficShifted,
    HealthVerdict,
    RollbackStarted,
    RollbackCompleted,
    AfterActivate,
    BeforeDeactivate,
    AfterDeactivate,
    Error,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::BeforeActivate => "before_activate",
            EventKind::StepStarted => "step_started",
            EventKind::StepCompleted => "step_completed",
            EventKind::StepFailed => "step_failed",
            EventKind::TrafficShifted => "traffic_shifted",
            EventKind::HealthVerdict => "health_verdict",
            EventKind::RollbackStarted => "rollback_started",
            EventKind::RollbackCompleted => "rollback_completed",
            EventKind::AfterActivate => "after_activate",
            EventKind::BeforeDeactivate => "before_deactivate",
            EventKind::AfterDeactivate => "after_deactivate",
            EventKind::Error => "error",
        }
    }
}

/// A single lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivationEvent {
    pub ts: DateTime<Utc>,
    pub module: ModuleId,
    pub tenant: TenantId,
    pub activation: ActivationId,
    /// Monotonic per-activation sequence number
    pub seq: u64,
    pub kind: EventKind,
    pub payload: Value,
}

/// Broadcast bus for activation events.
pub struct EventBus {
    tx: broadcast::Sender<ActivationEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ActivationEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Events without subscribers are dropped silently.
    pub fn emit(&self, event: ActivationEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
