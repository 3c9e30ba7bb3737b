//! Lifecycle events, serde-tagged the same way as this workspace's
//! `WorkflowEvent`: immutable, fire-and-forget, emitted only after the
//! corresponding persistence call has committed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One of the fourteen lifecycle events the engine emits. Every variant
/// carries the instance id, workflow name, and timestamp; step-scoped
/// variants additionally carry the step id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    WorkflowStarted {
        instance_id: Uuid,
        workflow_name: String,
        timestamp: DateTime<Utc>,
    },
    WorkflowCompleted {
        instance_id: Uuid,
        workflow_name: String,
        timestamp: DateTime<Utc>,
        duration_ms: u64,
    },
    WorkflowFailed {
        instance_id: Uuid,
        workflow_name: String,
        timestamp: DateTime<Utc>,
        error: String,
    },
    WorkflowPaused {
        instance_id: Uuid,
        workflow_name: String,
        timestamp: DateTime<Utc>,
    },
    WorkflowResumed {
        instance_id: Uuid,
        workflow_name: String,
        timestamp: DateTime<Utc>,
    },
    WorkflowCancelled {
        instance_id: Uuid,
        workflow_name: String,
        timestamp: DateTime<Utc>,
    },
    CompensationStarted {
        instance_id: Uuid,
        workflow_name: String,
        timestamp: DateTime<Utc>,
    },
    CompensationCompleted {
        instance_id: Uuid,
        workflow_name: String,
        timestamp: DateTime<Utc>,
    },
    StepStarted {
        instance_id: Uuid,
        workflow_name: String,
        step_id: String,
        timestamp: DateTime<Utc>,
        attempt: u32,
    },
    StepCompleted {
        instance_id: Uuid,
        workflow_name: String,
        step_id: String,
        timestamp: DateTime<Utc>,
        duration_ms: u64,
    },
    StepFailed {
        instance_id: Uuid,
        workflow_name: String,
        step_id: String,
        timestamp: DateTime<Utc>,
        attempt: u32,
        error: String,
    },
    StepRetried {
        instance_id: Uuid,
        workflow_name: String,
        step_id: String,
        timestamp: DateTime<Utc>,
        attempt: u32,
        delay_ms: u64,
    },
    StepSkipped {
        instance_id: Uuid,
        workflow_name: String,
        step_id: String,
        timestamp: DateTime<Utc>,
    },
    StepCompensated {
        instance_id: Uuid,
        workflow_name: String,
        step_id: String,
        timestamp: DateTime<Utc>,
    },
}

impl Event {
    pub fn instance_id(&self) -> Uuid {
        match self {
            Self::WorkflowStarted { instance_id, .. }
            | Self::WorkflowCompleted { instance_id, .. }
            | Self::WorkflowFailed { instance_id, .. }
            | Self::WorkflowPaused { instance_id, .. }
            | Self::WorkflowResumed { instance_id, .. }
            | Self::WorkflowCancelled { instance_id, .. }
            | Self::CompensationStarted { instance_id, .. }
            | Self::CompensationCompleted { instance_id, .. }
            | Self::StepStarted { instance_id, .. }
            | Self::StepCompleted { instance_id, .. }
            | Self::StepFailed { instance_id, .. }
            | Self::StepRetried { instance_id, .. }
            | Self::StepSkipped { instance_id, .. }
            | Self::StepCompensated { instance_id, .. } => *instance_id,
        }
    }
}

/// Event sink the engine publishes lifecycle events to. Best-effort: a
/// publish error is logged and swallowed, never surfaced to the caller of
/// the lifecycle operation that triggered the event.
#[async_trait::async_trait]
pub trait EventPort: Send + Sync + 'static {
    async fn publish(&self, event: Event);
}

/// An [`EventPort`] that records nothing, for callers that don't need
/// observability wired up (tests, the CLI demo's quiet mode).
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEventPort;

#[async_trait::async_trait]
impl EventPort for NullEventPort {
    async fn publish(&self, _event: Event) {}
}
