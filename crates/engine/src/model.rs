//! Persisted data model: instances, step execution records, and the shared
//! context steps read and write through.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
    Compensating,
    Compensated,
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Compensating => "compensating",
            Self::Compensated => "compensated",
        };
        write!(f, "{s}")
    }
}

impl InstanceStatus {
    /// Terminal statuses will never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Compensated
        )
    }
}

/// Lifecycle status of a single step execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Skipped,
    Compensating,
    Compensated,
}

impl StepStatus {
    /// Statuses that satisfy a downstream step's dependency: a completed
    /// record's output contributes to context, a skipped one doesn't, but
    /// both unblock dependents.
    pub fn satisfies_dependency(self) -> bool {
        matches!(self, Self::Succeeded | Self::Skipped)
    }
}

/// A persisted workflow instance: the definition it was started from, its
/// current status, the shared context, and the optimistic-concurrency
/// version used to guard every update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: Uuid,
    pub definition_name: String,
    /// Step ids the definition had at creation time, for the "reconstruction
    /// sanity" check on resume and for computing `getStatus`'s progress
    /// fraction without needing the `WorkflowDefinition` back in hand.
    pub step_ids: Vec<String>,
    pub status: InstanceStatus,
    pub context: Context,
    /// Monotonic version, incremented on every persisted mutation. A
    /// `save_instance` call must supply the version it read; a mismatch means
    /// someone else wrote first and the caller must reload and retry.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub cancel_requested: bool,
    pub error: Option<String>,
}

impl Instance {
    pub fn new(id: Uuid, definition_name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            definition_name: definition_name.into(),
            step_ids: Vec::new(),
            status: InstanceStatus::Pending,
            context: Context::new(),
            version: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            cancel_requested: false,
            error: None,
        }
    }

    pub fn with_step_ids(mut self, step_ids: Vec<String>) -> Self {
        self.step_ids = step_ids;
        self
    }
}

/// One execution attempt record for a single step of an instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecutionRecord {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub step_id: String,
    pub status: StepStatus,
    pub attempt: u32,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepExecutionRecord {
    pub fn new(
        instance_id: Uuid,
        step_id: impl Into<String>,
        attempt: u32,
        input: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            instance_id,
            step_id: step_id.into(),
            status: StepStatus::Running,
            attempt,
            input,
            output: None,
            error: None,
            started_at: now,
            finished_at: None,
        }
    }
}

/// Shared, JSON-backed read/write surface each step sees and contributes to.
///
/// Steps read upstream outputs and write their own; nothing is removed once
/// written, so downstream steps always see a consistent accumulation of
/// everything that ran before them in the wave order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Context {
    values: BTreeMap<String, serde_json::Value>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.values.get(key)
    }

    pub fn get_required(&self, key: &str) -> Result<&serde_json::Value, ContextError> {
        self.get(key)
            .ok_or_else(|| ContextError::MissingKey(key.to_string()))
    }

    /// Write a step's output into the context under its step id.
    pub fn set(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.values.insert(key.into(), value);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(|s| s.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("missing required context key: {0}")]
    MissingKey(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_round_trips_through_serde() {
        let mut ctx = Context::new();
        ctx.set("fetch", serde_json::json!({"status": 200}));

        let json = serde_json::to_string(&ctx).unwrap();
        let parsed: Context = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.get("fetch"), ctx.get("fetch"));
    }

    #[test]
    fn context_required_key_errors_when_absent() {
        let ctx = Context::new();
        assert!(matches!(
            ctx.get_required("missing"),
            Err(ContextError::MissingKey(_))
        ));
    }

    #[test]
    fn instance_status_terminal_classification() {
        assert!(InstanceStatus::Completed.is_terminal());
        assert!(InstanceStatus::Compensated.is_terminal());
        assert!(!InstanceStatus::Running.is_terminal());
        assert!(!InstanceStatus::Paused.is_terminal());
    }
}
