//! Observability: lifecycle events plus engine metrics.

mod events;
mod metrics;

pub use events::{Event, EventPort, NullEventPort};
pub use metrics::{
    LatencyHistogram, LatencySummary, Metrics, MetricsSnapshot, StepMetricsSnapshot,
    WorkflowMetricsSnapshot, WorkflowOutcome,
};
