//! Execution coordinator: drives registered [`crate::definition::WorkflowDefinition`]s
//! against a [`crate::persistence::StateStore`] wave by wave.

mod control;
mod coordinator;

pub use control::InstanceControl;
pub use coordinator::{Engine, HealthStatus, InstanceSnapshot};
