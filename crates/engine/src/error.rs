//! Shared error taxonomy
//!
//! Each module owns a narrow, `thiserror`-derived error enum. [`EngineError`]
//! is the aggregate the coordinator returns, wiring the lower-level errors in
//! via `#[from]` the same way the executor in this workspace's durable engine
//! wires `StoreError`/`RegistryError` into `ExecutorError`.

use uuid::Uuid;

use crate::definition::DefinitionError;
use crate::persistence::StoreError;
use crate::resolver::ResolverError;

/// Top-level error returned by [`crate::engine::Engine`] operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Instance not found in the store
    #[error("instance not found: {0}")]
    InstanceNotFound(Uuid),

    /// `start` named a definition that was never registered with the engine
    #[error("unknown workflow definition: {0}")]
    DefinitionNotFound(String),

    /// A step's `step_type` has no registered handler
    #[error("no handler registered for step type '{step_type}' (step '{step_id}')")]
    StepHandlerNotFound { step_id: String, step_type: String },

    /// The persisted instance's `step_ids` no longer matches the registered
    /// definition's steps, so a resume or recovery sweep cannot safely
    /// continue driving it.
    #[error("instance {instance_id} was created from a definition with different steps; cannot resume")]
    DefinitionMismatch { instance_id: Uuid },

    /// Requested transition is not valid from the instance's current status
    #[error("invalid state transition: cannot {action} while instance is {status}")]
    InvalidStateTransition { action: &'static str, status: String },

    /// Definition failed validation
    #[error("definition error: {0}")]
    Definition(#[from] DefinitionError),

    /// Dependency graph could not be resolved
    #[error("resolver error: {0}")]
    Resolver(#[from] ResolverError),

    /// Persistence layer failure
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A step exhausted its retry budget
    #[error("step '{step_id}' failed after {attempts} attempt(s): {message}")]
    StepFailed {
        step_id: String,
        attempts: u32,
        message: String,
    },

    /// The instance-level timeout elapsed before completion
    #[error("instance {0} exceeded its global timeout")]
    GlobalTimeout(Uuid),

    /// Compensation itself failed while unwinding completed steps
    #[error("compensation failed for step '{step_id}': {message}")]
    CompensationFailed { step_id: String, message: String },

    /// Worker pool could not accept more work (should not happen with blocking backpressure)
    #[error("worker pool error: {0}")]
    Worker(String),
}
