//! State & persistence port: the implementation-neutral contract the
//! engine requires from a host-provided store. Two implementations ship in
//! this crate ([`crate::persistence::InMemoryStore`] and
//! [`crate::persistence::PostgresStore`]); a host may provide its own.

use async_trait::async_trait;
use uuid::Uuid;

use crate::model::{Instance, InstanceStatus, StepExecutionRecord};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("instance not found: {0}")]
    InstanceNotFound(Uuid),

    #[error("step execution not found: {0}")]
    StepExecutionNotFound(Uuid),

    #[error("concurrency conflict on instance {id}: expected version {expected}, found {actual}")]
    ConcurrencyConflict {
        id: Uuid,
        expected: i64,
        actual: i64,
    },

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// The persistence port the engine drives every state transition through.
///
/// Implementations must be thread-safe (`Send + Sync`) and, per the
/// transaction requirement, treat each call as a single atomic operation:
/// a partial failure must leave the store unchanged from the caller's point
/// of view.
#[async_trait]
pub trait StateStore: Send + Sync + 'static {
    /// Atomic insert. Fails if an instance with this id already exists.
    async fn create_instance(&self, instance: Instance) -> Result<(), StoreError>;

    async fn load_instance(&self, id: Uuid) -> Result<Option<Instance>, StoreError>;

    /// Optimistic-concurrency update: succeeds only if the stored version
    /// equals `instance.version - 1`. On conflict the engine retries the
    /// enclosing transition up to `persistence_retry_max` times.
    async fn save_instance(&self, instance: Instance) -> Result<(), StoreError>;

    async fn append_step_execution(&self, record: StepExecutionRecord) -> Result<(), StoreError>;

    async fn update_step_execution(&self, record: StepExecutionRecord) -> Result<(), StoreError>;

    async fn list_step_executions(
        &self,
        instance_id: Uuid,
    ) -> Result<Vec<StepExecutionRecord>, StoreError>;

    /// Enumerate instances in a given status, used to find resumable
    /// workflows after a process restart.
    async fn list_by_status(&self, status: InstanceStatus) -> Result<Vec<Instance>, StoreError>;
}
