//! # Workflow Orchestration Engine
//!
//! A persistence-backed DAG workflow engine.
//!
//! ## Features
//!
//! - **Declarative definitions**: a [`WorkflowDefinition`] is a named DAG of
//!   [`StepDescriptor`]s, validated for acyclicity at build time
//! - **Wave scheduling**: [`resolver`] computes topological waves, dispatched
//!   sequentially or in parallel per [`ExecutionMode`]
//! - **Resilience**: per-step [`RetryPolicy`] with exponential backoff and
//!   jitter, deadline enforcement, and an optional [`CircuitBreaker`]
//! - **Compensation**: saga-style rollback of completed steps on failure or
//!   cancellation, per [`CompensationStrategy`]
//! - **Optimistic-concurrency persistence**: a [`StateStore`] port with an
//!   in-memory implementation for tests and a PostgreSQL-backed one for
//!   production
//! - **Observability**: structured [`tracing`] spans, lifecycle [`Event`]s,
//!   and engine [`Metrics`]
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                           Engine                              │
//! │   (drives the wave loop: dispatch, retry, compensate)        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!              ┌───────────────┼───────────────┐
//!              ▼               ▼               ▼
//! ┌────────────────────┐ ┌───────────┐ ┌──────────────────┐
//! │     StateStore      │ │ WorkerPool │ │  StepRegistry     │
//! │ (memory / postgres) │ │ (semaphore)│ │ (step_type lookup)│
//! └────────────────────┘ └───────────┘ └──────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use workflow_engine::prelude::*;
//!
//! let registry = {
//!     let mut r = StepRegistry::new();
//!     r.register("fetch", |input: serde_json::Value| async move { Ok(input) });
//!     r
//! };
//!
//! let definition = DefinitionBuilder::new("demo")
//!     .step(StepDescriptor::new("fetch", "fetch"))
//!     .build()
//!     .unwrap();
//!
//! let store = Arc::new(InMemoryStore::new());
//! let engine = Arc::new(Engine::new(EngineConfig::default(), store, registry));
//! engine.register_definition(definition);
//! let instance_id = engine.start("demo", Context::new()).await.unwrap();
//! ```

pub mod clock;
pub mod config;
pub mod definition;
pub mod engine;
pub mod error;
pub mod model;
pub mod observability;
pub mod persistence;
pub mod resilience;
pub mod resolver;
pub mod worker;

/// Prelude for common imports.
pub mod prelude {
    pub use crate::clock::{Clock, FrozenClock, SystemClock};
    pub use crate::config::{EngineConfig, RecoveryPolicy};
    pub use crate::definition::{
        CompensationStrategy, DefinitionBuilder, DefinitionError, ExecutionMode, SkipCondition,
        StepContext, StepDescriptor, StepError, StepHandler, StepOptions, StepRegistry,
        WorkflowDefinition,
    };
    pub use crate::engine::{Engine, HealthStatus, InstanceSnapshot};
    pub use crate::error::EngineError;
    pub use crate::model::{Context, Instance, InstanceStatus, StepExecutionRecord, StepStatus};
    pub use crate::observability::{Event, EventPort, Metrics, MetricsSnapshot, NullEventPort};
    pub use crate::persistence::{InMemoryStore, PostgresStore, StateStore, StoreError};
    pub use crate::resilience::{CircuitBreaker, CircuitBreakerConfig, RetryPolicy};
    pub use crate::resolver::ResolverError;
}

// Re-export key types at crate root.
pub use definition::{
    CompensationStrategy, DefinitionBuilder, DefinitionError, ExecutionMode, SkipCondition,
    StepContext, StepDescriptor, StepError, StepHandler, StepOptions, StepRegistry,
    WorkflowDefinition,
};
pub use engine::{Engine, HealthStatus, InstanceSnapshot};
pub use error::EngineError;
pub use model::{Context, Instance, InstanceStatus, StepExecutionRecord, StepStatus};
pub use persistence::{InMemoryStore, PostgresStore, StateStore, StoreError};
pub use resilience::{CircuitBreaker, CircuitBreakerConfig, RetryPolicy};
