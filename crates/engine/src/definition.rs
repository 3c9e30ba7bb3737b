//! Workflow definitions: the declarative DAG-of-steps a [`crate::engine::Engine`]
//! interprets.
//!
//! Unlike this workspace's event-sourced `Workflow` trait (one Rust type per
//! workflow, replayed through callback methods), a [`WorkflowDefinition`] is
//! plain data: a named set of [`StepDescriptor`]s wired together by
//! `depends_on` edges. The same `Engine` interprets every definition; step
//! bodies are resolved at dispatch time by name through a [`StepRegistry`],
//! mirroring the type-erased-by-name lookup this workspace's workflow
//! registry performs, generalized from "one Rust type per workflow" to "one
//! named handler per step type".

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::resilience::{CircuitBreakerConfig, RetryPolicy};

/// Error raised by a running step handler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepError {
    pub message: String,
    pub retryable: bool,
    pub details: Option<serde_json::Value>,
}

impl StepError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
            details: None,
        }
    }

    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl std::fmt::Display for StepError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for StepError {}

impl From<anyhow::Error> for StepError {
    fn from(err: anyhow::Error) -> Self {
        Self::retryable(err.to_string())
    }
}

/// Context passed to a step handler at dispatch time: a read-only snapshot of
/// everything upstream steps have written, plus liveness signals.
pub struct StepContext<'a> {
    pub instance_id: uuid::Uuid,
    pub step_id: &'a str,
    pub attempt: u32,
    context: &'a crate::model::Context,
    cancelled: &'a std::sync::atomic::AtomicBool,
}

impl<'a> StepContext<'a> {
    pub fn new(
        instance_id: uuid::Uuid,
        step_id: &'a str,
        attempt: u32,
        context: &'a crate::model::Context,
        cancelled: &'a std::sync::atomic::AtomicBool,
    ) -> Self {
        Self {
            instance_id,
            step_id,
            attempt,
            context,
            cancelled,
        }
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.context.get(key)
    }

    pub fn get_required(&self, key: &str) -> Result<&serde_json::Value, crate::model::ContextError> {
        self.context.get_required(key)
    }

    /// Cooperative cancellation check: step bodies should poll this at
    /// natural checkpoints (between retries, inside loops) rather than expect
    /// to be forcibly killed.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(std::sync::atomic::Ordering::Relaxed)
    }
}

/// A unit of work a step dispatches to. Registered in a [`StepRegistry`] by
/// the name used in [`StepDescriptor::step_type`].
#[async_trait]
pub trait StepHandler: Send + Sync + 'static {
    async fn execute(
        &self,
        ctx: &StepContext<'_>,
        input: serde_json::Value,
    ) -> Result<serde_json::Value, StepError>;
}

#[async_trait]
impl<F, Fut> StepHandler for F
where
    F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<serde_json::Value, StepError>> + Send + 'static,
{
    async fn execute(
        &self,
        _ctx: &StepContext<'_>,
        input: serde_json::Value,
    ) -> Result<serde_json::Value, StepError> {
        (self)(input).await
    }
}

/// Registry mapping a step type name to the handler that executes it.
#[derive(Default)]
pub struct StepRegistry {
    handlers: HashMap<String, std::sync::Arc<dyn StepHandler>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, step_type: impl Into<String>, handler: impl StepHandler) {
        self.handlers
            .insert(step_type.into(), std::sync::Arc::new(handler));
    }

    pub fn get(&self, step_type: &str) -> Option<std::sync::Arc<dyn StepHandler>> {
        self.handlers.get(step_type).cloned()
    }

    pub fn contains(&self, step_type: &str) -> bool {
        self.handlers.contains_key(step_type)
    }
}

/// Options controlling how a single step is executed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepOptions {
    pub retry_policy: RetryPolicy,
    #[serde(with = "duration_millis")]
    pub timeout: std::time::Duration,
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    /// Consulted only by [`CompensationStrategy::CriticalOnly`] to decide
    /// which succeeded steps get compensated. Any step exhausting its
    /// retries fails the instance regardless of this flag.
    pub critical: bool,
}

impl Default for StepOptions {
    fn default() -> Self {
        Self {
            retry_policy: RetryPolicy::default(),
            timeout: std::time::Duration::from_secs(300),
            circuit_breaker: None,
            critical: true,
        }
    }
}

impl StepOptions {
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(config);
        self
    }

    pub fn non_critical(mut self) -> Self {
        self.critical = false;
        self
    }
}

/// How the engine unwinds completed steps when a step exhausts its retries
/// or the instance is cancelled mid-flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CompensationStrategy {
    /// Run every completed step's compensator, in reverse order of
    /// completion time (ties broken by declaration order).
    All,
    /// Only compensate steps marked critical.
    CriticalOnly,
    /// Attempt every compensator, but don't abort the sweep if one fails.
    BestEffort,
    /// Do not compensate; leave completed side effects in place.
    #[default]
    None,
}

/// A data-driven predicate evaluated against the pre-wave [`crate::model::Context`]
/// snapshot to decide whether a step should be skipped, checked before each wave dispatch.
///
/// Kept as a tagged enum rather than a boxed closure so a [`StepDescriptor`]
/// stays plain data and round-trips through serde like the rest of a
/// [`WorkflowDefinition`] (see DESIGN.md's "Strategy dispatch" note).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipCondition {
    /// Skip unless `key` is present in context.
    ContextKeyAbsent { key: String },
    /// Skip if `key` is present in context.
    ContextKeyPresent { key: String },
    /// Skip if `key` is present and equals `value`.
    ContextValueEquals { key: String, value: serde_json::Value },
}

impl SkipCondition {
    pub fn evaluate(&self, context: &crate::model::Context) -> bool {
        match self {
            Self::ContextKeyAbsent { key } => !context.contains(key),
            Self::ContextKeyPresent { key } => context.contains(key),
            Self::ContextValueEquals { key, value } => context.get(key) == Some(value),
        }
    }
}

/// One node in the workflow DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDescriptor {
    pub id: String,
    pub step_type: String,
    /// Step ids that must complete before this step becomes eligible to run.
    pub depends_on: Vec<String>,
    pub input: serde_json::Value,
    pub options: StepOptions,
    /// Step type name of a compensating handler, invoked with this step's
    /// recorded output if the instance is rolled back.
    pub compensation: Option<String>,
    /// Evaluated against the pre-wave context; `true` skips this step rather
    /// than dispatching it.
    pub skip_if: Option<SkipCondition>,
}

impl StepDescriptor {
    pub fn new(id: impl Into<String>, step_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            step_type: step_type.into(),
            depends_on: Vec::new(),
            input: serde_json::Value::Null,
            options: StepOptions::default(),
            compensation: None,
            skip_if: None,
        }
    }

    pub fn depends_on(mut self, step_id: impl Into<String>) -> Self {
        self.depends_on.push(step_id.into());
        self
    }

    pub fn with_input(mut self, input: serde_json::Value) -> Self {
        self.input = input;
        self
    }

    pub fn with_options(mut self, options: StepOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_compensation(mut self, step_type: impl Into<String>) -> Self {
        self.compensation = Some(step_type.into());
        self
    }

    pub fn with_skip_if(mut self, condition: SkipCondition) -> Self {
        self.skip_if = Some(condition);
        self
    }
}

/// Whether waves run their steps one at a time or fan out concurrently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Sequential,
    #[default]
    Parallel,
}

/// A named, validated DAG of steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    pub version: u32,
    pub steps: Vec<StepDescriptor>,
    pub mode: ExecutionMode,
    pub compensation: CompensationStrategy,
    #[serde(with = "option_duration_millis")]
    pub global_timeout: Option<std::time::Duration>,
}

#[derive(Debug, thiserror::Error)]
pub enum DefinitionError {
    #[error("duplicate step id: {0}")]
    DuplicateStepId(String),

    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("dependency cycle detected involving step '{0}'")]
    CycleDetected(String),

    #[error("step '{step}' has a non-positive timeout")]
    NonPositiveTimeout { step: String },

    #[error("step '{step}' has an invalid max_attempts of {max_attempts}, must be >= 1")]
    InvalidMaxAttempts { step: String, max_attempts: u32 },

    #[error("global_timeout must be positive if set")]
    NonPositiveGlobalTimeout,
}

impl WorkflowDefinition {
    /// Validate a definition's structural invariants: unique ids,
    /// dependencies that resolve, and an acyclic dependency graph. The
    /// builder calls this eagerly on `.build()`.
    ///
    /// A zero-step definition is valid: it has nothing to validate and the
    /// engine treats it as instantly `Completed` (spec boundary behavior).
    pub fn validate(&self) -> Result<(), DefinitionError> {
        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.id.as_str()) {
                return Err(DefinitionError::DuplicateStepId(step.id.clone()));
            }
        }

        for step in &self.steps {
            for dep in &step.depends_on {
                if !seen.contains(dep.as_str()) {
                    return Err(DefinitionError::UnknownDependency {
                        step: step.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        for step in &self.steps {
            if step.options.timeout.is_zero() {
                return Err(DefinitionError::NonPositiveTimeout {
                    step: step.id.clone(),
                });
            }
            if step.options.retry_policy.max_attempts < 1 {
                return Err(DefinitionError::InvalidMaxAttempts {
                    step: step.id.clone(),
                    max_attempts: step.options.retry_policy.max_attempts,
                });
            }
        }

        if let Some(timeout) = self.global_timeout {
            if timeout.is_zero() {
                return Err(DefinitionError::NonPositiveGlobalTimeout);
            }
        }

        crate::resolver::resolve_waves(self).map_err(|_| {
            // resolve_waves already distinguishes cycle vs other errors; here
            // we only need a representative step id for the message.
            let offender = self
                .steps
                .iter()
                .find(|s| !s.depends_on.is_empty())
                .map(|s| s.id.clone())
                .unwrap_or_default();
            DefinitionError::CycleDetected(offender)
        })?;

        Ok(())
    }

    pub fn step(&self, id: &str) -> Option<&StepDescriptor> {
        self.steps.iter().find(|s| s.id == id)
    }
}

/// Builder for [`WorkflowDefinition`], validating eagerly on `.build()`.
pub struct DefinitionBuilder {
    name: String,
    version: u32,
    steps: Vec<StepDescriptor>,
    mode: ExecutionMode,
    compensation: CompensationStrategy,
    global_timeout: Option<std::time::Duration>,
}

impl DefinitionBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: 1,
            steps: Vec::new(),
            mode: ExecutionMode::Parallel,
            compensation: CompensationStrategy::None,
            global_timeout: None,
        }
    }

    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn step(mut self, step: StepDescriptor) -> Self {
        self.steps.push(step);
        self
    }

    pub fn mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn compensation(mut self, strategy: CompensationStrategy) -> Self {
        self.compensation = strategy;
        self
    }

    pub fn global_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.global_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Result<WorkflowDefinition, DefinitionError> {
        let definition = WorkflowDefinition {
            name: self.name,
            version: self.version,
            steps: self.steps,
            mode: self.mode,
            compensation: self.compensation,
            global_timeout: self.global_timeout,
        };
        definition.validate()?;
        Ok(definition)
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => d.as_millis().serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis: Option<u64> = Option::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(id: &str, deps: &[&str]) -> StepDescriptor {
        let mut s = StepDescriptor::new(id, "noop");
        for d in deps {
            s = s.depends_on(*d);
        }
        s
    }

    #[test]
    fn empty_definition_builds_successfully() {
        let def = DefinitionBuilder::new("empty").build().unwrap();
        assert!(def.steps.is_empty());
    }

    #[test]
    fn duplicate_step_ids_are_rejected() {
        let err = DefinitionBuilder::new("dup")
            .step(step("a", &[]))
            .step(step("a", &[]))
            .build()
            .unwrap_err();
        assert!(matches!(err, DefinitionError::DuplicateStepId(id) if id == "a"));
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let err = DefinitionBuilder::new("bad-dep")
            .step(step("a", &["ghost"]))
            .build()
            .unwrap_err();
        assert!(matches!(err, DefinitionError::UnknownDependency { .. }));
    }

    #[test]
    fn cycle_is_rejected() {
        let err = DefinitionBuilder::new("cycle")
            .step(step("a", &["b"]))
            .step(step("b", &["a"]))
            .build()
            .unwrap_err();
        assert!(matches!(err, DefinitionError::CycleDetected(_)));
    }

    #[test]
    fn skip_condition_evaluates_against_context() {
        let mut ctx = crate::model::Context::new();
        ctx.set("feature_enabled", serde_json::json!(true));

        let absent = SkipCondition::ContextKeyAbsent {
            key: "feature_enabled".into(),
        };
        assert!(!absent.evaluate(&ctx));

        let present = SkipCondition::ContextKeyPresent {
            key: "feature_enabled".into(),
        };
        assert!(present.evaluate(&ctx));

        let equals = SkipCondition::ContextValueEquals {
            key: "feature_enabled".into(),
            value: serde_json::json!(false),
        };
        assert!(!equals.evaluate(&ctx));
    }

    #[test]
    fn non_positive_step_timeout_is_rejected() {
        let err = DefinitionBuilder::new("bad-timeout")
            .step(
                StepDescriptor::new("a", "noop")
                    .with_options(StepOptions::default().with_timeout(std::time::Duration::ZERO)),
            )
            .build()
            .unwrap_err();
        assert!(matches!(err, DefinitionError::NonPositiveTimeout { step } if step == "a"));
    }

    #[test]
    fn zero_max_attempts_is_rejected() {
        let err = DefinitionBuilder::new("bad-retry")
            .step(StepDescriptor::new("a", "noop").with_options(
                StepOptions::default().with_retry(RetryPolicy {
                    max_attempts: 0,
                    ..RetryPolicy::default()
                }),
            ))
            .build()
            .unwrap_err();
        assert!(matches!(err, DefinitionError::InvalidMaxAttempts { step, max_attempts } if step == "a" && max_attempts == 0));
    }

    #[test]
    fn non_positive_global_timeout_is_rejected() {
        let err = DefinitionBuilder::new("bad-global-timeout")
            .step(step("a", &[]))
            .global_timeout(std::time::Duration::ZERO)
            .build()
            .unwrap_err();
        assert!(matches!(err, DefinitionError::NonPositiveGlobalTimeout));
    }

    #[test]
    fn linear_chain_builds() {
        let def = DefinitionBuilder::new("linear")
            .step(step("a", &[]))
            .step(step("b", &["a"]))
            .step(step("c", &["b"]))
            .build()
            .unwrap();
        assert_eq!(def.steps.len(), 3);
    }
}
