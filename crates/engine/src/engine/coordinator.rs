//! The execution coordinator: the `Engine` that drives a workflow
//! instance's state machine wave by wave, grounded on this workspace's
//! `WorkflowExecutor` (generic over its store, instrumented public async
//! methods, a companion config/error pair) but replacing event-sourced
//! replay with direct state-snapshot persistence, since a `WorkflowDefinition`
//! is plain data rather than a replayed Rust type.
//!
//! A wave is a barrier: every step in it is dispatched (sequentially or
//! concurrently per [`ExecutionMode`]), then outcomes are merged into the
//! instance's context and persisted in one `save_instance` call before the
//! next wave is computed. This keeps the optimistic-concurrency version on
//! `Instance` single-writer per drive task instead of racing concurrent step
//! completions against each other.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use tracing::{error, instrument, warn};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::config::{EngineConfig, RecoveryPolicy};
use crate::definition::{
    CompensationStrategy, ExecutionMode, StepContext, StepDescriptor, StepError, StepRegistry,
    WorkflowDefinition,
};
use crate::error::EngineError;
use crate::model::{Context, Instance, InstanceStatus, StepExecutionRecord, StepStatus};
use crate::observability::{Event, EventPort, Metrics, MetricsSnapshot, NullEventPort, WorkflowOutcome};
use crate::persistence::{StateStore, StoreError};
use crate::resilience::{self, CircuitBreaker, CircuitBreakerConfig, TimeoutOutcome};
use crate::resolver;
use crate::worker::{WorkerPool, WorkerPoolConfig};

use super::control::InstanceControl;

/// A point-in-time read of an instance plus its step execution history,
/// returned by [`Engine::get_instance`].
#[derive(Debug, Clone)]
pub struct InstanceSnapshot {
    pub instance: Instance,
    pub step_executions: Vec<StepExecutionRecord>,
    /// `(steps accounted for, total steps)`; equal iff the instance reached a
    /// terminal status.
    pub progress: (usize, usize),
}

/// Liveness classification returned by [`Engine::health_check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    /// An in-flight step has run longer than `timeout *
    /// default_staleness_multiplier` without completing.
    Stale,
    Terminal,
}

enum StepOutcome {
    Succeeded {
        step_id: String,
        output: serde_json::Value,
    },
    Failed {
        step_id: String,
        attempts: u32,
        message: String,
    },
    Cancelled {
        step_id: String,
    },
    /// The step was still in flight when the instance's global deadline
    /// elapsed; distinct from a per-step [`StepOutcome::Failed`] timeout so
    /// the wave loop fails the instance immediately instead of consulting
    /// the step's own retry policy.
    GlobalTimedOut {
        step_id: String,
    },
}

/// Drives [`WorkflowDefinition`]s registered with it against a [`StateStore`].
///
/// Lifecycle operations that start a new drive task (`start`, `resume`,
/// `cancel` on a paused instance, `recover` under
/// [`RecoveryPolicy::ResumeOnStartup`]) take `self: Arc<Self>` so the spawned
/// `tokio::spawn` future can hold its own owning handle; every other
/// operation borrows `&self`.
pub struct Engine<S: StateStore> {
    store: Arc<S>,
    registry: Arc<StepRegistry>,
    definitions: RwLock<HashMap<String, Arc<WorkflowDefinition>>>,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventPort>,
    metrics: Arc<Metrics>,
    worker_pool: WorkerPool,
    controls: Mutex<HashMap<Uuid, Arc<InstanceControl>>>,
    circuit_breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl<S: StateStore> Engine<S> {
    pub fn new(config: EngineConfig, store: Arc<S>, registry: StepRegistry) -> Self {
        let worker_pool = WorkerPool::new(WorkerPoolConfig::new(
            config.worker_pool_size,
            config.worker_backlog,
        ));
        Self {
            store,
            registry: Arc::new(registry),
            definitions: RwLock::new(HashMap::new()),
            config,
            clock: Arc::new(SystemClock),
            events: Arc::new(NullEventPort),
            metrics: Arc::new(Metrics::new()),
            worker_pool,
            controls: Mutex::new(HashMap::new()),
            circuit_breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_event_port(mut self, events: Arc<dyn EventPort>) -> Self {
        self.events = events;
        self
    }

    pub fn register_definition(&self, definition: WorkflowDefinition) {
        self.definitions
            .write()
            .insert(definition.name.clone(), Arc::new(definition));
    }

    pub fn definition(&self, name: &str) -> Option<Arc<WorkflowDefinition>> {
        self.definitions.read().get(name).cloned()
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Start a new instance and return immediately; the wave loop runs on a
    /// spawned task. Pair with [`Engine::get_instance`] to poll completion.
    #[instrument(skip(self, input), fields(definition_name))]
    pub async fn start(
        self: Arc<Self>,
        definition_name: &str,
        input: Context,
    ) -> Result<Uuid, EngineError> {
        let instance_id = self.create_and_persist_instance(definition_name, input).await?;
        let engine = Arc::clone(&self);
        tokio::spawn(async move {
            if let Err(err) = engine.drive(instance_id).await {
                error!(instance_id = %instance_id, error = %err, "workflow instance drive failed");
            }
        });
        Ok(instance_id)
    }

    /// Start a new instance and drive it on the calling task until it
    /// reaches a terminal status: a blocking convenience wrapper around
    /// `start` for callers that don't need to poll.
    #[instrument(skip(self, input), fields(definition_name))]
    pub async fn run_to_completion(
        self: Arc<Self>,
        definition_name: &str,
        input: Context,
    ) -> Result<Instance, EngineError> {
        let instance_id = self.create_and_persist_instance(definition_name, input).await?;
        self.drive(instance_id).await?;
        self.load_required(instance_id).await
    }

    pub async fn get_instance(&self, instance_id: Uuid) -> Result<InstanceSnapshot, EngineError> {
        let instance = self.load_required(instance_id).await?;
        let step_executions = self.store.list_step_executions(instance_id).await?;
        let (completed, failed, _) = Self::partition_records(&step_executions);
        let progress = (completed.len() + failed.len(), instance.step_ids.len());
        Ok(InstanceSnapshot {
            instance,
            step_executions,
            progress,
        })
    }

    /// Signal a running instance to pause. The active drive task observes
    /// the flag at its next wave boundary and persists `Paused` itself; this
    /// call does not write to the store directly, to keep the drive task the
    /// instance's single writer.
    #[instrument(skip(self))]
    pub async fn pause(&self, instance_id: Uuid) -> Result<(), EngineError> {
        let instance = self.load_required(instance_id).await?;
        if instance.status != InstanceStatus::Running {
            return Err(EngineError::InvalidStateTransition {
                action: "pause",
                status: instance.status.to_string(),
            });
        }
        self.control_for(instance_id).request_pause();
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn resume(self: Arc<Self>, instance_id: Uuid) -> Result<(), EngineError> {
        let mut instance = self.load_required(instance_id).await?;
        if instance.status != InstanceStatus::Paused {
            return Err(EngineError::InvalidStateTransition {
                action: "resume",
                status: instance.status.to_string(),
            });
        }

        instance.status = InstanceStatus::Running;
        self.persist(&mut instance).await?;
        self.publish(Event::WorkflowResumed {
            instance_id,
            workflow_name: instance.definition_name.clone(),
            timestamp: self.clock.now(),
        })
        .await;

        self.control_for(instance_id).clear_pause();

        let engine = Arc::clone(&self);
        tokio::spawn(async move {
            if let Err(err) = engine.drive(instance_id).await {
                error!(instance_id = %instance_id, error = %err, "workflow instance drive failed after resume");
            }
        });
        Ok(())
    }

    /// Cancel an instance. A `Running` instance's own drive task notices the
    /// flag (and wakes any in-flight step race via [`InstanceControl`]); a
    /// `Paused` instance has no active task, so this spawns one to carry out
    /// the cancellation and any configured compensation.
    #[instrument(skip(self))]
    pub async fn cancel(self: Arc<Self>, instance_id: Uuid) -> Result<(), EngineError> {
        let mut instance = self.load_required(instance_id).await?;
        if instance.status.is_terminal() {
            return Err(EngineError::InvalidStateTransition {
                action: "cancel",
                status: instance.status.to_string(),
            });
        }

        let control = self.control_for(instance_id);
        control.request_cancel();

        if instance.status == InstanceStatus::Paused {
            instance.cancel_requested = true;
            instance.status = InstanceStatus::Running;
            self.persist(&mut instance).await?;

            let engine = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(err) = engine.drive(instance_id).await {
                    error!(instance_id = %instance_id, error = %err, "cancellation drive failed");
                }
            });
        }
        Ok(())
    }

    /// Explicitly run compensation over a terminal `Failed`/`Cancelled`
    /// instance, regardless of its definition's configured
    /// [`CompensationStrategy`] (an explicit call always compensates every
    /// completed step that declares a compensator).
    #[instrument(skip(self))]
    pub async fn compensate(self: Arc<Self>, instance_id: Uuid) -> Result<(), EngineError> {
        let mut instance = self.load_required(instance_id).await?;
        if !matches!(
            instance.status,
            InstanceStatus::Failed | InstanceStatus::Cancelled
        ) {
            return Err(EngineError::InvalidStateTransition {
                action: "compensate",
                status: instance.status.to_string(),
            });
        }

        let definition = self
            .definition(&instance.definition_name)
            .ok_or_else(|| EngineError::DefinitionNotFound(instance.definition_name.clone()))?;
        let control = self.control_for(instance_id);

        self.run_compensation(&mut instance, &definition, &control, CompensationStrategy::All)
            .await?;
        self.controls.lock().remove(&instance_id);
        Ok(())
    }

    pub async fn health_check(&self, instance_id: Uuid) -> Result<HealthStatus, EngineError> {
        let instance = self.load_required(instance_id).await?;
        if instance.status.is_terminal() {
            return Ok(HealthStatus::Terminal);
        }

        let definition = self
            .definition(&instance.definition_name)
            .ok_or_else(|| EngineError::DefinitionNotFound(instance.definition_name.clone()))?;
        let records = self.store.list_step_executions(instance_id).await?;
        let now = self.clock.now();

        for record in records.iter().filter(|r| r.status == StepStatus::Running) {
            let Some(step) = definition.step(&record.step_id) else {
                continue;
            };
            let elapsed = now
                .signed_duration_since(record.started_at)
                .to_std()
                .unwrap_or_default();
            let stale_after = step
                .options
                .timeout
                .mul_f64(self.config.default_staleness_multiplier);
            if elapsed > stale_after {
                return Ok(HealthStatus::Stale);
            }
        }

        Ok(HealthStatus::Healthy)
    }

    /// Reconcile persisted state with [`RecoveryPolicy`] on startup: every
    /// instance found `Running` or `Compensating` is either parked in
    /// `Paused` (the safe default) or re-driven immediately, a startup
    /// reconciliation sweep over persisted workflow state.
    #[instrument(skip(self))]
    pub async fn recover(self: Arc<Self>) -> Result<(), EngineError> {
        for status in [InstanceStatus::Running, InstanceStatus::Compensating] {
            for mut instance in self.store.list_by_status(status).await? {
                self.control_for(instance.id);
                match self.config.recovery_policy {
                    RecoveryPolicy::PauseOnStartup => {
                        instance.status = InstanceStatus::Paused;
                        self.persist(&mut instance).await?;
                        self.publish(Event::WorkflowPaused {
                            instance_id: instance.id,
                            workflow_name: instance.definition_name.clone(),
                            timestamp: self.clock.now(),
                        })
                        .await;
                    }
                    RecoveryPolicy::ResumeOnStartup => {
                        let engine = Arc::clone(&self);
                        let instance_id = instance.id;
                        tokio::spawn(async move {
                            if let Err(err) = engine.drive(instance_id).await {
                                error!(instance_id = %instance_id, error = %err, "recovery drive failed");
                            }
                        });
                    }
                }
            }
        }
        Ok(())
    }

    async fn create_and_persist_instance(
        &self,
        definition_name: &str,
        input: Context,
    ) -> Result<Uuid, EngineError> {
        let definition = self
            .definition(definition_name)
            .ok_or_else(|| EngineError::DefinitionNotFound(definition_name.to_string()))?;

        let instance_id = Uuid::now_v7();
        let now = self.clock.now();
        let step_ids = definition.steps.iter().map(|s| s.id.clone()).collect();
        let mut instance = Instance::new(instance_id, definition_name, now).with_step_ids(step_ids);
        instance.context = input;

        self.store.create_instance(instance).await?;
        self.controls
            .lock()
            .insert(instance_id, Arc::new(InstanceControl::new()));
        Ok(instance_id)
    }

    /// The wave loop: load, transition `Pending` -> `Running`, then
    /// repeatedly compute the next ready wave, dispatch it, merge outcomes,
    /// and persist, until the instance reaches a terminal status or is
    /// parked `Paused`.
    #[instrument(skip(self))]
    async fn drive(&self, instance_id: Uuid) -> Result<(), EngineError> {
        let mut instance = self.load_required(instance_id).await?;
        let definition = self
            .definition(&instance.definition_name)
            .ok_or_else(|| EngineError::DefinitionNotFound(instance.definition_name.clone()))?;

        let current_step_ids: Vec<String> = definition.steps.iter().map(|s| s.id.clone()).collect();
        if instance.step_ids != current_step_ids {
            return Err(EngineError::DefinitionMismatch { instance_id });
        }

        if instance.status == InstanceStatus::Pending {
            instance.status = InstanceStatus::Running;
            instance.started_at = Some(self.clock.now());
            self.persist(&mut instance).await?;
            self.metrics
                .record_workflow(&definition.name, WorkflowOutcome::Started);
            self.publish(Event::WorkflowStarted {
                instance_id,
                workflow_name: definition.name.clone(),
                timestamp: self.clock.now(),
            })
            .await;
        }

        if instance.status != InstanceStatus::Running {
            return Ok(());
        }

        let control = self.control_for(instance_id);

        loop {
            if control.is_cancel_requested() {
                instance.cancel_requested = true;
                return self
                    .cancel_and_compensate(&mut instance, &definition, &control)
                    .await;
            }

            if control.is_pause_requested() {
                instance.status = InstanceStatus::Paused;
                self.persist(&mut instance).await?;
                self.publish(Event::WorkflowPaused {
                    instance_id,
                    workflow_name: definition.name.clone(),
                    timestamp: self.clock.now(),
                })
                .await;
                return Ok(());
            }

            let records = self.store.list_step_executions(instance_id).await?;
            let (completed, failed, in_flight) = Self::partition_records(&records);

            if completed.len() + failed.len() == definition.steps.len() {
                instance.status = InstanceStatus::Completed;
                instance.finished_at = Some(self.clock.now());
                self.persist(&mut instance).await?;
                self.metrics
                    .record_workflow(&definition.name, WorkflowOutcome::Completed);
                let duration_ms = self.record_instance_duration(&instance, &definition.name);
                self.publish(Event::WorkflowCompleted {
                    instance_id,
                    workflow_name: definition.name.clone(),
                    timestamp: self.clock.now(),
                    duration_ms,
                })
                .await;
                self.controls.lock().remove(&instance_id);
                return Ok(());
            }

            let global_deadline = match (definition.global_timeout, instance.started_at) {
                (Some(timeout), Some(started)) => Some(started + chrono::Duration::from_std(timeout).unwrap_or_default()),
                _ => None,
            };
            if let Some(deadline) = global_deadline {
                if self.clock.now() >= deadline {
                    let message = EngineError::GlobalTimeout(instance_id).to_string();
                    return self
                        .fail_and_compensate(&mut instance, &definition, &control, message)
                        .await;
                }
            }

            let wave = resolver::next_wave(&definition, &completed, &in_flight)?;
            if wave.is_empty() {
                tokio::time::sleep(self.config.poll_interval).await;
                continue;
            }

            let mut to_dispatch: Vec<&StepDescriptor> = Vec::with_capacity(wave.len());
            for step_id in &wave {
                let step = definition
                    .step(step_id)
                    .expect("wave step id must exist in its own definition");
                let should_skip = step
                    .skip_if
                    .as_ref()
                    .map(|condition| condition.evaluate(&instance.context))
                    .unwrap_or(false);
                if should_skip {
                    self.record_skip(&instance, step).await?;
                } else {
                    to_dispatch.push(step);
                }
            }

            if to_dispatch.is_empty() {
                continue;
            }

            let wave_context = instance.context.clone();
            let outcomes = match definition.mode {
                ExecutionMode::Sequential => {
                    let mut out = Vec::with_capacity(to_dispatch.len());
                    for step in &to_dispatch {
                        out.push(
                            self.worker_pool
                                .run(self.run_step(
                                    instance_id,
                                    &definition,
                                    step,
                                    &wave_context,
                                    &control,
                                    global_deadline,
                                ))
                                .await,
                        );
                    }
                    out
                }
                ExecutionMode::Parallel => {
                    let futures = to_dispatch.iter().map(|step| {
                        self.worker_pool.run(self.run_step(
                            instance_id,
                            &definition,
                            step,
                            &wave_context,
                            &control,
                            global_deadline,
                        ))
                    });
                    join_all(futures).await
                }
            };

            let mut step_failure: Option<String> = None;
            let mut cancelled_seen = false;
            let mut global_timed_out = false;

            for outcome in outcomes {
                match outcome {
                    StepOutcome::Succeeded { step_id, output } => {
                        instance.context.set(step_id, output);
                        self.metrics.steps_executed.fetch_add(1, Ordering::Relaxed);
                    }
                    StepOutcome::Failed {
                        step_id,
                        attempts,
                        message,
                    } => {
                        self.metrics.steps_failed.fetch_add(1, Ordering::Relaxed);
                        if step_failure.is_none() {
                            step_failure = Some(
                                EngineError::StepFailed {
                                    step_id: step_id.clone(),
                                    attempts,
                                    message,
                                }
                                .to_string(),
                            );
                        }
                    }
                    StepOutcome::Cancelled { .. } => {
                        cancelled_seen = true;
                    }
                    StepOutcome::GlobalTimedOut { .. } => {
                        self.metrics.steps_failed.fetch_add(1, Ordering::Relaxed);
                        global_timed_out = true;
                    }
                }
            }

            self.persist(&mut instance).await?;

            if global_timed_out {
                let message = EngineError::GlobalTimeout(instance_id).to_string();
                return self
                    .fail_and_compensate(&mut instance, &definition, &control, message)
                    .await;
            }

            if cancelled_seen {
                instance.cancel_requested = true;
                return self
                    .cancel_and_compensate(&mut instance, &definition, &control)
                    .await;
            }

            if let Some(message) = step_failure {
                return self
                    .fail_and_compensate(&mut instance, &definition, &control, message)
                    .await;
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_step(
        &self,
        instance_id: Uuid,
        definition: &WorkflowDefinition,
        step: &StepDescriptor,
        context: &Context,
        control: &InstanceControl,
        global_deadline: Option<chrono::DateTime<chrono::Utc>>,
    ) -> StepOutcome {
        let handler = match self.registry.get(&step.step_type) {
            Some(handler) => handler,
            None => {
                return StepOutcome::Failed {
                    step_id: step.id.clone(),
                    attempts: 0,
                    message: format!("no handler registered for step type '{}'", step.step_type),
                };
            }
        };

        let breaker = step
            .options
            .circuit_breaker
            .clone()
            .map(|cfg| self.circuit_breaker_for(&step.step_type, cfg));

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;

            if control.is_cancel_requested() {
                return StepOutcome::Cancelled {
                    step_id: step.id.clone(),
                };
            }

            let remaining_to_deadline = global_deadline.map(|deadline| {
                deadline
                    .signed_duration_since(self.clock.now())
                    .to_std()
                    .unwrap_or(Duration::ZERO)
            });
            if remaining_to_deadline.map(Duration::is_zero).unwrap_or(false) {
                return StepOutcome::GlobalTimedOut {
                    step_id: step.id.clone(),
                };
            }
            let effective_timeout = match remaining_to_deadline {
                Some(remaining) => remaining.min(step.options.timeout),
                None => step.options.timeout,
            };
            let bounded_by_global_deadline = remaining_to_deadline
                .map(|remaining| remaining < step.options.timeout)
                .unwrap_or(false);

            let permit = match &breaker {
                Some(breaker) => match breaker.allow(self.clock.as_ref()) {
                    Ok(permit) => Some(permit),
                    Err(_) => {
                        return StepOutcome::Failed {
                            step_id: step.id.clone(),
                            attempts: attempt,
                            message: "circuit breaker is open".to_string(),
                        };
                    }
                },
                None => None,
            };

            let started = self.clock.now();
            let mut record = StepExecutionRecord::new(
                instance_id,
                step.id.clone(),
                attempt,
                step.input.clone(),
                started,
            );
            if let Err(err) = self.store.append_step_execution(record.clone()).await {
                return StepOutcome::Failed {
                    step_id: step.id.clone(),
                    attempts: attempt,
                    message: err.to_string(),
                };
            }

            self.publish(Event::StepStarted {
                instance_id,
                workflow_name: definition.name.clone(),
                step_id: step.id.clone(),
                timestamp: started,
                attempt,
            })
            .await;

            let cancelled_flag = AtomicBool::new(false);
            let step_ctx = StepContext::new(instance_id, &step.id, attempt, context, &cancelled_flag);
            let input = step.input.clone();
            let handler = Arc::clone(&handler);
            let body = async move { handler.execute(&step_ctx, input).await };

            let raced = resilience::run_cancellable(
                effective_timeout,
                &cancelled_flag,
                control.cancel_notify(),
                body,
            )
            .await;

            let finished = self.clock.now();
            record.finished_at = Some(finished);

            if matches!(raced, TimeoutOutcome::TimedOut) && bounded_by_global_deadline {
                if let Some(permit) = permit {
                    permit.failure();
                }
                record.status = StepStatus::TimedOut;
                record.error = Some("instance exceeded its global timeout".to_string());
                let _ = self.store.update_step_execution(record).await;
                self.metrics.record_step(
                    &definition.name,
                    &step.id,
                    "global_timeout",
                    (finished - started).to_std().unwrap_or_default(),
                );
                return StepOutcome::GlobalTimedOut {
                    step_id: step.id.clone(),
                };
            }

            let (step_error, success_output, is_timeout) = match raced {
                TimeoutOutcome::Completed(Ok(value)) => {
                    if let Some(permit) = permit {
                        permit.success();
                    }
                    (None, Some(value), false)
                }
                TimeoutOutcome::Completed(Err(err)) => {
                    if let Some(permit) = permit {
                        permit.failure();
                    }
                    (Some(err), None, false)
                }
                TimeoutOutcome::TimedOut => {
                    if let Some(permit) = permit {
                        permit.failure();
                    }
                    (Some(StepError::retryable("step exceeded its timeout")), None, true)
                }
                TimeoutOutcome::Cancelled => {
                    record.status = StepStatus::Failed;
                    record.error = Some("instance cancelled".to_string());
                    let _ = self.store.update_step_execution(record).await;
                    return StepOutcome::Cancelled {
                        step_id: step.id.clone(),
                    };
                }
            };

            if let Some(output) = success_output {
                record.status = StepStatus::Succeeded;
                record.output = Some(output.clone());
                if let Err(err) = self.store.update_step_execution(record).await {
                    return StepOutcome::Failed {
                        step_id: step.id.clone(),
                        attempts: attempt,
                        message: err.to_string(),
                    };
                }
                self.metrics.record_step(
                    &definition.name,
                    &step.id,
                    "succeeded",
                    (finished - started).to_std().unwrap_or_default(),
                );
                self.publish(Event::StepCompleted {
                    instance_id,
                    workflow_name: definition.name.clone(),
                    step_id: step.id.clone(),
                    timestamp: finished,
                    duration_ms: (finished - started).num_milliseconds().max(0) as u64,
                })
                .await;
                return StepOutcome::Succeeded {
                    step_id: step.id.clone(),
                    output,
                };
            }

            let step_error = step_error.expect("a non-success outcome always carries a StepError");
            let will_retry = step.options.retry_policy.should_retry(&step_error, attempt);

            record.status = if is_timeout {
                StepStatus::TimedOut
            } else {
                StepStatus::Failed
            };
            record.error = Some(step_error.message.clone());
            if let Err(err) = self.store.update_step_execution(record).await {
                return StepOutcome::Failed {
                    step_id: step.id.clone(),
                    attempts: attempt,
                    message: err.to_string(),
                };
            }

            if will_retry {
                self.metrics.steps_retried.fetch_add(1, Ordering::Relaxed);
                let delay = step.options.retry_policy.delay_for_attempt(attempt + 1);
                self.publish(Event::StepRetried {
                    instance_id,
                    workflow_name: definition.name.clone(),
                    step_id: step.id.clone(),
                    timestamp: self.clock.now(),
                    attempt,
                    delay_ms: delay.as_millis() as u64,
                })
                .await;
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                continue;
            }

            self.metrics.record_step(
                &definition.name,
                &step.id,
                if is_timeout { "timed_out" } else { "failed" },
                (finished - started).to_std().unwrap_or_default(),
            );
            self.publish(Event::StepFailed {
                instance_id,
                workflow_name: definition.name.clone(),
                step_id: step.id.clone(),
                timestamp: self.clock.now(),
                attempt,
                error: step_error.message.clone(),
            })
            .await;

            return StepOutcome::Failed {
                step_id: step.id.clone(),
                attempts: attempt,
                message: step_error.message,
            };
        }
    }

    async fn record_skip(&self, instance: &Instance, step: &StepDescriptor) -> Result<(), EngineError> {
        let now = self.clock.now();
        let mut record =
            StepExecutionRecord::new(instance.id, step.id.clone(), 1, step.input.clone(), now);
        record.status = StepStatus::Skipped;
        record.finished_at = Some(now);
        self.store.append_step_execution(record).await?;
        self.publish(Event::StepSkipped {
            instance_id: instance.id,
            workflow_name: instance.definition_name.clone(),
            step_id: step.id.clone(),
            timestamp: now,
        })
        .await;
        Ok(())
    }

    async fn fail_and_compensate(
        &self,
        instance: &mut Instance,
        definition: &WorkflowDefinition,
        control: &InstanceControl,
        error_message: String,
    ) -> Result<(), EngineError> {
        instance.status = InstanceStatus::Failed;
        instance.error = Some(error_message.clone());
        instance.finished_at = Some(self.clock.now());
        self.persist(instance).await?;
        self.metrics
            .record_workflow(&definition.name, WorkflowOutcome::Failed);
        self.record_instance_duration(instance, &definition.name);
        self.publish(Event::WorkflowFailed {
            instance_id: instance.id,
            workflow_name: definition.name.clone(),
            timestamp: self.clock.now(),
            error: error_message,
        })
        .await;

        if definition.compensation != CompensationStrategy::None {
            self.run_compensation(instance, definition, control, definition.compensation)
                .await?;
        }
        self.controls.lock().remove(&instance.id);
        Ok(())
    }

    async fn cancel_and_compensate(
        &self,
        instance: &mut Instance,
        definition: &WorkflowDefinition,
        control: &InstanceControl,
    ) -> Result<(), EngineError> {
        instance.status = InstanceStatus::Cancelled;
        instance.finished_at = Some(self.clock.now());
        self.persist(instance).await?;
        self.metrics
            .record_workflow(&definition.name, WorkflowOutcome::Cancelled);
        self.record_instance_duration(instance, &definition.name);
        self.publish(Event::WorkflowCancelled {
            instance_id: instance.id,
            workflow_name: definition.name.clone(),
            timestamp: self.clock.now(),
        })
        .await;

        if definition.compensation != CompensationStrategy::None {
            self.run_compensation(instance, definition, control, definition.compensation)
                .await?;
        }
        self.controls.lock().remove(&instance.id);
        Ok(())
    }

    /// Walk completed steps in reverse topological order, invoking each
    /// one's registered compensator (if any) with its recorded output.
    async fn run_compensation(
        &self,
        instance: &mut Instance,
        definition: &WorkflowDefinition,
        _control: &InstanceControl,
        strategy: CompensationStrategy,
    ) -> Result<(), EngineError> {
        instance.status = InstanceStatus::Compensating;
        self.persist(instance).await?;
        self.publish(Event::CompensationStarted {
            instance_id: instance.id,
            workflow_name: definition.name.clone(),
            timestamp: self.clock.now(),
        })
        .await;

        let records = self.store.list_step_executions(instance.id).await?;
        let mut latest: HashMap<String, StepExecutionRecord> = HashMap::new();
        for record in records {
            latest.insert(record.step_id.clone(), record);
        }

        // Reverse order of completion time, ties broken by declaration order,
        // not topology: two steps in the same wave can finish at different
        // real times, and compensation must unwind the one that finished
        // last first regardless of which wave either belonged to.
        let insertion_index: HashMap<&str, usize> = definition
            .steps
            .iter()
            .enumerate()
            .map(|(idx, step)| (step.id.as_str(), idx))
            .collect();

        let mut succeeded: Vec<&StepExecutionRecord> = latest
            .values()
            .filter(|record| record.status == StepStatus::Succeeded)
            .collect();
        succeeded.sort_by(|a, b| {
            b.finished_at.cmp(&a.finished_at).then_with(|| {
                let a_idx = insertion_index.get(a.step_id.as_str()).copied().unwrap_or(usize::MAX);
                let b_idx = insertion_index.get(b.step_id.as_str()).copied().unwrap_or(usize::MAX);
                a_idx.cmp(&b_idx)
            })
        });

        for record in succeeded {
            let step_id = record.step_id.clone();
            let Some(step) = definition.step(&step_id) else {
                continue;
            };

            let should_compensate = match strategy {
                CompensationStrategy::All | CompensationStrategy::BestEffort => true,
                CompensationStrategy::CriticalOnly => step.options.critical,
                CompensationStrategy::None => false,
            };
            if !should_compensate {
                continue;
            }
            let Some(compensation_type) = &step.compensation else {
                continue;
            };

            let Some(handler) = self.registry.get(compensation_type) else {
                let message =
                    format!("no compensation handler registered for '{compensation_type}'");
                if strategy == CompensationStrategy::BestEffort {
                    warn!(step_id = %step_id, "{}", message);
                    continue;
                }
                return Err(EngineError::CompensationFailed { step_id, message });
            };

            let cancelled_flag = AtomicBool::new(false);
            let step_ctx = StepContext::new(instance.id, &step_id, 1, &instance.context, &cancelled_flag);
            let output = record.output.clone().unwrap_or(serde_json::Value::Null);

            match handler.execute(&step_ctx, output).await {
                Ok(_) => {
                    self.metrics.steps_compensated.fetch_add(1, Ordering::Relaxed);
                    self.publish(Event::StepCompensated {
                        instance_id: instance.id,
                        workflow_name: definition.name.clone(),
                        step_id: step_id.clone(),
                        timestamp: self.clock.now(),
                    })
                    .await;
                }
                Err(err) => {
                    if strategy == CompensationStrategy::BestEffort {
                        warn!(step_id = %step_id, error = %err.message, "compensation failed, continuing (best effort)");
                        continue;
                    }
                    return Err(EngineError::CompensationFailed {
                        step_id,
                        message: err.message,
                    });
                }
            }
        }

        instance.status = InstanceStatus::Compensated;
        instance.finished_at = Some(self.clock.now());
        self.persist(instance).await?;
        self.metrics
            .record_workflow(&definition.name, WorkflowOutcome::Compensated);
        self.publish(Event::CompensationCompleted {
            instance_id: instance.id,
            workflow_name: definition.name.clone(),
            timestamp: self.clock.now(),
        })
        .await;
        Ok(())
    }

    /// Classify the latest execution record per step into completed
    /// (succeeded or skipped, both satisfy a dependency), failed (exhausted
    /// retries or timed out), and in-flight (running) sets.
    fn partition_records(
        records: &[StepExecutionRecord],
    ) -> (HashSet<String>, HashSet<String>, HashSet<String>) {
        let mut latest: HashMap<&str, &StepExecutionRecord> = HashMap::new();
        for record in records {
            latest.insert(record.step_id.as_str(), record);
        }

        let mut completed = HashSet::new();
        let mut failed = HashSet::new();
        let mut in_flight = HashSet::new();
        for (step_id, record) in latest {
            match record.status {
                StepStatus::Succeeded | StepStatus::Skipped => {
                    completed.insert(step_id.to_string());
                }
                StepStatus::Failed | StepStatus::TimedOut => {
                    failed.insert(step_id.to_string());
                }
                StepStatus::Running => {
                    in_flight.insert(step_id.to_string());
                }
                StepStatus::Pending | StepStatus::Compensating | StepStatus::Compensated => {}
            }
        }
        (completed, failed, in_flight)
    }

    /// Record the elapsed time since `instance.started_at` into the
    /// `workflow_duration` timer and return it in milliseconds, for the
    /// terminal-transition events that carry a `duration_ms` field.
    fn record_instance_duration(&self, instance: &Instance, workflow_name: &str) -> u64 {
        let duration_ms = instance
            .started_at
            .map(|started| {
                self.clock
                    .now()
                    .signed_duration_since(started)
                    .num_milliseconds()
                    .max(0) as u64
            })
            .unwrap_or(0);
        self.metrics
            .record_workflow_duration(workflow_name, Duration::from_millis(duration_ms));
        duration_ms
    }

    async fn persist(&self, instance: &mut Instance) -> Result<(), EngineError> {
        instance.updated_at = self.clock.now();
        let mut attempts = 0;
        loop {
            instance.version += 1;
            match self.store.save_instance(instance.clone()).await {
                Ok(()) => return Ok(()),
                Err(StoreError::ConcurrencyConflict { actual, .. })
                    if attempts < self.config.persistence_retry_max =>
                {
                    attempts += 1;
                    // `actual` is the version really stored; the next
                    // attempt must present that as its prior version.
                    instance.version = actual;
                }
                Err(err) => return Err(EngineError::from(err)),
            }
        }
    }

    async fn load_required(&self, instance_id: Uuid) -> Result<Instance, EngineError> {
        self.store
            .load_instance(instance_id)
            .await?
            .ok_or(EngineError::InstanceNotFound(instance_id))
    }

    async fn publish(&self, event: Event) {
        self.events.publish(event).await;
    }

    fn control_for(&self, instance_id: Uuid) -> Arc<InstanceControl> {
        Arc::clone(
            self.controls
                .lock()
                .entry(instance_id)
                .or_insert_with(|| Arc::new(InstanceControl::new())),
        )
    }

    /// Keyed by step type alone, not by definition or step id: a flaky
    /// downstream dependency should trip once and protect every instance
    /// calling it, regardless of which definition or step invokes it.
    fn circuit_breaker_for(&self, step_type: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        Arc::clone(
            self.circuit_breakers
                .lock()
                .entry(step_type.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(config))),
        )
    }
}
