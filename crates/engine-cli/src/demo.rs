//! Built-in step handlers and workflow definitions used by the `demo`
//! subcommand to reproduce the literal end-to-end scenarios from this
//! engine's test suite without requiring a definition file on disk.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use workflow_engine::prelude::*;

/// Appends this step's id to the trail left by its upstream steps, reading
/// each upstream step's own context entry (the engine merges a step's output
/// under its own id, per the data model's context mutation discipline).
struct TrailStep {
    id: String,
    upstream: Vec<String>,
    sleep: Duration,
}

#[async_trait]
impl StepHandler for TrailStep {
    async fn execute(&self, ctx: &StepContext<'_>, _input: Value) -> Result<Value, StepError> {
        if !self.sleep.is_zero() {
            tokio::time::sleep(self.sleep).await;
        }
        let mut parts = Vec::new();
        for up in &self.upstream {
            if let Some(v) = ctx.get(up).and_then(|v| v.as_str()) {
                parts.push(v.to_string());
            }
        }
        parts.push(self.id.clone());
        Ok(Value::String(parts.join(",")))
    }
}

/// Fails the configured number of times before succeeding, for exercising
/// the retry policy's backoff-then-succeed path.
struct FlakyStep {
    remaining_failures: AtomicU32,
}

#[async_trait]
impl StepHandler for FlakyStep {
    async fn execute(&self, _ctx: &StepContext<'_>, input: Value) -> Result<Value, StepError> {
        let remaining = self.remaining_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::SeqCst);
            return Err(StepError::retryable("transient failure"));
        }
        Ok(input)
    }
}

/// Always fails without retrying, used to drive a definition into `Failed`
/// so `compensate` has something to unwind.
struct AlwaysFails;

#[async_trait]
impl StepHandler for AlwaysFails {
    async fn execute(&self, _ctx: &StepContext<'_>, _input: Value) -> Result<Value, StepError> {
        Err(StepError::non_retryable("step is configured to always fail"))
    }
}

/// Writes its input back unchanged, recording the action as output so the
/// compensation event log is legible.
struct Compensator {
    label: String,
}

#[async_trait]
impl StepHandler for Compensator {
    async fn execute(&self, _ctx: &StepContext<'_>, input: Value) -> Result<Value, StepError> {
        Ok(serde_json::json!({ "compensated": self.label, "of": input }))
    }
}

/// Sleeps for a duration read from `input.sleep_ms`, then echoes `input`.
struct SleepStep;

#[async_trait]
impl StepHandler for SleepStep {
    async fn execute(&self, _ctx: &StepContext<'_>, input: Value) -> Result<Value, StepError> {
        let millis = input.get("sleep_ms").and_then(|v| v.as_u64()).unwrap_or(0);
        if millis > 0 {
            tokio::time::sleep(Duration::from_millis(millis)).await;
        }
        Ok(input)
    }
}

pub struct Scenario {
    pub definition: WorkflowDefinition,
    pub registry: StepRegistry,
    pub input: Context,
    /// If set, the scenario demonstrates `pause`/`resume` mid-run rather
    /// than a single `run_to_completion` call.
    pub pause_after_steps: Option<usize>,
}

pub fn build(name: &str) -> anyhow::Result<Scenario> {
    match name {
        "linear" => Ok(linear_three_step_success()),
        "diamond" => Ok(diamond_with_parallel_wave()),
        "retry" => Ok(retry_then_succeed()),
        "compensation" => Ok(compensation_on_failure()),
        "pause-resume" => Ok(pause_and_resume()),
        "global-timeout" => Ok(global_timeout()),
        other => anyhow::bail!("unknown demo scenario '{other}'"),
    }
}

fn linear_three_step_success() -> Scenario {
    let mut registry = StepRegistry::new();
    registry.register(
        "trail_a",
        TrailStep {
            id: "A".into(),
            upstream: vec![],
            sleep: Duration::ZERO,
        },
    );
    registry.register(
        "trail_b",
        TrailStep {
            id: "B".into(),
            upstream: vec!["A".into()],
            sleep: Duration::ZERO,
        },
    );
    registry.register(
        "trail_c",
        TrailStep {
            id: "C".into(),
            upstream: vec!["B".into()],
            sleep: Duration::ZERO,
        },
    );

    let definition = DefinitionBuilder::new("linear-three-step")
        .mode(ExecutionMode::Parallel)
        .step(StepDescriptor::new("A", "trail_a"))
        .step(StepDescriptor::new("B", "trail_b").depends_on("A"))
        .step(StepDescriptor::new("C", "trail_c").depends_on("B"))
        .build()
        .expect("linear definition is valid");

    Scenario {
        definition,
        registry,
        input: Context::new(),
        pause_after_steps: None,
    }
}

fn diamond_with_parallel_wave() -> Scenario {
    let mut registry = StepRegistry::new();
    registry.register(
        "trail_a",
        TrailStep {
            id: "A".into(),
            upstream: vec![],
            sleep: Duration::ZERO,
        },
    );
    registry.register(
        "trail_b",
        TrailStep {
            id: "B".into(),
            upstream: vec!["A".into()],
            sleep: Duration::from_millis(100),
        },
    );
    registry.register(
        "trail_c",
        TrailStep {
            id: "C".into(),
            upstream: vec!["A".into()],
            sleep: Duration::from_millis(200),
        },
    );
    registry.register(
        "trail_d",
        TrailStep {
            id: "D".into(),
            upstream: vec!["B".into(), "C".into()],
            sleep: Duration::ZERO,
        },
    );

    let definition = DefinitionBuilder::new("diamond")
        .mode(ExecutionMode::Parallel)
        .step(StepDescriptor::new("A", "trail_a"))
        .step(StepDescriptor::new("B", "trail_b").depends_on("A"))
        .step(StepDescriptor::new("C", "trail_c").depends_on("A"))
        .step(
            StepDescriptor::new("D", "trail_d")
                .depends_on("B")
                .depends_on("C"),
        )
        .build()
        .expect("diamond definition is valid");

    Scenario {
        definition,
        registry,
        input: Context::new(),
        pause_after_steps: None,
    }
}

fn retry_then_succeed() -> Scenario {
    let mut registry = StepRegistry::new();
    registry.register(
        "flaky",
        FlakyStep {
            remaining_failures: AtomicU32::new(2),
        },
    );

    let definition = DefinitionBuilder::new("retry-then-succeed")
        .step(
            StepDescriptor::new("only", "flaky").with_options(
                StepOptions::default()
                    .with_retry(
                        RetryPolicy::exponential()
                            .with_max_attempts(3)
                            .with_initial_interval(Duration::from_millis(10))
                            .with_max_interval(Duration::from_millis(40)),
                    )
                    .with_timeout(Duration::from_secs(5)),
            ),
        )
        .build()
        .expect("retry definition is valid");

    Scenario {
        definition,
        registry,
        input: Context::new(),
        pause_after_steps: None,
    }
}

fn compensation_on_failure() -> Scenario {
    let mut registry = StepRegistry::new();
    registry.register("write_a", |input: Value| async move {
        let _ = input;
        Ok(serde_json::json!({ "a": 1 }))
    });
    registry.register("write_b", |input: Value| async move {
        let _ = input;
        Ok(serde_json::json!({ "b": 2 }))
    });
    registry.register("doomed", AlwaysFails);
    registry.register("undo_a", Compensator { label: "A".into() });
    registry.register("undo_b", Compensator { label: "B".into() });

    let definition = DefinitionBuilder::new("compensation-on-failure")
        .compensation(CompensationStrategy::All)
        .step(StepDescriptor::new("A", "write_a").with_compensation("undo_a"))
        .step(
            StepDescriptor::new("B", "write_b")
                .depends_on("A")
                .with_compensation("undo_b"),
        )
        .step(
            StepDescriptor::new("C", "doomed")
                .depends_on("B")
                .with_options(StepOptions::default().with_retry(RetryPolicy::no_retry())),
        )
        .build()
        .expect("compensation definition is valid");

    Scenario {
        definition,
        registry,
        input: Context::new(),
        pause_after_steps: None,
    }
}

fn pause_and_resume() -> Scenario {
    let mut registry = StepRegistry::new();
    for id in ["step1", "step2", "step3", "step4", "step5"] {
        registry.register(id, |input: Value| async move { Ok(input) });
    }

    let ids = ["step1", "step2", "step3", "step4", "step5"];
    let mut builder = DefinitionBuilder::new("pause-and-resume").mode(ExecutionMode::Sequential);
    for (idx, id) in ids.iter().enumerate() {
        let mut step = StepDescriptor::new(*id, *id);
        if idx > 0 {
            step = step.depends_on(ids[idx - 1]);
        }
        builder = builder.step(step);
    }
    let definition = builder.build().expect("pause/resume definition is valid");

    Scenario {
        definition,
        registry,
        input: Context::new(),
        pause_after_steps: Some(2),
    }
}

fn global_timeout() -> Scenario {
    let mut registry = StepRegistry::new();
    registry.register("slow", SleepStep);

    let definition = DefinitionBuilder::new("global-timeout")
        .global_timeout(Duration::from_millis(100))
        .step(
            StepDescriptor::new("A", "slow")
                .with_input(serde_json::json!({ "sleep_ms": 500 }))
                .with_options(StepOptions::default().with_timeout(Duration::from_secs(5))),
        )
        .build()
        .expect("global timeout definition is valid");

    Scenario {
        definition,
        registry,
        input: Context::new(),
        pause_after_steps: None,
    }
}
