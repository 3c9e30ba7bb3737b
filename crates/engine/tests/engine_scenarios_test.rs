//! End-to-end scenarios exercising the wave loop, retry, compensation,
//! pause/resume, and timeout behavior against [`InMemoryStore`].

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use workflow_engine::prelude::*;

fn engine_with(registry: StepRegistry, config: EngineConfig) -> Arc<Engine<InMemoryStore>> {
    let store = Arc::new(InMemoryStore::new());
    Arc::new(Engine::new(config, store, registry))
}

#[tokio::test]
async fn linear_three_step_chain_completes_in_order() {
    let mut registry = StepRegistry::new();
    registry.register("a", |_input: Value| async move { Ok(json!("a")) });
    registry.register("b", |_input: Value| async move { Ok(json!("b")) });
    registry.register("c", |_input: Value| async move { Ok(json!("c")) });

    let definition = DefinitionBuilder::new("linear")
        .step(StepDescriptor::new("A", "a"))
        .step(StepDescriptor::new("B", "b").depends_on("A"))
        .step(StepDescriptor::new("C", "c").depends_on("B"))
        .build()
        .unwrap();

    let engine = engine_with(registry, EngineConfig::default());
    engine.register_definition(definition);

    let instance = Arc::clone(&engine)
        .run_to_completion("linear", Context::new())
        .await
        .unwrap();

    assert_eq!(instance.status, InstanceStatus::Completed);
    assert_eq!(instance.context.get("A").unwrap(), &json!("a"));
    assert_eq!(instance.context.get("B").unwrap(), &json!("b"));
    assert_eq!(instance.context.get("C").unwrap(), &json!("c"));
}

#[tokio::test]
async fn diamond_dependencies_run_the_middle_wave_in_parallel() {
    struct RecordOrder {
        label: &'static str,
        sleep: Duration,
        order: Arc<parking_lot::Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl StepHandler for RecordOrder {
        async fn execute(&self, _ctx: &StepContext<'_>, input: Value) -> Result<Value, StepError> {
            if !self.sleep.is_zero() {
                tokio::time::sleep(self.sleep).await;
            }
            self.order.lock().push(self.label);
            Ok(input)
        }
    }

    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let mut registry = StepRegistry::new();
    registry.register(
        "a",
        RecordOrder { label: "A", sleep: Duration::ZERO, order: order.clone() },
    );
    registry.register(
        "b",
        RecordOrder { label: "B", sleep: Duration::from_millis(40), order: order.clone() },
    );
    registry.register(
        "c",
        RecordOrder { label: "C", sleep: Duration::from_millis(10), order: order.clone() },
    );
    registry.register(
        "d",
        RecordOrder { label: "D", sleep: Duration::ZERO, order: order.clone() },
    );

    let definition = DefinitionBuilder::new("diamond")
        .mode(ExecutionMode::Parallel)
        .step(StepDescriptor::new("A", "a"))
        .step(StepDescriptor::new("B", "b").depends_on("A"))
        .step(StepDescriptor::new("C", "c").depends_on("A"))
        .step(StepDescriptor::new("D", "d").depends_on("B").depends_on("C"))
        .build()
        .unwrap();

    let engine = engine_with(registry, EngineConfig::default());
    engine.register_definition(definition);

    let instance = Arc::clone(&engine)
        .run_to_completion("diamond", Context::new())
        .await
        .unwrap();

    assert_eq!(instance.status, InstanceStatus::Completed);
    // C sleeps less than B, so it finishes first even though both start in
    // the same wave; D only runs after both regardless of that ordering.
    let recorded = order.lock().clone();
    assert_eq!(recorded[0], "A");
    assert_eq!(recorded[3], "D");
    assert!(recorded[1..3].contains(&"B") && recorded[1..3].contains(&"C"));
}

#[tokio::test]
async fn step_retries_on_transient_failure_then_succeeds() {
    struct Flaky(AtomicU32);

    #[async_trait]
    impl StepHandler for Flaky {
        async fn execute(&self, _ctx: &StepContext<'_>, input: Value) -> Result<Value, StepError> {
            if self.0.fetch_sub(1, Ordering::SeqCst) > 0 {
                return Err(StepError::retryable("not yet"));
            }
            Ok(input)
        }
    }

    let mut registry = StepRegistry::new();
    registry.register("flaky", Flaky(AtomicU32::new(2)));

    let definition = DefinitionBuilder::new("retry")
        .step(
            StepDescriptor::new("only", "flaky").with_options(
                StepOptions::default()
                    .with_retry(
                        RetryPolicy::exponential()
                            .with_max_attempts(5)
                            .with_initial_interval(Duration::from_millis(1))
                            .with_max_interval(Duration::from_millis(5)),
                    )
                    .with_timeout(Duration::from_secs(1)),
            ),
        )
        .build()
        .unwrap();

    let engine = engine_with(registry, EngineConfig::default());
    engine.register_definition(definition);

    let instance = Arc::clone(&engine)
        .run_to_completion("retry", Context::new())
        .await
        .unwrap();

    assert_eq!(instance.status, InstanceStatus::Completed);
}

#[tokio::test]
async fn single_step_exhausting_retries_fails_with_exact_attempt_count() {
    struct AlwaysFails;

    #[async_trait]
    impl StepHandler for AlwaysFails {
        async fn execute(&self, _ctx: &StepContext<'_>, _input: Value) -> Result<Value, StepError> {
            Err(StepError::retryable("never works"))
        }
    }

    let mut registry = StepRegistry::new();
    registry.register("doomed", AlwaysFails);

    let definition = DefinitionBuilder::new("fail")
        .step(
            StepDescriptor::new("only", "doomed").with_options(
                StepOptions::default().with_retry(
                    RetryPolicy::exponential()
                        .with_max_attempts(3)
                        .with_initial_interval(Duration::from_millis(1))
                        .with_max_interval(Duration::from_millis(2)),
                ),
            ),
        )
        .build()
        .unwrap();

    let store = Arc::new(InMemoryStore::new());
    let engine = Arc::new(Engine::new(EngineConfig::default(), store.clone(), registry));
    engine.register_definition(definition);

    let instance = Arc::clone(&engine)
        .run_to_completion("fail", Context::new())
        .await
        .unwrap();

    assert_eq!(instance.status, InstanceStatus::Failed);
    let records = store.list_step_executions(instance.id).await.unwrap();
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| r.status == StepStatus::Failed));
}

#[tokio::test]
async fn failure_triggers_compensation_of_completed_steps() {
    let compensated = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let mut registry = StepRegistry::new();
    registry.register("write_a", |_input: Value| async move { Ok(json!({"a": 1})) });
    registry.register("write_b", |_input: Value| async move { Ok(json!({"b": 2})) });
    registry.register("doomed", |_input: Value| async move {
        Err(StepError::non_retryable("boom"))
    });

    {
        let log = compensated.clone();
        registry.register("undo_a", move |input: Value| {
            let log = log.clone();
            async move {
                log.lock().push("A");
                Ok(input)
            }
        });
    }
    {
        let log = compensated.clone();
        registry.register("undo_b", move |input: Value| {
            let log = log.clone();
            async move {
                log.lock().push("B");
                Ok(input)
            }
        });
    }

    let definition = DefinitionBuilder::new("compensation")
        .compensation(CompensationStrategy::All)
        .step(StepDescriptor::new("A", "write_a").with_compensation("undo_a"))
        .step(StepDescriptor::new("B", "write_b").depends_on("A").with_compensation("undo_b"))
        .step(
            StepDescriptor::new("C", "doomed")
                .depends_on("B")
                .with_options(StepOptions::default().with_retry(RetryPolicy::no_retry())),
        )
        .build()
        .unwrap();

    let engine = engine_with(registry, EngineConfig::default());
    engine.register_definition(definition);

    let instance = Arc::clone(&engine)
        .run_to_completion("compensation", Context::new())
        .await
        .unwrap();

    assert_eq!(instance.status, InstanceStatus::Compensated);
    let order = compensated.lock().clone();
    assert_eq!(order, vec!["B", "A"]);
}

#[tokio::test]
async fn compensation_follows_completion_time_not_wave_insertion_order() {
    let compensated = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let mut registry = StepRegistry::new();
    registry.register("a", |_input: Value| async move { Ok(json!({"a": 1})) });
    registry.register("b", |_input: Value| async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok(json!({"b": 2}))
    });
    registry.register("c", |_input: Value| async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(json!({"c": 3}))
    });
    registry.register("doomed", |_input: Value| async move {
        Err(StepError::non_retryable("boom"))
    });

    for (undo_name, label) in [("undo_b", "B"), ("undo_c", "C")] {
        let log = compensated.clone();
        registry.register(undo_name, move |input: Value| {
            let log = log.clone();
            let label = label;
            async move {
                log.lock().push(label);
                Ok(input)
            }
        });
    }

    // B is declared before C, but C sleeps longer, so C finishes after B
    // despite both depending only on A and running in the same wave.
    let definition = DefinitionBuilder::new("diamond-compensation")
        .mode(ExecutionMode::Parallel)
        .compensation(CompensationStrategy::All)
        .step(StepDescriptor::new("A", "a"))
        .step(StepDescriptor::new("B", "b").depends_on("A").with_compensation("undo_b"))
        .step(StepDescriptor::new("C", "c").depends_on("A").with_compensation("undo_c"))
        .step(
            StepDescriptor::new("D", "doomed")
                .depends_on("B")
                .depends_on("C")
                .with_options(StepOptions::default().with_retry(RetryPolicy::no_retry())),
        )
        .build()
        .unwrap();

    let engine = engine_with(registry, EngineConfig::default());
    engine.register_definition(definition);

    let instance = Arc::clone(&engine)
        .run_to_completion("diamond-compensation", Context::new())
        .await
        .unwrap();

    assert_eq!(instance.status, InstanceStatus::Compensated);
    let order = compensated.lock().clone();
    // C finished later than B, so it must be compensated first.
    assert_eq!(order, vec!["C", "B"]);
}

#[tokio::test]
async fn pause_then_resume_allows_the_instance_to_complete() {
    let mut registry = StepRegistry::new();
    for id in ["s1", "s2", "s3"] {
        registry.register(id, |input: Value| async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(input)
        });
    }

    let definition = DefinitionBuilder::new("pause-resume")
        .mode(ExecutionMode::Sequential)
        .step(StepDescriptor::new("A", "s1"))
        .step(StepDescriptor::new("B", "s2").depends_on("A"))
        .step(StepDescriptor::new("C", "s3").depends_on("B"))
        .build()
        .unwrap();

    let engine = engine_with(registry, EngineConfig::default());
    engine.register_definition(definition);

    let instance_id = Arc::clone(&engine).start("pause-resume", Context::new()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    engine.pause(instance_id).await.unwrap();

    for _ in 0..200 {
        let snapshot = engine.get_instance(instance_id).await.unwrap();
        if snapshot.instance.status == InstanceStatus::Paused {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(
        engine.get_instance(instance_id).await.unwrap().instance.status,
        InstanceStatus::Paused
    );

    Arc::clone(&engine).resume(instance_id).await.unwrap();

    let mut completed = None;
    for _ in 0..200 {
        let snapshot = engine.get_instance(instance_id).await.unwrap();
        if snapshot.instance.status.is_terminal() {
            completed = Some(snapshot.instance.status);
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(completed, Some(InstanceStatus::Completed));
}

#[tokio::test]
async fn step_timeout_shorter_than_runtime_records_timed_out() {
    let mut registry = StepRegistry::new();
    registry.register("slow", |_input: Value| async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(json!(null))
    });

    let definition = DefinitionBuilder::new("timeout")
        .step(
            StepDescriptor::new("only", "slow").with_options(
                StepOptions::default()
                    .with_timeout(Duration::from_millis(50))
                    .with_retry(RetryPolicy::no_retry()),
            ),
        )
        .build()
        .unwrap();

    let store = Arc::new(InMemoryStore::new());
    let engine = Arc::new(Engine::new(EngineConfig::default(), store.clone(), registry));
    engine.register_definition(definition);

    let instance = Arc::clone(&engine)
        .run_to_completion("timeout", Context::new())
        .await
        .unwrap();

    assert_eq!(instance.status, InstanceStatus::Failed);
    let records = store.list_step_executions(instance.id).await.unwrap();
    assert!(records.iter().any(|r| r.status == StepStatus::TimedOut));
}

#[tokio::test]
async fn global_timeout_fails_the_instance_even_without_a_per_step_timeout() {
    let mut registry = StepRegistry::new();
    registry.register("slow", |_input: Value| async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        Ok(json!(null))
    });

    let definition = DefinitionBuilder::new("global-timeout")
        .global_timeout(Duration::from_millis(100))
        .step(
            StepDescriptor::new("only", "slow").with_options(
                StepOptions::default()
                    .with_timeout(Duration::from_secs(5))
                    .with_retry(RetryPolicy::no_retry()),
            ),
        )
        .build()
        .unwrap();

    let engine = engine_with(registry, EngineConfig::default().with_poll_interval(Duration::from_millis(5)));
    engine.register_definition(definition);

    let instance_id = Arc::clone(&engine)
        .start("global-timeout", Context::new())
        .await
        .unwrap();

    let mut status = None;
    for _ in 0..50 {
        let snapshot = engine.get_instance(instance_id).await.unwrap();
        if snapshot.instance.status.is_terminal() {
            status = Some(snapshot.instance.status);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(status, Some(InstanceStatus::Failed));
    let instance = engine.get_instance(instance_id).await.unwrap().instance;
    assert!(instance.error.unwrap().contains("global timeout"));
}

#[tokio::test]
async fn empty_definition_completes_immediately() {
    let definition = DefinitionBuilder::new("empty").build().unwrap();

    let engine = engine_with(StepRegistry::new(), EngineConfig::default());
    engine.register_definition(definition);

    let instance = Arc::clone(&engine)
        .run_to_completion("empty", Context::new())
        .await
        .unwrap();

    assert_eq!(instance.status, InstanceStatus::Completed);
    assert!(instance.step_ids.is_empty());
}

#[tokio::test]
async fn cancellation_mid_run_settles_to_cancelled() {
    let mut registry = StepRegistry::new();
    registry.register("long", |_input: Value| async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        Ok(json!(null))
    });

    let definition = DefinitionBuilder::new("cancel-me")
        .step(
            StepDescriptor::new("only", "long")
                .with_options(StepOptions::default().with_timeout(Duration::from_secs(5))),
        )
        .build()
        .unwrap();

    let engine = engine_with(registry, EngineConfig::default());
    engine.register_definition(definition);

    let instance_id = Arc::clone(&engine).start("cancel-me", Context::new()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    Arc::clone(&engine).cancel(instance_id).await.unwrap();

    let mut status = None;
    for _ in 0..200 {
        let snapshot = engine.get_instance(instance_id).await.unwrap();
        if snapshot.instance.status.is_terminal() {
            status = Some(snapshot.instance.status);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(status, Some(InstanceStatus::Cancelled));
}

#[tokio::test]
async fn metrics_are_tagged_by_workflow_name_and_by_step_terminal_status() {
    let mut registry = StepRegistry::new();
    registry.register("a", |_input: Value| async move { Ok(json!("a")) });
    registry.register("boom", |_input: Value| async move {
        Err(StepError::non_retryable("nope"))
    });

    let good = DefinitionBuilder::new("metrics-good")
        .step(StepDescriptor::new("A", "a"))
        .build()
        .unwrap();
    let bad = DefinitionBuilder::new("metrics-bad")
        .step(
            StepDescriptor::new("B", "boom")
                .with_options(StepOptions::default().with_retry(RetryPolicy::no_retry())),
        )
        .build()
        .unwrap();

    let engine = engine_with(registry, EngineConfig::default());
    engine.register_definition(good);
    engine.register_definition(bad);

    Arc::clone(&engine)
        .run_to_completion("metrics-good", Context::new())
        .await
        .unwrap();
    let _ = Arc::clone(&engine)
        .run_to_completion("metrics-bad", Context::new())
        .await;

    let snapshot = engine.metrics_snapshot();
    assert_eq!(snapshot.by_workflow["metrics-good"].completed, 1);
    assert_eq!(snapshot.by_workflow["metrics-bad"].failed, 1);

    let succeeded_step = snapshot
        .by_step
        .iter()
        .find(|s| s.workflow_name == "metrics-good" && s.step_id == "A" && s.status == "succeeded")
        .expect("tagged succeeded step metric");
    assert_eq!(succeeded_step.count, 1);

    let failed_step = snapshot
        .by_step
        .iter()
        .find(|s| s.workflow_name == "metrics-bad" && s.step_id == "B" && s.status == "failed")
        .expect("tagged failed step metric");
    assert_eq!(failed_step.count, 1);
}
