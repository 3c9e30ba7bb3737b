//! Dependency resolver: turns a [`WorkflowDefinition`]'s `depends_on` edges
//! into an ordered sequence of waves, and validates the graph is acyclic.
//!
//! Implemented with explicit in-degree/dependents maps computed fresh per
//! call (Kahn's algorithm), the same layered-phase computation this
//! workspace's compiler-adjacent crates use for DAG scheduling, rather than
//! pulling in an external graph crate.

use std::collections::HashSet;

use crate::definition::{ExecutionMode, WorkflowDefinition};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ResolverError {
    /// Defensive: [`WorkflowDefinition::validate`] should already have
    /// rejected any cycle before a resolver ever sees the definition.
    #[error("dependency cycle detected among remaining steps: {0:?}")]
    CycleDetected(Vec<String>),
}

/// Compute the full sequence of waves for a definition, ignoring any
/// already-completed steps. Used by `WorkflowDefinition::validate` to check
/// acyclicity and by tests that want the full plan up front.
pub fn resolve_waves(definition: &WorkflowDefinition) -> Result<Vec<Vec<String>>, ResolverError> {
    let mut completed = HashSet::new();
    let mut waves = Vec::new();

    loop {
        let wave = next_wave(definition, &completed, &HashSet::new())?;
        if wave.is_empty() {
            break;
        }
        for step in &wave {
            completed.insert(step.clone());
        }
        waves.push(wave);

        if completed.len() == definition.steps.len() {
            break;
        }
    }

    if completed.len() != definition.steps.len() {
        let remaining: Vec<String> = definition
            .steps
            .iter()
            .map(|s| s.id.clone())
            .filter(|id| !completed.contains(id))
            .collect();
        return Err(ResolverError::CycleDetected(remaining));
    }

    Ok(waves)
}

/// Return the next wave of step ids ready to run: dependencies satisfied by
/// `completed`, not already `completed`, and not currently `in_flight`.
///
/// In [`ExecutionMode::Sequential`], only the first ready step (by
/// insertion order in the definition's step list) is returned, so callers
/// replay deterministically one step at a time.
pub fn next_wave(
    definition: &WorkflowDefinition,
    completed: &HashSet<String>,
    in_flight: &HashSet<String>,
) -> Result<Vec<String>, ResolverError> {
    let remaining: Vec<&str> = definition
        .steps
        .iter()
        .map(|s| s.id.as_str())
        .filter(|id| !completed.contains(*id) && !in_flight.contains(*id))
        .collect();

    if remaining.is_empty() {
        return Ok(Vec::new());
    }

    let mut ready = Vec::new();
    for step in &definition.steps {
        if completed.contains(&step.id) || in_flight.contains(&step.id) {
            continue;
        }
        let satisfied = step
            .depends_on
            .iter()
            .all(|dep| completed.contains(dep.as_str()));
        if satisfied {
            ready.push(step.id.clone());
        }
    }

    if ready.is_empty() {
        // Nothing is ready, yet steps remain and nothing is in flight: the
        // remaining subgraph cannot make progress, which can only happen if
        // it contains a cycle. `WorkflowDefinition::validate` should have
        // already rejected this before the resolver runs on live state.
        if in_flight.is_empty() {
            return Err(ResolverError::CycleDetected(
                remaining.iter().map(|s| s.to_string()).collect(),
            ));
        }
        return Ok(Vec::new());
    }

    match definition.mode {
        ExecutionMode::Parallel => Ok(ready),
        ExecutionMode::Sequential => Ok(vec![ready.into_iter().next().unwrap()]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{DefinitionBuilder, ExecutionMode, StepDescriptor};

    fn step(id: &str, deps: &[&str]) -> StepDescriptor {
        let mut s = StepDescriptor::new(id, "noop");
        for d in deps {
            s = s.depends_on(*d);
        }
        s
    }

    #[test]
    fn linear_chain_produces_three_waves_in_parallel_mode() {
        let def = DefinitionBuilder::new("linear")
            .mode(ExecutionMode::Parallel)
            .step(step("a", &[]))
            .step(step("b", &["a"]))
            .step(step("c", &["b"]))
            .build()
            .unwrap();

        let waves = resolve_waves(&def).unwrap();
        assert_eq!(waves, vec![vec!["a"], vec!["b"], vec!["c"]]);
    }

    #[test]
    fn diamond_produces_parallel_middle_wave() {
        let def = DefinitionBuilder::new("diamond")
            .mode(ExecutionMode::Parallel)
            .step(step("a", &[]))
            .step(step("b", &["a"]))
            .step(step("c", &["a"]))
            .step(step("d", &["b", "c"]))
            .build()
            .unwrap();

        let waves = resolve_waves(&def).unwrap();
        assert_eq!(waves.len(), 3);
        assert_eq!(waves[0], vec!["a"]);
        let mut middle = waves[1].clone();
        middle.sort();
        assert_eq!(middle, vec!["b", "c"]);
        assert_eq!(waves[2], vec!["d"]);
    }

    #[test]
    fn sequential_mode_returns_one_step_per_wave_in_insertion_order() {
        let def = DefinitionBuilder::new("diamond-seq")
            .mode(ExecutionMode::Sequential)
            .step(step("a", &[]))
            .step(step("b", &["a"]))
            .step(step("c", &["a"]))
            .step(step("d", &["b", "c"]))
            .build()
            .unwrap();

        let waves = resolve_waves(&def).unwrap();
        assert_eq!(waves.len(), 4);
        for wave in &waves {
            assert_eq!(wave.len(), 1);
        }
        // b was inserted before c, so sequential mode favors it first.
        assert_eq!(waves[1], vec!["b"]);
        assert_eq!(waves[2], vec!["c"]);
    }

    #[test]
    fn next_wave_respects_in_flight_exclusion() {
        let def = DefinitionBuilder::new("parallel-pair")
            .mode(ExecutionMode::Parallel)
            .step(step("a", &[]))
            .step(step("b", &[]))
            .build()
            .unwrap();

        let completed = HashSet::new();
        let mut in_flight = HashSet::new();
        in_flight.insert("a".to_string());

        let wave = next_wave(&def, &completed, &in_flight).unwrap();
        assert_eq!(wave, vec!["b"]);
    }

    #[test]
    fn empty_definition_has_no_waves() {
        let def = WorkflowDefinition {
            name: "empty".into(),
            version: 1,
            steps: vec![],
            mode: ExecutionMode::Parallel,
            compensation: Default::default(),
            global_timeout: None,
        };
        let waves = resolve_waves(&def).unwrap();
        assert!(waves.is_empty());
    }
}
