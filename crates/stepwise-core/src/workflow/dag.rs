//! Dependency graph construction, cycle detection, and batch computation.
//!
//! Uses `petgraph` to model step dependencies as a directed graph (edge from
//! dependency to dependent) and peels it layer by layer: each batch is the set
//! of steps whose remaining in-degree is zero. A layer that comes up empty
//! while steps remain means the remainder contains a cycle.

use std::collections::HashMap;

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use stepwise_types::workflow::{ExecutionPlan, StepDefinition};

use super::definition::WorkflowError;

// ---------------------------------------------------------------------------
// Graph construction
// ---------------------------------------------------------------------------

/// Build the dependency graph for `steps`.
///
/// Node indices match declaration order, so `graph[NodeIndex::new(i)]` is the
/// ID of `steps[i]`.
pub fn build_dependency_graph(steps: &[StepDefinition]) -> Result<DiGraph<&str, ()>, WorkflowError> {
    let id_to_idx: HashMap<&str, NodeIndex> = steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.as_str(), NodeIndex::new(i)))
        .collect();

    let mut graph = DiGraph::<&str, ()>::with_capacity(steps.len(), steps.len());
    for step in steps {
        graph.add_node(step.id.as_str());
    }

    for (i, step) in steps.iter().enumerate() {
        for dep in &step.dependencies {
            let from = id_to_idx.get(dep.as_str()).ok_or_else(|| {
                WorkflowError::UnknownDependency(format!(
                    "step '{}' depends on unknown step '{}'",
                    step.id, dep
                ))
            })?;
            graph.add_edge(*from, NodeIndex::new(i), ());
        }
    }

    Ok(graph)
}

// ---------------------------------------------------------------------------
// Execution plan
// ---------------------------------------------------------------------------

/// Compute the batched execution plan for `steps`.
///
/// Steps within a batch have no dependencies on each other and may run
/// concurrently; every dependency of a step lands in a strictly earlier batch.
/// Batch members are listed in declaration order, so the plan is a pure
/// function of the step list.
///
/// Returns `WorkflowError::CycleDetected` naming the unplaceable steps if the
/// graph is not acyclic.
pub fn build_execution_plan(steps: &[StepDefinition]) -> Result<ExecutionPlan, WorkflowError> {
    let graph = build_dependency_graph(steps)?;

    let mut in_degree: Vec<usize> = graph
        .node_indices()
        .map(|n| graph.neighbors_directed(n, Direction::Incoming).count())
        .collect();
    let mut placed = vec![false; graph.node_count()];
    let mut remaining = graph.node_count();
    let mut batches = Vec::new();

    while remaining > 0 {
        let ready: Vec<NodeIndex> = graph
            .node_indices()
            .filter(|n| !placed[n.index()] && in_degree[n.index()] == 0)
            .collect();

        if ready.is_empty() {
            let steps = graph
                .node_indices()
                .filter(|n| !placed[n.index()])
                .map(|n| graph[n].to_string())
                .collect();
            return Err(WorkflowError::CycleDetected { steps });
        }

        for &node in &ready {
            placed[node.index()] = true;
            for dependent in graph.neighbors_directed(node, Direction::Outgoing) {
                in_degree[dependent.index()] -= 1;
            }
        }
        remaining -= ready.len();
        batches.push(ready.iter().map(|n| graph[*n].to_string()).collect());
    }

    Ok(ExecutionPlan::new(batches))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn step(id: &str, deps: &[&str]) -> StepDefinition {
        StepDefinition {
            id: id.to_string(),
            name: id.to_uppercase(),
            agent_id: "echo".to_string(),
            task: format!("run {id}"),
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            parallel: false,
            timeout: None,
            retries: 0,
            continue_on_error: false,
        }
    }

    fn batches(plan: &ExecutionPlan) -> Vec<Vec<&str>> {
        plan.batches
            .iter()
            .map(|b| b.iter().map(String::as_str).collect())
            .collect()
    }

    fn assert_plan_respects_dependencies(steps: &[StepDefinition], plan: &ExecutionPlan) {
        let mut seen = HashSet::new();
        for batch in &plan.batches {
            for id in batch {
                assert!(seen.insert(id.clone()), "step '{id}' placed twice");
            }
        }
        assert_eq!(seen.len(), steps.len());

        for step in steps {
            let own = plan.batch_index_of(&step.id).unwrap();
            for dep in &step.dependencies {
                let dep_batch = plan.batch_index_of(dep).unwrap();
                assert!(dep_batch < own, "'{dep}' must precede '{}'", step.id);
            }
        }
    }

    #[test]
    fn test_linear_chain() {
        let steps = vec![step("a", &[]), step("b", &["a"]), step("c", &["b"])];
        let plan = build_execution_plan(&steps).unwrap();
        assert_eq!(batches(&plan), vec![vec!["a"], vec!["b"], vec!["c"]]);
    }

    #[test]
    fn test_diamond_three_batches() {
        let steps = vec![
            step("a", &[]),
            step("b", &["a"]),
            step("c", &["a"]),
            step("d", &["b", "c"]),
        ];
        let plan = build_execution_plan(&steps).unwrap();
        assert_eq!(batches(&plan), vec![vec!["a"], vec!["b", "c"], vec!["d"]]);
    }

    #[test]
    fn test_independent_steps_share_first_batch() {
        let steps = vec![step("x", &[]), step("y", &[]), step("z", &[])];
        let plan = build_execution_plan(&steps).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(batches(&plan)[0], vec!["x", "y", "z"]);
    }

    #[test]
    fn test_batch_order_follows_declaration_not_dependency_order() {
        // Members of a batch keep their declaration order.
        let steps = vec![
            step("report", &["early", "late"]),
            step("late", &[]),
            step("early", &[]),
        ];
        let plan = build_execution_plan(&steps).unwrap();
        assert_eq!(batches(&plan), vec![vec!["late", "early"], vec!["report"]]);
    }

    #[test]
    fn test_two_step_cycle_detected() {
        let steps = vec![step("a", &["b"]), step("b", &["a"])];
        let err = build_execution_plan(&steps).unwrap_err();
        match &err {
            WorkflowError::CycleDetected { steps } => {
                assert_eq!(steps, &vec!["a".to_string(), "b".to_string()]);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
        let message = err.to_string();
        assert!(message.contains('a') && message.contains('b'));
    }

    #[test]
    fn test_cycle_reported_after_placeable_prefix() {
        let steps = vec![
            step("root", &[]),
            step("x", &["root", "z"]),
            step("y", &["x"]),
            step("z", &["y"]),
        ];
        let err = build_execution_plan(&steps).unwrap_err();
        let WorkflowError::CycleDetected { steps } = err else {
            panic!("expected cycle");
        };
        assert_eq!(steps, vec!["x", "y", "z"]);
    }

    #[test]
    fn test_self_dependency_is_cycle() {
        let steps = vec![step("a", &["a"])];
        assert!(matches!(
            build_execution_plan(&steps),
            Err(WorkflowError::CycleDetected { .. })
        ));
    }

    #[test]
    fn test_unknown_dependency() {
        let steps = vec![step("a", &["missing"])];
        assert!(matches!(
            build_execution_plan(&steps),
            Err(WorkflowError::UnknownDependency(_))
        ));
    }

    #[test]
    fn test_wide_graph_respects_dependencies() {
        let steps = vec![
            step("s0", &[]),
            step("s1", &["s0"]),
            step("s2", &[]),
            step("s3", &["s1", "s2"]),
            step("s4", &["s0"]),
            step("s5", &["s3", "s4"]),
            step("s6", &["s2"]),
            step("s7", &["s6", "s0"]),
            step("s8", &["s7", "s5"]),
            step("s9", &[]),
        ];
        let plan = build_execution_plan(&steps).unwrap();
        assert_plan_respects_dependencies(&steps, &plan);
        assert_eq!(plan.batch(0).unwrap(), ["s0", "s2", "s9"]);
    }

    #[test]
    fn test_plan_is_deterministic() {
        let steps = vec![
            step("a", &[]),
            step("b", &["a"]),
            step("c", &["a"]),
            step("d", &["c", "b"]),
            step("e", &[]),
        ];
        let first = build_execution_plan(&steps).unwrap();
        for _ in 0..10 {
            assert_eq!(build_execution_plan(&steps).unwrap(), first);
        }
    }

    #[test]
    fn test_duplicate_dependency_entries() {
        let steps = vec![step("a", &[]), step("b", &["a", "a"])];
        let plan = build_execution_plan(&steps).unwrap();
        assert_eq!(batches(&plan), vec![vec!["a"], vec!["b"]]);
    }
}
