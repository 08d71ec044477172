//! Per-execution runtime state.
//!
//! `ExecutionContext` is owned by a single `StateMachine` and is only written
//! by its transitions. Step runtime state is kept in a vector parallel to the
//! definition's step list, so index `i` of `steps` describes `definition.steps[i]`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde_json::Value;
use stepwise_types::workflow::{
    Checkpoint, DefinitionFormat, ExecutionFailure, ExecutionMetrics, ExecutionPlan, ResultsMap,
    StepDefinition, StepResult, StepRuntimeState, StepStatus, WorkflowDefinition,
};
use uuid::Uuid;

/// Raw definition document awaiting parsing.
#[derive(Debug, Clone, PartialEq)]
pub struct DefinitionSource {
    pub text: String,
    pub format: DefinitionFormat,
}

/// Mutable runtime state of one execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionContext {
    pub execution_id: Uuid,
    pub source: Option<DefinitionSource>,
    pub definition: Option<Arc<WorkflowDefinition>>,
    /// Caller-supplied context, overlaid on the definition's own `context`.
    pub initial_context: BTreeMap<String, Value>,
    pub steps: Vec<StepRuntimeState>,
    pub plan: Option<ExecutionPlan>,
    pub current_batch: usize,
    pub results: ResultsMap,
    pub error: Option<ExecutionFailure>,
    pub metrics: ExecutionMetrics,
    /// Checkpoints taken during this session, oldest first.
    pub checkpoints: Vec<Checkpoint>,
}

impl ExecutionContext {
    pub fn new(execution_id: Uuid) -> Self {
        Self {
            execution_id,
            source: None,
            definition: None,
            initial_context: BTreeMap::new(),
            steps: Vec::new(),
            plan: None,
            current_batch: 0,
            results: ResultsMap::new(),
            error: None,
            metrics: ExecutionMetrics::default(),
            checkpoints: Vec::new(),
        }
    }

    /// Attach a parsed definition and reset every step to pending.
    pub(crate) fn load_definition(&mut self, definition: WorkflowDefinition) {
        self.steps = vec![StepRuntimeState::default(); definition.steps.len()];
        self.metrics.total_steps = definition.steps.len() as u32;
        self.definition = Some(Arc::new(definition));
        self.refresh_metrics();
    }

    pub fn workflow_id(&self) -> Option<&str> {
        self.definition.as_deref().map(|d| d.id.as_str())
    }

    /// Definition and runtime state of every step, in declaration order.
    pub fn step_entries(&self) -> impl Iterator<Item = (&StepDefinition, &StepRuntimeState)> {
        self.definition
            .iter()
            .flat_map(|d| d.steps.iter())
            .zip(self.steps.iter())
    }

    pub fn step_state(&self, step_id: &str) -> Option<&StepRuntimeState> {
        let index = self.definition.as_deref()?.step_index(step_id)?;
        self.steps.get(index)
    }

    pub(crate) fn step_state_mut(&mut self, step_id: &str) -> Option<&mut StepRuntimeState> {
        let index = self.definition.as_deref()?.step_index(step_id)?;
        self.steps.get_mut(index)
    }

    // -----------------------------------------------------------------------
    // Batch bookkeeping
    // -----------------------------------------------------------------------

    /// Step IDs of the batch currently being executed.
    pub fn current_batch_ids(&self) -> &[String] {
        self.plan
            .as_ref()
            .and_then(|p| p.batch(self.current_batch))
            .unwrap_or(&[])
    }

    /// Members of the current batch that have not completed yet.
    ///
    /// After a restore this excludes steps the checkpoint already covers.
    pub fn dispatchable_ids(&self) -> Vec<String> {
        self.current_batch_ids()
            .iter()
            .filter(|id| {
                self.step_state(id)
                    .is_some_and(|s| s.status != StepStatus::Completed)
            })
            .cloned()
            .collect()
    }

    /// Whether a batch follows the current one.
    pub fn has_more_batches(&self) -> bool {
        self.plan
            .as_ref()
            .is_some_and(|p| self.current_batch + 1 < p.len())
    }

    /// Index of the first batch that still has a non-completed step.
    pub fn first_incomplete_batch(&self) -> Option<usize> {
        let plan = self.plan.as_ref()?;
        plan.batches.iter().position(|batch| {
            batch.iter().any(|id| {
                self.step_state(id)
                    .is_none_or(|s| s.status != StepStatus::Completed)
            })
        })
    }

    /// Whether any step is still in flight.
    pub fn has_running_steps(&self) -> bool {
        self.steps.iter().any(|s| s.status == StepStatus::Running)
    }

    /// First failed step not marked `continueOnError`, in declaration order.
    pub fn fatal_failure(&self) -> Option<(&StepDefinition, &StepRuntimeState)> {
        self.step_entries()
            .find(|(def, state)| state.status == StepStatus::Failed && !def.continue_on_error)
    }

    pub fn has_fatal_failure(&self) -> bool {
        self.fatal_failure().is_some()
    }

    /// Every step is completed, or failed while marked `continueOnError`.
    pub fn all_steps_resolved(&self) -> bool {
        self.definition.is_some()
            && self.step_entries().all(|(def, state)| match state.status {
                StepStatus::Completed => true,
                StepStatus::Failed => def.continue_on_error,
                _ => false,
            })
    }

    // -----------------------------------------------------------------------
    // Views
    // -----------------------------------------------------------------------

    /// IDs of steps whose status is `status`.
    pub fn ids_with_status(&self, status: StepStatus) -> BTreeSet<String> {
        self.step_entries()
            .filter(|(_, state)| state.status == status)
            .map(|(def, _)| def.id.clone())
            .collect()
    }

    /// IDs of steps that are not completed.
    pub fn unfinished_ids(&self) -> BTreeSet<String> {
        self.step_entries()
            .filter(|(_, state)| state.status != StepStatus::Completed)
            .map(|(def, _)| def.id.clone())
            .collect()
    }

    /// Definition context overlaid with the caller's initial context.
    pub fn merged_context(&self) -> BTreeMap<String, Value> {
        let mut merged = self
            .definition
            .as_deref()
            .map(|d| d.context.clone())
            .unwrap_or_default();
        merged.extend(
            self.initial_context
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        merged
    }

    /// Values produced by completed steps, keyed by step ID.
    pub fn prior_results(&self) -> BTreeMap<String, Value> {
        self.results
            .iter()
            .filter_map(|(id, result)| match result {
                StepResult::Completed { value } => Some((id.clone(), value.clone())),
                StepResult::Failed { .. } => None,
            })
            .collect()
    }

    pub fn completed_count(&self) -> u32 {
        self.metrics.completed_steps
    }

    pub fn total_count(&self) -> u32 {
        self.metrics.total_steps
    }

    pub(crate) fn refresh_metrics(&mut self) {
        let count = |status: StepStatus| {
            self.steps.iter().filter(|s| s.status == status).count() as u32
        };
        self.metrics.completed_steps = count(StepStatus::Completed);
        self.metrics.failed_steps = count(StepStatus::Failed);
        self.metrics.skipped_steps = count(StepStatus::Skipped);
    }
}
