//! Orchestration states, events, and the transition function.
//!
//! `StateMachine` is the only writer of an `ExecutionContext`. Every event is
//! checked against the current state and any guard before anything is mutated,
//! so a rejected event leaves both the state and the context untouched.
//!
//! `CreatingCheckpoint` and `Paused` are interruptions: entering them pushes
//! the interrupted state onto the history stack, and leaving them
//! (`CheckpointWritten`, `Resume`) pops it.

use std::collections::BTreeMap;
use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stepwise_types::workflow::{
    Checkpoint, DefinitionFormat, ErrorCode, ExecutionFailure, ExecutionPlan, ExecutionStatus,
    ResultsMap, StepResult, StepStatus, WorkflowDefinition,
};
use thiserror::Error;
use uuid::Uuid;

use super::checkpoint;
use super::context::{DefinitionSource, ExecutionContext};

// ---------------------------------------------------------------------------
// States
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationState {
    Idle,
    Parsing,
    ValidatingWorkflow,
    BuildingDependencyGraph,
    SchedulingSteps,
    ExecutingSteps,
    AwaitingCompletion,
    CreatingCheckpoint,
    RestoringFromCheckpoint,
    AggregatingResults,
    Completed,
    Failed,
    Paused,
    Cancelled,
}

impl OrchestrationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrchestrationState::Completed
                | OrchestrationState::Failed
                | OrchestrationState::Cancelled
        )
    }

    /// States a run can be paused from.
    pub fn is_pausable(&self) -> bool {
        matches!(
            self,
            OrchestrationState::ExecutingSteps | OrchestrationState::AwaitingCompletion
        )
    }

    /// States a checkpoint can be taken from.
    pub fn can_checkpoint(&self) -> bool {
        matches!(
            self,
            OrchestrationState::ExecutingSteps
                | OrchestrationState::AwaitingCompletion
                | OrchestrationState::Paused
        )
    }

    /// The persisted execution status this state corresponds to.
    pub fn execution_status(&self) -> ExecutionStatus {
        match self {
            OrchestrationState::Idle => ExecutionStatus::Pending,
            OrchestrationState::Completed => ExecutionStatus::Completed,
            OrchestrationState::Failed => ExecutionStatus::Failed,
            OrchestrationState::Cancelled => ExecutionStatus::Cancelled,
            OrchestrationState::Paused => ExecutionStatus::Paused,
            _ => ExecutionStatus::Running,
        }
    }
}

impl fmt::Display for OrchestrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrchestrationState::Idle => "Idle",
            OrchestrationState::Parsing => "Parsing",
            OrchestrationState::ValidatingWorkflow => "ValidatingWorkflow",
            OrchestrationState::BuildingDependencyGraph => "BuildingDependencyGraph",
            OrchestrationState::SchedulingSteps => "SchedulingSteps",
            OrchestrationState::ExecutingSteps => "ExecutingSteps",
            OrchestrationState::AwaitingCompletion => "AwaitingCompletion",
            OrchestrationState::CreatingCheckpoint => "CreatingCheckpoint",
            OrchestrationState::RestoringFromCheckpoint => "RestoringFromCheckpoint",
            OrchestrationState::AggregatingResults => "AggregatingResults",
            OrchestrationState::Completed => "Completed",
            OrchestrationState::Failed => "Failed",
            OrchestrationState::Paused => "Paused",
            OrchestrationState::Cancelled => "Cancelled",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Everything needed to rebuild a context from a checkpoint.
#[derive(Debug, Clone)]
pub struct RestoreData {
    pub definition: WorkflowDefinition,
    pub plan: ExecutionPlan,
    pub checkpoint: Checkpoint,
    pub initial_context: BTreeMap<String, Value>,
}

#[derive(Debug, Clone)]
pub enum OrchestrationEvent {
    InitiateWorkflow {
        text: String,
        format: DefinitionFormat,
        initial_context: BTreeMap<String, Value>,
    },
    ParsedOk(WorkflowDefinition),
    ParseFailed(String),
    Valid,
    Invalid(String),
    GraphBuilt(ExecutionPlan),
    CycleDetected(String),
    Scheduled,
    BatchDispatched(Vec<String>),
    StepCompleted {
        step_id: String,
        result: Value,
        attempts: u32,
    },
    StepFailed {
        step_id: String,
        error: String,
        attempts: u32,
    },
    BatchDone,
    AllStepsSettled,
    CreateCheckpoint,
    CheckpointWritten(Uuid),
    RestoreCheckpoint(Box<RestoreData>),
    CheckpointRestored,
    ResultsReady(ResultsMap),
    Fail {
        error: String,
        code: ErrorCode,
    },
    Pause,
    Resume,
    Cancel,
    Reset,
}

impl OrchestrationEvent {
    pub fn name(&self) -> &'static str {
        match self {
            OrchestrationEvent::InitiateWorkflow { .. } => "InitiateWorkflow",
            OrchestrationEvent::ParsedOk(_) => "ParsedOk",
            OrchestrationEvent::ParseFailed(_) => "ParseFailed",
            OrchestrationEvent::Valid => "Valid",
            OrchestrationEvent::Invalid(_) => "Invalid",
            OrchestrationEvent::GraphBuilt(_) => "GraphBuilt",
            OrchestrationEvent::CycleDetected(_) => "CycleDetected",
            OrchestrationEvent::Scheduled => "Scheduled",
            OrchestrationEvent::BatchDispatched(_) => "BatchDispatched",
            OrchestrationEvent::StepCompleted { .. } => "StepCompleted",
            OrchestrationEvent::StepFailed { .. } => "StepFailed",
            OrchestrationEvent::BatchDone => "BatchDone",
            OrchestrationEvent::AllStepsSettled => "AllStepsSettled",
            OrchestrationEvent::CreateCheckpoint => "CreateCheckpoint",
            OrchestrationEvent::CheckpointWritten(_) => "CheckpointWritten",
            OrchestrationEvent::RestoreCheckpoint(_) => "RestoreCheckpoint",
            OrchestrationEvent::CheckpointRestored => "CheckpointRestored",
            OrchestrationEvent::ResultsReady(_) => "ResultsReady",
            OrchestrationEvent::Fail { .. } => "Fail",
            OrchestrationEvent::Pause => "Pause",
            OrchestrationEvent::Resume => "Resume",
            OrchestrationEvent::Cancel => "Cancel",
            OrchestrationEvent::Reset => "Reset",
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransitionError {
    /// The event has no transition out of the current state.
    #[error("invalid transition: event '{event}' is not accepted in state '{state}'")]
    InvalidTransition {
        state: OrchestrationState,
        event: &'static str,
    },

    /// The transition exists but its guard does not hold.
    #[error("event '{event}' rejected in state '{state}': {reason}")]
    GuardRejected {
        state: OrchestrationState,
        event: &'static str,
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct StateMachine {
    state: OrchestrationState,
    /// Interrupted states, most recent last.
    history: Vec<OrchestrationState>,
    ctx: ExecutionContext,
    /// Checkpoint created on entering `CreatingCheckpoint`, awaiting persistence.
    pending_checkpoint: Option<Checkpoint>,
}

impl StateMachine {
    pub fn new(execution_id: Uuid) -> Self {
        Self {
            state: OrchestrationState::Idle,
            history: Vec::new(),
            ctx: ExecutionContext::new(execution_id),
            pending_checkpoint: None,
        }
    }

    pub fn state(&self) -> OrchestrationState {
        self.state
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.ctx
    }

    /// Interrupted states, most recent first.
    pub fn history(&self) -> impl Iterator<Item = &OrchestrationState> {
        self.history.iter().rev()
    }

    pub fn pending_checkpoint(&self) -> Option<&Checkpoint> {
        self.pending_checkpoint.as_ref()
    }

    /// Apply `event`, returning the new state.
    pub fn handle(
        &mut self,
        event: OrchestrationEvent,
    ) -> Result<OrchestrationState, TransitionError> {
        use OrchestrationEvent as E;
        use OrchestrationState as S;

        let from = self.state;
        let event_name = event.name();

        let next = match (from, event) {
            (s, E::Cancel) => {
                if !s.is_terminal() {
                    self.ctx.error = Some(ExecutionFailure::new(
                        ErrorCode::Cancelled,
                        "execution cancelled",
                    ));
                    self.ctx.metrics.ended_at = Some(Utc::now());
                }
                S::Cancelled
            }

            (
                S::Idle,
                E::InitiateWorkflow {
                    text,
                    format,
                    initial_context,
                },
            ) => {
                self.ctx.source = Some(DefinitionSource { text, format });
                self.ctx.initial_context = initial_context;
                self.ctx.metrics.started_at = Some(Utc::now());
                S::Parsing
            }

            (S::Parsing, E::ParsedOk(definition)) => {
                self.ctx.load_definition(definition);
                S::ValidatingWorkflow
            }
            (S::Parsing, E::ParseFailed(reason)) => self.fail(ErrorCode::ParseError, reason),

            (S::ValidatingWorkflow, E::Valid) => {
                let has_steps = self
                    .ctx
                    .definition
                    .as_deref()
                    .is_some_and(|d| !d.steps.is_empty());
                if !has_steps {
                    return Err(self.reject(event_name, "workflow has no steps"));
                }
                S::BuildingDependencyGraph
            }
            (S::ValidatingWorkflow, E::Invalid(reason)) => {
                self.fail(ErrorCode::ValidationError, reason)
            }

            (S::BuildingDependencyGraph, E::GraphBuilt(plan)) => {
                if let Some(reason) = self.plan_mismatch(&plan) {
                    return Err(self.reject(event_name, reason));
                }
                self.ctx.plan = Some(plan);
                S::SchedulingSteps
            }
            (S::BuildingDependencyGraph, E::CycleDetected(reason)) => {
                self.fail(ErrorCode::GraphError, reason)
            }

            (S::SchedulingSteps, E::Scheduled) => {
                self.ctx.current_batch = 0;
                S::ExecutingSteps
            }

            (S::ExecutingSteps, E::BatchDispatched(step_ids)) => {
                let dispatchable = self.ctx.dispatchable_ids();
                if let Some(stray) = step_ids.iter().find(|id| !dispatchable.contains(id)) {
                    return Err(self.reject(
                        event_name,
                        format!("step '{stray}' is not dispatchable in the current batch"),
                    ));
                }
                let now = Utc::now();
                for id in &step_ids {
                    if let Some(state) = self.ctx.step_state_mut(id) {
                        state.status = StepStatus::Running;
                        state.error = None;
                        state.started_at = Some(now);
                        state.completed_at = None;
                    }
                }
                S::AwaitingCompletion
            }

            (
                S::AwaitingCompletion,
                E::StepCompleted {
                    step_id,
                    result,
                    attempts,
                },
            ) => {
                self.require_running(event_name, &step_id)?;
                if let Some(state) = self.ctx.step_state_mut(&step_id) {
                    state.status = StepStatus::Completed;
                    state.result = Some(result.clone());
                    state.error = None;
                    state.attempts = attempts;
                    state.completed_at = Some(Utc::now());
                }
                self.ctx
                    .results
                    .insert(step_id, StepResult::Completed { value: result });
                S::AwaitingCompletion
            }
            (
                S::AwaitingCompletion,
                E::StepFailed {
                    step_id,
                    error,
                    attempts,
                },
            ) => {
                self.require_running(event_name, &step_id)?;
                if let Some(state) = self.ctx.step_state_mut(&step_id) {
                    state.status = StepStatus::Failed;
                    state.result = None;
                    state.error = Some(error.clone());
                    state.attempts = attempts;
                    state.completed_at = Some(Utc::now());
                }
                self.ctx
                    .results
                    .insert(step_id, StepResult::Failed { error });
                S::AwaitingCompletion
            }

            (S::AwaitingCompletion, E::BatchDone) => {
                if self.ctx.has_running_steps() {
                    return Err(self.reject(event_name, "steps of the batch are still running"));
                }
                if self.ctx.has_fatal_failure() {
                    return Err(self.reject(event_name, "a step failed; settle the run instead"));
                }
                if self.ctx.has_more_batches() {
                    self.ctx.current_batch += 1;
                    S::ExecutingSteps
                } else {
                    S::AggregatingResults
                }
            }
            (S::AwaitingCompletion, E::AllStepsSettled) => {
                if self.ctx.has_running_steps() {
                    return Err(self.reject(event_name, "steps of the batch are still running"));
                }
                if let Some((def, state)) = self.ctx.fatal_failure() {
                    let message = format!(
                        "step '{}' failed: {}",
                        def.id,
                        state.error.as_deref().unwrap_or("unknown error")
                    );
                    self.skip_pending_steps();
                    self.fail(ErrorCode::StepFailure, message)
                } else if self.ctx.all_steps_resolved() {
                    S::AggregatingResults
                } else {
                    return Err(self.reject(event_name, "steps remain outstanding"));
                }
            }

            (s, E::CreateCheckpoint) if s.can_checkpoint() => {
                let cp = checkpoint::create_checkpoint(&self.ctx);
                self.ctx.checkpoints.push(cp.clone());
                self.pending_checkpoint = Some(cp);
                self.history.push(s);
                S::CreatingCheckpoint
            }
            (S::CreatingCheckpoint, E::CheckpointWritten(id)) => {
                if self.pending_checkpoint.as_ref().map(|c| c.id) != Some(id) {
                    return Err(self.reject(
                        event_name,
                        format!("checkpoint {id} is not the one being written"),
                    ));
                }
                let Some(previous) = self.history.last().copied() else {
                    return Err(self.reject(event_name, "no interrupted state to return to"));
                };
                self.history.pop();
                self.pending_checkpoint = None;
                previous
            }

            (S::Idle, E::RestoreCheckpoint(data)) => {
                let restored = checkpoint::restore_from_checkpoint(*data)
                    .map_err(|e| self.reject(event_name, e.to_string()))?;
                self.ctx = restored;
                S::RestoringFromCheckpoint
            }
            (S::RestoringFromCheckpoint, E::CheckpointRestored) => {
                match self.ctx.first_incomplete_batch() {
                    Some(index) => {
                        self.ctx.current_batch = index;
                        S::ExecutingSteps
                    }
                    None => {
                        self.ctx.current_batch = self
                            .ctx
                            .plan
                            .as_ref()
                            .map_or(0, |p| p.len().saturating_sub(1));
                        S::AggregatingResults
                    }
                }
            }

            (S::AggregatingResults, E::ResultsReady(results)) => {
                if let Some(reason) = self.results_mismatch(&results) {
                    return Err(self.reject(event_name, reason));
                }
                self.ctx.results = results;
                self.ctx.metrics.ended_at = Some(Utc::now());
                S::Completed
            }

            (s, E::Fail { error, code }) if !s.is_terminal() => self.fail(code, error),

            (s, E::Pause) if s.is_pausable() => {
                self.history.push(s);
                S::Paused
            }
            (S::Paused, E::Resume) => {
                let Some(previous) = self.history.pop() else {
                    return Err(self.reject(event_name, "no interrupted state to return to"));
                };
                previous
            }

            (S::Completed, E::Reset) => {
                self.ctx = ExecutionContext::new(Uuid::now_v7());
                self.history.clear();
                self.pending_checkpoint = None;
                S::Idle
            }

            (state, _) => {
                tracing::warn!(
                    execution_id = %self.ctx.execution_id,
                    %state,
                    event = event_name,
                    "invalid orchestration transition"
                );
                return Err(TransitionError::InvalidTransition {
                    state,
                    event: event_name,
                });
            }
        };

        self.ctx.refresh_metrics();
        self.state = next;
        tracing::debug!(
            execution_id = %self.ctx.execution_id,
            %from,
            event = event_name,
            to = %next,
            "orchestration transition"
        );
        Ok(next)
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn fail(&mut self, code: ErrorCode, message: impl Into<String>) -> OrchestrationState {
        self.ctx.error = Some(ExecutionFailure::new(code, message));
        self.ctx.metrics.ended_at = Some(Utc::now());
        OrchestrationState::Failed
    }

    fn reject(&self, event: &'static str, reason: impl Into<String>) -> TransitionError {
        let reason = reason.into();
        tracing::warn!(
            execution_id = %self.ctx.execution_id,
            state = %self.state,
            event,
            %reason,
            "orchestration guard rejected event"
        );
        TransitionError::GuardRejected {
            state: self.state,
            event,
            reason,
        }
    }

    fn require_running(&self, event: &'static str, step_id: &str) -> Result<(), TransitionError> {
        match self.ctx.step_state(step_id) {
            Some(state) if state.status == StepStatus::Running => Ok(()),
            Some(state) => Err(self.reject(
                event,
                format!("step '{step_id}' is {}, not running", state.status),
            )),
            None => Err(self.reject(event, format!("unknown step '{step_id}'"))),
        }
    }

    /// Mark every step that never ran as skipped.
    fn skip_pending_steps(&mut self) {
        for state in &mut self.ctx.steps {
            if state.status == StepStatus::Pending {
                state.status = StepStatus::Skipped;
            }
        }
    }

    fn plan_mismatch(&self, plan: &ExecutionPlan) -> Option<String> {
        let definition = self.ctx.definition.as_deref()?;
        if plan.step_count() != definition.steps.len() {
            return Some(format!(
                "plan covers {} steps, workflow has {}",
                plan.step_count(),
                definition.steps.len()
            ));
        }
        definition
            .steps
            .iter()
            .find(|s| plan.batch_index_of(&s.id).is_none())
            .map(|s| format!("plan does not schedule step '{}'", s.id))
    }

    fn results_mismatch(&self, results: &ResultsMap) -> Option<String> {
        let definition = self.ctx.definition.as_deref()?;
        if let Some(missing) = definition
            .steps
            .iter()
            .find(|s| !results.contains_key(&s.id))
        {
            return Some(format!("no result for step '{}'", missing.id));
        }
        results
            .keys()
            .find(|id| definition.step(id).is_none())
            .map(|id| format!("result for unknown step '{id}'"))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeSet;

    use crate::workflow::dag::build_execution_plan;
    use crate::workflow::definition::parse_workflow_json;

    fn definition(continue_on_error: bool) -> WorkflowDefinition {
        parse_workflow_json(
            &json!({
                "id": "wf",
                "name": "Workflow",
                "steps": [
                    {"id": "a", "name": "A", "agentId": "echo", "task": "x"},
                    {"id": "b", "name": "B", "agentId": "echo", "task": "y", "dependencies": ["a"], "continueOnError": continue_on_error},
                    {"id": "c", "name": "C", "agentId": "echo", "task": "z", "dependencies": ["b"]}
                ]
            })
            .to_string(),
        )
        .unwrap()
    }

    /// Drive a fresh machine up to `ExecutingSteps` for batch 0.
    fn scheduled(continue_on_error: bool) -> StateMachine {
        let def = definition(continue_on_error);
        let plan = build_execution_plan(&def.steps).unwrap();
        let mut sm = StateMachine::new(Uuid::now_v7());
        sm.handle(OrchestrationEvent::InitiateWorkflow {
            text: String::new(),
            format: DefinitionFormat::Json,
            initial_context: BTreeMap::new(),
        })
        .unwrap();
        sm.handle(OrchestrationEvent::ParsedOk(def)).unwrap();
        sm.handle(OrchestrationEvent::Valid).unwrap();
        sm.handle(OrchestrationEvent::GraphBuilt(plan)).unwrap();
        sm.handle(OrchestrationEvent::Scheduled).unwrap();
        sm
    }

    fn complete(sm: &mut StateMachine, id: &str) {
        sm.handle(OrchestrationEvent::BatchDispatched(vec![id.to_string()]))
            .unwrap();
        sm.handle(OrchestrationEvent::StepCompleted {
            step_id: id.to_string(),
            result: json!({ "step": id }),
            attempts: 1,
        })
        .unwrap();
    }

    #[test]
    fn test_happy_path_reaches_completed() {
        let mut sm = scheduled(false);
        assert_eq!(sm.state(), OrchestrationState::ExecutingSteps);

        for id in ["a", "b"] {
            complete(&mut sm, id);
            assert_eq!(
                sm.handle(OrchestrationEvent::BatchDone).unwrap(),
                OrchestrationState::ExecutingSteps
            );
        }
        complete(&mut sm, "c");
        assert_eq!(
            sm.handle(OrchestrationEvent::AllStepsSettled).unwrap(),
            OrchestrationState::AggregatingResults
        );

        let results = sm.context().results.clone();
        assert_eq!(
            sm.handle(OrchestrationEvent::ResultsReady(results)).unwrap(),
            OrchestrationState::Completed
        );
        assert_eq!(sm.context().completed_count(), 3);
        assert!(sm.context().metrics.duration_ms().is_some());
    }

    #[test]
    fn test_invalid_event_leaves_machine_unchanged() {
        let mut sm = StateMachine::new(Uuid::now_v7());
        let before = sm.context().clone();

        let err = sm.handle(OrchestrationEvent::Valid).unwrap_err();
        assert_eq!(
            err,
            TransitionError::InvalidTransition {
                state: OrchestrationState::Idle,
                event: "Valid",
            }
        );
        assert_eq!(sm.state(), OrchestrationState::Idle);
        assert_eq!(sm.context(), &before);
    }

    fn parsing() -> StateMachine {
        let mut sm = StateMachine::new(Uuid::now_v7());
        sm.handle(OrchestrationEvent::InitiateWorkflow {
            text: String::new(),
            format: DefinitionFormat::Json,
            initial_context: BTreeMap::new(),
        })
        .unwrap();
        sm
    }

    fn awaiting() -> StateMachine {
        let mut sm = scheduled(false);
        sm.handle(OrchestrationEvent::BatchDispatched(vec!["a".to_string()]))
            .unwrap();
        sm
    }

    fn creating_checkpoint() -> StateMachine {
        let mut sm = awaiting();
        sm.handle(OrchestrationEvent::CreateCheckpoint).unwrap();
        sm
    }

    fn after(event: OrchestrationEvent) -> StateMachine {
        let mut sm = scheduled(false);
        sm.handle(event).unwrap();
        sm
    }

    fn completed() -> StateMachine {
        let mut sm = scheduled(false);
        for id in ["a", "b", "c"] {
            complete(&mut sm, id);
            sm.handle(OrchestrationEvent::BatchDone).unwrap();
        }
        let results = sm.context().results.clone();
        sm.handle(OrchestrationEvent::ResultsReady(results)).unwrap();
        sm
    }

    #[test]
    fn test_illegal_events_leave_every_state_unchanged() {
        use OrchestrationEvent as E;

        let fail = || E::Fail {
            error: "boom".to_string(),
            code: ErrorCode::StepFailure,
        };
        let step_done = || E::StepCompleted {
            step_id: "a".to_string(),
            result: json!(1),
            attempts: 1,
        };
        let cases: Vec<(StateMachine, Vec<OrchestrationEvent>)> = vec![
            (
                StateMachine::new(Uuid::now_v7()),
                vec![E::BatchDone, E::CheckpointRestored, E::Resume, E::CreateCheckpoint],
            ),
            (parsing(), vec![E::Scheduled, E::BatchDone, E::Reset]),
            (
                scheduled(false),
                vec![
                    E::BatchDone,
                    E::ResultsReady(ResultsMap::new()),
                    E::CheckpointWritten(Uuid::nil()),
                    E::Resume,
                ],
            ),
            (
                awaiting(),
                vec![E::BatchDispatched(vec!["b".to_string()]), E::Scheduled, E::Reset],
            ),
            (
                creating_checkpoint(),
                vec![E::Pause, E::CreateCheckpoint, E::BatchDone, step_done()],
            ),
            (
                after(E::Pause),
                vec![E::BatchDone, E::Pause, E::BatchDispatched(vec!["a".to_string()])],
            ),
            (completed(), vec![fail(), E::Pause, E::CreateCheckpoint, E::Resume]),
            (after(fail()), vec![fail(), E::Reset, E::Resume, E::BatchDone]),
            (after(E::Cancel), vec![E::Reset, fail(), E::Resume, step_done()]),
        ];

        for (mut sm, events) in cases {
            let state = sm.state();
            let context = sm.context().clone();
            let history: Vec<_> = sm.history().copied().collect();
            let pending = sm.pending_checkpoint().cloned();

            for event in events {
                let name = event.name();
                let err = sm.handle(event).unwrap_err();
                assert_eq!(
                    err,
                    TransitionError::InvalidTransition { state, event: name },
                    "{name} in {state}"
                );
                assert_eq!(sm.state(), state, "{name} in {state}");
                assert_eq!(sm.context(), &context, "{name} in {state}");
                assert_eq!(sm.history().copied().collect::<Vec<_>>(), history);
                assert_eq!(sm.pending_checkpoint(), pending.as_ref());
            }
        }
    }

    #[test]
    fn test_pause_rejected_outside_execution() {
        let mut sm = StateMachine::new(Uuid::now_v7());
        assert!(sm.handle(OrchestrationEvent::Pause).is_err());
        assert_eq!(sm.state(), OrchestrationState::Idle);
    }

    #[test]
    fn test_parse_failure_sets_error_code() {
        let mut sm = StateMachine::new(Uuid::now_v7());
        sm.handle(OrchestrationEvent::InitiateWorkflow {
            text: "{".to_string(),
            format: DefinitionFormat::Json,
            initial_context: BTreeMap::new(),
        })
        .unwrap();
        sm.handle(OrchestrationEvent::ParseFailed("unexpected eof".to_string()))
            .unwrap();
        assert_eq!(sm.state(), OrchestrationState::Failed);
        assert_eq!(
            sm.context().error.as_ref().unwrap().code,
            ErrorCode::ParseError
        );
    }

    #[test]
    fn test_valid_guard_requires_steps() {
        let mut sm = StateMachine::new(Uuid::now_v7());
        sm.handle(OrchestrationEvent::InitiateWorkflow {
            text: String::new(),
            format: DefinitionFormat::Json,
            initial_context: BTreeMap::new(),
        })
        .unwrap();
        let mut def = definition(false);
        def.steps.clear();
        sm.handle(OrchestrationEvent::ParsedOk(def)).unwrap();

        let err = sm.handle(OrchestrationEvent::Valid).unwrap_err();
        assert!(matches!(err, TransitionError::GuardRejected { .. }));
        assert_eq!(sm.state(), OrchestrationState::ValidatingWorkflow);
    }

    #[test]
    fn test_dispatch_outside_current_batch_rejected() {
        let mut sm = scheduled(false);
        let err = sm
            .handle(OrchestrationEvent::BatchDispatched(vec!["c".to_string()]))
            .unwrap_err();
        assert!(matches!(err, TransitionError::GuardRejected { .. }));
        assert_eq!(sm.state(), OrchestrationState::ExecutingSteps);
    }

    #[test]
    fn test_pause_and_resume_return_to_interrupted_state() {
        let mut sm = scheduled(false);
        sm.handle(OrchestrationEvent::BatchDispatched(vec!["a".to_string()]))
            .unwrap();
        sm.handle(OrchestrationEvent::Pause).unwrap();
        assert_eq!(sm.state(), OrchestrationState::Paused);
        assert_eq!(
            sm.history().next(),
            Some(&OrchestrationState::AwaitingCompletion)
        );

        assert_eq!(
            sm.handle(OrchestrationEvent::Resume).unwrap(),
            OrchestrationState::AwaitingCompletion
        );
        assert_eq!(sm.history().count(), 0);
    }

    #[test]
    fn test_checkpoint_round_trip_through_history() {
        let mut sm = scheduled(false);
        complete(&mut sm, "a");

        sm.handle(OrchestrationEvent::CreateCheckpoint).unwrap();
        assert_eq!(sm.state(), OrchestrationState::CreatingCheckpoint);
        let cp = sm.pending_checkpoint().unwrap().clone();
        assert_eq!(cp.completed, BTreeSet::from(["a".to_string()]));
        assert_eq!(
            cp.pending,
            BTreeSet::from(["b".to_string(), "c".to_string()])
        );

        let wrong = sm.handle(OrchestrationEvent::CheckpointWritten(Uuid::now_v7()));
        assert!(wrong.is_err());

        assert_eq!(
            sm.handle(OrchestrationEvent::CheckpointWritten(cp.id)).unwrap(),
            OrchestrationState::AwaitingCompletion
        );
        assert!(sm.pending_checkpoint().is_none());
        assert_eq!(sm.context().checkpoints.len(), 1);
    }

    #[test]
    fn test_checkpoint_not_allowed_while_scheduling() {
        let def = definition(false);
        let plan = build_execution_plan(&def.steps).unwrap();
        let mut sm = StateMachine::new(Uuid::now_v7());
        sm.handle(OrchestrationEvent::InitiateWorkflow {
            text: String::new(),
            format: DefinitionFormat::Json,
            initial_context: BTreeMap::new(),
        })
        .unwrap();
        sm.handle(OrchestrationEvent::ParsedOk(def)).unwrap();
        sm.handle(OrchestrationEvent::Valid).unwrap();
        sm.handle(OrchestrationEvent::GraphBuilt(plan)).unwrap();

        assert!(matches!(
            sm.handle(OrchestrationEvent::CreateCheckpoint),
            Err(TransitionError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_fatal_failure_skips_remaining_steps() {
        let mut sm = scheduled(false);
        complete(&mut sm, "a");
        sm.handle(OrchestrationEvent::BatchDone).unwrap();

        sm.handle(OrchestrationEvent::BatchDispatched(vec!["b".to_string()]))
            .unwrap();
        sm.handle(OrchestrationEvent::StepFailed {
            step_id: "b".to_string(),
            error: "connection refused".to_string(),
            attempts: 3,
        })
        .unwrap();

        assert!(matches!(
            sm.handle(OrchestrationEvent::BatchDone),
            Err(TransitionError::GuardRejected { .. })
        ));
        assert_eq!(
            sm.handle(OrchestrationEvent::AllStepsSettled).unwrap(),
            OrchestrationState::Failed
        );

        let ctx = sm.context();
        let error = ctx.error.as_ref().unwrap();
        assert_eq!(error.code, ErrorCode::StepFailure);
        assert!(error.message.contains("connection refused"));
        assert_eq!(ctx.step_state("c").unwrap().status, StepStatus::Skipped);
        assert_eq!(ctx.step_state("b").unwrap().attempts, 3);
        assert!(ctx.results["a"].value().is_some());
        assert!(!ctx.results.contains_key("c"));
        assert_eq!(ctx.metrics.skipped_steps, 1);
    }

    #[test]
    fn test_continue_on_error_failure_keeps_running() {
        let mut sm = scheduled(true);
        complete(&mut sm, "a");
        sm.handle(OrchestrationEvent::BatchDone).unwrap();
        sm.handle(OrchestrationEvent::BatchDispatched(vec!["b".to_string()]))
            .unwrap();
        sm.handle(OrchestrationEvent::StepFailed {
            step_id: "b".to_string(),
            error: "flaky".to_string(),
            attempts: 1,
        })
        .unwrap();
        assert_eq!(
            sm.handle(OrchestrationEvent::BatchDone).unwrap(),
            OrchestrationState::ExecutingSteps
        );
        complete(&mut sm, "c");
        assert_eq!(
            sm.handle(OrchestrationEvent::AllStepsSettled).unwrap(),
            OrchestrationState::AggregatingResults
        );
        assert!(sm.context().results["b"].is_failure());
    }

    #[test]
    fn test_settle_rejected_while_steps_outstanding() {
        let mut sm = scheduled(false);
        complete(&mut sm, "a");
        assert!(matches!(
            sm.handle(OrchestrationEvent::AllStepsSettled),
            Err(TransitionError::GuardRejected { .. })
        ));
    }

    #[test]
    fn test_results_ready_requires_every_step() {
        let mut sm = scheduled(false);
        for id in ["a", "b"] {
            complete(&mut sm, id);
            sm.handle(OrchestrationEvent::BatchDone).unwrap();
        }
        complete(&mut sm, "c");
        sm.handle(OrchestrationEvent::BatchDone).unwrap();
        assert_eq!(sm.state(), OrchestrationState::AggregatingResults);

        let mut partial = sm.context().results.clone();
        partial.remove("b");
        assert!(sm.handle(OrchestrationEvent::ResultsReady(partial)).is_err());
        assert_eq!(sm.state(), OrchestrationState::AggregatingResults);
    }

    #[test]
    fn test_fail_event_carries_code() {
        let mut sm = scheduled(false);
        sm.handle(OrchestrationEvent::Fail {
            error: "disk full".to_string(),
            code: ErrorCode::StoreError,
        })
        .unwrap();
        assert_eq!(sm.state(), OrchestrationState::Failed);
        assert!(sm.handle(OrchestrationEvent::Fail {
            error: "again".to_string(),
            code: ErrorCode::StoreError,
        })
        .is_err());
    }

    #[test]
    fn test_cancel_accepted_from_any_state() {
        let mut idle = StateMachine::new(Uuid::now_v7());
        assert_eq!(
            idle.handle(OrchestrationEvent::Cancel).unwrap(),
            OrchestrationState::Cancelled
        );

        let mut running = scheduled(false);
        running
            .handle(OrchestrationEvent::BatchDispatched(vec!["a".to_string()]))
            .unwrap();
        assert_eq!(
            running.handle(OrchestrationEvent::Cancel).unwrap(),
            OrchestrationState::Cancelled
        );
        assert_eq!(
            running.context().error.as_ref().unwrap().code,
            ErrorCode::Cancelled
        );
    }

    #[test]
    fn test_reset_only_from_completed() {
        let mut sm = scheduled(false);
        assert!(sm.handle(OrchestrationEvent::Reset).is_err());

        for id in ["a", "b", "c"] {
            complete(&mut sm, id);
            sm.handle(OrchestrationEvent::BatchDone).unwrap();
        }
        let results = sm.context().results.clone();
        sm.handle(OrchestrationEvent::ResultsReady(results)).unwrap();

        let old_id = sm.context().execution_id;
        assert_eq!(
            sm.handle(OrchestrationEvent::Reset).unwrap(),
            OrchestrationState::Idle
        );
        assert_ne!(sm.context().execution_id, old_id);
        assert!(sm.context().results.is_empty());
    }

    #[test]
    fn test_restore_resumes_first_incomplete_batch() {
        let mut sm = scheduled(false);
        complete(&mut sm, "a");
        sm.handle(OrchestrationEvent::CreateCheckpoint).unwrap();
        let cp = sm.pending_checkpoint().unwrap().clone();

        let def = definition(false);
        let plan = build_execution_plan(&def.steps).unwrap();
        let mut restored = StateMachine::new(cp.execution_id);
        restored
            .handle(OrchestrationEvent::RestoreCheckpoint(Box::new(RestoreData {
                definition: def,
                plan,
                checkpoint: cp.clone(),
                initial_context: BTreeMap::new(),
            })))
            .unwrap();
        assert_eq!(
            restored
                .handle(OrchestrationEvent::CheckpointRestored)
                .unwrap(),
            OrchestrationState::ExecutingSteps
        );
        let ctx = restored.context();
        assert_eq!(ctx.execution_id, cp.execution_id);
        assert_eq!(ctx.current_batch, 1);
        assert_eq!(ctx.dispatchable_ids(), vec!["b".to_string()]);
        assert_eq!(ctx.results, cp.results);
    }

    #[test]
    fn test_restore_of_finished_checkpoint_goes_to_aggregation() {
        let mut sm = scheduled(false);
        for id in ["a", "b", "c"] {
            complete(&mut sm, id);
            if id != "c" {
                sm.handle(OrchestrationEvent::BatchDone).unwrap();
            }
        }
        sm.handle(OrchestrationEvent::CreateCheckpoint).unwrap();
        let cp = sm.pending_checkpoint().unwrap().clone();

        let def = definition(false);
        let plan = build_execution_plan(&def.steps).unwrap();
        let mut restored = StateMachine::new(cp.execution_id);
        restored
            .handle(OrchestrationEvent::RestoreCheckpoint(Box::new(RestoreData {
                definition: def,
                plan,
                checkpoint: cp,
                initial_context: BTreeMap::new(),
            })))
            .unwrap();
        assert_eq!(
            restored
                .handle(OrchestrationEvent::CheckpointRestored)
                .unwrap(),
            OrchestrationState::AggregatingResults
        );
    }

    #[test]
    fn test_execution_status_mapping() {
        assert_eq!(
            OrchestrationState::AwaitingCompletion.execution_status(),
            ExecutionStatus::Running
        );
        assert_eq!(
            OrchestrationState::Paused.execution_status(),
            ExecutionStatus::Paused
        );
        assert_eq!(OrchestrationState::Failed.to_string(), "Failed");
    }
}
