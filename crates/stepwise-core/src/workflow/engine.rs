//! Workflow engine: the public facade that drives a run end to end.
//!
//! `WorkflowEngine` owns the step executor registry, the batch executor and a
//! `CheckpointManager`. Each call to `execute` or `resume` creates one
//! `StateMachine` and drives it on the caller's task:
//!
//! 1. Parse, validate, and plan the definition (new runs), or restore the
//!    context from a checkpoint (resumed runs).
//! 2. Persist the workflow, execution and step records.
//! 3. For each batch: dispatch, wait at the batch barrier, feed every step
//!    outcome back into the state machine, checkpoint the settled batch.
//! 4. Aggregate results and write the final execution record.
//!
//! Pause and cancel are signalled through per-run handles and observed between
//! batches. A run that fails is not an `EngineError`: it comes back as a
//! `RunReport` in state `Failed` carrying a stable `ErrorCode`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use serde_json::Value;
use stepwise_types::config::EngineConfig;
use stepwise_types::event::WorkflowEvent;
use stepwise_types::workflow::{
    DefinitionFormat, ErrorCode, ExecutionFailure, ExecutionMetrics, ExecutionStatus, ResultsMap,
    StepDefinition, WorkflowDefinition,
};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::batch::{BatchExecutor, BatchSnapshot, StepOutcome};
use super::checkpoint::{CheckpointError, CheckpointManager, execution_definition};
use super::dag::build_execution_plan;
use super::definition::{WorkflowError, deserialize_definition, validate_definition};
use super::executor::ExecutorRegistry;
use super::state::{
    OrchestrationEvent, OrchestrationState, RestoreData, StateMachine, TransitionError,
};
use crate::event::bus::{EventBus, ExecutionEvents};
use crate::repository::checkpoint::CheckpointStore;

/// Code attached to runs aborted by an orchestration protocol error.
const INVALID_TRANSITION_CODE: &str = "INVALID_TRANSITION";

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Outcome of `execute` / `resume`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub execution_id: Uuid,
    /// `None` when the definition never parsed.
    pub workflow_id: Option<String>,
    /// `Completed`, `Failed`, `Cancelled` or `Paused`.
    pub state: OrchestrationState,
    /// Results accumulated so far; partial unless `state` is `Completed`.
    pub results: ResultsMap,
    pub error: Option<ExecutionFailure>,
    pub metrics: ExecutionMetrics,
    /// Most recent checkpoint known to this run.
    pub last_checkpoint: Option<Uuid>,
}

impl RunReport {
    fn from_machine(sm: &StateMachine) -> Self {
        let ctx = sm.context();
        Self {
            execution_id: ctx.execution_id,
            workflow_id: ctx.workflow_id().map(str::to_string),
            state: sm.state(),
            results: ctx.results.clone(),
            error: ctx.error.clone(),
            metrics: ctx.metrics.clone(),
            last_checkpoint: ctx.checkpoints.last().map(|c| c.id),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.state == OrchestrationState::Completed
    }

    pub fn error_code(&self) -> Option<&ErrorCode> {
        self.error.as_ref().map(|e| &e.code)
    }
}

/// Answer to `get_status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionStatusReport {
    pub execution_id: Uuid,
    pub status: ExecutionStatus,
    /// Live orchestration state; `None` once the run is no longer in memory.
    pub state: Option<OrchestrationState>,
    pub completed_count: u32,
    pub total_count: u32,
    pub error: Option<ExecutionFailure>,
}

impl ExecutionStatusReport {
    fn live(sm: &StateMachine) -> Self {
        let ctx = sm.context();
        Self {
            execution_id: ctx.execution_id,
            status: sm.state().execution_status(),
            state: Some(sm.state()),
            completed_count: ctx.completed_count(),
            total_count: ctx.total_count(),
            error: ctx.error.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors returned to callers of the engine.
///
/// Run failures (parse, validation, cycle, step failure) are reported through
/// `RunReport` instead.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),

    #[error("checkpoint not found: {0}")]
    CheckpointNotFound(Uuid),

    #[error("execution {0} has no checkpoint")]
    NoCheckpoint(Uuid),

    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("execution {id} cannot be resumed from status '{status}'")]
    NotResumable { id: Uuid, status: ExecutionStatus },

    #[error("execution {0} is already running")]
    AlreadyRunning(Uuid),

    #[error("workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("checkpoint store error: {0}")]
    Store(CheckpointError),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

impl From<CheckpointError> for EngineError {
    fn from(err: CheckpointError) -> Self {
        match err {
            CheckpointError::CheckpointNotFound(id) => EngineError::CheckpointNotFound(id),
            CheckpointError::ExecutionNotFound(id) => EngineError::ExecutionNotFound(id),
            CheckpointError::WorkflowNotFound(id) => EngineError::WorkflowNotFound(id),
            other => EngineError::Store(other),
        }
    }
}

/// Failures that abort a run once it is underway.
#[derive(Debug, thiserror::Error)]
enum DriveError {
    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Store(#[from] CheckpointError),
}

impl DriveError {
    fn code(&self) -> ErrorCode {
        match self {
            DriveError::Transition(_) => ErrorCode::from(INVALID_TRANSITION_CODE),
            DriveError::Store(_) => ErrorCode::StoreError,
        }
    }
}

// ---------------------------------------------------------------------------
// Run handles
// ---------------------------------------------------------------------------

/// Caller-side view of an active run.
struct RunHandle {
    cancel: CancellationToken,
    pause: Arc<AtomicBool>,
    status: watch::Receiver<ExecutionStatusReport>,
}

/// Driver-side view of an active run.
struct RunControl {
    cancel: CancellationToken,
    pause: Arc<AtomicBool>,
    status: watch::Sender<ExecutionStatusReport>,
}

impl RunControl {
    fn publish(&self, sm: &StateMachine) {
        self.status.send_replace(ExecutionStatusReport::live(sm));
    }

    fn pause_requested(&self) -> bool {
        self.pause.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// Orchestrates workflow runs against a checkpoint store.
///
/// Generic over `S: CheckpointStore` for storage flexibility.
pub struct WorkflowEngine<S: CheckpointStore> {
    checkpoint: CheckpointManager<S>,
    batch_executor: BatchExecutor,
    event_bus: EventBus,
    config: EngineConfig,
    runs: DashMap<Uuid, RunHandle>,
}

impl<S: CheckpointStore + 'static> WorkflowEngine<S> {
    pub fn new(store: S, registry: ExecutorRegistry, config: EngineConfig) -> Self {
        let event_bus = EventBus::new(config.event_capacity);
        let batch_executor = BatchExecutor::new(Arc::new(registry), &config, event_bus.clone());
        Self {
            checkpoint: CheckpointManager::new(store),
            batch_executor,
            event_bus,
            config,
            runs: DashMap::new(),
        }
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    /// Subscribe to lifecycle events of every run.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.event_bus.subscribe()
    }

    /// Follow the events of one execution until it pauses or ends.
    pub fn subscribe_execution(&self, execution_id: Uuid) -> ExecutionEvents {
        self.event_bus.subscribe_execution(execution_id)
    }

    pub fn store(&self) -> &S {
        self.checkpoint.store()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// IDs of runs currently driven by this engine.
    pub fn active_executions(&self) -> Vec<Uuid> {
        self.runs.iter().map(|r| *r.key()).collect()
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    /// Run a workflow definition from the beginning under a fresh execution ID.
    pub async fn execute(
        &self,
        text: &str,
        format: DefinitionFormat,
        initial_context: BTreeMap<String, Value>,
    ) -> Result<RunReport, EngineError> {
        self.execute_as(Uuid::now_v7(), text, format, initial_context)
            .await
    }

    /// Run a workflow definition under a caller-chosen execution ID, so the
    /// caller can pause, cancel or poll the run while it is in flight.
    pub async fn execute_as(
        &self,
        execution_id: Uuid,
        text: &str,
        format: DefinitionFormat,
        initial_context: BTreeMap<String, Value>,
    ) -> Result<RunReport, EngineError> {
        let control = self.register_run(execution_id)?;
        let mut sm = StateMachine::new(execution_id);
        control.publish(&sm);

        let result = self
            .run_new(&mut sm, &control, text, format, initial_context)
            .await;
        self.runs.remove(&execution_id);
        result
    }

    /// Resume the execution a checkpoint belongs to.
    ///
    /// Completed steps keep their stored results; every other step is
    /// dispatched again, starting at the first batch with unfinished work.
    pub async fn resume(&self, checkpoint_id: Uuid) -> Result<RunReport, EngineError> {
        let checkpoint = self.checkpoint.load_checkpoint(checkpoint_id).await?;
        let execution_id = checkpoint.execution_id;
        let record = self.checkpoint.load_execution(execution_id).await?;
        if matches!(
            record.status,
            ExecutionStatus::Completed | ExecutionStatus::Cancelled
        ) {
            return Err(EngineError::NotResumable {
                id: execution_id,
                status: record.status,
            });
        }

        let definition = execution_definition(&record)?;
        let plan = build_execution_plan(&definition.steps)?;

        let control = self.register_run(execution_id)?;
        let data = RestoreData {
            definition,
            plan,
            checkpoint,
            initial_context: record.context,
        };
        let result = self.run_restored(data, &control).await;
        self.runs.remove(&execution_id);
        result
    }

    /// Resume an execution from its most recent checkpoint.
    pub async fn resume_latest(&self, execution_id: Uuid) -> Result<RunReport, EngineError> {
        let checkpoint = self
            .checkpoint
            .latest_checkpoint(execution_id)
            .await?
            .ok_or(EngineError::NoCheckpoint(execution_id))?;
        self.resume(checkpoint.id).await
    }

    /// Ask an active run to pause.
    ///
    /// The in-flight batch settles first; no further batch is dispatched, a
    /// checkpoint is written and the run returns a `Paused` report.
    pub async fn pause(&self, execution_id: Uuid) -> Result<(), EngineError> {
        let pause = self
            .runs
            .get(&execution_id)
            .map(|h| Arc::clone(&h.pause))
            .ok_or(EngineError::ExecutionNotFound(execution_id))?;
        pause.store(true, Ordering::SeqCst);

        tracing::info!(execution_id = %execution_id, "pause requested");
        Ok(())
    }

    /// Cancel an execution.
    ///
    /// Active runs are signalled and stop dispatching immediately; in-flight
    /// step invocations are interrupted on a best-effort basis. Paused or
    /// crashed executions are marked cancelled in the store. Cancelling a
    /// finished execution is a no-op.
    pub async fn cancel(&self, execution_id: Uuid) -> Result<(), EngineError> {
        let token = self.runs.get(&execution_id).map(|h| h.cancel.clone());
        if let Some(token) = token {
            token.cancel();
            tracing::info!(execution_id = %execution_id, "cancellation requested");
            return Ok(());
        }

        let record = self.checkpoint.load_execution(execution_id).await?;
        if record.status.is_terminal() {
            return Ok(());
        }
        self.checkpoint
            .mark_status(execution_id, ExecutionStatus::Cancelled)
            .await?;
        self.event_bus
            .publish(WorkflowEvent::RunCancelled { execution_id });

        tracing::info!(execution_id = %execution_id, "cancelled inactive execution");
        Ok(())
    }

    /// Current state and progress of an execution.
    ///
    /// Answered from the live run while it is active, from the execution
    /// record afterwards.
    pub async fn get_status(
        &self,
        execution_id: Uuid,
    ) -> Result<ExecutionStatusReport, EngineError> {
        let live = self
            .runs
            .get(&execution_id)
            .map(|h| h.status.borrow().clone());
        if let Some(status) = live {
            return Ok(status);
        }

        let record = self.checkpoint.load_execution(execution_id).await?;
        Ok(ExecutionStatusReport {
            execution_id,
            status: record.status,
            state: None,
            completed_count: record.completed_count,
            total_count: record.total_count,
            error: record.error,
        })
    }

    // -----------------------------------------------------------------------
    // Run setup
    // -----------------------------------------------------------------------

    fn register_run(&self, execution_id: Uuid) -> Result<RunControl, EngineError> {
        match self.runs.entry(execution_id) {
            Entry::Occupied(_) => Err(EngineError::AlreadyRunning(execution_id)),
            Entry::Vacant(slot) => {
                let cancel = CancellationToken::new();
                let pause = Arc::new(AtomicBool::new(false));
                let sm = StateMachine::new(execution_id);
                let (status_tx, status_rx) = watch::channel(ExecutionStatusReport::live(&sm));
                slot.insert(RunHandle {
                    cancel: cancel.clone(),
                    pause: Arc::clone(&pause),
                    status: status_rx,
                });
                Ok(RunControl {
                    cancel,
                    pause,
                    status: status_tx,
                })
            }
        }
    }

    async fn run_new(
        &self,
        sm: &mut StateMachine,
        control: &RunControl,
        text: &str,
        format: DefinitionFormat,
        initial_context: BTreeMap<String, Value>,
    ) -> Result<RunReport, EngineError> {
        use OrchestrationEvent as E;

        sm.handle(E::InitiateWorkflow {
            text: text.to_string(),
            format,
            initial_context,
        })?;

        let definition = match deserialize_definition(text, format) {
            Ok(definition) => definition,
            Err(e) => {
                sm.handle(E::ParseFailed(e.to_string()))?;
                return Ok(self.finish(sm, control, false).await);
            }
        };
        sm.handle(E::ParsedOk(definition.clone()))?;

        match self.validate(&definition) {
            Ok(()) => sm.handle(E::Valid)?,
            Err(e) => {
                sm.handle(E::Invalid(e.to_string()))?;
                return Ok(self.finish(sm, control, false).await);
            }
        };

        let plan = match build_execution_plan(&definition.steps) {
            Ok(plan) => plan,
            Err(e) => {
                sm.handle(E::CycleDetected(e.to_string()))?;
                return Ok(self.finish(sm, control, false).await);
            }
        };
        let batch_count = plan.len();
        sm.handle(E::GraphBuilt(plan))?;

        if let Err(e) = self.persist_start(sm, &definition).await {
            self.abort(sm, DriveError::Store(e));
            return Ok(self.finish(sm, control, true).await);
        }
        sm.handle(E::Scheduled)?;
        control.publish(sm);

        self.event_bus.publish(WorkflowEvent::RunStarted {
            execution_id: sm.context().execution_id,
            workflow_id: definition.id.clone(),
            resumed: false,
        });
        tracing::info!(
            execution_id = %sm.context().execution_id,
            workflow_id = definition.id.as_str(),
            steps = definition.steps.len(),
            batches = batch_count,
            "starting workflow execution"
        );

        Ok(self.drive(sm, control).await)
    }

    async fn run_restored(
        &self,
        data: RestoreData,
        control: &RunControl,
    ) -> Result<RunReport, EngineError> {
        use OrchestrationEvent as E;

        let execution_id = data.checkpoint.execution_id;
        let checkpoint_id = data.checkpoint.id;
        let workflow_id = data.definition.id.clone();

        let mut sm = StateMachine::new(execution_id);
        sm.handle(E::RestoreCheckpoint(Box::new(data)))?;
        sm.handle(E::CheckpointRestored)?;
        control.publish(&sm);

        let all_steps: Vec<String> = sm
            .context()
            .step_entries()
            .map(|(def, _)| def.id.clone())
            .collect();
        let persisted = async {
            self.checkpoint
                .sync_execution(sm.context(), ExecutionStatus::Running)
                .await?;
            self.checkpoint.record_steps(sm.context(), &all_steps).await
        }
        .await;
        if let Err(e) = persisted {
            self.abort(&mut sm, DriveError::Store(e));
            return Ok(self.finish(&sm, control, true).await);
        }

        self.event_bus.publish(WorkflowEvent::RunStarted {
            execution_id,
            workflow_id: workflow_id.clone(),
            resumed: true,
        });
        tracing::info!(
            execution_id = %execution_id,
            workflow_id = workflow_id.as_str(),
            checkpoint_id = %checkpoint_id,
            completed = sm.context().completed_count(),
            batch = sm.context().current_batch,
            "resuming workflow execution"
        );

        Ok(self.drive(&mut sm, control).await)
    }

    /// Structural validation plus executor resolution.
    fn validate(&self, definition: &WorkflowDefinition) -> Result<(), WorkflowError> {
        validate_definition(definition)?;
        let registry = self.batch_executor.registry();
        if let Some(step) = definition
            .steps
            .iter()
            .find(|s| !registry.contains(&s.agent_id))
        {
            return Err(WorkflowError::ValidationError(format!(
                "step '{}' references unknown executor '{}'",
                step.id, step.agent_id
            )));
        }
        Ok(())
    }

    async fn persist_start(
        &self,
        sm: &StateMachine,
        definition: &WorkflowDefinition,
    ) -> Result<(), CheckpointError> {
        self.checkpoint.register_workflow(definition).await?;
        self.checkpoint
            .sync_execution(sm.context(), ExecutionStatus::Running)
            .await?;
        let step_ids: Vec<String> = definition.steps.iter().map(|s| s.id.clone()).collect();
        self.checkpoint.record_steps(sm.context(), &step_ids).await
    }

    // -----------------------------------------------------------------------
    // Driving
    // -----------------------------------------------------------------------

    async fn drive(&self, sm: &mut StateMachine, control: &RunControl) -> RunReport {
        if let Err(e) = self.run_batches(sm, control).await {
            self.abort(sm, e);
        }
        self.finish(sm, control, true).await
    }

    async fn run_batches(
        &self,
        sm: &mut StateMachine,
        control: &RunControl,
    ) -> Result<(), DriveError> {
        use OrchestrationEvent as E;
        use OrchestrationState as S;

        loop {
            if control.cancel.is_cancelled() && !sm.state().is_terminal() {
                sm.handle(E::Cancel)?;
            }

            match sm.state() {
                S::ExecutingSteps => {
                    if control.pause_requested() {
                        return self.pause_run(sm).await;
                    }
                    self.run_current_batch(sm, control).await?;
                }
                S::AggregatingResults => {
                    let results = sm.context().results.clone();
                    sm.handle(E::ResultsReady(results))?;
                }
                S::Paused | S::Completed | S::Failed | S::Cancelled => return Ok(()),
                other => {
                    sm.handle(E::Fail {
                        error: format!("cannot drive execution from state '{other}'"),
                        code: ErrorCode::from(INVALID_TRANSITION_CODE),
                    })?;
                }
            }
            control.publish(sm);
        }
    }

    /// Dispatch the current batch, wait for it to settle, and apply outcomes.
    async fn run_current_batch(
        &self,
        sm: &mut StateMachine,
        control: &RunControl,
    ) -> Result<(), DriveError> {
        use OrchestrationEvent as E;

        let execution_id = sm.context().execution_id;
        let batch_index = sm.context().current_batch;
        let step_ids = sm.context().dispatchable_ids();

        sm.handle(E::BatchDispatched(step_ids.clone()))?;
        control.publish(sm);
        self.event_bus.publish(WorkflowEvent::BatchDispatched {
            execution_id,
            batch_index,
            step_ids: step_ids.clone(),
        });
        tracing::debug!(
            execution_id = %execution_id,
            batch = batch_index,
            steps = step_ids.len(),
            "dispatching batch"
        );
        self.checkpoint.record_steps(sm.context(), &step_ids).await?;

        let ctx = sm.context();
        let steps: Vec<StepDefinition> = step_ids
            .iter()
            .filter_map(|id| ctx.definition.as_deref().and_then(|d| d.step(id)).cloned())
            .collect();
        let snapshot = BatchSnapshot {
            context: Arc::new(ctx.merged_context()),
            prior_results: Arc::new(ctx.prior_results()),
        };

        let outcomes = self
            .batch_executor
            .run_batch(execution_id, steps, &snapshot, &control.cancel)
            .await;

        if control.cancel.is_cancelled() {
            return Ok(());
        }

        for (step_id, outcome) in outcomes {
            let event = match outcome {
                StepOutcome::Succeeded {
                    value, attempts, ..
                } => E::StepCompleted {
                    step_id,
                    result: value,
                    attempts,
                },
                StepOutcome::Failed { error, attempts } => E::StepFailed {
                    step_id,
                    error: error.to_string(),
                    attempts,
                },
            };
            sm.handle(event)?;
        }
        self.checkpoint.record_steps(sm.context(), &step_ids).await?;

        // Checkpoint the settled batch before leaving AwaitingCompletion. A
        // failing batch is always checkpointed so the run stays resumable.
        let fatal = sm.context().has_fatal_failure();
        if fatal || self.config.checkpoint_every_batch {
            self.write_checkpoint(sm).await?;
        }

        if fatal {
            sm.handle(E::AllStepsSettled)?;
            return Ok(());
        }

        sm.handle(E::BatchDone)?;
        if sm.state() == OrchestrationState::ExecutingSteps {
            self.checkpoint
                .sync_execution(sm.context(), ExecutionStatus::Running)
                .await?;
        }
        Ok(())
    }

    /// Snapshot progress and write it through to the store.
    async fn write_checkpoint(&self, sm: &mut StateMachine) -> Result<Uuid, DriveError> {
        sm.handle(OrchestrationEvent::CreateCheckpoint)?;
        let checkpoint = sm
            .pending_checkpoint()
            .cloned()
            .ok_or(TransitionError::InvalidTransition {
                state: sm.state(),
                event: "CheckpointWritten",
            })?;

        self.checkpoint.write_checkpoint(&checkpoint).await?;
        sm.handle(OrchestrationEvent::CheckpointWritten(checkpoint.id))?;

        self.event_bus.publish(WorkflowEvent::CheckpointWritten {
            execution_id: checkpoint.execution_id,
            checkpoint_id: checkpoint.id,
            completed: checkpoint.completed.len(),
            pending: checkpoint.pending.len(),
        });
        Ok(checkpoint.id)
    }

    async fn pause_run(&self, sm: &mut StateMachine) -> Result<(), DriveError> {
        sm.handle(OrchestrationEvent::Pause)?;
        let checkpoint_id = self.write_checkpoint(sm).await?;
        self.checkpoint
            .sync_execution(sm.context(), ExecutionStatus::Paused)
            .await?;

        let execution_id = sm.context().execution_id;
        self.event_bus.publish(WorkflowEvent::RunPaused {
            execution_id,
            checkpoint_id: Some(checkpoint_id),
        });
        tracing::info!(
            execution_id = %execution_id,
            checkpoint_id = %checkpoint_id,
            completed = sm.context().completed_count(),
            "workflow paused"
        );
        Ok(())
    }

    /// Drive the run to `Failed` after an infrastructure or protocol error.
    fn abort(&self, sm: &mut StateMachine, error: DriveError) {
        let execution_id = sm.context().execution_id;
        tracing::error!(execution_id = %execution_id, error = %error, "aborting workflow run");
        if sm.state().is_terminal() {
            return;
        }
        if let Err(e) = sm.handle(OrchestrationEvent::Fail {
            error: error.to_string(),
            code: error.code(),
        }) {
            tracing::error!(execution_id = %execution_id, error = %e, "could not fail workflow run");
        }
    }

    /// Persist the terminal state (when the run reached the store), publish
    /// the terminal event and build the report.
    async fn finish(&self, sm: &StateMachine, control: &RunControl, persisted: bool) -> RunReport {
        let ctx = sm.context();
        let state = sm.state();
        let execution_id = ctx.execution_id;

        if persisted && state.is_terminal() {
            let all_steps: Vec<String> = ctx.step_entries().map(|(def, _)| def.id.clone()).collect();
            if let Err(e) = self.checkpoint.record_steps(ctx, &all_steps).await {
                tracing::warn!(execution_id = %execution_id, error = %e, "failed to record final step states");
            }
            if let Err(e) = self
                .checkpoint
                .sync_execution(ctx, state.execution_status())
                .await
            {
                tracing::warn!(execution_id = %execution_id, error = %e, "failed to record final execution state");
            }
        }

        match state {
            OrchestrationState::Completed => {
                let duration_ms = ctx.metrics.duration_ms().unwrap_or(0);
                self.event_bus.publish(WorkflowEvent::RunCompleted {
                    execution_id,
                    duration_ms,
                    steps_completed: ctx.completed_count(),
                });
                tracing::info!(
                    execution_id = %execution_id,
                    duration_ms,
                    completed = ctx.completed_count(),
                    failed = ctx.metrics.failed_steps,
                    "workflow completed"
                );
            }
            OrchestrationState::Failed => {
                let failure = ctx
                    .error
                    .clone()
                    .unwrap_or_else(|| ExecutionFailure::new(ErrorCode::StepFailure, "unknown"));
                tracing::warn!(
                    execution_id = %execution_id,
                    code = %failure.code,
                    error = failure.message.as_str(),
                    "workflow failed"
                );
                self.event_bus.publish(WorkflowEvent::RunFailed {
                    execution_id,
                    code: failure.code,
                    error: failure.message,
                });
            }
            OrchestrationState::Cancelled => {
                self.event_bus
                    .publish(WorkflowEvent::RunCancelled { execution_id });
                tracing::info!(execution_id = %execution_id, "workflow cancelled");
            }
            _ => {}
        }

        control.publish(sm);
        RunReport::from_machine(sm)
    }
}

impl<S: CheckpointStore> std::fmt::Debug for WorkflowEngine<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("batch_executor", &self.batch_executor)
            .field("active_runs", &self.runs.len())
            .finish()
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
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;
    use stepwise_types::workflow::StepStatus;
    use tokio::sync::Semaphore;

    use crate::repository::memory::InMemoryCheckpointStore;
    use crate::workflow::executor::{StepError, StepExecutor, StepInvocation};

    // -- Scripted executors --

    fn echo_value(invocation: &StepInvocation) -> Value {
        json!({
            "task": invocation.task,
            "inputs": invocation.prior_results.keys().cloned().collect::<Vec<_>>(),
        })
    }

    struct Echo;

    impl StepExecutor for Echo {
        async fn invoke(&self, invocation: &StepInvocation) -> Result<Value, StepError> {
            Ok(echo_value(invocation))
        }
    }

    struct AlwaysFail {
        calls: Arc<AtomicU32>,
    }

    impl StepExecutor for AlwaysFail {
        async fn invoke(&self, _invocation: &StepInvocation) -> Result<Value, StepError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(StepError::ExecutionFailed("upstream unavailable".to_string()))
        }
    }

    /// Fails until switched healthy.
    struct Switchable {
        healthy: Arc<AtomicBool>,
    }

    impl StepExecutor for Switchable {
        async fn invoke(&self, invocation: &StepInvocation) -> Result<Value, StepError> {
            if self.healthy.load(Ordering::SeqCst) {
                Ok(echo_value(invocation))
            } else {
                Err(StepError::ExecutionFailed("not yet".to_string()))
            }
        }
    }

    struct Counted {
        calls: Arc<AtomicU32>,
    }

    impl StepExecutor for Counted {
        async fn invoke(&self, invocation: &StepInvocation) -> Result<Value, StepError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(echo_value(invocation))
        }
    }

    /// Every invocation consumes one permit of the gate before answering.
    struct Gated {
        gate: Arc<Semaphore>,
    }

    impl StepExecutor for Gated {
        async fn invoke(&self, invocation: &StepInvocation) -> Result<Value, StepError> {
            let permit = self
                .gate
                .acquire()
                .await
                .map_err(|_| StepError::Cancelled)?;
            permit.forget();
            Ok(echo_value(invocation))
        }
    }

    struct ContextEcho;

    impl StepExecutor for ContextEcho {
        async fn invoke(&self, invocation: &StepInvocation) -> Result<Value, StepError> {
            Ok(json!(invocation.context.as_ref()))
        }
    }

    // -- Fixtures --

    fn engine(registry: ExecutorRegistry) -> WorkflowEngine<InMemoryCheckpointStore> {
        WorkflowEngine::new(
            InMemoryCheckpointStore::new(),
            registry,
            EngineConfig::default(),
        )
    }

    fn echo_registry() -> ExecutorRegistry {
        let mut registry = ExecutorRegistry::new();
        registry.register("echo", Echo);
        registry
    }

    fn gated_engine(gate: &Arc<Semaphore>) -> Arc<WorkflowEngine<InMemoryCheckpointStore>> {
        let mut registry = ExecutorRegistry::new();
        registry.register(
            "gated",
            Gated {
                gate: Arc::clone(gate),
            },
        );
        Arc::new(engine(registry))
    }

    fn chain_yaml(agent: &str, middle_agent: &str, continue_on_error: bool) -> String {
        format!(
            r#"
id: chain
name: Chain
steps:
  - {{ id: A, name: A, agentId: {agent}, task: first }}
  - {{ id: B, name: B, agentId: {middle_agent}, task: second, dependencies: [A], retries: 2, continueOnError: {continue_on_error} }}
  - {{ id: C, name: C, agentId: {agent}, task: third, dependencies: [B] }}
"#
        )
    }

    const DIAMOND_YAML: &str = r#"
id: diamond
name: Diamond
steps:
  - { id: A, name: A, agentId: echo, task: root }
  - { id: B, name: B, agentId: echo, task: left, dependencies: [A] }
  - { id: C, name: C, agentId: echo, task: right, dependencies: [A] }
  - { id: D, name: D, agentId: echo, task: join, dependencies: [B, C] }
"#;

    async fn wait_for_batch(events: &mut ExecutionEvents, index: usize) {
        let wait = async {
            while let Some(event) = events.recv().await {
                if let WorkflowEvent::BatchDispatched { batch_index, .. } = event {
                    if batch_index == index {
                        return;
                    }
                }
            }
            panic!("run ended before batch {index} was dispatched");
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .expect("batch was never dispatched");
    }

    fn keys(results: &ResultsMap) -> BTreeSet<&str> {
        results.keys().map(String::as_str).collect()
    }

    // -- Tests --

    #[tokio::test]
    async fn linear_chain_completes_with_every_result() {
        let engine = engine(echo_registry());
        let report = engine
            .execute(
                &chain_yaml("echo", "echo", false),
                DefinitionFormat::Yaml,
                BTreeMap::new(),
            )
            .await
            .unwrap();

        assert!(report.is_completed());
        assert_eq!(keys(&report.results), BTreeSet::from(["A", "B", "C"]));
        assert_eq!(
            report.results["C"].value().unwrap()["inputs"],
            json!(["A", "B"])
        );
        assert_eq!(report.metrics.completed_steps, 3);
        assert!(report.error.is_none());

        let status = engine.get_status(report.execution_id).await.unwrap();
        assert_eq!(status.status, ExecutionStatus::Completed);
        assert_eq!(status.state, None);
        assert_eq!((status.completed_count, status.total_count), (3, 3));
    }

    #[tokio::test]
    async fn diamond_dispatches_siblings_together() {
        let engine = engine(echo_registry());
        let mut rx = engine.subscribe();

        let report = engine
            .execute(DIAMOND_YAML, DefinitionFormat::Yaml, BTreeMap::new())
            .await
            .unwrap();
        assert!(report.is_completed());

        let mut batches = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let WorkflowEvent::BatchDispatched { step_ids, .. } = event {
                batches.push(step_ids);
            }
        }
        assert_eq!(
            batches,
            vec![
                vec!["A".to_string()],
                vec!["B".to_string(), "C".to_string()],
                vec!["D".to_string()],
            ]
        );
        assert_eq!(
            report.results["D"].value().unwrap()["inputs"],
            json!(["A", "B", "C"])
        );
    }

    #[tokio::test]
    async fn failing_step_fails_run_and_keeps_partial_results() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut registry = echo_registry();
        registry.register(
            "broken",
            AlwaysFail {
                calls: Arc::clone(&calls),
            },
        );
        let engine = engine(registry);

        let report = engine
            .execute(
                &chain_yaml("echo", "broken", false),
                DefinitionFormat::Yaml,
                BTreeMap::new(),
            )
            .await
            .unwrap();

        assert_eq!(report.state, OrchestrationState::Failed);
        assert_eq!(report.error_code(), Some(&ErrorCode::StepFailure));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(report.results["A"].value().is_some());
        assert!(!report.results.contains_key("C"));

        let steps = engine
            .store()
            .list_steps(&report.execution_id)
            .await
            .unwrap();
        let c = steps.iter().find(|s| s.step_id == "C").unwrap();
        assert_eq!(c.status, StepStatus::Skipped);
        let b = steps.iter().find(|s| s.step_id == "B").unwrap();
        assert_eq!((b.status, b.attempts), (StepStatus::Failed, 3));

        let status = engine.get_status(report.execution_id).await.unwrap();
        assert_eq!(status.status, ExecutionStatus::Failed);
        assert_eq!(status.error.unwrap().code, ErrorCode::StepFailure);
    }

    #[tokio::test]
    async fn continue_on_error_completes_with_failure_marker() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut registry = echo_registry();
        registry.register(
            "broken",
            AlwaysFail {
                calls: Arc::clone(&calls),
            },
        );
        let engine = engine(registry);

        let report = engine
            .execute(
                &chain_yaml("echo", "broken", true),
                DefinitionFormat::Yaml,
                BTreeMap::new(),
            )
            .await
            .unwrap();

        assert!(report.is_completed());
        assert_eq!(keys(&report.results), BTreeSet::from(["A", "B", "C"]));
        assert!(report.results["B"].is_failure());
        assert_eq!(
            report.results["C"].value().unwrap()["inputs"],
            json!(["A"])
        );
        assert_eq!(report.metrics.failed_steps, 1);
    }

    #[tokio::test]
    async fn parse_error_is_reported_with_code() {
        let engine = engine(echo_registry());
        let report = engine
            .execute("id: [unterminated", DefinitionFormat::Yaml, BTreeMap::new())
            .await
            .unwrap();

        assert_eq!(report.state, OrchestrationState::Failed);
        assert_eq!(report.error_code(), Some(&ErrorCode::ParseError));
        assert!(report.workflow_id.is_none());
        assert!(matches!(
            engine.get_status(report.execution_id).await,
            Err(EngineError::ExecutionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn cycle_is_reported_as_graph_error() {
        let engine = engine(echo_registry());
        let yaml = r#"
id: loop
name: Loop
steps:
  - { id: A, name: A, agentId: echo, task: x, dependencies: [B] }
  - { id: B, name: B, agentId: echo, task: y, dependencies: [A] }
"#;
        let report = engine
            .execute(yaml, DefinitionFormat::Yaml, BTreeMap::new())
            .await
            .unwrap();

        assert_eq!(report.error_code(), Some(&ErrorCode::GraphError));
        let message = &report.error.unwrap().message;
        assert!(message.contains('A') && message.contains('B'));
    }

    #[tokio::test]
    async fn unknown_executor_is_validation_error() {
        let engine = engine(echo_registry());
        let report = engine
            .execute(
                &chain_yaml("echo", "nobody", false),
                DefinitionFormat::Yaml,
                BTreeMap::new(),
            )
            .await
            .unwrap();

        assert_eq!(report.error_code(), Some(&ErrorCode::ValidationError));
        assert!(report.error.unwrap().message.contains("nobody"));
    }

    #[tokio::test]
    async fn json_definition_with_initial_context() {
        let mut registry = ExecutorRegistry::new();
        registry.register("context", ContextEcho);
        let engine = engine(registry);

        let json = r#"{
            "id": "ctx",
            "name": "Context",
            "context": {"region": "eu", "tier": "free"},
            "steps": [{"id": "only", "name": "Only", "agentId": "context", "task": "look"}]
        }"#;
        let initial = BTreeMap::from([("tier".to_string(), json!("pro"))]);
        let report = engine
            .execute(json, DefinitionFormat::Json, initial)
            .await
            .unwrap();

        let seen = report.results["only"].value().unwrap();
        assert_eq!(seen["region"], json!("eu"));
        assert_eq!(seen["tier"], json!("pro"));
    }

    #[tokio::test]
    async fn pause_then_resume_matches_uninterrupted_run() {
        let yaml = chain_yaml("gated", "gated", false);

        let open_gate = Arc::new(Semaphore::new(100));
        let baseline = gated_engine(&open_gate)
            .execute(&yaml, DefinitionFormat::Yaml, BTreeMap::new())
            .await
            .unwrap();
        assert!(baseline.is_completed());

        let gate = Arc::new(Semaphore::new(0));
        let engine = gated_engine(&gate);
        let execution_id = Uuid::now_v7();
        let mut events = engine.subscribe_execution(execution_id);

        let runner = {
            let engine = Arc::clone(&engine);
            let yaml = yaml.clone();
            tokio::spawn(async move {
                engine
                    .execute_as(execution_id, &yaml, DefinitionFormat::Yaml, BTreeMap::new())
                    .await
            })
        };

        wait_for_batch(&mut events, 0).await;
        let live = engine.get_status(execution_id).await.unwrap();
        assert_eq!(live.state, Some(OrchestrationState::AwaitingCompletion));
        assert_eq!(live.total_count, 3);

        engine.pause(execution_id).await.unwrap();
        gate.add_permits(1);

        let paused = runner.await.unwrap().unwrap();
        assert_eq!(paused.state, OrchestrationState::Paused);
        assert_eq!(keys(&paused.results), BTreeSet::from(["A"]));
        assert!(paused.last_checkpoint.is_some());
        assert_eq!(
            engine.get_status(execution_id).await.unwrap().status,
            ExecutionStatus::Paused
        );

        gate.add_permits(10);
        let resumed = engine.resume_latest(execution_id).await.unwrap();
        assert!(resumed.is_completed());
        assert_eq!(resumed.execution_id, execution_id);
        assert_eq!(resumed.results, baseline.results);
    }

    #[tokio::test]
    async fn cancel_stops_active_run() {
        let gate = Arc::new(Semaphore::new(0));
        let engine = gated_engine(&gate);
        let execution_id = Uuid::now_v7();
        let mut events = engine.subscribe_execution(execution_id);

        let runner = {
            let engine = Arc::clone(&engine);
            let yaml = chain_yaml("gated", "gated", false);
            tokio::spawn(async move {
                engine
                    .execute_as(execution_id, &yaml, DefinitionFormat::Yaml, BTreeMap::new())
                    .await
            })
        };

        wait_for_batch(&mut events, 0).await;
        engine.cancel(execution_id).await.unwrap();

        let report = runner.await.unwrap().unwrap();
        assert_eq!(report.state, OrchestrationState::Cancelled);
        assert_eq!(report.error_code(), Some(&ErrorCode::Cancelled));
        assert!(report.results.is_empty());

        let status = engine.get_status(execution_id).await.unwrap();
        assert_eq!(status.status, ExecutionStatus::Cancelled);
        assert!(engine.active_executions().is_empty());
    }

    #[tokio::test]
    async fn cancelled_paused_run_cannot_resume() {
        let gate = Arc::new(Semaphore::new(0));
        let engine = gated_engine(&gate);
        let execution_id = Uuid::now_v7();
        let mut events = engine.subscribe_execution(execution_id);

        let runner = {
            let engine = Arc::clone(&engine);
            let yaml = chain_yaml("gated", "gated", false);
            tokio::spawn(async move {
                engine
                    .execute_as(execution_id, &yaml, DefinitionFormat::Yaml, BTreeMap::new())
                    .await
            })
        };
        wait_for_batch(&mut events, 0).await;
        engine.pause(execution_id).await.unwrap();
        gate.add_permits(1);
        let paused = runner.await.unwrap().unwrap();
        assert_eq!(paused.state, OrchestrationState::Paused);

        engine.cancel(execution_id).await.unwrap();
        assert_eq!(
            engine.get_status(execution_id).await.unwrap().status,
            ExecutionStatus::Cancelled
        );
        assert!(matches!(
            engine.resume_latest(execution_id).await,
            Err(EngineError::NotResumable { .. })
        ));
    }

    #[tokio::test]
    async fn failed_run_resumes_from_last_checkpoint() {
        let healthy = Arc::new(AtomicBool::new(false));
        let mut registry = echo_registry();
        registry.register(
            "flaky",
            Switchable {
                healthy: Arc::clone(&healthy),
            },
        );
        let engine = engine(registry);

        let failed = engine
            .execute(
                &chain_yaml("echo", "flaky", false),
                DefinitionFormat::Yaml,
                BTreeMap::new(),
            )
            .await
            .unwrap();
        assert_eq!(failed.state, OrchestrationState::Failed);

        healthy.store(true, Ordering::SeqCst);
        let resumed = engine.resume_latest(failed.execution_id).await.unwrap();
        assert!(resumed.is_completed());
        assert!(resumed.error.is_none());
        assert_eq!(keys(&resumed.results), BTreeSet::from(["A", "B", "C"]));

        let checkpoints = engine
            .store()
            .list_checkpoints(&failed.execution_id)
            .await
            .unwrap();
        assert!(checkpoints.len() >= 2);
    }

    #[tokio::test]
    async fn completed_sibling_of_failed_step_is_not_rerun_on_resume() {
        let calls = Arc::new(AtomicU32::new(0));
        let healthy = Arc::new(AtomicBool::new(false));
        let mut registry = echo_registry();
        registry.register(
            "counted",
            Counted {
                calls: Arc::clone(&calls),
            },
        );
        registry.register(
            "flaky",
            Switchable {
                healthy: Arc::clone(&healthy),
            },
        );
        let engine = engine(registry);
        let yaml = r#"
id: diamond
name: Diamond
steps:
  - { id: A, name: A, agentId: echo, task: root }
  - { id: B, name: B, agentId: counted, task: left, dependencies: [A] }
  - { id: C, name: C, agentId: flaky, task: right, dependencies: [A] }
  - { id: D, name: D, agentId: echo, task: join, dependencies: [B, C] }
"#;

        let failed = engine
            .execute(yaml, DefinitionFormat::Yaml, BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(failed.error_code(), Some(&ErrorCode::StepFailure));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let latest = engine
            .store()
            .latest_checkpoint(&failed.execution_id)
            .await
            .unwrap()
            .unwrap();
        assert!(latest.completed.contains("B"));
        assert!(latest.pending.contains("C"));

        healthy.store(true, Ordering::SeqCst);
        let resumed = engine.resume_latest(failed.execution_id).await.unwrap();
        assert!(resumed.is_completed());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(keys(&resumed.results), BTreeSet::from(["A", "B", "C", "D"]));
    }

    #[tokio::test]
    async fn failure_in_first_batch_is_resumable() {
        let healthy = Arc::new(AtomicBool::new(false));
        let mut registry = echo_registry();
        registry.register(
            "flaky",
            Switchable {
                healthy: Arc::clone(&healthy),
            },
        );
        let engine = engine(registry);
        let yaml = r#"
id: pair
name: Pair
steps:
  - { id: A, name: A, agentId: flaky, task: first }
  - { id: B, name: B, agentId: echo, task: second, dependencies: [A] }
"#;

        let failed = engine
            .execute(yaml, DefinitionFormat::Yaml, BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(failed.state, OrchestrationState::Failed);
        assert!(failed.last_checkpoint.is_some());

        healthy.store(true, Ordering::SeqCst);
        let resumed = engine.resume_latest(failed.execution_id).await.unwrap();
        assert!(resumed.is_completed());
        assert_eq!(keys(&resumed.results), BTreeSet::from(["A", "B"]));
    }

    #[tokio::test]
    async fn resume_uses_definition_the_execution_started_with() {
        let healthy = Arc::new(AtomicBool::new(false));
        let mut registry = echo_registry();
        registry.register(
            "flaky",
            Switchable {
                healthy: Arc::clone(&healthy),
            },
        );
        let engine = engine(registry);
        let v1 = r#"
id: report
name: Report
version: 1.0.0
steps:
  - { id: A, name: A, agentId: echo, task: gather }
  - { id: B, name: B, agentId: flaky, task: publish, dependencies: [A] }
"#;
        let v2 = r#"
id: report
name: Report
version: 2.0.0
steps:
  - { id: X, name: X, agentId: echo, task: rewrite }
"#;

        let failed = engine
            .execute(v1, DefinitionFormat::Yaml, BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(failed.state, OrchestrationState::Failed);

        let newer = engine
            .execute(v2, DefinitionFormat::Yaml, BTreeMap::new())
            .await
            .unwrap();
        assert!(newer.is_completed());

        healthy.store(true, Ordering::SeqCst);
        let resumed = engine.resume_latest(failed.execution_id).await.unwrap();
        assert!(resumed.is_completed());
        assert_eq!(keys(&resumed.results), BTreeSet::from(["A", "B"]));
        assert_eq!(
            resumed.results["B"].value().unwrap()["task"],
            json!("publish")
        );
    }

    #[tokio::test]
    async fn unknown_execution_operations() {
        let engine = engine(echo_registry());
        let id = Uuid::now_v7();
        assert!(matches!(
            engine.pause(id).await,
            Err(EngineError::ExecutionNotFound(_))
        ));
        assert!(matches!(
            engine.cancel(id).await,
            Err(EngineError::ExecutionNotFound(_))
        ));
        assert!(matches!(
            engine.resume(id).await,
            Err(EngineError::CheckpointNotFound(_))
        ));
        assert!(matches!(
            engine.resume_latest(id).await,
            Err(EngineError::NoCheckpoint(_))
        ));
    }

    #[tokio::test]
    async fn lifecycle_events_are_published() {
        let engine = engine(echo_registry());
        let mut rx = engine.subscribe();
        let report = engine
            .execute(
                &chain_yaml("echo", "echo", false),
                DefinitionFormat::Yaml,
                BTreeMap::new(),
            )
            .await
            .unwrap();

        let mut started = false;
        let mut checkpoints = 0;
        let mut completed = false;
        while let Ok(event) = rx.try_recv() {
            assert_eq!(event.execution_id(), report.execution_id);
            match event {
                WorkflowEvent::RunStarted { resumed, .. } => started = !resumed,
                WorkflowEvent::CheckpointWritten { .. } => checkpoints += 1,
                WorkflowEvent::RunCompleted {
                    steps_completed, ..
                } => completed = steps_completed == 3,
                _ => {}
            }
        }
        assert!(started && completed);
        // One checkpoint per settled batch.
        assert_eq!(checkpoints, 3);
    }
}
