//! Checkpoint creation, restoration, and the durable checkpoint manager.
//!
//! `create_checkpoint` and `restore_from_checkpoint` are pure functions over
//! an `ExecutionContext`. `CheckpointManager` wraps a `CheckpointStore` to
//! persist workflows, executions, step records and checkpoints so a paused or
//! crashed run can be resumed from its last checkpoint.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use stepwise_types::workflow::{
    Checkpoint, ExecutionRecord, ExecutionStatus, ResultsMap, StepRecord, StepRuntimeState,
    StepStatus, WorkflowDefinition, WorkflowRecord,
};
use uuid::Uuid;

use super::context::ExecutionContext;
use super::state::RestoreData;
use crate::repository::checkpoint::CheckpointStore;

// ---------------------------------------------------------------------------
// Snapshot / restore
// ---------------------------------------------------------------------------

/// Snapshot the progress of `ctx`.
///
/// `completed` holds successfully completed steps; every other step, whatever
/// its status, is listed in `pending`.
pub fn create_checkpoint(ctx: &ExecutionContext) -> Checkpoint {
    Checkpoint {
        id: Uuid::now_v7(),
        execution_id: ctx.execution_id,
        created_at: Utc::now(),
        completed: ctx.ids_with_status(StepStatus::Completed),
        pending: ctx.unfinished_ids(),
        results: ctx.results.clone(),
    }
}

/// Rebuild an execution context from a checkpoint.
///
/// Steps in the completed set come back completed with their stored result;
/// all others are reset to pending and will run again. Failure markers of
/// steps that are not completed are dropped with them.
pub fn restore_from_checkpoint(data: RestoreData) -> Result<ExecutionContext, CheckpointError> {
    let RestoreData {
        definition,
        plan,
        checkpoint,
        initial_context,
    } = data;

    let known: BTreeSet<&str> = definition.steps.iter().map(|s| s.id.as_str()).collect();
    if let Some(unknown) = checkpoint
        .completed
        .iter()
        .chain(checkpoint.pending.iter())
        .find(|id| !known.contains(id.as_str()))
    {
        return Err(CheckpointError::Inconsistent(format!(
            "checkpoint {} references unknown step '{unknown}'",
            checkpoint.id
        )));
    }

    let mut steps = Vec::with_capacity(definition.steps.len());
    let mut results = ResultsMap::new();
    for step in &definition.steps {
        if !checkpoint.completed.contains(&step.id) {
            steps.push(StepRuntimeState::default());
            continue;
        }
        let Some(result) = checkpoint.results.get(&step.id) else {
            return Err(CheckpointError::Inconsistent(format!(
                "checkpoint {} has no result for completed step '{}'",
                checkpoint.id, step.id
            )));
        };
        steps.push(StepRuntimeState {
            status: StepStatus::Completed,
            result: result.value().cloned(),
            ..Default::default()
        });
        results.insert(step.id.clone(), result.clone());
    }

    let mut ctx = ExecutionContext::new(checkpoint.execution_id);
    ctx.metrics.total_steps = definition.steps.len() as u32;
    ctx.metrics.started_at = Some(Utc::now());
    ctx.definition = Some(Arc::new(definition));
    ctx.initial_context = initial_context;
    ctx.steps = steps;
    ctx.plan = Some(plan);
    ctx.results = results;
    ctx.checkpoints.push(checkpoint);
    ctx.refresh_metrics();
    Ok(ctx)
}

/// Decode the definition snapshot an execution was planned from.
pub fn execution_definition(record: &ExecutionRecord) -> Result<WorkflowDefinition, CheckpointError> {
    serde_json::from_str(&record.definition).map_err(|e| {
        CheckpointError::Serialization(format!(
            "definition snapshot of execution {}: {e}",
            record.id
        ))
    })
}

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Persists execution progress through a `CheckpointStore`.
///
/// Generic over `S: CheckpointStore` so it works with any storage backend
/// (SQLite, in-memory, etc.).
pub struct CheckpointManager<S: CheckpointStore> {
    store: S,
}

impl<S: CheckpointStore> CheckpointManager<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Access the underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    // -----------------------------------------------------------------------
    // Workflows
    // -----------------------------------------------------------------------

    /// Persist a definition so later resumes can rebuild the plan.
    pub async fn register_workflow(
        &self,
        definition: &WorkflowDefinition,
    ) -> Result<WorkflowRecord, CheckpointError> {
        let now = Utc::now();
        let record = WorkflowRecord {
            id: definition.id.clone(),
            name: definition.name.clone(),
            version: definition.version.clone(),
            definition: serde_json::to_string(definition)
                .map_err(|e| CheckpointError::Serialization(e.to_string()))?,
            created_at: now,
            updated_at: now,
        };
        self.store
            .save_workflow(&record)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;

        tracing::debug!(workflow_id = %record.id, version = %record.version, "registered workflow");
        Ok(record)
    }

    /// Load and decode a stored definition.
    pub async fn load_definition(
        &self,
        workflow_id: &str,
    ) -> Result<WorkflowDefinition, CheckpointError> {
        let record = self
            .store
            .get_workflow(workflow_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?
            .ok_or_else(|| CheckpointError::WorkflowNotFound(workflow_id.to_string()))?;
        serde_json::from_str(&record.definition)
            .map_err(|e| CheckpointError::Serialization(e.to_string()))
    }

    // -----------------------------------------------------------------------
    // Executions
    // -----------------------------------------------------------------------

    /// Write the execution record for `ctx` with the given status.
    ///
    /// Creates the record on first call, snapshotting the definition; later
    /// calls keep the original start time and snapshot.
    pub async fn sync_execution(
        &self,
        ctx: &ExecutionContext,
        status: ExecutionStatus,
    ) -> Result<(), CheckpointError> {
        let Some(definition) = ctx.definition.as_deref() else {
            return Err(CheckpointError::Inconsistent(format!(
                "execution {} has no definition",
                ctx.execution_id
            )));
        };
        let now = Utc::now();
        let existing = self
            .store
            .get_execution(&ctx.execution_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;
        let snapshot = match &existing {
            Some(previous) => previous.definition.clone(),
            None => serde_json::to_string(definition)
                .map_err(|e| CheckpointError::Serialization(e.to_string()))?,
        };

        let mut record = ExecutionRecord {
            id: ctx.execution_id,
            workflow_id: definition.id.clone(),
            definition: snapshot,
            status,
            completed_count: ctx.completed_count(),
            total_count: ctx.total_count(),
            context: ctx.initial_context.clone(),
            results: ctx.results.clone(),
            error: ctx.error.clone(),
            started_at: ctx.metrics.started_at.unwrap_or(now),
            updated_at: now,
            completed_at: status
                .is_terminal()
                .then(|| ctx.metrics.ended_at.unwrap_or(now)),
        };

        let result = match existing {
            Some(previous) => {
                record.started_at = previous.started_at;
                self.store.update_execution(&record).await
            }
            None => self.store.create_execution(&record).await,
        };
        result.map_err(|e| CheckpointError::Repository(e.to_string()))?;

        tracing::debug!(
            execution_id = %ctx.execution_id,
            %status,
            completed = record.completed_count,
            total = record.total_count,
            "synced execution record"
        );
        Ok(())
    }

    pub async fn load_execution(&self, id: Uuid) -> Result<ExecutionRecord, CheckpointError> {
        self.store
            .get_execution(&id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?
            .ok_or(CheckpointError::ExecutionNotFound(id))
    }

    /// Overwrite only the status of a stored execution.
    pub async fn mark_status(
        &self,
        id: Uuid,
        status: ExecutionStatus,
    ) -> Result<(), CheckpointError> {
        let mut record = self.load_execution(id).await?;
        let now = Utc::now();
        record.status = status;
        record.updated_at = now;
        if status.is_terminal() {
            record.completed_at = Some(now);
        }
        self.store
            .update_execution(&record)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;

        tracing::debug!(execution_id = %id, %status, "checkpointed execution status");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Steps
    // -----------------------------------------------------------------------

    /// Persist the current runtime state of the given steps.
    pub async fn record_steps(
        &self,
        ctx: &ExecutionContext,
        step_ids: &[String],
    ) -> Result<(), CheckpointError> {
        for step_id in step_ids {
            let Some(state) = ctx.step_state(step_id) else {
                continue;
            };
            let record = StepRecord {
                execution_id: ctx.execution_id,
                step_id: step_id.clone(),
                status: state.status,
                result: state.result.clone(),
                error: state.error.clone(),
                attempts: state.attempts,
                started_at: state.started_at,
                completed_at: state.completed_at,
            };
            self.store
                .upsert_step(&record)
                .await
                .map_err(|e| CheckpointError::Repository(e.to_string()))?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Checkpoints
    // -----------------------------------------------------------------------

    pub async fn write_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        self.store
            .save_checkpoint(checkpoint)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;

        tracing::debug!(
            execution_id = %checkpoint.execution_id,
            checkpoint_id = %checkpoint.id,
            completed = checkpoint.completed.len(),
            pending = checkpoint.pending.len(),
            "wrote checkpoint"
        );
        Ok(())
    }

    pub async fn load_checkpoint(&self, id: Uuid) -> Result<Checkpoint, CheckpointError> {
        self.store
            .get_checkpoint(&id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?
            .ok_or(CheckpointError::CheckpointNotFound(id))
    }

    pub async fn latest_checkpoint(
        &self,
        execution_id: Uuid,
    ) -> Result<Option<Checkpoint>, CheckpointError> {
        self.store
            .latest_checkpoint(&execution_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during checkpoint operations.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// Underlying store operation failed.
    #[error("checkpoint store error: {0}")]
    Repository(String),

    #[error("checkpoint not found: {0}")]
    CheckpointNotFound(Uuid),

    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),

    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    /// Checkpoint contents do not match the definition they are restored into.
    #[error("inconsistent checkpoint: {0}")]
    Inconsistent(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
