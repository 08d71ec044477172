//! Lifecycle events for the stepwise event bus.
//!
//! `WorkflowEvent` is broadcast by the engine while a run progresses.
//! All variants are Clone + Send + Sync for use with tokio broadcast channels.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::ErrorCode;

/// Events emitted during workflow execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    /// A run has started (or resumed from a checkpoint).
    RunStarted {
        execution_id: Uuid,
        workflow_id: String,
        resumed: bool,
    },

    /// A batch of steps was handed to the batch executor.
    BatchDispatched {
        execution_id: Uuid,
        batch_index: usize,
        step_ids: Vec<String>,
    },

    /// A step invocation has started.
    StepStarted {
        execution_id: Uuid,
        step_id: String,
        attempt: u32,
    },

    /// A step completed successfully.
    StepCompleted {
        execution_id: Uuid,
        step_id: String,
        duration_ms: u64,
    },

    /// A step attempt failed.
    StepFailed {
        execution_id: Uuid,
        step_id: String,
        error: String,
        will_retry: bool,
    },

    /// A checkpoint was durably written.
    CheckpointWritten {
        execution_id: Uuid,
        checkpoint_id: Uuid,
        completed: usize,
        pending: usize,
    },

    /// A run was paused between batches.
    RunPaused {
        execution_id: Uuid,
        checkpoint_id: Option<Uuid>,
    },

    /// A run completed successfully.
    RunCompleted {
        execution_id: Uuid,
        duration_ms: u64,
        steps_completed: u32,
    },

    /// A run failed.
    RunFailed {
        execution_id: Uuid,
        code: ErrorCode,
        error: String,
    },

    /// A run was cancelled.
    RunCancelled { execution_id: Uuid },
}

impl WorkflowEvent {
    /// The execution every variant belongs to.
    pub fn execution_id(&self) -> Uuid {
        match self {
            WorkflowEvent::RunStarted { execution_id, .. }
            | WorkflowEvent::BatchDispatched { execution_id, .. }
            | WorkflowEvent::StepStarted { execution_id, .. }
            | WorkflowEvent::StepCompleted { execution_id, .. }
            | WorkflowEvent::StepFailed { execution_id, .. }
            | WorkflowEvent::CheckpointWritten { execution_id, .. }
            | WorkflowEvent::RunPaused { execution_id, .. }
            | WorkflowEvent::RunCompleted { execution_id, .. }
            | WorkflowEvent::RunFailed { execution_id, .. }
            | WorkflowEvent::RunCancelled { execution_id } => *execution_id,
        }
    }

    /// Whether this is the last event of a run invocation: it paused, completed,
    /// failed or was cancelled.
    pub fn ends_run(&self) -> bool {
        matches!(
            self,
            WorkflowEvent::RunPaused { .. }
                | WorkflowEvent::RunCompleted { .. }
                | WorkflowEvent::RunFailed { .. }
                | WorkflowEvent::RunCancelled { .. }
        )
    }
}
