//! Checkpoint store trait definition.
//!
//! Defines the durable storage interface the engine writes progress through.
//! The infrastructure layer (stepwise-infra) implements this trait with
//! SQLite persistence; `memory::InMemoryCheckpointStore` is the in-process
//! implementation.

use stepwise_types::error::RepositoryError;
use stepwise_types::workflow::{Checkpoint, ExecutionRecord, StepRecord, WorkflowRecord};
use uuid::Uuid;

/// Repository trait for workflow execution persistence.
///
/// Covers four entity families:
/// - **Workflows:** one record per definition, upserted by ID.
/// - **Executions:** one record per run, created once and then updated.
/// - **Steps:** one record per step within an execution, upserted.
/// - **Checkpoints:** append-only; writing an existing ID is a `Conflict`.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait CheckpointStore: Send + Sync {
    // -----------------------------------------------------------------------
    // Workflows
    // -----------------------------------------------------------------------

    /// Upsert a workflow definition record (insert or replace by ID).
    fn save_workflow(
        &self,
        record: &WorkflowRecord,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a workflow record by its ID.
    fn get_workflow(
        &self,
        id: &str,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowRecord>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Executions
    // -----------------------------------------------------------------------

    /// Create a new execution record.
    fn create_execution(
        &self,
        record: &ExecutionRecord,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Replace an existing execution record, keeping its definition snapshot.
    /// `NotFound` if it does not exist.
    fn update_execution(
        &self,
        record: &ExecutionRecord,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get an execution record by its UUID.
    fn get_execution(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<ExecutionRecord>, RepositoryError>> + Send;

    /// List executions of a workflow, most recent first.
    fn list_executions(
        &self,
        workflow_id: &str,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<ExecutionRecord>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Steps
    // -----------------------------------------------------------------------

    /// Insert or replace the record of one step within an execution.
    fn upsert_step(
        &self,
        record: &StepRecord,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// List step records of an execution, ordered by start time.
    fn list_steps(
        &self,
        execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<StepRecord>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Checkpoints
    // -----------------------------------------------------------------------

    /// Append a checkpoint. Checkpoints are immutable once written.
    fn save_checkpoint(
        &self,
        checkpoint: &Checkpoint,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a checkpoint by its UUID.
    fn get_checkpoint(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Checkpoint>, RepositoryError>> + Send;

    /// List the checkpoints of an execution, oldest first.
    fn list_checkpoints(
        &self,
        execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<Checkpoint>, RepositoryError>> + Send;

    /// The most recent checkpoint of an execution.
    fn latest_checkpoint(
        &self,
        execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Checkpoint>, RepositoryError>> + Send;
}
