//! In-process checkpoint store backed by `DashMap`.
//!
//! Nothing survives the process. Used by tests and by embedders that only
//! need pause/resume within a single process lifetime.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use stepwise_types::error::RepositoryError;
use stepwise_types::workflow::{Checkpoint, ExecutionRecord, StepRecord, WorkflowRecord};
use uuid::Uuid;

use super::checkpoint::CheckpointStore;

#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    workflows: DashMap<String, WorkflowRecord>,
    executions: DashMap<Uuid, ExecutionRecord>,
    steps: DashMap<(Uuid, String), StepRecord>,
    checkpoints: DashMap<Uuid, Checkpoint>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for InMemoryCheckpointStore {
    async fn save_workflow(&self, record: &WorkflowRecord) -> Result<(), RepositoryError> {
        match self.workflows.entry(record.id.clone()) {
            Entry::Occupied(mut existing) => {
                // Keep the original creation time on upsert.
                let created_at = existing.get().created_at;
                let mut updated = record.clone();
                updated.created_at = created_at;
                existing.insert(updated);
            }
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
            }
        }
        Ok(())
    }

    async fn get_workflow(&self, id: &str) -> Result<Option<WorkflowRecord>, RepositoryError> {
        Ok(self.workflows.get(id).map(|r| r.value().clone()))
    }

    async fn create_execution(&self, record: &ExecutionRecord) -> Result<(), RepositoryError> {
        if !self.workflows.contains_key(&record.workflow_id) {
            return Err(RepositoryError::Query(format!(
                "workflow not found: {}",
                record.workflow_id
            )));
        }
        match self.executions.entry(record.id) {
            Entry::Occupied(_) => Err(RepositoryError::Conflict(format!(
                "execution already exists: {}",
                record.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(())
            }
        }
    }

    async fn update_execution(&self, record: &ExecutionRecord) -> Result<(), RepositoryError> {
        match self.executions.get_mut(&record.id) {
            Some(mut existing) => {
                // The definition snapshot is fixed at creation.
                let definition = std::mem::take(&mut existing.definition);
                *existing = record.clone();
                existing.definition = definition;
                Ok(())
            }
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn get_execution(&self, id: &Uuid) -> Result<Option<ExecutionRecord>, RepositoryError> {
        Ok(self.executions.get(id).map(|r| r.value().clone()))
    }

    async fn list_executions(
        &self,
        workflow_id: &str,
        limit: u32,
    ) -> Result<Vec<ExecutionRecord>, RepositoryError> {
        let mut records: Vec<ExecutionRecord> = self
            .executions
            .iter()
            .filter(|r| r.workflow_id == workflow_id)
            .map(|r| r.value().clone())
            .collect();
        records.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));
        records.truncate(limit as usize);
        Ok(records)
    }

    async fn upsert_step(&self, record: &StepRecord) -> Result<(), RepositoryError> {
        if !self.executions.contains_key(&record.execution_id) {
            return Err(RepositoryError::Query(format!(
                "execution not found: {}",
                record.execution_id
            )));
        }
        self.steps
            .insert((record.execution_id, record.step_id.clone()), record.clone());
        Ok(())
    }

    async fn list_steps(&self, execution_id: &Uuid) -> Result<Vec<StepRecord>, RepositoryError> {
        let mut records: Vec<StepRecord> = self
            .steps
            .iter()
            .filter(|r| r.execution_id == *execution_id)
            .map(|r| r.value().clone())
            .collect();
        records.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.step_id.cmp(&b.step_id))
        });
        Ok(records)
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), RepositoryError> {
        if !self.executions.contains_key(&checkpoint.execution_id) {
            return Err(RepositoryError::Query(format!(
                "execution not found: {}",
                checkpoint.execution_id
            )));
        }
        match self.checkpoints.entry(checkpoint.id) {
            Entry::Occupied(_) => Err(RepositoryError::Conflict(format!(
                "checkpoint already written: {}",
                checkpoint.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(checkpoint.clone());
                Ok(())
            }
        }
    }

    async fn get_checkpoint(&self, id: &Uuid) -> Result<Option<Checkpoint>, RepositoryError> {
        Ok(self.checkpoints.get(id).map(|r| r.value().clone()))
    }

    async fn list_checkpoints(
        &self,
        execution_id: &Uuid,
    ) -> Result<Vec<Checkpoint>, RepositoryError> {
        let mut checkpoints: Vec<Checkpoint> = self
            .checkpoints
            .iter()
            .filter(|c| c.execution_id == *execution_id)
            .map(|c| c.value().clone())
            .collect();
        checkpoints.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(checkpoints)
    }

    async fn latest_checkpoint(
        &self,
        execution_id: &Uuid,
    ) -> Result<Option<Checkpoint>, RepositoryError> {
        let mut checkpoints = self.list_checkpoints(execution_id).await?;
        Ok(checkpoints.pop())
    }
}
