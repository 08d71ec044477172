//! SQLite checkpoint store implementation.
//!
//! Implements `CheckpointStore` from `stepwise-core` using sqlx with split
//! read/write pools. Definitions, contexts, results and checkpoint step sets
//! are stored as JSON text columns; timestamps as RFC 3339 strings.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::Row;
use stepwise_core::repository::checkpoint::CheckpointStore;
use stepwise_types::error::RepositoryError;
use stepwise_types::workflow::{
    Checkpoint, ErrorCode, ExecutionFailure, ExecutionRecord, ExecutionStatus, ResultsMap,
    StepRecord, StepStatus, WorkflowRecord,
};
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `CheckpointStore`.
#[derive(Debug, Clone)]
pub struct SqliteCheckpointStore {
    pool: DatabasePool,
}

impl SqliteCheckpointStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DatabasePool {
        &self.pool
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct WorkflowRow {
    id: String,
    name: String,
    version: String,
    definition: String,
    created_at: String,
    updated_at: String,
}

impl WorkflowRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            version: row.try_get("version")?,
            definition: row.try_get("definition")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_record(self) -> Result<WorkflowRecord, RepositoryError> {
        Ok(WorkflowRecord {
            id: self.id,
            name: self.name,
            version: self.version,
            definition: self.definition,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

struct ExecutionRow {
    id: String,
    workflow_id: String,
    definition: String,
    status: String,
    completed_count: i64,
    total_count: i64,
    context: String,
    results: String,
    error_code: Option<String>,
    error_message: Option<String>,
    started_at: String,
    updated_at: String,
    completed_at: Option<String>,
}

impl ExecutionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow_id: row.try_get("workflow_id")?,
            definition: row.try_get("definition")?,
            status: row.try_get("status")?,
            completed_count: row.try_get("completed_count")?,
            total_count: row.try_get("total_count")?,
            context: row.try_get("context")?,
            results: row.try_get("results")?,
            error_code: row.try_get("error_code")?,
            error_message: row.try_get("error_message")?,
            started_at: row.try_get("started_at")?,
            updated_at: row.try_get("updated_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    fn into_record(self) -> Result<ExecutionRecord, RepositoryError> {
        let status: ExecutionStatus = self.status.parse().map_err(RepositoryError::Query)?;
        let context: BTreeMap<String, Value> = parse_json(&self.context, "execution context")?;
        let results: ResultsMap = parse_json(&self.results, "execution results")?;
        let error = self.error_code.map(|code| ExecutionFailure {
            code: ErrorCode::from(code),
            message: self.error_message.unwrap_or_default(),
        });

        Ok(ExecutionRecord {
            id: parse_uuid(&self.id)?,
            workflow_id: self.workflow_id,
            definition: self.definition,
            status,
            completed_count: self.completed_count as u32,
            total_count: self.total_count as u32,
            context,
            results,
            error,
            started_at: parse_datetime(&self.started_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
            completed_at: self
                .completed_at
                .as_deref()
                .map(parse_datetime)
                .transpose()?,
        })
    }
}

struct StepRow {
    execution_id: String,
    step_id: String,
    status: String,
    result: Option<String>,
    error: Option<String>,
    attempts: i64,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl StepRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            execution_id: row.try_get("execution_id")?,
            step_id: row.try_get("step_id")?,
            status: row.try_get("status")?,
            result: row.try_get("result")?,
            error: row.try_get("error")?,
            attempts: row.try_get("attempts")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    fn into_record(self) -> Result<StepRecord, RepositoryError> {
        let status: StepStatus = self.status.parse().map_err(RepositoryError::Query)?;
        let result = self
            .result
            .as_deref()
            .map(|s| parse_json(s, "step result"))
            .transpose()?;

        Ok(StepRecord {
            execution_id: parse_uuid(&self.execution_id)?,
            step_id: self.step_id,
            status,
            result,
            error: self.error,
            attempts: self.attempts as u32,
            started_at: self.started_at.as_deref().map(parse_datetime).transpose()?,
            completed_at: self
                .completed_at
                .as_deref()
                .map(parse_datetime)
                .transpose()?,
        })
    }
}

struct CheckpointRow {
    id: String,
    execution_id: String,
    created_at: String,
    completed: String,
    pending: String,
    results: String,
}

impl CheckpointRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            execution_id: row.try_get("execution_id")?,
            created_at: row.try_get("created_at")?,
            completed: row.try_get("completed")?,
            pending: row.try_get("pending")?,
            results: row.try_get("results")?,
        })
    }

    fn into_checkpoint(self) -> Result<Checkpoint, RepositoryError> {
        let completed: BTreeSet<String> = parse_json(&self.completed, "checkpoint completed set")?;
        let pending: BTreeSet<String> = parse_json(&self.pending, "checkpoint pending set")?;
        let results: ResultsMap = parse_json(&self.results, "checkpoint results")?;

        Ok(Checkpoint {
            id: parse_uuid(&self.id)?,
            execution_id: parse_uuid(&self.execution_id)?,
            created_at: parse_datetime(&self.created_at)?,
            completed,
            pending,
            results,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn parse_json<T: serde::de::DeserializeOwned>(s: &str, what: &str) -> Result<T, RepositoryError> {
    serde_json::from_str(s).map_err(|e| RepositoryError::Query(format!("invalid {what} JSON: {e}")))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Query(e.to_string()))
}

/// Map a sqlx error, surfacing primary-key collisions as `Conflict`.
fn write_error(e: sqlx::Error) -> RepositoryError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            RepositoryError::Conflict(db.message().to_string())
        }
        _ => RepositoryError::Query(e.to_string()),
    }
}

fn read_error(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

// ---------------------------------------------------------------------------
// CheckpointStore impl
// ---------------------------------------------------------------------------

impl CheckpointStore for SqliteCheckpointStore {
    async fn save_workflow(&self, record: &WorkflowRecord) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO workflows (id, name, version, definition, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 version = excluded.version,
                 definition = excluded.definition,
                 updated_at = excluded.updated_at"#,
        )
        .bind(&record.id)
        .bind(&record.name)
        .bind(&record.version)
        .bind(&record.definition)
        .bind(format_datetime(&record.created_at))
        .bind(format_datetime(&record.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(write_error)?;

        Ok(())
    }

    async fn get_workflow(&self, id: &str) -> Result<Option<WorkflowRecord>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM workflows WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(read_error)?;

        row.map(|row| WorkflowRow::from_row(&row).map_err(read_error)?.into_record())
            .transpose()
    }

    async fn create_execution(&self, record: &ExecutionRecord) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO executions
               (id, workflow_id, definition, status, completed_count, total_count, context,
                results, error_code, error_message, started_at, updated_at, completed_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(record.id.to_string())
        .bind(&record.workflow_id)
        .bind(&record.definition)
        .bind(record.status.to_string())
        .bind(record.completed_count as i64)
        .bind(record.total_count as i64)
        .bind(to_json(&record.context)?)
        .bind(to_json(&record.results)?)
        .bind(record.error.as_ref().map(|e| e.code.as_str().to_string()))
        .bind(record.error.as_ref().map(|e| e.message.clone()))
        .bind(format_datetime(&record.started_at))
        .bind(format_datetime(&record.updated_at))
        .bind(record.completed_at.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(write_error)?;

        Ok(())
    }

    async fn update_execution(&self, record: &ExecutionRecord) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE executions SET
                 status = ?, completed_count = ?, total_count = ?, context = ?, results = ?,
                 error_code = ?, error_message = ?, started_at = ?, updated_at = ?, completed_at = ?
               WHERE id = ?"#,
        )
        .bind(record.status.to_string())
        .bind(record.completed_count as i64)
        .bind(record.total_count as i64)
        .bind(to_json(&record.context)?)
        .bind(to_json(&record.results)?)
        .bind(record.error.as_ref().map(|e| e.code.as_str().to_string()))
        .bind(record.error.as_ref().map(|e| e.message.clone()))
        .bind(format_datetime(&record.started_at))
        .bind(format_datetime(&record.updated_at))
        .bind(record.completed_at.as_ref().map(format_datetime))
        .bind(record.id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(write_error)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn get_execution(&self, id: &Uuid) -> Result<Option<ExecutionRecord>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM executions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(read_error)?;

        row.map(|row| ExecutionRow::from_row(&row).map_err(read_error)?.into_record())
            .transpose()
    }

    async fn list_executions(
        &self,
        workflow_id: &str,
        limit: u32,
    ) -> Result<Vec<ExecutionRecord>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM executions WHERE workflow_id = ? ORDER BY started_at DESC, id DESC LIMIT ?",
        )
        .bind(workflow_id)
        .bind(limit as i64)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(read_error)?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = ExecutionRow::from_row(row).map_err(read_error)?;
            records.push(r.into_record()?);
        }
        Ok(records)
    }

    async fn upsert_step(&self, record: &StepRecord) -> Result<(), RepositoryError> {
        let result = record.result.as_ref().map(to_json).transpose()?;

        sqlx::query(
            r#"INSERT INTO execution_steps
               (execution_id, step_id, status, result, error, attempts, started_at, completed_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(execution_id, step_id) DO UPDATE SET
                 status = excluded.status,
                 result = excluded.result,
                 error = excluded.error,
                 attempts = excluded.attempts,
                 started_at = excluded.started_at,
                 completed_at = excluded.completed_at"#,
        )
        .bind(record.execution_id.to_string())
        .bind(&record.step_id)
        .bind(record.status.to_string())
        .bind(&result)
        .bind(&record.error)
        .bind(record.attempts as i64)
        .bind(record.started_at.as_ref().map(format_datetime))
        .bind(record.completed_at.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(write_error)?;

        Ok(())
    }

    async fn list_steps(&self, execution_id: &Uuid) -> Result<Vec<StepRecord>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM execution_steps WHERE execution_id = ? ORDER BY started_at ASC, step_id ASC",
        )
        .bind(execution_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(read_error)?;

        let mut steps = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = StepRow::from_row(row).map_err(read_error)?;
            steps.push(r.into_record()?);
        }
        Ok(steps)
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO checkpoints (id, execution_id, created_at, completed, pending, results)
               VALUES (?, ?, ?, ?, ?, ?)"#,
        )
        .bind(checkpoint.id.to_string())
        .bind(checkpoint.execution_id.to_string())
        .bind(format_datetime(&checkpoint.created_at))
        .bind(to_json(&checkpoint.completed)?)
        .bind(to_json(&checkpoint.pending)?)
        .bind(to_json(&checkpoint.results)?)
        .execute(&self.pool.writer)
        .await
        .map_err(write_error)?;

        Ok(())
    }

    async fn get_checkpoint(&self, id: &Uuid) -> Result<Option<Checkpoint>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM checkpoints WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(read_error)?;

        row.map(|row| CheckpointRow::from_row(&row).map_err(read_error)?.into_checkpoint())
            .transpose()
    }

    async fn list_checkpoints(
        &self,
        execution_id: &Uuid,
    ) -> Result<Vec<Checkpoint>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM checkpoints WHERE execution_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(execution_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(read_error)?;

        let mut checkpoints = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = CheckpointRow::from_row(row).map_err(read_error)?;
            checkpoints.push(r.into_checkpoint()?);
        }
        Ok(checkpoints)
    }

    async fn latest_checkpoint(
        &self,
        execution_id: &Uuid,
    ) -> Result<Option<Checkpoint>, RepositoryError> {
        let row = sqlx::query(
            "SELECT * FROM checkpoints WHERE execution_id = ? ORDER BY created_at DESC, id DESC LIMIT 1",
        )
        .bind(execution_id.to_string())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(read_error)?;

        row.map(|row| CheckpointRow::from_row(&row).map_err(read_error)?.into_checkpoint())
            .transpose()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
