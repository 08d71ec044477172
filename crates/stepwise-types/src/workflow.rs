//! Workflow domain types for stepwise.
//!
//! Defines the canonical in-memory representation of a workflow definition
//! (parsed from YAML or JSON), the per-step runtime state tracked during a run,
//! the batch execution plan, checkpoints, and the records persisted through
//! the checkpoint store.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Version assigned to definitions that do not declare one.
pub const DEFAULT_WORKFLOW_VERSION: &str = "1.0.0";

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// A parsed workflow definition.
///
/// Produced by the definition parser and never mutated after validation.
/// Field names follow the camelCase wire format (`agentId`, `continueOnError`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    /// User-defined workflow identifier.
    pub id: String,
    /// Human-readable workflow name.
    pub name: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Semantic version string (default "1.0.0").
    #[serde(default = "default_version")]
    pub version: String,
    /// Ordered list of steps forming the dependency graph.
    pub steps: Vec<StepDefinition>,
    /// Initial execution context handed to every run.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, Value>,
}

fn default_version() -> String {
    DEFAULT_WORKFLOW_VERSION.to_string()
}

impl WorkflowDefinition {
    /// Look up a step by ID.
    pub fn step(&self, id: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Position of a step in the declared step list.
    pub fn step_index(&self, id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id == id)
    }

    /// All step IDs in declaration order.
    pub fn step_ids(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.id.as_str()).collect()
    }
}

/// A single step of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepDefinition {
    /// Step ID, unique within its workflow.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Name of the step executor that handles this step.
    pub agent_id: String,
    /// Opaque task payload passed to the executor.
    pub task: String,
    /// IDs of steps that must complete before this one.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Advisory only; actual parallelism comes from the graph.
    #[serde(default)]
    pub parallel: bool,
    /// Per-attempt timeout in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// Retries after the first failed attempt.
    #[serde(default)]
    pub retries: u32,
    /// Whether the run may still complete when this step fails.
    #[serde(default)]
    pub continue_on_error: bool,
}

/// Serialization format of a workflow definition document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefinitionFormat {
    Yaml,
    Json,
}

impl DefinitionFormat {
    /// Infer the format from a file extension (`yaml`, `yml`, `json`).
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "yaml" | "yml" => Some(Self::Yaml),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

impl fmt::Display for DefinitionFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DefinitionFormat::Yaml => write!(f, "yaml"),
            DefinitionFormat::Json => write!(f, "json"),
        }
    }
}

impl FromStr for DefinitionFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_extension(s).ok_or_else(|| format!("invalid definition format: '{s}'"))
    }
}

// ---------------------------------------------------------------------------
// Runtime state
// ---------------------------------------------------------------------------

/// Lifecycle status of a single step within a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    /// Whether the step has reached a final outcome.
    pub fn is_settled(&self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(StepStatus::Pending),
            "running" => Ok(StepStatus::Running),
            "completed" => Ok(StepStatus::Completed),
            "failed" => Ok(StepStatus::Failed),
            "skipped" => Ok(StepStatus::Skipped),
            other => Err(format!("invalid step status: '{other}'")),
        }
    }
}

/// Runtime state of one step, parallel to its `StepDefinition`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepRuntimeState {
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Number of executor invocations made for the last dispatch.
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// An entry of the accumulated results map.
///
/// Steps that failed under `continueOnError` keep a failure marker instead of
/// a value, so the key set of a completed run always covers every step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepResult {
    Completed { value: Value },
    Failed { error: String },
}

impl StepResult {
    /// The produced value, if the step succeeded.
    pub fn value(&self) -> Option<&Value> {
        match self {
            StepResult::Completed { value } => Some(value),
            StepResult::Failed { .. } => None,
        }
    }

    /// Whether this entry is a failure marker.
    pub fn is_failure(&self) -> bool {
        matches!(self, StepResult::Failed { .. })
    }
}

/// Results keyed by step ID.
pub type ResultsMap = BTreeMap<String, StepResult>;

// ---------------------------------------------------------------------------
// Execution plan
// ---------------------------------------------------------------------------

/// Ordered sequence of batches computed from the dependency graph.
///
/// Every step appears in exactly one batch, and every dependency of a step
/// sits in a strictly earlier batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub batches: Vec<Vec<String>>,
}

impl ExecutionPlan {
    pub fn new(batches: Vec<Vec<String>>) -> Self {
        Self { batches }
    }

    /// Number of batches.
    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Step IDs of the batch at `index`.
    pub fn batch(&self, index: usize) -> Option<&[String]> {
        self.batches.get(index).map(Vec::as_slice)
    }

    /// Index of the batch that contains `step_id`.
    pub fn batch_index_of(&self, step_id: &str) -> Option<usize> {
        self.batches
            .iter()
            .position(|batch| batch.iter().any(|id| id == step_id))
    }

    /// Total number of steps across all batches.
    pub fn step_count(&self) -> usize {
        self.batches.iter().map(Vec::len).sum()
    }
}

// ---------------------------------------------------------------------------
// Error codes
// ---------------------------------------------------------------------------

/// Stable error code attached to a failed run.
///
/// Serialized as its string form (`"STEP_FAILURE"`), so callers can match on it
/// without depending on this enum.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ErrorCode {
    ParseError,
    ValidationError,
    GraphError,
    StepFailure,
    Cancelled,
    StoreError,
    /// Freeform code supplied with an explicit failure event.
    Other(String),
}

impl ErrorCode {
    pub fn as_str(&self) -> &str {
        match self {
            ErrorCode::ParseError => "PARSE_ERROR",
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::GraphError => "GRAPH_ERROR",
            ErrorCode::StepFailure => "STEP_FAILURE",
            ErrorCode::Cancelled => "CANCELLED",
            ErrorCode::StoreError => "STORE_ERROR",
            ErrorCode::Other(code) => code.as_str(),
        }
    }
}

impl From<String> for ErrorCode {
    fn from(s: String) -> Self {
        match s.as_str() {
            "PARSE_ERROR" => ErrorCode::ParseError,
            "VALIDATION_ERROR" => ErrorCode::ValidationError,
            "GRAPH_ERROR" => ErrorCode::GraphError,
            "STEP_FAILURE" => ErrorCode::StepFailure,
            "CANCELLED" => ErrorCode::Cancelled,
            "STORE_ERROR" => ErrorCode::StoreError,
            _ => ErrorCode::Other(s),
        }
    }
}

impl From<&str> for ErrorCode {
    fn from(s: &str) -> Self {
        ErrorCode::from(s.to_string())
    }
}

impl From<ErrorCode> for String {
    fn from(code: ErrorCode) -> Self {
        code.as_str().to_string()
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal error of a failed run: a stable code plus a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionFailure {
    pub code: ErrorCode,
    pub message: String,
}

impl ExecutionFailure {
    pub fn new(code: impl Into<ErrorCode>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ExecutionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Timing and counters for one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub total_steps: u32,
    pub completed_steps: u32,
    pub failed_steps: u32,
    pub skipped_steps: u32,
}

impl ExecutionMetrics {
    /// Wall-clock duration, once the run has ended.
    pub fn duration_ms(&self) -> Option<u64> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds().max(0) as u64),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Checkpoint
// ---------------------------------------------------------------------------

/// Immutable snapshot of a run's progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// UUIDv7 checkpoint ID.
    pub id: Uuid,
    /// Execution this checkpoint belongs to.
    pub execution_id: Uuid,
    pub created_at: DateTime<Utc>,
    /// Steps that completed successfully.
    pub completed: BTreeSet<String>,
    /// Every other step (pending, running, failed or skipped at snapshot time).
    pub pending: BTreeSet<String>,
    /// Results accumulated so far.
    pub results: ResultsMap,
}

// ---------------------------------------------------------------------------
// Persisted records
// ---------------------------------------------------------------------------

/// Overall status of a persisted execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Paused => "paused",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ExecutionStatus::Pending),
            "running" => Ok(ExecutionStatus::Running),
            "paused" => Ok(ExecutionStatus::Paused),
            "completed" => Ok(ExecutionStatus::Completed),
            "failed" => Ok(ExecutionStatus::Failed),
            "cancelled" => Ok(ExecutionStatus::Cancelled),
            other => Err(format!("invalid execution status: '{other}'")),
        }
    }
}

/// Durable record of a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub id: String,
    pub name: String,
    pub version: String,
    /// JSON serialization of the parsed `WorkflowDefinition`.
    pub definition: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Durable record of one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// UUIDv7 execution ID.
    pub id: Uuid,
    pub workflow_id: String,
    /// JSON snapshot of the `WorkflowDefinition` this execution was planned
    /// from. Resume rebuilds the plan from it, so re-registering the
    /// workflow under the same id never changes an existing execution.
    pub definition: String,
    pub status: ExecutionStatus,
    pub completed_count: u32,
    pub total_count: u32,
    /// Initial context the run was started with, merged over the definition's.
    #[serde(default)]
    pub context: BTreeMap<String, Value>,
    /// Results accumulated so far (final results once completed).
    #[serde(default)]
    pub results: ResultsMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionFailure>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Durable record of one step within an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub execution_id: Uuid,
    pub step_id: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
