//! Workflow definition parsing, validation, and filesystem loading.
//!
//! Converts between YAML/JSON documents and the canonical `WorkflowDefinition`,
//! and validates structural constraints (required fields, unique IDs, known
//! dependencies, semantic version).

use std::collections::HashSet;
use std::path::Path;

use stepwise_types::workflow::{DefinitionFormat, ErrorCode, WorkflowDefinition};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur while turning a document into a runnable plan.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// YAML/JSON parse failure.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// A step references an unknown dependency.
    #[error("unknown dependency: {0}")]
    UnknownDependency(String),

    /// Dependency graph contains a cycle.
    #[error("dependency cycle detected among steps: {}", .steps.join(", "))]
    CycleDetected { steps: Vec<String> },

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl WorkflowError {
    /// The run-level error code this failure maps to.
    pub fn code(&self) -> ErrorCode {
        match self {
            WorkflowError::ParseError(_) | WorkflowError::IoError(_) => ErrorCode::ParseError,
            WorkflowError::ValidationError(_) | WorkflowError::UnknownDependency(_) => {
                ErrorCode::ValidationError
            }
            WorkflowError::CycleDetected { .. } => ErrorCode::GraphError,
        }
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Deserialize a document without validating it.
pub fn deserialize_definition(
    text: &str,
    format: DefinitionFormat,
) -> Result<WorkflowDefinition, WorkflowError> {
    match format {
        DefinitionFormat::Yaml => {
            serde_yaml_ng::from_str(text).map_err(|e| WorkflowError::ParseError(e.to_string()))
        }
        DefinitionFormat::Json => {
            serde_json::from_str(text).map_err(|e| WorkflowError::ParseError(e.to_string()))
        }
    }
}

/// Parse a document into a validated `WorkflowDefinition`.
pub fn parse_definition(
    text: &str,
    format: DefinitionFormat,
) -> Result<WorkflowDefinition, WorkflowError> {
    let def = deserialize_definition(text, format)?;
    validate_definition(&def)?;
    Ok(def)
}

/// Parse a YAML string into a validated `WorkflowDefinition`.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDefinition, WorkflowError> {
    parse_definition(yaml, DefinitionFormat::Yaml)
}

/// Parse a JSON string into a validated `WorkflowDefinition`.
pub fn parse_workflow_json(json: &str) -> Result<WorkflowDefinition, WorkflowError> {
    parse_definition(json, DefinitionFormat::Json)
}

/// Serialize a `WorkflowDefinition` in the given format.
pub fn serialize_definition(
    def: &WorkflowDefinition,
    format: DefinitionFormat,
) -> Result<String, WorkflowError> {
    match format {
        DefinitionFormat::Yaml => {
            serde_yaml_ng::to_string(def).map_err(|e| WorkflowError::ParseError(e.to_string()))
        }
        DefinitionFormat::Json => serde_json::to_string_pretty(def)
            .map_err(|e| WorkflowError::ParseError(e.to_string())),
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a `WorkflowDefinition`.
///
/// Checks:
/// - Workflow `id` and `name` are non-empty
/// - `version` is a valid semantic version
/// - At least one step exists
/// - Every step has a non-empty `id`, `name` and `agentId`
/// - Timeout > 0 if set
/// - All step IDs are unique
/// - All `dependencies` point to existing step IDs
///
/// Cycles are not detected here; see `dag::build_execution_plan`.
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), WorkflowError> {
    if def.id.trim().is_empty() {
        return Err(WorkflowError::ValidationError(
            "workflow id must not be empty".to_string(),
        ));
    }
    if def.name.trim().is_empty() {
        return Err(WorkflowError::ValidationError(
            "workflow name must not be empty".to_string(),
        ));
    }
    if let Err(e) = semver::Version::parse(&def.version) {
        return Err(WorkflowError::ValidationError(format!(
            "workflow version '{}' is not a valid semantic version: {e}",
            def.version
        )));
    }

    if def.steps.is_empty() {
        return Err(WorkflowError::ValidationError(
            "workflow must have at least one step".to_string(),
        ));
    }

    let mut seen_ids = HashSet::new();
    for (index, step) in def.steps.iter().enumerate() {
        if step.id.trim().is_empty() {
            return Err(WorkflowError::ValidationError(format!(
                "step at position {index} has an empty id"
            )));
        }
        if step.name.trim().is_empty() {
            return Err(WorkflowError::ValidationError(format!(
                "step '{}' has an empty name",
                step.id
            )));
        }
        if step.agent_id.trim().is_empty() {
            return Err(WorkflowError::ValidationError(format!(
                "step '{}' has an empty agentId",
                step.id
            )));
        }
        if step.timeout == Some(0) {
            return Err(WorkflowError::ValidationError(format!(
                "step '{}' timeout must be > 0",
                step.id
            )));
        }
        if !seen_ids.insert(step.id.as_str()) {
            return Err(WorkflowError::ValidationError(format!(
                "duplicate step ID: '{}'",
                step.id
            )));
        }
    }

    for step in &def.steps {
        for dep in &step.dependencies {
            if !seen_ids.contains(dep.as_str()) {
                return Err(WorkflowError::UnknownDependency(format!(
                    "step '{}' depends on unknown step '{}'",
                    step.id, dep
                )));
            }
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Filesystem
// ---------------------------------------------------------------------------

/// Load and validate a workflow definition from a `.yaml`, `.yml` or `.json` file.
pub fn load_workflow_file(path: &Path) -> Result<WorkflowDefinition, WorkflowError> {
    let format = path
        .extension()
        .and_then(|ext| ext.to_str())
        .and_then(DefinitionFormat::from_extension)
        .ok_or_else(|| {
            WorkflowError::ParseError(format!(
                "cannot infer definition format from '{}'",
                path.display()
            ))
        })?;
    let content = std::fs::read_to_string(path)?;
    parse_definition(&content, format)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
