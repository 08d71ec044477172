//! Step executor capability and name-indexed registry.
//!
//! A `StepExecutor` performs the work behind a step's `agentId`. Executors are
//! registered by name in an `ExecutorRegistry`; the engine resolves each step's
//! `agentId` against it during validation and again at dispatch.
//!
//! Dynamic dispatch uses the blanket-impl pattern:
//! 1. `StepExecutor` uses native async fn in traits (not object-safe)
//! 2. `StepExecutorDyn` is the object-safe mirror with boxed futures
//! 3. `BoxStepExecutor` wraps `Arc<dyn StepExecutorDyn>` and delegates

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Invocation
// ---------------------------------------------------------------------------

/// Input handed to an executor for one attempt of one step.
#[derive(Debug, Clone)]
pub struct StepInvocation {
    pub execution_id: Uuid,
    pub step_id: String,
    /// Opaque task payload from the definition.
    pub task: String,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Merged execution context.
    pub context: Arc<BTreeMap<String, Value>>,
    /// Values of steps completed before this batch started.
    pub prior_results: Arc<BTreeMap<String, Value>>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors a single step attempt can end with.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepError {
    #[error("step execution failed: {0}")]
    ExecutionFailed(String),

    #[error("step timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("no step executor registered for '{0}'")]
    UnknownExecutor(String),

    #[error("step cancelled")]
    Cancelled,
}

impl StepError {
    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StepError::ExecutionFailed(_) | StepError::Timeout { .. }
        )
    }
}

// ---------------------------------------------------------------------------
// StepExecutor
// ---------------------------------------------------------------------------

/// The capability that carries out a step's task.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait StepExecutor: Send + Sync {
    fn invoke(
        &self,
        invocation: &StepInvocation,
    ) -> impl Future<Output = Result<Value, StepError>> + Send;
}

/// Object-safe version of [`StepExecutor`] with boxed futures.
pub trait StepExecutorDyn: Send + Sync {
    fn invoke_boxed<'a>(
        &'a self,
        invocation: &'a StepInvocation,
    ) -> Pin<Box<dyn Future<Output = Result<Value, StepError>> + Send + 'a>>;
}

/// Blanket implementation: any `StepExecutor` automatically implements `StepExecutorDyn`.
impl<T: StepExecutor> StepExecutorDyn for T {
    fn invoke_boxed<'a>(
        &'a self,
        invocation: &'a StepInvocation,
    ) -> Pin<Box<dyn Future<Output = Result<Value, StepError>> + Send + 'a>> {
        Box::pin(self.invoke(invocation))
    }
}

/// Type-erased, cheaply cloneable step executor.
#[derive(Clone)]
pub struct BoxStepExecutor {
    inner: Arc<dyn StepExecutorDyn>,
}

impl BoxStepExecutor {
    pub fn new<T: StepExecutor + 'static>(executor: T) -> Self {
        Self {
            inner: Arc::new(executor),
        }
    }

    pub async fn invoke(&self, invocation: &StepInvocation) -> Result<Value, StepError> {
        self.inner.invoke_boxed(invocation).await
    }
}

impl std::fmt::Debug for BoxStepExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxStepExecutor").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// ExecutorRegistry
// ---------------------------------------------------------------------------

/// Registry of step executors keyed by `agentId`.
pub struct ExecutorRegistry {
    executors: HashMap<String, BoxStepExecutor>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    /// Register an executor under `name`, replacing any previous one.
    pub fn register<T: StepExecutor + 'static>(&mut self, name: impl Into<String>, executor: T) {
        self.register_boxed(name, BoxStepExecutor::new(executor));
    }

    pub fn register_boxed(&mut self, name: impl Into<String>, executor: BoxStepExecutor) {
        let name = name.into();
        tracing::debug!(executor = %name, "registered step executor");
        self.executors.insert(name, executor);
    }

    pub fn get(&self, name: &str) -> Option<&BoxStepExecutor> {
        self.executors.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.executors.contains_key(name)
    }

    /// Registered executor names, sorted.
    pub fn list_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.executors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
