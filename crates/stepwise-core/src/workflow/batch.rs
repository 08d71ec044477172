//! Concurrent execution of one batch.
//!
//! Every step of a batch is spawned onto a `tokio::task::JoinSet`. Each attempt
//! runs under `tokio::time::timeout` and races the run's `CancellationToken`.
//! Retries happen inside the step's task, so the engine sees exactly one
//! outcome per step. A panicking or aborted task becomes a failed outcome for
//! that step only; its siblings are unaffected.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use stepwise_types::config::EngineConfig;
use stepwise_types::event::WorkflowEvent;
use stepwise_types::workflow::StepDefinition;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::executor::{BoxStepExecutor, ExecutorRegistry, StepError, StepInvocation};
use super::retry::RetryHandler;
use crate::event::bus::EventBus;

/// Read-only inputs shared by every step of a batch.
#[derive(Debug, Clone, Default)]
pub struct BatchSnapshot {
    pub context: Arc<BTreeMap<String, Value>>,
    pub prior_results: Arc<BTreeMap<String, Value>>,
}

/// Final outcome of one step after all its attempts.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Succeeded {
        value: Value,
        attempts: u32,
        duration_ms: u64,
    },
    Failed {
        error: StepError,
        attempts: u32,
    },
}

impl StepOutcome {
    pub fn attempts(&self) -> u32 {
        match self {
            StepOutcome::Succeeded { attempts, .. } | StepOutcome::Failed { attempts, .. } => {
                *attempts
            }
        }
    }
}

// ---------------------------------------------------------------------------
// BatchExecutor
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct BatchExecutor {
    registry: Arc<ExecutorRegistry>,
    default_timeout: Option<Duration>,
    retry_delay: Duration,
    event_bus: EventBus,
}

impl BatchExecutor {
    pub fn new(registry: Arc<ExecutorRegistry>, config: &EngineConfig, event_bus: EventBus) -> Self {
        Self {
            registry,
            default_timeout: config.default_step_timeout_ms.map(Duration::from_millis),
            retry_delay: RetryHandler::retry_delay(config),
            event_bus,
        }
    }

    pub fn registry(&self) -> &ExecutorRegistry {
        &self.registry
    }

    /// Run `steps` concurrently and wait for all of them to settle.
    ///
    /// Returns one outcome per step, keyed by step ID.
    pub async fn run_batch(
        &self,
        execution_id: Uuid,
        steps: Vec<StepDefinition>,
        snapshot: &BatchSnapshot,
        cancel: &CancellationToken,
    ) -> BTreeMap<String, StepOutcome> {
        let mut outcomes = BTreeMap::new();
        let mut join_set = JoinSet::new();
        let mut task_steps = HashMap::new();

        for step in steps {
            let Some(executor) = self.registry.get(&step.agent_id).cloned() else {
                tracing::warn!(
                    execution_id = %execution_id,
                    step_id = step.id.as_str(),
                    agent_id = step.agent_id.as_str(),
                    "no executor registered for step"
                );
                outcomes.insert(
                    step.id.clone(),
                    StepOutcome::Failed {
                        error: StepError::UnknownExecutor(step.agent_id.clone()),
                        attempts: 0,
                    },
                );
                continue;
            };

            let step_id = step.id.clone();
            let run = StepRun {
                execution_id,
                timeout: step
                    .timeout
                    .map(Duration::from_millis)
                    .or(self.default_timeout),
                step,
                executor,
                snapshot: snapshot.clone(),
                retry_delay: self.retry_delay,
                cancel: cancel.clone(),
                event_bus: self.event_bus.clone(),
            };
            let handle = join_set.spawn(run.execute());
            task_steps.insert(handle.id(), step_id);
        }

        while let Some(joined) = join_set.join_next_with_id().await {
            match joined {
                Ok((task_id, outcome)) => {
                    if let Some(step_id) = task_steps.remove(&task_id) {
                        outcomes.insert(step_id, outcome);
                    }
                }
                Err(join_err) => {
                    let Some(step_id) = task_steps.remove(&join_err.id()) else {
                        continue;
                    };
                    tracing::error!(
                        execution_id = %execution_id,
                        step_id = step_id.as_str(),
                        error = %join_err,
                        "step task did not finish"
                    );
                    outcomes.insert(
                        step_id,
                        StepOutcome::Failed {
                            error: StepError::ExecutionFailed(format!(
                                "step task did not finish: {join_err}"
                            )),
                            attempts: 1,
                        },
                    );
                }
            }
        }

        outcomes
    }
}

impl std::fmt::Debug for BatchExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchExecutor")
            .field("executors", &self.registry.list_names())
            .field("default_timeout", &self.default_timeout)
            .field("retry_delay", &self.retry_delay)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Single step
// ---------------------------------------------------------------------------

/// Everything one spawned step task owns.
struct StepRun {
    execution_id: Uuid,
    step: StepDefinition,
    executor: BoxStepExecutor,
    snapshot: BatchSnapshot,
    timeout: Option<Duration>,
    retry_delay: Duration,
    cancel: CancellationToken,
    event_bus: EventBus,
}

impl StepRun {
    async fn execute(self) -> StepOutcome {
        let started = Instant::now();
        let mut attempt = 1;

        loop {
            self.event_bus.publish(WorkflowEvent::StepStarted {
                execution_id: self.execution_id,
                step_id: self.step.id.clone(),
                attempt,
            });

            let invocation = StepInvocation {
                execution_id: self.execution_id,
                step_id: self.step.id.clone(),
                task: self.step.task.clone(),
                attempt,
                context: Arc::clone(&self.snapshot.context),
                prior_results: Arc::clone(&self.snapshot.prior_results),
            };

            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Err(StepError::Cancelled),
                result = self.attempt(&invocation) => result,
            };

            match result {
                Ok(value) => {
                    let duration_ms = started.elapsed().as_millis() as u64;
                    self.event_bus.publish(WorkflowEvent::StepCompleted {
                        execution_id: self.execution_id,
                        step_id: self.step.id.clone(),
                        duration_ms,
                    });
                    tracing::debug!(
                        execution_id = %self.execution_id,
                        step_id = self.step.id.as_str(),
                        attempt,
                        duration_ms,
                        "step completed"
                    );
                    return StepOutcome::Succeeded {
                        value,
                        attempts: attempt,
                        duration_ms,
                    };
                }
                Err(error) => {
                    let will_retry = RetryHandler::should_retry(&self.step, attempt, &error);
                    self.event_bus.publish(WorkflowEvent::StepFailed {
                        execution_id: self.execution_id,
                        step_id: self.step.id.clone(),
                        error: error.to_string(),
                        will_retry,
                    });
                    tracing::warn!(
                        execution_id = %self.execution_id,
                        step_id = self.step.id.as_str(),
                        attempt,
                        will_retry,
                        error = %error,
                        "step attempt failed"
                    );

                    if !will_retry {
                        return StepOutcome::Failed {
                            error,
                            attempts: attempt,
                        };
                    }

                    if !self.retry_delay.is_zero() {
                        tokio::select! {
                            biased;
                            _ = self.cancel.cancelled() => {
                                return StepOutcome::Failed {
                                    error: StepError::Cancelled,
                                    attempts: attempt,
                                };
                            }
                            _ = tokio::time::sleep(self.retry_delay) => {}
                        }
                    }
                    attempt += 1;
                }
            }
        }
    }

    async fn attempt(&self, invocation: &StepInvocation) -> Result<Value, StepError> {
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, self.executor.invoke(invocation))
                .await
                .unwrap_or_else(|_| {
                    Err(StepError::Timeout {
                        timeout_ms: limit.as_millis() as u64,
                    })
                }),
            None => self.executor.invoke(invocation).await,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
