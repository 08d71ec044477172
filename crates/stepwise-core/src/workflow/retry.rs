//! Retry accounting for step execution.
//!
//! A step is attempted once plus `retries` more times. Only transient errors
//! (executor failure, timeout) consume further attempts.

use std::time::Duration;

use stepwise_types::config::EngineConfig;
use stepwise_types::workflow::StepDefinition;

use super::executor::StepError;

/// Stateless retry handler for step failures.
///
/// No internal state; all logic is in associated functions that take the
/// step definition and configuration as parameters.
pub struct RetryHandler;

impl RetryHandler {
    /// Total number of attempts allowed for `step`.
    pub fn max_attempts(step: &StepDefinition) -> u32 {
        step.retries.saturating_add(1)
    }

    /// Determine whether another attempt should be made.
    ///
    /// `attempt` is 1-based (first execution is attempt 1).
    pub fn should_retry(step: &StepDefinition, attempt: u32, error: &StepError) -> bool {
        error.is_retryable() && attempt < Self::max_attempts(step)
    }

    /// Fixed pause between two attempts of the same step.
    pub fn retry_delay(config: &EngineConfig) -> Duration {
        Duration::from_millis(config.retry_backoff_ms)
    }
}
