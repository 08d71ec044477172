//! Workflow engine core: definition parsing, batch planning, the orchestration
//! state machine, and durable checkpointing.
//!
//! - `definition` -- YAML/JSON parsing, validation, filesystem load
//! - `dag` -- dependency graph, cycle detection, batch computation
//! - `context` -- per-execution runtime state owned by the state machine
//! - `state` -- orchestration states, events, and the transition function
//! - `checkpoint` -- checkpoint creation/restore and the store-backed manager
//! - `executor` -- step executor capability and name-indexed registry
//! - `retry` -- attempt accounting and backoff
//! - `batch` -- concurrent execution of one batch with timeouts
//! - `engine` -- the public facade that drives a run end to end

pub mod batch;
pub mod checkpoint;
pub mod context;
pub mod dag;
pub mod definition;
pub mod engine;
pub mod executor;
pub mod retry;
pub mod state;
