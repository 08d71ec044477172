//! Shared domain types for stepwise.
//!
//! Workflow definitions, runtime state, execution plans, checkpoints, persisted
//! records, engine configuration and lifecycle events.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod workflow;
