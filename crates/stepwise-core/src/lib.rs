//! Workflow orchestration core for stepwise.
//!
//! This crate defines the "ports" (the checkpoint store trait and the step
//! executor capability) that infrastructure and integrations implement, and
//! the engine that drives a workflow run through them. It depends only on
//! `stepwise-types` -- never on `stepwise-infra` or any database crate.

pub mod event;
pub mod repository;
pub mod workflow;
