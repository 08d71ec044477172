//! Observability setup for stepwise.
//!
//! Provides tracing subscriber initialization with structured logging.

pub mod tracing_setup;
