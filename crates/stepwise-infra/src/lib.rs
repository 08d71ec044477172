//! Infrastructure layer for stepwise.
//!
//! Contains the SQLite implementation of the `CheckpointStore` port defined
//! in `stepwise-core`, and the TOML engine configuration loader.

pub mod config;
pub mod sqlite;
