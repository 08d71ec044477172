//! Storage ports implemented by the infrastructure layer.

pub mod checkpoint;
pub mod memory;
