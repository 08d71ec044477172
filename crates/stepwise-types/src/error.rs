use thiserror::Error;

/// Errors from checkpoint store operations (trait in stepwise-core,
/// implementations in stepwise-infra).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}
