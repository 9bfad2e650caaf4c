use thiserror::Error;

/// Errors from repository operations (used by trait definitions in flowgate-core).
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

/// Errors from job queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue backend error: {0}")]
    Backend(String),

    #[error("job not found")]
    NotFound,
}

impl From<RepositoryError> for QueueError {
    fn from(err: RepositoryError) -> Self {
        QueueError::Backend(err.to_string())
    }
}
