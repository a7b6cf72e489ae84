//! Error types for the dependency graph

use thiserror::Error;

pub type Result<T> = std::result::Result<T, GraphError>;

/// Errors are `Clone` so that a single failed batch fetch can be handed to
/// every caller waiting on it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Cycle detected among nodes: {0:?}")]
    CycleDetected(Vec<String>),

    #[error("Circular component without a circular handler: {0:?}")]
    CircularComponent(Vec<String>),

    #[error("Transaction conflict: {0}")]
    TransactionConflict(String),

    #[error("Gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    #[error("Transaction threshold {0} cannot hold a single edge")]
    InvalidThreshold(usize),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl GraphError {
    /// Conflicts are the only errors worth retrying: another writer touched
    /// one of the rows we read.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GraphError::TransactionConflict(_))
    }
}

impl From<sled::Error> for GraphError {
    fn from(e: sled::Error) -> Self {
        GraphError::Store(e.to_string())
    }
}

impl From<serde_json::Error> for GraphError {
    fn from(e: serde_json::Error) -> Self {
        GraphError::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for GraphError {
    fn from(e: std::io::Error) -> Self {
        GraphError::Io(e.to_string())
    }
}
