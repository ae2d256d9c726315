//! Domain errors for the undercity engine.

use thiserror::Error;

/// Engine-level errors shared across components.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Invalid status transition from {from} to {to}")]
    InvalidStatusTransition { from: String, to: String },

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Git operation failed: {0}")]
    Git(String),

    #[error("Agent invocation failed: {0}")]
    Agent(String),

    #[error("Index error: {0}")]
    Index(String),

    #[error("State file error: {0}")]
    State(String),

    #[error("Another engine instance holds the lock (pid {pid}, started {started_at})")]
    LockHeld { pid: i32, started_at: String },

    #[error("Insufficient disk space: {available_bytes} bytes available, {required_bytes} required")]
    DiskSpace {
        available_bytes: u64,
        required_bytes: u64,
    },

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        EngineError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}
