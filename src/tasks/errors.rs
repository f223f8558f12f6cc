use thiserror::Error;

use super::types::TaskState;
use crate::trace::SchemaViolation;
use crate::workflows::EngineError;

/// Errors surfaced by task persistence and the single-writer tick path.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("task {task_id} is held by {holder:?} (state {state})")]
    ClaimConflict {
        task_id: String,
        holder: Option<String>,
        state: TaskState,
    },

    #[error("claim on task {task_id} is not held by {token}")]
    StaleClaim { task_id: String, token: String },

    #[error("task {0} not found")]
    NotFound(String),

    #[error("task {0} already exists")]
    AlreadyExists(String),

    #[error("task {task_id} is {state}, not waiting for feedback")]
    NotWaitingForFeedback { task_id: String, state: TaskState },

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("trace rejected: {0}")]
    Schema(#[from] SchemaViolation),

    #[error("failed to encode task state: {0}")]
    Encoding(#[from] serde_json::Error),

    #[cfg(feature = "database")]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("store error: {0}")]
    Store(#[source] anyhow::Error),
}
