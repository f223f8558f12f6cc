use thiserror::Error;

use super::agent::ReplyContractError;
use crate::tasks::TaskState;

/// Errors raised while interpreting a workflow.
///
/// Fatal variants (see [`EngineError::is_fatal_to_run`]) terminate the active run as
/// `failed`; the rest are returned to the caller without touching the task.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("workflow '{workflow_id}' is invalid: {reason}")]
    InvalidDefinition { workflow_id: String, reason: String },

    #[error("action contract violated in state '{state_id}': {reason}")]
    ActionContractViolation { state_id: String, reason: String },

    #[error("callable in state '{state_id}' raised an error: {source}")]
    Callable {
        state_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("state '{state_id}' has no transition for event '{event}'")]
    MissingTransition { state_id: String, event: String },

    #[error("unknown state '{state_id}'")]
    UnknownState { state_id: String },

    #[error("task {task_id} is already {state}")]
    TaskTerminal { task_id: String, state: TaskState },

    #[error("task {task_id} is waiting for feedback that has not been submitted")]
    FeedbackPending { task_id: String },

    #[error("run bookkeeping mismatch: {reason}")]
    RunMismatch { reason: String },

    #[error("persisted execution state is inconsistent: {reason}")]
    CorruptExecutionState { reason: String },

    #[error("page write failed: {source}")]
    PageWrite {
        #[source]
        source: anyhow::Error,
    },

    #[error("invalid tick options: {reason}")]
    InvalidOptions { reason: String },
}

impl EngineError {
    pub fn contract(state_id: &str, err: ReplyContractError) -> Self {
        EngineError::ActionContractViolation {
            state_id: state_id.to_string(),
            reason: err.to_string(),
        }
    }

    pub fn callable(state_id: &str, source: anyhow::Error) -> Self {
        EngineError::Callable {
            state_id: state_id.to_string(),
            source,
        }
    }

    /// Whether this error aborts the active run (task becomes `failed`).
    pub fn is_fatal_to_run(&self) -> bool {
        matches!(
            self,
            EngineError::ActionContractViolation { .. }
                | EngineError::Callable { .. }
                | EngineError::MissingTransition { .. }
                | EngineError::UnknownState { .. }
        )
    }

    /// Short machine-readable tag stored as the reason of `error` traces.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::InvalidDefinition { .. } => "definition.invalid",
            EngineError::ActionContractViolation { .. } => "action.contract_violation",
            EngineError::Callable { .. } => "callable.error",
            EngineError::MissingTransition { .. } => "transition.missing",
            EngineError::UnknownState { .. } => "state.unknown",
            EngineError::TaskTerminal { .. } => "task.terminal",
            EngineError::FeedbackPending { .. } => "feedback.pending",
            EngineError::RunMismatch { .. } => "run.mismatch",
            EngineError::CorruptExecutionState { .. } => "state.corrupt",
            EngineError::PageWrite { .. } => "page.write_failed",
            EngineError::InvalidOptions { .. } => "options.invalid",
        }
    }
}
