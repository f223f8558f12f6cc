// Deterministic reconstruction of run state from its trace log

use std::fmt;
use thiserror::Error;
use tracing::debug;

use super::record::{TraceRecord, TraceType, FEEDBACK_PAUSE_REASON};
use crate::tasks::{TaskState, TerminalStatus};

/// Trace continuity is broken: a transition does not start where the previous one ended.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("replay mismatch at trace {trace_id}: expected transition from {expected:?}, found {found:?}")]
pub struct ReplayMismatch {
    pub trace_id: String,
    pub expected: Option<String>,
    pub found: Option<String>,
}

/// What a trace log says about its run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayOutcome {
    Terminal(TerminalStatus),
    AwaitingFeedback,
    AtState(String),
    Empty,
}

impl ReplayOutcome {
    /// Status string, `"feedback"`, or the live state id.
    pub fn as_str(&self) -> &str {
        match self {
            ReplayOutcome::Terminal(status) => status.as_str(),
            ReplayOutcome::AwaitingFeedback => "feedback",
            ReplayOutcome::AtState(state_id) => state_id,
            ReplayOutcome::Empty => "",
        }
    }

    /// Whether the replayed outcome agrees with a persisted task state.
    pub fn matches(&self, state: TaskState) -> bool {
        match self {
            ReplayOutcome::Terminal(status) => status.task_state() == state,
            ReplayOutcome::AwaitingFeedback => state == TaskState::Feedback,
            ReplayOutcome::AtState(_) => state == TaskState::Running,
            ReplayOutcome::Empty => state == TaskState::Queued,
        }
    }
}

impl fmt::Display for ReplayOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplayOutcome::Empty => f.write_str("(no traces)"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Walk the traces of one run in order and return where the run ended up.
pub fn replay(traces: &[TraceRecord]) -> Result<ReplayOutcome, ReplayMismatch> {
    let mut current_state: Option<String> = None;
    let mut waiting_for_feedback = false;

    for trace in traces {
        match trace.trace_type {
            TraceType::Started | TraceType::Resumed => {
                current_state = trace.state_id.clone();
            }
            TraceType::AwaitFeedback => {
                current_state = trace.state_id.clone();
                waiting_for_feedback = true;
            }
            TraceType::Completed => {
                if let Some(status) = trace.status {
                    return Ok(ReplayOutcome::Terminal(status));
                }
            }
            TraceType::Error => return Ok(ReplayOutcome::Terminal(TerminalStatus::Failed)),
            TraceType::Step | TraceType::Retry => {
                if trace.from_state_id != current_state && !waiting_for_feedback {
                    return Err(ReplayMismatch {
                        trace_id: trace.id.clone(),
                        expected: current_state,
                        found: trace.from_state_id.clone(),
                    });
                }
                if trace.from_state_id != current_state {
                    debug!(
                        trace_id = %trace.id,
                        from = ?trace.from_state_id,
                        "Accepting discontinuity after feedback resume"
                    );
                }
                current_state = trace.to_state_id.clone();
                waiting_for_feedback = trace.reason.as_deref() == Some(FEEDBACK_PAUSE_REASON);
            }
            TraceType::Write => {}
        }
    }

    Ok(match current_state {
        _ if waiting_for_feedback => ReplayOutcome::AwaitingFeedback,
        Some(state_id) => ReplayOutcome::AtState(state_id),
        None => ReplayOutcome::Empty,
    })
}
