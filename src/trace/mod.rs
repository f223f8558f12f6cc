// Trace log: append-only execution events and the replay verifier

pub mod record;
pub mod replay;

pub use record::{
    parse_trace, SchemaViolation, TraceRecord, TraceScope, TraceType, FEEDBACK_PAUSE_REASON,
};
pub use replay::{replay, ReplayMismatch, ReplayOutcome};
