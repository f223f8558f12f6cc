// Pipe authoring primitives compiled onto the engine's execution substrate.
// A pipe tick runs the whole composition and is recorded against three synthetic states.

pub mod ops;
pub mod page;
pub mod runner;

/// Entry state of every pipe tick.
pub const PIPE_RUN_STATE: &str = "__pipe_run__";
/// Position of a pipe run paused for feedback.
pub const PIPE_FEEDBACK_STATE: &str = "__pipe_feedback__";
/// Exit state of a finished pipe run.
pub const PIPE_DONE_STATE: &str = "__pipe_done__";

pub use ops::{decide, end, flow, map_step, repeat_until, step, write, Op, StepResult};
pub use page::{PageOutput, PageWriter};
pub use runner::{PipeFailure, PipeOutcome, PipeRun, PipeRunner};
