// Tickwork - resumable task-workflow engine
// Advances board tasks through state-machine or pipe workflows in bounded ticks

pub mod config;
#[cfg(feature = "database")]
pub mod database;
pub mod observability;
pub mod pipe;
pub mod tasks;
pub mod telemetry;
pub mod trace;
pub mod workflows;

// Re-export key types for easy access
pub use crate::config::{config, init_config, TickworkConfig};
#[cfg(feature = "database")]
pub use database::SqliteTaskStore;
pub use observability::{engine_metrics, EngineMetrics, OperationTimer};
pub use pipe::{Op, PageOutput, PageWriter, StepResult};
pub use tasks::{
    ClaimOutcome, ClaimToken, InMemoryTaskStore, Run, RunStatus, Task, TaskError, TaskRunner,
    TaskState, TaskStore, TerminalStatus, TickSummary,
};
pub use telemetry::{generate_tick_id, init_telemetry};
pub use trace::{parse_trace, replay, ReplayMismatch, ReplayOutcome, SchemaViolation, TraceRecord};
pub use workflows::{
    Agent, AgentReply, Context, Engine, EngineError, ResumeTarget, StateSpec, StopReason,
    TickOptions, TickReport, WorkflowDefinition,
};
