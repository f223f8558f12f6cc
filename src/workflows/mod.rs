// Workflow definitions and the engine that interprets them

pub mod agent;
pub mod context;
pub mod definition;
pub mod engine;
pub mod errors;

pub use agent::{
    agent_fn, guard_fn, select_fn, sync_agent, ActionOutcome, Agent, AgentReply, GuardFn,
    ReplyContractError, SelectFn,
};
pub use context::Context;
pub use definition::{
    ActionSpec, LoopEdges, LoopSpec, OrchestrateSpec, ResumeTarget, RetryPolicy, StateGraph,
    StateSpec, WorkflowBody, WorkflowDefinition,
};
pub use engine::{Engine, StopReason, TickOptions, TickReport};
pub use errors::EngineError;

#[cfg(any(test, feature = "testing"))]
pub use agent::MockAgent;
