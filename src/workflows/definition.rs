// Workflow definitions: state graphs built from tagged state specs, or composed pipes

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use super::agent::{Agent, GuardFn, SelectFn};
use super::context::Context;
use super::errors::EngineError;
use crate::pipe::Op;
use crate::tasks::TerminalStatus;

pub const EVENT_DONE: &str = "done";
pub const EVENT_FAILED: &str = "failed";
pub const EVENT_FEEDBACK: &str = "feedback";

/// Where a paused task re-enters once feedback arrives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "state_id")]
pub enum ResumeTarget {
    /// Re-enter the state that led to the pause.
    PreviousState,
    ExplicitState(String),
}

impl ResumeTarget {
    pub fn resolve(&self, previous: &str) -> String {
        match self {
            ResumeTarget::PreviousState => previous.to_string(),
            ResumeTarget::ExplicitState(id) => id.clone(),
        }
    }
}

/// Retry policy of an action state. `max` counts retries, not attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max: u32,
    pub backoff_ms: u64,
}

pub struct ActionSpec {
    pub agent: Arc<dyn Agent>,
    pub on: BTreeMap<String, String>,
    pub retries: Option<RetryPolicy>,
}

impl ActionSpec {
    pub fn new(agent: Arc<dyn Agent>) -> Self {
        Self {
            agent,
            on: BTreeMap::new(),
            retries: None,
        }
    }

    pub fn on(mut self, event: impl Into<String>, target: impl Into<String>) -> Self {
        self.on.insert(event.into(), target.into());
        self
    }

    pub fn retries(mut self, max: u32, backoff_ms: u64) -> Self {
        self.retries = Some(RetryPolicy { max, backoff_ms });
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.retries.map(|r| r.max).unwrap_or(0)
    }

    pub fn backoff_ms(&self) -> u64 {
        self.retries.map(|r| r.backoff_ms).unwrap_or(0)
    }
}

pub struct OrchestrateSpec {
    pub select: SelectFn,
    pub on: BTreeMap<String, String>,
}

impl OrchestrateSpec {
    pub fn new(select: SelectFn) -> Self {
        Self {
            select,
            on: BTreeMap::new(),
        }
    }

    pub fn on(mut self, event: impl Into<String>, target: impl Into<String>) -> Self {
        self.on.insert(event.into(), target.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopEdges {
    /// Defaults to the loop body when unset.
    pub continue_to: Option<String>,
    pub done: String,
    pub exhausted: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopSpec {
    pub body: String,
    pub until: String,
    pub max: u32,
    pub on: LoopEdges,
}

impl LoopSpec {
    pub fn new(
        body: impl Into<String>,
        until: impl Into<String>,
        max: u32,
        done: impl Into<String>,
        exhausted: impl Into<String>,
    ) -> Self {
        Self {
            body: body.into(),
            until: until.into(),
            max,
            on: LoopEdges {
                continue_to: None,
                done: done.into(),
                exhausted: exhausted.into(),
            },
        }
    }

    pub fn continue_to(mut self, target: impl Into<String>) -> Self {
        self.on.continue_to = Some(target.into());
        self
    }

    pub fn continue_target(&self) -> &str {
        self.on.continue_to.as_deref().unwrap_or(&self.body)
    }
}

/// A single state of a graph workflow.
pub enum StateSpec {
    Action(ActionSpec),
    Orchestrate(OrchestrateSpec),
    Loop(LoopSpec),
    Feedback { resume: ResumeTarget },
    Done,
    Blocked,
    Failed,
}

impl StateSpec {
    pub fn action(agent: Arc<dyn Agent>) -> ActionSpec {
        ActionSpec::new(agent)
    }

    pub fn orchestrate(select: SelectFn) -> OrchestrateSpec {
        OrchestrateSpec::new(select)
    }

    pub fn feedback(resume: ResumeTarget) -> Self {
        StateSpec::Feedback { resume }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StateSpec::Action(_) => "action",
            StateSpec::Orchestrate(_) => "orchestrate",
            StateSpec::Loop(_) => "loop",
            StateSpec::Feedback { .. } => "feedback",
            StateSpec::Done => "done",
            StateSpec::Blocked => "blocked",
            StateSpec::Failed => "failed",
        }
    }

    pub fn terminal_status(&self) -> Option<TerminalStatus> {
        match self {
            StateSpec::Done => Some(TerminalStatus::Done),
            StateSpec::Blocked => Some(TerminalStatus::Blocked),
            StateSpec::Failed => Some(TerminalStatus::Failed),
            _ => None,
        }
    }

    fn targets(&self) -> Vec<&str> {
        match self {
            StateSpec::Action(spec) => spec.on.values().map(String::as_str).collect(),
            StateSpec::Orchestrate(spec) => spec.on.values().map(String::as_str).collect(),
            StateSpec::Loop(spec) => vec![
                spec.body.as_str(),
                spec.continue_target(),
                spec.on.done.as_str(),
                spec.on.exhausted.as_str(),
            ],
            StateSpec::Feedback {
                resume: ResumeTarget::ExplicitState(id),
            } => vec![id.as_str()],
            _ => Vec::new(),
        }
    }
}

impl From<ActionSpec> for StateSpec {
    fn from(spec: ActionSpec) -> Self {
        StateSpec::Action(spec)
    }
}

impl From<OrchestrateSpec> for StateSpec {
    fn from(spec: OrchestrateSpec) -> Self {
        StateSpec::Orchestrate(spec)
    }
}

impl From<LoopSpec> for StateSpec {
    fn from(spec: LoopSpec) -> Self {
        StateSpec::Loop(spec)
    }
}

impl fmt::Debug for StateSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateSpec::Action(spec) => f
                .debug_struct("Action")
                .field("on", &spec.on)
                .field("retries", &spec.retries)
                .finish_non_exhaustive(),
            StateSpec::Orchestrate(spec) => f
                .debug_struct("Orchestrate")
                .field("on", &spec.on)
                .finish_non_exhaustive(),
            StateSpec::Loop(spec) => f.debug_tuple("Loop").field(spec).finish(),
            StateSpec::Feedback { resume } => {
                f.debug_struct("Feedback").field("resume", resume).finish()
            }
            other => f.write_str(other.kind()),
        }
    }
}

/// State-machine form of a workflow.
#[derive(Default)]
pub struct StateGraph {
    pub start: String,
    pub states: BTreeMap<String, StateSpec>,
    pub guards: BTreeMap<String, GuardFn>,
}

impl StateGraph {
    pub fn state(&self, id: &str) -> Result<&StateSpec, EngineError> {
        self.states.get(id).ok_or_else(|| EngineError::UnknownState {
            state_id: id.to_string(),
        })
    }
}

pub enum WorkflowBody {
    Graph(StateGraph),
    Pipe(Op),
}

/// A workflow a task is bound to.
pub struct WorkflowDefinition {
    pub id: String,
    pub context: Context,
    pub body: WorkflowBody,
}

impl WorkflowDefinition {
    pub fn graph(id: impl Into<String>, start: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            context: Context::new(),
            body: WorkflowBody::Graph(StateGraph {
                start: start.into(),
                ..Default::default()
            }),
        }
    }

    pub fn pipe(id: impl Into<String>, op: Op) -> Self {
        Self {
            id: id.into(),
            context: Context::new(),
            body: WorkflowBody::Pipe(op),
        }
    }

    pub fn context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }

    /// Add a state. Ignored for pipe workflows.
    pub fn state(mut self, id: impl Into<String>, spec: impl Into<StateSpec>) -> Self {
        if let WorkflowBody::Graph(graph) = &mut self.body {
            graph.states.insert(id.into(), spec.into());
        }
        self
    }

    /// Register a named guard. Ignored for pipe workflows.
    pub fn guard(mut self, id: impl Into<String>, guard: GuardFn) -> Self {
        if let WorkflowBody::Graph(graph) = &mut self.body {
            graph.guards.insert(id.into(), guard);
        }
        self
    }

    pub fn is_pipe(&self) -> bool {
        matches!(self.body, WorkflowBody::Pipe(_))
    }

    /// Check that every reference in the graph resolves.
    pub fn validate(&self) -> Result<(), EngineError> {
        let graph = match &self.body {
            WorkflowBody::Graph(graph) => graph,
            WorkflowBody::Pipe(_) => return Ok(()),
        };

        let invalid = |reason: String| EngineError::InvalidDefinition {
            workflow_id: self.id.clone(),
            reason,
        };

        if !graph.states.contains_key(&graph.start) {
            return Err(invalid(format!("start state '{}' is not defined", graph.start)));
        }

        for (id, spec) in &graph.states {
            for target in spec.targets() {
                if !graph.states.contains_key(target) {
                    return Err(invalid(format!(
                        "state '{id}' references unknown state '{target}'"
                    )));
                }
            }
            if let StateSpec::Loop(spec) = spec {
                if !graph.guards.contains_key(&spec.until) {
                    return Err(invalid(format!(
                        "loop '{id}' references unknown guard '{}'",
                        spec.until
                    )));
                }
            }
        }

        Ok(())
    }
}

impl fmt::Debug for WorkflowDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = f.debug_struct("WorkflowDefinition");
        out.field("id", &self.id).field("context", &self.context);
        match &self.body {
            WorkflowBody::Graph(graph) => out
                .field("start", &graph.start)
                .field("states", &graph.states)
                .field("guards", &graph.guards.keys().collect::<Vec<_>>()),
            WorkflowBody::Pipe(op) => out.field("pipe", op),
        };
        out.finish()
    }
}
