// Callables supplied by workflow authors: agents, selectors and guards

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

use super::context::Context;

pub const STATUS_DONE: &str = "done";
pub const STATUS_FEEDBACK: &str = "feedback";
pub const STATUS_FAILED: &str = "failed";

/// Raw reply of an agent, before the engine validates it.
///
/// Agents backed by external processes usually produce this from JSON, so the
/// status is kept as a string and only checked when the engine consumes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentReply {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl AgentReply {
    pub fn done(data: Value) -> Self {
        Self {
            status: STATUS_DONE.to_string(),
            data: Some(data),
            message: None,
        }
    }

    pub fn done_empty() -> Self {
        Self {
            status: STATUS_DONE.to_string(),
            data: None,
            message: None,
        }
    }

    pub fn feedback(data: Value) -> Self {
        Self {
            status: STATUS_FEEDBACK.to_string(),
            data: Some(data),
            message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: STATUS_FAILED.to_string(),
            data: None,
            message: Some(message.into()),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Validate the reply against the action contract.
    pub fn into_outcome(self) -> Result<ActionOutcome, ReplyContractError> {
        let data = match self.data {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map,
            Some(other) => {
                return Err(ReplyContractError::DataNotObject {
                    found: json_kind(&other),
                })
            }
        };

        match self.status.as_str() {
            STATUS_DONE => Ok(ActionOutcome::Done {
                data,
                message: self.message,
            }),
            STATUS_FEEDBACK => Ok(ActionOutcome::Feedback {
                data,
                message: self.message,
            }),
            STATUS_FAILED => Ok(ActionOutcome::Failed {
                data,
                message: self.message,
            }),
            _ => Err(ReplyContractError::UnknownStatus(self.status)),
        }
    }
}

impl TryFrom<Value> for AgentReply {
    type Error = ReplyContractError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        serde_json::from_value(value).map_err(|e| ReplyContractError::Malformed(e.to_string()))
    }
}

/// A reply that passed contract validation.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutcome {
    Done {
        data: Map<String, Value>,
        message: Option<String>,
    },
    Feedback {
        data: Map<String, Value>,
        message: Option<String>,
    },
    Failed {
        data: Map<String, Value>,
        message: Option<String>,
    },
}

#[derive(Debug, Error, PartialEq)]
pub enum ReplyContractError {
    #[error("status '{0}' is not one of done, feedback, failed")]
    UnknownStatus(String),
    #[error("data must be an object, got {found}")]
    DataNotObject { found: &'static str },
    #[error("malformed agent reply: {0}")]
    Malformed(String),
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Performs the work of an action state.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait Agent: Send + Sync {
    async fn run(&self, ctx: &Context) -> anyhow::Result<AgentReply>;
}

/// Picks the outgoing event of an orchestrate state. Must be free of side effects.
pub type SelectFn = Arc<dyn Fn(&Context) -> anyhow::Result<String> + Send + Sync>;

/// Boolean predicate over the context (loop `until`, pipe conditions).
pub type GuardFn = Arc<dyn Fn(&Context) -> anyhow::Result<bool> + Send + Sync>;

struct AsyncFnAgent<F>(F);

#[async_trait]
impl<F, Fut> Agent for AsyncFnAgent<F>
where
    F: Fn(Context) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<AgentReply>> + Send,
{
    async fn run(&self, ctx: &Context) -> anyhow::Result<AgentReply> {
        (self.0)(ctx.clone()).await
    }
}

struct SyncFnAgent<F>(F);

#[async_trait]
impl<F> Agent for SyncFnAgent<F>
where
    F: Fn(&Context) -> anyhow::Result<AgentReply> + Send + Sync,
{
    async fn run(&self, ctx: &Context) -> anyhow::Result<AgentReply> {
        (self.0)(ctx)
    }
}

/// Wrap an async closure as an agent.
pub fn agent_fn<F, Fut>(f: F) -> Arc<dyn Agent>
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<AgentReply>> + Send + 'static,
{
    Arc::new(AsyncFnAgent(f))
}

/// Wrap a synchronous closure as an agent.
pub fn sync_agent<F>(f: F) -> Arc<dyn Agent>
where
    F: Fn(&Context) -> anyhow::Result<AgentReply> + Send + Sync + 'static,
{
    Arc::new(SyncFnAgent(f))
}

pub fn select_fn<F>(f: F) -> SelectFn
where
    F: Fn(&Context) -> anyhow::Result<String> + Send + Sync + 'static,
{
    Arc::new(f)
}

pub fn guard_fn<F>(f: F) -> GuardFn
where
    F: Fn(&Context) -> anyhow::Result<bool> + Send + Sync + 'static,
{
    Arc::new(f)
}
