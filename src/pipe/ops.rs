// Pipe vocabulary: step, flow, loop, decide, write, end

use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use super::page::PageOutput;
use crate::tasks::TerminalStatus;
use crate::workflows::{Context, GuardFn, SelectFn};

/// What a pipe step hands back to the composition.
#[derive(Debug, Clone, PartialEq)]
pub enum StepResult {
    Continue(Context),
    AwaitFeedback {
        prompt: String,
        ctx: Context,
    },
    End {
        status: TerminalStatus,
        ctx: Context,
        message: Option<String>,
    },
}

impl StepResult {
    pub fn await_feedback(prompt: impl Into<String>, ctx: Context) -> Self {
        StepResult::AwaitFeedback {
            prompt: prompt.into(),
            ctx,
        }
    }
}

impl From<Context> for StepResult {
    fn from(ctx: Context) -> Self {
        StepResult::Continue(ctx)
    }
}

pub type StepFn = Arc<dyn Fn(Context) -> BoxFuture<'static, anyhow::Result<StepResult>> + Send + Sync>;
pub type RenderFn = Arc<dyn Fn(&Context) -> anyhow::Result<PageOutput> + Send + Sync>;

/// A composed pipe operation.
pub enum Op {
    Step {
        id: String,
        run: StepFn,
    },
    Flow(Vec<Op>),
    Loop {
        body: Box<Op>,
        until: GuardFn,
        max: u32,
        on_exhausted: Box<Op>,
    },
    Decide {
        selector: SelectFn,
        branches: BTreeMap<String, Op>,
    },
    Write {
        renderer: RenderFn,
    },
    End {
        status: TerminalStatus,
        message: Option<String>,
    },
}

impl fmt::Debug for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Step { id, .. } => f.debug_struct("Step").field("id", id).finish_non_exhaustive(),
            Op::Flow(ops) => f.debug_tuple("Flow").field(ops).finish(),
            Op::Loop {
                body,
                max,
                on_exhausted,
                ..
            } => f
                .debug_struct("Loop")
                .field("body", body)
                .field("max", max)
                .field("on_exhausted", on_exhausted)
                .finish_non_exhaustive(),
            Op::Decide { branches, .. } => f
                .debug_struct("Decide")
                .field("branches", branches)
                .finish_non_exhaustive(),
            Op::Write { .. } => f.write_str("Write"),
            Op::End { status, message } => f
                .debug_struct("End")
                .field("status", status)
                .field("message", message)
                .finish(),
        }
    }
}

/// An async step.
pub fn step<F, Fut>(id: impl Into<String>, f: F) -> Op
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<StepResult>> + Send + 'static,
{
    Op::Step {
        id: id.into(),
        run: Arc::new(move |ctx| f(ctx).boxed()),
    }
}

/// A synchronous step that only transforms the context.
pub fn map_step<F>(id: impl Into<String>, f: F) -> Op
where
    F: Fn(Context) -> anyhow::Result<Context> + Send + Sync + 'static,
{
    let f = Arc::new(f);
    Op::Step {
        id: id.into(),
        run: Arc::new(move |ctx| {
            let f = Arc::clone(&f);
            async move { f(ctx).map(StepResult::Continue) }.boxed()
        }),
    }
}

/// Sequential composition.
pub fn flow(ops: impl IntoIterator<Item = Op>) -> Op {
    Op::Flow(ops.into_iter().collect())
}

/// Re-apply `body` while `until` is false, at most `max` times, then run `on_exhausted`.
pub fn repeat_until(body: Op, until: GuardFn, max: u32, on_exhausted: Op) -> Op {
    Op::Loop {
        body: Box::new(body),
        until,
        max,
        on_exhausted: Box::new(on_exhausted),
    }
}

pub fn decide<K>(selector: SelectFn, branches: impl IntoIterator<Item = (K, Op)>) -> Op
where
    K: Into<String>,
{
    Op::Decide {
        selector,
        branches: branches.into_iter().map(|(k, op)| (k.into(), op)).collect(),
    }
}

pub fn write<F>(renderer: F) -> Op
where
    F: Fn(&Context) -> anyhow::Result<PageOutput> + Send + Sync + 'static,
{
    Op::Write {
        renderer: Arc::new(renderer),
    }
}

/// Terminal operations.
pub mod end {
    use super::Op;
    use crate::tasks::TerminalStatus;

    pub fn done() -> Op {
        Op::End {
            status: TerminalStatus::Done,
            message: None,
        }
    }

    pub fn blocked(message: impl Into<String>) -> Op {
        Op::End {
            status: TerminalStatus::Blocked,
            message: Some(message.into()),
        }
    }

    pub fn failed(message: impl Into<String>) -> Op {
        Op::End {
            status: TerminalStatus::Failed,
            message: Some(message.into()),
        }
    }
}
