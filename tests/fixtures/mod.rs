//! Shared builders for engine and runner tests
#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tickwork::pipe::{PageOutput, PageWriter};
use tickwork::tasks::{Run, Task};
use tickwork::trace::TraceRecord;
use tickwork::workflows::{
    sync_agent, Agent, AgentReply, Context, Engine, StateSpec, StopReason, TickOptions,
    WorkflowDefinition,
};

/// Agent replying from a script, repeating the last reply once the script runs out.
pub fn scripted_agent(replies: Vec<AgentReply>) -> (Arc<dyn Agent>, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let agent = sync_agent(move |_| {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        let reply = replies
            .get(n)
            .or_else(|| replies.last())
            .cloned()
            .unwrap_or_else(AgentReply::done_empty);
        Ok(reply)
    });
    (agent, calls)
}

/// Agent that increments `n` in the context.
pub fn counter_agent() -> Arc<dyn Agent> {
    sync_agent(|ctx| {
        let n = ctx.get_i64("n").unwrap_or(0);
        Ok(AgentReply::done(json!({ "n": n + 1 })))
    })
}

pub fn done_agent() -> Arc<dyn Agent> {
    sync_agent(|_| Ok(AgentReply::done_empty()))
}

pub fn ctx(value: Value) -> Context {
    Context::from_value(value).expect("context fixture must be an object")
}

/// `a -> b -> c -> finish`, every state a no-op action.
pub fn linear_workflow() -> WorkflowDefinition {
    WorkflowDefinition::graph("linear", "a")
        .state("a", StateSpec::action(done_agent()).on("done", "b"))
        .state("b", StateSpec::action(done_agent()).on("done", "c"))
        .state("c", StateSpec::action(done_agent()).on("done", "finish"))
        .state("finish", StateSpec::Done)
}

pub fn new_task(workflow: &WorkflowDefinition) -> Task {
    Task::new("board-1", "item-1", workflow.id.clone())
}

/// Everything observed while ticking a task until it stops for a reason other than budget.
pub struct Drive {
    pub run: Run,
    pub traces: Vec<TraceRecord>,
    pub stop: StopReason,
    pub ticks: usize,
}

impl Drive {
    pub fn path(&self) -> Vec<(String, String)> {
        transition_path(&self.traces)
    }
}

pub fn transition_path(traces: &[TraceRecord]) -> Vec<(String, String)> {
    traces
        .iter()
        .filter(|t| t.trace_type.is_transition())
        .map(|t| {
            (
                t.from_state_id.clone().unwrap_or_default(),
                t.to_state_id.clone().unwrap_or_default(),
            )
        })
        .collect()
}

pub async fn drive(
    engine: &Engine,
    task: &mut Task,
    mut run: Option<Run>,
    workflow: &WorkflowDefinition,
    options: &TickOptions,
) -> Drive {
    let mut traces = Vec::new();
    let mut ticks = 0;
    loop {
        let report = engine
            .run_tick(task, run.take(), workflow, options)
            .await
            .expect("tick should not error");
        ticks += 1;
        traces.extend(report.traces);
        if report.stop != StopReason::BudgetExhausted {
            return Drive {
                run: report.run,
                traces,
                stop: report.stop,
                ticks,
            };
        }
        run = Some(report.run);
        assert!(ticks < 1_000, "workflow did not stop");
    }
}

#[derive(Default)]
pub struct RecordingPageWriter {
    pub pages: Mutex<Vec<PageOutput>>,
}

#[async_trait]
impl PageWriter for RecordingPageWriter {
    async fn write_page(&self, output: &PageOutput) -> anyhow::Result<()> {
        self.pages.lock().unwrap().push(output.clone());
        Ok(())
    }
}

pub struct FailingPageWriter;

#[async_trait]
impl PageWriter for FailingPageWriter {
    async fn write_page(&self, _output: &PageOutput) -> anyhow::Result<()> {
        anyhow::bail!("board API unavailable")
    }
}
