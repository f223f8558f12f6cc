// Pipe-authored workflows running on the engine's synthetic states

mod fixtures;

use fixtures::*;
use serde_json::json;
use std::sync::Arc;

use tickwork::pipe::{
    decide, end, flow, map_step, repeat_until, step, write, PageOutput, StepResult,
    PIPE_DONE_STATE, PIPE_FEEDBACK_STATE, PIPE_RUN_STATE,
};
use tickwork::tasks::{TaskState, TerminalStatus};
use tickwork::trace::{replay, ReplayOutcome, TraceType};
use tickwork::workflows::{
    guard_fn, select_fn, Context, Engine, EngineError, StopReason, TickOptions,
    WorkflowDefinition,
};

fn bump() -> tickwork::pipe::Op {
    map_step("bump", |ctx| {
        let n = ctx.get_i64("n").unwrap_or(0);
        Ok(ctx.with("n", n + 1))
    })
}

fn digest_workflow() -> WorkflowDefinition {
    WorkflowDefinition::pipe(
        "digest",
        flow([
            bump(),
            write(|ctx| Ok(PageOutput::markdown(format!("# Digest {}", ctx.get_i64("n").unwrap_or(0))))),
            end::done(),
        ]),
    )
}

#[tokio::test]
async fn test_pipe_emits_one_step_per_tick() {
    let writer = Arc::new(RecordingPageWriter::default());
    let engine = Engine::new().with_page_writer(writer.clone());
    let wf = digest_workflow();
    let mut task = new_task(&wf);

    let report = engine
        .run_tick(&mut task, None, &wf, &TickOptions::unbounded())
        .await
        .unwrap();

    let kinds: Vec<TraceType> = report.traces.iter().map(|t| t.trace_type).collect();
    assert_eq!(
        kinds,
        vec![
            TraceType::Started,
            TraceType::Write,
            TraceType::Step,
            TraceType::Completed
        ]
    );
    assert_eq!(report.transitions, 1);
    assert_eq!(
        report.path(),
        vec![(PIPE_RUN_STATE.to_string(), PIPE_DONE_STATE.to_string())]
    );

    let write_trace = &report.traces[1];
    assert_eq!(write_trace.state_id.as_deref(), Some(PIPE_RUN_STATE));
    let payload: serde_json::Value =
        serde_json::from_str(write_trace.payload_json.as_deref().unwrap()).unwrap();
    assert_eq!(payload, json!({"markdown": "# Digest 1"}));
    assert_eq!(writer.pages.lock().unwrap().len(), 1);

    assert_eq!(report.traces[2].reason.as_deref(), Some("pipe.end"));
    assert_eq!(task.state, TaskState::Done);
    assert_eq!(task.context().get_i64("n"), Some(1));
}

#[tokio::test]
async fn test_pipe_without_end_completes_done() {
    let wf = WorkflowDefinition::pipe("implicit", flow([bump(), bump()]));
    let mut task = new_task(&wf);

    let report = Engine::new()
        .run_tick(&mut task, None, &wf, &TickOptions::unbounded())
        .await
        .unwrap();
    assert_eq!(report.stop, StopReason::Terminal(TerminalStatus::Done));
    assert_eq!(task.context().get_i64("n"), Some(2));
}

#[tokio::test]
async fn test_pipe_feedback_reruns_from_entry() {
    let ask = step("ask", |ctx: Context| async move {
        if ctx.contains_key("human_feedback") {
            Ok(StepResult::Continue(ctx.with("approved", true)))
        } else {
            Ok(StepResult::await_feedback("Publish this digest?", ctx))
        }
    });
    let wf = WorkflowDefinition::pipe("approval", flow([bump(), ask, end::done()]));
    let mut task = new_task(&wf);
    let engine = Engine::new();

    let first = engine
        .run_tick(&mut task, None, &wf, &TickOptions::unbounded())
        .await
        .unwrap();
    assert_eq!(
        first.stop,
        StopReason::AwaitingFeedback {
            resume_to: PIPE_RUN_STATE.into()
        }
    );
    assert_eq!(
        first.path(),
        vec![(PIPE_RUN_STATE.to_string(), PIPE_FEEDBACK_STATE.to_string())]
    );
    assert_eq!(first.traces[1].reason.as_deref(), Some("await_feedback"));
    let pause = first.traces.last().unwrap();
    assert_eq!(pause.trace_type, TraceType::AwaitFeedback);
    assert_eq!(pause.message.as_deref(), Some("Publish this digest?"));
    assert_eq!(task.current_step_id.as_deref(), Some(PIPE_FEEDBACK_STATE));
    assert_eq!(task.context().get_i64("n"), Some(1));

    task.inject_human_feedback("yes");
    let second = engine
        .resume_after_feedback(&mut task, first.run.clone(), &wf, &TickOptions::unbounded())
        .await
        .unwrap();

    assert_eq!(second.traces[0].trace_type, TraceType::Resumed);
    assert_eq!(
        second.path(),
        vec![(PIPE_RUN_STATE.to_string(), PIPE_DONE_STATE.to_string())]
    );
    assert_eq!(task.state, TaskState::Done);
    assert_eq!(task.context().get_bool("approved"), Some(true));
    // the whole composition re-ran from its entry
    assert_eq!(task.context().get_i64("n"), Some(2));

    let all: Vec<_> = first.traces.into_iter().chain(second.traces).collect();
    assert_eq!(replay(&all).unwrap(), ReplayOutcome::Terminal(TerminalStatus::Done));
}

#[tokio::test]
async fn test_pipe_loop_exhaustion_runs_handler() {
    let wf = WorkflowDefinition::pipe(
        "polling",
        repeat_until(
            bump(),
            guard_fn(|ctx| Ok(ctx.get_bool("ready").unwrap_or(false))),
            3,
            end::failed("gave up after 3 polls"),
        ),
    );
    let mut task = new_task(&wf);

    let report = Engine::new()
        .run_tick(&mut task, None, &wf, &TickOptions::unbounded())
        .await
        .unwrap();
    assert_eq!(report.stop, StopReason::Terminal(TerminalStatus::Failed));
    assert_eq!(task.last_error.as_deref(), Some("gave up after 3 polls"));
    assert_eq!(task.context().get_i64("n"), Some(3));
}

#[tokio::test]
async fn test_pipe_decide_branches() {
    let wf = WorkflowDefinition::pipe(
        "triage",
        decide(
            select_fn(|ctx| Ok(ctx.get_str("severity").unwrap_or("low").to_string())),
            [("high", end::blocked("needs on-call")), ("low", end::done())],
        ),
    )
    .context(ctx(json!({"severity": "high"})));
    let mut task = new_task(&wf);

    let report = Engine::new()
        .run_tick(&mut task, None, &wf, &TickOptions::unbounded())
        .await
        .unwrap();
    assert_eq!(report.stop, StopReason::Terminal(TerminalStatus::Blocked));
    assert_eq!(report.traces[1].event.as_deref(), Some("blocked"));
    assert_eq!(task.state, TaskState::Blocked);
}

#[tokio::test]
async fn test_pipe_unmatched_decide_is_fatal() {
    let wf = WorkflowDefinition::pipe(
        "triage",
        decide(select_fn(|_| Ok("medium".to_string())), [("high", end::done())]),
    );
    let mut task = new_task(&wf);

    let report = Engine::new()
        .run_tick(&mut task, None, &wf, &TickOptions::unbounded())
        .await
        .unwrap();
    assert!(matches!(report.stop, StopReason::Fatal { kind: "action.contract_violation", .. }));
    assert_eq!(report.traces[1].trace_type, TraceType::Error);
    assert_eq!(report.traces[1].state_id.as_deref(), Some(PIPE_RUN_STATE));
    assert_eq!(task.state, TaskState::Failed);
}

#[tokio::test]
async fn test_write_before_fatal_error_is_traced() {
    let writer = Arc::new(RecordingPageWriter::default());
    let engine = Engine::new().with_page_writer(writer.clone());
    let wf = WorkflowDefinition::pipe(
        "publish_then_route",
        flow([
            write(|_| Ok(PageOutput::markdown("# Draft"))),
            decide(select_fn(|_| Ok("medium".to_string())), [("high", end::done())]),
        ]),
    );
    let mut task = new_task(&wf);

    let report = engine
        .run_tick(&mut task, None, &wf, &TickOptions::unbounded())
        .await
        .unwrap();

    let kinds: Vec<TraceType> = report.traces.iter().map(|t| t.trace_type).collect();
    assert_eq!(
        kinds,
        vec![
            TraceType::Started,
            TraceType::Write,
            TraceType::Error,
            TraceType::Completed
        ]
    );
    let payload: serde_json::Value =
        serde_json::from_str(report.traces[1].payload_json.as_deref().unwrap()).unwrap();
    assert_eq!(payload, json!({"markdown": "# Draft"}));
    assert_eq!(writer.pages.lock().unwrap().len(), 1);
    assert_eq!(task.state, TaskState::Failed);
    assert_eq!(
        replay(&report.traces).unwrap(),
        ReplayOutcome::Terminal(TerminalStatus::Failed)
    );
}

#[tokio::test]
async fn test_page_write_failure_leaves_task_untouched() {
    let engine = Engine::new().with_page_writer(Arc::new(FailingPageWriter));
    let wf = digest_workflow();
    let mut task = new_task(&wf);
    let before = task.clone();

    let err = engine
        .run_tick(&mut task, None, &wf, &TickOptions::unbounded())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::PageWrite { .. }));
    assert_eq!(task, before);
}
