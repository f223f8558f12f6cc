// State-machine execution engine.
// Advances one task a bounded number of transitions per call and records every step as a trace.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn, Instrument};

use super::agent::ActionOutcome;
use super::definition::{
    ActionSpec, LoopSpec, OrchestrateSpec, StateGraph, StateSpec, WorkflowBody, WorkflowDefinition,
    EVENT_DONE, EVENT_FAILED, EVENT_FEEDBACK,
};
use super::errors::EngineError;
use crate::observability::engine_metrics;
use crate::pipe::{
    Op, PageOutput, PageWriter, PipeOutcome, PipeRunner, PIPE_DONE_STATE, PIPE_FEEDBACK_STATE, PIPE_RUN_STATE,
};
use crate::tasks::{Run, StepVars, Task, TaskState, TerminalStatus};
use crate::telemetry::{create_tick_span, generate_tick_id};
use crate::trace::record::{
    REASON_ACTION_ATTEMPT_FAILED, REASON_ACTION_DONE, REASON_ACTION_FAILED_EXHAUSTED,
    REASON_FEEDBACK_RESUMED, REASON_LOOP_CONTINUE, REASON_LOOP_DONE, REASON_LOOP_EXHAUSTED,
    REASON_ORCHESTRATE_SELECT, REASON_PIPE_END, REASON_PIPE_WRITE,
};
use crate::trace::{TraceRecord, TraceScope, TraceType, FEEDBACK_PAUSE_REASON};

/// Per-call limits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickOptions {
    /// Maximum number of `step`/`retry` traces this call may emit. `None` runs until
    /// a terminal state, a feedback pause or a fatal error.
    pub max_transitions_per_tick: Option<u32>,
}

impl TickOptions {
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn with_budget(max_transitions: u32) -> Self {
        Self {
            max_transitions_per_tick: Some(max_transitions),
        }
    }

    fn validate(&self) -> Result<(), EngineError> {
        if self.max_transitions_per_tick == Some(0) {
            return Err(EngineError::InvalidOptions {
                reason: "max_transitions_per_tick must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Why a tick stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Terminal(TerminalStatus),
    AwaitingFeedback { resume_to: String },
    BudgetExhausted,
    Fatal { kind: &'static str, message: String },
}

/// Result of one tick. The task passed in has already been updated in place.
#[derive(Debug, Clone)]
pub struct TickReport {
    pub tick_id: String,
    pub run: Run,
    pub traces: Vec<TraceRecord>,
    pub stop: StopReason,
    pub transitions: u32,
}

impl TickReport {
    pub fn is_terminal(&self) -> bool {
        matches!(self.stop, StopReason::Terminal(_) | StopReason::Fatal { .. })
    }

    /// `(from, to)` of every transition emitted during this tick.
    pub fn path(&self) -> Vec<(String, String)> {
        self.traces
            .iter()
            .filter(|t| t.trace_type.is_transition())
            .filter_map(|t| Some((t.from_state_id.clone()?, t.to_state_id.clone()?)))
            .collect()
    }
}

/// Trace bookkeeping for a single tick.
struct Tick {
    scope: TraceScope,
    traces: Vec<TraceRecord>,
    transitions: u32,
    budget: Option<u32>,
    /// State currently being evaluated; fatal errors are reported against it.
    position: String,
    last_failure: Option<String>,
}

impl Tick {
    fn new(scope: TraceScope, budget: Option<u32>, position: &str) -> Self {
        Self {
            scope,
            traces: Vec::new(),
            transitions: 0,
            budget,
            position: position.to_string(),
            last_failure: None,
        }
    }

    fn trace(&self, trace_type: TraceType) -> TraceRecord {
        TraceRecord::new(&self.scope, trace_type)
    }

    fn emit(&mut self, trace: TraceRecord) {
        if trace.trace_type.is_transition() {
            self.transitions += 1;
            engine_metrics().record_transition();
        }
        self.traces.push(trace);
    }

    fn budget_reached(&self) -> bool {
        self.budget.is_some_and(|max| self.transitions >= max)
    }
}

/// Outcome of visiting one non-terminal state.
enum Visit {
    Advance(String),
    Retry,
    Pause { resume_to: String },
}

/// Where the graph interpreter stopped.
enum GraphStop {
    Terminal(TerminalStatus),
    Pause { resume_to: String },
    Budget,
}

/// Interprets workflow definitions against persisted task state.
#[derive(Clone, Default)]
pub struct Engine {
    page_writer: Option<Arc<dyn PageWriter>>,
}

impl Engine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Side effect used by pipe `write` operations.
    pub fn with_page_writer(mut self, writer: Arc<dyn PageWriter>) -> Self {
        self.page_writer = Some(writer);
        self
    }

    /// Advance `task` by zero or more transitions.
    ///
    /// `run` is the task's active run, or `None` for a queued task. Fatal errors raised
    /// by callables terminate the run and are reported through [`StopReason::Fatal`];
    /// an `Err` means nothing was changed.
    pub async fn run_tick(
        &self,
        task: &mut Task,
        run: Option<Run>,
        workflow: &WorkflowDefinition,
        options: &TickOptions,
    ) -> Result<TickReport, EngineError> {
        options.validate()?;
        workflow.validate()?;

        if task.workflow_id != workflow.id {
            return Err(EngineError::RunMismatch {
                reason: format!(
                    "task {} is bound to workflow '{}', not '{}'",
                    task.id, task.workflow_id, workflow.id
                ),
            });
        }
        if task.is_terminal() {
            return Err(EngineError::TaskTerminal {
                task_id: task.id.clone(),
                state: task.state,
            });
        }
        if task.awaits_feedback() {
            return Err(EngineError::FeedbackPending {
                task_id: task.id.clone(),
            });
        }

        let tick_id = generate_tick_id();
        let span = create_tick_span(&task.id, &workflow.id, &tick_id);
        engine_metrics().record_tick();

        match &workflow.body {
            WorkflowBody::Graph(graph) => {
                self.tick_graph(task, run, workflow, graph, options, tick_id)
                    .instrument(span)
                    .await
            }
            WorkflowBody::Pipe(op) => {
                self.tick_pipe(task, run, workflow, op, options, tick_id)
                    .instrument(span)
                    .await
            }
        }
    }

    /// Resume a task paused for feedback. The feedback must already be merged into its
    /// context through [`Task::inject_feedback`].
    pub async fn resume_after_feedback(
        &self,
        task: &mut Task,
        run: Run,
        workflow: &WorkflowDefinition,
        options: &TickOptions,
    ) -> Result<TickReport, EngineError> {
        if task.state != TaskState::Feedback {
            return Err(EngineError::RunMismatch {
                reason: format!("task {} is {}, not waiting for feedback", task.id, task.state),
            });
        }
        self.run_tick(task, Some(run), workflow, options).await
    }

    async fn tick_graph(
        &self,
        task: &mut Task,
        run: Option<Run>,
        workflow: &WorkflowDefinition,
        graph: &StateGraph,
        options: &TickOptions,
        tick_id: String,
    ) -> Result<TickReport, EngineError> {
        let mut vars = task.step_vars.clone();
        let (mut run, entry) = open_run(task, run, workflow, &graph.start, &mut vars)?;
        tracing::Span::current().record("run.id", run.id.as_str());

        let mut tick = Tick::new(scope_for(task, &run, &tick_id), options.max_transitions_per_tick, &entry);
        let state_id = match task.state {
            TaskState::Queued => {
                info!(state_id = %entry, "Run started");
                tick.emit(tick.trace(TraceType::Started).state(&entry));
                entry
            }
            TaskState::Feedback => {
                let resume_to = vars.resume_to.take().ok_or_else(|| EngineError::CorruptExecutionState {
                    reason: format!("task {} is waiting for feedback without a resume target", task.id),
                })?;
                info!(paused_at = %entry, resume_to = %resume_to, "Resuming after feedback");
                tick.emit(
                    tick.trace(TraceType::Resumed)
                        .state(&entry)
                        .to_state(&resume_to)
                        .reason(REASON_FEEDBACK_RESUMED),
                );
                vars.previous_state = Some(entry);
                vars.attempt = 0;
                vars.feedback_received = false;
                resume_to
            }
            _ => entry,
        };

        match self.drive_graph(graph, &mut tick, &mut vars, state_id).await {
            Ok(GraphStop::Terminal(status)) => {
                let at = tick.position.clone();
                let message = tick.last_failure.clone();
                Ok(finish(task, run, tick, vars, status, &at, message))
            }
            Ok(GraphStop::Pause { resume_to }) => {
                let at = tick.position.clone();
                Ok(pause(task, run, tick, vars, &at, resume_to, None))
            }
            Ok(GraphStop::Budget) => {
                let at = tick.position.clone();
                debug!(state_id = %at, transitions = tick.transitions, "Transition budget reached");
                engine_metrics().record_budget_pause();
                task.state = TaskState::Running;
                task.current_step_id = Some(at.clone());
                task.waiting_since = None;
                task.step_vars = vars;
                task.updated_at = Utc::now();
                run.current_state_id = Some(at);
                Ok(TickReport {
                    tick_id,
                    run,
                    transitions: tick.transitions,
                    traces: tick.traces,
                    stop: StopReason::BudgetExhausted,
                })
            }
            Err(err) if err.is_fatal_to_run() => Ok(abort(task, run, tick, vars, err)),
            Err(err) => Err(err),
        }
    }

    async fn drive_graph(
        &self,
        graph: &StateGraph,
        tick: &mut Tick,
        vars: &mut StepVars,
        mut state_id: String,
    ) -> Result<GraphStop, EngineError> {
        loop {
            tick.position = state_id.clone();
            let spec = graph.state(&state_id)?;

            let visit = match spec {
                StateSpec::Done => return Ok(GraphStop::Terminal(TerminalStatus::Done)),
                StateSpec::Blocked => return Ok(GraphStop::Terminal(TerminalStatus::Blocked)),
                StateSpec::Failed => return Ok(GraphStop::Terminal(TerminalStatus::Failed)),
                _ if tick.budget_reached() => return Ok(GraphStop::Budget),
                StateSpec::Feedback { resume } => {
                    let previous = vars.previous_state.as_deref().unwrap_or(&state_id);
                    Visit::Pause {
                        resume_to: resume.resolve(previous),
                    }
                }
                StateSpec::Action(action) => {
                    self.visit_action(graph, action, &state_id, tick, vars).await?
                }
                StateSpec::Orchestrate(orchestrate) => {
                    visit_orchestrate(orchestrate, &state_id, tick, vars)?
                }
                StateSpec::Loop(spec) => visit_loop(graph, spec, &state_id, tick, vars)?,
            };

            match visit {
                Visit::Advance(target) => {
                    vars.previous_state = Some(std::mem::replace(&mut state_id, target));
                }
                Visit::Retry => {}
                Visit::Pause { resume_to } => return Ok(GraphStop::Pause { resume_to }),
            }
        }
    }

    async fn visit_action(
        &self,
        graph: &StateGraph,
        action: &ActionSpec,
        state_id: &str,
        tick: &mut Tick,
        vars: &mut StepVars,
    ) -> Result<Visit, EngineError> {
        let attempt = vars.attempt + 1;
        let reply = action
            .agent
            .run(&vars.context)
            .await
            .map_err(|e| EngineError::callable(state_id, e))?;
        let outcome = reply
            .into_outcome()
            .map_err(|e| EngineError::contract(state_id, e))?;

        match outcome {
            ActionOutcome::Done { data, message } => {
                vars.context = vars.context.merge(&data);
                vars.attempt = 0;
                let target = edge(&action.on, state_id, EVENT_DONE)?;
                info!(state_id = %state_id, to = %target, attempt, "Action done");
                tick.emit(
                    tick.trace(TraceType::Step)
                        .transition(state_id, &target)
                        .event(EVENT_DONE)
                        .reason(REASON_ACTION_DONE)
                        .attempt(attempt)
                        .message(message),
                );
                Ok(Visit::Advance(target))
            }
            ActionOutcome::Feedback { data, .. } => {
                vars.context = vars.context.merge(&data);
                vars.attempt = 0;
                let resume_to = match action.on.get(EVENT_FEEDBACK) {
                    None => state_id.to_string(),
                    Some(target) => match graph.state(target)? {
                        StateSpec::Feedback { resume } => resume.resolve(state_id),
                        _ => target.clone(),
                    },
                };
                Ok(Visit::Pause { resume_to })
            }
            ActionOutcome::Failed { message, .. } => {
                if attempt <= action.max_retries() {
                    vars.attempt = attempt;
                    warn!(
                        state_id = %state_id,
                        attempt,
                        max_retries = action.max_retries(),
                        message = ?message,
                        "Action attempt failed, retrying"
                    );
                    engine_metrics().record_retry();
                    tick.emit(
                        tick.trace(TraceType::Retry)
                            .transition(state_id, state_id)
                            .event(EVENT_FAILED)
                            .reason(REASON_ACTION_ATTEMPT_FAILED)
                            .attempt(attempt)
                            .message(message),
                    );
                    let backoff_ms = action.backoff_ms();
                    if backoff_ms > 0 {
                        tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    }
                    return Ok(Visit::Retry);
                }

                vars.attempt = 0;
                let target = edge(&action.on, state_id, EVENT_FAILED)?;
                warn!(state_id = %state_id, to = %target, attempt, "Action failed, retries exhausted");
                tick.last_failure = message.clone();
                tick.emit(
                    tick.trace(TraceType::Step)
                        .transition(state_id, &target)
                        .event(EVENT_FAILED)
                        .reason(REASON_ACTION_FAILED_EXHAUSTED)
                        .attempt(attempt)
                        .message(message),
                );
                Ok(Visit::Advance(target))
            }
        }
    }

    async fn tick_pipe(
        &self,
        task: &mut Task,
        run: Option<Run>,
        workflow: &WorkflowDefinition,
        op: &Op,
        options: &TickOptions,
        tick_id: String,
    ) -> Result<TickReport, EngineError> {
        let mut vars = task.step_vars.clone();
        let (run, entry) = open_run(task, run, workflow, PIPE_RUN_STATE, &mut vars)?;
        tracing::Span::current().record("run.id", run.id.as_str());

        let mut tick = Tick::new(scope_for(task, &run, &tick_id), options.max_transitions_per_tick, PIPE_RUN_STATE);
        match task.state {
            TaskState::Queued => {
                tick.emit(tick.trace(TraceType::Started).state(PIPE_RUN_STATE));
            }
            TaskState::Feedback => {
                info!(paused_at = %entry, "Resuming pipe after feedback");
                tick.emit(
                    tick.trace(TraceType::Resumed)
                        .state(&entry)
                        .to_state(PIPE_RUN_STATE)
                        .reason(REASON_FEEDBACK_RESUMED),
                );
                vars.resume_to = None;
                vars.feedback_received = false;
            }
            _ => {}
        }

        let result = PipeRunner::new(self.page_writer.as_deref())
            .run(op, vars.context.clone())
            .await;
        let piped = match result {
            Ok(piped) => piped,
            Err(failure) if failure.error.is_fatal_to_run() => {
                // pages already published still get their trace
                emit_writes(&mut tick, &failure.writes);
                return Ok(abort(task, run, tick, vars, failure.error));
            }
            Err(failure) => {
                warn!(
                    error = %failure.error,
                    written = failure.writes.len(),
                    "Pipe tick aborted, task left unchanged"
                );
                return Err(failure.error);
            }
        };

        emit_writes(&mut tick, &piped.writes);

        match piped.outcome {
            PipeOutcome::End { status, ctx, message } => {
                vars.context = ctx;
                tick.emit(
                    tick.trace(TraceType::Step)
                        .transition(PIPE_RUN_STATE, PIPE_DONE_STATE)
                        .event(status.as_str())
                        .reason(REASON_PIPE_END)
                        .message(message.clone()),
                );
                let failure = message.filter(|_| status == TerminalStatus::Failed);
                Ok(finish(task, run, tick, vars, status, PIPE_DONE_STATE, failure))
            }
            PipeOutcome::AwaitFeedback { prompt, ctx } => {
                vars.context = ctx;
                tick.emit(
                    tick.trace(TraceType::Step)
                        .transition(PIPE_RUN_STATE, PIPE_FEEDBACK_STATE)
                        .event(EVENT_FEEDBACK)
                        .reason(FEEDBACK_PAUSE_REASON)
                        .message(Some(prompt.clone())),
                );
                Ok(pause(
                    task,
                    run,
                    tick,
                    vars,
                    PIPE_FEEDBACK_STATE,
                    PIPE_RUN_STATE.to_string(),
                    Some(prompt),
                ))
            }
        }
    }
}

fn visit_orchestrate(
    orchestrate: &OrchestrateSpec,
    state_id: &str,
    tick: &mut Tick,
    vars: &StepVars,
) -> Result<Visit, EngineError> {
    let key = (orchestrate.select)(&vars.context).map_err(|e| EngineError::callable(state_id, e))?;
    let target = orchestrate
        .on
        .get(&key)
        .cloned()
        .ok_or_else(|| EngineError::ActionContractViolation {
            state_id: state_id.to_string(),
            reason: format!("select returned '{key}' which has no matching edge"),
        })?;

    debug!(state_id = %state_id, event = %key, to = %target, "Orchestrator selected route");
    tick.emit(
        tick.trace(TraceType::Step)
            .transition(state_id, &target)
            .event(key)
            .reason(REASON_ORCHESTRATE_SELECT),
    );
    Ok(Visit::Advance(target))
}

fn visit_loop(
    graph: &StateGraph,
    spec: &LoopSpec,
    state_id: &str,
    tick: &mut Tick,
    vars: &mut StepVars,
) -> Result<Visit, EngineError> {
    let guard = graph
        .guards
        .get(&spec.until)
        .ok_or_else(|| EngineError::MissingTransition {
            state_id: state_id.to_string(),
            event: format!("guard:{}", spec.until),
        })?;
    let finished = guard(&vars.context).map_err(|e| EngineError::callable(state_id, e))?;
    let iteration = vars.loops.get(state_id).copied().unwrap_or(0);

    let (event, reason, target, loop_iteration) = if finished {
        vars.loops.remove(state_id);
        ("done", REASON_LOOP_DONE, spec.on.done.clone(), iteration)
    } else if iteration < spec.max {
        let next = iteration + 1;
        vars.loops.insert(state_id.to_string(), next);
        ("continue", REASON_LOOP_CONTINUE, spec.continue_target().to_string(), next)
    } else {
        vars.loops.remove(state_id);
        warn!(state_id = %state_id, max = spec.max, "Loop exhausted");
        ("exhausted", REASON_LOOP_EXHAUSTED, spec.on.exhausted.clone(), iteration)
    };

    debug!(state_id = %state_id, event, iteration = loop_iteration, to = %target, "Loop evaluated");
    tick.emit(
        tick.trace(TraceType::Step)
            .transition(state_id, &target)
            .event(event)
            .reason(reason)
            .loop_iteration(loop_iteration),
    );
    Ok(Visit::Advance(target))
}

fn emit_writes(tick: &mut Tick, writes: &[PageOutput]) {
    for output in writes {
        tick.emit(
            tick.trace(TraceType::Write)
                .state(PIPE_RUN_STATE)
                .reason(REASON_PIPE_WRITE)
                .payload(&output.to_value()),
        );
    }
}

fn edge(on: &std::collections::BTreeMap<String, String>, state_id: &str, event: &str) -> Result<String, EngineError> {
    on.get(event).cloned().ok_or_else(|| EngineError::MissingTransition {
        state_id: state_id.to_string(),
        event: event.to_string(),
    })
}

fn scope_for(task: &Task, run: &Run, tick_id: &str) -> TraceScope {
    TraceScope {
        run_id: run.id.clone(),
        tick_id: tick_id.to_string(),
        task_id: task.id.clone(),
    }
}

/// Pick the run this tick belongs to and the state it starts from.
fn open_run(
    task: &Task,
    run: Option<Run>,
    workflow: &WorkflowDefinition,
    start: &str,
    vars: &mut StepVars,
) -> Result<(Run, String), EngineError> {
    match task.state {
        TaskState::Queued => {
            if run.as_ref().is_some_and(Run::is_active) {
                return Err(EngineError::RunMismatch {
                    reason: format!("queued task {} already has an active run", task.id),
                });
            }
            vars.context = workflow.context.merge_context(&vars.context);
            Ok((Run::start(task, start), start.to_string()))
        }
        TaskState::Running | TaskState::Feedback => {
            let run = run.filter(Run::is_active).ok_or_else(|| EngineError::RunMismatch {
                reason: format!("task {} is {} but has no active run", task.id, task.state),
            })?;
            if run.task_id != task.id {
                return Err(EngineError::RunMismatch {
                    reason: format!("run {} belongs to task {}, not {}", run.id, run.task_id, task.id),
                });
            }
            let position = task.current_step_id.clone().ok_or_else(|| EngineError::CorruptExecutionState {
                reason: format!("task {} has no current step", task.id),
            })?;
            Ok((run, position))
        }
        terminal => Err(EngineError::TaskTerminal {
            task_id: task.id.clone(),
            state: terminal,
        }),
    }
}

fn finish(
    task: &mut Task,
    mut run: Run,
    mut tick: Tick,
    vars: StepVars,
    status: TerminalStatus,
    at: &str,
    failure: Option<String>,
) -> TickReport {
    let now = Utc::now();
    tick.emit(
        tick.trace(TraceType::Completed)
            .state(at)
            .status(status)
            .message(failure.clone()),
    );
    info!(state_id = %at, status = %status, transitions = tick.transitions, "Run completed");
    engine_metrics().record_completion(status);

    task.state = status.task_state();
    task.current_step_id = None;
    task.waiting_since = None;
    task.step_vars = StepVars {
        context: vars.context,
        ..Default::default()
    };
    if status == TerminalStatus::Failed {
        task.last_error = failure;
    }
    task.updated_at = now;

    run.status = status.run_status();
    run.current_state_id = Some(at.to_string());
    run.ended_at = Some(now);

    TickReport {
        tick_id: tick.scope.tick_id.clone(),
        run,
        transitions: tick.transitions,
        traces: tick.traces,
        stop: StopReason::Terminal(status),
    }
}

fn pause(
    task: &mut Task,
    mut run: Run,
    mut tick: Tick,
    mut vars: StepVars,
    at: &str,
    resume_to: String,
    prompt: Option<String>,
) -> TickReport {
    let now = Utc::now();
    tick.emit(
        tick.trace(TraceType::AwaitFeedback)
            .state(at)
            .to_state(&resume_to)
            .reason(FEEDBACK_PAUSE_REASON)
            .message(prompt),
    );
    info!(state_id = %at, resume_to = %resume_to, "Waiting for feedback");
    engine_metrics().record_feedback_pause();

    vars.resume_to = Some(resume_to.clone());
    vars.feedback_received = false;
    task.state = TaskState::Feedback;
    task.current_step_id = Some(at.to_string());
    task.waiting_since = Some(now);
    task.step_vars = vars;
    task.updated_at = now;
    run.current_state_id = Some(at.to_string());

    TickReport {
        tick_id: tick.scope.tick_id.clone(),
        run,
        transitions: tick.transitions,
        traces: tick.traces,
        stop: StopReason::AwaitingFeedback { resume_to },
    }
}

fn abort(task: &mut Task, mut run: Run, mut tick: Tick, vars: StepVars, err: EngineError) -> TickReport {
    let now = Utc::now();
    let at = tick.position.clone();
    let message = err.to_string();
    error!(state_id = %at, kind = err.kind(), error = %message, "Run aborted");
    engine_metrics().record_fatal_error();

    tick.emit(
        tick.trace(TraceType::Error)
            .state(&at)
            .reason(err.kind())
            .message(Some(message.clone())),
    );
    tick.emit(
        tick.trace(TraceType::Completed)
            .state(&at)
            .status(TerminalStatus::Failed)
            .message(Some(message.clone())),
    );
    engine_metrics().record_completion(TerminalStatus::Failed);

    task.state = TaskState::Failed;
    task.current_step_id = None;
    task.waiting_since = None;
    task.last_error = Some(message.clone());
    task.step_vars = StepVars {
        context: vars.context,
        ..Default::default()
    };
    task.updated_at = now;

    run.status = TerminalStatus::Failed.run_status();
    run.current_state_id = Some(at);
    run.ended_at = Some(now);

    TickReport {
        tick_id: tick.scope.tick_id.clone(),
        run,
        transitions: tick.transitions,
        traces: tick.traces,
        stop: StopReason::Fatal {
            kind: err.kind(),
            message,
        },
    }
}
