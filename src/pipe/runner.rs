// Executes a composed pipe operation as one logical unit

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, info, warn};

use super::ops::{Op, StepResult};
use super::page::{PageOutput, PageWriter};
use super::PIPE_RUN_STATE;
use crate::tasks::TerminalStatus;
use crate::workflows::{Context, EngineError};

/// How a pipe run resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum PipeOutcome {
    End {
        status: TerminalStatus,
        ctx: Context,
        message: Option<String>,
    },
    AwaitFeedback {
        prompt: String,
        ctx: Context,
    },
}

impl PipeOutcome {
    pub fn context(&self) -> &Context {
        match self {
            PipeOutcome::End { ctx, .. } | PipeOutcome::AwaitFeedback { ctx, .. } => ctx,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipeRun {
    pub outcome: PipeOutcome,
    /// Outputs forwarded to the page writer, in order.
    pub writes: Vec<PageOutput>,
}

/// A pipe run that stopped on an error, with the pages it had already written.
#[derive(Debug)]
pub struct PipeFailure {
    pub error: EngineError,
    pub writes: Vec<PageOutput>,
}

enum Flow {
    Continue(Context),
    Finished(PipeOutcome),
}

impl From<StepResult> for Flow {
    fn from(result: StepResult) -> Self {
        match result {
            StepResult::Continue(ctx) => Flow::Continue(ctx),
            StepResult::AwaitFeedback { prompt, ctx } => {
                Flow::Finished(PipeOutcome::AwaitFeedback { prompt, ctx })
            }
            StepResult::End {
                status,
                ctx,
                message,
            } => Flow::Finished(PipeOutcome::End {
                status,
                ctx,
                message,
            }),
        }
    }
}

pub struct PipeRunner<'a> {
    writer: Option<&'a dyn PageWriter>,
    writes: Vec<PageOutput>,
}

impl<'a> PipeRunner<'a> {
    pub fn new(writer: Option<&'a dyn PageWriter>) -> Self {
        Self {
            writer,
            writes: Vec::new(),
        }
    }

    /// Run `op` from its entry. A composition that finishes without `end.*` resolves to `done`.
    pub async fn run(mut self, op: &Op, ctx: Context) -> Result<PipeRun, PipeFailure> {
        let outcome = match self.exec(op, ctx).await {
            Ok(Flow::Continue(ctx)) => PipeOutcome::End {
                status: TerminalStatus::Done,
                ctx,
                message: None,
            },
            Ok(Flow::Finished(outcome)) => outcome,
            Err(error) => {
                return Err(PipeFailure {
                    error,
                    writes: self.writes,
                })
            }
        };
        Ok(PipeRun {
            outcome,
            writes: self.writes,
        })
    }

    fn exec<'s>(&'s mut self, op: &'s Op, ctx: Context) -> BoxFuture<'s, Result<Flow, EngineError>> {
        async move {
            match op {
                Op::Step { id, run } => {
                    debug!(step_id = %id, "Running pipe step");
                    let result = run(ctx).await.map_err(|e| EngineError::callable(id, e))?;
                    Ok(Flow::from(result))
                }
                Op::Flow(ops) => {
                    let mut ctx = ctx;
                    for op in ops {
                        match self.exec(op, ctx).await? {
                            Flow::Continue(next) => ctx = next,
                            finished => return Ok(finished),
                        }
                    }
                    Ok(Flow::Continue(ctx))
                }
                Op::Loop {
                    body,
                    until,
                    max,
                    on_exhausted,
                } => {
                    let mut ctx = ctx;
                    let mut iteration = 0;
                    loop {
                        if until(&ctx).map_err(|e| EngineError::callable(PIPE_RUN_STATE, e))? {
                            debug!(iterations = iteration, "Pipe loop condition met");
                            return Ok(Flow::Continue(ctx));
                        }
                        if iteration >= *max {
                            warn!(max = *max, "Pipe loop exhausted");
                            return self.exec(on_exhausted, ctx).await;
                        }
                        iteration += 1;
                        match self.exec(body, ctx).await? {
                            Flow::Continue(next) => ctx = next,
                            finished => return Ok(finished),
                        }
                    }
                }
                Op::Decide { selector, branches } => {
                    let key = selector(&ctx).map_err(|e| EngineError::callable(PIPE_RUN_STATE, e))?;
                    let branch = branches.get(&key).ok_or_else(|| EngineError::ActionContractViolation {
                        state_id: PIPE_RUN_STATE.to_string(),
                        reason: format!(
                            "decide selected '{key}' but branches are {:?}",
                            branches.keys().collect::<Vec<_>>()
                        ),
                    })?;
                    debug!(branch = %key, "Pipe decide");
                    self.exec(branch, ctx).await
                }
                Op::Write { renderer } => {
                    let output = renderer(&ctx).map_err(|e| EngineError::callable(PIPE_RUN_STATE, e))?;
                    match self.writer {
                        Some(writer) => {
                            writer
                                .write_page(&output)
                                .await
                                .map_err(|source| EngineError::PageWrite { source })?;
                            info!("Pipe output written to page");
                        }
                        None => debug!("No page writer configured, output only traced"),
                    }
                    self.writes.push(output);
                    Ok(Flow::Continue(ctx))
                }
                Op::End { status, message } => Ok(Flow::Finished(PipeOutcome::End {
                    status: *status,
                    ctx,
                    message: message.clone(),
                })),
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::ops::{decide, end, flow, map_step, repeat_until, step, write};
    use crate::workflows::{guard_fn, select_fn};
    use async_trait::async_trait;
    use std::sync::Mutex;

    fn bump() -> Op {
        map_step("bump", |ctx| {
            let n = ctx.get_i64("n").unwrap_or(0);
            Ok(ctx.with("n", n + 1))
        })
    }

    #[tokio::test]
    async fn test_flow_without_end_is_done() {
        let op = flow([bump(), bump()]);
        let run = PipeRunner::new(None).run(&op, Context::new()).await.unwrap();
        match run.outcome {
            PipeOutcome::End { status, ctx, .. } => {
                assert_eq!(status, TerminalStatus::Done);
                assert_eq!(ctx.get_i64("n"), Some(2));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_end_stops_the_flow() {
        let op = flow([bump(), end::blocked("waiting on vendor"), bump()]);
        let run = PipeRunner::new(None).run(&op, Context::new()).await.unwrap();
        assert_eq!(
            run.outcome,
            PipeOutcome::End {
                status: TerminalStatus::Blocked,
                ctx: Context::new().with("n", 1),
                message: Some("waiting on vendor".into()),
            }
        );
    }

    #[tokio::test]
    async fn test_loop_stops_when_condition_met() {
        let op = repeat_until(
            bump(),
            guard_fn(|ctx| Ok(ctx.get_i64("n").unwrap_or(0) >= 3)),
            10,
            end::failed("never"),
        );
        let run = PipeRunner::new(None).run(&op, Context::new()).await.unwrap();
        assert!(matches!(run.outcome, PipeOutcome::End { status: TerminalStatus::Done, ref ctx, .. } if ctx.get_i64("n") == Some(3)));
    }

    #[tokio::test]
    async fn test_loop_exhaustion_runs_handler() {
        let op = repeat_until(bump(), guard_fn(|_| Ok(false)), 2, end::failed("too many rounds"));
        let run = PipeRunner::new(None).run(&op, Context::new()).await.unwrap();
        assert_eq!(
            run.outcome,
            PipeOutcome::End {
                status: TerminalStatus::Failed,
                ctx: Context::new().with("n", 2),
                message: Some("too many rounds".into()),
            }
        );
    }

    #[tokio::test]
    async fn test_decide_unmatched_is_contract_violation() {
        let op = decide(select_fn(|_| Ok("maybe".to_string())), [("yes", end::done())]);
        let failure = PipeRunner::new(None).run(&op, Context::new()).await.unwrap_err();
        assert!(matches!(failure.error, EngineError::ActionContractViolation { .. }));
        assert!(failure.error.is_fatal_to_run());
        assert!(failure.writes.is_empty());
    }

    #[tokio::test]
    async fn test_failure_keeps_earlier_writes() {
        let recorder = Recorder(Mutex::new(Vec::new()));
        let op = flow([
            write(|_| Ok(PageOutput::markdown("draft"))),
            decide(select_fn(|_| Ok("maybe".to_string())), [("yes", end::done())]),
        ]);
        let failure = PipeRunner::new(Some(&recorder)).run(&op, Context::new()).await.unwrap_err();

        assert_eq!(failure.writes, vec![PageOutput::markdown("draft")]);
        assert_eq!(recorder.0.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_step_can_request_feedback() {
        let op = flow([
            bump(),
            step("ask", |ctx: Context| async move {
                Ok(StepResult::await_feedback("Approve?", ctx))
            }),
            bump(),
        ]);
        let run = PipeRunner::new(None).run(&op, Context::new()).await.unwrap();
        assert_eq!(
            run.outcome,
            PipeOutcome::AwaitFeedback {
                prompt: "Approve?".into(),
                ctx: Context::new().with("n", 1),
            }
        );
    }

    struct Recorder(Mutex<Vec<PageOutput>>);

    #[async_trait]
    impl PageWriter for Recorder {
        async fn write_page(&self, output: &PageOutput) -> anyhow::Result<()> {
            self.0.lock().unwrap().push(output.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_write_forwards_without_touching_context() {
        let recorder = Recorder(Mutex::new(Vec::new()));
        let op = flow([
            bump(),
            write(|ctx| Ok(PageOutput::markdown(format!("n = {}", ctx.get_i64("n").unwrap_or(0))))),
        ]);
        let run = PipeRunner::new(Some(&recorder)).run(&op, Context::new()).await.unwrap();

        assert_eq!(run.writes, vec![PageOutput::markdown("n = 1")]);
        assert_eq!(*recorder.0.lock().unwrap(), run.writes);
        assert_eq!(run.outcome.context(), &Context::new().with("n", 1));
    }
}
