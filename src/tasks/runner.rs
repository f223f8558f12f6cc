// Single-writer tick path: claim, run the engine, persist, release

use chrono::{Duration, Utc};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::claim::{ClaimOutcome, ClaimToken};
use super::errors::TaskError;
use super::store::{validate_traces, TaskStore};
use super::types::{Task, TaskState};
use crate::config::EngineConfig;
use crate::observability::{engine_metrics, OperationTimer};
use crate::workflows::{Engine, TickOptions, TickReport, WorkflowDefinition};

pub const DEFAULT_CLAIM_LEASE_SECONDS: i64 = 300;

#[derive(Debug, Clone)]
pub enum TickSummary {
    Ticked(TickReport),
    /// Another caller holds the task, it is already terminal, or it is still waiting
    /// for feedback. Not an error.
    Skipped {
        holder: Option<String>,
        state: TaskState,
    },
}

impl TickSummary {
    pub fn report(&self) -> Option<&TickReport> {
        match self {
            TickSummary::Ticked(report) => Some(report),
            TickSummary::Skipped { .. } => None,
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, TickSummary::Skipped { .. })
    }
}

/// Drives tasks through an [`Engine`] while holding their claim.
pub struct TaskRunner {
    store: Arc<dyn TaskStore>,
    engine: Engine,
    lease: Duration,
}

impl TaskRunner {
    pub fn new(store: Arc<dyn TaskStore>, engine: Engine) -> Self {
        Self {
            store,
            engine,
            lease: Duration::seconds(DEFAULT_CLAIM_LEASE_SECONDS),
        }
    }

    pub fn from_config(store: Arc<dyn TaskStore>, engine: Engine, config: &EngineConfig) -> Self {
        Self::new(store, engine).with_lease(Duration::seconds(config.claim_lease_seconds as i64))
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// Run one tick of `task_id` if no other caller holds it.
    pub async fn tick(
        &self,
        task_id: &str,
        workflow: &WorkflowDefinition,
        options: &TickOptions,
    ) -> Result<TickSummary, TaskError> {
        let token = ClaimToken::generate();
        match self.store.claim(task_id, &token, Utc::now(), self.lease).await? {
            ClaimOutcome::Claimed { .. } => {}
            ClaimOutcome::Conflict { holder, state } => {
                engine_metrics().record_claim_conflict();
                info!(task_id = %task_id, holder = ?holder, state = %state, "Task not claimable, skipping");
                return Ok(TickSummary::Skipped { holder, state });
            }
        }

        let timer = OperationTimer::new("task_tick");
        let result = self.tick_claimed(task_id, &token, workflow, options).await;
        self.release(task_id, &token).await;
        timer.finish();

        result
    }

    /// Merge feedback into a paused task. The next [`tick`](Self::tick) resumes it.
    pub async fn submit_feedback(&self, task_id: &str, data: &Map<String, Value>) -> Result<Task, TaskError> {
        let token = ClaimToken::generate();
        if let ClaimOutcome::Conflict { holder, state } =
            self.store.claim(task_id, &token, Utc::now(), self.lease).await?
        {
            engine_metrics().record_claim_conflict();
            return Err(TaskError::ClaimConflict {
                task_id: task_id.to_string(),
                holder,
                state,
            });
        }

        let result = async {
            let mut task = self.store.load_task(task_id).await?;
            if task.state != TaskState::Feedback {
                return Err(TaskError::NotWaitingForFeedback {
                    task_id: task.id.clone(),
                    state: task.state,
                });
            }
            task.inject_feedback(data);
            self.store.save_task(&task, &token).await?;
            info!(task_id = %task_id, keys = data.len(), "Feedback recorded");
            Ok(task)
        }
        .await;

        self.release(task_id, &token).await;
        result
    }

    async fn tick_claimed(
        &self,
        task_id: &str,
        token: &ClaimToken,
        workflow: &WorkflowDefinition,
        options: &TickOptions,
    ) -> Result<TickSummary, TaskError> {
        let mut task = self.store.load_task(task_id).await?;
        if task.awaits_feedback() {
            debug!(task_id = %task_id, "No feedback submitted yet, skipping");
            return Ok(TickSummary::Skipped {
                holder: None,
                state: task.state,
            });
        }

        let run = self.store.load_active_run(task_id).await?;
        let report = self.engine.run_tick(&mut task, run, workflow, options).await?;

        validate_traces(&report.traces)?;
        self.store
            .commit_tick(&task, &report.run, &report.traces, token)
            .await?;

        info!(
            task_id = %task_id,
            run_id = %report.run.id,
            state = %task.state,
            transitions = report.transitions,
            "Tick persisted"
        );
        Ok(TickSummary::Ticked(report))
    }

    async fn release(&self, task_id: &str, token: &ClaimToken) {
        match self.store.release(task_id, token).await {
            Ok(true) => {}
            Ok(false) => warn!(task_id = %task_id, "Claim expired before release"),
            Err(e) => warn!(task_id = %task_id, error = %e, "Failed to release claim"),
        }
    }
}
