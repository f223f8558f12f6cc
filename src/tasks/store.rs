// Persistence interface for tasks, runs and traces

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::debug;

use super::claim::{ClaimOutcome, ClaimToken};
use super::errors::TaskError;
use super::types::{Run, Task};
use crate::trace::TraceRecord;
use crate::workflows::EngineError;

/// Storage the engine's caller persists through.
///
/// Every task write goes through `save_task` and must be made by the current
/// claim holder. Traces are append-only and validated before they are stored.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert_task(&self, task: &Task) -> Result<(), TaskError>;

    async fn load_task(&self, task_id: &str) -> Result<Task, TaskError>;

    /// Atomically apply [`Task::try_claim`] to the stored row.
    async fn claim(
        &self,
        task_id: &str,
        token: &ClaimToken,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<ClaimOutcome, TaskError>;

    async fn release(&self, task_id: &str, token: &ClaimToken) -> Result<bool, TaskError>;

    /// Overwrite the task's execution fields. The lock columns are left as stored.
    async fn save_task(&self, task: &Task, token: &ClaimToken) -> Result<(), TaskError>;

    async fn load_active_run(&self, task_id: &str) -> Result<Option<Run>, TaskError>;

    async fn save_run(&self, run: &Run) -> Result<(), TaskError>;

    async fn append_traces(&self, traces: &[TraceRecord]) -> Result<(), TaskError>;

    /// Write the result of one tick as a unit: the task row, its run and the
    /// tick's traces. Nothing is written unless `token` still holds the claim.
    async fn commit_tick(
        &self,
        task: &Task,
        run: &Run,
        traces: &[TraceRecord],
        token: &ClaimToken,
    ) -> Result<(), TaskError>;

    /// Traces of one run ordered by `(timestamp, id)`.
    async fn list_traces(&self, run_id: &str) -> Result<Vec<TraceRecord>, TaskError>;
}

/// Reject the whole batch if any record is malformed.
pub fn validate_traces(traces: &[TraceRecord]) -> Result<(), TaskError> {
    for trace in traces {
        trace.validate()?;
    }
    Ok(())
}

/// Copy execution fields from `update` onto the stored row, keeping the stored lock.
pub(crate) fn apply_update(stored: &mut Task, update: &Task) {
    let lock_token = stored.lock_token.take();
    let lock_expires_at = stored.lock_expires_at.take();
    *stored = update.clone();
    stored.lock_token = lock_token;
    stored.lock_expires_at = lock_expires_at;
}

#[derive(Default)]
struct StoreState {
    tasks: HashMap<String, Task>,
    runs: HashMap<String, Run>,
    traces: Vec<TraceRecord>,
}

impl StoreState {
    fn held_task(&mut self, task_id: &str, token: &ClaimToken) -> Result<&mut Task, TaskError> {
        let stored = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| TaskError::NotFound(task_id.to_string()))?;
        if !stored.is_held_by(token) {
            return Err(TaskError::StaleClaim {
                task_id: task_id.to_string(),
                token: token.to_string(),
            });
        }
        Ok(stored)
    }

    fn check_single_active(&self, run: &Run) -> Result<(), TaskError> {
        let other_active = run.is_active()
            && self
                .runs
                .values()
                .any(|r| r.task_id == run.task_id && r.id != run.id && r.is_active());
        if other_active {
            return Err(TaskError::Engine(EngineError::RunMismatch {
                reason: format!("task {} already has another active run", run.task_id),
            }));
        }
        Ok(())
    }
}

/// Process-local store, used by tests and single-process hosts.
#[derive(Default)]
pub struct InMemoryTaskStore {
    state: Mutex<StoreState>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored trace, in insertion order.
    pub async fn all_traces(&self) -> Vec<TraceRecord> {
        self.state.lock().await.traces.clone()
    }

    pub async fn runs_for_task(&self, task_id: &str) -> Vec<Run> {
        let state = self.state.lock().await;
        let mut runs: Vec<Run> = state
            .runs
            .values()
            .filter(|r| r.task_id == task_id)
            .cloned()
            .collect();
        runs.sort_by_key(|r| r.started_at);
        runs
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert_task(&self, task: &Task) -> Result<(), TaskError> {
        let mut state = self.state.lock().await;
        if state.tasks.contains_key(&task.id) {
            return Err(TaskError::AlreadyExists(task.id.clone()));
        }
        state.tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn load_task(&self, task_id: &str) -> Result<Task, TaskError> {
        self.state
            .lock()
            .await
            .tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| TaskError::NotFound(task_id.to_string()))
    }

    async fn claim(
        &self,
        task_id: &str,
        token: &ClaimToken,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<ClaimOutcome, TaskError> {
        let mut state = self.state.lock().await;
        let task = state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| TaskError::NotFound(task_id.to_string()))?;
        let outcome = task.try_claim(token, now, lease);
        debug!(task_id = %task_id, claimed = outcome.is_claimed(), "Claim attempted");
        Ok(outcome)
    }

    async fn release(&self, task_id: &str, token: &ClaimToken) -> Result<bool, TaskError> {
        let mut state = self.state.lock().await;
        let task = state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| TaskError::NotFound(task_id.to_string()))?;
        Ok(task.release(token))
    }

    async fn save_task(&self, task: &Task, token: &ClaimToken) -> Result<(), TaskError> {
        let mut state = self.state.lock().await;
        let stored = state.held_task(&task.id, token)?;
        apply_update(stored, task);
        Ok(())
    }

    async fn load_active_run(&self, task_id: &str) -> Result<Option<Run>, TaskError> {
        let state = self.state.lock().await;
        Ok(state
            .runs
            .values()
            .find(|r| r.task_id == task_id && r.is_active())
            .cloned())
    }

    async fn save_run(&self, run: &Run) -> Result<(), TaskError> {
        let mut state = self.state.lock().await;
        state.check_single_active(run)?;
        state.runs.insert(run.id.clone(), run.clone());
        Ok(())
    }

    async fn append_traces(&self, traces: &[TraceRecord]) -> Result<(), TaskError> {
        validate_traces(traces)?;
        self.state.lock().await.traces.extend_from_slice(traces);
        Ok(())
    }

    async fn commit_tick(
        &self,
        task: &Task,
        run: &Run,
        traces: &[TraceRecord],
        token: &ClaimToken,
    ) -> Result<(), TaskError> {
        validate_traces(traces)?;

        let mut state = self.state.lock().await;
        state.held_task(&task.id, token)?;
        state.check_single_active(run)?;

        if let Some(stored) = state.tasks.get_mut(&task.id) {
            apply_update(stored, task);
        }
        state.runs.insert(run.id.clone(), run.clone());
        state.traces.extend_from_slice(traces);
        debug!(task_id = %task.id, run_id = %run.id, traces = traces.len(), "Tick committed");
        Ok(())
    }

    async fn list_traces(&self, run_id: &str) -> Result<Vec<TraceRecord>, TaskError> {
        let state = self.state.lock().await;
        let mut traces: Vec<TraceRecord> = state
            .traces
            .iter()
            .filter(|t| t.run_id == run_id)
            .cloned()
            .collect();
        traces.sort_by(|a, b| (a.timestamp, &a.id).cmp(&(b.timestamp, &b.id)));
        Ok(traces)
    }
}
