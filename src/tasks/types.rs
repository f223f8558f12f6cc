// Persistent task and run records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::workflows::Context;

/// Lifecycle state of a task bound to a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Running,
    Feedback,
    Done,
    Blocked,
    Failed,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Queued => "queued",
            TaskState::Running => "running",
            TaskState::Feedback => "feedback",
            TaskState::Done => "done",
            TaskState::Blocked => "blocked",
            TaskState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal_status().is_some()
    }

    pub fn terminal_status(&self) -> Option<TerminalStatus> {
        match self {
            TaskState::Done => Some(TerminalStatus::Done),
            TaskState::Blocked => Some(TerminalStatus::Blocked),
            TaskState::Failed => Some(TerminalStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(TaskState::Queued),
            "running" => Ok(TaskState::Running),
            "feedback" => Ok(TaskState::Feedback),
            "done" => Ok(TaskState::Done),
            "blocked" => Ok(TaskState::Blocked),
            "failed" => Ok(TaskState::Failed),
            other => Err(format!("unknown task state '{other}'")),
        }
    }
}

/// Outcome of a finished run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalStatus {
    Done,
    Blocked,
    Failed,
}

impl TerminalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminalStatus::Done => "done",
            TerminalStatus::Blocked => "blocked",
            TerminalStatus::Failed => "failed",
        }
    }

    pub fn task_state(&self) -> TaskState {
        match self {
            TerminalStatus::Done => TaskState::Done,
            TerminalStatus::Blocked => TaskState::Blocked,
            TerminalStatus::Failed => TaskState::Failed,
        }
    }

    pub fn run_status(&self) -> RunStatus {
        match self {
            TerminalStatus::Done => RunStatus::Done,
            TerminalStatus::Blocked => RunStatus::Blocked,
            TerminalStatus::Failed => RunStatus::Failed,
        }
    }
}

impl fmt::Display for TerminalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TerminalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "done" => Ok(TerminalStatus::Done),
            "blocked" => Ok(TerminalStatus::Blocked),
            "failed" => Ok(TerminalStatus::Failed),
            other => Err(format!("'{other}' is not a terminal status")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Done,
    Blocked,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Done => "done",
            RunStatus::Blocked => "blocked",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            other => TerminalStatus::from_str(other).map(|t| t.run_status()),
        }
    }
}

/// Everything the engine needs to pick up exactly where it stopped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepVars {
    pub context: Context,
    /// Failed attempts already made by the action at the paused position.
    #[serde(default)]
    pub attempt: u32,
    /// Iteration counters of loops currently being visited.
    #[serde(default)]
    pub loops: BTreeMap<String, u32>,
    /// State that transitioned into the paused position.
    #[serde(default)]
    pub previous_state: Option<String>,
    /// Resume target resolved when the task paused for feedback.
    #[serde(default)]
    pub resume_to: Option<String>,
    /// Set once feedback has been merged into a paused task; cleared on resume.
    #[serde(default)]
    pub feedback_received: bool,
}

impl StepVars {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

/// A board item bound to a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub board_id: String,
    pub external_task_id: String,
    pub workflow_id: String,
    pub state: TaskState,
    pub current_step_id: Option<String>,
    pub step_vars: StepVars,
    pub waiting_since: Option<DateTime<Utc>>,
    pub lock_token: Option<String>,
    pub lock_expires_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(
        board_id: impl Into<String>,
        external_task_id: impl Into<String>,
        workflow_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            board_id: board_id.into(),
            external_task_id: external_task_id.into(),
            workflow_id: workflow_id.into(),
            state: TaskState::Queued,
            current_step_id: None,
            step_vars: StepVars::default(),
            waiting_since: None,
            lock_token: None,
            lock_expires_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Pre-seed context before the first tick; merged over the workflow's initial context.
    pub fn with_context(mut self, context: Context) -> Self {
        self.step_vars.context = context;
        self
    }

    pub fn context(&self) -> &Context {
        &self.step_vars.context
    }

    /// Merge externally supplied feedback into the context of a paused task.
    ///
    /// The task stays in `feedback` and is marked ready; the next tick resumes it.
    pub fn inject_feedback(&mut self, data: &Map<String, Value>) {
        self.step_vars.context = self.step_vars.context.merge(data);
        self.step_vars.feedback_received = true;
        self.updated_at = Utc::now();
    }

    /// Convenience for the common case of a single `human_feedback` value.
    pub fn inject_human_feedback(&mut self, feedback: impl Into<Value>) {
        let mut data = Map::new();
        data.insert("human_feedback".to_string(), feedback.into());
        self.inject_feedback(&data);
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Paused for feedback and nothing has been submitted yet.
    pub fn awaits_feedback(&self) -> bool {
        self.state == TaskState::Feedback && !self.step_vars.feedback_received
    }

    pub fn is_locked_at(&self, now: DateTime<Utc>) -> bool {
        match (&self.lock_token, self.lock_expires_at) {
            (Some(_), Some(expires_at)) => expires_at > now,
            (Some(_), None) => true,
            _ => false,
        }
    }
}

/// One execution session of a task against a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub task_id: String,
    pub workflow_id: String,
    pub status: RunStatus,
    pub current_state_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Run {
    pub fn start(task: &Task, state_id: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            task_id: task.id.clone(),
            workflow_id: task.workflow_id.clone(),
            status: RunStatus::Running,
            current_state_id: Some(state_id.to_string()),
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }
}
