// Append-only execution events and their schema

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

use crate::tasks::TerminalStatus;

pub const REASON_ACTION_DONE: &str = "action.done";
pub const REASON_ACTION_ATTEMPT_FAILED: &str = "action.attempt.failed";
pub const REASON_ACTION_FAILED_EXHAUSTED: &str = "action.failed.exhausted";
pub const REASON_ORCHESTRATE_SELECT: &str = "orchestrate.select";
pub const REASON_LOOP_CONTINUE: &str = "loop.continue";
pub const REASON_LOOP_DONE: &str = "loop.done";
pub const REASON_LOOP_EXHAUSTED: &str = "loop.exhausted";
pub const REASON_FEEDBACK_RESUMED: &str = "feedback.resumed";
pub const REASON_PIPE_END: &str = "pipe.end";
pub const REASON_PIPE_WRITE: &str = "pipe.write";
/// Reason carried by every trace that suspends a run for feedback.
pub const FEEDBACK_PAUSE_REASON: &str = "await_feedback";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceType {
    Started,
    Resumed,
    Step,
    Retry,
    AwaitFeedback,
    Write,
    Completed,
    Error,
}

impl TraceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TraceType::Started => "started",
            TraceType::Resumed => "resumed",
            TraceType::Step => "step",
            TraceType::Retry => "retry",
            TraceType::AwaitFeedback => "await_feedback",
            TraceType::Write => "write",
            TraceType::Completed => "completed",
            TraceType::Error => "error",
        }
    }

    /// Whether this trace counts toward a tick's transition budget.
    pub fn is_transition(&self) -> bool {
        matches!(self, TraceType::Step | TraceType::Retry)
    }
}

impl fmt::Display for TraceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TraceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "started" => Ok(TraceType::Started),
            "resumed" => Ok(TraceType::Resumed),
            "step" => Ok(TraceType::Step),
            "retry" => Ok(TraceType::Retry),
            "await_feedback" => Ok(TraceType::AwaitFeedback),
            "write" => Ok(TraceType::Write),
            "completed" => Ok(TraceType::Completed),
            "error" => Ok(TraceType::Error),
            other => Err(format!("unknown trace type '{other}'")),
        }
    }
}

/// A trace record was rejected before it could be persisted.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("trace {trace_id}: field `{field}` {reason}")]
pub struct SchemaViolation {
    pub trace_id: String,
    pub field: String,
    pub reason: String,
}

impl SchemaViolation {
    fn missing(trace_id: &str, field: &str) -> Self {
        Self {
            trace_id: trace_id.to_string(),
            field: field.to_string(),
            reason: "is required".to_string(),
        }
    }

    fn invalid(trace_id: &str, field: &str, reason: impl Into<String>) -> Self {
        Self {
            trace_id: trace_id.to_string(),
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

/// Identifiers shared by every trace emitted during one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceScope {
    pub run_id: String,
    pub tick_id: String,
    pub task_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceRecord {
    pub id: String,
    pub run_id: String,
    pub tick_id: String,
    pub task_id: String,
    #[serde(rename = "type")]
    pub trace_type: TraceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_state_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_state_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default)]
    pub attempt: u32,
    #[serde(default)]
    pub loop_iteration: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TerminalStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_json: Option<String>,
    pub timestamp: DateTime<Utc>,
}

const COMMON_FIELDS: [&str; 6] = ["id", "runId", "tickId", "taskId", "type", "timestamp"];

impl TraceRecord {
    pub fn new(scope: &TraceScope, trace_type: TraceType) -> Self {
        Self {
            // v7 ids sort by creation time, which keeps (timestamp, id) ordering stable
            id: Uuid::now_v7().to_string(),
            run_id: scope.run_id.clone(),
            tick_id: scope.tick_id.clone(),
            task_id: scope.task_id.clone(),
            trace_type,
            state_id: None,
            from_state_id: None,
            to_state_id: None,
            event: None,
            reason: None,
            attempt: 0,
            loop_iteration: 0,
            status: None,
            message: None,
            payload_json: None,
            timestamp: Utc::now(),
        }
    }

    pub fn state(mut self, state_id: impl Into<String>) -> Self {
        self.state_id = Some(state_id.into());
        self
    }

    pub fn transition(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.from_state_id = Some(from.into());
        self.to_state_id = Some(to.into());
        self
    }

    pub fn to_state(mut self, to: impl Into<String>) -> Self {
        self.to_state_id = Some(to.into());
        self
    }

    pub fn event(mut self, event: impl Into<String>) -> Self {
        self.event = Some(event.into());
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn loop_iteration(mut self, iteration: u32) -> Self {
        self.loop_iteration = iteration;
        self
    }

    pub fn status(mut self, status: TerminalStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn message(mut self, message: Option<String>) -> Self {
        self.message = message;
        self
    }

    pub fn payload(mut self, payload: &Value) -> Self {
        self.payload_json = Some(payload.to_string());
        self
    }

    /// Check the fields required by this record's type.
    pub fn validate(&self) -> Result<(), SchemaViolation> {
        let id = self.id.as_str();
        for (field, value) in [
            ("id", &self.id),
            ("runId", &self.run_id),
            ("tickId", &self.tick_id),
            ("taskId", &self.task_id),
        ] {
            if value.is_empty() {
                return Err(SchemaViolation::invalid(id, field, "must not be empty"));
            }
        }

        let require = |field: &str, value: &Option<String>| match value {
            Some(v) if !v.is_empty() => Ok(()),
            _ => Err(SchemaViolation::missing(id, field)),
        };

        match self.trace_type {
            TraceType::Started | TraceType::Resumed | TraceType::AwaitFeedback => {
                require("stateId", &self.state_id)?;
            }
            TraceType::Step => {
                require("fromStateId", &self.from_state_id)?;
                require("toStateId", &self.to_state_id)?;
                require("reason", &self.reason)?;
            }
            TraceType::Retry => {
                require("fromStateId", &self.from_state_id)?;
                require("toStateId", &self.to_state_id)?;
                require("reason", &self.reason)?;
                if self.attempt < 1 {
                    return Err(SchemaViolation::invalid(id, "attempt", "must be at least 1 for retry"));
                }
            }
            TraceType::Write => {
                require("stateId", &self.state_id)?;
                require("payloadJson", &self.payload_json)?;
            }
            TraceType::Completed => {
                if self.status.is_none() {
                    return Err(SchemaViolation::missing(id, "status"));
                }
            }
            TraceType::Error => {
                require("message", &self.message)?;
            }
        }

        if self.status.is_some() && self.trace_type != TraceType::Completed {
            return Err(SchemaViolation::invalid(
                id,
                "status",
                "is only allowed on completed traces",
            ));
        }

        if let Some(payload) = &self.payload_json {
            if serde_json::from_str::<Value>(payload).is_err() {
                return Err(SchemaViolation::invalid(id, "payloadJson", "is not valid JSON"));
            }
        }

        Ok(())
    }
}

/// Parse and validate an untyped trace record.
pub fn parse_trace(record: &Value) -> Result<TraceRecord, SchemaViolation> {
    let object = record
        .as_object()
        .ok_or_else(|| SchemaViolation::invalid("?", "record", "must be an object"))?;
    let trace_id = object.get("id").and_then(Value::as_str).unwrap_or("?");

    for field in COMMON_FIELDS {
        match object.get(field) {
            None | Some(Value::Null) => return Err(SchemaViolation::missing(trace_id, field)),
            Some(_) => {}
        }
    }

    if let Some(kind) = object.get("type") {
        let parsed = kind.as_str().map(TraceType::from_str);
        if !matches!(parsed, Some(Ok(_))) {
            return Err(SchemaViolation::invalid(trace_id, "type", format!("has unknown value {kind}")));
        }
    }

    if let Some(status) = object.get("status").filter(|s| !s.is_null()) {
        let parsed = status.as_str().map(TerminalStatus::from_str);
        if !matches!(parsed, Some(Ok(_))) {
            return Err(SchemaViolation::invalid(
                trace_id,
                "status",
                format!("must be one of done, blocked, failed (got {status})"),
            ));
        }
    }

    for field in ["attempt", "loopIteration"] {
        if let Some(value) = object.get(field).filter(|v| !v.is_null()) {
            if value.as_u64().and_then(|n| u32::try_from(n).ok()).is_none() {
                return Err(SchemaViolation::invalid(trace_id, field, "must be a non-negative integer"));
            }
        }
    }

    let parsed: TraceRecord = serde_json::from_value(record.clone())
        .map_err(|e| SchemaViolation::invalid(trace_id, "record", e.to_string()))?;
    parsed.validate()?;
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope() -> TraceScope {
        TraceScope {
            run_id: "run-1".into(),
            tick_id: "tick-1".into(),
            task_id: "task-1".into(),
        }
    }

    fn raw(trace_type: &str) -> Value {
        json!({
            "id": "t-1",
            "runId": "run-1",
            "tickId": "tick-1",
            "taskId": "task-1",
            "type": trace_type,
            "timestamp": "2026-01-01T00:00:00Z",
        })
    }

    #[test]
    fn test_step_without_to_state_is_rejected() {
        let mut record = raw("step");
        record["fromStateId"] = json!("draft");
        record["reason"] = json!("action.done");

        let err = parse_trace(&record).unwrap_err();
        assert_eq!(err.field, "toStateId");
        assert_eq!(err.trace_id, "t-1");
    }

    #[test]
    fn test_valid_step_parses() {
        let mut record = raw("step");
        record["fromStateId"] = json!("draft");
        record["toStateId"] = json!("review");
        record["reason"] = json!("action.done");
        record["attempt"] = json!(1);

        let trace = parse_trace(&record).unwrap();
        assert_eq!(trace.trace_type, TraceType::Step);
        assert_eq!(trace.to_state_id.as_deref(), Some("review"));
        assert_eq!(trace.loop_iteration, 0);
    }

    #[test]
    fn test_retry_requires_positive_attempt() {
        let mut record = raw("retry");
        record["fromStateId"] = json!("call");
        record["toStateId"] = json!("call");
        record["reason"] = json!(REASON_ACTION_ATTEMPT_FAILED);
        record["attempt"] = json!(0);
        assert_eq!(parse_trace(&record).unwrap_err().field, "attempt");

        record["attempt"] = json!(-1);
        assert_eq!(parse_trace(&record).unwrap_err().field, "attempt");

        record["attempt"] = json!(1);
        assert!(parse_trace(&record).is_ok());
    }

    #[test]
    fn test_completed_status_must_be_terminal() {
        let mut record = raw("completed");
        assert_eq!(parse_trace(&record).unwrap_err().field, "status");

        record["status"] = json!("running");
        assert_eq!(parse_trace(&record).unwrap_err().field, "status");

        record["status"] = json!("blocked");
        let trace = parse_trace(&record).unwrap();
        assert_eq!(trace.status, Some(TerminalStatus::Blocked));
    }

    #[test]
    fn test_missing_common_field() {
        let mut record = raw("started");
        record.as_object_mut().unwrap().remove("runId");
        record["stateId"] = json!("start");
        assert_eq!(parse_trace(&record).unwrap_err().field, "runId");
    }

    #[test]
    fn test_unknown_type() {
        let record = raw("teleported");
        assert_eq!(parse_trace(&record).unwrap_err().field, "type");
    }

    #[test]
    fn test_error_needs_message_and_write_needs_payload() {
        assert_eq!(parse_trace(&raw("error")).unwrap_err().field, "message");

        let mut write = raw("write");
        write["stateId"] = json!("__pipe_run__");
        assert_eq!(parse_trace(&write).unwrap_err().field, "payloadJson");
        write["payloadJson"] = json!("{not json");
        assert_eq!(parse_trace(&write).unwrap_err().field, "payloadJson");
        write["payloadJson"] = json!("\"# Summary\"");
        assert!(parse_trace(&write).is_ok());
    }

    #[test]
    fn test_built_records_validate_and_serialize_camel_case() {
        let trace = TraceRecord::new(&scope(), TraceType::Step)
            .transition("a", "b")
            .reason(REASON_ACTION_DONE)
            .attempt(1);
        assert!(trace.validate().is_ok());

        let value = serde_json::to_value(&trace).unwrap();
        assert_eq!(value["type"], "step");
        assert_eq!(value["fromStateId"], "a");
        assert_eq!(parse_trace(&value).unwrap(), trace);
    }

    #[test]
    fn test_status_outside_completed_is_rejected() {
        let trace = TraceRecord::new(&scope(), TraceType::Started)
            .state("start")
            .status(TerminalStatus::Done);
        assert_eq!(trace.validate().unwrap_err().field, "status");
    }
}
