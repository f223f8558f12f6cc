// Optimistic claim on a task row

use chrono::{DateTime, Duration, Utc};
use std::fmt;
use uuid::Uuid;

use super::types::{Task, TaskState};

/// Identifies the caller holding a claim.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClaimToken(String);

impl ClaimToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// `host:pid:uuid`, unique per caller and per attempt.
    pub fn generate() -> Self {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown-host".to_string());
        Self(format!("{}:{}:{}", host, std::process::id(), Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClaimToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClaimToken {
    fn from(token: &str) -> Self {
        Self::new(token)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed {
        token: String,
        expires_at: DateTime<Utc>,
    },
    /// Someone else holds the task, or it has already finished.
    Conflict {
        holder: Option<String>,
        state: TaskState,
    },
}

impl ClaimOutcome {
    pub fn is_claimed(&self) -> bool {
        matches!(self, ClaimOutcome::Claimed { .. })
    }
}

impl Task {
    /// Compare-and-swap: take the lock if it is absent or expired.
    ///
    /// An unexpired lock conflicts even when it carries the same token.
    pub fn try_claim(&mut self, token: &ClaimToken, now: DateTime<Utc>, lease: Duration) -> ClaimOutcome {
        if self.is_terminal() || self.is_locked_at(now) {
            return ClaimOutcome::Conflict {
                holder: self.lock_token.clone().filter(|_| self.is_locked_at(now)),
                state: self.state,
            };
        }

        let expires_at = now + lease;
        self.lock_token = Some(token.as_str().to_string());
        self.lock_expires_at = Some(expires_at);
        ClaimOutcome::Claimed {
            token: token.as_str().to_string(),
            expires_at,
        }
    }

    /// Drop the lock if `token` holds it. Returns whether anything was released.
    pub fn release(&mut self, token: &ClaimToken) -> bool {
        if !self.is_held_by(token) {
            return false;
        }
        self.lock_token = None;
        self.lock_expires_at = None;
        true
    }

    pub fn is_held_by(&self, token: &ClaimToken) -> bool {
        self.lock_token.as_deref() == Some(token.as_str())
    }
}
