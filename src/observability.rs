use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

use crate::tasks::TerminalStatus;

/// Engine activity counters
#[derive(Debug, Default)]
pub struct EngineMetrics {
    pub ticks: AtomicU64,
    pub transitions: AtomicU64,
    pub retries: AtomicU64,
    pub feedback_pauses: AtomicU64,
    pub budget_pauses: AtomicU64,
    pub runs_done: AtomicU64,
    pub runs_blocked: AtomicU64,
    pub runs_failed: AtomicU64,
    pub fatal_errors: AtomicU64,
    pub claim_conflicts: AtomicU64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transition(&self) {
        self.transitions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_feedback_pause(&self) {
        self.feedback_pauses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_budget_pause(&self) {
        self.budget_pauses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completion(&self, status: TerminalStatus) {
        let counter = match status {
            TerminalStatus::Done => &self.runs_done,
            TerminalStatus::Blocked => &self.runs_blocked,
            TerminalStatus::Failed => &self.runs_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fatal_error(&self) {
        self.fatal_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_claim_conflict(&self) {
        self.claim_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_stats(&self) -> EngineStats {
        EngineStats {
            ticks: self.ticks.load(Ordering::Relaxed),
            transitions: self.transitions.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            feedback_pauses: self.feedback_pauses.load(Ordering::Relaxed),
            budget_pauses: self.budget_pauses.load(Ordering::Relaxed),
            runs_done: self.runs_done.load(Ordering::Relaxed),
            runs_blocked: self.runs_blocked.load(Ordering::Relaxed),
            runs_failed: self.runs_failed.load(Ordering::Relaxed),
            fatal_errors: self.fatal_errors.load(Ordering::Relaxed),
            claim_conflicts: self.claim_conflicts.load(Ordering::Relaxed),
        }
    }

    pub fn log_stats(&self) {
        let stats = self.get_stats();
        info!(
            ticks = stats.ticks,
            transitions = stats.transitions,
            retries = stats.retries,
            feedback_pauses = stats.feedback_pauses,
            budget_pauses = stats.budget_pauses,
            runs_done = stats.runs_done,
            runs_blocked = stats.runs_blocked,
            runs_failed = stats.runs_failed,
            fatal_errors = stats.fatal_errors,
            claim_conflicts = stats.claim_conflicts,
            "Engine metrics"
        );
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStats {
    pub ticks: u64,
    pub transitions: u64,
    pub retries: u64,
    pub feedback_pauses: u64,
    pub budget_pauses: u64,
    pub runs_done: u64,
    pub runs_blocked: u64,
    pub runs_failed: u64,
    pub fatal_errors: u64,
    pub claim_conflicts: u64,
}

/// Global metrics instance
static ENGINE_METRICS: std::sync::LazyLock<EngineMetrics> =
    std::sync::LazyLock::new(EngineMetrics::new);

pub fn engine_metrics() -> &'static EngineMetrics {
    &ENGINE_METRICS
}

/// Time an operation and log its duration when finished
pub struct OperationTimer {
    operation: String,
    start: Instant,
}

impl OperationTimer {
    pub fn new(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            start: Instant::now(),
        }
    }

    pub fn finish(self) {
        let duration = self.start.elapsed();
        info!(
            operation = %self.operation,
            duration_ms = duration.as_millis(),
            "Operation completed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = EngineMetrics::new();
        metrics.record_tick();
        metrics.record_transition();
        metrics.record_transition();
        metrics.record_completion(TerminalStatus::Blocked);
        metrics.record_claim_conflict();

        let stats = metrics.get_stats();
        assert_eq!(stats.ticks, 1);
        assert_eq!(stats.transitions, 2);
        assert_eq!(stats.runs_blocked, 1);
        assert_eq!(stats.runs_done, 0);
        assert_eq!(stats.claim_conflicts, 1);
    }
}
