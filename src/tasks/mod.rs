// Task persistence, claiming and the single-writer tick path

pub mod claim;
pub mod errors;
pub mod runner;
pub mod store;
pub mod types;

pub use claim::{ClaimOutcome, ClaimToken};
pub use errors::TaskError;
pub use runner::{TaskRunner, TickSummary, DEFAULT_CLAIM_LEASE_SECONDS};
pub use store::{validate_traces, InMemoryTaskStore, TaskStore};
pub use types::{Run, RunStatus, StepVars, Task, TaskState, TerminalStatus};
