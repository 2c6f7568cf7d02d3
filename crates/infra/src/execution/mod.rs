//! Worker side of the relay: execute requested jobs and report outcomes.
//!
//! ## Components
//!
//! - `JobHandler` / `HandlerRegistry`: job type to handler dispatch table
//! - `JobWorker`: processes one request delivery (claim, execute, report)
//! - `WorkerPool`: consumer threads on the request channel
//! - `simulated`: stand-in handlers with configurable duration and failure rate

use thiserror::Error;

use jobrelay_jobs::JobType;

pub mod handlers;
pub mod pool;
pub mod simulated;
pub mod worker;

pub use handlers::{HandlerRegistry, JobHandler};
pub use pool::{WORKER_GROUP, WorkerPool, WorkerStats};
pub use simulated::SimulationConfig;
pub use worker::{JobWorker, ProcessOutcome};

/// A handler ran and failed. Recovered by the retry engine, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ExecutionError {
    message: String,
}

impl ExecutionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("no handler registered for job type {0}")]
    NoHandler(JobType),

    #[error("handler registry incomplete, missing: {}", join_types(.0))]
    MissingHandlers(Vec<JobType>),

    #[error("execution failed: {0}")]
    Execution(#[from] ExecutionError),
}

fn join_types(types: &[JobType]) -> String {
    types
        .iter()
        .map(|t| t.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}
