//! Job domain module.
//!
//! This crate contains the job lifecycle rules, implemented purely as
//! deterministic domain logic (no IO, no channels, no storage):
//!
//! - `job`: the authoritative `Job` record and submission validation
//! - `event`: the transport-level `JobEvent`
//! - `state_machine`: the pure transition function over job status
//! - `retry`: the requeue vs. dead-letter decision and backoff policy

pub mod event;
pub mod job;
pub mod retry;
pub mod state_machine;

pub use event::{EventType, JobEvent};
pub use job::{
    DEFAULT_MAX_RETRIES, DEFAULT_PRIORITY, Job, JobStatus, JobType, MAX_NAME_LEN, MAX_RETRIES_LIMIT,
    NewJob, Payload,
};
pub use retry::{BackoffPolicy, RetryDecision, decide};
pub use state_machine::{IgnoreReason, Transition, TransitionError, Trigger, transition};
