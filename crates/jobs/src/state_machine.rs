//! Job lifecycle transitions.
//!
//! ```text
//! PENDING ──started──▶ RUNNING ──completed──▶ COMPLETED
//!    │                    │
//!  cancel               failed
//!    ▼                    ▼
//! CANCELLED            FAILED ──dead-lettered──▶ DEAD_LETTER
//!                         │
//!                   retry-requeued ──▶ PENDING (retry_count + 1)
//! ```
//!
//! `transition` is pure: it never mutates its input and returns the next job
//! (or why the trigger was a no-op). Worker triggers carry the attempt they
//! belong to, so events from an earlier execution attempt are recognised as
//! stale instead of corrupting the current one.

use chrono::{DateTime, Utc};
use thiserror::Error;

use jobrelay_core::WorkerId;

use crate::event::{EventType, JobEvent};
use crate::job::{Job, JobStatus, Payload};

/// Something that asks the job to move.
#[derive(Debug, Clone, PartialEq)]
pub enum Trigger {
    Started {
        worker_id: WorkerId,
        attempt: u32,
    },
    Completed {
        result: Payload,
        worker_id: WorkerId,
        attempt: u32,
    },
    Failed {
        error: String,
        worker_id: WorkerId,
        attempt: u32,
    },
    RetryRequeued {
        retry_count: u32,
    },
    DeadLettered,
    Cancel,
}

impl Trigger {
    pub fn name(&self) -> &'static str {
        match self {
            Trigger::Started { .. } => "started",
            Trigger::Completed { .. } => "completed",
            Trigger::Failed { .. } => "failed",
            Trigger::RetryRequeued { .. } => "retry-requeued",
            Trigger::DeadLettered => "dead-lettered",
            Trigger::Cancel => "cancel",
        }
    }

    /// Attempt a worker trigger belongs to.
    pub fn attempt(&self) -> Option<u32> {
        match self {
            Trigger::Started { attempt, .. }
            | Trigger::Completed { attempt, .. }
            | Trigger::Failed { attempt, .. } => Some(*attempt),
            _ => None,
        }
    }

    /// Trigger for a worker-emitted status event; `None` for everything
    /// else (requests, notifications the reconciler itself emitted).
    pub fn from_event(event: &JobEvent) -> Option<Trigger> {
        let worker_id = event
            .worker_id
            .clone()
            .unwrap_or_else(|| WorkerId::new("unknown"));
        let attempt = event.retry_count;

        match event.event_type {
            EventType::Started => Some(Trigger::Started { worker_id, attempt }),
            EventType::Completed => Some(Trigger::Completed {
                result: event.result.clone().unwrap_or_default(),
                worker_id,
                attempt,
            }),
            EventType::Failed => Some(Trigger::Failed {
                error: event
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "unknown error".to_string()),
                worker_id,
                attempt,
            }),
            _ => None,
        }
    }
}

impl core::fmt::Display for Trigger {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

/// Why a trigger changed nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreReason {
    /// The job already reached a terminal status.
    AlreadyTerminal(JobStatus),
    /// The trigger was already applied (redelivery).
    Duplicate,
    /// The trigger belongs to an earlier execution attempt.
    Stale { event_attempt: u32, current_attempt: u32 },
}

impl core::fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            IgnoreReason::AlreadyTerminal(status) => write!(f, "already terminal ({status})"),
            IgnoreReason::Duplicate => f.write_str("duplicate"),
            IgnoreReason::Stale {
                event_attempt,
                current_attempt,
            } => write!(f, "stale attempt {event_attempt} (current {current_attempt})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Applied(Job),
    Ignored(IgnoreReason),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("invalid transition: '{trigger}' from {from}")]
    InvalidTransition {
        from: JobStatus,
        trigger: &'static str,
    },
}

fn invalid(job: &Job, trigger: &Trigger) -> TransitionError {
    TransitionError::InvalidTransition {
        from: job.status,
        trigger: trigger.name(),
    }
}

/// Apply `trigger` to `job` at time `now`.
pub fn transition(
    job: &Job,
    trigger: &Trigger,
    now: DateTime<Utc>,
) -> Result<Transition, TransitionError> {
    if job.status.is_terminal() {
        return Ok(Transition::Ignored(IgnoreReason::AlreadyTerminal(job.status)));
    }

    if let Some(attempt) = trigger.attempt() {
        if attempt < job.retry_count {
            return Ok(Transition::Ignored(IgnoreReason::Stale {
                event_attempt: attempt,
                current_attempt: job.retry_count,
            }));
        }
        if attempt > job.retry_count {
            return Err(invalid(job, trigger));
        }
    }

    let mut next = job.clone();
    next.updated_at = now;

    match (job.status, trigger) {
        (JobStatus::Pending, Trigger::Started { worker_id, .. }) => {
            next.status = JobStatus::Running;
            next.worker_id = Some(worker_id.clone());
            next.started_at = Some(now);
        }
        (JobStatus::Running | JobStatus::Failed, Trigger::Started { .. }) => {
            return Ok(Transition::Ignored(IgnoreReason::Duplicate));
        }
        (
            JobStatus::Running,
            Trigger::Completed {
                result, worker_id, ..
            },
        ) => {
            next.status = JobStatus::Completed;
            next.result = Some(result.clone());
            next.error_message = None;
            next.worker_id = Some(worker_id.clone());
            next.completed_at = Some(now);
        }
        (
            JobStatus::Running,
            Trigger::Failed {
                error, worker_id, ..
            },
        ) => {
            next.status = JobStatus::Failed;
            next.error_message = Some(error.clone());
            next.worker_id = Some(worker_id.clone());
        }
        (JobStatus::Failed, Trigger::Failed { .. }) => {
            return Ok(Transition::Ignored(IgnoreReason::Duplicate));
        }
        (JobStatus::Failed, Trigger::RetryRequeued { retry_count }) => {
            if *retry_count != job.retry_count + 1 || *retry_count > job.max_retries {
                return Err(invalid(job, trigger));
            }
            next.status = JobStatus::Pending;
            next.retry_count = *retry_count;
            next.started_at = None;
        }
        (JobStatus::Pending, Trigger::RetryRequeued { retry_count })
            if *retry_count == job.retry_count =>
        {
            return Ok(Transition::Ignored(IgnoreReason::Duplicate));
        }
        (JobStatus::Failed, Trigger::DeadLettered) => {
            next.status = JobStatus::DeadLetter;
            next.completed_at = Some(now);
        }
        (JobStatus::Pending, Trigger::Cancel) => {
            next.status = JobStatus::Cancelled;
            next.completed_at = Some(now);
        }
        _ => return Err(invalid(job, trigger)),
    }

    Ok(Transition::Applied(next))
}
