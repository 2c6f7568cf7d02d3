//! Idempotency claims keyed by job id.
//!
//! A claim records the state of one job and the attempt (`retry_count`) it
//! belongs to. `try_acquire` succeeds when no claim exists, or when the
//! claim was requeued for an attempt no newer than the caller's. Every other
//! caller (redelivery, a second worker, a request left over from an earlier
//! attempt) sees the claim and skips execution. Claims expire after their TTL
//! so a crashed worker's claim cannot block a job forever.
//!
//! ```text
//! (absent) ──try_acquire(n)──▶ processing@n ──mark_completed──▶ completed@n
//!                                   │
//!                                   ├──mark_failed(n, release)──▶ requeued@n+1 ──try_acquire(≥ n+1)──▶ processing
//!                                   └──mark_failed(n)───────────▶ failed@n     terminal
//! ```
//!
//! `requeue(n)` reopens a claim for attempt `n` itself (an attempt that never
//! got to report an outcome). `release` deletes the record outright and is a
//! manual override only: it drops the fence along with the claim.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use jobrelay_core::JobId;

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis_claims;

pub use in_memory::InMemoryIdempotencyGuard;
#[cfg(feature = "redis")]
pub use redis_claims::RedisIdempotencyGuard;

/// Lifetime of a claim record.
pub const DEFAULT_CLAIM_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Key prefix of claim records in shared stores.
pub const CLAIM_KEY_PREFIX: &str = "jobrelay:idempotency:";

pub fn claim_key(job_id: JobId) -> String {
    format!("{CLAIM_KEY_PREFIX}{job_id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClaimState {
    Processing,
    /// Open again, but only for the recorded attempt or a later one.
    Requeued,
    Completed,
    Failed,
}

impl ClaimState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClaimState::Processing => "processing",
            ClaimState::Requeued => "requeued",
            ClaimState::Completed => "completed",
            ClaimState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<ClaimState> {
        match s {
            "processing" => Some(ClaimState::Processing),
            "requeued" => Some(ClaimState::Requeued),
            "completed" => Some(ClaimState::Completed),
            "failed" => Some(ClaimState::Failed),
            _ => None,
        }
    }
}

impl core::fmt::Display for ClaimState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A claim and the attempt it was written for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Claim {
    pub state: ClaimState,
    pub attempt: u32,
}

impl Claim {
    pub fn new(state: ClaimState, attempt: u32) -> Self {
        Self { state, attempt }
    }

    /// Whether a request for `attempt` may take this claim over.
    pub fn admits(&self, attempt: u32) -> bool {
        self.state == ClaimState::Requeued && attempt >= self.attempt
    }

    /// Stored form: `<state>:<attempt>`.
    pub fn encode(&self) -> String {
        format!("{}:{}", self.state, self.attempt)
    }

    pub fn decode(s: &str) -> Option<Claim> {
        let (state, attempt) = s.split_once(':')?;
        Some(Claim {
            state: ClaimState::parse(state)?,
            attempt: attempt.parse().ok()?,
        })
    }
}

/// The claim store could not answer. Callers fail closed: no claim, no
/// execution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GuardError {
    #[error("idempotency store unavailable: {0}")]
    Unavailable(String),
}

/// At most one execution in flight per job id, and never one for an attempt
/// that has already been superseded.
pub trait IdempotencyGuard: Send + Sync {
    /// `Ok(true)` when the caller now owns the claim for `attempt`.
    fn try_acquire(&self, job_id: JobId, attempt: u32) -> Result<bool, GuardError>;

    /// Overwrite the claim to `completed` and refresh its TTL.
    fn mark_completed(&self, job_id: JobId, attempt: u32) -> Result<(), GuardError>;

    /// Close out `attempt`. With `release` the next attempt may claim the
    /// job (and only it or later ones); otherwise the record becomes a
    /// terminal `failed` and no attempt may claim it again.
    fn mark_failed(&self, job_id: JobId, attempt: u32, release: bool) -> Result<(), GuardError> {
        if release {
            self.requeue(job_id, attempt.saturating_add(1))
        } else {
            self.mark_terminal(job_id, attempt)
        }
    }

    /// Terminal `failed` record.
    fn mark_terminal(&self, job_id: JobId, attempt: u32) -> Result<(), GuardError>;

    /// Reopen the job for `attempt` and later. Requests for older attempts
    /// stay locked out.
    fn requeue(&self, job_id: JobId, attempt: u32) -> Result<(), GuardError>;

    /// Unconditional delete (manual override).
    fn release(&self, job_id: JobId) -> Result<(), GuardError>;

    fn status(&self, job_id: JobId) -> Result<Option<Claim>, GuardError>;
}

impl<G> IdempotencyGuard for Arc<G>
where
    G: IdempotencyGuard + ?Sized,
{
    fn try_acquire(&self, job_id: JobId, attempt: u32) -> Result<bool, GuardError> {
        (**self).try_acquire(job_id, attempt)
    }

    fn mark_completed(&self, job_id: JobId, attempt: u32) -> Result<(), GuardError> {
        (**self).mark_completed(job_id, attempt)
    }

    fn mark_failed(&self, job_id: JobId, attempt: u32, release: bool) -> Result<(), GuardError> {
        (**self).mark_failed(job_id, attempt, release)
    }

    fn mark_terminal(&self, job_id: JobId, attempt: u32) -> Result<(), GuardError> {
        (**self).mark_terminal(job_id, attempt)
    }

    fn requeue(&self, job_id: JobId, attempt: u32) -> Result<(), GuardError> {
        (**self).requeue(job_id, attempt)
    }

    fn release(&self, job_id: JobId) -> Result<(), GuardError> {
        (**self).release(job_id)
    }

    fn status(&self, job_id: JobId) -> Result<Option<Claim>, GuardError> {
        (**self).status(job_id)
    }
}
