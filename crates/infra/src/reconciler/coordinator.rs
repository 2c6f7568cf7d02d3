//! Side effects of the requeue / dead-letter decision.
//!
//! The coordinator runs before the FAILED job is committed to its next
//! status. Everything it does is safe to repeat: a crash between its publish
//! and the commit re-runs it on redelivery, producing at worst a duplicate
//! request for the same attempt (skipped by the claim) or a duplicate
//! notification.

use std::sync::Arc;

use tracing::{info, warn};

use jobrelay_events::EventChannel;
use jobrelay_jobs::{BackoffPolicy, EventType, Job, JobEvent, JobStatus, RetryDecision, Trigger, decide};

use crate::idempotency::IdempotencyGuard;

use super::ReconcileError;

#[derive(Clone)]
pub struct RetryCoordinator {
    channel: Arc<dyn EventChannel<JobEvent>>,
    guard: Arc<dyn IdempotencyGuard>,
    policy: BackoffPolicy,
    request_channel: String,
    dead_letter_channel: String,
}

impl core::fmt::Debug for RetryCoordinator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RetryCoordinator")
            .field("policy", &self.policy)
            .field("request_channel", &self.request_channel)
            .field("dead_letter_channel", &self.dead_letter_channel)
            .finish_non_exhaustive()
    }
}

impl RetryCoordinator {
    pub fn new(
        channel: Arc<dyn EventChannel<JobEvent>>,
        guard: Arc<dyn IdempotencyGuard>,
        policy: BackoffPolicy,
        request_channel: impl Into<String>,
        dead_letter_channel: impl Into<String>,
    ) -> Self {
        Self {
            channel,
            guard,
            policy,
            request_channel: request_channel.into(),
            dead_letter_channel: dead_letter_channel.into(),
        }
    }

    /// Perform the side effects for a FAILED job and return the trigger that
    /// commits the decision.
    pub fn prepare(&self, failed: &Job) -> Result<Trigger, ReconcileError> {
        match decide(failed, &self.policy) {
            RetryDecision::Retry { retry_count, delay } => {
                // Release first: the new attempt must be able to claim, and
                // requests from this one must not.
                self.guard.mark_failed(failed.id, failed.retry_count, true)?;

                let mut next_attempt = failed.clone();
                next_attempt.retry_count = retry_count;
                let request = JobEvent::retry(&next_attempt);
                self.channel.publish_delayed(
                    &self.request_channel,
                    &request.key(),
                    request,
                    delay,
                )?;

                info!(
                    job_id = %failed.id,
                    retry_count,
                    max_retries = failed.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "job requeued"
                );
                Ok(Trigger::RetryRequeued { retry_count })
            }
            RetryDecision::DeadLetter => {
                self.guard.mark_failed(failed.id, failed.retry_count, false)?;

                let mut dead = failed.clone();
                dead.status = JobStatus::DeadLetter;
                let notification = JobEvent::status_update(&dead, EventType::DeadLetter);
                self.channel
                    .publish(&self.dead_letter_channel, &notification.key(), notification)?;

                warn!(
                    job_id = %failed.id,
                    retry_count = failed.retry_count,
                    error = failed.error_message.as_deref().unwrap_or(""),
                    "job dead-lettered"
                );
                Ok(Trigger::DeadLettered)
            }
        }
    }
}
