//! Processing of one request delivery.
//!
//! ```text
//! request ──claim(attempt)──▶ denied ──────────────────────▶ skip, ack
//!            │ store down ───────────────────────────────▶ nack
//!            ▼
//!        publish STARTED ──▶ dispatch ──ok──▶ claim completed, publish COMPLETED ──▶ ack
//!                                 └─err──▶ publish FAILED (claim stays processing) ──▶ ack
//! ```
//!
//! Claims are fenced by the request's `retry_count`: once the reconciler has
//! requeued a job for attempt `n`, a redelivered request from an older
//! attempt is skipped. A failed outcome publish requeues the claim for the
//! same attempt and nacks, so the request runs again. The worker never
//! touches the job store; the reconciler owns it.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use jobrelay_core::WorkerId;
use jobrelay_events::{ChannelError, Delivery, EventChannel};
use jobrelay_jobs::{EventType, JobEvent};

use crate::idempotency::IdempotencyGuard;

use super::DispatchError;
use super::handlers::HandlerRegistry;

/// What happened to one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Succeeded,
    Failed { error: String },
    /// Another attempt already holds (or finished) the claim.
    Skipped,
    /// Not an execution request.
    Ignored,
    /// Nacked for redelivery.
    Requeued,
}

#[derive(Clone)]
pub struct JobWorker {
    worker_id: WorkerId,
    channel: Arc<dyn EventChannel<JobEvent>>,
    guard: Arc<dyn IdempotencyGuard>,
    registry: Arc<HandlerRegistry>,
    status_channel: String,
}

impl core::fmt::Debug for JobWorker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobWorker")
            .field("worker_id", &self.worker_id)
            .field("status_channel", &self.status_channel)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl JobWorker {
    pub fn new(
        worker_id: WorkerId,
        channel: Arc<dyn EventChannel<JobEvent>>,
        guard: Arc<dyn IdempotencyGuard>,
        registry: Arc<HandlerRegistry>,
        status_channel: impl Into<String>,
    ) -> Self {
        Self {
            worker_id,
            channel,
            guard,
            registry,
            status_channel: status_channel.into(),
        }
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    /// Process and settle one request delivery.
    pub fn process(&self, delivery: Delivery<JobEvent>) -> ProcessOutcome {
        let event = delivery.message().clone();
        let job_id = event.job_id;

        if !event.event_type.is_request() {
            warn!(
                job_id = %job_id,
                event_type = %event.event_type,
                position = %delivery.position(),
                "non-request event on request channel, ignoring"
            );
            settle(delivery, true);
            return ProcessOutcome::Ignored;
        }

        match self.guard.try_acquire(job_id, event.retry_count) {
            Ok(true) => {}
            Ok(false) => {
                info!(
                    job_id = %job_id,
                    attempt = event.retry_count,
                    delivery_attempt = delivery.attempt(),
                    "job already claimed or attempt superseded, skipping"
                );
                settle(delivery, true);
                return ProcessOutcome::Skipped;
            }
            Err(e) => {
                error!(job_id = %job_id, error = %e, "idempotency guard unavailable, not executing");
                settle(delivery, false);
                return ProcessOutcome::Requeued;
            }
        }

        info!(
            job_id = %job_id,
            job_type = %event.job_type,
            attempt = event.retry_count,
            worker_id = %self.worker_id,
            "executing job"
        );

        let started = JobEvent::worker_update(&event, EventType::Started, self.worker_id.clone());
        if let Err(e) = self.publish_status(started) {
            return self.abandon(delivery, &event, e);
        }

        match self.registry.dispatch(&event) {
            Ok(result) => {
                if let Err(e) = self.guard.mark_completed(job_id, event.retry_count) {
                    warn!(job_id = %job_id, error = %e, "failed to mark claim completed");
                }
                let completed =
                    JobEvent::worker_update(&event, EventType::Completed, self.worker_id.clone())
                        .with_result(result);
                if let Err(e) = self.publish_status(completed) {
                    return self.abandon(delivery, &event, e);
                }
                info!(job_id = %job_id, attempt = event.retry_count, "job completed");
                settle(delivery, true);
                ProcessOutcome::Succeeded
            }
            Err(err) => {
                let message = match &err {
                    DispatchError::Execution(e) => e.message().to_string(),
                    other => other.to_string(),
                };
                warn!(job_id = %job_id, attempt = event.retry_count, error = %message, "job failed");

                let failed =
                    JobEvent::worker_update(&event, EventType::Failed, self.worker_id.clone())
                        .with_error(message.clone());
                if let Err(e) = self.publish_status(failed) {
                    return self.abandon(delivery, &event, e);
                }
                settle(delivery, true);
                ProcessOutcome::Failed { error: message }
            }
        }
    }

    fn publish_status(&self, event: JobEvent) -> Result<(), ChannelError> {
        let position = self
            .channel
            .publish(&self.status_channel, &event.key(), event.clone())?;
        debug!(
            job_id = %event.job_id,
            event_type = %event.event_type,
            partition = position.partition,
            "status event published"
        );
        Ok(())
    }

    /// Outcome could not be reported: reopen the claim for this attempt and
    /// let the request be redelivered.
    fn abandon(&self, delivery: Delivery<JobEvent>, event: &JobEvent, cause: ChannelError) -> ProcessOutcome {
        let job_id = event.job_id;
        error!(job_id = %job_id, error = %cause, "failed to publish status event, requeueing request");
        if let Err(e) = self.guard.requeue(job_id, event.retry_count) {
            warn!(job_id = %job_id, error = %e, "failed to reopen claim");
        }
        settle(delivery, false);
        ProcessOutcome::Requeued
    }
}

fn settle(delivery: Delivery<JobEvent>, ack: bool) {
    let position = delivery.position().to_string();
    let result = if ack { delivery.ack() } else { delivery.nack() };
    if let Err(e) = result {
        warn!(position = %position, ack, error = %e, "failed to settle delivery");
    }
}
