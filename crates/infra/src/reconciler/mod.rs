//! Status reconciliation: the only writer of job status after creation.
//!
//! ## Flow
//!
//! ```text
//! status event ──▶ lock(job_id) ──▶ load ──▶ transition ──▶ update(expected version)
//!                                                 │                │ conflict: reload, retry
//!                                                 │                ▼
//!                                                 │           FAILED? ──▶ RetryCoordinator ──▶ commit PENDING | DEAD_LETTER
//!                                                 └─ ignored / rejected: logged, acked
//! ```
//!
//! ## Error classification
//!
//! Store, guard and transport failures are retriable: the consumer nacks and
//! the event comes back. An unknown job id is final: retrying cannot help, so
//! the event is acked and logged.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use jobrelay_core::{ExpectedVersion, JobId};
use jobrelay_events::{ChannelError, EventChannel};
use jobrelay_jobs::{
    EventType, IgnoreReason, Job, JobEvent, JobStatus, Transition, TransitionError, Trigger,
    transition,
};

use crate::config::RelayConfig;
use crate::idempotency::{GuardError, IdempotencyGuard};
use crate::store::{JobStore, StoreError};

pub mod coordinator;
pub mod locks;
pub mod pool;

pub use coordinator::RetryCoordinator;
pub use locks::StripedLocks;
pub use pool::{RECONCILER_GROUP, ReconcilerPool, ReconcilerStats};

/// Optimistic write attempts per event before giving up (the event is then
/// nacked and redelivered).
pub const MAX_CONFLICT_RETRIES: usize = 5;

/// Result of applying one status event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The job was written; carries its new status.
    Applied(JobStatus),
    Ignored(IgnoreReason),
    Rejected(TransitionError),
    /// A notification the reconciler itself emitted; nothing to apply.
    Notification(EventType),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconcileError {
    #[error("unknown job: {0}")]
    UnknownJob(JobId),

    #[error("cancel rejected for job {job_id}: {reason}")]
    CancelRejected { job_id: JobId, reason: String },

    #[error("gave up on job {0} after repeated version conflicts")]
    Contention(JobId),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Guard(#[from] GuardError),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

impl ReconcileError {
    /// Retriable errors nack the event; the rest ack it.
    pub fn is_retriable(&self) -> bool {
        match self {
            ReconcileError::UnknownJob(_) | ReconcileError::CancelRejected { .. } => false,
            ReconcileError::Store(StoreError::NotFound(_)) => false,
            ReconcileError::Contention(_)
            | ReconcileError::Store(_)
            | ReconcileError::Guard(_)
            | ReconcileError::Channel(_) => true,
        }
    }
}

/// Applies worker status events to stored jobs.
pub struct StatusReconciler {
    store: Arc<dyn JobStore>,
    guard: Arc<dyn IdempotencyGuard>,
    channel: Arc<dyn EventChannel<JobEvent>>,
    coordinator: RetryCoordinator,
    locks: StripedLocks,
    status_channel: String,
}

impl core::fmt::Debug for StatusReconciler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StatusReconciler")
            .field("coordinator", &self.coordinator)
            .field("status_channel", &self.status_channel)
            .finish_non_exhaustive()
    }
}

enum Committed {
    Done(Job),
    Conflict,
}

impl StatusReconciler {
    pub fn new(
        config: &RelayConfig,
        store: Arc<dyn JobStore>,
        guard: Arc<dyn IdempotencyGuard>,
        channel: Arc<dyn EventChannel<JobEvent>>,
    ) -> Self {
        let coordinator = RetryCoordinator::new(
            Arc::clone(&channel),
            Arc::clone(&guard),
            config.backoff.clone(),
            config.channels.requests.clone(),
            config.channels.dead_letter.clone(),
        );
        Self {
            store,
            guard,
            channel,
            coordinator,
            locks: StripedLocks::default(),
            status_channel: config.channels.status.clone(),
        }
    }

    /// Apply one status event.
    #[instrument(
        skip(self, event),
        fields(job_id = %event.job_id, event_type = %event.event_type, attempt = event.retry_count),
        err
    )]
    pub fn reconcile(&self, event: &JobEvent) -> Result<ReconcileOutcome, ReconcileError> {
        let Some(trigger) = Trigger::from_event(event) else {
            debug!("notification event, nothing to apply");
            return Ok(ReconcileOutcome::Notification(event.event_type));
        };

        let _lock = self.locks.lock(event.job_id);

        for _ in 0..MAX_CONFLICT_RETRIES {
            let job = self.load(event.job_id)?;

            match transition(&job, &trigger, Utc::now()) {
                Err(e) => {
                    warn!(status = %job.status, retry_count = job.retry_count, error = %e, "status event rejected");
                    return Ok(ReconcileOutcome::Rejected(e));
                }
                Ok(Transition::Ignored(reason)) => {
                    // A FAILED job seeing its own failure again means the
                    // previous decision never committed.
                    if job.status == JobStatus::Failed
                        && reason == IgnoreReason::Duplicate
                        && matches!(trigger, Trigger::Failed { .. })
                    {
                        info!("failed job left undecided, resuming retry decision");
                        return self.settle_failed(job);
                    }
                    debug!(status = %job.status, reason = %reason, "status event ignored");
                    return Ok(ReconcileOutcome::Ignored(reason));
                }
                Ok(Transition::Applied(next)) => match self.commit(&next, job.version)? {
                    Committed::Done(stored) => {
                        info!(status = %stored.status, version = stored.version, "job status updated");
                        if stored.status == JobStatus::Failed {
                            return self.settle_failed(stored);
                        }
                        return Ok(ReconcileOutcome::Applied(stored.status));
                    }
                    Committed::Conflict => continue,
                },
            }
        }

        Err(ReconcileError::Contention(event.job_id))
    }

    /// Run the retry decision for a FAILED job and commit its outcome.
    fn settle_failed(&self, failed: Job) -> Result<ReconcileOutcome, ReconcileError> {
        let mut job = failed;

        for _ in 0..MAX_CONFLICT_RETRIES {
            let trigger = self.coordinator.prepare(&job)?;

            let next = match transition(&job, &trigger, Utc::now()) {
                Ok(Transition::Applied(next)) => next,
                Ok(Transition::Ignored(reason)) => return Ok(ReconcileOutcome::Ignored(reason)),
                Err(e) => {
                    error!(error = %e, "retry decision could not be applied");
                    return Ok(ReconcileOutcome::Rejected(e));
                }
            };

            match self.commit(&next, job.version)? {
                Committed::Done(stored) => return Ok(ReconcileOutcome::Applied(stored.status)),
                Committed::Conflict => {
                    job = self.load(job.id)?;
                    if job.status != JobStatus::Failed {
                        debug!(status = %job.status, "decision already committed elsewhere");
                        return Ok(ReconcileOutcome::Ignored(IgnoreReason::Duplicate));
                    }
                }
            }
        }

        Err(ReconcileError::Contention(job.id))
    }

    /// Cancel a PENDING job that no worker has claimed.
    ///
    /// Claiming first is what makes this safe: a request delivered afterwards
    /// finds the claim and is skipped, so no worker event can follow the
    /// cancellation. If the cancel does not commit, the claim is reopened for
    /// the job's current attempt so the pending request still runs.
    #[instrument(skip_all, fields(job_id = %job_id), err)]
    pub fn cancel(&self, job_id: JobId) -> Result<Job, ReconcileError> {
        let _lock = self.locks.lock(job_id);

        let job = self.load(job_id)?;
        if job.status != JobStatus::Pending {
            return Err(ReconcileError::CancelRejected {
                job_id,
                reason: format!("job is {}", job.status),
            });
        }
        let attempt = job.retry_count;
        if !self.guard.try_acquire(job_id, attempt)? {
            return Err(ReconcileError::CancelRejected {
                job_id,
                reason: "job already claimed by a worker".to_string(),
            });
        }

        let cancelled = match self.commit_cancel(job) {
            Ok(cancelled) => cancelled,
            Err(e) => {
                warn!(attempt, error = %e, "cancel aborted, reopening claim");
                if let Err(reopen) = self.guard.requeue(job_id, attempt) {
                    error!(attempt, error = %reopen, "failed to reopen claim, job waits for claim expiry");
                }
                return Err(e);
            }
        };

        let notification = JobEvent::status_update(&cancelled, EventType::Cancelled);
        if let Err(e) = self
            .channel
            .publish(&self.status_channel, &notification.key(), notification)
        {
            error!(error = %e, "failed to publish cancellation notice");
        }

        info!("job cancelled");
        Ok(cancelled)
    }

    /// Terminal claim, then CANCELLED. The caller holds the claim and the
    /// job lock.
    fn commit_cancel(&self, mut job: Job) -> Result<Job, ReconcileError> {
        self.guard.mark_failed(job.id, job.retry_count, false)?;

        for _ in 0..MAX_CONFLICT_RETRIES {
            let next = match transition(&job, &Trigger::Cancel, Utc::now()) {
                Ok(Transition::Applied(next)) => next,
                Ok(Transition::Ignored(_)) | Err(_) => {
                    return Err(ReconcileError::CancelRejected {
                        job_id: job.id,
                        reason: format!("job is {}", job.status),
                    });
                }
            };
            match self.commit(&next, job.version)? {
                Committed::Done(stored) => return Ok(stored),
                Committed::Conflict => job = self.load(job.id)?,
            }
        }

        Err(ReconcileError::Contention(job.id))
    }

    fn load(&self, job_id: JobId) -> Result<Job, ReconcileError> {
        self.store
            .get(job_id)?
            .ok_or(ReconcileError::UnknownJob(job_id))
    }

    fn commit(&self, next: &Job, version: u64) -> Result<Committed, ReconcileError> {
        match self.store.update(next, ExpectedVersion::Exact(version)) {
            Ok(stored) => Ok(Committed::Done(stored)),
            Err(StoreError::VersionConflict { actual, .. }) => {
                debug!(expected = version, actual, "version conflict, reloading");
                Ok(Committed::Conflict)
            }
            Err(StoreError::NotFound(id)) => Err(ReconcileError::UnknownJob(id)),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use jobrelay_core::WorkerId;
    use jobrelay_events::InMemoryChannel;
    use jobrelay_jobs::{BackoffPolicy, NewJob, JobType};
    use serde_json::json;

    use std::sync::Mutex;

    use crate::idempotency::{Claim, ClaimState, InMemoryIdempotencyGuard};
    use crate::store::{InMemoryJobStore, JobQuery, JobStats, Page, PageRequest};

    /// In-memory store whose updates to one target status can be made to fail.
    #[derive(Default)]
    struct FlakyStore {
        inner: InMemoryJobStore,
        failing: Mutex<Option<JobStatus>>,
    }

    impl FlakyStore {
        fn fail_updates_to(&self, status: Option<JobStatus>) {
            *self.failing.lock().unwrap() = status;
        }
    }

    impl JobStore for FlakyStore {
        fn insert(&self, job: Job) -> Result<Job, StoreError> {
            self.inner.insert(job)
        }

        fn get(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
            self.inner.get(job_id)
        }

        fn update(&self, job: &Job, expected: ExpectedVersion) -> Result<Job, StoreError> {
            if *self.failing.lock().unwrap() == Some(job.status) {
                return Err(StoreError::Storage("connection reset".into()));
            }
            self.inner.update(job, expected)
        }

        fn list(&self, query: &JobQuery, page: PageRequest) -> Result<Page<Job>, StoreError> {
            self.inner.list(query, page)
        }

        fn stats(&self) -> Result<JobStats, StoreError> {
            self.inner.stats()
        }
    }

    struct Fixture {
        config: RelayConfig,
        store: Arc<FlakyStore>,
        guard: Arc<InMemoryIdempotencyGuard>,
        channel: InMemoryChannel<JobEvent>,
        reconciler: StatusReconciler,
    }

    fn fixture() -> Fixture {
        let config = RelayConfig {
            backoff: BackoffPolicy::immediate(),
            ..RelayConfig::default()
        };
        let store = Arc::new(FlakyStore::default());
        let guard = Arc::new(InMemoryIdempotencyGuard::new());
        let channel = InMemoryChannel::new();
        let reconciler = StatusReconciler::new(
            &config,
            store.clone(),
            guard.clone(),
            Arc::new(channel.clone()),
        );
        Fixture {
            config,
            store,
            guard,
            channel,
            reconciler,
        }
    }

    fn create(f: &Fixture, max_retries: u32) -> Job {
        let job = Job::create(
            NewJob::new("nightly", JobType::ProcessData).with_max_retries(max_retries),
            Utc::now(),
        )
        .unwrap();
        f.store.insert(job).unwrap()
    }

    fn worker_event(job: &Job, event_type: EventType, attempt: u32) -> JobEvent {
        let mut at_attempt = job.clone();
        at_attempt.retry_count = attempt;
        let request = JobEvent::request(&at_attempt);
        let event = JobEvent::worker_update(&request, event_type, WorkerId::new("w-1"));
        match event_type {
            EventType::Completed => event.with_result(
                json!({"recordsProcessed": 10})
                    .as_object()
                    .cloned()
                    .unwrap_or_default(),
            ),
            EventType::Failed => event.with_error("boom"),
            _ => event,
        }
    }

    fn stored(f: &Fixture, job: &Job) -> Job {
        f.store.get(job.id).unwrap().unwrap()
    }

    #[test]
    fn started_then_completed_reaches_completed() {
        let f = fixture();
        let job = create(&f, 3);

        assert_eq!(
            f.reconciler.reconcile(&worker_event(&job, EventType::Started, 0)).unwrap(),
            ReconcileOutcome::Applied(JobStatus::Running)
        );
        assert_eq!(
            f.reconciler.reconcile(&worker_event(&job, EventType::Completed, 0)).unwrap(),
            ReconcileOutcome::Applied(JobStatus::Completed)
        );

        let done = stored(&f, &job);
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.worker_id, Some(WorkerId::new("w-1")));
        assert!(done.completed_at.is_some());
        assert_eq!(done.version, 3);
    }

    #[test]
    fn repeated_completion_is_a_no_op() {
        let f = fixture();
        let job = create(&f, 3);
        f.reconciler.reconcile(&worker_event(&job, EventType::Started, 0)).unwrap();
        f.reconciler.reconcile(&worker_event(&job, EventType::Completed, 0)).unwrap();
        let before = stored(&f, &job);

        assert_eq!(
            f.reconciler.reconcile(&worker_event(&job, EventType::Completed, 0)).unwrap(),
            ReconcileOutcome::Ignored(IgnoreReason::AlreadyTerminal(JobStatus::Completed))
        );
        assert_eq!(stored(&f, &job), before);
    }

    #[test]
    fn failure_with_retries_left_requeues() {
        let f = fixture();
        let job = create(&f, 2);
        f.guard.try_acquire(job.id, 0).unwrap();

        f.reconciler.reconcile(&worker_event(&job, EventType::Started, 0)).unwrap();
        assert_eq!(
            f.reconciler.reconcile(&worker_event(&job, EventType::Failed, 0)).unwrap(),
            ReconcileOutcome::Applied(JobStatus::Pending)
        );

        let requeued = stored(&f, &job);
        assert_eq!(requeued.retry_count, 1);
        assert_eq!(requeued.error_message.as_deref(), Some("boom"));
        assert!(requeued.started_at.is_none());
        assert_eq!(
            f.guard.status(job.id).unwrap(),
            Some(Claim::new(ClaimState::Requeued, 1))
        );

        let requests = f.channel.messages(&f.config.channels.requests);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].event_type, EventType::Retry);
        assert_eq!(requests[0].retry_count, 1);
    }

    #[test]
    fn failure_without_retries_dead_letters() {
        let f = fixture();
        let job = create(&f, 0);
        f.guard.try_acquire(job.id, 0).unwrap();

        f.reconciler.reconcile(&worker_event(&job, EventType::Started, 0)).unwrap();
        assert_eq!(
            f.reconciler.reconcile(&worker_event(&job, EventType::Failed, 0)).unwrap(),
            ReconcileOutcome::Applied(JobStatus::DeadLetter)
        );

        assert_eq!(stored(&f, &job).status, JobStatus::DeadLetter);
        assert_eq!(
            f.guard.status(job.id).unwrap(),
            Some(Claim::new(ClaimState::Failed, 0))
        );
        assert_eq!(f.channel.messages(&f.config.channels.dead_letter).len(), 1);
        assert!(f.channel.messages(&f.config.channels.status).is_empty());
    }

    #[test]
    fn stale_attempt_is_ignored() {
        let f = fixture();
        let job = create(&f, 3);
        f.reconciler.reconcile(&worker_event(&job, EventType::Started, 0)).unwrap();
        f.reconciler.reconcile(&worker_event(&job, EventType::Failed, 0)).unwrap();

        assert_eq!(
            f.reconciler.reconcile(&worker_event(&job, EventType::Completed, 0)).unwrap(),
            ReconcileOutcome::Ignored(IgnoreReason::Stale {
                event_attempt: 0,
                current_attempt: 1
            })
        );
    }

    #[test]
    fn guard_outage_during_decision_is_resumed_on_redelivery() {
        let f = fixture();
        let job = create(&f, 1);
        f.reconciler.reconcile(&worker_event(&job, EventType::Started, 0)).unwrap();

        f.guard.set_available(false);
        let err = f
            .reconciler
            .reconcile(&worker_event(&job, EventType::Failed, 0))
            .unwrap_err();
        assert!(err.is_retriable());
        assert_eq!(stored(&f, &job).status, JobStatus::Failed);

        f.guard.set_available(true);
        assert_eq!(
            f.reconciler.reconcile(&worker_event(&job, EventType::Failed, 0)).unwrap(),
            ReconcileOutcome::Applied(JobStatus::Pending)
        );
        assert_eq!(stored(&f, &job).retry_count, 1);
    }

    #[test]
    fn unknown_job_is_final() {
        let f = fixture();
        let ghost = Job::create(NewJob::new("ghost", JobType::SyncData), Utc::now()).unwrap();

        let err = f
            .reconciler
            .reconcile(&worker_event(&ghost, EventType::Started, 0))
            .unwrap_err();
        assert_eq!(err, ReconcileError::UnknownJob(ghost.id));
        assert!(!err.is_retriable());
    }

    #[test]
    fn cancel_pending_job_claims_and_notifies() {
        let f = fixture();
        let job = create(&f, 3);

        let cancelled = f.reconciler.cancel(job.id).unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert!(cancelled.completed_at.is_some());
        assert_eq!(
            f.guard.status(job.id).unwrap(),
            Some(Claim::new(ClaimState::Failed, 0))
        );

        let notices = f.channel.messages(&f.config.channels.status);
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].event_type, EventType::Cancelled);
        assert_eq!(
            f.reconciler.reconcile(&notices[0]).unwrap(),
            ReconcileOutcome::Notification(EventType::Cancelled)
        );

        // A late worker event cannot resurrect it.
        assert_eq!(
            f.reconciler.reconcile(&worker_event(&job, EventType::Started, 0)).unwrap(),
            ReconcileOutcome::Ignored(IgnoreReason::AlreadyTerminal(JobStatus::Cancelled))
        );
    }

    #[test]
    fn cancel_is_rejected_for_running_or_claimed_jobs() {
        let f = fixture();

        let running = create(&f, 3);
        f.reconciler.reconcile(&worker_event(&running, EventType::Started, 0)).unwrap();
        assert!(matches!(
            f.reconciler.cancel(running.id),
            Err(ReconcileError::CancelRejected { .. })
        ));

        let claimed = create(&f, 3);
        f.guard.try_acquire(claimed.id, 0).unwrap();
        assert!(matches!(
            f.reconciler.cancel(claimed.id),
            Err(ReconcileError::CancelRejected { .. })
        ));
        assert_eq!(stored(&f, &claimed).status, JobStatus::Pending);
    }

    #[test]
    fn retry_commit_failure_is_resumed_on_redelivery() {
        let f = fixture();
        let job = create(&f, 2);
        f.guard.try_acquire(job.id, 0).unwrap();
        f.reconciler.reconcile(&worker_event(&job, EventType::Started, 0)).unwrap();

        f.store.fail_updates_to(Some(JobStatus::Pending));
        let err = f
            .reconciler
            .reconcile(&worker_event(&job, EventType::Failed, 0))
            .unwrap_err();
        assert!(err.is_retriable());
        assert_eq!(stored(&f, &job).status, JobStatus::Failed);

        f.store.fail_updates_to(None);
        assert_eq!(
            f.reconciler.reconcile(&worker_event(&job, EventType::Failed, 0)).unwrap(),
            ReconcileOutcome::Applied(JobStatus::Pending)
        );
        assert_eq!(stored(&f, &job).retry_count, 1);

        // Both decisions published attempt 1; the attempt-0 request stays fenced
        // and exactly one attempt-1 request gets to run.
        let requests = f.channel.messages(&f.config.channels.requests);
        assert!(requests.iter().all(|r| r.retry_count == 1));
        assert!(!f.guard.try_acquire(job.id, 0).unwrap());
        assert!(f.guard.try_acquire(job.id, 1).unwrap());
        assert!(!f.guard.try_acquire(job.id, 1).unwrap());
    }

    #[test]
    fn cancel_store_failure_leaves_job_runnable() {
        let f = fixture();
        let job = create(&f, 3);

        f.store.fail_updates_to(Some(JobStatus::Cancelled));
        let err = f.reconciler.cancel(job.id).unwrap_err();
        assert!(err.is_retriable());

        assert_eq!(stored(&f, &job).status, JobStatus::Pending);
        assert_eq!(
            f.guard.status(job.id).unwrap(),
            Some(Claim::new(ClaimState::Requeued, 0))
        );
        assert!(f.channel.messages(&f.config.channels.status).is_empty());
        // The pending request can still be executed.
        assert!(f.guard.try_acquire(job.id, 0).unwrap());
    }

    #[test]
    fn cancel_succeeds_once_the_store_recovers() {
        let f = fixture();
        let job = create(&f, 3);

        f.store.fail_updates_to(Some(JobStatus::Cancelled));
        assert!(f.reconciler.cancel(job.id).is_err());

        f.store.fail_updates_to(None);
        let cancelled = f.reconciler.cancel(job.id).unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert_eq!(
            f.guard.status(job.id).unwrap(),
            Some(Claim::new(ClaimState::Failed, 0))
        );
        assert!(!f.guard.try_acquire(job.id, 0).unwrap());
    }
}
