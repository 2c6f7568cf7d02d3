//! Library surface for submitting and inspecting jobs.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{error, info, instrument};

use jobrelay_core::{DomainError, JobId};
use jobrelay_events::{ChannelError, EventChannel};
use jobrelay_jobs::{Job, JobEvent, NewJob};

use crate::config::RelayConfig;
use crate::reconciler::{ReconcileError, StatusReconciler};
use crate::store::{JobQuery, JobStats, JobStore, Page, PageRequest, StoreError};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transport(#[from] ChannelError),

    #[error(transparent)]
    Reconcile(ReconcileError),
}

impl From<ReconcileError> for ServiceError {
    fn from(err: ReconcileError) -> Self {
        match err {
            ReconcileError::UnknownJob(id) => ServiceError::NotFound(id),
            ReconcileError::CancelRejected { reason, .. } => {
                ServiceError::Domain(DomainError::invalid_operation(format!(
                    "job cannot be cancelled: {reason}"
                )))
            }
            other => ServiceError::Reconcile(other),
        }
    }
}

pub struct JobService {
    store: Arc<dyn JobStore>,
    channel: Arc<dyn EventChannel<JobEvent>>,
    reconciler: Arc<StatusReconciler>,
    request_channel: String,
}

impl core::fmt::Debug for JobService {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobService")
            .field("request_channel", &self.request_channel)
            .finish_non_exhaustive()
    }
}

impl JobService {
    pub fn new(
        config: &RelayConfig,
        store: Arc<dyn JobStore>,
        channel: Arc<dyn EventChannel<JobEvent>>,
        reconciler: Arc<StatusReconciler>,
    ) -> Self {
        Self {
            store,
            channel,
            reconciler,
            request_channel: config.channels.requests.clone(),
        }
    }

    /// Validate, store as PENDING and publish the execution request.
    ///
    /// The job is stored before the request is published, so a worker never
    /// reports on a job the reconciler does not know. If the publish fails the
    /// error is returned and the job stays PENDING.
    #[instrument(skip_all, fields(name = %new.name, job_type = %new.job_type), err)]
    pub fn create(&self, new: NewJob) -> Result<Job, ServiceError> {
        let job = Job::create(new, Utc::now())?;
        let job = self.store.insert(job)?;

        let request = JobEvent::request(&job);
        match self
            .channel
            .publish(&self.request_channel, &request.key(), request)
        {
            Ok(position) => {
                info!(job_id = %job.id, partition = position.partition, "job submitted");
                Ok(job)
            }
            Err(e) => {
                error!(job_id = %job.id, error = %e, "failed to publish job request");
                Err(e.into())
            }
        }
    }

    pub fn get(&self, job_id: JobId) -> Result<Job, ServiceError> {
        self.store
            .get(job_id)?
            .ok_or(ServiceError::NotFound(job_id))
    }

    pub fn list(&self, query: &JobQuery, page: PageRequest) -> Result<Page<Job>, ServiceError> {
        Ok(self.store.list(query, page)?)
    }

    pub fn stats(&self) -> Result<JobStats, ServiceError> {
        Ok(self.store.stats()?)
    }

    /// Cancel a job that is PENDING and not yet claimed by a worker.
    pub fn cancel(&self, job_id: JobId) -> Result<Job, ServiceError> {
        Ok(self.reconciler.cancel(job_id)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobrelay_events::InMemoryChannel;
    use jobrelay_jobs::{EventType, JobStatus, JobType, Payload};
    use serde_json::json;

    use crate::idempotency::{IdempotencyGuard, InMemoryIdempotencyGuard};
    use crate::store::InMemoryJobStore;

    struct Fixture {
        config: RelayConfig,
        channel: InMemoryChannel<JobEvent>,
        guard: Arc<InMemoryIdempotencyGuard>,
        service: JobService,
    }

    fn fixture() -> Fixture {
        let config = RelayConfig::default();
        let channel = InMemoryChannel::new();
        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
        let guard = Arc::new(InMemoryIdempotencyGuard::new());
        let reconciler = Arc::new(StatusReconciler::new(
            &config,
            Arc::clone(&store),
            guard.clone(),
            Arc::new(channel.clone()),
        ));
        let service = JobService::new(&config, store, Arc::new(channel.clone()), reconciler);
        Fixture {
            config,
            channel,
            guard,
            service,
        }
    }

    #[test]
    fn create_stores_pending_job_and_publishes_request() {
        let f = fixture();
        let mut payload = Payload::new();
        payload.insert("to".into(), json!("ops@example.com"));

        let job = f
            .service
            .create(NewJob::new("welcome", JobType::SendEmail).with_payload(payload))
            .unwrap();

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_count, 0);
        assert_eq!(f.service.get(job.id).unwrap(), job);

        let requests = f.channel.messages(&f.config.channels.requests);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].event_type, EventType::Created);
        assert_eq!(requests[0].payload.as_ref().unwrap()["to"], "ops@example.com");
    }

    #[test]
    fn invalid_job_is_rejected_before_anything_is_stored() {
        let f = fixture();
        let err = f
            .service
            .create(NewJob::new("  ", JobType::ProcessData))
            .unwrap_err();

        assert!(matches!(err, ServiceError::Domain(DomainError::Validation(_))));
        assert_eq!(f.service.stats().unwrap().total, 0);
        assert!(f.channel.messages(&f.config.channels.requests).is_empty());
    }

    #[test]
    fn unknown_job_is_not_found() {
        let f = fixture();
        let id = JobId::new();
        assert_eq!(f.service.get(id).unwrap_err(), ServiceError::NotFound(id));
        assert_eq!(f.service.cancel(id).unwrap_err(), ServiceError::NotFound(id));
    }

    #[test]
    fn cancel_maps_rejection_to_invalid_operation() {
        let f = fixture();
        let job = f
            .service
            .create(NewJob::new("report", JobType::GenerateReport))
            .unwrap();
        f.guard.try_acquire(job.id, 0).unwrap();

        let err = f.service.cancel(job.id).unwrap_err();
        assert!(matches!(err, ServiceError::Domain(DomainError::InvalidOperation(_))));

        let other = f
            .service
            .create(NewJob::new("sync", JobType::SyncData))
            .unwrap();
        assert_eq!(f.service.cancel(other.id).unwrap().status, JobStatus::Cancelled);
    }

    #[test]
    fn list_and_stats_reflect_created_jobs() {
        let f = fixture();
        for name in ["alpha", "beta", "Alphabet"] {
            f.service
                .create(NewJob::new(name, JobType::ProcessData))
                .unwrap();
        }

        let page = f
            .service
            .list(&JobQuery::all().with_name("alpha"), PageRequest::new(0, 10))
            .unwrap();
        assert_eq!(page.total, 2);

        let stats = f.service.stats().unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.pending, 3);
    }

    #[test]
    fn unpublishable_request_is_reported() {
        let f = fixture();
        f.channel.close();
        let err = f
            .service
            .create(NewJob::new("late", JobType::ProcessData))
            .unwrap_err();
        assert_eq!(err, ServiceError::Transport(ChannelError::Closed));
    }
}
