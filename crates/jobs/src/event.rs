//! Transport-level job events.
//!
//! A `JobEvent` carries enough of the job to be processed without a store
//! lookup: workers execute straight from a request event, and the reconciler
//! applies status events by job id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use jobrelay_core::{JobId, WorkerId};

use crate::job::{Job, JobStatus, JobType, Payload};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "JOB_CREATED")]
    Created,
    #[serde(rename = "JOB_STARTED")]
    Started,
    #[serde(rename = "JOB_COMPLETED")]
    Completed,
    #[serde(rename = "JOB_FAILED")]
    Failed,
    #[serde(rename = "JOB_RETRY")]
    Retry,
    #[serde(rename = "JOB_DEAD_LETTER")]
    DeadLetter,
    #[serde(rename = "JOB_CANCELLED")]
    Cancelled,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Created => "JOB_CREATED",
            EventType::Started => "JOB_STARTED",
            EventType::Completed => "JOB_COMPLETED",
            EventType::Failed => "JOB_FAILED",
            EventType::Retry => "JOB_RETRY",
            EventType::DeadLetter => "JOB_DEAD_LETTER",
            EventType::Cancelled => "JOB_CANCELLED",
        }
    }

    /// Events a worker executes (request channel).
    pub fn is_request(&self) -> bool {
        matches!(self, EventType::Created | EventType::Retry)
    }
}

impl core::fmt::Display for EventType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEvent {
    pub job_id: JobId,
    pub name: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    /// Status of the job at emission.
    pub status: JobStatus,
    pub priority: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Payload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Execution attempt the event belongs to.
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<WorkerId>,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
}

impl JobEvent {
    fn from_job(job: &Job, event_type: EventType) -> Self {
        Self {
            job_id: job.id,
            name: job.name.clone(),
            job_type: job.job_type,
            status: job.status,
            priority: job.priority,
            payload: None,
            result: None,
            error_message: None,
            retry_count: job.retry_count,
            max_retries: job.max_retries,
            worker_id: None,
            timestamp: Utc::now(),
            event_type,
        }
    }

    /// Execution request for a freshly created job.
    pub fn request(job: &Job) -> Self {
        Self {
            payload: Some(job.payload.clone()),
            ..Self::from_job(job, EventType::Created)
        }
    }

    /// Execution request for a requeued attempt. `job` already carries the
    /// incremented retry count.
    pub fn retry(job: &Job) -> Self {
        Self {
            status: JobStatus::Pending,
            payload: Some(job.payload.clone()),
            error_message: job.error_message.clone(),
            ..Self::from_job(job, EventType::Retry)
        }
    }

    /// Notification about the stored job (dead-letter, cancellation).
    pub fn status_update(job: &Job, event_type: EventType) -> Self {
        Self {
            result: job.result.clone(),
            error_message: job.error_message.clone(),
            worker_id: job.worker_id.clone(),
            ..Self::from_job(job, event_type)
        }
    }

    /// Worker-emitted status event about the attempt described by `request`.
    pub fn worker_update(request: &JobEvent, event_type: EventType, worker_id: WorkerId) -> Self {
        let status = match event_type {
            EventType::Started => JobStatus::Running,
            EventType::Completed => JobStatus::Completed,
            EventType::Failed => JobStatus::Failed,
            _ => request.status,
        };
        Self {
            job_id: request.job_id,
            name: request.name.clone(),
            job_type: request.job_type,
            status,
            priority: request.priority,
            payload: None,
            result: None,
            error_message: None,
            retry_count: request.retry_count,
            max_retries: request.max_retries,
            worker_id: Some(worker_id),
            timestamp: Utc::now(),
            event_type,
        }
    }

    pub fn with_result(mut self, result: Payload) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error_message = Some(error.into());
        self
    }

    /// Channel key: every event of one job shares a partition.
    pub fn key(&self) -> String {
        self.job_id.as_key()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::NewJob;

    fn job() -> Job {
        let mut payload = Payload::new();
        payload.insert("to".into(), "ops@example.com".into());
        Job::create(
            NewJob::new("welcome mail", JobType::SendEmail).with_payload(payload),
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn request_carries_payload_and_attempt() {
        let job = job();
        let ev = JobEvent::request(&job);
        assert_eq!(ev.event_type, EventType::Created);
        assert!(ev.event_type.is_request());
        assert_eq!(ev.payload.as_ref(), Some(&job.payload));
        assert_eq!(ev.retry_count, 0);
        assert_eq!(ev.key(), job.id.as_key());
    }

    #[test]
    fn worker_update_keeps_attempt_of_request() {
        let mut job = job();
        job.retry_count = 2;
        let req = JobEvent::retry(&job);
        let started = JobEvent::worker_update(&req, EventType::Started, WorkerId::new("w-1"));

        assert_eq!(started.retry_count, 2);
        assert_eq!(started.status, JobStatus::Running);
        assert_eq!(started.worker_id, Some(WorkerId::new("w-1")));
        assert!(started.payload.is_none());
    }

    #[test]
    fn wire_format_uses_camel_case_and_prefixed_event_types() {
        let job = job();
        let json = serde_json::to_value(JobEvent::request(&job)).unwrap();
        assert_eq!(json["eventType"], "JOB_CREATED");
        assert_eq!(json["type"], "SEND_EMAIL");
        assert_eq!(json["retryCount"], 0);
        assert_eq!(json["payload"]["to"], "ops@example.com");

        let back: JobEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back.job_id, job.id);
    }
}
