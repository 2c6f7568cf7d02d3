//! The authoritative job record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use jobrelay_core::{DomainError, DomainResult, JobId, WorkerId};

/// Opaque JSON object passed through to handlers untouched.
pub type Payload = serde_json::Map<String, serde_json::Value>;

pub const MAX_NAME_LEN: usize = 255;
pub const DEFAULT_PRIORITY: u8 = 5;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const MAX_RETRIES_LIMIT: u32 = 10;

/// Kind of work; selects the handler a worker dispatches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    ProcessData,
    SendEmail,
    GenerateReport,
    SyncData,
}

impl JobType {
    pub const ALL: [JobType; 4] = [
        JobType::ProcessData,
        JobType::SendEmail,
        JobType::GenerateReport,
        JobType::SyncData,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::ProcessData => "PROCESS_DATA",
            JobType::SendEmail => "SEND_EMAIL",
            JobType::GenerateReport => "GENERATE_REPORT",
            JobType::SyncData => "SYNC_DATA",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            JobType::ProcessData => "Data Processing",
            JobType::SendEmail => "Email Notification",
            JobType::GenerateReport => "Report Generation",
            JobType::SyncData => "Data Synchronization",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            JobType::ProcessData => "Process and transform data",
            JobType::SendEmail => "Send email to specified recipients",
            JobType::GenerateReport => "Generate reports and analytics",
            JobType::SyncData => "Synchronize data across systems",
        }
    }
}

impl core::fmt::Display for JobType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for JobType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown job type: {s}")))
    }
}

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Created or requeued, waiting for a worker.
    Pending,
    /// A worker started the current attempt.
    Running,
    /// Finished successfully.
    Completed,
    /// The current attempt failed; awaiting the retry decision.
    Failed,
    /// Cancelled before any worker claimed it.
    Cancelled,
    /// Retries exhausted.
    DeadLetter,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
        JobStatus::DeadLetter,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
            JobStatus::DeadLetter => "DEAD_LETTER",
        }
    }

    /// No transition leaves a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Cancelled | JobStatus::DeadLetter
        )
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, JobStatus::Failed)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Running)
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown job status: {s}")))
    }
}

/// A job submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewJob {
    pub name: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    #[serde(default)]
    pub priority: Option<u8>,
    #[serde(default)]
    pub payload: Option<Payload>,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl NewJob {
    pub fn new(name: impl Into<String>, job_type: JobType) -> Self {
        Self {
            name: name.into(),
            job_type,
            priority: None,
            payload: None,
            max_retries: None,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.name.trim().is_empty() {
            return Err(DomainError::validation("job name is required"));
        }
        if self.name.chars().count() > MAX_NAME_LEN {
            return Err(DomainError::validation(format!(
                "job name must be between 1 and {MAX_NAME_LEN} characters"
            )));
        }
        if let Some(p) = self.priority {
            if !(1..=10).contains(&p) {
                return Err(DomainError::validation(format!(
                    "priority must be between 1 and 10 (got {p})"
                )));
            }
        }
        if let Some(m) = self.max_retries {
            if m > MAX_RETRIES_LIMIT {
                return Err(DomainError::validation(format!(
                    "max retries must be between 0 and {MAX_RETRIES_LIMIT} (got {m})"
                )));
            }
        }
        Ok(())
    }
}

/// Authoritative job state. Only the status reconciler mutates it after
/// creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub name: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub status: JobStatus,
    pub priority: u8,
    pub payload: Payload,
    pub result: Option<Payload>,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub worker_id: Option<WorkerId>,
    /// Store revision; bumped by every successful write.
    pub version: u64,
}

impl Job {
    /// Validate a submission and build the PENDING job for it.
    pub fn create(new: NewJob, now: DateTime<Utc>) -> DomainResult<Job> {
        new.validate()?;

        Ok(Job {
            id: JobId::new(),
            name: new.name,
            job_type: new.job_type,
            status: JobStatus::Pending,
            priority: new.priority.unwrap_or(DEFAULT_PRIORITY),
            payload: new.payload.unwrap_or_default(),
            result: None,
            error_message: None,
            retry_count: 0,
            max_retries: new.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            worker_id: None,
            version: 0,
        })
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Wall time of the successful attempt.
    pub fn execution_time(&self) -> Option<chrono::Duration> {
        match (self.status, self.started_at, self.completed_at) {
            (JobStatus::Completed, Some(started), Some(completed)) => Some(completed - started),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_applies_defaults_and_starts_pending() {
        let job = Job::create(NewJob::new("nightly import", JobType::ProcessData), Utc::now())
            .unwrap();

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.priority, DEFAULT_PRIORITY);
        assert_eq!(job.max_retries, DEFAULT_MAX_RETRIES);
        assert!(job.payload.is_empty());
        assert!(job.completed_at.is_none());
    }

    #[test]
    fn blank_or_oversized_names_are_rejected() {
        for name in ["", "   "] {
            let err = NewJob::new(name, JobType::SendEmail).validate().unwrap_err();
            assert!(matches!(err, DomainError::Validation(_)));
        }
        let long = "x".repeat(MAX_NAME_LEN + 1);
        assert!(NewJob::new(long, JobType::SendEmail).validate().is_err());
        assert!(NewJob::new("x".repeat(MAX_NAME_LEN), JobType::SendEmail)
            .validate()
            .is_ok());
    }

    #[test]
    fn priority_and_max_retries_are_range_checked() {
        let base = NewJob::new("j", JobType::SyncData);
        assert!(base.clone().with_priority(0).validate().is_err());
        assert!(base.clone().with_priority(11).validate().is_err());
        assert!(base.clone().with_priority(10).validate().is_ok());
        assert!(base.clone().with_max_retries(11).validate().is_err());
        assert!(base.with_max_retries(0).validate().is_ok());
    }

    #[test]
    fn statuses_and_types_use_wire_names() {
        assert_eq!(
            serde_json::to_string(&JobStatus::DeadLetter).unwrap(),
            "\"DEAD_LETTER\""
        );
        assert_eq!(
            serde_json::to_string(&JobType::GenerateReport).unwrap(),
            "\"GENERATE_REPORT\""
        );
        assert_eq!("SYNC_DATA".parse::<JobType>().unwrap(), JobType::SyncData);
        assert_eq!("FAILED".parse::<JobStatus>().unwrap(), JobStatus::Failed);
        assert!("BOGUS".parse::<JobStatus>().is_err());
    }

    #[test]
    fn status_helpers() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(JobStatus::DeadLetter.is_terminal());
        assert!(!JobStatus::Failed.is_terminal());
        assert!(JobStatus::Failed.is_retryable());
        assert!(JobStatus::Running.is_active());
        assert_eq!(JobType::SendEmail.display_name(), "Email Notification");
    }
}
