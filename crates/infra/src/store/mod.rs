//! Job persistence.
//!
//! The store is the authoritative home of `Job` records. Writes after
//! creation go through `update` with an expected version, so two writers
//! racing on one job cannot silently overwrite each other.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use jobrelay_core::{ExpectedVersion, JobId};
use jobrelay_jobs::{Job, JobStatus, JobType};

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryJobStore;
pub use postgres::PostgresJobStore;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("job already exists: {0}")]
    AlreadyExists(JobId),

    #[error("version conflict on job {job_id}: expected {expected:?}, found {actual}")]
    VersionConflict {
        job_id: JobId,
        expected: ExpectedVersion,
        actual: u64,
    },

    #[error("storage error: {0}")]
    Storage(String),
}

/// Listing filter; unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobQuery {
    pub status: Option<JobStatus>,
    pub job_type: Option<JobType>,
    /// Case-insensitive substring of the job name.
    pub name_contains: Option<String>,
}

impl JobQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_type(mut self, job_type: JobType) -> Self {
        self.job_type = Some(job_type);
        self
    }

    pub fn with_name(mut self, fragment: impl Into<String>) -> Self {
        self.name_contains = Some(fragment.into());
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.status.is_none_or(|s| job.status == s)
            && self.job_type.is_none_or(|t| job.job_type == t)
            && self.name_contains.as_ref().is_none_or(|n| {
                job.name.to_lowercase().contains(&n.to_lowercase())
            })
    }
}

/// Zero-based page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: usize,
    pub size: usize,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self { page: 0, size: 20 }
    }
}

impl PageRequest {
    pub fn new(page: usize, size: usize) -> Self {
        Self {
            page,
            size: size.max(1),
        }
    }

    pub fn offset(&self) -> usize {
        self.page * self.size
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: usize,
    pub size: usize,
}

impl<T> Page<T> {
    pub fn has_more(&self) -> bool {
        ((self.page + 1) * self.size) < self.total as usize
    }
}

/// Counts per status plus the mean execution time of completed jobs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStats {
    pub total: u64,
    pub pending: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub dead_letter: u64,
    pub avg_execution_time_ms: f64,
}

impl JobStats {
    pub fn count(&self, status: JobStatus) -> u64 {
        match status {
            JobStatus::Pending => self.pending,
            JobStatus::Running => self.running,
            JobStatus::Completed => self.completed,
            JobStatus::Failed => self.failed,
            JobStatus::Cancelled => self.cancelled,
            JobStatus::DeadLetter => self.dead_letter,
        }
    }

    fn add(&mut self, status: JobStatus, n: u64) {
        let slot = match status {
            JobStatus::Pending => &mut self.pending,
            JobStatus::Running => &mut self.running,
            JobStatus::Completed => &mut self.completed,
            JobStatus::Failed => &mut self.failed,
            JobStatus::Cancelled => &mut self.cancelled,
            JobStatus::DeadLetter => &mut self.dead_letter,
        };
        *slot += n;
        self.total += n;
    }
}

/// Job store abstraction.
pub trait JobStore: Send + Sync {
    /// Persist a new job; the stored copy (version 1) is returned.
    fn insert(&self, job: Job) -> Result<Job, StoreError>;

    /// Get a job by ID.
    fn get(&self, job_id: JobId) -> Result<Option<Job>, StoreError>;

    /// Replace a job if its stored version matches `expected`; the stored
    /// copy (version + 1) is returned.
    fn update(&self, job: &Job, expected: ExpectedVersion) -> Result<Job, StoreError>;

    /// Matching jobs, newest first.
    fn list(&self, query: &JobQuery, page: PageRequest) -> Result<Page<Job>, StoreError>;

    fn stats(&self) -> Result<JobStats, StoreError>;
}

impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    fn insert(&self, job: Job) -> Result<Job, StoreError> {
        (**self).insert(job)
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        (**self).get(job_id)
    }

    fn update(&self, job: &Job, expected: ExpectedVersion) -> Result<Job, StoreError> {
        (**self).update(job, expected)
    }

    fn list(&self, query: &JobQuery, page: PageRequest) -> Result<Page<Job>, StoreError> {
        (**self).list(query, page)
    }

    fn stats(&self) -> Result<JobStats, StoreError> {
        (**self).stats()
    }
}
