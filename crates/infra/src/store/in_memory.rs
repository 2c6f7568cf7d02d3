//! In-memory job store for tests/dev.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use jobrelay_core::{ExpectedVersion, JobId};
use jobrelay_jobs::{Job, JobStatus};

use super::{JobQuery, JobStats, JobStore, Page, PageRequest, StoreError};

#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<JobId, Job>>, StoreError> {
        self.jobs
            .read()
            .map_err(|_| StoreError::Storage("job table lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<JobId, Job>>, StoreError> {
        self.jobs
            .write()
            .map_err(|_| StoreError::Storage("job table lock poisoned".to_string()))
    }
}

impl JobStore for InMemoryJobStore {
    fn insert(&self, mut job: Job) -> Result<Job, StoreError> {
        let mut jobs = self.write()?;
        if jobs.contains_key(&job.id) {
            return Err(StoreError::AlreadyExists(job.id));
        }
        job.version = 1;
        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.read()?.get(&job_id).cloned())
    }

    fn update(&self, job: &Job, expected: ExpectedVersion) -> Result<Job, StoreError> {
        let mut jobs = self.write()?;
        let current = jobs.get(&job.id).ok_or(StoreError::NotFound(job.id))?;

        if !expected.matches(current.version) {
            return Err(StoreError::VersionConflict {
                job_id: job.id,
                expected,
                actual: current.version,
            });
        }

        let mut stored = job.clone();
        stored.version = current.version + 1;
        jobs.insert(stored.id, stored.clone());
        Ok(stored)
    }

    fn list(&self, query: &JobQuery, page: PageRequest) -> Result<Page<Job>, StoreError> {
        let jobs = self.read()?;
        let mut matching: Vec<&Job> = jobs.values().filter(|j| query.matches(j)).collect();
        // Newest first; ids are time-ordered so they break timestamp ties.
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        let total = matching.len() as u64;
        let items = matching
            .into_iter()
            .skip(page.offset())
            .take(page.size)
            .cloned()
            .collect();

        Ok(Page {
            items,
            total,
            page: page.page,
            size: page.size,
        })
    }

    fn stats(&self) -> Result<JobStats, StoreError> {
        let jobs = self.read()?;
        let mut stats = JobStats::default();
        let mut exec_ms_sum = 0.0;
        let mut exec_count = 0u64;

        for job in jobs.values() {
            stats.add(job.status, 1);
            if job.status == JobStatus::Completed {
                if let Some(elapsed) = job.execution_time() {
                    exec_ms_sum += elapsed.num_milliseconds() as f64;
                    exec_count += 1;
                }
            }
        }

        if exec_count > 0 {
            stats.avg_execution_time_ms = exec_ms_sum / exec_count as f64;
        }
        Ok(stats)
    }
}
