use std::sync::{Mutex, MutexGuard};

use jobrelay_core::JobId;
use jobrelay_events::partition_for;

pub const DEFAULT_STRIPES: usize = 64;

/// Fixed table of mutexes; a job id always maps to the same stripe.
///
/// Two jobs may share a stripe and then serialize needlessly, which is
/// harmless. One job never maps to two stripes.
#[derive(Debug)]
pub struct StripedLocks {
    stripes: Vec<Mutex<()>>,
}

impl Default for StripedLocks {
    fn default() -> Self {
        Self::new(DEFAULT_STRIPES)
    }
}

impl StripedLocks {
    pub fn new(stripes: usize) -> Self {
        Self {
            stripes: (0..stripes.max(1)).map(|_| Mutex::new(())).collect(),
        }
    }

    pub fn stripe_of(&self, job_id: JobId) -> usize {
        partition_for(&job_id.as_key(), self.stripes.len() as u32) as usize
    }

    pub fn lock(&self, job_id: JobId) -> MutexGuard<'_, ()> {
        // The guarded value is `()`, so a poisoned stripe holds no broken state.
        self.stripes[self.stripe_of(job_id)]
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
