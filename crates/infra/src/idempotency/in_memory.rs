//! In-memory claim table for tests/dev.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use jobrelay_core::JobId;

use super::{Claim, ClaimState, DEFAULT_CLAIM_TTL, GuardError, IdempotencyGuard};

#[derive(Debug, Clone, Copy)]
struct Entry {
    claim: Claim,
    expires_at: Instant,
}

/// TTL-aware claim table behind a mutex.
///
/// `set_available(false)` makes every call fail with `Unavailable`, which is
/// how tests exercise the fail-closed paths.
#[derive(Debug)]
pub struct InMemoryIdempotencyGuard {
    claims: Mutex<HashMap<JobId, Entry>>,
    ttl: Duration,
    available: AtomicBool,
}

impl Default for InMemoryIdempotencyGuard {
    fn default() -> Self {
        Self::with_ttl(DEFAULT_CLAIM_TTL)
    }
}

impl InMemoryIdempotencyGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            claims: Mutex::new(HashMap::new()),
            ttl,
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn with_claims<T>(
        &self,
        f: impl FnOnce(&mut HashMap<JobId, Entry>, Instant) -> T,
    ) -> Result<T, GuardError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(GuardError::Unavailable("claim store offline".to_string()));
        }
        let mut claims = self
            .claims
            .lock()
            .map_err(|_| GuardError::Unavailable("claim table lock poisoned".to_string()))?;
        let now = Instant::now();
        claims.retain(|_, e| e.expires_at > now);
        Ok(f(&mut claims, now))
    }

    fn put(&self, job_id: JobId, claim: Claim) -> Result<(), GuardError> {
        let ttl = self.ttl;
        self.with_claims(|claims, now| {
            claims.insert(
                job_id,
                Entry {
                    claim,
                    expires_at: now + ttl,
                },
            );
        })
    }
}

impl IdempotencyGuard for InMemoryIdempotencyGuard {
    fn try_acquire(&self, job_id: JobId, attempt: u32) -> Result<bool, GuardError> {
        let ttl = self.ttl;
        self.with_claims(|claims, now| {
            if claims.get(&job_id).is_some_and(|e| !e.claim.admits(attempt)) {
                return false;
            }
            claims.insert(
                job_id,
                Entry {
                    claim: Claim::new(ClaimState::Processing, attempt),
                    expires_at: now + ttl,
                },
            );
            true
        })
    }

    fn mark_completed(&self, job_id: JobId, attempt: u32) -> Result<(), GuardError> {
        self.put(job_id, Claim::new(ClaimState::Completed, attempt))
    }

    fn mark_terminal(&self, job_id: JobId, attempt: u32) -> Result<(), GuardError> {
        self.put(job_id, Claim::new(ClaimState::Failed, attempt))
    }

    fn requeue(&self, job_id: JobId, attempt: u32) -> Result<(), GuardError> {
        self.put(job_id, Claim::new(ClaimState::Requeued, attempt))
    }

    fn release(&self, job_id: JobId) -> Result<(), GuardError> {
        self.with_claims(|claims, _| {
            claims.remove(&job_id);
        })
    }

    fn status(&self, job_id: JobId) -> Result<Option<Claim>, GuardError> {
        self.with_claims(|claims, _| claims.get(&job_id).map(|e| e.claim))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn concurrent_acquire_grants_exactly_one_claim() {
        let guard = Arc::new(InMemoryIdempotencyGuard::new());
        let job_id = JobId::new();
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let guard = guard.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    guard.try_acquire(job_id, 0).unwrap()
                })
            })
            .collect();

        let granted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|g| *g)
            .count();
        assert_eq!(granted, 1);
        assert_eq!(
            guard.status(job_id).unwrap(),
            Some(Claim::new(ClaimState::Processing, 0))
        );
    }

    #[test]
    fn released_failure_admits_the_next_attempt_but_not_the_previous_one() {
        let guard = InMemoryIdempotencyGuard::new();
        let job_id = JobId::new();

        assert!(guard.try_acquire(job_id, 0).unwrap());
        guard.mark_failed(job_id, 0, true).unwrap();

        // A redelivered request from attempt 0 must not steal the claim.
        assert!(!guard.try_acquire(job_id, 0).unwrap());
        assert_eq!(
            guard.status(job_id).unwrap(),
            Some(Claim::new(ClaimState::Requeued, 1))
        );

        assert!(guard.try_acquire(job_id, 1).unwrap());
        assert!(!guard.try_acquire(job_id, 1).unwrap());
        assert_eq!(
            guard.status(job_id).unwrap(),
            Some(Claim::new(ClaimState::Processing, 1))
        );
    }

    #[test]
    fn terminal_failed_blocks_every_attempt() {
        let guard = InMemoryIdempotencyGuard::new();
        let job_id = JobId::new();

        assert!(guard.try_acquire(job_id, 2).unwrap());
        guard.mark_failed(job_id, 2, false).unwrap();
        assert!(!guard.try_acquire(job_id, 2).unwrap());
        assert!(!guard.try_acquire(job_id, 3).unwrap());
        assert_eq!(
            guard.status(job_id).unwrap(),
            Some(Claim::new(ClaimState::Failed, 2))
        );
    }

    #[test]
    fn requeue_reopens_the_same_attempt() {
        let guard = InMemoryIdempotencyGuard::new();
        let job_id = JobId::new();

        assert!(guard.try_acquire(job_id, 1).unwrap());
        guard.requeue(job_id, 1).unwrap();
        assert!(!guard.try_acquire(job_id, 0).unwrap());
        assert!(guard.try_acquire(job_id, 1).unwrap());
    }

    #[test]
    fn manual_release_clears_even_terminal_claims() {
        let guard = InMemoryIdempotencyGuard::new();
        let job_id = JobId::new();

        assert!(guard.try_acquire(job_id, 0).unwrap());
        guard.mark_failed(job_id, 0, false).unwrap();
        guard.release(job_id).unwrap();
        assert_eq!(guard.status(job_id).unwrap(), None);
        assert!(guard.try_acquire(job_id, 0).unwrap());
    }

    #[test]
    fn completed_claim_blocks_reexecution() {
        let guard = InMemoryIdempotencyGuard::new();
        let job_id = JobId::new();
        assert!(guard.try_acquire(job_id, 0).unwrap());
        guard.mark_completed(job_id, 0).unwrap();
        assert!(!guard.try_acquire(job_id, 0).unwrap());
        assert_eq!(
            guard.status(job_id).unwrap().map(|c| c.state),
            Some(ClaimState::Completed)
        );
    }

    #[test]
    fn expired_claims_are_forgotten() {
        let guard = InMemoryIdempotencyGuard::with_ttl(Duration::from_millis(20));
        let job_id = JobId::new();
        assert!(guard.try_acquire(job_id, 0).unwrap());
        thread::sleep(Duration::from_millis(40));
        assert!(guard.try_acquire(job_id, 0).unwrap());
    }

    #[test]
    fn unavailable_store_errors_on_every_call() {
        let guard = InMemoryIdempotencyGuard::new();
        guard.set_available(false);
        assert!(matches!(
            guard.try_acquire(JobId::new(), 0),
            Err(GuardError::Unavailable(_))
        ));
        assert!(matches!(
            guard.requeue(JobId::new(), 1),
            Err(GuardError::Unavailable(_))
        ));
        guard.set_available(true);
        assert!(guard.try_acquire(JobId::new(), 0).unwrap());
    }
}
