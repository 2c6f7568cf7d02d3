//! Redis-backed idempotency claims.
//!
//! Values are `<state>:<attempt>`, e.g. `processing:2`.
//!
//! - `try_acquire`: Lua script, sets `processing:<n>` when the key is absent
//!   or holds `requeued:<m>` with `m <= n`
//! - `mark_completed` / `mark_failed` / `requeue`: `SET <key> <claim> EX <ttl>`
//! - `release`: `DEL <key>`
//!
//! Keys: `jobrelay:idempotency:<job-id>`.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument};

use jobrelay_core::JobId;

use super::{Claim, ClaimState, DEFAULT_CLAIM_TTL, GuardError, IdempotencyGuard, claim_key};

// Values that do not parse never admit a new claim.
const ACQUIRE_SCRIPT: &str = r"
local current = redis.call('GET', KEYS[1])
if current then
  local state, attempt = string.match(current, '^(%a+):(%d+)$')
  if state ~= 'requeued' or tonumber(ARGV[1]) < tonumber(attempt) then
    return 0
  end
end
redis.call('SET', KEYS[1], 'processing:' .. ARGV[1], 'EX', ARGV[2])
return 1
";

#[derive(Debug, Clone)]
pub struct RedisIdempotencyGuard {
    client: Arc<redis::Client>,
    ttl: Duration,
}

fn unavailable(op: &str, e: redis::RedisError) -> GuardError {
    GuardError::Unavailable(format!("{op} failed: {e}"))
}

impl RedisIdempotencyGuard {
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, GuardError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| unavailable("connect", e))?;
        Ok(Self {
            client: Arc::new(client),
            ttl: DEFAULT_CLAIM_TTL,
        })
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    fn connection(&self) -> Result<redis::Connection, GuardError> {
        self.client
            .get_connection()
            .map_err(|e| unavailable("connect", e))
    }

    fn ttl_secs(&self) -> u64 {
        self.ttl.as_secs().max(1)
    }

    fn set(&self, job_id: JobId, claim: Claim) -> Result<(), GuardError> {
        let mut conn = self.connection()?;
        let _: () = redis::cmd("SET")
            .arg(claim_key(job_id))
            .arg(claim.encode())
            .arg("EX")
            .arg(self.ttl_secs())
            .query(&mut conn)
            .map_err(|e| unavailable("SET", e))?;
        Ok(())
    }
}

impl IdempotencyGuard for RedisIdempotencyGuard {
    #[instrument(skip_all, fields(job_id = %job_id, attempt = attempt), err)]
    fn try_acquire(&self, job_id: JobId, attempt: u32) -> Result<bool, GuardError> {
        let mut conn = self.connection()?;
        let granted: i64 = redis::Script::new(ACQUIRE_SCRIPT)
            .key(claim_key(job_id))
            .arg(attempt)
            .arg(self.ttl_secs())
            .invoke(&mut conn)
            .map_err(|e| unavailable("acquire claim", e))?;

        let acquired = granted == 1;
        debug!(acquired, "idempotency claim attempted");
        Ok(acquired)
    }

    fn mark_completed(&self, job_id: JobId, attempt: u32) -> Result<(), GuardError> {
        self.set(job_id, Claim::new(ClaimState::Completed, attempt))
    }

    fn mark_terminal(&self, job_id: JobId, attempt: u32) -> Result<(), GuardError> {
        self.set(job_id, Claim::new(ClaimState::Failed, attempt))
    }

    #[instrument(skip_all, fields(job_id = %job_id, attempt = attempt), err)]
    fn requeue(&self, job_id: JobId, attempt: u32) -> Result<(), GuardError> {
        self.set(job_id, Claim::new(ClaimState::Requeued, attempt))
    }

    fn release(&self, job_id: JobId) -> Result<(), GuardError> {
        let mut conn = self.connection()?;
        let _: u64 = redis::cmd("DEL")
            .arg(claim_key(job_id))
            .query(&mut conn)
            .map_err(|e| unavailable("DEL", e))?;
        Ok(())
    }

    fn status(&self, job_id: JobId) -> Result<Option<Claim>, GuardError> {
        let mut conn = self.connection()?;
        let value: Option<String> = redis::cmd("GET")
            .arg(claim_key(job_id))
            .query(&mut conn)
            .map_err(|e| unavailable("GET", e))?;
        Ok(value.as_deref().and_then(Claim::decode))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_keys_are_namespaced_by_job_id() {
        let id = JobId::new();
        assert_eq!(claim_key(id), format!("jobrelay:idempotency:{id}"));
    }

    #[test]
    fn invalid_url_is_reported_as_unavailable() {
        assert!(matches!(
            RedisIdempotencyGuard::new("not a url"),
            Err(GuardError::Unavailable(_))
        ));
    }

    #[test]
    fn acquire_script_matches_the_stored_claim_format() {
        let stored = Claim::new(ClaimState::Requeued, 4).encode();
        assert!(stored.starts_with("requeued:"));
        assert!(ACQUIRE_SCRIPT.contains("'requeued'"));
        assert!(ACQUIRE_SCRIPT.contains("'processing:'"));
        assert_eq!(
            Claim::decode("processing:4"),
            Some(Claim::new(ClaimState::Processing, 4))
        );
    }
}
