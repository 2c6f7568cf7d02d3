//! Requeue vs. dead-letter decision.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::job::Job;

/// Exponential backoff between execution attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Growth factor per further retry.
    pub multiplier: f64,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Jitter factor (0.0-1.0); deterministic per attempt.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            jitter: 0.0,
        }
    }
}

impl BackoffPolicy {
    pub fn exponential(base_delay: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self {
            base_delay,
            multiplier,
            max_delay,
            jitter: 0.0,
        }
    }

    /// Same delay before every retry.
    pub fn fixed(delay: Duration) -> Self {
        Self::exponential(delay, 1.0, delay)
    }

    /// Retry immediately (tests, local runs).
    pub fn immediate() -> Self {
        Self::fixed(Duration::ZERO)
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry number `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let exp = self.multiplier.max(1.0).powi((attempt - 1) as i32);
        let mut delay_ms = base_ms * exp;
        if !delay_ms.is_finite() || delay_ms > max_ms {
            delay_ms = max_ms;
        }

        // Deterministic "jitter" based on attempt
        let jitter_range = delay_ms * self.jitter;
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).clamp(0.0, max_ms) as u64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Requeue with `retry_count` as the new attempt number.
    Retry { retry_count: u32, delay: Duration },
    DeadLetter,
}

/// Decide what happens to a job whose current attempt failed.
pub fn decide(job: &Job, policy: &BackoffPolicy) -> RetryDecision {
    if job.retry_count < job.max_retries {
        let retry_count = job.retry_count + 1;
        RetryDecision::Retry {
            retry_count,
            delay: policy.delay_for_attempt(retry_count),
        }
    } else {
        RetryDecision::DeadLetter
    }
}
