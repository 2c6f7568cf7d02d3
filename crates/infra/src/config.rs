//! Relay configuration.
//!
//! Built once at startup (`RelayConfig::from_env()`) and passed explicitly to
//! every constructor. All keys share the `JOBRELAY_` prefix; unset keys fall
//! back to `RelayConfig::default()`.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use jobrelay_core::WorkerId;
use jobrelay_events::ChannelSpec;
use jobrelay_jobs::BackoffPolicy;

use crate::execution::SimulationConfig;
use crate::idempotency::DEFAULT_CLAIM_TTL;

pub const ENV_PREFIX: &str = "JOBRELAY_";

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}' ({reason})")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(key: &str, value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key: format!("{ENV_PREFIX}{key}"),
            value: value.into(),
            reason: reason.into(),
        }
    }
}

/// Names and layout of the three relay channels.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelConfig {
    pub requests: String,
    pub status: String,
    pub dead_letter: String,
    pub request_partitions: u32,
    pub status_partitions: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            requests: "job-requests".to_string(),
            status: "job-status".to_string(),
            dead_letter: "job-dlq".to_string(),
            request_partitions: 3,
            status_partitions: 3,
        }
    }
}

impl ChannelConfig {
    /// Declarations for startup: requests and status keep 7 days, the
    /// dead-letter channel 30 days on a single partition.
    pub fn specs(&self) -> Vec<ChannelSpec> {
        vec![
            ChannelSpec::new(&self.requests, self.request_partitions, 7 * DAY),
            ChannelSpec::new(&self.status, self.status_partitions, 7 * DAY),
            ChannelSpec::new(&self.dead_letter, 1, 30 * DAY),
        ]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelayConfig {
    pub worker_id: WorkerId,
    pub worker_concurrency: usize,
    pub reconciler_concurrency: usize,
    pub idempotency_ttl: Duration,
    pub backoff: BackoffPolicy,
    pub channels: ChannelConfig,
    /// Redis for channels and claims; in-memory when unset.
    pub redis_url: Option<String>,
    /// Postgres for the job store; in-memory when unset.
    pub database_url: Option<String>,
    pub simulation: SimulationConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            worker_id: WorkerId::new(format!("worker-{}", std::process::id())),
            worker_concurrency: 3,
            reconciler_concurrency: 3,
            idempotency_ttl: DEFAULT_CLAIM_TTL,
            backoff: BackoffPolicy::default(),
            channels: ChannelConfig::default(),
            redis_url: None,
            database_url: None,
            simulation: SimulationConfig::default(),
        }
    }
}

fn parse<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: core::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(&format!("{ENV_PREFIX}{key}")) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::invalid(key, raw, e.to_string())),
    }
}

fn non_empty<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(&format!("{ENV_PREFIX}{key}"))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl RelayConfig {
    /// Read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (full key names, prefix included).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(id) = non_empty(&lookup, "WORKER_ID") {
            cfg.worker_id = WorkerId::new(id);
        }
        if let Some(n) = parse::<usize, _>(&lookup, "WORKER_CONCURRENCY")? {
            cfg.worker_concurrency = n;
        }
        if let Some(n) = parse::<usize, _>(&lookup, "RECONCILER_CONCURRENCY")? {
            cfg.reconciler_concurrency = n;
        }
        if let Some(secs) = parse::<u64, _>(&lookup, "IDEMPOTENCY_TTL_SECS")? {
            cfg.idempotency_ttl = Duration::from_secs(secs);
        }

        if let Some(ms) = parse::<u64, _>(&lookup, "RETRY_BASE_DELAY_MS")? {
            cfg.backoff.base_delay = Duration::from_millis(ms);
        }
        if let Some(m) = parse::<f64, _>(&lookup, "RETRY_MULTIPLIER")? {
            cfg.backoff.multiplier = m;
        }
        if let Some(ms) = parse::<u64, _>(&lookup, "RETRY_MAX_DELAY_MS")? {
            cfg.backoff.max_delay = Duration::from_millis(ms);
        }

        if let Some(name) = non_empty(&lookup, "REQUEST_CHANNEL") {
            cfg.channels.requests = name;
        }
        if let Some(name) = non_empty(&lookup, "STATUS_CHANNEL") {
            cfg.channels.status = name;
        }
        if let Some(name) = non_empty(&lookup, "DLQ_CHANNEL") {
            cfg.channels.dead_letter = name;
        }
        if let Some(n) = parse::<u32, _>(&lookup, "REQUEST_PARTITIONS")? {
            cfg.channels.request_partitions = n;
        }
        if let Some(n) = parse::<u32, _>(&lookup, "STATUS_PARTITIONS")? {
            cfg.channels.status_partitions = n;
        }

        cfg.redis_url = non_empty(&lookup, "REDIS_URL");
        cfg.database_url = non_empty(&lookup, "DATABASE_URL");

        if let Some(ms) = parse::<u64, _>(&lookup, "SIMULATION_MIN_MS")? {
            cfg.simulation.min_work = Duration::from_millis(ms);
        }
        if let Some(ms) = parse::<u64, _>(&lookup, "SIMULATION_MAX_MS")? {
            cfg.simulation.max_work = Duration::from_millis(ms);
        }
        if let Some(rate) = parse::<f64, _>(&lookup, "SIMULATION_FAILURE_RATE")? {
            cfg.simulation.failure_rate = rate;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_concurrency == 0 {
            return Err(ConfigError::invalid("WORKER_CONCURRENCY", "0", "must be at least 1"));
        }
        if self.reconciler_concurrency == 0 {
            return Err(ConfigError::invalid(
                "RECONCILER_CONCURRENCY",
                "0",
                "must be at least 1",
            ));
        }
        if self.channels.request_partitions == 0 {
            return Err(ConfigError::invalid("REQUEST_PARTITIONS", "0", "must be at least 1"));
        }
        if self.channels.status_partitions == 0 {
            return Err(ConfigError::invalid("STATUS_PARTITIONS", "0", "must be at least 1"));
        }
        if !(self.backoff.multiplier.is_finite() && self.backoff.multiplier >= 1.0) {
            return Err(ConfigError::invalid(
                "RETRY_MULTIPLIER",
                self.backoff.multiplier.to_string(),
                "must be a finite number >= 1.0",
            ));
        }
        if !(0.0..=1.0).contains(&self.simulation.failure_rate) {
            return Err(ConfigError::invalid(
                "SIMULATION_FAILURE_RATE",
                self.simulation.failure_rate.to_string(),
                "must be between 0.0 and 1.0",
            ));
        }
        if self.simulation.min_work > self.simulation.max_work {
            return Err(ConfigError::invalid(
                "SIMULATION_MIN_MS",
                self.simulation.min_work.as_millis().to_string(),
                "must not exceed SIMULATION_MAX_MS",
            ));
        }
        Ok(())
    }
}
