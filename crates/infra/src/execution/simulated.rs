//! Stand-in handlers for local runs and demos.
//!
//! Each job type sleeps for a random duration in `[min_work, max_work)`, fails
//! with probability `failure_rate`, and otherwise returns a result shaped like
//! the real thing would be.

use std::thread;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use serde_json::json;

use jobrelay_core::JobId;
use jobrelay_jobs::{JobType, Payload};

use super::ExecutionError;
use super::handlers::JobHandler;

#[derive(Debug, Clone, PartialEq)]
pub struct SimulationConfig {
    pub min_work: Duration,
    pub max_work: Duration,
    /// Probability (0.0-1.0) that an execution fails.
    pub failure_rate: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            min_work: Duration::from_millis(500),
            max_work: Duration::from_millis(3000),
            failure_rate: 0.1,
        }
    }
}

impl SimulationConfig {
    /// No sleeping, no failures.
    pub fn instant() -> Self {
        Self {
            min_work: Duration::ZERO,
            max_work: Duration::ZERO,
            failure_rate: 0.0,
        }
    }

    pub fn with_failure_rate(mut self, rate: f64) -> Self {
        self.failure_rate = rate.clamp(0.0, 1.0);
        self
    }

    fn work_duration<R: Rng>(&self, rng: &mut R) -> Duration {
        if self.max_work > self.min_work {
            rng.gen_range(self.min_work..self.max_work)
        } else {
            self.min_work
        }
    }
}

#[derive(Debug, Clone)]
pub struct SimulatedHandler {
    job_type: JobType,
    config: SimulationConfig,
}

pub fn handler(job_type: JobType, config: SimulationConfig) -> SimulatedHandler {
    SimulatedHandler { job_type, config }
}

fn failure_message(job_type: JobType) -> &'static str {
    match job_type {
        JobType::ProcessData => "Data processing error: invalid format",
        JobType::SendEmail => "Email sending failed: SMTP connection error",
        JobType::GenerateReport => "Report generation failed: insufficient data",
        JobType::SyncData => "Data sync failed: connection timeout",
    }
}

/// First eight characters of the job id, used in generated references.
fn short_id(job_id: JobId) -> String {
    job_id.to_string().chars().take(8).collect()
}

fn object(value: serde_json::Value) -> Payload {
    match value {
        serde_json::Value::Object(map) => map,
        _ => Payload::new(),
    }
}

impl JobHandler for SimulatedHandler {
    fn execute(&self, job_id: JobId, payload: &Payload) -> Result<Payload, ExecutionError> {
        let mut rng = rand::thread_rng();

        let work = self.config.work_duration(&mut rng);
        if !work.is_zero() {
            thread::sleep(work);
        }

        if self.config.failure_rate > 0.0 && rng.gen_bool(self.config.failure_rate.min(1.0)) {
            return Err(ExecutionError::new(failure_message(self.job_type)));
        }

        let now_ms = Utc::now().timestamp_millis();
        let result = match self.job_type {
            JobType::ProcessData => json!({
                "recordsProcessed": rng.gen_range(100..1100),
                "processingTimeMs": work.as_millis() as u64,
                "status": "success",
            }),
            JobType::SendEmail => json!({
                "recipient": payload.get("to").and_then(|v| v.as_str()).unwrap_or("unknown"),
                "sentAt": now_ms,
                "messageId": format!("MSG-{}", short_id(job_id)),
                "status": "delivered",
            }),
            JobType::GenerateReport => json!({
                "reportId": format!("RPT-{}", short_id(job_id)),
                "format": "PDF",
                "pages": rng.gen_range(5..55),
                "generatedAt": now_ms,
                "status": "completed",
            }),
            JobType::SyncData => json!({
                "recordsSynced": rng.gen_range(50..550),
                "conflicts": rng.gen_range(0..5),
                "syncedAt": now_ms,
                "status": "synchronized",
            }),
        };
        Ok(object(result))
    }
}
