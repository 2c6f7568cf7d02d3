use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use jobrelay_core::JobId;
use jobrelay_jobs::{JobEvent, JobType, Payload};

use super::simulated::{self, SimulationConfig};
use super::{DispatchError, ExecutionError};

/// Executes one job type.
///
/// Handlers must tolerate running more than once for the same job: a crash
/// between execution and the outcome publish re-runs the request.
pub trait JobHandler: Send + Sync {
    fn execute(&self, job_id: JobId, payload: &Payload) -> Result<Payload, ExecutionError>;
}

impl<F> JobHandler for F
where
    F: Fn(JobId, &Payload) -> Result<Payload, ExecutionError> + Send + Sync,
{
    fn execute(&self, job_id: JobId, payload: &Payload) -> Result<Payload, ExecutionError> {
        self(job_id, payload)
    }
}

/// Dispatch table from job type to handler.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
}

impl core::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulated handlers for every job type.
    pub fn simulated(config: SimulationConfig) -> Self {
        let mut registry = Self::new();
        for job_type in JobType::ALL {
            registry.register(job_type, simulated::handler(job_type, config.clone()));
        }
        registry
    }

    /// Register (or replace) the handler for `job_type`.
    pub fn register<H>(&mut self, job_type: JobType, handler: H) -> &mut Self
    where
        H: JobHandler + 'static,
    {
        self.handlers.insert(job_type, Arc::new(handler));
        self
    }

    pub fn with<H>(mut self, job_type: JobType, handler: H) -> Self
    where
        H: JobHandler + 'static,
    {
        self.register(job_type, handler);
        self
    }

    pub fn get(&self, job_type: JobType) -> Option<&Arc<dyn JobHandler>> {
        self.handlers.get(&job_type)
    }

    /// Registered job types, in declaration order.
    pub fn job_types(&self) -> Vec<JobType> {
        JobType::ALL
            .into_iter()
            .filter(|t| self.handlers.contains_key(t))
            .collect()
    }

    /// Every job type has a handler. Checked at startup so a missing handler
    /// is a configuration error rather than a dead-lettered job.
    pub fn ensure_complete(&self) -> Result<(), DispatchError> {
        let missing: Vec<JobType> = JobType::ALL
            .into_iter()
            .filter(|t| !self.handlers.contains_key(t))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(DispatchError::MissingHandlers(missing))
        }
    }

    /// Run the handler for a request event.
    pub fn dispatch(&self, event: &JobEvent) -> Result<Payload, DispatchError> {
        let handler = self
            .get(event.job_type)
            .ok_or(DispatchError::NoHandler(event.job_type))?;

        debug!(job_id = %event.job_id, job_type = %event.job_type, "dispatching job");

        let empty = Payload::new();
        let payload = event.payload.as_ref().unwrap_or(&empty);
        Ok(handler.execute(event.job_id, payload)?)
    }
}
