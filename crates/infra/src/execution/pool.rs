use std::sync::{Arc, Mutex};
use std::thread;

use serde::Serialize;
use tracing::info;

use jobrelay_events::EventChannel;
use jobrelay_jobs::JobEvent;

use crate::config::RelayConfig;
use crate::idempotency::IdempotencyGuard;
use crate::workers::{ConsumerHandle, PoolError, REQUEUE_PAUSE, shutdown_all, spawn_consumer};

use super::handlers::HandlerRegistry;
use super::worker::{JobWorker, ProcessOutcome};

/// Consumer group of the execution workers on the request channel.
pub const WORKER_GROUP: &str = "job-workers";

/// Worker pool runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    /// Deliveries settled with an ack.
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
}

impl WorkerStats {
    fn record(&mut self, outcome: &ProcessOutcome) {
        match outcome {
            ProcessOutcome::Succeeded => self.succeeded += 1,
            ProcessOutcome::Failed { .. } => self.failed += 1,
            ProcessOutcome::Skipped => self.skipped += 1,
            ProcessOutcome::Ignored => {}
            ProcessOutcome::Requeued => return,
        }
        self.processed += 1;
    }
}

/// `worker_concurrency` consumer threads sharing one consumer group.
#[derive(Debug)]
pub struct WorkerPool {
    consumers: Vec<ConsumerHandle>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerPool {
    /// Validate `registry` and start consuming the request channel.
    pub fn spawn(
        config: &RelayConfig,
        channel: Arc<dyn EventChannel<JobEvent>>,
        guard: Arc<dyn IdempotencyGuard>,
        registry: HandlerRegistry,
    ) -> Result<Self, PoolError> {
        registry.ensure_complete()?;

        let worker = JobWorker::new(
            config.worker_id.clone(),
            Arc::clone(&channel),
            guard,
            Arc::new(registry),
            config.channels.status.clone(),
        );
        let stats = Arc::new(Mutex::new(WorkerStats::default()));

        let mut consumers = Vec::with_capacity(config.worker_concurrency);
        for n in 0..config.worker_concurrency {
            let sub = match channel.subscribe(&config.channels.requests, WORKER_GROUP) {
                Ok(sub) => sub,
                Err(e) => {
                    shutdown_all(consumers);
                    return Err(e.into());
                }
            };
            let worker = worker.clone();
            let stats = Arc::clone(&stats);
            let spawned = spawn_consumer(format!("job-worker-{n}"), sub, move |delivery| {
                let outcome = worker.process(delivery);
                if let Ok(mut s) = stats.lock() {
                    s.record(&outcome);
                }
                if outcome == ProcessOutcome::Requeued {
                    thread::sleep(REQUEUE_PAUSE);
                }
            });
            match spawned {
                Ok(handle) => consumers.push(handle),
                Err(e) => {
                    shutdown_all(consumers);
                    return Err(e.into());
                }
            }
        }

        info!(
            worker_id = %config.worker_id,
            concurrency = config.worker_concurrency,
            channel = %config.channels.requests,
            "worker pool started"
        );

        Ok(Self { consumers, stats })
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn concurrency(&self) -> usize {
        self.consumers.len()
    }

    /// Request graceful shutdown and wait for every consumer to stop.
    pub fn shutdown(self) {
        shutdown_all(self.consumers);
        info!("worker pool stopped");
    }
}
