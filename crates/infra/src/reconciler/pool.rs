use std::sync::{Arc, Mutex};
use std::thread;

use serde::Serialize;
use tracing::{error, info, warn};

use jobrelay_events::{Delivery, EventChannel};
use jobrelay_jobs::JobEvent;

use crate::config::RelayConfig;
use crate::workers::{ConsumerHandle, PoolError, REQUEUE_PAUSE, shutdown_all, spawn_consumer};

use super::{ReconcileOutcome, StatusReconciler};

/// Consumer group of the reconcilers on the status channel.
pub const RECONCILER_GROUP: &str = "job-reconciler";

/// Reconciler pool runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcilerStats {
    pub applied: u64,
    pub ignored: u64,
    pub rejected: u64,
    pub notifications: u64,
    /// Events dropped on a final error.
    pub dropped: u64,
    /// Events nacked on a retriable error.
    pub requeued: u64,
}

#[derive(Debug)]
pub struct ReconcilerPool {
    consumers: Vec<ConsumerHandle>,
    stats: Arc<Mutex<ReconcilerStats>>,
}

impl ReconcilerPool {
    pub fn spawn(
        config: &RelayConfig,
        channel: Arc<dyn EventChannel<JobEvent>>,
        reconciler: Arc<StatusReconciler>,
    ) -> Result<Self, PoolError> {
        let stats = Arc::new(Mutex::new(ReconcilerStats::default()));

        let mut consumers = Vec::with_capacity(config.reconciler_concurrency);
        for n in 0..config.reconciler_concurrency {
            let sub = match channel.subscribe(&config.channels.status, RECONCILER_GROUP) {
                Ok(sub) => sub,
                Err(e) => {
                    shutdown_all(consumers);
                    return Err(e.into());
                }
            };
            let reconciler = Arc::clone(&reconciler);
            let stats = Arc::clone(&stats);
            let spawned = spawn_consumer(format!("job-reconciler-{n}"), sub, move |delivery| {
                handle_delivery(&reconciler, &stats, delivery)
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
            concurrency = config.reconciler_concurrency,
            channel = %config.channels.status,
            "reconciler pool started"
        );

        Ok(Self { consumers, stats })
    }

    pub fn stats(&self) -> ReconcilerStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn concurrency(&self) -> usize {
        self.consumers.len()
    }

    pub fn shutdown(self) {
        shutdown_all(self.consumers);
        info!("reconciler pool stopped");
    }
}

/// Ack once the effect is stored; nack on anything that may succeed later.
fn handle_delivery(
    reconciler: &StatusReconciler,
    stats: &Mutex<ReconcilerStats>,
    delivery: Delivery<JobEvent>,
) {
    let result = reconciler.reconcile(delivery.message());

    let ack = match &result {
        Ok(_) => true,
        Err(e) if e.is_retriable() => {
            error!(
                job_id = %delivery.message().job_id,
                position = %delivery.position(),
                attempt = delivery.attempt(),
                error = %e,
                "reconcile failed, requeueing event"
            );
            false
        }
        Err(e) => {
            warn!(
                job_id = %delivery.message().job_id,
                position = %delivery.position(),
                error = %e,
                "dropping status event"
            );
            true
        }
    };

    if let Ok(mut s) = stats.lock() {
        match &result {
            Ok(ReconcileOutcome::Applied(_)) => s.applied += 1,
            Ok(ReconcileOutcome::Ignored(_)) => s.ignored += 1,
            Ok(ReconcileOutcome::Rejected(_)) => s.rejected += 1,
            Ok(ReconcileOutcome::Notification(_)) => s.notifications += 1,
            Err(_) if ack => s.dropped += 1,
            Err(_) => s.requeued += 1,
        }
    }

    let position = delivery.position().to_string();
    let settled = if ack { delivery.ack() } else { delivery.nack() };
    if let Err(e) = settled {
        warn!(position = %position, error = %e, "failed to settle status event");
    }
    if !ack {
        thread::sleep(REQUEUE_PAUSE);
    }
}
