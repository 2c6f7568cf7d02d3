//! Integration tests for the full delivery pipeline.
//!
//! Tests: JobService → request channel → WorkerPool → status channel →
//! ReconcilerPool → JobStore (and back to the request channel on retry)
//!
//! Verifies:
//! - Failing jobs are retried and end in DEAD_LETTER with one notification
//! - Duplicate deliveries are executed once
//! - A guard outage holds execution back until the guard recovers
//! - A request from a superseded attempt cannot strand the job
//! - Cancelled jobs never reach a worker
//! - Per-job status events arrive in causal order

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::{Duration, Instant};

    use jobrelay_core::JobId;
    use jobrelay_events::{EventChannel, InMemoryChannel};
    use jobrelay_jobs::{BackoffPolicy, EventType, JobEvent, JobStatus, JobType, NewJob, Payload};

    use crate::config::RelayConfig;
    use crate::execution::{ExecutionError, HandlerRegistry, SimulationConfig, WorkerPool};
    use crate::idempotency::{IdempotencyGuard, InMemoryIdempotencyGuard};
    use crate::reconciler::{ReconcilerPool, StatusReconciler};
    use crate::service::JobService;
    use crate::store::{InMemoryJobStore, JobStore};

    const WAIT: Duration = Duration::from_secs(10);

    struct Relay {
        config: RelayConfig,
        channel: InMemoryChannel<JobEvent>,
        guard: Arc<InMemoryIdempotencyGuard>,
        reconciler: Arc<StatusReconciler>,
        service: JobService,
    }

    struct Running {
        workers: WorkerPool,
        reconcilers: ReconcilerPool,
    }

    impl Running {
        fn stop(self) {
            self.workers.shutdown();
            self.reconcilers.shutdown();
        }
    }

    fn setup() -> Relay {
        setup_with(BackoffPolicy::immediate())
    }

    fn setup_with(backoff: BackoffPolicy) -> Relay {
        let mut config = RelayConfig::default();
        config.backoff = backoff;
        config.worker_concurrency = 2;
        config.reconciler_concurrency = 2;

        let channel = InMemoryChannel::with_channels(&config.channels.specs());
        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
        let guard = Arc::new(InMemoryIdempotencyGuard::new());
        let reconciler = Arc::new(StatusReconciler::new(
            &config,
            Arc::clone(&store),
            guard.clone(),
            Arc::new(channel.clone()),
        ));
        let service = JobService::new(
            &config,
            store,
            Arc::new(channel.clone()),
            Arc::clone(&reconciler),
        );

        Relay {
            config,
            channel,
            guard,
            reconciler,
            service,
        }
    }

    impl Relay {
        fn start(&self, registry: HandlerRegistry) -> Running {
            let channel: Arc<dyn EventChannel<JobEvent>> = Arc::new(self.channel.clone());
            let workers =
                WorkerPool::spawn(&self.config, Arc::clone(&channel), self.guard.clone(), registry)
                    .unwrap();
            let reconcilers =
                ReconcilerPool::spawn(&self.config, channel, Arc::clone(&self.reconciler)).unwrap();
            Running {
                workers,
                reconcilers,
            }
        }

        fn status_of(&self, id: JobId) -> JobStatus {
            self.service.get(id).unwrap().status
        }

        fn wait_for(&self, id: JobId, status: JobStatus) {
            wait_until(|| self.status_of(id) == status);
            assert_eq!(self.status_of(id), status, "job {id} never reached {status}");
        }

        fn status_events(&self, id: JobId) -> Vec<JobEvent> {
            self.channel
                .messages_for_key(&self.config.channels.status, &id.as_key())
        }
    }

    fn wait_until(mut done: impl FnMut() -> bool) {
        let start = Instant::now();
        while !done() && start.elapsed() < WAIT {
            thread::sleep(Duration::from_millis(10));
        }
    }

    fn failing_process_data() -> HandlerRegistry {
        HandlerRegistry::simulated(SimulationConfig::instant()).with(
            JobType::ProcessData,
            |_: JobId, _: &Payload| -> Result<Payload, ExecutionError> {
                Err(ExecutionError::new("Data processing failed: Invalid data format"))
            },
        )
    }

    #[test]
    fn failing_job_is_retried_then_dead_lettered_once() {
        let relay = setup();
        let running = relay.start(failing_process_data());

        let job = relay
            .service
            .create(NewJob::new("nightly import", JobType::ProcessData).with_max_retries(1))
            .unwrap();
        relay.wait_for(job.id, JobStatus::DeadLetter);
        // Give stray redeliveries a chance to show up before counting.
        thread::sleep(Duration::from_millis(200));
        running.stop();

        let stored = relay.service.get(job.id).unwrap();
        assert_eq!(stored.retry_count, 1);
        assert_eq!(
            stored.error_message.as_deref(),
            Some("Data processing failed: Invalid data format")
        );

        let requests = relay
            .channel
            .messages_for_key(&relay.config.channels.requests, &job.id.as_key());
        let kinds: Vec<_> = requests.iter().map(|e| (e.event_type, e.retry_count)).collect();
        assert_eq!(kinds, vec![(EventType::Created, 0), (EventType::Retry, 1)]);

        let dead = relay
            .channel
            .messages_for_key(&relay.config.channels.dead_letter, &job.id.as_key());
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].event_type, EventType::DeadLetter);
        assert_eq!(dead[0].status, JobStatus::DeadLetter);

        assert!(
            relay
                .status_events(job.id)
                .iter()
                .all(|e| e.event_type != EventType::DeadLetter)
        );
    }

    #[test]
    fn successful_job_reports_in_causal_order() {
        let relay = setup();
        let running = relay.start(HandlerRegistry::simulated(SimulationConfig::instant()));

        let job = relay
            .service
            .create(NewJob::new("quarterly", JobType::GenerateReport))
            .unwrap();
        relay.wait_for(job.id, JobStatus::Completed);
        running.stop();

        let kinds: Vec<_> = relay
            .status_events(job.id)
            .iter()
            .map(|e| e.event_type)
            .collect();
        assert_eq!(kinds, vec![EventType::Started, EventType::Completed]);

        let stored = relay.service.get(job.id).unwrap();
        assert_eq!(stored.result.as_ref().unwrap()["format"], "PDF");
        assert_eq!(stored.worker_id.as_ref(), Some(&relay.config.worker_id));
        assert!(stored.execution_time().is_some());
        assert_eq!(relay.service.stats().unwrap().completed, 1);
    }

    #[test]
    fn duplicate_request_is_executed_once() {
        let relay = setup();
        let job = relay
            .service
            .create(NewJob::new("sync crm", JobType::SyncData))
            .unwrap();

        // Redelivery of the same request, e.g. after a publisher retry.
        let duplicate = JobEvent::request(&job);
        relay
            .channel
            .publish(&relay.config.channels.requests, &duplicate.key(), duplicate)
            .unwrap();

        let running = relay.start(HandlerRegistry::simulated(SimulationConfig::instant()));
        relay.wait_for(job.id, JobStatus::Completed);
        wait_until(|| running.workers.stats().processed >= 2);
        let stats = running.workers.stats();
        running.stop();

        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.skipped, 1);
        let completed = relay
            .status_events(job.id)
            .iter()
            .filter(|e| e.event_type == EventType::Completed)
            .count();
        assert_eq!(completed, 1);
    }

    #[test]
    fn guard_outage_holds_execution_until_recovery() {
        let relay = setup();
        relay.guard.set_available(false);
        let running = relay.start(HandlerRegistry::simulated(SimulationConfig::instant()));

        let job = relay
            .service
            .create(NewJob::new("welcome", JobType::SendEmail))
            .unwrap();
        thread::sleep(Duration::from_millis(300));

        assert_eq!(relay.status_of(job.id), JobStatus::Pending);
        assert!(relay.status_events(job.id).is_empty());
        assert_eq!(running.workers.stats().processed, 0);

        relay.guard.set_available(true);
        relay.wait_for(job.id, JobStatus::Completed);
        running.stop();
    }

    #[test]
    fn stale_request_redelivered_after_requeue_does_not_strand_the_job() {
        // The retry stays scheduled long enough for the stale request to land first.
        let relay = setup_with(BackoffPolicy::fixed(Duration::from_millis(400)));
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let registry = HandlerRegistry::simulated(SimulationConfig::instant()).with(
            JobType::ProcessData,
            move |_: JobId, _: &Payload| -> Result<Payload, ExecutionError> {
                if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(ExecutionError::new("Data processing failed: Invalid data format"))
                } else {
                    Ok(Payload::new())
                }
            },
        );
        let running = relay.start(registry);

        let job = relay
            .service
            .create(NewJob::new("nightly import", JobType::ProcessData).with_max_retries(3))
            .unwrap();
        wait_until(|| relay.service.get(job.id).unwrap().retry_count == 1);

        // Redelivery of the original request, e.g. from a lost ack.
        let stale = JobEvent::request(&job);
        relay
            .channel
            .publish(&relay.config.channels.requests, &stale.key(), stale)
            .unwrap();

        relay.wait_for(job.id, JobStatus::Completed);
        wait_until(|| running.workers.stats().skipped >= 1);
        let stats = running.workers.stats();
        running.stop();

        assert_eq!(stats.skipped, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let done = relay.service.get(job.id).unwrap();
        assert_eq!(done.retry_count, 1);
        let completions: Vec<_> = relay
            .status_events(job.id)
            .into_iter()
            .filter(|e| e.event_type == EventType::Completed)
            .collect();
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].retry_count, 1);
    }

    #[test]
    fn cancelled_job_never_reaches_a_worker() {
        let relay = setup();
        let job = relay
            .service
            .create(NewJob::new("stale export", JobType::ProcessData))
            .unwrap();
        let cancelled = relay.service.cancel(job.id).unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);

        let running = relay.start(HandlerRegistry::simulated(SimulationConfig::instant()));
        wait_until(|| running.workers.stats().processed >= 1);
        let stats = running.workers.stats();
        running.stop();

        assert_eq!(stats.skipped, 1);
        assert_eq!(relay.status_of(job.id), JobStatus::Cancelled);
        let kinds: Vec<_> = relay
            .status_events(job.id)
            .iter()
            .map(|e| e.event_type)
            .collect();
        assert_eq!(kinds, vec![EventType::Cancelled]);
    }

    #[test]
    fn every_job_settles_under_random_failures() {
        let relay = setup();
        let registry =
            HandlerRegistry::simulated(SimulationConfig::instant().with_failure_rate(0.5));
        let running = relay.start(registry);

        let ids: Vec<JobId> = (0..20)
            .map(|n| {
                let job_type = JobType::ALL[n % JobType::ALL.len()];
                relay
                    .service
                    .create(NewJob::new(format!("job {n}"), job_type).with_max_retries(2))
                    .unwrap()
                    .id
            })
            .collect();

        wait_until(|| {
            ids.iter().all(|id| {
                matches!(
                    relay.status_of(*id),
                    JobStatus::Completed | JobStatus::DeadLetter
                )
            })
        });
        running.stop();

        let stats = relay.service.stats().unwrap();
        assert_eq!(stats.completed + stats.dead_letter, 20);

        let dead_letters = relay
            .channel
            .messages(&relay.config.channels.dead_letter)
            .len() as u64;
        assert_eq!(dead_letters, stats.dead_letter);

        for id in ids {
            let job = relay.service.get(id).unwrap();
            assert!(job.retry_count <= job.max_retries);
            if job.status == JobStatus::DeadLetter {
                assert_eq!(job.retry_count, job.max_retries);
            }

            // Started always precedes the outcome of the same attempt.
            let events = relay.status_events(id);
            for pair in events.windows(2) {
                if pair[0].retry_count == pair[1].retry_count {
                    assert_eq!(pair[0].event_type, EventType::Started);
                }
            }
        }
    }

    #[test]
    fn concurrent_claims_have_one_winner() {
        let guard: Arc<dyn IdempotencyGuard> = Arc::new(InMemoryIdempotencyGuard::new());
        let id = JobId::new();

        let winners: usize = (0..8)
            .map(|_| {
                let guard = Arc::clone(&guard);
                thread::spawn(move || guard.try_acquire(id, 0).unwrap())
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| usize::from(h.join().unwrap()))
            .sum();

        assert_eq!(winners, 1);
    }
}
