use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use chrono::Utc;
use jobrelay_core::WorkerId;
use jobrelay_events::InMemoryChannel;
use jobrelay_infra::config::RelayConfig;
use jobrelay_infra::idempotency::InMemoryIdempotencyGuard;
use jobrelay_infra::reconciler::StatusReconciler;
use jobrelay_infra::store::{InMemoryJobStore, JobStore};
use jobrelay_jobs::{
    BackoffPolicy, EventType, Job, JobEvent, JobStatus, JobType, NewJob, Trigger, decide,
    transition,
};
use std::sync::Arc;

fn setup_reconciler() -> (Arc<StatusReconciler>, Arc<dyn JobStore>) {
    let mut config = RelayConfig::default();
    config.backoff = BackoffPolicy::immediate();
    let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
    let channel: InMemoryChannel<JobEvent> = InMemoryChannel::new();
    let reconciler = StatusReconciler::new(
        &config,
        Arc::clone(&store),
        Arc::new(InMemoryIdempotencyGuard::new()),
        Arc::new(channel),
    );
    (Arc::new(reconciler), store)
}

fn stored_job(store: &Arc<dyn JobStore>, max_retries: u32) -> Job {
    let new = NewJob::new("bench", JobType::ProcessData).with_max_retries(max_retries);
    store.insert(Job::create(new, Utc::now()).unwrap()).unwrap()
}

fn bench_transition(c: &mut Criterion) {
    let mut group = c.benchmark_group("transition");
    group.sample_size(1000);

    let job = Job::create(NewJob::new("bench", JobType::SyncData), Utc::now()).unwrap();
    let started = Trigger::Started {
        worker_id: WorkerId::new("bench-worker"),
        attempt: 0,
    };

    group.bench_function("pending_to_running", |b| {
        b.iter(|| black_box(transition(black_box(&job), &started, Utc::now()).unwrap()));
    });

    let mut failed = job.clone();
    failed.status = JobStatus::Failed;
    let policy = BackoffPolicy::default().with_jitter(0.1);
    group.bench_function("retry_decision", |b| {
        b.iter(|| black_box(decide(black_box(&failed), &policy)));
    });

    group.finish();
}

fn bench_reconcile_lifecycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("reconcile_lifecycle");

    // Started then Completed for a fresh job: two loads, two versioned writes.
    group.bench_function("started_completed", |b| {
        let (reconciler, store) = setup_reconciler();
        let worker = WorkerId::new("bench-worker");
        b.iter(|| {
            let job = stored_job(&store, 3);
            let request = JobEvent::request(&job);
            for kind in [EventType::Started, EventType::Completed] {
                let event = JobEvent::worker_update(&request, kind, worker.clone());
                black_box(reconciler.reconcile(&event).unwrap());
            }
        });
    });

    // Redelivered Completed on a COMPLETED job: load and ignore.
    group.bench_function("duplicate_completed", |b| {
        let (reconciler, store) = setup_reconciler();
        let worker = WorkerId::new("bench-worker");
        let job = stored_job(&store, 3);
        let request = JobEvent::request(&job);
        let completed = JobEvent::worker_update(&request, EventType::Completed, worker.clone());
        reconciler
            .reconcile(&JobEvent::worker_update(&request, EventType::Started, worker))
            .unwrap();
        reconciler.reconcile(&completed).unwrap();

        b.iter(|| black_box(reconciler.reconcile(black_box(&completed)).unwrap()));
    });

    group.finish();
}

fn bench_dead_letter_path(c: &mut Criterion) {
    let mut group = c.benchmark_group("dead_letter_path");

    for max_retries in [0u32, 1, 3].iter() {
        group.throughput(Throughput::Elements(u64::from(*max_retries) + 1));
        group.bench_with_input(
            BenchmarkId::new("fail_every_attempt", max_retries),
            max_retries,
            |b, &retries| {
                let (reconciler, store) = setup_reconciler();
                let worker = WorkerId::new("bench-worker");

                b.iter(|| {
                    let job = stored_job(&store, retries);
                    for attempt in 0..=retries {
                        let mut request = JobEvent::request(&job);
                        request.retry_count = attempt;
                        let started =
                            JobEvent::worker_update(&request, EventType::Started, worker.clone());
                        let failed =
                            JobEvent::worker_update(&request, EventType::Failed, worker.clone())
                                .with_error("bench failure");
                        reconciler.reconcile(&started).unwrap();
                        black_box(reconciler.reconcile(&failed).unwrap());
                    }
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_transition,
    bench_reconcile_lifecycle,
    bench_dead_letter_path,
);
criterion_main!(benches);
