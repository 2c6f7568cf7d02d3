mod cli;
mod wiring;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde_json::json;
use tracing::{info, warn};

use jobrelay_infra::config::RelayConfig;
use jobrelay_infra::execution::{HandlerRegistry, WorkerPool};
use jobrelay_infra::reconciler::{ReconcilerPool, StatusReconciler};
use jobrelay_infra::service::JobService;
use jobrelay_jobs::{JobType, NewJob, Payload};

use crate::cli::Cli;

fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    jobrelay_observability::init_with(cli.log_format);

    let config = RelayConfig::from_env().context("invalid configuration")?;
    let args = cli.command.args().clone();

    // Pools run on plain threads; the runtime only drives Postgres and signals.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("jobrelay-rt")
        .build()
        .context("failed to start tokio runtime")?;

    let backends = wiring::build(&config, runtime.handle())?;
    let reconciler = Arc::new(StatusReconciler::new(
        &config,
        Arc::clone(&backends.store),
        Arc::clone(&backends.guard),
        Arc::clone(&backends.channel),
    ));

    let workers = if cli.command.runs_workers() {
        let registry = HandlerRegistry::simulated(config.simulation.clone());
        Some(WorkerPool::spawn(
            &config,
            Arc::clone(&backends.channel),
            Arc::clone(&backends.guard),
            registry,
        )?)
    } else {
        None
    };

    let reconcilers = if cli.command.runs_reconciler() {
        Some(ReconcilerPool::spawn(
            &config,
            Arc::clone(&backends.channel),
            Arc::clone(&reconciler),
        )?)
    } else {
        None
    };

    info!(
        worker_id = %config.worker_id,
        workers = workers.as_ref().map_or(0, WorkerPool::concurrency),
        reconcilers = reconcilers.as_ref().map_or(0, ReconcilerPool::concurrency),
        "jobrelay started"
    );

    let service = JobService::new(
        &config,
        Arc::clone(&backends.store),
        Arc::clone(&backends.channel),
        reconciler,
    );
    if args.submit > 0 {
        submit_samples(&service, args.submit);
    }

    runtime.block_on(wait_for_shutdown(args.run_for()));

    if let Some(pool) = workers {
        info!(stats = ?pool.stats(), "worker pool stats");
        pool.shutdown();
    }
    if let Some(pool) = reconcilers {
        info!(stats = ?pool.stats(), "reconciler pool stats");
        pool.shutdown();
    }
    match service.stats() {
        Ok(stats) => info!(
            total = stats.total,
            completed = stats.completed,
            dead_letter = stats.dead_letter,
            pending = stats.pending,
            running = stats.running,
            avg_execution_time_ms = stats.avg_execution_time_ms,
            "job stats"
        ),
        Err(e) => warn!(error = %e, "failed to read job stats"),
    }

    Ok(())
}

fn sample_payload(job_type: JobType, n: usize) -> Payload {
    let value = match job_type {
        JobType::SendEmail => json!({ "to": format!("user{n}@example.com"), "template": "welcome" }),
        JobType::ProcessData => json!({ "source": format!("batch-{n}.csv") }),
        JobType::GenerateReport => json!({ "report": "monthly-sales", "month": (n % 12) + 1 }),
        JobType::SyncData => json!({ "target": "crm" }),
    };
    match value {
        serde_json::Value::Object(map) => map,
        _ => Payload::new(),
    }
}

fn submit_samples(service: &JobService, count: usize) {
    for n in 0..count {
        let job_type = JobType::ALL[n % JobType::ALL.len()];
        let new = NewJob::new(format!("sample {} #{n}", job_type.display_name()), job_type)
            .with_payload(sample_payload(job_type, n));
        if let Err(e) = service.create(new) {
            warn!(error = %e, "failed to submit sample job");
        }
    }
    info!(count, "sample jobs submitted");
}

async fn wait_for_shutdown(run_for: Option<Duration>) {
    let deadline = async {
        match run_for {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        signal = tokio::signal::ctrl_c() => match signal {
            Ok(()) => info!("shutdown requested"),
            Err(e) => warn!(error = %e, "failed to listen for ctrl-c, shutting down"),
        },
        _ = deadline => info!("run time elapsed, shutting down"),
    }
}
