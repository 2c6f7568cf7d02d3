//! Backend selection: Redis and Postgres when configured, in-memory otherwise.

use std::sync::Arc;

use anyhow::Context;
use tokio::runtime::Handle;
use tracing::{info, warn};

use jobrelay_events::{EventChannel, InMemoryChannel};
use jobrelay_infra::config::RelayConfig;
use jobrelay_infra::event_bus::RedisStreamsChannel;
use jobrelay_infra::idempotency::{IdempotencyGuard, InMemoryIdempotencyGuard, RedisIdempotencyGuard};
use jobrelay_infra::store::{InMemoryJobStore, JobStore, PostgresJobStore};
use jobrelay_jobs::JobEvent;

pub struct Backends {
    pub channel: Arc<dyn EventChannel<JobEvent>>,
    pub guard: Arc<dyn IdempotencyGuard>,
    pub store: Arc<dyn JobStore>,
}

/// Build the shared components and declare the channels.
///
/// `runtime` owns the Postgres pool; it must not be the caller's own runtime.
pub fn build(config: &RelayConfig, runtime: &Handle) -> anyhow::Result<Backends> {
    let (channel, guard): (Arc<dyn EventChannel<JobEvent>>, Arc<dyn IdempotencyGuard>) =
        match &config.redis_url {
            Some(url) => {
                let channel = RedisStreamsChannel::<JobEvent>::new(url)
                    .context("failed to create Redis channel")?;
                let guard = RedisIdempotencyGuard::new(url)
                    .context("failed to create Redis idempotency guard")?
                    .with_ttl(config.idempotency_ttl);
                info!("using Redis channels and claims");
                (Arc::new(channel), Arc::new(guard))
            }
            None => {
                warn!("JOBRELAY_REDIS_URL not set; channels and claims are in-memory and process-local");
                (
                    Arc::new(InMemoryChannel::<JobEvent>::new()),
                    Arc::new(InMemoryIdempotencyGuard::with_ttl(config.idempotency_ttl)),
                )
            }
        };

    let store: Arc<dyn JobStore> = match &config.database_url {
        Some(url) => {
            let store = PostgresJobStore::connect(url, runtime.clone())
                .context("failed to connect to Postgres")?;
            store.migrate_blocking().context("failed to migrate jobs schema")?;
            info!("using Postgres job store");
            Arc::new(store)
        }
        None => {
            warn!("JOBRELAY_DATABASE_URL not set; job store is in-memory");
            Arc::new(InMemoryJobStore::new())
        }
    };

    for spec in config.channels.specs() {
        channel
            .declare(&spec)
            .with_context(|| format!("failed to declare channel {}", spec.name))?;
    }

    Ok(Backends {
        channel,
        guard,
        store,
    })
}
