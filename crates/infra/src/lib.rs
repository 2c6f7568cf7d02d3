//! Infrastructure layer: channels, claims, job storage, workers, reconciler.

pub mod config;
pub mod event_bus;
pub mod execution;
pub mod idempotency;
pub mod reconciler;
pub mod service;
pub mod store;
pub mod workers;

#[cfg(test)]
mod integration_tests;

pub use config::{ChannelConfig, ConfigError, RelayConfig};
pub use execution::{HandlerRegistry, JobHandler, SimulationConfig, WorkerPool, WorkerStats};
pub use idempotency::{GuardError, IdempotencyGuard, InMemoryIdempotencyGuard};
pub use reconciler::{ReconcileError, ReconcileOutcome, ReconcilerPool, StatusReconciler};
pub use service::{JobService, ServiceError};
pub use store::{InMemoryJobStore, JobQuery, JobStats, JobStore, Page, PageRequest, StoreError};
