//! Background consumer threads.

use std::io;
use std::time::Duration;

use thiserror::Error;

use jobrelay_events::ChannelError;

use crate::execution::DispatchError;

pub mod consumer;

pub use consumer::{CONSUMER_TICK, ConsumerHandle, spawn_consumer};

/// Pause after a nack so an outage does not turn into a busy redelivery loop.
pub const REQUEUE_PAUSE: Duration = Duration::from_millis(200);

/// A pool could not be started.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to subscribe: {0}")]
    Channel(#[from] ChannelError),

    #[error("failed to spawn consumer thread: {0}")]
    Spawn(#[from] io::Error),

    #[error(transparent)]
    Registry(#[from] DispatchError),
}

/// Signal every consumer first, then join them, so shutdown takes one tick
/// rather than one tick per thread.
pub fn shutdown_all(consumers: Vec<ConsumerHandle>) {
    for c in &consumers {
        c.signal();
    }
    for c in consumers {
        c.join();
    }
}
