//! Consumer side of a channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvError, RecvTimeoutError, TryRecvError};
use std::time::Duration;

use crate::delivery::Delivery;

/// A group member's view of a channel.
///
/// Deliveries are produced by a backend pump thread over a rendezvous
/// channel, so the pump only fetches the next message once the previous one
/// has been taken. Each delivery must be settled (`ack`/`nack`) before the
/// same partition yields its next message.
///
/// ```ignore
/// let sub = channel.subscribe("job-requests", "job-workers")?;
/// loop {
///     match sub.recv_timeout(Duration::from_millis(200)) {
///         Ok(delivery) => handle(delivery),
///         Err(RecvTimeoutError::Timeout) => continue,  // check for shutdown
///         Err(RecvTimeoutError::Disconnected) => break, // channel closed
///     }
/// }
/// ```
///
/// Dropping the subscription stops its pump.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<Delivery<M>>,
    closed: Arc<AtomicBool>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<Delivery<M>>, closed: Arc<AtomicBool>) -> Self {
        Self { receiver, closed }
    }

    /// Block until the next delivery is available.
    pub fn recv(&self) -> Result<Delivery<M>, RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a delivery without blocking.
    pub fn try_recv(&self) -> Result<Delivery<M>, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a delivery.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Delivery<M>, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}

impl<M> Drop for Subscription<M> {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
