//! A single handed-out message and its settlement.

use crate::channel::{ChannelError, DeliveryPosition};

/// Backend hook that settles one delivery.
///
/// Exactly one of `ack`/`nack` is called per delivery; `Delivery` guarantees
/// that by consuming the boxed acknowledger.
pub trait Acknowledger: Send {
    /// The message is done; the partition may advance.
    fn ack(self: Box<Self>) -> Result<(), ChannelError>;

    /// The message was not processed; hand it out again.
    fn nack(self: Box<Self>) -> Result<(), ChannelError>;
}

/// A message delivered to one consumer of a group.
///
/// Dropping a delivery without settling it counts as a `nack`, so a consumer
/// that panics or bails out early never loses the message.
pub struct Delivery<M> {
    message: M,
    key: String,
    position: DeliveryPosition,
    attempt: u32,
    acker: Option<Box<dyn Acknowledger>>,
}

impl<M> Delivery<M> {
    pub fn new(
        message: M,
        key: impl Into<String>,
        position: DeliveryPosition,
        attempt: u32,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            message,
            key: key.into(),
            position,
            attempt,
            acker: Some(acker),
        }
    }

    pub fn message(&self) -> &M {
        &self.message
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn position(&self) -> &DeliveryPosition {
        &self.position
    }

    /// How many times this message has been handed out to the group (1 on
    /// first delivery).
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_redelivery(&self) -> bool {
        self.attempt > 1
    }

    pub fn ack(mut self) -> Result<(), ChannelError> {
        match self.acker.take() {
            Some(acker) => acker.ack(),
            None => Ok(()),
        }
    }

    pub fn nack(mut self) -> Result<(), ChannelError> {
        match self.acker.take() {
            Some(acker) => acker.nack(),
            None => Ok(()),
        }
    }
}

impl<M> Drop for Delivery<M> {
    fn drop(&mut self) {
        if let Some(acker) = self.acker.take() {
            if let Err(e) = acker.nack() {
                tracing::warn!(position = %self.position, error = %e, "failed to release dropped delivery");
            }
        }
    }
}

impl<M: core::fmt::Debug> core::fmt::Debug for Delivery<M> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .field("key", &self.key)
            .field("position", &self.position)
            .field("attempt", &self.attempt)
            .field("settled", &self.acker.is_none())
            .finish()
    }
}
