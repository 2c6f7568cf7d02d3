//! Event channel abstraction.
//!
//! An `EventChannel` is the transport between the submitter, the workers and
//! the reconciler. It is intentionally small:
//!
//! - **Keyed publish**: the key picks the partition, so all messages for one
//!   job share a partition and keep their relative order.
//! - **Consumer groups**: every group sees every message; inside a group each
//!   partition has at most one unsettled delivery at a time.
//! - **At-least-once**: an unsettled or nacked delivery is redelivered before
//!   anything behind it on the same partition.
//! - **Delayed visibility**: `publish_delayed` holds a message back until its
//!   delay has elapsed (retry backoff).
//!
//! ```text
//! submitter ──publish(job-requests, job_id)──▶ [p0][p1][p2] ──▶ workers (group job-workers)
//! workers   ──publish(job-status,   job_id)──▶ [p0][p1][p2] ──▶ reconciler (group job-reconciler)
//! ```

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::subscription::Subscription;

/// Retention used when a channel is auto-declared by its first publish.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Declaration of a named channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
    pub name: String,
    pub partitions: u32,
    pub retention: Duration,
}

impl ChannelSpec {
    pub fn new(name: impl Into<String>, partitions: u32, retention: Duration) -> Self {
        Self {
            name: name.into(),
            partitions: partitions.max(1),
            retention,
        }
    }

    /// Single-partition channel with the default retention.
    pub fn single(name: impl Into<String>) -> Self {
        Self::new(name, 1, DEFAULT_RETENTION)
    }
}

/// Position of a message inside its channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StreamOffset {
    /// Offset in an in-process partition log.
    Sequence(u64),
    /// Backend-assigned entry id (e.g. a Redis stream id).
    EntryId(String),
    /// Accepted, but only placed on a partition once its delay elapses.
    Deferred,
}

/// Completion signal of a successful publish.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryPosition {
    pub channel: String,
    pub partition: u32,
    pub offset: StreamOffset,
}

impl DeliveryPosition {
    pub fn new(channel: impl Into<String>, partition: u32, offset: StreamOffset) -> Self {
        Self {
            channel: channel.into(),
            partition,
            offset,
        }
    }
}

impl core::fmt::Display for DeliveryPosition {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match &self.offset {
            StreamOffset::Sequence(n) => write!(f, "{}/{}@{}", self.channel, self.partition, n),
            StreamOffset::EntryId(id) => write!(f, "{}/{}@{}", self.channel, self.partition, id),
            StreamOffset::Deferred => write!(f, "{}/{}@deferred", self.channel, self.partition),
        }
    }
}

/// Transport-level failure.
///
/// Consumers never see these for message processing; they surface on publish,
/// subscribe and settle, and are recovered by redelivery.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("channel closed")]
    Closed,
}

impl ChannelError {
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }
}

/// Ordered, partitioned publish/subscribe transport.
///
/// `publish` is synchronous from the caller's point of view: `Ok` means the
/// backend accepted the message and carries its position, `Err` means it did
/// not and the caller decides whether to retry.
///
/// Implementations must be `Send + Sync`; publishers on many threads share one
/// channel value.
pub trait EventChannel<M>: Send + Sync {
    /// Declare a channel with its partition count and retention (idempotent).
    fn declare(&self, spec: &ChannelSpec) -> Result<(), ChannelError>;

    fn publish(&self, channel: &str, key: &str, message: M)
    -> Result<DeliveryPosition, ChannelError>;

    /// Publish a message that becomes visible to consumers after `delay`.
    fn publish_delayed(
        &self,
        channel: &str,
        key: &str,
        message: M,
        delay: Duration,
    ) -> Result<DeliveryPosition, ChannelError>;

    /// Join consumer group `group` on `channel`.
    fn subscribe(&self, channel: &str, group: &str) -> Result<Subscription<M>, ChannelError>;
}

impl<M, C> EventChannel<M> for Arc<C>
where
    C: EventChannel<M> + ?Sized,
{
    fn declare(&self, spec: &ChannelSpec) -> Result<(), ChannelError> {
        (**self).declare(spec)
    }

    fn publish(
        &self,
        channel: &str,
        key: &str,
        message: M,
    ) -> Result<DeliveryPosition, ChannelError> {
        (**self).publish(channel, key, message)
    }

    fn publish_delayed(
        &self,
        channel: &str,
        key: &str,
        message: M,
        delay: Duration,
    ) -> Result<DeliveryPosition, ChannelError> {
        (**self).publish_delayed(channel, key, message, delay)
    }

    fn subscribe(&self, channel: &str, group: &str) -> Result<Subscription<M>, ChannelError> {
        (**self).subscribe(channel, group)
    }
}
