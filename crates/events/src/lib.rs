//! Ordered, partitioned event channel (mechanics only).
//!
//! Messages are published under a key; every message sharing a key lands on
//! the same partition and is delivered to one consumer of a group at a time,
//! in publish order. Delivery is at-least-once: a delivery that is nacked or
//! dropped before `ack()` is handed out again.

pub mod channel;
pub mod delivery;
pub mod in_memory;
pub mod partition;
pub mod subscription;

pub use channel::{ChannelError, ChannelSpec, DeliveryPosition, EventChannel, StreamOffset};
pub use delivery::{Acknowledger, Delivery};
pub use in_memory::InMemoryChannel;
pub use partition::partition_for;
pub use subscription::Subscription;
