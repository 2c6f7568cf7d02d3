//! In-memory partitioned channel for tests/dev.
//!
//! - No IO / no async
//! - Per-partition append-only logs with one cursor per (group, partition)
//! - At most one unsettled delivery per (group, partition); a nack or drop
//!   hands the same offset out again with a bumped attempt count
//! - Delayed messages sit in a schedule and are appended once due

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use crate::channel::{
    ChannelError, ChannelSpec, DeliveryPosition, EventChannel, StreamOffset,
};
use crate::delivery::{Acknowledger, Delivery};
use crate::partition::partition_for;
use crate::subscription::Subscription;

/// How long a pump thread blocks before re-checking its shutdown flag.
const PUMP_POLL_INTERVAL: Duration = Duration::from_millis(50);

struct Entry<M> {
    key: String,
    message: M,
    appended_at: Instant,
}

struct Scheduled<M> {
    key: String,
    message: M,
    due: Instant,
}

struct PartitionLog<M> {
    /// Offset of the first retained entry.
    base: u64,
    entries: VecDeque<Entry<M>>,
}

impl<M> PartitionLog<M> {
    fn new() -> Self {
        Self {
            base: 0,
            entries: VecDeque::new(),
        }
    }

    fn end(&self) -> u64 {
        self.base + self.entries.len() as u64
    }

    fn get(&self, offset: u64) -> Option<&Entry<M>> {
        offset
            .checked_sub(self.base)
            .and_then(|i| self.entries.get(i as usize))
    }
}

#[derive(Debug, Clone, Default)]
struct Cursor {
    next: u64,
    in_flight: bool,
    attempts: u32,
}

struct Topic<M> {
    spec: ChannelSpec,
    partitions: Vec<PartitionLog<M>>,
    scheduled: Vec<Scheduled<M>>,
    groups: HashMap<String, Vec<Cursor>>,
    rotation: usize,
}

struct Taken<M> {
    partition: u32,
    offset: u64,
    attempt: u32,
    key: String,
    message: M,
}

impl<M: Clone> Topic<M> {
    fn new(spec: ChannelSpec) -> Self {
        let partitions = (0..spec.partitions).map(|_| PartitionLog::new()).collect();
        Self {
            spec,
            partitions,
            scheduled: Vec::new(),
            groups: HashMap::new(),
            rotation: 0,
        }
    }

    fn partition_of(&self, key: &str) -> u32 {
        partition_for(key, self.partitions.len() as u32)
    }

    fn append(&mut self, key: String, message: M, now: Instant) -> (u32, u64) {
        let partition = self.partition_of(&key);
        let log = &mut self.partitions[partition as usize];
        let offset = log.end();
        log.entries.push_back(Entry {
            key,
            message,
            appended_at: now,
        });
        self.trim(now);
        (partition, offset)
    }

    /// Drop entries older than the retention window. Cursors that fell
    /// behind the retained range skip ahead to its start.
    fn trim(&mut self, now: Instant) {
        let retention = self.spec.retention;
        for (p, log) in self.partitions.iter_mut().enumerate() {
            while log
                .entries
                .front()
                .is_some_and(|e| now.saturating_duration_since(e.appended_at) >= retention)
            {
                log.entries.pop_front();
                log.base += 1;
            }
            for cursors in self.groups.values_mut() {
                let cursor = &mut cursors[p];
                if cursor.next < log.base {
                    *cursor = Cursor {
                        next: log.base,
                        ..Cursor::default()
                    };
                }
            }
        }
    }

    fn promote_due(&mut self, now: Instant) {
        if self.scheduled.iter().all(|s| s.due > now) {
            return;
        }
        let (mut due, pending): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.scheduled).into_iter().partition(|s| s.due <= now);
        self.scheduled = pending;
        due.sort_by_key(|s| s.due);
        for s in due {
            self.append(s.key, s.message, now);
        }
    }

    fn next_due(&self) -> Option<Instant> {
        self.scheduled.iter().map(|s| s.due).min()
    }

    fn join(&mut self, group: &str) {
        if !self.groups.contains_key(group) {
            let cursors = self
                .partitions
                .iter()
                .map(|log| Cursor {
                    next: log.base,
                    ..Cursor::default()
                })
                .collect();
            self.groups.insert(group.to_string(), cursors);
        }
    }

    fn take_next(&mut self, group: &str) -> Option<Taken<M>> {
        let n = self.partitions.len();
        let cursors = self.groups.get_mut(group)?;
        for i in 0..n {
            let p = (self.rotation + i) % n;
            let cursor = &mut cursors[p];
            if cursor.in_flight {
                continue;
            }
            if let Some(entry) = self.partitions[p].get(cursor.next) {
                cursor.in_flight = true;
                cursor.attempts += 1;
                self.rotation = (p + 1) % n;
                return Some(Taken {
                    partition: p as u32,
                    offset: cursor.next,
                    attempt: cursor.attempts,
                    key: entry.key.clone(),
                    message: entry.message.clone(),
                });
            }
        }
        None
    }
}

struct State<M> {
    topics: HashMap<String, Topic<M>>,
    closed: bool,
}

impl<M: Clone> State<M> {
    fn topic_mut(&mut self, channel: &str) -> &mut Topic<M> {
        self.topics
            .entry(channel.to_string())
            .or_insert_with(|| Topic::new(ChannelSpec::single(channel)))
    }
}

struct Shared<M> {
    state: Mutex<State<M>>,
    wakeup: Condvar,
}

impl<M> Shared<M> {
    fn lock(&self) -> Result<MutexGuard<'_, State<M>>, ChannelError> {
        self.state
            .lock()
            .map_err(|_| ChannelError::transport("in-memory channel lock poisoned"))
    }
}

struct InMemoryAcker<M> {
    shared: Arc<Shared<M>>,
    channel: String,
    group: String,
    partition: u32,
    offset: u64,
}

impl<M> InMemoryAcker<M> {
    fn settle(&self, advance: bool) -> Result<(), ChannelError> {
        let mut state = self.shared.lock()?;
        let cursor = state
            .topics
            .get_mut(&self.channel)
            .and_then(|t| t.groups.get_mut(&self.group))
            .and_then(|c| c.get_mut(self.partition as usize));

        // A cursor that moved on (retention skip) makes this a stale settle.
        if let Some(cursor) = cursor {
            if cursor.in_flight && cursor.next == self.offset {
                cursor.in_flight = false;
                if advance {
                    cursor.next += 1;
                    cursor.attempts = 0;
                }
            }
        }
        drop(state);
        self.shared.wakeup.notify_all();
        Ok(())
    }
}

impl<M: Send + 'static> Acknowledger for InMemoryAcker<M> {
    fn ack(self: Box<Self>) -> Result<(), ChannelError> {
        self.settle(true)
    }

    fn nack(self: Box<Self>) -> Result<(), ChannelError> {
        self.settle(false)
    }
}

/// In-memory ordered channel.
///
/// Cloning yields another handle to the same channels.
pub struct InMemoryChannel<M> {
    shared: Arc<Shared<M>>,
}

impl<M> Clone for InMemoryChannel<M> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<M> Default for InMemoryChannel<M> {
    fn default() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    topics: HashMap::new(),
                    closed: false,
                }),
                wakeup: Condvar::new(),
            }),
        }
    }
}

impl<M> core::fmt::Debug for InMemoryChannel<M> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InMemoryChannel").finish_non_exhaustive()
    }
}

impl<M> InMemoryChannel<M>
where
    M: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a channel with `specs` already declared.
    pub fn with_channels(specs: &[ChannelSpec]) -> Self {
        let channel = Self::new();
        if let Ok(mut state) = channel.shared.lock() {
            for spec in specs {
                state
                    .topics
                    .entry(spec.name.clone())
                    .or_insert_with(|| Topic::new(spec.clone()));
            }
        }
        channel
    }

    /// Pull the next delivery for `group`, waiting up to `timeout`.
    ///
    /// This is the primitive subscriptions pump from; tests use it to drive
    /// consumers deterministically without threads.
    pub fn poll(
        &self,
        channel: &str,
        group: &str,
        timeout: Duration,
    ) -> Result<Option<Delivery<M>>, ChannelError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.lock()?;

        loop {
            if state.closed {
                return Err(ChannelError::Closed);
            }

            let now = Instant::now();
            let topic = state.topic_mut(channel);
            topic.promote_due(now);
            topic.join(group);

            if let Some(taken) = topic.take_next(group) {
                drop(state);
                let position = DeliveryPosition::new(
                    channel,
                    taken.partition,
                    StreamOffset::Sequence(taken.offset),
                );
                let acker = InMemoryAcker {
                    shared: Arc::clone(&self.shared),
                    channel: channel.to_string(),
                    group: group.to_string(),
                    partition: taken.partition,
                    offset: taken.offset,
                };
                return Ok(Some(Delivery::new(
                    taken.message,
                    taken.key,
                    position,
                    taken.attempt,
                    Box::new(acker),
                )));
            }

            if now >= deadline {
                return Ok(None);
            }
            let mut wait = deadline - now;
            if let Some(due) = topic.next_due() {
                wait = wait.min(due.saturating_duration_since(now).max(Duration::from_millis(1)));
            }

            state = self
                .shared
                .wakeup
                .wait_timeout(state, wait)
                .map_err(|_| ChannelError::transport("in-memory channel lock poisoned"))?
                .0;
        }
    }

    /// Retained messages of `channel`, partition by partition in log order.
    pub fn messages(&self, channel: &str) -> Vec<M> {
        let Ok(state) = self.shared.lock() else {
            return Vec::new();
        };
        state
            .topics
            .get(channel)
            .map(|t| {
                t.partitions
                    .iter()
                    .flat_map(|log| log.entries.iter().map(|e| e.message.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Retained messages published under `key`, in publish order.
    pub fn messages_for_key(&self, channel: &str, key: &str) -> Vec<M> {
        let Ok(state) = self.shared.lock() else {
            return Vec::new();
        };
        let Some(topic) = state.topics.get(channel) else {
            return Vec::new();
        };
        let log = &topic.partitions[topic.partition_of(key) as usize];
        log.entries
            .iter()
            .filter(|e| e.key == key)
            .map(|e| e.message.clone())
            .collect()
    }

    /// Delayed messages not yet visible on `channel`.
    pub fn scheduled_len(&self, channel: &str) -> usize {
        self.shared
            .lock()
            .ok()
            .and_then(|s| s.topics.get(channel).map(|t| t.scheduled.len()))
            .unwrap_or(0)
    }

    /// Messages `group` has not acknowledged yet (visible ones only).
    pub fn backlog(&self, channel: &str, group: &str) -> u64 {
        let Ok(state) = self.shared.lock() else {
            return 0;
        };
        let Some(topic) = state.topics.get(channel) else {
            return 0;
        };
        match topic.groups.get(group) {
            Some(cursors) => topic
                .partitions
                .iter()
                .zip(cursors)
                .map(|(log, c)| log.end().saturating_sub(c.next))
                .sum(),
            None => topic
                .partitions
                .iter()
                .map(|log| log.entries.len() as u64)
                .sum(),
        }
    }

    /// Close every channel: publishes fail and subscriptions disconnect.
    pub fn close(&self) {
        if let Ok(mut state) = self.shared.lock() {
            state.closed = true;
        }
        self.shared.wakeup.notify_all();
    }
}

impl<M> EventChannel<M> for InMemoryChannel<M>
where
    M: Clone + Send + 'static,
{
    fn declare(&self, spec: &ChannelSpec) -> Result<(), ChannelError> {
        let mut state = self.shared.lock()?;
        state
            .topics
            .entry(spec.name.clone())
            .or_insert_with(|| Topic::new(spec.clone()));
        Ok(())
    }

    fn publish(
        &self,
        channel: &str,
        key: &str,
        message: M,
    ) -> Result<DeliveryPosition, ChannelError> {
        let mut state = self.shared.lock()?;
        if state.closed {
            return Err(ChannelError::Closed);
        }
        let (partition, offset) =
            state
                .topic_mut(channel)
                .append(key.to_string(), message, Instant::now());
        drop(state);
        self.shared.wakeup.notify_all();

        Ok(DeliveryPosition::new(
            channel,
            partition,
            StreamOffset::Sequence(offset),
        ))
    }

    fn publish_delayed(
        &self,
        channel: &str,
        key: &str,
        message: M,
        delay: Duration,
    ) -> Result<DeliveryPosition, ChannelError> {
        if delay.is_zero() {
            return self.publish(channel, key, message);
        }

        let mut state = self.shared.lock()?;
        if state.closed {
            return Err(ChannelError::Closed);
        }
        let topic = state.topic_mut(channel);
        let partition = topic.partition_of(key);
        topic.scheduled.push(Scheduled {
            key: key.to_string(),
            message,
            due: Instant::now() + delay,
        });
        drop(state);
        // Sleeping pollers recompute their wait against the new due time.
        self.shared.wakeup.notify_all();

        Ok(DeliveryPosition::new(
            channel,
            partition,
            StreamOffset::Deferred,
        ))
    }

    fn subscribe(&self, channel: &str, group: &str) -> Result<Subscription<M>, ChannelError> {
        {
            let mut state = self.shared.lock()?;
            if state.closed {
                return Err(ChannelError::Closed);
            }
            state.topic_mut(channel).join(group);
        }

        let (tx, rx) = mpsc::sync_channel(0);
        let closed = Arc::new(AtomicBool::new(false));

        let this = self.clone();
        let stop = Arc::clone(&closed);
        let channel_name = channel.to_string();
        let group_name = group.to_string();

        thread::Builder::new()
            .name(format!("{channel}:{group}"))
            .spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    match this.poll(&channel_name, &group_name, PUMP_POLL_INTERVAL) {
                        // A rejected send drops the delivery, which nacks it.
                        Ok(Some(delivery)) => {
                            if tx.send(delivery).is_err() {
                                break;
                            }
                        }
                        Ok(None) => continue,
                        Err(_) => break,
                    }
                }
            })
            .map_err(|e| ChannelError::transport(format!("failed to spawn pump: {e}")))?;

        Ok(Subscription::new(rx, closed))
    }
}
