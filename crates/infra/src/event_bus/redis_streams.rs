//! Redis Streams-backed event channel (durable, at-least-once delivery).
//!
//! ## Architecture
//!
//! - **Partition streams**: `<prefix>:<channel>:<partition>`, one stream per
//!   partition; a message's key picks the partition
//! - **Consumer groups**: `XGROUP CREATE ... MKSTREAM` on every partition stream
//! - **Partition leases**: `<prefix>:<channel>:lease:<group>:<partition>`, taken
//!   with `SET NX PX` and renewed while held, so one consumer of a group reads a
//!   partition at a time
//! - **Takeover**: a new lease owner `XAUTOCLAIM`s the entries its predecessor
//!   left unacknowledged and delivers them before anything new
//! - **Delayed messages**: sorted set `<prefix>:<channel>:delayed` scored by due
//!   time; promoted atomically (`ZREM` + `XADD` in one script) once due
//! - **Retention**: `XADD ... MINID ~ <now - retention>`
//! - **Poison messages**: entries delivered more than `max_deliveries` times,
//!   or that cannot be decoded, move to `<prefix>:<channel>:poison` and are acked
//!
//! Each subscription runs one pump thread that hands out a single delivery and
//! waits for it to be settled before reading further.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use redis::Value;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use jobrelay_events::{
    Acknowledger, ChannelError, ChannelSpec, Delivery, DeliveryPosition, EventChannel,
    StreamOffset, Subscription, partition_for,
};

/// Default key prefix of every stream, set and lease.
pub const DEFAULT_KEY_PREFIX: &str = "jobrelay";

/// Default deliveries of one entry before it is treated as poison.
pub const DEFAULT_MAX_DELIVERIES: u32 = 10;

/// Default partition lease lifetime; renewed every third of it.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(10);

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const RECONNECT_DELAY: Duration = Duration::from_millis(500);
const HANDOFF_INTERVAL: Duration = Duration::from_millis(5);
const SETTLE_CHECK: Duration = Duration::from_millis(250);
const PROMOTE_BATCH: usize = 100;

const PROMOTE_SCRIPT: &str = r"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 1 then
  return redis.call('XADD', KEYS[2], 'MINID', '~', ARGV[4], '*', 'key', ARGV[2], 'payload', ARGV[3])
end
return false
";

const RENEW_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
";

const RELEASE_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
";

fn transport(op: &str, e: redis::RedisError) -> ChannelError {
    ChannelError::transport(format!("{op} failed: {e}"))
}

fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Oldest entry id kept under `retention`.
fn min_id(retention: Duration) -> String {
    let cutoff = now_ms().saturating_sub(retention.as_millis() as u64);
    format!("{cutoff}-0")
}

/// A delayed message waiting in the sorted set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ScheduledEntry {
    key: String,
    payload: String,
    /// Keeps two identical messages from collapsing into one set member.
    nonce: String,
}

pub struct RedisStreamsChannel<M> {
    client: redis::Client,
    prefix: String,
    max_deliveries: u32,
    lease_ttl: Duration,
    specs: Arc<Mutex<HashMap<String, ChannelSpec>>>,
    _message: PhantomData<fn() -> M>,
}

impl<M> Clone for RedisStreamsChannel<M> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            prefix: self.prefix.clone(),
            max_deliveries: self.max_deliveries,
            lease_ttl: self.lease_ttl,
            specs: Arc::clone(&self.specs),
            _message: PhantomData,
        }
    }
}

impl<M> core::fmt::Debug for RedisStreamsChannel<M> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisStreamsChannel")
            .field("prefix", &self.prefix)
            .field("max_deliveries", &self.max_deliveries)
            .field("lease_ttl", &self.lease_ttl)
            .finish_non_exhaustive()
    }
}

impl<M> RedisStreamsChannel<M> {
    /// Create a channel backend on `redis_url` (e.g. "redis://localhost:6379").
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, ChannelError> {
        let client =
            redis::Client::open(redis_url.as_ref()).map_err(|e| transport("connect", e))?;
        Ok(Self {
            client,
            prefix: DEFAULT_KEY_PREFIX.to_string(),
            max_deliveries: DEFAULT_MAX_DELIVERIES,
            lease_ttl: DEFAULT_LEASE_TTL,
            specs: Arc::new(Mutex::new(HashMap::new())),
            _message: PhantomData,
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_max_deliveries(mut self, max: u32) -> Self {
        self.max_deliveries = max.max(1);
        self
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl.max(Duration::from_millis(300));
        self
    }

    pub fn stream_key(&self, channel: &str, partition: u32) -> String {
        format!("{}:{}:{}", self.prefix, channel, partition)
    }

    fn meta_key(&self, channel: &str) -> String {
        format!("{}:{}:meta", self.prefix, channel)
    }

    fn delayed_key(&self, channel: &str) -> String {
        format!("{}:{}:delayed", self.prefix, channel)
    }

    pub fn poison_key(&self, channel: &str) -> String {
        format!("{}:{}:poison", self.prefix, channel)
    }

    fn lease_key(&self, channel: &str, group: &str, partition: u32) -> String {
        format!("{}:{}:lease:{}:{}", self.prefix, channel, group, partition)
    }

    fn connection(&self) -> Result<redis::Connection, ChannelError> {
        self.client
            .get_connection()
            .map_err(|e| transport("connect", e))
    }

    /// Record the layout in Redis; the first declaration of a channel fixes
    /// its partition count for every process.
    fn declare_on(
        &self,
        conn: &mut redis::Connection,
        spec: &ChannelSpec,
    ) -> Result<ChannelSpec, ChannelError> {
        let meta = self.meta_key(&spec.name);
        let _: i64 = redis::cmd("HSETNX")
            .arg(&meta)
            .arg("partitions")
            .arg(spec.partitions)
            .query(conn)
            .map_err(|e| transport("HSETNX", e))?;
        let _: i64 = redis::cmd("HSET")
            .arg(&meta)
            .arg("retention_ms")
            .arg(spec.retention.as_millis() as u64)
            .query(conn)
            .map_err(|e| transport("HSET", e))?;
        let partitions: Option<u32> = redis::cmd("HGET")
            .arg(&meta)
            .arg("partitions")
            .query(conn)
            .map_err(|e| transport("HGET", e))?;

        let declared = ChannelSpec::new(
            spec.name.clone(),
            partitions.unwrap_or(spec.partitions),
            spec.retention,
        );
        if let Ok(mut specs) = self.specs.lock() {
            specs.insert(declared.name.clone(), declared.clone());
        }
        Ok(declared)
    }

    /// Layout of `channel`: cached, recorded in Redis, or auto-declared.
    fn spec_of(
        &self,
        conn: &mut redis::Connection,
        channel: &str,
    ) -> Result<ChannelSpec, ChannelError> {
        if let Some(spec) = self.specs.lock().ok().and_then(|s| s.get(channel).cloned()) {
            return Ok(spec);
        }

        let (partitions, retention_ms): (Option<u32>, Option<u64>) = redis::cmd("HMGET")
            .arg(self.meta_key(channel))
            .arg("partitions")
            .arg("retention_ms")
            .query(conn)
            .map_err(|e| transport("HMGET", e))?;

        let mut spec = ChannelSpec::single(channel);
        if let Some(ms) = retention_ms {
            spec.retention = Duration::from_millis(ms);
        }
        match partitions {
            Some(n) => {
                spec.partitions = n.max(1);
                if let Ok(mut specs) = self.specs.lock() {
                    specs.insert(channel.to_string(), spec.clone());
                }
                Ok(spec)
            }
            None => {
                debug!(channel, "auto-declaring channel");
                self.declare_on(conn, &spec)
            }
        }
    }

    fn ensure_group(
        &self,
        conn: &mut redis::Connection,
        stream: &str,
        group: &str,
    ) -> Result<(), ChannelError> {
        // "0": a new group starts from the beginning of the retained stream.
        let created: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query(conn);
        match created {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(transport("XGROUP CREATE", e)),
        }
    }

    /// Move due delayed messages onto their partition streams.
    fn promote_due(
        &self,
        conn: &mut redis::Connection,
        spec: &ChannelSpec,
    ) -> Result<usize, ChannelError> {
        let delayed = self.delayed_key(&spec.name);
        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(&delayed)
            .arg("-inf")
            .arg(now_ms())
            .arg("LIMIT")
            .arg(0)
            .arg(PROMOTE_BATCH)
            .query(conn)
            .map_err(|e| transport("ZRANGEBYSCORE", e))?;

        let script = redis::Script::new(PROMOTE_SCRIPT);
        let mut promoted = 0;
        for member in due {
            let entry: ScheduledEntry = match serde_json::from_str(&member) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(channel = %spec.name, error = %e, "dropping undecodable delayed entry");
                    let _: redis::RedisResult<i64> =
                        redis::cmd("ZREM").arg(&delayed).arg(&member).query(conn);
                    continue;
                }
            };
            let partition = partition_for(&entry.key, spec.partitions);
            let id: Option<String> = script
                .key(&delayed)
                .key(self.stream_key(&spec.name, partition))
                .arg(&member)
                .arg(&entry.key)
                .arg(&entry.payload)
                .arg(min_id(spec.retention))
                .invoke(conn)
                .map_err(|e| transport("promote delayed", e))?;
            if id.is_some() {
                promoted += 1;
            }
        }
        if promoted > 0 {
            debug!(channel = %spec.name, promoted, "promoted delayed messages");
        }
        Ok(promoted)
    }
}

impl<M> EventChannel<M> for RedisStreamsChannel<M>
where
    M: Serialize + DeserializeOwned + Send + 'static,
{
    fn declare(&self, spec: &ChannelSpec) -> Result<(), ChannelError> {
        let mut conn = self.connection()?;
        let declared = self.declare_on(&mut conn, spec)?;
        if declared.partitions != spec.partitions {
            warn!(
                channel = %spec.name,
                requested = spec.partitions,
                existing = declared.partitions,
                "channel already declared with a different partition count; keeping existing"
            );
        }
        Ok(())
    }

    #[instrument(skip_all, fields(channel = %channel, key = %key), err)]
    fn publish(
        &self,
        channel: &str,
        key: &str,
        message: M,
    ) -> Result<DeliveryPosition, ChannelError> {
        let payload = serde_json::to_string(&message)
            .map_err(|e| ChannelError::Serialization(e.to_string()))?;

        let mut conn = self.connection()?;
        let spec = self.spec_of(&mut conn, channel)?;
        let partition = partition_for(key, spec.partitions);

        let id: String = redis::cmd("XADD")
            .arg(self.stream_key(channel, partition))
            .arg("MINID")
            .arg("~")
            .arg(min_id(spec.retention))
            .arg("*")
            .arg("key")
            .arg(key)
            .arg("payload")
            .arg(&payload)
            .query(&mut conn)
            .map_err(|e| transport("XADD", e))?;

        Ok(DeliveryPosition::new(
            channel,
            partition,
            StreamOffset::EntryId(id),
        ))
    }

    #[instrument(skip_all, fields(channel = %channel, key = %key, delay_ms = delay.as_millis() as u64), err)]
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

        let entry = ScheduledEntry {
            key: key.to_string(),
            payload: serde_json::to_string(&message)
                .map_err(|e| ChannelError::Serialization(e.to_string()))?,
            nonce: uuid::Uuid::now_v7().to_string(),
        };
        let member = serde_json::to_string(&entry)
            .map_err(|e| ChannelError::Serialization(e.to_string()))?;

        let mut conn = self.connection()?;
        let spec = self.spec_of(&mut conn, channel)?;
        let due = now_ms() + delay.as_millis() as u64;

        let _: i64 = redis::cmd("ZADD")
            .arg(self.delayed_key(channel))
            .arg(due)
            .arg(&member)
            .query(&mut conn)
            .map_err(|e| transport("ZADD", e))?;

        Ok(DeliveryPosition::new(
            channel,
            partition_for(key, spec.partitions),
            StreamOffset::Deferred,
        ))
    }

    fn subscribe(&self, channel: &str, group: &str) -> Result<Subscription<M>, ChannelError> {
        let mut conn = self.connection()?;
        let spec = self.spec_of(&mut conn, channel)?;
        for p in 0..spec.partitions {
            self.ensure_group(&mut conn, &self.stream_key(channel, p), group)?;
        }

        let (tx, rx) = mpsc::sync_channel(0);
        let closed = Arc::new(AtomicBool::new(false));
        let consumer = format!("{group}-{}", uuid::Uuid::now_v7());

        let pump = Pump {
            backend: self.clone(),
            spec,
            group: group.to_string(),
            consumer: consumer.clone(),
            leases: HashMap::new(),
            last_acquire: None,
            cursor: 0,
            tx,
            closed: Arc::clone(&closed),
        };

        thread::Builder::new()
            .name(format!("{channel}:{group}"))
            .spawn(move || pump.run())
            .map_err(|e| ChannelError::transport(format!("failed to spawn pump thread: {e}")))?;

        info!(channel, group, consumer = %consumer, "subscribed");
        Ok(Subscription::new(rx, closed))
    }
}

/// One stream entry as read from Redis. `fields` is `None` when the entry was
/// trimmed away while still pending.
#[derive(Debug, Clone, PartialEq)]
struct RawEntry {
    id: String,
    fields: Option<HashMap<String, String>>,
}

impl RawEntry {
    fn field(&self, name: &str) -> Option<&str> {
        self.fields.as_ref()?.get(name).map(String::as_str)
    }
}

fn as_string(v: &Value) -> Option<String> {
    match v {
        Value::Data(data) => Some(String::from_utf8_lossy(data).to_string()),
        Value::Status(s) => Some(s.clone()),
        _ => None,
    }
}

/// Entry format: `[id, [field1, value1, field2, value2, ...]]`.
fn parse_entry(v: &Value) -> Option<RawEntry> {
    let Value::Bulk(parts) = v else {
        return None;
    };
    let id = as_string(parts.first()?)?;
    let fields = match parts.get(1) {
        Some(Value::Bulk(kv)) => Some(
            kv.chunks(2)
                .filter_map(|pair| match pair {
                    [k, v] => Some((as_string(k)?, as_string(v)?)),
                    _ => None,
                })
                .collect(),
        ),
        _ => None,
    };
    Some(RawEntry { id, fields })
}

/// `XREADGROUP` reply: `[[stream, [entry, ...]], ...]` or nil.
fn parse_read_reply(v: &Value) -> Vec<RawEntry> {
    let Value::Bulk(streams) = v else {
        return Vec::new();
    };
    streams
        .iter()
        .filter_map(|s| match s {
            Value::Bulk(pair) => match pair.get(1) {
                Some(Value::Bulk(entries)) => Some(entries.iter().filter_map(parse_entry)),
                _ => None,
            },
            _ => None,
        })
        .flatten()
        .collect()
}

/// Extended `XPENDING` reply: `[[id, consumer, idle_ms, deliveries]]`.
fn parse_delivery_count(v: &Value) -> Option<u32> {
    let Value::Bulk(rows) = v else {
        return None;
    };
    let Value::Bulk(cols) = rows.first()? else {
        return None;
    };
    match cols.get(3)? {
        Value::Int(n) => u32::try_from(*n).ok(),
        _ => None,
    }
}

/// `XAUTOCLAIM` reply: `[next_cursor, [entry, ...], ...]`.
fn parse_autoclaim_cursor(v: &Value) -> Option<String> {
    let Value::Bulk(parts) = v else {
        return None;
    };
    as_string(parts.first()?)
}

/// Settles one entry. A nack re-claims the entry for the same consumer, which
/// bumps its delivery count and keeps it at the head of the consumer's
/// pending list.
struct RedisAcker {
    client: redis::Client,
    stream: String,
    group: String,
    consumer: String,
    id: String,
    settled: mpsc::Sender<()>,
}

impl RedisAcker {
    fn xack(&self) -> Result<(), ChannelError> {
        let mut conn = self
            .client
            .get_connection()
            .map_err(|e| transport("connect", e))?;
        let _: i64 = redis::cmd("XACK")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(&self.id)
            .query(&mut conn)
            .map_err(|e| transport("XACK", e))?;
        Ok(())
    }

    fn reclaim(&self) -> Result<(), ChannelError> {
        let mut conn = self
            .client
            .get_connection()
            .map_err(|e| transport("connect", e))?;
        let _: Value = redis::cmd("XCLAIM")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(0)
            .arg(&self.id)
            .query(&mut conn)
            .map_err(|e| transport("XCLAIM", e))?;
        Ok(())
    }
}

impl Acknowledger for RedisAcker {
    fn ack(self: Box<Self>) -> Result<(), ChannelError> {
        let result = self.xack();
        let _ = self.settled.send(());
        result
    }

    fn nack(self: Box<Self>) -> Result<(), ChannelError> {
        let result = self.reclaim();
        let _ = self.settled.send(());
        result
    }
}

enum Step {
    Delivered,
    Idle,
    Stopped,
}

/// Background reader of one subscription.
struct Pump<M> {
    backend: RedisStreamsChannel<M>,
    spec: ChannelSpec,
    group: String,
    consumer: String,
    /// Owned partitions and when their lease was last renewed.
    leases: HashMap<u32, Instant>,
    last_acquire: Option<Instant>,
    cursor: usize,
    tx: mpsc::SyncSender<Delivery<M>>,
    closed: Arc<AtomicBool>,
}

impl<M> Pump<M>
where
    M: DeserializeOwned + Send + 'static,
{
    fn run(mut self) {
        let mut conn: Option<redis::Connection> = None;

        while !self.closed.load(Ordering::SeqCst) {
            if conn.is_none() {
                match self.backend.client.get_connection() {
                    Ok(c) => conn = Some(c),
                    Err(e) => {
                        warn!(channel = %self.spec.name, error = %e, "redis unavailable, retrying");
                        thread::sleep(RECONNECT_DELAY);
                        continue;
                    }
                }
            }
            let Some(c) = conn.as_mut() else {
                continue;
            };

            match self.step(c) {
                Ok(Step::Delivered) => {}
                Ok(Step::Idle) => thread::sleep(POLL_INTERVAL),
                Ok(Step::Stopped) => break,
                Err(e) => {
                    error!(channel = %self.spec.name, group = %self.group, error = %e, "stream read failed");
                    conn = None;
                    thread::sleep(RECONNECT_DELAY);
                }
            }
        }

        if let Some(c) = conn.as_mut() {
            self.release_leases(c);
        }
        debug!(channel = %self.spec.name, consumer = %self.consumer, "pump stopped");
    }

    fn step(&mut self, conn: &mut redis::Connection) -> Result<Step, ChannelError> {
        self.backend.promote_due(conn, &self.spec)?;
        self.maintain_leases(conn)?;

        let mut owned: Vec<u32> = self.leases.keys().copied().collect();
        if owned.is_empty() {
            return Ok(Step::Idle);
        }
        owned.sort_unstable();
        self.cursor = (self.cursor + 1) % owned.len();
        owned.rotate_left(self.cursor);

        for partition in owned {
            if let Some(entry) = self.next_entry(conn, partition)? {
                return self.deliver(conn, partition, entry);
            }
        }
        Ok(Step::Idle)
    }

    fn lease_ttl_ms(&self) -> u64 {
        self.backend.lease_ttl.as_millis() as u64
    }

    /// Renew held leases and, now and then, try to pick up free partitions.
    fn maintain_leases(&mut self, conn: &mut redis::Connection) -> Result<(), ChannelError> {
        let renew_every = self.backend.lease_ttl / 3;
        let renew = redis::Script::new(RENEW_SCRIPT);

        let held: Vec<(u32, Instant)> = self.leases.iter().map(|(p, t)| (*p, *t)).collect();
        for (partition, renewed) in held {
            if renewed.elapsed() < renew_every {
                continue;
            }
            let kept: i64 = renew
                .key(self.backend.lease_key(&self.spec.name, &self.group, partition))
                .arg(&self.consumer)
                .arg(self.lease_ttl_ms())
                .invoke(conn)
                .map_err(|e| transport("renew lease", e))?;
            if kept == 1 {
                self.leases.insert(partition, Instant::now());
            } else {
                warn!(channel = %self.spec.name, partition, "partition lease lost");
                self.leases.remove(&partition);
            }
        }

        if self.last_acquire.is_some_and(|t| t.elapsed() < renew_every) {
            return Ok(());
        }
        self.last_acquire = Some(Instant::now());

        for partition in 0..self.spec.partitions {
            if self.leases.contains_key(&partition) {
                continue;
            }
            let acquired: Option<String> = redis::cmd("SET")
                .arg(self.backend.lease_key(&self.spec.name, &self.group, partition))
                .arg(&self.consumer)
                .arg("NX")
                .arg("PX")
                .arg(self.lease_ttl_ms())
                .query(conn)
                .map_err(|e| transport("acquire lease", e))?;
            if acquired.is_some() {
                debug!(channel = %self.spec.name, group = %self.group, partition, "partition lease acquired");
                self.leases.insert(partition, Instant::now());
                self.take_over(conn, partition)?;
            }
        }
        Ok(())
    }

    /// Claim whatever a previous owner left pending on `partition`.
    fn take_over(&self, conn: &mut redis::Connection, partition: u32) -> Result<(), ChannelError> {
        let stream = self.backend.stream_key(&self.spec.name, partition);
        let mut cursor = "0-0".to_string();
        loop {
            let reply: Value = redis::cmd("XAUTOCLAIM")
                .arg(&stream)
                .arg(&self.group)
                .arg(&self.consumer)
                .arg(0)
                .arg(&cursor)
                .arg("COUNT")
                .arg(PROMOTE_BATCH)
                .query(conn)
                .map_err(|e| transport("XAUTOCLAIM", e))?;
            match parse_autoclaim_cursor(&reply) {
                Some(next) if next != "0-0" => cursor = next,
                _ => return Ok(()),
            }
        }
    }

    fn read(
        &self,
        conn: &mut redis::Connection,
        stream: &str,
        from: &str,
    ) -> Result<Option<RawEntry>, ChannelError> {
        let reply: Value = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(1)
            .arg("STREAMS")
            .arg(stream)
            .arg(from)
            .query(conn)
            .map_err(|e| transport("XREADGROUP", e))?;
        Ok(parse_read_reply(&reply).into_iter().next())
    }

    /// Own pending entries (nacked or taken over) come before new ones.
    fn next_entry(
        &self,
        conn: &mut redis::Connection,
        partition: u32,
    ) -> Result<Option<RawEntry>, ChannelError> {
        let stream = self.backend.stream_key(&self.spec.name, partition);
        match self.read(conn, &stream, "0")? {
            Some(entry) => Ok(Some(entry)),
            None => self.read(conn, &stream, ">"),
        }
    }

    fn delivery_count(
        &self,
        conn: &mut redis::Connection,
        stream: &str,
        id: &str,
    ) -> Result<u32, ChannelError> {
        let reply: Value = redis::cmd("XPENDING")
            .arg(stream)
            .arg(&self.group)
            .arg(id)
            .arg(id)
            .arg(1)
            .query(conn)
            .map_err(|e| transport("XPENDING", e))?;
        Ok(parse_delivery_count(&reply).unwrap_or(1).max(1))
    }

    fn xack(&self, conn: &mut redis::Connection, stream: &str, id: &str) -> Result<(), ChannelError> {
        let _: i64 = redis::cmd("XACK")
            .arg(stream)
            .arg(&self.group)
            .arg(id)
            .query(conn)
            .map_err(|e| transport("XACK", e))?;
        Ok(())
    }

    /// Park an entry that cannot be processed and ack it.
    fn poison(
        &self,
        conn: &mut redis::Connection,
        stream: &str,
        entry: &RawEntry,
        deliveries: u32,
        reason: &str,
    ) -> Result<(), ChannelError> {
        let _: String = redis::cmd("XADD")
            .arg(self.backend.poison_key(&self.spec.name))
            .arg("*")
            .arg("source")
            .arg(stream)
            .arg("entry_id")
            .arg(&entry.id)
            .arg("group")
            .arg(&self.group)
            .arg("deliveries")
            .arg(deliveries)
            .arg("reason")
            .arg(reason)
            .arg("key")
            .arg(entry.field("key").unwrap_or(""))
            .arg("payload")
            .arg(entry.field("payload").unwrap_or(""))
            .arg("failed_at")
            .arg(chrono::Utc::now().to_rfc3339())
            .query(conn)
            .map_err(|e| transport("poison XADD", e))?;
        self.xack(conn, stream, &entry.id)?;

        warn!(
            channel = %self.spec.name,
            group = %self.group,
            entry_id = %entry.id,
            deliveries,
            reason,
            "message moved to poison stream"
        );
        Ok(())
    }

    fn deliver(
        &mut self,
        conn: &mut redis::Connection,
        partition: u32,
        entry: RawEntry,
    ) -> Result<Step, ChannelError> {
        let stream = self.backend.stream_key(&self.spec.name, partition);

        if entry.fields.is_none() {
            // Trimmed by retention while pending; nothing left to deliver.
            self.xack(conn, &stream, &entry.id)?;
            return Ok(Step::Delivered);
        }

        let attempt = self.delivery_count(conn, &stream, &entry.id)?;
        if attempt > self.backend.max_deliveries {
            self.poison(conn, &stream, &entry, attempt, "max deliveries exceeded")?;
            return Ok(Step::Delivered);
        }

        let decoded = entry
            .field("payload")
            .ok_or_else(|| "missing payload field".to_string())
            .and_then(|p| serde_json::from_str::<M>(p).map_err(|e| e.to_string()));
        let message = match decoded {
            Ok(message) => message,
            Err(reason) => {
                self.poison(conn, &stream, &entry, attempt, &format!("undecodable: {reason}"))?;
                return Ok(Step::Delivered);
            }
        };

        let (settled_tx, settled_rx) = mpsc::channel();
        let acker = RedisAcker {
            client: self.backend.client.clone(),
            stream,
            group: self.group.clone(),
            consumer: self.consumer.clone(),
            id: entry.id.clone(),
            settled: settled_tx,
        };
        let key = entry.field("key").unwrap_or_default().to_string();
        let position = DeliveryPosition::new(
            self.spec.name.clone(),
            partition,
            StreamOffset::EntryId(entry.id),
        );
        let mut delivery = Delivery::new(message, key, position, attempt, Box::new(acker));

        // Hand off without blocking lease renewal.
        loop {
            match self.tx.try_send(delivery) {
                Ok(()) => break,
                Err(mpsc::TrySendError::Full(d)) => {
                    if self.closed.load(Ordering::SeqCst) {
                        return Ok(Step::Stopped);
                    }
                    delivery = d;
                    self.maintain_leases(conn)?;
                    thread::sleep(HANDOFF_INTERVAL);
                }
                Err(mpsc::TrySendError::Disconnected(_)) => return Ok(Step::Stopped),
            }
        }

        // One unsettled delivery per subscription at a time.
        loop {
            match settled_rx.recv_timeout(SETTLE_CHECK) {
                Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => return Ok(Step::Delivered),
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    if self.closed.load(Ordering::SeqCst) {
                        return Ok(Step::Stopped);
                    }
                    self.maintain_leases(conn)?;
                }
            }
        }
    }

    fn release_leases(&mut self, conn: &mut redis::Connection) {
        let release = redis::Script::new(RELEASE_SCRIPT);
        for partition in self.leases.keys().copied().collect::<Vec<_>>() {
            let released: redis::RedisResult<i64> = release
                .key(self.backend.lease_key(&self.spec.name, &self.group, partition))
                .arg(&self.consumer)
                .invoke(conn);
            if let Err(e) = released {
                warn!(partition, error = %e, "failed to release partition lease");
            }
        }
        self.leases.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(s: &str) -> Value {
        Value::Data(s.as_bytes().to_vec())
    }

    #[test]
    fn parses_xreadgroup_reply() {
        let reply = Value::Bulk(vec![Value::Bulk(vec![
            data("jobrelay:job-status:0"),
            Value::Bulk(vec![Value::Bulk(vec![
                data("1700000000000-0"),
                Value::Bulk(vec![data("key"), data("job-1"), data("payload"), data("{}")]),
            ])]),
        ])]);

        let entries = parse_read_reply(&reply);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "1700000000000-0");
        assert_eq!(entries[0].field("key"), Some("job-1"));
        assert_eq!(entries[0].field("payload"), Some("{}"));
    }

    #[test]
    fn trimmed_pending_entry_has_no_fields() {
        let reply = Value::Bulk(vec![Value::Bulk(vec![
            data("s"),
            Value::Bulk(vec![Value::Bulk(vec![data("1-0"), Value::Nil])]),
        ])]);
        let entries = parse_read_reply(&reply);
        assert_eq!(entries[0].fields, None);
        assert!(parse_read_reply(&Value::Nil).is_empty());
    }

    #[test]
    fn parses_pending_and_autoclaim_replies() {
        let pending = Value::Bulk(vec![Value::Bulk(vec![
            data("1-0"),
            data("job-workers-a"),
            Value::Int(1200),
            Value::Int(3),
        ])]);
        assert_eq!(parse_delivery_count(&pending), Some(3));
        assert_eq!(parse_delivery_count(&Value::Bulk(vec![])), None);

        let autoclaim = Value::Bulk(vec![data("0-0"), Value::Bulk(vec![]), Value::Bulk(vec![])]);
        assert_eq!(parse_autoclaim_cursor(&autoclaim).as_deref(), Some("0-0"));
    }

    #[test]
    fn key_layout() {
        let ch: RedisStreamsChannel<String> = RedisStreamsChannel::new("redis://127.0.0.1:6379")
            .unwrap()
            .with_prefix("test");
        assert_eq!(ch.stream_key("job-requests", 2), "test:job-requests:2");
        assert_eq!(ch.poison_key("job-requests"), "test:job-requests:poison");
        assert_eq!(
            ch.lease_key("job-requests", "job-workers", 1),
            "test:job-requests:lease:job-workers:1"
        );
    }

    #[test]
    fn min_id_is_behind_now_by_retention() {
        let id = min_id(Duration::from_secs(60));
        let ms: u64 = id.trim_end_matches("-0").parse().unwrap();
        assert!(now_ms() - ms >= 60_000);
    }

    /// Needs a running Redis: `JOBRELAY_TEST_REDIS_URL=... cargo test -- --ignored`.
    #[test]
    #[ignore]
    fn delivers_in_key_order_and_redelivers_nacked() {
        let url = std::env::var("JOBRELAY_TEST_REDIS_URL")
            .expect("JOBRELAY_TEST_REDIS_URL must point at a Redis server");
        let prefix = format!("jobrelay-test-{}", uuid::Uuid::now_v7());
        let ch: RedisStreamsChannel<u32> = RedisStreamsChannel::new(&url)
            .unwrap()
            .with_prefix(prefix)
            .with_lease_ttl(Duration::from_secs(2));
        ch.declare(&ChannelSpec::new("numbers", 2, Duration::from_secs(3600)))
            .unwrap();

        for n in 1..=3 {
            ch.publish("numbers", "k", n).unwrap();
        }

        let sub = ch.subscribe("numbers", "g").unwrap();
        let first = sub.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(*first.message(), 1);
        first.nack().unwrap();

        let again = sub.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(*again.message(), 1);
        assert_eq!(again.attempt(), 2);
        again.ack().unwrap();

        for expected in 2..=3 {
            let d = sub.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(*d.message(), expected);
            d.ack().unwrap();
        }
    }
}
