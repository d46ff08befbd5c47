//! Append-only, per-aggregate-versioned event log with snapshots, compaction,
//! pruning, and live streaming.
//!
//! The reference implementation is in-memory; anything that needs durability
//! implements [`EventStore`] over its own storage and every consumer (replay,
//! projections, external subscribers) keeps working unchanged.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::EventStoreConfig,
    error::{EventError, Result},
    event::{Event, EventType},
    snowflake::EventIdGenerator,
};

/// Derived rollup per aggregate. Mutated only by the store as a side effect
/// of appends, snapshots, compaction, and pruning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateInfo {
    pub aggregate_id: String,
    pub aggregate_type: String,
    pub version: u64,
    pub event_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_event: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_event: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_snapshot: Option<DateTime<Utc>>,
    /// Approximate encoded size of all retained events, in bytes.
    pub size: u64,
}

/// Materialized aggregate state at a specific version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub aggregate_id: String,
    pub aggregate_type: String,
    pub version: u64,
    pub data: Value,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub size: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CompactionStats {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_compaction: Option<DateTime<Utc>>,
    pub compactions_count: u64,
    pub events_compacted: u64,
    pub space_reclaimed: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EventStoreStats {
    pub total_events: u64,
    pub total_aggregates: u64,
    pub events_by_type: HashMap<String, u64>,
    pub store_size: u64,
    pub write_operations: u64,
    pub read_operations: u64,
    pub stream_operations: u64,
    pub snapshot_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_event: Option<DateTime<Utc>>,
    pub average_event_size: f64,
    pub compaction_stats: CompactionStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventStoreInfo {
    pub store_type: &'static str,
    pub version: &'static str,
    pub node_id: String,
    pub started_at: DateTime<Utc>,
    pub supported_features: Vec<&'static str>,
    pub configuration: EventStoreConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventStoreHealth {
    pub status: &'static str,
    pub store_type: &'static str,
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_count: u64,
    pub store_size: u64,
    pub total_aggregates: u64,
    pub write_operations: u64,
    pub read_operations: u64,
    pub snapshot_count: u64,
}

/// Consumer side of a live event stream.
///
/// The producing store never blocks on a slow consumer: once the stream's
/// internal queue is full, further events are dropped for this stream (with a
/// warning) until the consumer catches up. Dropping the stream cancels it.
#[derive(Debug)]
pub struct EventStream {
    receiver: mpsc::Receiver<Event>,
}

impl EventStream {
    fn new(receiver: mpsc::Receiver<Event>) -> Self {
        Self { receiver }
    }

    /// Next event, or `None` once the stream has ended (store closed).
    pub async fn next(&mut self) -> Option<Event> {
        self.receiver.recv().await
    }

    /// Non-blocking variant of [`next`](Self::next).
    pub fn try_next(&mut self) -> Option<Event> {
        self.receiver.try_recv().ok()
    }

    /// Stops the stream; buffered events can still be drained with `next`.
    pub fn close(&mut self) {
        self.receiver.close();
    }
}

/// Contract shared by every event log implementation.
///
/// Streaming methods spawn a forwarding task and therefore must be called
/// from within a Tokio runtime.
pub trait EventStore: Send + Sync {
    fn save_events(&self, events: Vec<Event>) -> Result<()>;

    fn save_event(&self, event: Event) -> Result<()> {
        self.save_events(vec![event])
    }

    /// Events for one aggregate with `from_version <= version <= to_version`,
    /// ascending. `to_version == 0` means open-ended.
    fn get_events(&self, aggregate_id: &str, from_version: u64, to_version: u64)
        -> Result<Vec<Event>>;

    fn get_all_events(&self, aggregate_id: &str) -> Result<Vec<Event>>;

    /// Events of one type across all aggregates. `limit == 0` means unbounded.
    fn get_events_by_type(&self, event_type: &EventType, limit: usize) -> Result<Vec<Event>>;

    /// Events with `start <= timestamp < end`. `limit == 0` means unbounded.
    fn get_events_by_time_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Event>>;

    /// Drains the aggregate's stored events from `from_version`, then follows
    /// newly committed events until the stream is dropped or the store closes.
    fn stream_events(&self, aggregate_id: &str, from_version: u64) -> Result<EventStream>;

    /// Like [`stream_events`](Self::stream_events) but across all aggregates,
    /// starting from a point in time.
    fn stream_all_events(&self, from_time: DateTime<Utc>) -> Result<EventStream>;

    /// Live firehose of committed events, no history. This is the
    /// publish/subscribe boundary downstream consumers (cache coherency,
    /// replication, audit) attach to.
    fn subscribe(&self) -> Result<EventStream>;

    fn get_aggregate_info(&self, aggregate_id: &str) -> Result<AggregateInfo>;

    /// Requires a stored event at exactly `version`.
    fn create_snapshot(&self, aggregate_id: &str, version: u64, data: Value) -> Result<()>;

    /// Newest retained snapshot for the aggregate.
    fn get_snapshot(&self, aggregate_id: &str) -> Result<Snapshot>;

    fn get_event_stats(&self) -> Result<EventStoreStats>;

    fn store_info(&self) -> EventStoreInfo;

    fn health(&self) -> EventStoreHealth;

    /// Irreversibly discards events with `version <= target_version`. Returns
    /// the number of events removed.
    fn compact_events(&self, aggregate_id: &str, target_version: u64) -> Result<u64>;

    /// Irreversibly discards events older than `before_time` across all
    /// aggregates, regardless of snapshot coverage. Returns the number of
    /// events removed.
    fn prune_events(&self, before_time: DateTime<Utc>) -> Result<u64>;

    /// Two-phase shutdown: new writes are refused first, then live streams
    /// are released. Idempotent.
    fn close(&self);
}

#[derive(Debug, Clone)]
enum SubscriberFilter {
    All,
    Aggregate(String),
    FromTime(DateTime<Utc>),
}

impl SubscriberFilter {
    fn matches(&self, event: &Event) -> bool {
        match self {
            SubscriberFilter::All => true,
            SubscriberFilter::Aggregate(id) => event.aggregate_id == *id,
            SubscriberFilter::FromTime(from) => event.timestamp >= *from,
        }
    }
}

struct Subscriber {
    id: u64,
    filter: SubscriberFilter,
    sender: mpsc::Sender<Event>,
}

#[derive(Default)]
struct OpCounters {
    writes: AtomicU64,
    reads: AtomicU64,
    streams: AtomicU64,
}

struct StoreInner {
    events: HashMap<String, Vec<Event>>,
    snapshots: HashMap<String, Vec<Snapshot>>,
    metadata: HashMap<String, AggregateInfo>,
    subscribers: Vec<Subscriber>,
    stats: EventStoreStats,
    closed: bool,
}

/// In-memory reference implementation of [`EventStore`].
///
/// All state lives behind one `RwLock`: writes are serialized, reads are
/// shared, and nothing blocks on I/O while holding it.
pub struct MemoryEventStore {
    config: EventStoreConfig,
    node_id: String,
    ids: EventIdGenerator,
    inner: RwLock<StoreInner>,
    ops: OpCounters,
    next_subscriber_id: AtomicU64,
    shutdown: CancellationToken,
    started_at: DateTime<Utc>,
    maintenance: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl MemoryEventStore {
    pub fn new(config: EventStoreConfig) -> Self {
        let ids = match config.node_id {
            Some(node) => EventIdGenerator::new(node),
            None => EventIdGenerator::for_process(),
        };
        let node_id = ids.node_name();
        info!(node_id = %node_id, "in-memory event store initialized");
        Self {
            config,
            node_id,
            ids,
            inner: RwLock::new(StoreInner {
                events: HashMap::new(),
                snapshots: HashMap::new(),
                metadata: HashMap::new(),
                subscribers: Vec::new(),
                stats: EventStoreStats::default(),
                closed: false,
            }),
            ops: OpCounters::default(),
            next_subscriber_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
            started_at: Utc::now(),
            maintenance: Mutex::new(None),
        }
    }

    /// Id factory sharing this store's node identity; feed it to
    /// [`Event::builder`](crate::event::EventBuilder::build).
    pub fn id_generator(&self) -> &EventIdGenerator {
        &self.ids
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Starts the opt-in maintenance task: TTL pruning when `event_ttl` is
    /// configured, and auto-compaction of aggregates whose retained event
    /// count exceeds `compaction_threshold`, up to their newest snapshot.
    /// Must be called from within a Tokio runtime. Idempotent.
    pub fn spawn_maintenance(self: &Arc<Self>) {
        let mut guard = self.maintenance.lock();
        if guard.is_some() {
            return;
        }
        let store = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        let period = self.config.maintenance_interval.max(Duration::from_millis(10));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("event store maintenance stopped");
                        return;
                    }
                    _ = ticker.tick() => {}
                }
                let Some(store) = store.upgrade() else {
                    return;
                };
                store.run_maintenance();
            }
        });
        *guard = Some(handle);
    }

    fn run_maintenance(&self) {
        if let Some(ttl) = self.config.event_ttl {
            // A TTL too large to represent prunes nothing.
            let cutoff = chrono::Duration::from_std(ttl)
                .ok()
                .and_then(|ttl| Utc::now().checked_sub_signed(ttl))
                .unwrap_or(DateTime::<Utc>::MIN_UTC);
            match self.prune_events(cutoff) {
                Ok(0) => {}
                Ok(pruned) => info!(pruned, "maintenance pruned expired events"),
                Err(err) => warn!(error = %err, "maintenance pruning failed"),
            }
        }

        if self.config.compaction_threshold == 0 {
            return;
        }
        let eligible_before = chrono::Duration::from_std(self.config.snapshot_interval)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let candidates: Vec<(String, u64)> = {
            let inner = self.inner.read();
            inner
                .metadata
                .iter()
                .filter(|(_, info)| info.event_count > self.config.compaction_threshold)
                .filter_map(|(id, _)| {
                    let snapshot = inner.snapshots.get(id).and_then(|ring| ring.last())?;
                    (snapshot.created_at <= eligible_before)
                        .then(|| (id.clone(), snapshot.version))
                })
                .collect()
        };
        for (aggregate_id, target_version) in candidates {
            match self.compact_events(&aggregate_id, target_version) {
                Ok(compacted) => {
                    info!(aggregate_id = %aggregate_id, target_version, compacted,
                        "maintenance compacted aggregate");
                }
                Err(err) => {
                    warn!(aggregate_id = %aggregate_id, error = %err,
                        "maintenance compaction failed");
                }
            }
        }
    }

    fn validate_event(&self, event: &Event) -> Result<usize> {
        if event.id.is_empty() {
            return Err(EventError::InvalidEvent("event id is required".into()));
        }
        if event.aggregate_id.is_empty() {
            return Err(EventError::InvalidEvent("aggregate id is required".into()));
        }
        if event.aggregate_type.is_empty() {
            return Err(EventError::InvalidEvent("aggregate type is required".into()));
        }
        if let EventType::Custom(name) = &event.event_type {
            if name.is_empty() {
                return Err(EventError::InvalidEvent("event type is required".into()));
            }
        }
        if event.version == 0 {
            return Err(EventError::InvalidEvent(
                "event version must be positive".into(),
            ));
        }
        if event.timestamp.timestamp_millis() == 0 {
            return Err(EventError::InvalidEvent("event timestamp is required".into()));
        }
        let size = event.encoded_size()?;
        if size > self.config.max_event_size {
            return Err(EventError::EventTooLarge {
                size,
                max: self.config.max_event_size,
            });
        }
        Ok(size)
    }

    fn save_events_inner(&self, events: Vec<Event>) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }

        let mut inner = self.inner.write();
        if inner.closed {
            return Err(EventError::StoreClosed);
        }

        let mut sizes = Vec::with_capacity(events.len());
        for event in &events {
            sizes.push(self.validate_event(event)?);
        }

        // Continuity for the whole batch is checked against the aggregate's
        // last known version before anything is written, so a bad event
        // anywhere aborts with no partial state.
        {
            let mut expected: HashMap<String, u64> = HashMap::new();
            for event in &events {
                let last = match expected.get(&event.aggregate_id) {
                    Some(version) => *version,
                    None => inner
                        .metadata
                        .get(&event.aggregate_id)
                        .map(|info| info.version)
                        .unwrap_or(0),
                };
                if last == 0 {
                    if event.version != 1 {
                        return Err(EventError::FirstEventVersion {
                            aggregate_id: event.aggregate_id.clone(),
                            got: event.version,
                        });
                    }
                } else if event.version != last + 1 {
                    return Err(EventError::VersionGap {
                        aggregate_id: event.aggregate_id.clone(),
                        expected: last + 1,
                        got: event.version,
                    });
                }
                expected.insert(event.aggregate_id.clone(), event.version);
            }
        }

        for (event, size) in events.into_iter().zip(sizes) {
            inner.apply_append(event, size as u64);
        }

        self.ops.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl StoreInner {
    fn apply_append(&mut self, event: Event, size: u64) {
        if !self.metadata.contains_key(&event.aggregate_id) {
            self.stats.total_aggregates += 1;
            self.metadata.insert(
                event.aggregate_id.clone(),
                AggregateInfo {
                    aggregate_id: event.aggregate_id.clone(),
                    aggregate_type: event.aggregate_type.clone(),
                    version: 0,
                    event_count: 0,
                    first_event: None,
                    last_event: None,
                    last_snapshot: None,
                    size: 0,
                },
            );
        }
        let info = self
            .metadata
            .get_mut(&event.aggregate_id)
            .expect("aggregate metadata missing after insertion");
        info.version = event.version;
        info.event_count += 1;
        info.first_event.get_or_insert(event.timestamp);
        info.last_event = Some(event.timestamp);
        info.size += size;

        self.stats.total_events += 1;
        self.stats.store_size += size;
        *self
            .stats
            .events_by_type
            .entry(event.event_type.as_str().to_string())
            .or_insert(0) += 1;
        self.stats.last_event = Some(event.timestamp);
        self.stats.average_event_size =
            self.stats.store_size as f64 / self.stats.total_events as f64;

        // Fan out to live subscribers. A full queue drops the event for that
        // subscriber; a closed queue unregisters it.
        self.subscribers.retain(|subscriber| {
            if !subscriber.filter.matches(&event) {
                return true;
            }
            match subscriber.sender.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        event_id = %event.id,
                        subscriber_id = subscriber.id,
                        "subscriber queue full, dropping event"
                    );
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });

        debug!(
            event_id = %event.id,
            aggregate_id = %event.aggregate_id,
            event_type = %event.event_type,
            version = event.version,
            "event saved"
        );

        self.events.entry(event.aggregate_id.clone()).or_default().push(event);
    }

    fn remove_events(&mut self, aggregate_id: &str, removed: &[Event]) -> u64 {
        let mut reclaimed = 0u64;
        for event in removed {
            let size = event.encoded_size().unwrap_or(0) as u64;
            reclaimed += size;
            self.stats.total_events = self.stats.total_events.saturating_sub(1);
            if let Some(count) = self.stats.events_by_type.get_mut(event.event_type.as_str()) {
                *count = count.saturating_sub(1);
            }
        }
        self.stats.store_size = self.stats.store_size.saturating_sub(reclaimed);
        self.stats.average_event_size = if self.stats.total_events > 0 {
            self.stats.store_size as f64 / self.stats.total_events as f64
        } else {
            0.0
        };

        if let Some(info) = self.metadata.get_mut(aggregate_id) {
            info.event_count = info.event_count.saturating_sub(removed.len() as u64);
            info.size = info.size.saturating_sub(reclaimed);
            info.first_event = self
                .events
                .get(aggregate_id)
                .and_then(|events| events.first())
                .map(|event| event.timestamp);
        }
        reclaimed
    }
}

fn record_store_op(operation: &'static str, status: &'static str, duration: f64) {
    let labels = [("operation", operation), ("status", status)];
    counter!("eventcore_store_operations_total", &labels).increment(1);
    histogram!("eventcore_store_operation_duration_seconds", &labels).record(duration);
}

fn op_status<T>(result: &Result<T>) -> &'static str {
    if result.is_ok() {
        "ok"
    } else {
        "error"
    }
}

fn sort_cross_aggregate(events: &mut [Event]) {
    events.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.aggregate_id.cmp(&b.aggregate_id))
            .then_with(|| a.version.cmp(&b.version))
    });
}

async fn forward_stream(
    history: Vec<Event>,
    mut live: mpsc::Receiver<Event>,
    out: mpsc::Sender<Event>,
    shutdown: CancellationToken,
) {
    for event in history {
        tokio::select! {
            sent = out.send(event) => {
                if sent.is_err() {
                    return;
                }
            }
            _ = shutdown.cancelled() => return,
        }
    }
    loop {
        tokio::select! {
            next = live.recv() => match next {
                Some(event) => {
                    if out.send(event).await.is_err() {
                        return;
                    }
                }
                None => return,
            },
            _ = shutdown.cancelled() => return,
        }
    }
}

impl EventStore for MemoryEventStore {
    fn save_events(&self, events: Vec<Event>) -> Result<()> {
        let started = Instant::now();
        let result = self.save_events_inner(events);
        record_store_op("append", op_status(&result), started.elapsed().as_secs_f64());
        result
    }

    fn get_events(
        &self,
        aggregate_id: &str,
        from_version: u64,
        to_version: u64,
    ) -> Result<Vec<Event>> {
        let to_version = if to_version == 0 { u64::MAX } else { to_version };
        let inner = self.inner.read();
        let result: Vec<Event> = inner
            .events
            .get(aggregate_id)
            .map(|events| {
                events
                    .iter()
                    .filter(|event| event.version >= from_version && event.version <= to_version)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        drop(inner);
        self.ops.reads.fetch_add(1, Ordering::Relaxed);
        debug!(
            aggregate_id,
            from_version,
            count = result.len(),
            "events retrieved"
        );
        Ok(result)
    }

    fn get_all_events(&self, aggregate_id: &str) -> Result<Vec<Event>> {
        let inner = self.inner.read();
        let result = inner.events.get(aggregate_id).cloned().unwrap_or_default();
        drop(inner);
        self.ops.reads.fetch_add(1, Ordering::Relaxed);
        Ok(result)
    }

    fn get_events_by_type(&self, event_type: &EventType, limit: usize) -> Result<Vec<Event>> {
        let limit = if limit == 0 { usize::MAX } else { limit };
        let inner = self.inner.read();
        let mut result: Vec<Event> = inner
            .events
            .values()
            .flatten()
            .filter(|event| event.event_type == *event_type)
            .cloned()
            .collect();
        drop(inner);
        sort_cross_aggregate(&mut result);
        result.truncate(limit);
        self.ops.reads.fetch_add(1, Ordering::Relaxed);
        Ok(result)
    }

    fn get_events_by_time_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Event>> {
        let limit = if limit == 0 { usize::MAX } else { limit };
        let inner = self.inner.read();
        let mut result: Vec<Event> = inner
            .events
            .values()
            .flatten()
            .filter(|event| event.timestamp >= start && event.timestamp < end)
            .cloned()
            .collect();
        drop(inner);
        sort_cross_aggregate(&mut result);
        result.truncate(limit);
        self.ops.reads.fetch_add(1, Ordering::Relaxed);
        Ok(result)
    }

    fn stream_events(&self, aggregate_id: &str, from_version: u64) -> Result<EventStream> {
        let buffer = self.config.stream_buffer_size.max(1);
        let (out_tx, out_rx) = mpsc::channel(buffer);
        let (live_tx, live_rx) = mpsc::channel(buffer);

        // History snapshot and live registration happen under one lock so no
        // committed event is missed or delivered twice.
        let history: Vec<Event> = {
            let mut inner = self.inner.write();
            if inner.closed {
                return Err(EventError::StoreClosed);
            }
            let history = inner
                .events
                .get(aggregate_id)
                .map(|events| {
                    events
                        .iter()
                        .filter(|event| event.version >= from_version)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            inner.subscribers.push(Subscriber {
                id: self.next_subscriber_id.fetch_add(1, Ordering::Relaxed),
                filter: SubscriberFilter::Aggregate(aggregate_id.to_string()),
                sender: live_tx,
            });
            history
        };

        tokio::spawn(forward_stream(
            history,
            live_rx,
            out_tx,
            self.shutdown.clone(),
        ));
        self.ops.streams.fetch_add(1, Ordering::Relaxed);
        record_store_op("stream", "ok", 0.0);
        debug!(aggregate_id, from_version, "event stream started");
        Ok(EventStream::new(out_rx))
    }

    fn stream_all_events(&self, from_time: DateTime<Utc>) -> Result<EventStream> {
        let buffer = self.config.stream_buffer_size.max(1);
        let (out_tx, out_rx) = mpsc::channel(buffer);
        let (live_tx, live_rx) = mpsc::channel(buffer);

        let history: Vec<Event> = {
            let mut inner = self.inner.write();
            if inner.closed {
                return Err(EventError::StoreClosed);
            }
            let mut history: Vec<Event> = inner
                .events
                .values()
                .flatten()
                .filter(|event| event.timestamp >= from_time)
                .cloned()
                .collect();
            sort_cross_aggregate(&mut history);
            inner.subscribers.push(Subscriber {
                id: self.next_subscriber_id.fetch_add(1, Ordering::Relaxed),
                filter: SubscriberFilter::FromTime(from_time),
                sender: live_tx,
            });
            history
        };

        tokio::spawn(forward_stream(
            history,
            live_rx,
            out_tx,
            self.shutdown.clone(),
        ));
        self.ops.streams.fetch_add(1, Ordering::Relaxed);
        record_store_op("stream", "ok", 0.0);
        debug!(%from_time, "all-events stream started");
        Ok(EventStream::new(out_rx))
    }

    fn subscribe(&self) -> Result<EventStream> {
        let buffer = self.config.stream_buffer_size.max(1);
        let (tx, rx) = mpsc::channel(buffer);
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(EventError::StoreClosed);
        }
        inner.subscribers.push(Subscriber {
            id: self.next_subscriber_id.fetch_add(1, Ordering::Relaxed),
            filter: SubscriberFilter::All,
            sender: tx,
        });
        drop(inner);
        self.ops.streams.fetch_add(1, Ordering::Relaxed);
        Ok(EventStream::new(rx))
    }

    fn get_aggregate_info(&self, aggregate_id: &str) -> Result<AggregateInfo> {
        let inner = self.inner.read();
        inner
            .metadata
            .get(aggregate_id)
            .cloned()
            .ok_or_else(|| EventError::AggregateNotFound(aggregate_id.to_string()))
    }

    fn create_snapshot(&self, aggregate_id: &str, version: u64, data: Value) -> Result<()> {
        let started = Instant::now();
        let result = (|| {
            let mut inner = self.inner.write();
            if inner.closed {
                return Err(EventError::StoreClosed);
            }
            let events = inner
                .events
                .get(aggregate_id)
                .ok_or_else(|| EventError::AggregateNotFound(aggregate_id.to_string()))?;
            let target = events
                .iter()
                .find(|event| event.version == version)
                .ok_or_else(|| EventError::SnapshotVersionNotFound {
                    aggregate_id: aggregate_id.to_string(),
                    version,
                })?;

            let now = Utc::now();
            let snapshot = Snapshot {
                aggregate_id: aggregate_id.to_string(),
                aggregate_type: target.aggregate_type.clone(),
                version,
                size: serde_json::to_vec(&data)?.len() as u64,
                data,
                created_at: now,
                created_by: self.node_id.clone(),
                metadata: None,
            };

            let retention = self.config.snapshot_retention.max(1);
            let ring = inner.snapshots.entry(aggregate_id.to_string()).or_default();
            ring.push(snapshot);
            while ring.len() > retention {
                ring.remove(0);
            }
            if let Some(info) = inner.metadata.get_mut(aggregate_id) {
                info.last_snapshot = Some(now);
            }
            inner.stats.snapshot_count += 1;

            info!(aggregate_id, version, "snapshot created");
            Ok(())
        })();
        record_store_op("snapshot", op_status(&result), started.elapsed().as_secs_f64());
        result
    }

    fn get_snapshot(&self, aggregate_id: &str) -> Result<Snapshot> {
        let inner = self.inner.read();
        inner
            .snapshots
            .get(aggregate_id)
            .and_then(|ring| ring.last())
            .cloned()
            .ok_or_else(|| EventError::SnapshotNotFound(aggregate_id.to_string()))
    }

    fn get_event_stats(&self) -> Result<EventStoreStats> {
        let inner = self.inner.read();
        let mut stats = inner.stats.clone();
        stats.write_operations = self.ops.writes.load(Ordering::Relaxed);
        stats.read_operations = self.ops.reads.load(Ordering::Relaxed);
        stats.stream_operations = self.ops.streams.load(Ordering::Relaxed);
        Ok(stats)
    }

    fn store_info(&self) -> EventStoreInfo {
        EventStoreInfo {
            store_type: "in-memory",
            version: crate::VERSION,
            node_id: self.node_id.clone(),
            started_at: self.started_at,
            supported_features: vec![
                "save_events",
                "get_events",
                "stream_events",
                "snapshots",
                "compaction",
                "pruning",
            ],
            configuration: self.config.clone(),
        }
    }

    fn health(&self) -> EventStoreHealth {
        let inner = self.inner.read();
        EventStoreHealth {
            status: if inner.closed { "closed" } else { "healthy" },
            store_type: "in-memory",
            node_id: self.node_id.clone(),
            timestamp: Utc::now(),
            event_count: inner.stats.total_events,
            store_size: inner.stats.store_size,
            total_aggregates: inner.stats.total_aggregates,
            write_operations: self.ops.writes.load(Ordering::Relaxed),
            read_operations: self.ops.reads.load(Ordering::Relaxed),
            snapshot_count: inner.stats.snapshot_count,
        }
    }

    fn compact_events(&self, aggregate_id: &str, target_version: u64) -> Result<u64> {
        let started = Instant::now();
        let result = (|| {
            let mut inner = self.inner.write();
            let events = inner
                .events
                .get_mut(aggregate_id)
                .ok_or_else(|| EventError::AggregateNotFound(aggregate_id.to_string()))?;
            let cut = events.partition_point(|event| event.version <= target_version);
            if cut == 0 {
                return Ok(0);
            }
            let removed: Vec<Event> = events.drain(..cut).collect();
            let reclaimed = inner.remove_events(aggregate_id, &removed);

            inner.stats.compaction_stats.last_compaction = Some(Utc::now());
            inner.stats.compaction_stats.compactions_count += 1;
            inner.stats.compaction_stats.events_compacted += removed.len() as u64;
            inner.stats.compaction_stats.space_reclaimed += reclaimed;

            info!(
                aggregate_id,
                target_version,
                compacted = removed.len(),
                "events compacted"
            );
            Ok(removed.len() as u64)
        })();
        record_store_op("compact", op_status(&result), started.elapsed().as_secs_f64());
        result
    }

    fn prune_events(&self, before_time: DateTime<Utc>) -> Result<u64> {
        let started = Instant::now();
        let result = (|| {
            let mut inner = self.inner.write();
            let aggregate_ids: Vec<String> = inner.events.keys().cloned().collect();
            let mut pruned = 0u64;
            for aggregate_id in aggregate_ids {
                let removed: Vec<Event> = {
                    let events = inner
                        .events
                        .get_mut(&aggregate_id)
                        .expect("aggregate key came from the map");
                    let mut kept = Vec::with_capacity(events.len());
                    let mut removed = Vec::new();
                    for event in events.drain(..) {
                        if event.timestamp < before_time {
                            removed.push(event);
                        } else {
                            kept.push(event);
                        }
                    }
                    *events = kept;
                    removed
                };
                if removed.is_empty() {
                    continue;
                }
                pruned += removed.len() as u64;
                inner.remove_events(&aggregate_id, &removed);
                if inner
                    .events
                    .get(&aggregate_id)
                    .map(Vec::is_empty)
                    .unwrap_or(false)
                {
                    inner.events.remove(&aggregate_id);
                }
            }
            if pruned > 0 {
                info!(%before_time, pruned, "events pruned");
            }
            Ok(pruned)
        })();
        record_store_op("prune", op_status(&result), started.elapsed().as_secs_f64());
        result
    }

    fn close(&self) {
        let mut inner = self.inner.write();
        if inner.closed {
            return;
        }
        inner.closed = true;
        inner.subscribers.clear();
        drop(inner);
        self.shutdown.cancel();
        if let Some(handle) = self.maintenance.lock().take() {
            handle.abort();
        }
        info!("event store closed");
    }
}

impl Drop for MemoryEventStore {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> MemoryEventStore {
        MemoryEventStore::new(EventStoreConfig::default())
    }

    fn event(store: &MemoryEventStore, aggregate_id: &str, version: u64) -> Event {
        Event::builder(aggregate_id, "order", EventType::Update)
            .version(version)
            .data(json!({ "version": version }))
            .build(store.id_generator())
    }

    #[test]
    fn rejects_malformed_events() {
        let store = store();
        let mut bad = event(&store, "order-1", 1);
        bad.aggregate_id.clear();
        assert!(matches!(
            store.save_event(bad),
            Err(EventError::InvalidEvent(_))
        ));

        let mut zero = event(&store, "order-1", 1);
        zero.version = 0;
        assert!(matches!(
            store.save_event(zero),
            Err(EventError::InvalidEvent(_))
        ));
    }

    #[test]
    fn rejects_oversized_events() {
        let store = MemoryEventStore::new(EventStoreConfig {
            max_event_size: 64,
            ..EventStoreConfig::default()
        });
        let big = Event::builder("order-1", "order", EventType::Create)
            .version(1)
            .data(json!({ "blob": "x".repeat(256) }))
            .build(store.id_generator());
        assert!(matches!(
            store.save_event(big),
            Err(EventError::EventTooLarge { .. })
        ));
    }

    #[test]
    fn continuity_resumes_from_metadata_after_compaction() {
        let store = store();
        for version in 1..=3 {
            store.save_event(event(&store, "order-1", version)).unwrap();
        }
        store.create_snapshot("order-1", 3, json!({})).unwrap();
        assert_eq!(store.compact_events("order-1", 3).unwrap(), 3);

        // All events are gone but the version counter lives in the metadata.
        assert!(store.get_all_events("order-1").unwrap().is_empty());
        store.save_event(event(&store, "order-1", 4)).unwrap();
        let info = store.get_aggregate_info("order-1").unwrap();
        assert_eq!(info.version, 4);
        assert_eq!(info.event_count, 1);
    }

    #[test]
    fn snapshot_ring_is_bounded() {
        let store = MemoryEventStore::new(EventStoreConfig {
            snapshot_retention: 2,
            ..EventStoreConfig::default()
        });
        for version in 1..=4 {
            store.save_event(event(&store, "order-1", version)).unwrap();
            store
                .create_snapshot("order-1", version, json!({ "v": version }))
                .unwrap();
        }
        let snapshot = store.get_snapshot("order-1").unwrap();
        assert_eq!(snapshot.version, 4);
        // Retention counts creations, not replacements.
        assert_eq!(store.get_event_stats().unwrap().snapshot_count, 4);
    }
}
