//! Registry and pipeline for long-lived views over the event stream.
//!
//! Live events enter through a bounded intake queue, get routed to a fixed
//! worker pool sharded by aggregate id (events of one aggregate always land
//! on the same worker, preserving their order), and are applied to every
//! active projection whose filters match. A handler failure is isolated to
//! its own projection; it never aborts the worker or touches other
//! projections.

use std::{
    collections::HashMap,
    hash::{Hash, Hasher},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::ProjectionConfig,
    error::{EventError, Result},
    event::{Event, EventType},
    store::{EventStore, EventStream},
};

/// Per-type cap on events fetched when rebuilding a projection that has no
/// aggregate filter.
const REBUILD_EVENTS_PER_TYPE: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectionType {
    Aggregation,
    State,
    Statistics,
    Materialized,
    #[serde(untagged)]
    Custom(String),
}

impl ProjectionType {
    pub fn as_str(&self) -> &str {
        match self {
            ProjectionType::Aggregation => "aggregation",
            ProjectionType::State => "state",
            ProjectionType::Statistics => "statistics",
            ProjectionType::Materialized => "materialized",
            ProjectionType::Custom(name) => name.as_str(),
        }
    }
}

/// A named, independently-versioned view over the event stream.
#[derive(Debug, Clone, Serialize)]
pub struct Projection {
    pub id: String,
    pub name: String,
    pub projection_type: ProjectionType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregate_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregate_type: Option<String>,
    pub event_types: Vec<EventType>,
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_processed: Option<DateTime<Utc>>,
}

impl Projection {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        projection_type: ProjectionType,
        event_types: Vec<EventType>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            projection_type,
            aggregate_id: None,
            aggregate_type: None,
            event_types,
            data: Value::Null,
            metadata: None,
            is_active: true,
            created_at: now,
            updated_at: now,
            last_processed: None,
        }
    }

    pub fn for_aggregate(mut self, aggregate_id: impl Into<String>) -> Self {
        self.aggregate_id = Some(aggregate_id.into());
        self
    }

    pub fn for_aggregate_type(mut self, aggregate_type: impl Into<String>) -> Self {
        self.aggregate_type = Some(aggregate_type.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }
}

/// Domain hook a projection applies matching events through. `Some(value)`
/// returned from [`project`](Self::project) replaces the projection's `data`.
#[async_trait]
pub trait ProjectionHandler: Send + Sync {
    fn can_handle(&self, event: &Event) -> bool;

    async fn project(&self, event: &Event, projection: &Projection)
        -> anyhow::Result<Option<Value>>;

    fn handler_type(&self) -> &str;
}

#[derive(Debug, Clone, Serialize)]
pub struct ProjectionState {
    pub projection_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_event_id: Option<String>,
    pub last_version: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_processed: Option<DateTime<Utc>>,
    pub events_processed: u64,
    pub errors_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ProjectionState {
    fn zero(projection_id: &str) -> Self {
        Self {
            projection_id: projection_id.to_string(),
            last_event_id: None,
            last_version: 0,
            last_processed: None,
            events_processed: 0,
            errors_count: 0,
            last_error: None,
            error_message: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectionHealth {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProjectionMetrics {
    pub projection_id: String,
    pub events_processed: u64,
    pub events_per_second: f64,
    pub average_latency: Duration,
    pub error_rate: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_processed: Option<DateTime<Utc>>,
    pub health: ProjectionHealth,
    #[serde(skip)]
    tracked_since: Option<Instant>,
}

impl ProjectionMetrics {
    fn zero(projection_id: &str) -> Self {
        Self {
            projection_id: projection_id.to_string(),
            events_processed: 0,
            events_per_second: 0.0,
            average_latency: Duration::ZERO,
            error_rate: 0.0,
            last_processed: None,
            health: ProjectionHealth::Healthy,
            tracked_since: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProjectionStats {
    pub total_projections: u64,
    pub active_projections: u64,
    pub events_processed: u64,
    pub projections_by_type: HashMap<String, u64>,
    pub average_processing_time: Duration,
    pub error_rate: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_processed: Option<DateTime<Utc>>,
    pub background_workers: usize,
    pub dropped_events: u64,
}

/// Filter for [`ProjectionEngine::list_projections`]. `limit == 0` means
/// unbounded.
#[derive(Debug, Clone, Default)]
pub struct ProjectionFilter {
    pub projection_type: Option<ProjectionType>,
    pub aggregate_id: Option<String>,
    pub aggregate_type: Option<String>,
    pub event_type: Option<EventType>,
    pub is_active: Option<bool>,
    pub limit: usize,
    pub offset: usize,
}

impl ProjectionFilter {
    fn matches(&self, projection: &Projection) -> bool {
        if let Some(projection_type) = &self.projection_type {
            if projection.projection_type != *projection_type {
                return false;
            }
        }
        if let Some(aggregate_id) = &self.aggregate_id {
            if projection.aggregate_id.as_deref() != Some(aggregate_id.as_str()) {
                return false;
            }
        }
        if let Some(aggregate_type) = &self.aggregate_type {
            if projection.aggregate_type.as_deref() != Some(aggregate_type.as_str()) {
                return false;
            }
        }
        if let Some(event_type) = &self.event_type {
            if !projection.event_types.contains(event_type) {
                return false;
            }
        }
        if let Some(is_active) = self.is_active {
            if projection.is_active != is_active {
                return false;
            }
        }
        true
    }
}

fn projection_matches(projection: &Projection, event: &Event) -> bool {
    if !projection
        .event_types
        .iter()
        .any(|event_type| *event_type == event.event_type)
    {
        return false;
    }
    if let Some(aggregate_id) = &projection.aggregate_id {
        if *aggregate_id != event.aggregate_id {
            return false;
        }
    }
    if let Some(aggregate_type) = &projection.aggregate_type {
        if *aggregate_type != event.aggregate_type {
            return false;
        }
    }
    true
}

fn shard_index(aggregate_id: &str, workers: usize) -> usize {
    let mut hasher = ahash::AHasher::default();
    aggregate_id.hash(&mut hasher);
    (hasher.finish() as usize) % workers
}

struct Entry {
    projection: Projection,
    handler: Arc<dyn ProjectionHandler>,
}

struct Registry {
    entries: HashMap<String, Entry>,
    states: HashMap<String, ProjectionState>,
    metrics: HashMap<String, ProjectionMetrics>,
    stats: ProjectionStats,
}

struct Core {
    registry: RwLock<Registry>,
    dropped: AtomicU64,
}

impl Core {
    /// Live-path application: every active projection whose filters match
    /// gets the event, failures isolated per projection.
    async fn apply_event(&self, event: &Event) {
        let matches: Vec<(String, Arc<dyn ProjectionHandler>, Projection)> = {
            let registry = self.registry.read();
            registry
                .entries
                .values()
                .filter(|entry| {
                    entry.projection.is_active && projection_matches(&entry.projection, event)
                })
                .map(|entry| {
                    (
                        entry.projection.id.clone(),
                        entry.handler.clone(),
                        entry.projection.clone(),
                    )
                })
                .collect()
        };

        for (id, handler, projection) in matches {
            self.run_handler(&id, &handler, &projection, event, 0).await;
        }
    }

    /// Rebuild-path application for one projection, same per-event semantics
    /// as the live path plus bounded retries.
    async fn project_one(&self, id: &str, event: &Event, retry_attempts: u32) -> Result<()> {
        let (handler, projection) = {
            let registry = self.registry.read();
            let entry = registry
                .entries
                .get(id)
                .ok_or_else(|| EventError::ProjectionNotFound(id.to_string()))?;
            if !projection_matches(&entry.projection, event) {
                return Ok(());
            }
            (entry.handler.clone(), entry.projection.clone())
        };
        self.run_handler(id, &handler, &projection, event, retry_attempts)
            .await;
        Ok(())
    }

    async fn run_handler(
        &self,
        id: &str,
        handler: &Arc<dyn ProjectionHandler>,
        projection: &Projection,
        event: &Event,
        retry_attempts: u32,
    ) -> bool {
        if !handler.can_handle(event) {
            return false;
        }
        let started = Instant::now();
        let mut attempt = 0;
        loop {
            match handler.project(event, projection).await {
                Ok(new_data) => {
                    self.record_success(id, event, new_data, started.elapsed());
                    return true;
                }
                Err(err) => {
                    if attempt < retry_attempts {
                        attempt += 1;
                        continue;
                    }
                    self.record_error(id, &err);
                    warn!(
                        projection_id = id,
                        event_id = %event.id,
                        error = %err,
                        "projection handler failed"
                    );
                    return false;
                }
            }
        }
    }

    fn record_success(&self, id: &str, event: &Event, new_data: Option<Value>, latency: Duration) {
        let mut registry = self.registry.write();
        let now = Utc::now();
        if let Some(entry) = registry.entries.get_mut(id) {
            if let Some(data) = new_data {
                entry.projection.data = data;
            }
            entry.projection.last_processed = Some(now);
        }
        if let Some(state) = registry.states.get_mut(id) {
            state.last_event_id = Some(event.id.clone());
            state.last_version = event.version;
            state.last_processed = Some(event.timestamp);
            state.events_processed += 1;
        }

        registry.stats.events_processed += 1;
        registry.stats.last_processed = Some(event.timestamp);
        let processed = registry.stats.events_processed;
        let average = registry.stats.average_processing_time.as_secs_f64();
        registry.stats.average_processing_time = Duration::from_secs_f64(
            (average * (processed - 1) as f64 + latency.as_secs_f64()) / processed as f64,
        );

        if let Some(metric) = registry.metrics.get_mut(id) {
            metric.events_processed += 1;
            metric.tracked_since.get_or_insert_with(Instant::now);
            let count = metric.events_processed;
            let average = metric.average_latency.as_secs_f64();
            metric.average_latency = Duration::from_secs_f64(
                (average * (count - 1) as f64 + latency.as_secs_f64()) / count as f64,
            );
            metric.last_processed = Some(event.timestamp);
        }
    }

    fn record_error(&self, id: &str, err: &anyhow::Error) {
        let mut registry = self.registry.write();
        let now = Utc::now();
        let mut errors = 0;
        if let Some(state) = registry.states.get_mut(id) {
            state.errors_count += 1;
            state.last_error = Some(now);
            state.error_message = Some(err.to_string());
            errors = state.errors_count;
        }
        if let Some(metric) = registry.metrics.get_mut(id) {
            let total = errors + metric.events_processed;
            if total > 0 {
                metric.error_rate = errors as f64 / total as f64;
            }
            if metric.error_rate > 0.5 {
                metric.health = ProjectionHealth::Degraded;
            }
        }
    }

    fn refresh_metrics(&self) {
        let mut registry = self.registry.write();
        let Registry {
            states, metrics, ..
        } = &mut *registry;
        for (id, metric) in metrics.iter_mut() {
            if let Some(since) = metric.tracked_since {
                let elapsed = since.elapsed().as_secs_f64();
                if elapsed > 0.0 {
                    metric.events_per_second = metric.events_processed as f64 / elapsed;
                }
            }
            let errors = states.get(id).map(|state| state.errors_count).unwrap_or(0);
            let total = errors + metric.events_processed;
            metric.error_rate = if total > 0 {
                errors as f64 / total as f64
            } else {
                0.0
            };
            metric.health = if metric.error_rate > 0.5 {
                ProjectionHealth::Degraded
            } else {
                ProjectionHealth::Healthy
            };
        }
    }
}

/// Registry + pipeline. Construction spawns the distributor, the worker
/// pool, and the metrics refresh task, so it must happen inside a Tokio
/// runtime.
pub struct ProjectionEngine {
    config: ProjectionConfig,
    store: Arc<dyn EventStore>,
    core: Arc<Core>,
    intake: Mutex<Option<mpsc::Sender<Event>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl ProjectionEngine {
    pub fn new(config: ProjectionConfig, store: Arc<dyn EventStore>) -> Self {
        let core = Arc::new(Core {
            registry: RwLock::new(Registry {
                entries: HashMap::new(),
                states: HashMap::new(),
                metrics: HashMap::new(),
                stats: ProjectionStats::default(),
            }),
            dropped: AtomicU64::new(0),
        });
        let shutdown = CancellationToken::new();

        let workers = config.background_workers.max(1);
        let per_worker = config.batch_size.max(1);
        let (intake_tx, mut intake_rx) = mpsc::channel::<Event>(per_worker * workers);

        let mut tasks = Vec::with_capacity(workers + 2);
        let mut worker_txs = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let (tx, mut rx) = mpsc::channel::<Event>(per_worker);
            worker_txs.push(tx);
            let core = core.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    core.apply_event(&event).await;
                }
                debug!(worker_id, "projection worker stopped");
            }));
        }

        // Distributor: shard by aggregate id so one aggregate's events keep
        // their order on a single worker while distinct aggregates fan out.
        let distributor_core = core.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(event) = intake_rx.recv().await {
                let index = shard_index(&event.aggregate_id, worker_txs.len());
                match worker_txs[index].try_send(event) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(event)) => {
                        distributor_core.dropped.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            event_id = %event.id,
                            worker = index,
                            "worker queue full, dropping event"
                        );
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => break,
                }
            }
            debug!("projection distributor stopped");
        }));

        let metrics_core = core.clone();
        let metrics_shutdown = shutdown.clone();
        let refresh_period = config.state_update_interval.max(Duration::from_millis(10));
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(refresh_period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = metrics_shutdown.cancelled() => return,
                    _ = ticker.tick() => metrics_core.refresh_metrics(),
                }
            }
        }));

        info!(
            background_workers = workers,
            max_projections = config.max_projections,
            "projection engine initialized"
        );

        Self {
            config,
            store,
            core,
            intake: Mutex::new(Some(intake_tx)),
            tasks: Mutex::new(tasks),
            shutdown,
            closed: AtomicBool::new(false),
        }
    }

    pub fn create_projection(
        &self,
        projection: Projection,
        handler: Arc<dyn ProjectionHandler>,
    ) -> Result<()> {
        if projection.id.is_empty() {
            return Err(EventError::InvalidProjection(
                "projection id is required".into(),
            ));
        }
        if projection.name.is_empty() {
            return Err(EventError::InvalidProjection(
                "projection name is required".into(),
            ));
        }
        if projection.event_types.is_empty() {
            return Err(EventError::InvalidProjection(
                "at least one event type is required".into(),
            ));
        }

        let mut registry = self.core.registry.write();
        if registry.entries.len() >= self.config.max_projections {
            return Err(EventError::ProjectionLimitReached(
                self.config.max_projections,
            ));
        }
        if registry.entries.contains_key(&projection.id) {
            return Err(EventError::InvalidProjection(format!(
                "projection already exists: {}",
                projection.id
            )));
        }

        let id = projection.id.clone();
        registry.states.insert(id.clone(), ProjectionState::zero(&id));
        registry
            .metrics
            .insert(id.clone(), ProjectionMetrics::zero(&id));
        registry.stats.total_projections += 1;
        if projection.is_active {
            registry.stats.active_projections += 1;
        }
        *registry
            .stats
            .projections_by_type
            .entry(projection.projection_type.as_str().to_string())
            .or_insert(0) += 1;

        info!(
            projection_id = %id,
            projection_type = projection.projection_type.as_str(),
            name = %projection.name,
            "projection created"
        );
        registry.entries.insert(id, Entry { projection, handler });
        Ok(())
    }

    /// Replaces the projection definition, keeping its creation time, state,
    /// metrics, and handler.
    pub fn update_projection(&self, mut projection: Projection) -> Result<()> {
        let mut registry = self.core.registry.write();
        let existing = registry
            .entries
            .get(&projection.id)
            .ok_or_else(|| EventError::ProjectionNotFound(projection.id.clone()))?;

        let was_active = existing.projection.is_active;
        let old_type = existing.projection.projection_type.clone();
        projection.created_at = existing.projection.created_at;
        projection.updated_at = Utc::now();

        if was_active && !projection.is_active {
            registry.stats.active_projections -= 1;
        } else if !was_active && projection.is_active {
            registry.stats.active_projections += 1;
        }
        if old_type != projection.projection_type {
            if let Some(count) = registry
                .stats
                .projections_by_type
                .get_mut(old_type.as_str())
            {
                *count = count.saturating_sub(1);
            }
            *registry
                .stats
                .projections_by_type
                .entry(projection.projection_type.as_str().to_string())
                .or_insert(0) += 1;
        }

        info!(projection_id = %projection.id, "projection updated");
        let id = projection.id.clone();
        if let Some(entry) = registry.entries.get_mut(&id) {
            entry.projection = projection;
        }
        Ok(())
    }

    pub fn delete_projection(&self, projection_id: &str) -> Result<()> {
        let mut registry = self.core.registry.write();
        let entry = registry
            .entries
            .remove(projection_id)
            .ok_or_else(|| EventError::ProjectionNotFound(projection_id.to_string()))?;
        registry.states.remove(projection_id);
        registry.metrics.remove(projection_id);

        registry.stats.total_projections -= 1;
        if entry.projection.is_active {
            registry.stats.active_projections -= 1;
        }
        if let Some(count) = registry
            .stats
            .projections_by_type
            .get_mut(entry.projection.projection_type.as_str())
        {
            *count = count.saturating_sub(1);
        }

        info!(projection_id, "projection deleted");
        Ok(())
    }

    pub fn get_projection(&self, projection_id: &str) -> Result<Projection> {
        let registry = self.core.registry.read();
        registry
            .entries
            .get(projection_id)
            .map(|entry| entry.projection.clone())
            .ok_or_else(|| EventError::ProjectionNotFound(projection_id.to_string()))
    }

    /// Projections matching the filter, ordered by id for stable pagination.
    pub fn list_projections(&self, filter: &ProjectionFilter) -> Vec<Projection> {
        let registry = self.core.registry.read();
        let mut matching: Vec<Projection> = registry
            .entries
            .values()
            .filter(|entry| filter.matches(&entry.projection))
            .map(|entry| entry.projection.clone())
            .collect();
        drop(registry);
        matching.sort_by(|a, b| a.id.cmp(&b.id));
        let limit = if filter.limit == 0 {
            usize::MAX
        } else {
            filter.limit
        };
        matching.into_iter().skip(filter.offset).take(limit).collect()
    }

    /// Enqueues one live event. A full intake queue drops the event with a
    /// warning rather than blocking; a stopped engine is an error.
    pub fn process_event(&self, event: Event) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EventError::EngineStopped);
        }
        let intake = self.intake.lock();
        let sender = intake.as_ref().ok_or(EventError::EngineStopped)?;
        match sender.try_send(event) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(event)) => {
                self.core.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(event_id = %event.id, "projection intake queue full, dropping event");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(EventError::EngineStopped),
        }
    }

    pub fn process_events(&self, events: Vec<Event>) -> Result<()> {
        for event in events {
            self.process_event(event)?;
        }
        Ok(())
    }

    /// Forwards a store stream (see
    /// [`EventStore::subscribe`](crate::store::EventStore::subscribe)) into
    /// this engine until the stream ends or the engine stops.
    pub fn attach_stream(&self, mut stream: EventStream) -> JoinHandle<()> {
        let sender = self.intake.lock().clone();
        let shutdown = self.shutdown.clone();
        let core = self.core.clone();
        tokio::spawn(async move {
            let Some(sender) = sender else {
                return;
            };
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    next = stream.next() => match next {
                        Some(event) => match sender.try_send(event) {
                            Ok(()) => {}
                            Err(mpsc::error::TrySendError::Full(event)) => {
                                core.dropped.fetch_add(1, Ordering::Relaxed);
                                warn!(
                                    event_id = %event.id,
                                    "projection intake queue full, dropping event"
                                );
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => return,
                        },
                        None => return,
                    },
                }
            }
        })
    }

    /// Resets the projection and replays its full relevant history
    /// sequentially through the same per-event path the live pipeline uses.
    pub async fn rebuild_projection(&self, projection_id: &str) -> Result<()> {
        let projection = self.get_projection(projection_id)?;
        info!(projection_id, "rebuilding projection");
        let started = Instant::now();

        self.reset_projection(projection_id)?;

        let mut events: Vec<Event> = match &projection.aggregate_id {
            Some(aggregate_id) => self.store.get_all_events(aggregate_id)?,
            None => {
                let mut all = Vec::new();
                for event_type in &projection.event_types {
                    let batch = self
                        .store
                        .get_events_by_type(event_type, REBUILD_EVENTS_PER_TYPE)?;
                    if batch.len() == REBUILD_EVENTS_PER_TYPE {
                        warn!(
                            projection_id,
                            event_type = %event_type,
                            cap = REBUILD_EVENTS_PER_TYPE,
                            "rebuild cap reached, events beyond the cap were skipped"
                        );
                    }
                    all.extend(batch);
                }
                all
            }
        };
        events.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.aggregate_id.cmp(&b.aggregate_id))
                .then_with(|| a.version.cmp(&b.version))
        });

        let total = events.len();
        for event in &events {
            self.core
                .project_one(projection_id, event, self.config.retry_attempts)
                .await?;
        }

        info!(
            projection_id,
            events = total,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "projection rebuilt"
        );
        Ok(())
    }

    pub async fn rebuild_all_projections(&self) -> Result<()> {
        let ids: Vec<String> = {
            let registry = self.core.registry.read();
            let mut ids: Vec<String> = registry.entries.keys().cloned().collect();
            ids.sort();
            ids
        };
        for id in ids {
            if let Err(err) = self.rebuild_projection(&id).await {
                error!(projection_id = %id, error = %err, "failed to rebuild projection");
            }
        }
        Ok(())
    }

    /// Zeroes state and metrics; the projection's materialized `data` is
    /// left untouched.
    pub fn reset_projection(&self, projection_id: &str) -> Result<()> {
        let mut registry = self.core.registry.write();
        if !registry.states.contains_key(projection_id) {
            return Err(EventError::ProjectionNotFound(projection_id.to_string()));
        }
        registry
            .states
            .insert(projection_id.to_string(), ProjectionState::zero(projection_id));
        registry
            .metrics
            .insert(projection_id.to_string(), ProjectionMetrics::zero(projection_id));
        info!(projection_id, "projection reset");
        Ok(())
    }

    pub fn projection_state(&self, projection_id: &str) -> Result<ProjectionState> {
        let registry = self.core.registry.read();
        registry
            .states
            .get(projection_id)
            .cloned()
            .ok_or_else(|| EventError::ProjectionNotFound(projection_id.to_string()))
    }

    pub fn projection_metrics(&self, projection_id: &str) -> Result<ProjectionMetrics> {
        let registry = self.core.registry.read();
        registry
            .metrics
            .get(projection_id)
            .cloned()
            .ok_or_else(|| EventError::ProjectionNotFound(projection_id.to_string()))
    }

    pub fn stats(&self) -> ProjectionStats {
        let registry = self.core.registry.read();
        let mut stats = registry.stats.clone();
        let errors: u64 = registry.states.values().map(|state| state.errors_count).sum();
        drop(registry);
        let total = errors + stats.events_processed;
        stats.error_rate = if total > 0 {
            errors as f64 / total as f64
        } else {
            0.0
        };
        stats.background_workers = self.config.background_workers.max(1);
        stats.dropped_events = self.core.dropped.load(Ordering::Relaxed);
        stats
    }

    pub fn is_stopped(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Two-phase shutdown: stop accepting input, let the distributor and
    /// workers drain their queues, then release the background tasks.
    /// Idempotent.
    pub async fn stop(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        // Phase 1: refuse new input and close the intake channel. Attached
        // stream forwarders exit on cancellation, dropping their sender
        // clones, which lets the distributor and workers drain to completion.
        let _ = self.intake.lock().take();
        self.shutdown.cancel();

        // Phase 2: wait for the pipeline to drain, then abort anything stuck.
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        let aborts: Vec<_> = handles.iter().map(|handle| handle.abort_handle()).collect();
        let drain = async {
            for handle in handles {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(self.config.batch_timeout, drain)
            .await
            .is_err()
        {
            warn!("projection pipeline did not drain in time, aborting workers");
            for abort in aborts {
                abort.abort();
            }
        }
        info!("projection engine stopped");
    }
}

impl Drop for ProjectionEngine {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_index_is_stable_and_in_range() {
        let first = shard_index("order-1", 8);
        for _ in 0..16 {
            assert_eq!(shard_index("order-1", 8), first);
        }
        for id in ["a", "b", "c", "order-2", "order-3"] {
            assert!(shard_index(id, 8) < 8);
        }
    }

    #[test]
    fn filter_matches_on_event_type_subscription() {
        let projection = Projection::new(
            "p1",
            "orders",
            ProjectionType::State,
            vec![EventType::Create, EventType::Update],
        );
        let filter = ProjectionFilter {
            event_type: Some(EventType::Update),
            ..ProjectionFilter::default()
        };
        assert!(filter.matches(&projection));

        let filter = ProjectionFilter {
            event_type: Some(EventType::Delete),
            ..ProjectionFilter::default()
        };
        assert!(!filter.matches(&projection));
    }
}
