//! Replays ranges of stored events through caller-supplied handlers.
//!
//! Sequential replay is the baseline and the only strategy that preserves
//! strict inter-event ordering; parallel replay requires a handler that is
//! commutative with respect to event order. Retries only ever wrap handler
//! invocations, never store reads.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    config::{ReplayConfig, ReplayStrategy},
    error::{EventError, Result},
    event::{Event, EventType},
    store::{EventStore, Snapshot},
};

/// Domain hook replayed events are driven through.
#[async_trait]
pub trait ReplayHandler: Send + Sync {
    /// Filter applied before [`handle`](Self::handle); events this returns
    /// `false` for are not counted toward replay totals.
    fn can_handle(&self, event: &Event) -> bool;

    async fn handle(&self, event: &Event) -> anyhow::Result<()>;

    fn handler_type(&self) -> &str;
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplayProgress {
    pub total_events: u64,
    pub processed_events: u64,
    pub failed_events: u64,
    pub current_version: u64,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub percentage: f64,
    pub is_complete: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl ReplayProgress {
    fn new(total_events: u64) -> Self {
        Self {
            total_events,
            processed_events: 0,
            failed_events: 0,
            current_version: 0,
            started_at: Utc::now(),
            elapsed: Duration::ZERO,
            percentage: if total_events == 0 { 100.0 } else { 0.0 },
            is_complete: false,
            last_error: None,
        }
    }

    fn touch_percentage(&mut self) {
        if self.total_events > 0 {
            self.percentage =
                (self.processed_events + self.failed_events) as f64 / self.total_events as f64
                    * 100.0;
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReplayStats {
    pub total_replays: u64,
    pub successful_replays: u64,
    pub failed_replays: u64,
    pub total_events_replayed: u64,
    pub average_replay_time: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_replay_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_replay_error: Option<String>,
}

pub struct ReplayEngine {
    store: Arc<dyn EventStore>,
    config: ReplayConfig,
    stats: RwLock<ReplayStats>,
    shutdown: CancellationToken,
}

impl ReplayEngine {
    pub fn new(store: Arc<dyn EventStore>, config: ReplayConfig) -> Self {
        Self {
            store,
            config,
            stats: RwLock::new(ReplayStats::default()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Cancels all in-flight replays; they return [`EventError::Cancelled`]
    /// promptly.
    pub fn cancel(&self) {
        self.shutdown.cancel();
    }

    pub fn stats(&self) -> ReplayStats {
        self.stats.read().clone()
    }

    /// Replays events for one aggregate with
    /// `from_version <= version <= to_version` (`to_version == 0` is
    /// open-ended) using the configured strategy.
    pub async fn replay_events(
        &self,
        aggregate_id: &str,
        from_version: u64,
        to_version: u64,
        handler: Arc<dyn ReplayHandler>,
    ) -> Result<ReplayProgress> {
        let events = self.store.get_events(aggregate_id, from_version, to_version)?;
        self.execute(events, handler, self.config.strategy).await
    }

    pub async fn replay_all_events(
        &self,
        aggregate_id: &str,
        handler: Arc<dyn ReplayHandler>,
    ) -> Result<ReplayProgress> {
        let events = self.store.get_all_events(aggregate_id)?;
        self.execute(events, handler, self.config.strategy).await
    }

    /// Replays events of one type recorded at or after `from_time`, always
    /// sequentially.
    pub async fn replay_events_by_type(
        &self,
        event_type: &EventType,
        from_time: DateTime<Utc>,
        handler: Arc<dyn ReplayHandler>,
    ) -> Result<ReplayProgress> {
        let events: Vec<Event> = self
            .store
            .get_events_by_type(event_type, 0)?
            .into_iter()
            .filter(|event| event.timestamp >= from_time)
            .collect();
        self.execute(events, handler, ReplayStrategy::Sequential).await
    }

    /// Incremental rebuild: loads the aggregate's snapshot and replays only
    /// events with `version > snapshot_version`. The snapshot is returned so
    /// the caller can seed handler state; for a deterministic handler the end
    /// state matches a full sequential replay from version 1.
    pub async fn replay_from_snapshot(
        &self,
        aggregate_id: &str,
        snapshot_version: u64,
        handler: Arc<dyn ReplayHandler>,
    ) -> Result<(Snapshot, ReplayProgress)> {
        let snapshot = self.store.get_snapshot(aggregate_id)?;
        let events = self.store.get_events(aggregate_id, snapshot_version + 1, 0)?;
        let progress = self
            .execute(events, handler, ReplayStrategy::Sequential)
            .await?;
        Ok((snapshot, progress))
    }

    /// Time travel: replays versions `1..=target_version` sequentially to
    /// reconstruct a point-in-time state inside the handler.
    pub async fn replay_to_state(
        &self,
        aggregate_id: &str,
        target_version: u64,
        handler: Arc<dyn ReplayHandler>,
    ) -> Result<ReplayProgress> {
        let events = self.store.get_events(aggregate_id, 1, target_version)?;
        self.execute(events, handler, ReplayStrategy::Sequential).await
    }

    async fn execute(
        &self,
        events: Vec<Event>,
        handler: Arc<dyn ReplayHandler>,
        strategy: ReplayStrategy,
    ) -> Result<ReplayProgress> {
        self.stats.write().total_replays += 1;

        let events: Vec<Event> = events
            .into_iter()
            .filter(|event| handler.can_handle(event))
            .collect();
        let mut progress = ReplayProgress::new(events.len() as u64);
        let started = Instant::now();

        let outcome = if events.is_empty() {
            Ok(())
        } else {
            match strategy {
                ReplayStrategy::Sequential => {
                    self.replay_sequential(&events, &handler, &mut progress).await
                }
                ReplayStrategy::Parallel => {
                    self.replay_parallel(&events, &handler, &mut progress).await
                }
                ReplayStrategy::Batch => self.replay_batch(&events, &handler, &mut progress).await,
            }
        };

        progress.elapsed = started.elapsed();
        let mut stats = self.stats.write();
        match outcome {
            Ok(()) => {
                progress.is_complete = true;
                stats.successful_replays += 1;
                stats.total_events_replayed += progress.processed_events;
                stats.last_replay_time = Some(Utc::now());
                let completed = stats.successful_replays as u32;
                stats.average_replay_time = if completed <= 1 {
                    progress.elapsed
                } else {
                    (stats.average_replay_time * (completed - 1) + progress.elapsed) / completed
                };
                debug!(
                    handler = handler.handler_type(),
                    processed = progress.processed_events,
                    failed = progress.failed_events,
                    "replay completed"
                );
                Ok(progress)
            }
            Err(err) => {
                stats.failed_replays += 1;
                stats.last_replay_error = Some(err.to_string());
                Err(err)
            }
        }
    }

    async fn replay_sequential(
        &self,
        events: &[Event],
        handler: &Arc<dyn ReplayHandler>,
        progress: &mut ReplayProgress,
    ) -> Result<()> {
        for event in events {
            if self.shutdown.is_cancelled() {
                return Err(EventError::Cancelled);
            }
            match handle_with_retry(
                handler.as_ref(),
                event,
                self.config.max_retries,
                self.config.retry_delay,
                &self.shutdown,
            )
            .await
            {
                Ok(()) => {
                    progress.processed_events += 1;
                    progress.current_version = event.version;
                }
                Err(err) => {
                    progress.failed_events += 1;
                    progress.last_error = Some(err.to_string());
                    if self.config.stop_on_error {
                        return Err(EventError::ReplayFailed {
                            version: event.version,
                            source: err,
                        });
                    }
                    warn!(
                        event_id = %event.id,
                        version = event.version,
                        error = %err,
                        "event replay failed"
                    );
                }
            }
            progress.touch_percentage();
        }
        Ok(())
    }

    async fn replay_parallel(
        &self,
        events: &[Event],
        handler: &Arc<dyn ReplayHandler>,
        progress: &mut ReplayProgress,
    ) -> Result<()> {
        let workers = self.config.parallel_workers.max(1);
        let shared = Arc::new(Mutex::new(progress.clone()));
        let stop = Arc::new(AtomicBool::new(false));
        let failure: Arc<Mutex<Option<(u64, String)>>> = Arc::new(Mutex::new(None));

        let mut buckets: Vec<Vec<Event>> = vec![Vec::new(); workers];
        for (index, event) in events.iter().enumerate() {
            buckets[index % workers].push(event.clone());
        }

        let mut handles = Vec::new();
        for bucket in buckets.into_iter().filter(|bucket| !bucket.is_empty()) {
            let handler = handler.clone();
            let shared = shared.clone();
            let stop = stop.clone();
            let failure = failure.clone();
            let shutdown = self.shutdown.clone();
            let max_retries = self.config.max_retries;
            let retry_delay = self.config.retry_delay;
            let stop_on_error = self.config.stop_on_error;

            handles.push(tokio::spawn(async move {
                for event in bucket {
                    if shutdown.is_cancelled() || stop.load(Ordering::Relaxed) {
                        return;
                    }
                    match handle_with_retry(
                        handler.as_ref(),
                        &event,
                        max_retries,
                        retry_delay,
                        &shutdown,
                    )
                    .await
                    {
                        Ok(()) => {
                            let mut progress = shared.lock();
                            progress.processed_events += 1;
                            if event.version > progress.current_version {
                                progress.current_version = event.version;
                            }
                            progress.touch_percentage();
                        }
                        Err(err) => {
                            let message = err.to_string();
                            {
                                let mut progress = shared.lock();
                                progress.failed_events += 1;
                                progress.last_error = Some(message.clone());
                                progress.touch_percentage();
                            }
                            warn!(
                                event_id = %event.id,
                                version = event.version,
                                error = %message,
                                "event replay failed"
                            );
                            if stop_on_error {
                                failure.lock().get_or_insert((event.version, message));
                                stop.store(true, Ordering::Relaxed);
                                return;
                            }
                        }
                    }
                }
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }
        *progress = shared.lock().clone();

        if self.shutdown.is_cancelled() {
            return Err(EventError::Cancelled);
        }
        if let Some((version, message)) = failure.lock().take() {
            return Err(EventError::ReplayFailed {
                version,
                source: anyhow::anyhow!(message),
            });
        }
        Ok(())
    }

    async fn replay_batch(
        &self,
        events: &[Event],
        handler: &Arc<dyn ReplayHandler>,
        progress: &mut ReplayProgress,
    ) -> Result<()> {
        let batch_size = self.config.batch_size.max(1);
        for chunk in events.chunks(batch_size) {
            self.replay_sequential(chunk, handler, progress).await?;
        }
        Ok(())
    }
}

async fn handle_with_retry(
    handler: &dyn ReplayHandler,
    event: &Event,
    max_retries: u32,
    retry_delay: Duration,
    shutdown: &CancellationToken,
) -> anyhow::Result<()> {
    let mut attempt = 0;
    loop {
        match handler.handle(event).await {
            Ok(()) => return Ok(()),
            Err(err) => {
                if attempt >= max_retries {
                    return Err(err);
                }
                attempt += 1;
                tokio::select! {
                    _ = tokio::time::sleep(retry_delay) => {}
                    _ = shutdown.cancelled() => return Err(err),
                }
            }
        }
    }
}
