use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use eventcore::{
    Event, EventError, EventStore, EventStoreConfig, EventType, MemoryEventStore, Projection,
    ProjectionConfig, ProjectionEngine, ProjectionFilter, ProjectionHandler, ProjectionType,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::Notify;

/// Counts matching events into the projection's `data` and records the
/// versions it saw; optionally fails every call or blocks on a gate.
struct CountingHandler {
    seen: Mutex<Vec<u64>>,
    always_fail: bool,
    gate: Option<Arc<Notify>>,
}

impl CountingHandler {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(Vec::new()),
            always_fail: false,
            gate: None,
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(Vec::new()),
            always_fail: true,
            gate: None,
        })
    }

    fn gated(gate: Arc<Notify>) -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(Vec::new()),
            always_fail: false,
            gate: Some(gate),
        })
    }

    fn versions(&self) -> Vec<u64> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl ProjectionHandler for CountingHandler {
    fn can_handle(&self, _event: &Event) -> bool {
        true
    }

    async fn project(
        &self,
        event: &Event,
        projection: &Projection,
    ) -> anyhow::Result<Option<Value>> {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if self.always_fail {
            return Err(anyhow!("handler failure"));
        }
        self.seen.lock().push(event.version);
        let count = projection.data["count"].as_u64().unwrap_or(0) + 1;
        Ok(Some(json!({ "count": count })))
    }

    fn handler_type(&self) -> &str {
        "counting"
    }
}

fn store() -> Arc<MemoryEventStore> {
    Arc::new(MemoryEventStore::new(EventStoreConfig::default()))
}

fn update(store: &MemoryEventStore, aggregate_id: &str, version: u64) -> Event {
    Event::builder(aggregate_id, "order", EventType::Update)
        .version(version)
        .data(json!({ "version": version }))
        .build(store.id_generator())
}

fn order_projection(id: &str) -> Projection {
    Projection::new(
        id,
        format!("{id} view"),
        ProjectionType::State,
        vec![EventType::Create, EventType::Update],
    )
}

async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn create_validates_required_fields() {
    let engine = ProjectionEngine::new(ProjectionConfig::default(), store());

    let mut missing_id = order_projection("");
    missing_id.id = String::new();
    assert!(matches!(
        engine.create_projection(missing_id, CountingHandler::new()),
        Err(EventError::InvalidProjection(_))
    ));

    let no_types = Projection::new("p1", "orders", ProjectionType::State, Vec::new());
    assert!(matches!(
        engine.create_projection(no_types, CountingHandler::new()),
        Err(EventError::InvalidProjection(_))
    ));

    engine
        .create_projection(order_projection("p1"), CountingHandler::new())
        .unwrap();
    assert!(matches!(
        engine.create_projection(order_projection("p1"), CountingHandler::new()),
        Err(EventError::InvalidProjection(_))
    ));

    let state = engine.projection_state("p1").unwrap();
    assert_eq!(state.events_processed, 0);
    assert_eq!(state.errors_count, 0);
    engine.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn projection_limit_is_enforced() {
    let engine = ProjectionEngine::new(
        ProjectionConfig {
            max_projections: 1,
            ..ProjectionConfig::default()
        },
        store(),
    );
    engine
        .create_projection(order_projection("p1"), CountingHandler::new())
        .unwrap();
    assert!(matches!(
        engine.create_projection(order_projection("p2"), CountingHandler::new()),
        Err(EventError::ProjectionLimitReached(1))
    ));
    engine.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_projection_is_isolated_from_healthy_one() -> Result<()> {
    let store = store();
    let engine = ProjectionEngine::new(ProjectionConfig::default(), store.clone());

    let healthy = CountingHandler::new();
    let broken = CountingHandler::failing();
    engine.create_projection(order_projection("healthy"), healthy.clone())?;
    engine.create_projection(order_projection("broken"), broken)?;

    store.save_event(update(&store, "order-1", 1))?;
    engine.process_event(store.get_all_events("order-1")?.remove(0))?;

    wait_until("both projections to observe the event", || {
        let healthy = engine.projection_state("healthy").unwrap();
        let broken = engine.projection_state("broken").unwrap();
        healthy.events_processed == 1 && broken.errors_count == 1
    })
    .await;

    let healthy_state = engine.projection_state("healthy")?;
    assert_eq!(healthy_state.events_processed, 1);
    assert_eq!(healthy_state.errors_count, 0);
    assert_eq!(healthy_state.last_version, 1);

    let broken_state = engine.projection_state("broken")?;
    assert_eq!(broken_state.events_processed, 0);
    assert_eq!(broken_state.errors_count, 1);
    assert!(broken_state.error_message.unwrap().contains("handler failure"));
    engine.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn live_events_of_one_aggregate_stay_ordered() -> Result<()> {
    let store = store();
    let engine = ProjectionEngine::new(ProjectionConfig::default(), store.clone());
    let handler = CountingHandler::new();
    engine.create_projection(order_projection("orders"), handler.clone())?;

    for version in 1..=20 {
        store.save_event(update(&store, "order-1", version))?;
    }
    engine.process_events(store.get_all_events("order-1")?)?;

    wait_until("all events to be projected", || {
        handler.versions().len() == 20
    })
    .await;
    let expected: Vec<u64> = (1..=20).collect();
    assert_eq!(handler.versions(), expected);

    let projection = engine.get_projection("orders")?;
    assert_eq!(projection.data["count"], 20);
    engine.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn aggregate_filters_scope_the_live_path() -> Result<()> {
    let store = store();
    let engine = ProjectionEngine::new(ProjectionConfig::default(), store.clone());
    let handler = CountingHandler::new();
    let projection = order_projection("order-1-only").for_aggregate("order-1");
    engine.create_projection(projection, handler.clone())?;

    store.save_event(update(&store, "order-1", 1))?;
    store.save_event(update(&store, "order-2", 1))?;
    engine.process_events(store.get_events_by_time_range(
        chrono::DateTime::<chrono::Utc>::MIN_UTC,
        chrono::Utc::now(),
        0,
    )?)?;

    wait_until("the matching event to be projected", || {
        !handler.versions().is_empty()
    })
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(handler.versions().len(), 1);

    let state = engine.projection_state("order-1-only")?;
    assert_eq!(state.events_processed, 1);
    engine.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn inactive_projections_are_skipped() -> Result<()> {
    let store = store();
    let engine = ProjectionEngine::new(ProjectionConfig::default(), store.clone());
    let active = CountingHandler::new();
    let dormant = CountingHandler::new();
    engine.create_projection(order_projection("active"), active.clone())?;
    engine.create_projection(order_projection("dormant").inactive(), dormant.clone())?;

    store.save_event(update(&store, "order-1", 1))?;
    engine.process_event(store.get_all_events("order-1")?.remove(0))?;

    wait_until("the active projection to observe the event", || {
        !active.versions().is_empty()
    })
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(dormant.versions().is_empty());
    engine.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn attached_store_stream_feeds_the_engine() -> Result<()> {
    let store = store();
    let engine = ProjectionEngine::new(ProjectionConfig::default(), store.clone());
    let handler = CountingHandler::new();
    engine.create_projection(order_projection("orders"), handler.clone())?;

    let feed = engine.attach_stream(store.subscribe()?);
    for version in 1..=3 {
        store.save_event(update(&store, "order-1", version))?;
    }

    wait_until("streamed events to be projected", || {
        handler.versions().len() == 3
    })
    .await;
    assert_eq!(handler.versions(), vec![1, 2, 3]);

    engine.stop().await;
    feed.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn rebuild_replays_history_through_the_live_path() -> Result<()> {
    let store = store();
    for version in 1..=5 {
        store.save_event(update(&store, "order-1", version))?;
    }

    let engine = ProjectionEngine::new(ProjectionConfig::default(), store.clone());
    let handler = CountingHandler::new();
    engine.create_projection(
        order_projection("orders").for_aggregate("order-1"),
        handler.clone(),
    )?;

    engine.rebuild_projection("orders").await?;
    assert_eq!(handler.versions(), vec![1, 2, 3, 4, 5]);

    let state = engine.projection_state("orders")?;
    assert_eq!(state.events_processed, 5);
    assert_eq!(state.last_version, 5);
    assert_eq!(engine.get_projection("orders")?.data["count"], 5);

    // Rebuilding again starts from a zeroed state, not 10.
    engine.rebuild_projection("orders").await?;
    assert_eq!(engine.projection_state("orders")?.events_processed, 5);
    engine.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn rebuild_without_aggregate_uses_event_type_history() -> Result<()> {
    let store = store();
    for aggregate in ["order-1", "order-2"] {
        for version in 1..=2 {
            store.save_event(update(&store, aggregate, version))?;
        }
    }

    let engine = ProjectionEngine::new(ProjectionConfig::default(), store.clone());
    let handler = CountingHandler::new();
    engine.create_projection(
        Projection::new("all-updates", "updates", ProjectionType::Statistics, vec![
            EventType::Update,
        ]),
        handler.clone(),
    )?;

    engine.rebuild_projection("all-updates").await?;
    assert_eq!(engine.projection_state("all-updates")?.events_processed, 4);
    engine.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn rebuild_all_projections_covers_the_registry() -> Result<()> {
    let store = store();
    for version in 1..=3 {
        store.save_event(update(&store, "order-1", version))?;
    }

    let engine = ProjectionEngine::new(ProjectionConfig::default(), store.clone());
    engine.create_projection(
        order_projection("a").for_aggregate("order-1"),
        CountingHandler::new(),
    )?;
    engine.create_projection(
        order_projection("b").for_aggregate("order-1"),
        CountingHandler::new(),
    )?;

    engine.rebuild_all_projections().await?;
    assert_eq!(engine.projection_state("a")?.events_processed, 3);
    assert_eq!(engine.projection_state("b")?.events_processed, 3);
    engine.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn reset_zeroes_state_but_keeps_data() -> Result<()> {
    let store = store();
    for version in 1..=3 {
        store.save_event(update(&store, "order-1", version))?;
    }
    let engine = ProjectionEngine::new(ProjectionConfig::default(), store.clone());
    engine.create_projection(
        order_projection("orders").for_aggregate("order-1"),
        CountingHandler::new(),
    )?;
    engine.rebuild_projection("orders").await?;
    assert_eq!(engine.get_projection("orders")?.data["count"], 3);

    engine.reset_projection("orders")?;
    let state = engine.projection_state("orders")?;
    assert_eq!(state.events_processed, 0);
    assert_eq!(state.last_version, 0);
    assert_eq!(engine.projection_metrics("orders")?.events_processed, 0);
    // Materialized data is untouched by a reset.
    assert_eq!(engine.get_projection("orders")?.data["count"], 3);
    engine.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn list_projections_filters_and_paginates() -> Result<()> {
    let engine = ProjectionEngine::new(ProjectionConfig::default(), store());
    engine.create_projection(
        order_projection("p1").for_aggregate_type("order"),
        CountingHandler::new(),
    )?;
    engine.create_projection(
        order_projection("p2").for_aggregate_type("order"),
        CountingHandler::new(),
    )?;
    engine.create_projection(
        Projection::new("p3", "deletions", ProjectionType::Statistics, vec![
            EventType::Delete,
        ])
        .inactive(),
        CountingHandler::new(),
    )?;

    let all = engine.list_projections(&ProjectionFilter::default());
    assert_eq!(all.len(), 3);

    let stats_only = engine.list_projections(&ProjectionFilter {
        projection_type: Some(ProjectionType::Statistics),
        ..ProjectionFilter::default()
    });
    assert_eq!(stats_only.len(), 1);
    assert_eq!(stats_only[0].id, "p3");

    let active = engine.list_projections(&ProjectionFilter {
        is_active: Some(true),
        ..ProjectionFilter::default()
    });
    assert_eq!(active.len(), 2);

    let by_event_type = engine.list_projections(&ProjectionFilter {
        event_type: Some(EventType::Delete),
        ..ProjectionFilter::default()
    });
    assert_eq!(by_event_type.len(), 1);

    let page = engine.list_projections(&ProjectionFilter {
        offset: 1,
        limit: 1,
        ..ProjectionFilter::default()
    });
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].id, "p2");
    engine.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn update_and_delete_maintain_registry_stats() -> Result<()> {
    let engine = ProjectionEngine::new(ProjectionConfig::default(), store());
    engine.create_projection(order_projection("p1"), CountingHandler::new())?;
    engine.create_projection(order_projection("p2"), CountingHandler::new())?;
    assert_eq!(engine.stats().total_projections, 2);
    assert_eq!(engine.stats().active_projections, 2);

    let mut updated = engine.get_projection("p1")?;
    updated.is_active = false;
    engine.update_projection(updated)?;
    assert_eq!(engine.stats().active_projections, 1);

    engine.delete_projection("p2")?;
    assert_eq!(engine.stats().total_projections, 1);
    assert!(matches!(
        engine.get_projection("p2"),
        Err(EventError::ProjectionNotFound(_))
    ));
    engine.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_drains_queued_events_then_refuses_input() -> Result<()> {
    let store = store();
    let engine = ProjectionEngine::new(
        ProjectionConfig {
            batch_timeout: Duration::from_secs(5),
            ..ProjectionConfig::default()
        },
        store.clone(),
    );
    let handler = CountingHandler::new();
    engine.create_projection(order_projection("orders"), handler.clone())?;

    for version in 1..=10 {
        store.save_event(update(&store, "order-1", version))?;
    }
    engine.process_events(store.get_all_events("order-1")?)?;
    engine.stop().await;

    // Everything queued before the stop was still applied.
    assert_eq!(handler.versions().len(), 10);
    assert!(engine.is_stopped());
    assert!(matches!(
        engine.process_event(update(&store, "order-1", 11)),
        Err(EventError::EngineStopped)
    ));
    // Idempotent.
    engine.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn full_queues_drop_events_instead_of_blocking() -> Result<()> {
    let store = store();
    let gate = Arc::new(Notify::new());
    let engine = ProjectionEngine::new(
        ProjectionConfig {
            background_workers: 1,
            batch_size: 1,
            batch_timeout: Duration::from_millis(200),
            ..ProjectionConfig::default()
        },
        store.clone(),
    );
    let handler = CountingHandler::gated(gate.clone());
    engine.create_projection(order_projection("orders"), handler.clone())?;

    for version in 1..=8 {
        store.save_event(update(&store, "order-1", version))?;
    }
    // The worker parks on the gate, so the one-slot queues fill up and the
    // surplus is dropped; process_event itself never errors on overflow.
    for event in store.get_all_events("order-1")? {
        engine.process_event(event)?;
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    wait_until("drops to be recorded", || engine.stats().dropped_events > 0).await;
    for _ in 0..8 {
        gate.notify_one();
    }
    wait_until("the surviving events to be projected", || {
        !handler.versions().is_empty()
    })
    .await;
    assert!(handler.versions().len() < 8);
    engine.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn metrics_track_throughput_per_projection() -> Result<()> {
    let store = store();
    let engine = ProjectionEngine::new(
        ProjectionConfig {
            state_update_interval: Duration::from_millis(50),
            ..ProjectionConfig::default()
        },
        store.clone(),
    );
    let handler = CountingHandler::new();
    engine.create_projection(
        order_projection("orders").for_aggregate("order-1"),
        handler.clone(),
    )?;
    for version in 1..=5 {
        store.save_event(update(&store, "order-1", version))?;
    }
    engine.rebuild_projection("orders").await?;

    wait_until("throughput metrics to refresh", || {
        engine
            .projection_metrics("orders")
            .map(|metrics| metrics.events_per_second > 0.0)
            .unwrap_or(false)
    })
    .await;

    let metrics = engine.projection_metrics("orders")?;
    assert_eq!(metrics.events_processed, 5);
    assert_eq!(metrics.error_rate, 0.0);

    let stats = engine.stats();
    assert_eq!(stats.events_processed, 5);
    assert!(stats.background_workers > 0);
    engine.stop().await;
    Ok(())
}
