//! Embedded event-sourcing engine.
//!
//! `eventcore` is the event backbone of an MCP operations platform: an
//! append-only, per-aggregate-versioned event log with snapshotting,
//! compaction, pruning, and live streaming, plus the three engines built on
//! top of it: replay, projections, and version/conflict arbitration. It is a
//! pure library: no wire protocol, no CLI; other in-process subsystems
//! consume it through the [`EventStore`] contract and the handler traits.
//!
//! # Overview
//!
//! - [`store`]: [`MemoryEventStore`], the in-memory reference implementation
//!   of the [`EventStore`] contract. Disk-backed or replicated stores plug in
//!   behind the same trait.
//! - [`versioning`]: per-aggregate version ledger with four conflict
//!   resolution policies.
//! - [`replay`]: sequential / parallel / batch replay of stored events
//!   through a [`ReplayHandler`], with retries and progress accounting.
//! - [`projection`]: registry of live views fed by a sharded worker pool,
//!   with full rebuild from history.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use eventcore::{
//!     Event, EventStore, EventStoreConfig, EventType, MemoryEventStore,
//! };
//! use serde_json::json;
//!
//! # fn main() -> eventcore::Result<()> {
//! let store = Arc::new(MemoryEventStore::new(EventStoreConfig::default()));
//! let event = Event::builder("order-1", "order", EventType::Create)
//!     .version(1)
//!     .data(json!({ "status": "created" }))
//!     .build(store.id_generator());
//! store.save_event(event)?;
//! assert_eq!(store.get_aggregate_info("order-1")?.version, 1);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod event;
pub mod logging;
pub mod projection;
pub mod replay;
pub mod snowflake;
pub mod store;
pub mod versioning;

pub use config::{
    ConflictResolution, EventStoreConfig, ProjectionConfig, ReplayConfig, ReplayStrategy,
    VersioningConfig, VersioningStrategy,
};
pub use error::{EventError, Result};
pub use event::{Event, EventBuilder, EventType};
pub use projection::{
    Projection, ProjectionEngine, ProjectionFilter, ProjectionHandler, ProjectionHealth,
    ProjectionMetrics, ProjectionState, ProjectionStats, ProjectionType,
};
pub use replay::{ReplayEngine, ReplayHandler, ReplayProgress, ReplayStats};
pub use snowflake::{EventIdGenerator, SnowflakeId};
pub use store::{
    AggregateInfo, EventStore, EventStoreHealth, EventStoreInfo, EventStoreStats, EventStream,
    MemoryEventStore, Snapshot,
};
pub use versioning::{
    EventVersioning, VersionConflict, VersionHistoryEntry, VersionInfo, VersioningStats,
};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
