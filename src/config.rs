//! Plain configuration structs for each engine component.
//!
//! No environment or CLI parsing happens here; embedders construct these
//! directly (or deserialize them from whatever source their own config layer
//! uses) and hand them to the component constructors.

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_EVENT_SIZE: usize = 1024 * 1024;
pub const DEFAULT_STREAM_BUFFER_SIZE: usize = 10_000;
pub const DEFAULT_HISTORY_RETENTION: usize = 100;

/// Configuration for [`MemoryEventStore`](crate::store::MemoryEventStore).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventStoreConfig {
    /// Node identity (10 bits). `None` derives one from the process id.
    pub node_id: Option<u16>,
    /// Segment size hint for file-backed store implementations; the in-memory
    /// store only echoes it through `store_info`.
    pub max_events_per_file: u64,
    /// Retained event count above which the maintenance task auto-compacts an
    /// aggregate up to its newest snapshot. `0` disables auto-compaction.
    pub compaction_threshold: u64,
    /// Minimum age a snapshot must reach before auto-compaction trims the
    /// events beneath it.
    pub snapshot_interval: Duration,
    /// Number of snapshots retained per aggregate, oldest dropped first.
    pub snapshot_retention: usize,
    /// Upper bound on the encoded size of a single event.
    pub max_event_size: usize,
    /// When set, the maintenance task prunes events older than this age.
    pub event_ttl: Option<Duration>,
    /// Capacity of each subscriber/stream queue.
    pub stream_buffer_size: usize,
    /// Cadence of the optional background maintenance task.
    pub maintenance_interval: Duration,
}

impl Default for EventStoreConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            max_events_per_file: 10_000,
            compaction_threshold: 5_000,
            snapshot_interval: Duration::from_secs(60 * 60),
            snapshot_retention: 10,
            max_event_size: DEFAULT_MAX_EVENT_SIZE,
            event_ttl: None,
            stream_buffer_size: DEFAULT_STREAM_BUFFER_SIZE,
            maintenance_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VersioningStrategy {
    Sequential,
    Timestamp,
    VectorClock,
}

/// How a version conflict between the expected and the supplied version is
/// resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictResolution {
    Reject,
    AcceptHigher,
    AcceptLower,
    Increment,
}

impl ConflictResolution {
    /// Resolved version for a conflict, or `None` when the policy rejects the
    /// write outright.
    pub fn resolve(&self, expected: u64, actual: u64) -> Option<u64> {
        match self {
            ConflictResolution::Reject => None,
            ConflictResolution::AcceptHigher => Some(expected.max(actual)),
            ConflictResolution::AcceptLower => Some(expected.min(actual)),
            ConflictResolution::Increment => Some(actual + 1),
        }
    }
}

/// Configuration for [`EventVersioning`](crate::versioning::EventVersioning).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VersioningConfig {
    pub strategy: VersioningStrategy,
    pub enable_history: bool,
    /// Bounded history entries kept per aggregate, oldest dropped first.
    pub history_retention: usize,
    pub conflict_resolution: ConflictResolution,
}

impl Default for VersioningConfig {
    fn default() -> Self {
        Self {
            strategy: VersioningStrategy::Sequential,
            enable_history: true,
            history_retention: DEFAULT_HISTORY_RETENTION,
            conflict_resolution: ConflictResolution::Reject,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplayStrategy {
    /// One event at a time in version order; the only strategy with strict
    /// inter-event ordering.
    Sequential,
    /// Fixed worker pool, no ordering guarantee; requires an order-insensitive
    /// handler.
    Parallel,
    /// Sequential in chunks of `batch_size`; coarser progress reporting.
    Batch,
}

/// Configuration for [`ReplayEngine`](crate::replay::ReplayEngine).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    pub strategy: ReplayStrategy,
    pub batch_size: usize,
    pub parallel_workers: usize,
    /// `true` aborts the whole replay on a handler failure; `false` counts the
    /// event as failed and continues.
    pub stop_on_error: bool,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            strategy: ReplayStrategy::Sequential,
            batch_size: 1_000,
            parallel_workers: 16,
            stop_on_error: false,
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// Configuration for [`ProjectionEngine`](crate::projection::ProjectionEngine).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectionConfig {
    pub max_projections: usize,
    /// Worker pool size, fixed at construction.
    pub background_workers: usize,
    /// Per-worker queue capacity; the intake queue holds
    /// `batch_size * background_workers`.
    pub batch_size: usize,
    /// Grace period `stop()` waits for queued events to drain before
    /// cancelling the worker tasks.
    pub batch_timeout: Duration,
    /// Per-event handler retries during rebuild.
    pub retry_attempts: u32,
    /// Cadence of the throughput/health refresh task.
    pub state_update_interval: Duration,
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self {
            max_projections: 10_000,
            background_workers: 20,
            batch_size: 1_000,
            batch_timeout: Duration::from_secs(1),
            retry_attempts: 3,
            state_update_interval: Duration::from_secs(10),
        }
    }
}
