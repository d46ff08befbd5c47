use thiserror::Error;

pub type Result<T> = std::result::Result<T, EventError>;

#[derive(Debug, Error)]
pub enum EventError {
    #[error("invalid event: {0}")]
    InvalidEvent(String),
    #[error("event size {size} exceeds maximum allowed size {max}")]
    EventTooLarge { size: usize, max: usize },
    #[error("version gap detected for aggregate {aggregate_id}: expected {expected}, got {got}")]
    VersionGap {
        aggregate_id: String,
        expected: u64,
        got: u64,
    },
    #[error("first event version must be 1 for aggregate {aggregate_id}, got {got}")]
    FirstEventVersion { aggregate_id: String, got: u64 },
    #[error("aggregate not found: {0}")]
    AggregateNotFound(String),
    #[error("snapshot not found for aggregate: {0}")]
    SnapshotNotFound(String),
    #[error("version {version} not found for aggregate {aggregate_id}")]
    SnapshotVersionNotFound { aggregate_id: String, version: u64 },
    #[error("version mismatch for aggregate {aggregate_id}: expected {expected}, actual {actual}")]
    VersionMismatch {
        aggregate_id: String,
        expected: u64,
        actual: u64,
    },
    #[error(
        "version conflict rejected for aggregate {aggregate_id}: expected {expected}, got {actual}"
    )]
    VersionConflictRejected {
        aggregate_id: String,
        expected: u64,
        actual: u64,
    },
    #[error("invalid projection: {0}")]
    InvalidProjection(String),
    #[error("projection not found: {0}")]
    ProjectionNotFound(String),
    #[error("maximum projections limit reached: {0}")]
    ProjectionLimitReached(usize),
    #[error("event store is closed")]
    StoreClosed,
    #[error("projection engine is stopped")]
    EngineStopped,
    #[error("operation cancelled")]
    Cancelled,
    #[error("replay failed at version {version}: {source}")]
    ReplayFailed {
        version: u64,
        #[source]
        source: anyhow::Error,
    },
    #[error("handler failed: {0}")]
    Handler(#[source] anyhow::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
