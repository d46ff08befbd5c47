//! Per-aggregate version ledger and conflict arbitration.
//!
//! Every write is expected to land at `current + 1`. When a caller supplies a
//! version that disagrees, the mismatch is recorded as a [`VersionConflict`]
//! and resolved by the configured [`ConflictResolution`] policy; only the
//! `Reject` policy surfaces as an error.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::debug;

use crate::{
    config::VersioningConfig,
    error::{EventError, Result},
    event::{Event, EventType},
    store::EventStore,
};

/// Version ledger for one aggregate, lazily seeded from the store's
/// [`AggregateInfo`](crate::store::AggregateInfo) on first access.
#[derive(Debug, Clone, Serialize)]
pub struct VersionInfo {
    pub aggregate_id: String,
    pub aggregate_type: String,
    pub current_version: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_event_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_event_time: Option<DateTime<Utc>>,
    pub history: VecDeque<VersionHistoryEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VersionHistoryEntry {
    pub version: u64,
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
}

/// Record of an expected-vs-actual version mismatch. Appended to the
/// per-aggregate conflict log; never deleted automatically.
#[derive(Debug, Clone, Serialize)]
pub struct VersionConflict {
    pub aggregate_id: String,
    pub expected_version: u64,
    pub actual_version: u64,
    pub occurred_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct VersioningStats {
    pub total_versions: u64,
    pub total_conflicts: u64,
    pub resolved_conflicts: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_conflict: Option<DateTime<Utc>>,
    pub version_distribution: BTreeMap<u64, u64>,
}

struct VersioningInner {
    versions: HashMap<String, VersionInfo>,
    conflicts: HashMap<String, Vec<VersionConflict>>,
    stats: VersioningStats,
}

pub struct EventVersioning {
    store: Arc<dyn EventStore>,
    config: VersioningConfig,
    inner: RwLock<VersioningInner>,
}

impl EventVersioning {
    pub fn new(store: Arc<dyn EventStore>, config: VersioningConfig) -> Self {
        Self {
            store,
            config,
            inner: RwLock::new(VersioningInner {
                versions: HashMap::new(),
                conflicts: HashMap::new(),
                stats: VersioningStats::default(),
            }),
        }
    }

    /// Version ledger for an aggregate. Unknown aggregates (no stored events)
    /// are an error here; the write path seeds them instead.
    pub fn get_version(&self, aggregate_id: &str) -> Result<VersionInfo> {
        if let Some(info) = self.inner.read().versions.get(aggregate_id) {
            return Ok(info.clone());
        }

        let meta = self.store.get_aggregate_info(aggregate_id)?;
        let mut inner = self.inner.write();
        let info = inner
            .versions
            .entry(aggregate_id.to_string())
            .or_insert_with(|| VersionInfo {
                aggregate_id: aggregate_id.to_string(),
                aggregate_type: meta.aggregate_type.clone(),
                current_version: meta.version,
                last_event_id: None,
                last_event_time: None,
                history: VecDeque::new(),
            });
        Ok(info.clone())
    }

    /// Resolves the version the event should be stored at and advances the
    /// ledger. The returned version is what the caller stamps on the event
    /// before handing it to the store.
    pub fn increment_version(&self, event: &Event) -> Result<u64> {
        let mut inner = self.inner.write();

        if !inner.versions.contains_key(&event.aggregate_id) {
            let seed = match self.store.get_aggregate_info(&event.aggregate_id) {
                Ok(meta) => (meta.aggregate_type, meta.version),
                // First write for a brand-new aggregate bootstraps at zero.
                Err(EventError::AggregateNotFound(_)) => (event.aggregate_type.clone(), 0),
                Err(err) => return Err(err),
            };
            inner.versions.insert(
                event.aggregate_id.clone(),
                VersionInfo {
                    aggregate_id: event.aggregate_id.clone(),
                    aggregate_type: seed.0,
                    current_version: seed.1,
                    last_event_id: None,
                    last_event_time: None,
                    history: VecDeque::new(),
                },
            );
        }

        let expected = inner
            .versions
            .get(&event.aggregate_id)
            .expect("version info present after seeding")
            .current_version
            + 1;

        let mut new_version = expected;
        if event.version != 0 && event.version != expected {
            let now = Utc::now();
            let mut conflict = VersionConflict {
                aggregate_id: event.aggregate_id.clone(),
                expected_version: expected,
                actual_version: event.version,
                occurred_at: now,
                resolution: None,
            };
            inner.stats.total_conflicts += 1;
            inner.stats.last_conflict = Some(now);

            match self
                .config
                .conflict_resolution
                .resolve(expected, event.version)
            {
                None => {
                    conflict.resolution = Some("rejected".to_string());
                    inner
                        .conflicts
                        .entry(event.aggregate_id.clone())
                        .or_default()
                        .push(conflict);
                    return Err(EventError::VersionConflictRejected {
                        aggregate_id: event.aggregate_id.clone(),
                        expected,
                        actual: event.version,
                    });
                }
                Some(resolved) => {
                    conflict.resolution = Some(format!("resolved to {resolved}"));
                    inner.stats.resolved_conflicts += 1;
                    inner
                        .conflicts
                        .entry(event.aggregate_id.clone())
                        .or_default()
                        .push(conflict);
                    new_version = resolved;
                }
            }
        }

        let enable_history = self.config.enable_history;
        let retention = self.config.history_retention;
        let info = inner
            .versions
            .get_mut(&event.aggregate_id)
            .expect("version info present after seeding");
        info.current_version = new_version;
        info.last_event_id = Some(event.id.clone());
        info.last_event_time = Some(event.timestamp);
        if enable_history {
            info.history.push_back(VersionHistoryEntry {
                version: new_version,
                event_id: event.id.clone(),
                timestamp: event.timestamp,
                event_type: event.event_type.clone(),
            });
            while info.history.len() > retention {
                info.history.pop_front();
            }
        }

        inner.stats.total_versions += 1;
        *inner
            .stats
            .version_distribution
            .entry(new_version)
            .or_insert(0) += 1;

        debug!(
            aggregate_id = %event.aggregate_id,
            version = new_version,
            "version incremented"
        );
        Ok(new_version)
    }

    /// Optimistic-concurrency check. A mismatch is recorded as a conflict
    /// even though nothing is written.
    pub fn validate_version(&self, aggregate_id: &str, expected_version: u64) -> Result<()> {
        let current = self.get_version(aggregate_id)?.current_version;
        if current == expected_version {
            return Ok(());
        }

        let now = Utc::now();
        let mut inner = self.inner.write();
        inner.stats.total_conflicts += 1;
        inner.stats.last_conflict = Some(now);
        inner
            .conflicts
            .entry(aggregate_id.to_string())
            .or_default()
            .push(VersionConflict {
                aggregate_id: aggregate_id.to_string(),
                expected_version,
                actual_version: current,
                occurred_at: now,
                resolution: None,
            });
        Err(EventError::VersionMismatch {
            aggregate_id: aggregate_id.to_string(),
            expected: expected_version,
            actual: current,
        })
    }

    /// Applies the configured policy to an existing conflict record.
    pub fn resolve_version_conflict(&self, conflict: &VersionConflict) -> Result<u64> {
        self.config
            .conflict_resolution
            .resolve(conflict.expected_version, conflict.actual_version)
            .ok_or(EventError::VersionConflictRejected {
                aggregate_id: conflict.aggregate_id.clone(),
                expected: conflict.expected_version,
                actual: conflict.actual_version,
            })
    }

    /// Last `limit` history entries for an aggregate; `limit == 0` means all.
    pub fn version_history(
        &self,
        aggregate_id: &str,
        limit: usize,
    ) -> Result<Vec<VersionHistoryEntry>> {
        let info = self.get_version(aggregate_id)?;
        let history: Vec<VersionHistoryEntry> = info.history.into_iter().collect();
        if limit > 0 && limit < history.len() {
            Ok(history[history.len() - limit..].to_vec())
        } else {
            Ok(history)
        }
    }

    pub fn conflicts(&self, aggregate_id: &str) -> Vec<VersionConflict> {
        self.inner
            .read()
            .conflicts
            .get(aggregate_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn stats(&self) -> VersioningStats {
        self.inner.read().stats.clone()
    }
}
