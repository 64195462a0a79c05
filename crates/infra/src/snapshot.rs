//! Aggregate state snapshots.
//!
//! A snapshot stores an aggregate's folded state together with the stream revision it
//! covers, so hydration can resume from there instead of from genesis.
//!
//! ## Design
//!
//! - One [`Snapshotter`] per aggregate type, configured by merging policies from left
//!   to right (global first, aggregate last).
//! - Hydration is bracketed by a [`SnapshotSession`]: `begin_session` loads the
//!   latest snapshot and starts the clock, `end_session` decides whether the hydrated
//!   status is worth persisting. The aggregate writes the returned record once the
//!   command attempt is over (after its append, if any).
//! - Whether a loaded snapshot is still usable (projector version) is decided by the
//!   aggregate, not here.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use chronicle_core::ExpectedRevision;

use crate::aggregate::AggregateStatus;
use crate::store::{Store, StoreError, StoreProvider, TableDefinition, to_record};

pub const SNAPSHOT_TABLE: &str = "snapshots";

/// A configuration field that can be left to an earlier policy, switched off, or set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Setting<T> {
    #[default]
    Inherit,
    Off,
    Value(T),
}

impl<T> Setting<T> {
    /// `next` wins unless it inherits.
    pub fn merge(self, next: Setting<T>) -> Setting<T> {
        match next {
            Setting::Inherit => self,
            other => other,
        }
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Setting::Value(v) => Some(v),
            _ => None,
        }
    }
}

/// Snapshot triggers and storage for an aggregate (or globally).
///
/// `store`: `Inherit` uses the runtime's internal store, `Off` disables storage.
#[derive(Clone, Default)]
pub struct SnapshotConfig {
    pub store: Setting<Arc<dyn StoreProvider>>,
    /// Snapshot whenever the aggregate version is a multiple of this count.
    pub event_count: Setting<u64>,
    /// Snapshot whenever hydration took longer than this.
    pub duration: Setting<Duration>,
}

impl fmt::Debug for SnapshotConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let store = match &self.store {
            Setting::Inherit => "inherit",
            Setting::Off => "off",
            Setting::Value(_) => "custom",
        };
        f.debug_struct("SnapshotConfig")
            .field("store", &store)
            .field("event_count", &self.event_count)
            .field("duration", &self.duration)
            .finish()
    }
}

impl SnapshotConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_store(mut self, provider: Arc<dyn StoreProvider>) -> Self {
        self.store = Setting::Value(provider);
        self
    }

    pub fn without_store(mut self) -> Self {
        self.store = Setting::Off;
        self
    }

    pub fn with_event_count(mut self, count: u64) -> Self {
        self.event_count = Setting::Value(count);
        self
    }

    pub fn without_event_count(mut self) -> Self {
        self.event_count = Setting::Off;
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Setting::Value(duration);
        self
    }

    pub fn without_duration(mut self) -> Self {
        self.duration = Setting::Off;
        self
    }

    fn merge(self, next: SnapshotConfig) -> SnapshotConfig {
        SnapshotConfig {
            store: self.store.merge(next.store),
            event_count: self.event_count.merge(next.event_count),
            duration: self.duration.merge(next.duration),
        }
    }
}

#[derive(Debug, Clone)]
pub enum SnapshotPolicy {
    Disabled,
    Enabled(SnapshotConfig),
}

impl From<SnapshotConfig> for SnapshotPolicy {
    fn from(value: SnapshotConfig) -> Self {
        SnapshotPolicy::Enabled(value)
    }
}

/// Merge policies from left to right; the rightmost has the highest priority.
///
/// An explicit `Disabled` resets to disabled, two absent policies stay disabled, and
/// otherwise fields of later policies override earlier ones.
pub fn merge_policies<I>(policies: I) -> Option<SnapshotConfig>
where
    I: IntoIterator<Item = Option<SnapshotPolicy>>,
{
    let mut policies = policies.into_iter();
    let mut current = policies.next().flatten();
    for next in policies {
        current = match (current, next) {
            (_, Some(SnapshotPolicy::Disabled)) => Some(SnapshotPolicy::Disabled),
            (None | Some(SnapshotPolicy::Disabled), None) => Some(SnapshotPolicy::Disabled),
            (Some(SnapshotPolicy::Enabled(config)), None) => Some(SnapshotPolicy::Enabled(config)),
            (None | Some(SnapshotPolicy::Disabled), Some(SnapshotPolicy::Enabled(next))) => {
                Some(SnapshotPolicy::Enabled(next))
            }
            (Some(SnapshotPolicy::Enabled(config)), Some(SnapshotPolicy::Enabled(next))) => {
                Some(SnapshotPolicy::Enabled(config.merge(next)))
            }
        };
    }
    match current {
        Some(SnapshotPolicy::Enabled(config)) => Some(config),
        _ => None,
    }
}

/// Persisted snapshot, stored in table [`SNAPSHOT_TABLE`] keyed by `aggregateId`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRecord {
    pub aggregate_id: String,
    pub aggregate_type: String,
    pub aggregate_version: u64,
    pub projector_version: u32,
    pub revision: ExpectedRevision,
    pub timestamp: DateTime<Utc>,
    pub state: JsonValue,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotKey<'a> {
    aggregate_id: &'a str,
}

/// Open hydration bracket returned by [`Snapshotter::begin_session`].
#[derive(Debug)]
pub struct SnapshotSession {
    /// Latest stored snapshot, `None` when disabled or nothing is stored.
    pub snapshot: Option<SnapshotRecord>,
    started: Instant,
}

impl SnapshotSession {
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

pub struct Snapshotter {
    aggregate_type: String,
    config: Option<SnapshotConfig>,
    store: Option<Arc<dyn Store>>,
}

impl fmt::Debug for Snapshotter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshotter")
            .field("aggregate_type", &self.aggregate_type)
            .field("config", &self.config)
            .field("store", &self.store.as_ref().map(|s| s.prefix().to_string()))
            .finish()
    }
}

impl Snapshotter {
    pub fn new(aggregate_type: impl Into<String>) -> Self {
        Self {
            aggregate_type: aggregate_type.into(),
            config: None,
            store: None,
        }
    }

    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    pub fn config(&self) -> Option<&SnapshotConfig> {
        self.config.as_ref()
    }

    pub fn is_enabled(&self) -> bool {
        self.config.is_some()
    }

    /// See [`merge_policies`].
    pub fn configure<I>(&mut self, policies: I) -> Option<&SnapshotConfig>
    where
        I: IntoIterator<Item = Option<SnapshotPolicy>>,
    {
        self.config = merge_policies(policies);
        self.config.as_ref()
    }

    /// Attach (and connect) the snapshot store; `None` detaches it.
    pub async fn set_store(&mut self, store: Option<Arc<dyn Store>>) -> Result<(), StoreError> {
        if let Some(store) = &store {
            store.define_tables(&[TableDefinition::new(SNAPSHOT_TABLE, ["aggregateId"])])?;
            store.connect().await?;
        }
        self.store = store;
        Ok(())
    }

    pub async fn get(&self, aggregate_id: &str) -> Result<Option<SnapshotRecord>, StoreError> {
        let Some(store) = &self.store else {
            return Ok(None);
        };
        let table = store.table(SNAPSHOT_TABLE)?;
        let key = to_record(&SnapshotKey { aggregate_id })?;
        match table.get(&key).await? {
            Some(record) => Ok(Some(serde_json::from_value(JsonValue::Object(record))?)),
            None => Ok(None),
        }
    }

    pub async fn set(&self, snapshot: &SnapshotRecord) -> Result<(), StoreError> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        store.table(SNAPSHOT_TABLE)?.set(to_record(snapshot)?).await
    }

    pub async fn remove(&self, aggregate_id: &str) -> Result<(), StoreError> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let key = to_record(&SnapshotKey { aggregate_id })?;
        store.table(SNAPSHOT_TABLE)?.remove(&key).await
    }

    pub async fn begin_session(&self, aggregate_id: &str) -> Result<SnapshotSession, StoreError> {
        let snapshot = if self.is_enabled() {
            self.get(aggregate_id).await?
        } else {
            None
        };
        Ok(SnapshotSession {
            snapshot,
            started: Instant::now(),
        })
    }

    /// Decide whether `status` should be snapshotted; returns the record to persist.
    pub fn end_session<S: Serialize>(
        &self,
        session: SnapshotSession,
        status: &AggregateStatus<S>,
    ) -> Result<Option<SnapshotRecord>, StoreError> {
        let Some(config) = &self.config else {
            return Ok(None);
        };

        let slow = config
            .duration
            .value()
            .is_some_and(|limit| session.elapsed() > *limit);
        let counted = config.event_count.value().is_some_and(|count| {
            *count > 0 && status.aggregate_version % count == 0
        });
        if !slow && !counted {
            return Ok(None);
        }

        Ok(Some(SnapshotRecord {
            aggregate_id: status.aggregate_id.clone(),
            aggregate_type: self.aggregate_type.clone(),
            aggregate_version: status.aggregate_version,
            projector_version: status.projector_version,
            revision: status.revision,
            timestamp: Utc::now(),
            state: serde_json::to_value(&status.state)?,
        }))
    }
}
