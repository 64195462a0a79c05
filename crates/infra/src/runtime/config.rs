//! Runtime configuration.
//!
//! [`RuntimeConfig`] is assembled in code with `with_*` builders; deployment knobs can
//! be layered on top from the environment through [`RuntimeSettings`].

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use chronicle_events::EventCaster;

use crate::aggregate::AggregateDispatch;
use crate::event_store::{EventStore, InMemoryEventStore};
use crate::projections::Projector;
use crate::read_model::ReadModel;
use crate::scheduler::Scheduler;
use crate::snapshot::{Setting, SnapshotConfig, SnapshotPolicy};
use crate::store::{InMemoryStoreProvider, StoreProvider};

/// Store name that always resolves to the internal store provider.
pub const DEFAULT_STORE: &str = "default";

pub const AUTOSTART_ENV: &str = "CHRONICLE_AUTOSTART";
pub const SNAPSHOT_EVENT_COUNT_ENV: &str = "CHRONICLE_SNAPSHOT_EVENT_COUNT";
pub const SNAPSHOT_DURATION_ENV: &str = "CHRONICLE_SNAPSHOT_DURATION_MS";

pub struct RuntimeConfig {
    pub event_store: Arc<dyn EventStore>,
    /// Catalog of known event definitions and their version transforms.
    pub events: EventCaster,
    pub aggregates: Vec<Box<dyn AggregateDispatch>>,
    pub projectors: Vec<Projector>,
    pub read_models: Vec<ReadModel>,
    /// Backs runtime bookkeeping (projection configuration, default snapshots).
    pub internal_store: Arc<dyn StoreProvider>,
    /// Named providers projections can be materialized into.
    pub stores: HashMap<String, Arc<dyn StoreProvider>>,
    /// Global snapshot policy, merged under each aggregate's own.
    pub snapshots: Option<SnapshotPolicy>,
    pub autostart: bool,
    pub scheduler: Option<Arc<dyn Scheduler>>,
}

impl fmt::Debug for RuntimeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeConfig")
            .field(
                "aggregates",
                &self.aggregates.iter().map(|a| a.aggregate_type()).collect::<Vec<_>>(),
            )
            .field(
                "projectors",
                &self.projectors.iter().map(Projector::display_name).collect::<Vec<_>>(),
            )
            .field(
                "read_models",
                &self.read_models.iter().map(ReadModel::name).collect::<Vec<_>>(),
            )
            .field("stores", &self.stores.keys().collect::<Vec<_>>())
            .field("snapshots", &self.snapshots)
            .field("autostart", &self.autostart)
            .field("scheduler", &self.scheduler.is_some())
            .finish()
    }
}

impl RuntimeConfig {
    pub fn new(event_store: Arc<dyn EventStore>, internal_store: Arc<dyn StoreProvider>) -> Self {
        let mut stores = HashMap::new();
        stores.insert(DEFAULT_STORE.to_string(), Arc::clone(&internal_store));
        Self {
            event_store,
            events: EventCaster::new(),
            aggregates: Vec::new(),
            projectors: Vec::new(),
            read_models: Vec::new(),
            internal_store,
            stores,
            snapshots: None,
            autostart: true,
            scheduler: None,
        }
    }

    /// Everything in memory; for tests and local development.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryEventStore::new()), Arc::new(InMemoryStoreProvider::new()))
    }

    pub fn with_events(mut self, events: EventCaster) -> Self {
        self.events = events;
        self
    }

    pub fn with_aggregate<A: AggregateDispatch + 'static>(mut self, aggregate: A) -> Self {
        self.aggregates.push(Box::new(aggregate));
        self
    }

    pub fn with_projector(mut self, projector: Projector) -> Self {
        self.projectors.push(projector);
        self
    }

    pub fn with_read_model(mut self, read_model: ReadModel) -> Self {
        self.read_models.push(read_model);
        self
    }

    pub fn with_store(mut self, name: impl Into<String>, provider: Arc<dyn StoreProvider>) -> Self {
        self.stores.insert(name.into(), provider);
        self
    }

    pub fn with_snapshots(mut self, policy: SnapshotPolicy) -> Self {
        self.snapshots = Some(policy);
        self
    }

    pub fn with_autostart(mut self, autostart: bool) -> Self {
        self.autostart = autostart;
        self
    }

    pub fn with_scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Apply environment overrides. Snapshot settings enable global snapshots.
    pub fn with_settings(mut self, settings: &RuntimeSettings) -> Self {
        if let Some(autostart) = settings.autostart {
            self.autostart = autostart;
        }
        if settings.snapshot_event_count.is_none() && settings.snapshot_duration.is_none() {
            return self;
        }

        let mut config = match self.snapshots.take() {
            Some(SnapshotPolicy::Enabled(config)) => config,
            _ => SnapshotConfig::new(),
        };
        if let Some(count) = settings.snapshot_event_count {
            config.event_count = Setting::Value(count);
        }
        if let Some(duration) = settings.snapshot_duration {
            config.duration = Setting::Value(duration);
        }
        self.snapshots = Some(SnapshotPolicy::Enabled(config));
        self
    }
}

/// Deployment overrides read from the environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeSettings {
    pub autostart: Option<bool>,
    pub snapshot_event_count: Option<u64>,
    pub snapshot_duration: Option<Duration>,
}

impl RuntimeSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like [`RuntimeSettings::from_env`] with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            autostart: parse_var(&lookup, AUTOSTART_ENV),
            snapshot_event_count: parse_var::<u64, _>(&lookup, SNAPSHOT_EVENT_COUNT_ENV)
                .filter(|count| *count > 0),
            snapshot_duration: parse_var(&lookup, SNAPSHOT_DURATION_ENV).map(Duration::from_millis),
        }
    }
}

fn parse_var<T, F>(lookup: &F, name: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(name)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(variable = name, value = %raw, "ignoring invalid environment value");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(vars: &'static [(&'static str, &'static str)]) -> impl Fn(&str) -> Option<String> {
        move |name| vars.iter().find(|(k, _)| *k == name).map(|(_, v)| v.to_string())
    }

    #[test]
    fn valid_values_are_parsed() {
        let settings = RuntimeSettings::from_lookup(lookup(&[
            (AUTOSTART_ENV, "false"),
            (SNAPSHOT_EVENT_COUNT_ENV, "50"),
            (SNAPSHOT_DURATION_ENV, " 250 "),
        ]));
        assert_eq!(
            settings,
            RuntimeSettings {
                autostart: Some(false),
                snapshot_event_count: Some(50),
                snapshot_duration: Some(Duration::from_millis(250)),
            }
        );
    }

    #[test]
    fn invalid_values_are_ignored() {
        let settings = RuntimeSettings::from_lookup(lookup(&[
            (AUTOSTART_ENV, "maybe"),
            (SNAPSHOT_EVENT_COUNT_ENV, "0"),
            (SNAPSHOT_DURATION_ENV, "-5"),
        ]));
        assert_eq!(settings, RuntimeSettings::default());
    }

    #[test]
    fn settings_override_the_config() {
        let settings = RuntimeSettings {
            autostart: Some(false),
            snapshot_event_count: Some(10),
            snapshot_duration: None,
        };
        let config = RuntimeConfig::in_memory()
            .with_snapshots(SnapshotConfig::new().with_duration(Duration::from_secs(1)).into())
            .with_settings(&settings);

        assert!(!config.autostart);
        let Some(SnapshotPolicy::Enabled(snapshots)) = config.snapshots else {
            panic!("snapshots should be enabled");
        };
        assert_eq!(snapshots.event_count, Setting::Value(10));
        assert_eq!(snapshots.duration, Setting::Value(Duration::from_secs(1)));
        assert!(config.stores.contains_key(DEFAULT_STORE));
    }
}
