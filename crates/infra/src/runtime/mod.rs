//! Runtime orchestrator.
//!
//! A [`Runtime`] owns every registry of one application: aggregates, projectors, read
//! models, projections and the optional command scheduler. Nothing is global, so
//! several runtimes can coexist in one process.
//!
//! ## Lifecycle
//!
//! `create` wires everything and restores the persisted projection configuration;
//! `start` connects the event store, initializes projections and starts the scheduler;
//! `stop` reverses that. With `autostart` (the default) `create` also starts.

pub mod config;
pub mod projection_config;

pub use config::{
    AUTOSTART_ENV, DEFAULT_STORE, RuntimeConfig, RuntimeSettings, SNAPSHOT_DURATION_ENV,
    SNAPSHOT_EVENT_COUNT_ENV,
};
pub use projection_config::{
    CONFIG_STORE_PREFIX, ProjectionConfig, ProjectionNameConfig, ProjectionVersionConfig,
};

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use chronicle_core::{DomainError, DomainResult, InvocationId};
use chronicle_events::{EventCaster, EventEnvelope};

use crate::aggregate::{AggregateDispatch, CommandInfo};
use crate::context::{CommandGateway, ExecutionContext};
use crate::event_store::EventStore;
use crate::projections::{Projection, ProjectionDeps, ProjectionInfo, ProjectionMap, Projector};
use crate::read_model::ReadModel;
use crate::scheduler::{self, CommandScheduler, ScheduledCommand};
use crate::snapshot::Setting;
use crate::store::StoreProvider;

use self::projection_config::ProjectionConfigStore;

/// Snapshot stores are created under `<prefix><aggregate type>`.
pub const SNAPSHOT_STORE_PREFIX: &str = "_snapshots_";

/// Cheap to clone; clones share the same runtime.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

pub(crate) struct RuntimeInner {
    weak: Weak<RuntimeInner>,
    event_store: Arc<dyn EventStore>,
    caster: Arc<EventCaster>,
    aggregates: HashMap<String, Arc<dyn AggregateDispatch>>,
    projectors: HashMap<String, Arc<Projector>>,
    read_models: Arc<HashMap<String, Arc<ReadModel>>>,
    stores: HashMap<String, Arc<dyn StoreProvider>>,
    projections: RwLock<ProjectionMap>,
    config_store: ProjectionConfigStore,
    projection_config: Mutex<ProjectionConfig>,
    scheduler: Option<CommandScheduler>,
    started: AtomicBool,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut aggregates: Vec<&String> = self.inner.aggregates.keys().collect();
        aggregates.sort();
        let mut projectors: Vec<&String> = self.inner.projectors.keys().collect();
        projectors.sort();
        f.debug_struct("Runtime")
            .field("aggregates", &aggregates)
            .field("projectors", &projectors)
            .field("started", &self.is_started())
            .finish()
    }
}

impl Runtime {
    pub async fn create(config: RuntimeConfig) -> DomainResult<Self> {
        let RuntimeConfig {
            event_store,
            events,
            aggregates: configured_aggregates,
            projectors: configured_projectors,
            read_models: configured_read_models,
            internal_store,
            stores,
            snapshots,
            autostart,
            scheduler,
        } = config;

        let mut aggregates: HashMap<String, Arc<dyn AggregateDispatch>> = HashMap::new();
        for mut aggregate in configured_aggregates {
            let aggregate_type = aggregate.aggregate_type().to_string();
            if aggregates.contains_key(&aggregate_type) {
                return Err(DomainError::conflict(format!(
                    "aggregate '{aggregate_type}' is registered twice"
                )));
            }

            let policy = aggregate.snapshot_policy();
            let store = aggregate
                .snapshotter_mut()
                .configure([snapshots.clone(), policy])
                .map(|config| config.store.clone());
            let prefix = format!("{SNAPSHOT_STORE_PREFIX}{aggregate_type}");
            let store = match store {
                None | Some(Setting::Off) => None,
                Some(Setting::Value(provider)) => Some(provider.create(&prefix)),
                Some(Setting::Inherit) => Some(internal_store.create(&prefix)),
            };
            aggregate.snapshotter_mut().set_store(store).await?;

            aggregates.insert(aggregate_type, Arc::from(aggregate));
        }

        let mut projectors = HashMap::new();
        for projector in configured_projectors {
            let key = projector.display_name();
            if projectors.contains_key(&key) {
                return Err(DomainError::conflict(format!("projector '{key}' is registered twice")));
            }
            projectors.insert(key, Arc::new(projector));
        }

        let mut read_models = HashMap::new();
        for read_model in configured_read_models {
            let key = read_model.name().to_string();
            if read_models.contains_key(&key) {
                return Err(DomainError::conflict(format!("read model '{key}' is registered twice")));
            }
            read_models.insert(key, Arc::new(read_model));
        }

        let config_store = ProjectionConfigStore::open(&internal_store).await?;
        let projection_config = config_store.load().await?;

        let inner = Arc::new_cyclic(|weak: &Weak<RuntimeInner>| {
            let scheduler = scheduler.map(|adapter| CommandScheduler::new(adapter, delivery(weak.clone())));
            RuntimeInner {
                weak: weak.clone(),
                event_store,
                caster: Arc::new(events),
                aggregates,
                projectors,
                read_models: Arc::new(read_models),
                stores,
                projections: RwLock::new(ProjectionMap::new()),
                config_store,
                projection_config: Mutex::new(ProjectionConfig::default()),
                scheduler,
                started: AtomicBool::new(false),
            }
        });

        let runtime = Self { inner };
        runtime.restore_projections(projection_config).await;
        info!(
            aggregates = runtime.inner.aggregates.len(),
            projectors = runtime.inner.projectors.len(),
            read_models = runtime.inner.read_models.len(),
            "runtime created"
        );

        if autostart {
            runtime.start().await?;
        }
        Ok(runtime)
    }

    /// Re-add the persisted projections. Entries whose projector or store is no
    /// longer configured are skipped (and dropped from the configuration on the
    /// next save).
    async fn restore_projections(&self, persisted: ProjectionConfig) {
        let mut projections = self.inner.projections.write().await;
        let mut restored = ProjectionConfig::default();

        for (name, entry) in persisted.map {
            for config in entry.versions.into_values() {
                match self.inner.build_projection(&config) {
                    Ok(projection) => {
                        if let Err(e) = projections.add(projection) {
                            warn!(projection = %config.projection_id, error = %e, "skipping persisted projection");
                            continue;
                        }
                        restored.add(config);
                    }
                    Err(e) => {
                        warn!(projection = %config.projection_id, error = %e, "skipping persisted projection");
                    }
                }
            }

            if let Some(version) = entry.active_version {
                match projections.set_active(&name, version, true) {
                    Ok(()) => restored.set_active(&name, version),
                    Err(e) => warn!(projection = %name, version, error = %e, "cannot restore active version"),
                }
            }
        }

        *self.inner.projection_config.lock().await = restored;
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    pub async fn start(&self) -> DomainResult<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(e) = self.start_components().await {
            self.inner.started.store(false, Ordering::SeqCst);
            return Err(e);
        }
        info!("runtime started");
        Ok(())
    }

    async fn start_components(&self) -> DomainResult<()> {
        self.inner.event_store.connect().await?;
        self.inner.projections.read().await.init(&self.inner.deps()).await?;
        if let Some(scheduler) = &self.inner.scheduler {
            scheduler.start().await?;
        }
        Ok(())
    }

    pub async fn stop(&self) -> DomainResult<()> {
        if !self.inner.started.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(scheduler) = &self.inner.scheduler {
            scheduler.stop().await?;
        }
        self.inner.projections.read().await.stop().await;
        self.inner.event_store.close(false).await?;
        info!("runtime stopped");
        Ok(())
    }

    /// Create a projection of `projector_name@projector_version` into the named store.
    pub async fn add_projection(
        &self,
        name: &str,
        version: u32,
        projector_name: &str,
        projector_version: u32,
        store_name: &str,
    ) -> DomainResult<ProjectionInfo> {
        let config = ProjectionVersionConfig {
            projection_id: Projection::id_of(name, version),
            name: name.to_string(),
            version,
            projector_name: projector_name.to_string(),
            projector_version,
            store_name: store_name.to_string(),
        };

        let mut projections = self.inner.projections.write().await;
        if projections.get(&config.projection_id).is_some() {
            return Err(DomainError::conflict(format!(
                "projection '{}' already exists",
                config.projection_id
            )));
        }
        let projection = self.inner.build_projection(&config)?;
        projections.add(Arc::clone(&projection))?;

        let mut persisted = self.inner.projection_config.lock().await;
        persisted.add(config);
        self.inner.config_store.save(&persisted).await?;
        drop(persisted);

        if self.is_started() {
            projection.init(self.inner.deps()).await?;
        }
        info!(projection = %projection.id(), projector = %projection.projector().display_name(), "projection added");
        Ok(projection.info())
    }

    /// Route queries for `name` to `version`. Unless forced the version must be live.
    pub async fn set_projection_active(&self, name: &str, version: u32, force: bool) -> DomainResult<()> {
        let mut projections = self.inner.projections.write().await;
        projections.set_active(name, version, force)?;

        let mut persisted = self.inner.projection_config.lock().await;
        persisted.set_active(name, version);
        self.inner.config_store.save(&persisted).await?;
        info!(projection = %name, version, "projection activated");
        Ok(())
    }

    pub async fn remove_projection(&self, name: &str, version: u32, force: bool) -> DomainResult<()> {
        let mut projections = self.inner.projections.write().await;
        projections.remove(name, version, force).await?;

        let mut persisted = self.inner.projection_config.lock().await;
        persisted.remove(name, version);
        self.inner.config_store.save(&persisted).await?;
        Ok(())
    }

    pub async fn get_projections(&self) -> BTreeMap<String, ProjectionInfo> {
        self.inner
            .projections
            .read()
            .await
            .iter()
            .map(|p| (p.id().to_string(), p.info()))
            .collect()
    }

    pub async fn get_projection(&self, name: &str, version: u32) -> Option<ProjectionInfo> {
        self.projection(name, version).await.map(|p| p.info())
    }

    /// Handle to a projection, e.g. to await a position with
    /// [`Projection::wait_for_position`].
    pub async fn projection(&self, name: &str, version: u32) -> Option<Arc<Projection>> {
        self.inner.projections.read().await.get_by_name(name, version).cloned()
    }

    /// Every registered command, sorted by aggregate type then name.
    pub fn commands(&self) -> Vec<CommandInfo> {
        let mut commands: Vec<CommandInfo> = self
            .inner
            .aggregates
            .values()
            .flat_map(|aggregate| aggregate.commands())
            .collect();
        commands.sort_by(|a, b| (&a.aggregate_type, &a.name).cmp(&(&b.aggregate_type, &b.name)));
        commands
    }

    pub async fn execute_command(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
        command: &str,
        payload: JsonValue,
        context: JsonValue,
    ) -> DomainResult<Vec<EventEnvelope>> {
        self.inner
            .execute_command(aggregate_type, aggregate_id, command, payload, context)
            .await
    }

    /// [`Runtime::execute_command`] addressed by a [`CommandInfo`].
    pub async fn execute(
        &self,
        command: &CommandInfo,
        aggregate_id: &str,
        payload: JsonValue,
        context: JsonValue,
    ) -> DomainResult<Vec<EventEnvelope>> {
        self.execute_command(&command.aggregate_type, aggregate_id, &command.name, payload, context)
            .await
    }

    pub async fn execute_query(
        &self,
        read_model: &str,
        handler: &str,
        query: JsonValue,
        context: JsonValue,
    ) -> DomainResult<JsonValue> {
        let Some(model) = self.inner.read_models.get(&read_model.to_lowercase()).cloned() else {
            return Err(DomainError::not_found(format!("read model '{read_model}' not found")));
        };
        let ctx = self.inner.execution_context(context).await;
        model.call(&ctx, handler, query).await
    }

    pub async fn schedule_command(
        &self,
        execute_at: DateTime<Utc>,
        aggregate_type: &str,
        aggregate_id: &str,
        command: &str,
        payload: JsonValue,
        context: JsonValue,
    ) -> DomainResult<InvocationId> {
        self.inner
            .schedule(execute_at, aggregate_type, aggregate_id, command, payload, context)
            .await
    }
}

impl RuntimeInner {
    fn deps(&self) -> ProjectionDeps {
        let gateway: Weak<dyn CommandGateway> = self.weak.clone();
        ProjectionDeps {
            event_store: Arc::clone(&self.event_store),
            caster: Arc::clone(&self.caster),
            gateway,
        }
    }

    async fn execution_context(&self, caller: JsonValue) -> ExecutionContext {
        let active = self.projections.read().await.active_snapshot();
        ExecutionContext::new(
            Arc::clone(&self.event_store),
            Arc::clone(&self.caster),
            active,
            Arc::clone(&self.read_models),
            caller,
        )
    }

    fn build_projection(&self, config: &ProjectionVersionConfig) -> DomainResult<Arc<Projection>> {
        let key = format!("{}@{}", config.projector_name, config.projector_version);
        let Some(projector) = self.projectors.get(&key) else {
            return Err(DomainError::not_found(format!("projector '{key}' not found")));
        };
        let Some(provider) = self.stores.get(&config.store_name) else {
            return Err(DomainError::not_found(format!("store '{}' not found", config.store_name)));
        };
        let store = provider.create(&config.projection_id);
        Ok(Arc::new(Projection::new(
            config.name.clone(),
            config.version,
            config.store_name.clone(),
            Arc::clone(projector),
            store,
        )))
    }

    async fn execute_command(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
        command: &str,
        payload: JsonValue,
        context: JsonValue,
    ) -> DomainResult<Vec<EventEnvelope>> {
        let Some(aggregate) = self.aggregates.get(aggregate_type).cloned() else {
            return Err(DomainError::not_found(format!("aggregate '{aggregate_type}' not found")));
        };
        let ctx = self.execution_context(context).await;
        aggregate.execute_command(&ctx, aggregate_id, command, payload).await
    }

    async fn schedule(
        &self,
        execute_at: DateTime<Utc>,
        aggregate_type: &str,
        aggregate_id: &str,
        command: &str,
        payload: JsonValue,
        context: JsonValue,
    ) -> DomainResult<InvocationId> {
        let Some(scheduler) = &self.scheduler else {
            return Err(DomainError::bad_request("scheduling is disabled"));
        };
        let scheduled = ScheduledCommand {
            aggregate_type: aggregate_type.to_string(),
            aggregate_id: aggregate_id.to_string(),
            command: command.to_string(),
            payload,
            context,
        };
        let id = scheduler.schedule(execute_at, &scheduled).await?;
        info!(invocation = %id, aggregate_type, aggregate_id, command, %execute_at, "command scheduled");
        Ok(id)
    }
}

#[async_trait]
impl CommandGateway for RuntimeInner {
    async fn execute_command(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
        command: &str,
        payload: JsonValue,
        context: JsonValue,
    ) -> DomainResult<Vec<EventEnvelope>> {
        RuntimeInner::execute_command(self, aggregate_type, aggregate_id, command, payload, context).await
    }

    async fn schedule_command(
        &self,
        execute_at: DateTime<Utc>,
        aggregate_type: &str,
        aggregate_id: &str,
        command: &str,
        payload: JsonValue,
        context: JsonValue,
    ) -> DomainResult<()> {
        self.schedule(execute_at, aggregate_type, aggregate_id, command, payload, context)
            .await
            .map(|_| ())
    }
}

/// Scheduler callback executing delivered [`ScheduledCommand`]s.
fn delivery(runtime: Weak<RuntimeInner>) -> scheduler::SchedulerCallback {
    scheduler::callback(move |_, data| {
        let runtime = runtime.clone();
        async move {
            let command: ScheduledCommand = serde_json::from_value(data)?;
            let Some(runtime) = runtime.upgrade() else {
                anyhow::bail!("runtime has been dropped");
            };
            runtime
                .execute_command(
                    &command.aggregate_type,
                    &command.aggregate_id,
                    &command.command,
                    command.payload,
                    command.context,
                )
                .await?;
            Ok::<(), anyhow::Error>(())
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{Aggregate, CommandOptions, StateUpdate};
    use crate::snapshot::SnapshotConfig;
    use crate::store::InMemoryStoreProvider;
    use serde_json::json;

    fn noop(_: &(), _: JsonValue, _: &crate::aggregate::CommandContext) -> DomainResult<StateUpdate> {
        Ok(StateUpdate::None)
    }

    fn aggregate(name: &str) -> Aggregate<()> {
        Aggregate::new(name, || ())
            .with_command(noop, CommandOptions::default())
            .unwrap()
    }

    fn config() -> RuntimeConfig {
        RuntimeConfig::in_memory()
            .with_aggregate(aggregate("order"))
            .with_projector(Projector::new("orders", 1).unwrap())
    }

    #[tokio::test]
    async fn duplicate_registrations_conflict() {
        let err = Runtime::create(config().with_aggregate(aggregate("order"))).await.unwrap_err();
        assert!(err.is_conflict());

        let err = Runtime::create(config().with_projector(Projector::new("orders", 1).unwrap()))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn unknown_targets_are_not_found() {
        let runtime = Runtime::create(config()).await.unwrap();

        let err = runtime
            .execute_command("invoice", "i1", "noop", JsonValue::Null, JsonValue::Null)
            .await
            .unwrap_err();
        assert_eq!(err.status(), 404);

        let err = runtime
            .execute_query("Orders", "byId", json!({}), JsonValue::Null)
            .await
            .unwrap_err();
        assert_eq!(err.status(), 404);

        runtime.stop().await.unwrap();
    }

    #[tokio::test]
    async fn commands_are_listed_and_executable_by_info() {
        let runtime = Runtime::create(config().with_aggregate(aggregate("invoice"))).await.unwrap();
        let commands = runtime.commands();
        assert_eq!(
            commands.iter().map(|c| c.aggregate_type.as_str()).collect::<Vec<_>>(),
            vec!["invoice", "order"]
        );

        let events = runtime
            .execute(&commands[1], "o1", JsonValue::Null, JsonValue::Null)
            .await
            .unwrap();
        assert!(events.is_empty());
        runtime.stop().await.unwrap();
    }

    #[tokio::test]
    async fn scheduling_requires_a_scheduler() {
        let runtime = Runtime::create(config()).await.unwrap();
        let err = runtime
            .schedule_command(Utc::now(), "order", "o1", "noop", JsonValue::Null, JsonValue::Null)
            .await
            .unwrap_err();
        assert!(err.is_bad_request());
        runtime.stop().await.unwrap();
    }

    #[tokio::test]
    async fn add_projection_validates_its_inputs() {
        let runtime = Runtime::create(config()).await.unwrap();

        let err = runtime.add_projection("orders", 1, "missing", 1, DEFAULT_STORE).await.unwrap_err();
        assert_eq!(err.status(), 404);
        let err = runtime.add_projection("orders", 1, "orders", 1, "elsewhere").await.unwrap_err();
        assert_eq!(err.status(), 404);

        let info = runtime.add_projection("orders", 1, "orders", 1, DEFAULT_STORE).await.unwrap();
        assert_eq!(info.id, "orders-1");
        let err = runtime.add_projection("orders", 1, "orders", 1, DEFAULT_STORE).await.unwrap_err();
        assert!(err.is_conflict());

        assert_eq!(runtime.get_projections().await.keys().collect::<Vec<_>>(), vec!["orders-1"]);
        runtime.stop().await.unwrap();
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let runtime = Runtime::create(config().with_autostart(false)).await.unwrap();
        assert!(!runtime.is_started());
        runtime.start().await.unwrap();
        runtime.start().await.unwrap();
        assert!(runtime.is_started());
        runtime.stop().await.unwrap();
        runtime.stop().await.unwrap();
        assert!(!runtime.is_started());
    }

    fn touch(_: &(), _: JsonValue, _: &crate::aggregate::CommandContext) -> DomainResult<StateUpdate> {
        Ok(EventEnvelope::from_parts("order.touched", 1, json!({}))?.into())
    }

    #[tokio::test]
    async fn snapshots_land_in_the_configured_store() {
        let provider = Arc::new(InMemoryStoreProvider::new());
        let order = aggregate("order").with_command(touch, CommandOptions::default()).unwrap();
        let runtime = Runtime::create(
            RuntimeConfig::in_memory()
                .with_aggregate(order)
                .with_snapshots(SnapshotConfig::new().with_event_count(1).with_store(provider.clone()).into()),
        )
        .await
        .unwrap();

        for _ in 0..2 {
            runtime
                .execute_command("order", "o1", "touch", JsonValue::Null, JsonValue::Null)
                .await
                .unwrap();
        }

        let store = provider.create(&format!("{SNAPSHOT_STORE_PREFIX}order"));
        store
            .define_tables(&[crate::store::TableDefinition::new(crate::snapshot::SNAPSHOT_TABLE, ["aggregateId"])])
            .unwrap();
        store.connect().await.unwrap();
        let key = json!({"aggregateId": "o1"}).as_object().cloned().unwrap();
        let snapshot = store.table(crate::snapshot::SNAPSHOT_TABLE).unwrap().get(&key).await.unwrap();
        assert_eq!(snapshot.unwrap()["aggregateVersion"], json!(1));
        runtime.stop().await.unwrap();
    }
}
