use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use chronicle_core::{DomainError, DomainResult, Position, SubscribeFrom};
use chronicle_events::{EventCaster, EventEnvelope};

use crate::context::{CommandGateway, ProjectionContext};
use crate::event_store::{EventFilter, EventStore, EventStream, SubscribeOptions};
use crate::store::{Store, TableDefinition, TypedTable};

use super::projector::Projector;

/// Table (inside the projection's own store) holding the processed position.
pub const POSITION_TABLE: &str = "_chronicle";

/// What a projection needs from the runtime to run.
#[derive(Clone)]
pub struct ProjectionDeps {
    pub event_store: Arc<dyn EventStore>,
    pub caster: Arc<EventCaster>,
    pub gateway: Weak<dyn CommandGateway>,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Progress {
    latest: Option<Position>,
    processed: Option<Position>,
    failure: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectorInfo {
    pub name: String,
    pub version: u32,
}

/// Serializable view of a projection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectionInfo {
    pub id: String,
    pub name: String,
    pub version: u32,
    pub store_name: String,
    pub is_replaying: bool,
    pub is_live_tracking: bool,
    pub is_active: bool,
    pub latest_position: Option<Position>,
    pub processed_position: Option<Position>,
    pub failure: Option<String>,
    pub projector: ProjectorInfo,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PositionKey {
    projection_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredPosition {
    position: Position,
}

/// State shared between a projection and its subscription task.
#[derive(Debug)]
struct Shared {
    replaying: AtomicBool,
    live: AtomicBool,
    active: Arc<AtomicBool>,
    progress: watch::Sender<Progress>,
}

impl Shared {
    fn go_live(&self) {
        self.replaying.store(false, Ordering::SeqCst);
        self.live.store(true, Ordering::SeqCst);
    }
}

/// A projector materialized into one store.
///
/// Lifecycle: `initializing → replaying → live`. The subscription applies events one
/// at a time on a background task and records the position of every applied event,
/// so a restart resumes after the last recorded one (at-least-once).
pub struct Projection {
    id: String,
    name: String,
    version: u32,
    store_name: String,
    projector: Arc<Projector>,
    store: Arc<dyn Store>,
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Projection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Projection")
            .field("id", &self.id)
            .field("projector", &self.projector.display_name())
            .field("store_name", &self.store_name)
            .field("store", &self.store.prefix())
            .finish()
    }
}

impl Projection {
    pub fn id_of(name: &str, version: u32) -> String {
        format!("{name}-{version}")
    }

    pub fn new(
        name: impl Into<String>,
        version: u32,
        store_name: impl Into<String>,
        projector: Arc<Projector>,
        store: Arc<dyn Store>,
    ) -> Self {
        let name = name.into();
        let (progress, _) = watch::channel(Progress::default());
        Self {
            id: Self::id_of(&name, version),
            name,
            version,
            store_name: store_name.into(),
            projector,
            store,
            shared: Arc::new(Shared {
                replaying: AtomicBool::new(true),
                live: AtomicBool::new(false),
                active: Arc::new(AtomicBool::new(false)),
                progress,
            }),
            task: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn store_name(&self) -> &str {
        &self.store_name
    }

    pub fn projector(&self) -> &Arc<Projector> {
        &self.projector
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn is_replaying(&self) -> bool {
        self.shared.replaying.load(Ordering::SeqCst)
    }

    pub fn is_live_tracking(&self) -> bool {
        self.shared.live.load(Ordering::SeqCst)
    }

    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::SeqCst)
    }

    pub(crate) fn set_active(&self, active: bool) {
        self.shared.active.store(active, Ordering::SeqCst);
    }

    pub fn latest_position(&self) -> Option<Position> {
        self.shared.progress.borrow().latest
    }

    pub fn failure(&self) -> Option<String> {
        self.shared.progress.borrow().failure.clone()
    }

    pub fn info(&self) -> ProjectionInfo {
        let progress = self.shared.progress.borrow().clone();
        ProjectionInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            version: self.version,
            store_name: self.store_name.clone(),
            is_replaying: self.is_replaying(),
            is_live_tracking: self.is_live_tracking(),
            is_active: self.is_active(),
            latest_position: progress.latest,
            processed_position: progress.processed,
            failure: progress.failure,
            projector: ProjectorInfo {
                name: self.projector.name().to_string(),
                version: self.projector.version(),
            },
        }
    }

    /// Connect the store, catch up from the recorded position and keep tracking.
    /// A projection that is already running is left alone.
    pub async fn init(&self, deps: ProjectionDeps) -> DomainResult<()> {
        let mut task = self.task.lock().await;
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return Ok(());
        }

        let mut tables = self.projector.tables().to_vec();
        tables.push(TableDefinition::new(POSITION_TABLE, ["projectionId"]));
        self.store.define_tables(&tables)?;
        self.store.connect().await?;

        let filter = EventFilter::types(self.projector.types());
        let latest = deps.event_store.latest_position(&filter).await?;
        let stored = self.positions()?.get(&self.position_key()).await?.map(|p| p.position);

        self.shared.replaying.store(true, Ordering::SeqCst);
        self.shared.live.store(false, Ordering::SeqCst);
        self.shared.progress.send_replace(Progress {
            latest,
            processed: stored,
            failure: None,
        });

        let caught_up = match (latest, stored) {
            (None, _) => true,
            (Some(latest), Some(stored)) => stored >= latest,
            (Some(_), None) => false,
        };
        if caught_up {
            self.shared.go_live();
        }

        let from = stored.map_or(SubscribeFrom::Start, SubscribeFrom::After);
        let stream = deps
            .event_store
            .subscribe(SubscribeOptions { from, filter })
            .await?;

        let worker = Worker {
            id: self.id.clone(),
            projector: Arc::clone(&self.projector),
            store: Arc::clone(&self.store),
            positions: self.positions()?,
            key: self.position_key(),
            shared: Arc::clone(&self.shared),
            deps,
            latest,
        };
        *task = Some(tokio::spawn(worker.run(stream)));

        info!(
            projection = %self.id,
            projector = %self.projector.display_name(),
            latest = ?latest,
            stored = ?stored,
            live = caught_up,
            "projection initialized"
        );
        Ok(())
    }

    /// Resolves once a position `>= position` has been recorded. Only events of the
    /// projector's types are recorded. Fails if the subscription halted first.
    pub async fn wait_for_position(&self, position: Position) -> DomainResult<()> {
        let mut progress = self.shared.progress.subscribe();
        let reached = progress
            .wait_for(|p| p.processed.is_some_and(|done| done >= position) || p.failure.is_some())
            .await
            .map_err(|_| DomainError::internal(format!("projection '{}' was dropped", self.id)))?;

        if reached.processed.is_some_and(|done| done >= position) {
            return Ok(());
        }
        Err(DomainError::internal(format!(
            "projection '{}' halted: {}",
            self.id,
            reached.failure.as_deref().unwrap_or("unknown failure")
        )))
    }

    /// Tear down the subscription and close the store.
    pub async fn stop(&self) -> DomainResult<()> {
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
        }
        self.store.close(false).await?;
        debug!(projection = %self.id, "projection stopped");
        Ok(())
    }

    fn positions(&self) -> DomainResult<TypedTable<PositionKey, StoredPosition>> {
        Ok(TypedTable::new(self.store.table(POSITION_TABLE)?))
    }

    fn position_key(&self) -> PositionKey {
        PositionKey {
            projection_id: self.id.clone(),
        }
    }
}

/// Subscription loop of one projection.
struct Worker {
    id: String,
    projector: Arc<Projector>,
    store: Arc<dyn Store>,
    positions: TypedTable<PositionKey, StoredPosition>,
    key: PositionKey,
    shared: Arc<Shared>,
    deps: ProjectionDeps,
    latest: Option<Position>,
}

impl Worker {
    async fn run(self, mut stream: EventStream) {
        while let Some(item) = stream.next().await {
            let event = match item {
                Ok(event) => event,
                Err(e) => {
                    error!(projection = %self.id, error = %e, "projection subscription failed");
                    self.halt(e.to_string());
                    return;
                }
            };

            let event_id = event.id();
            let position = event.position();
            if let Err(e) = self.process(event).await {
                error!(
                    projection = %self.id,
                    event_id = %event_id,
                    position = ?position,
                    error = %e,
                    "projection failed to apply event, halting"
                );
                self.halt(e.to_string());
                return;
            }
        }
        debug!(projection = %self.id, "projection subscription ended");
    }

    async fn process(&self, event: EventEnvelope) -> DomainResult<()> {
        let Some(position) = event.position() else {
            return Err(DomainError::internal(format!(
                "event {} has no log position",
                event.id()
            )));
        };

        if self.latest.is_none_or(|latest| position > latest) {
            self.shared.go_live();
        }

        let ctx = ProjectionContext::new(
            self.shared.replaying.load(Ordering::SeqCst),
            event.clone(),
            Arc::clone(&self.deps.event_store),
            Arc::clone(&self.deps.caster),
            Arc::clone(&self.store),
            Arc::clone(&self.shared.active),
            self.deps.gateway.clone(),
        );
        self.projector.on_event(ctx, event).await?;

        self.positions.set(&self.key, &StoredPosition { position }).await?;
        if self.latest.is_some_and(|latest| position >= latest) {
            self.shared.go_live();
        }
        self.shared.progress.send_modify(|p| {
            p.processed = Some(position);
            if p.latest.is_none_or(|latest| position > latest) {
                p.latest = Some(position);
            }
        });
        Ok(())
    }

    fn halt(&self, failure: String) {
        self.shared.progress.send_modify(|p| p.failure = Some(failure));
    }
}
