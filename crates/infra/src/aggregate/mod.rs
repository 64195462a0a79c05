//! Event-sourced aggregates.
//!
//! An [`Aggregate`] owns three explicit tables: fold functions per event identity
//! (plus an optional catch-all), named commands, and a [`Snapshotter`].
//!
//! ## Command execution
//!
//! 1. look up the command (unknown → Not Found)
//! 2. decode and validate the payload (→ Bad Request)
//! 3. hydrate: latest usable snapshot, then fold the remaining stream
//! 4. run the command against the hydrated state
//! 5. append what it produced with the hydrated revision as precondition
//!
//! Aggregates never lock. Two commands racing on the same id both hydrate the same
//! revision and the event store lets exactly one append through; the other fails
//! with Conflict and is not retried.

pub mod command;
pub mod status;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use chronicle_core::{DomainError, DomainResult, ExpectedRevision};
use chronicle_events::{Event, EventCaster, EventEnvelope, EventRegistry};

use crate::context::ExecutionContext;
use crate::event_store::{EventStore, EventStoreError, ReadOptions};
use crate::snapshot::{SnapshotPolicy, SnapshotRecord, Snapshotter};

pub use command::{
    CommandContext, CommandInfo, CommandOptions, Payload, StateUpdate, decode_payload,
};
pub use status::AggregateStatus;

use self::command::fn_item_name;

/// Folds one event into the state.
pub type FoldFn<S> = Arc<dyn Fn(S, &EventEnvelope) -> DomainResult<S> + Send + Sync>;

type InitFn<S> = Arc<dyn Fn() -> S + Send + Sync>;

/// A command whose payload has already been decoded.
type PreparedCommand<S> = Box<dyn FnOnce(&S, &CommandContext) -> DomainResult<StateUpdate> + Send>;

type CommandFn<S> = Arc<dyn Fn(JsonValue) -> DomainResult<PreparedCommand<S>> + Send + Sync>;

#[derive(Debug, Clone, Default)]
pub struct AggregateOptions {
    /// Merged over the runtime's global policy; `None` inherits it.
    pub snapshots: Option<SnapshotPolicy>,
    /// Bump whenever fold functions change; older snapshots are then ignored.
    pub projector_version: u32,
}

pub struct Aggregate<S> {
    aggregate_type: String,
    init: InitFn<S>,
    folds: EventRegistry<FoldFn<S>>,
    fallback: Option<FoldFn<S>>,
    commands: BTreeMap<String, CommandFn<S>>,
    options: AggregateOptions,
    snapshotter: Snapshotter,
}

impl<S> std::fmt::Debug for Aggregate<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aggregate")
            .field("aggregate_type", &self.aggregate_type)
            .field("events", &self.folds.types())
            .field("commands", &self.commands.keys().collect::<Vec<_>>())
            .field("options", &self.options)
            .finish()
    }
}

impl<S> Aggregate<S>
where
    S: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new<F>(aggregate_type: impl Into<String>, init: F) -> Self
    where
        F: Fn() -> S + Send + Sync + 'static,
    {
        let aggregate_type = aggregate_type.into();
        Self {
            snapshotter: Snapshotter::new(aggregate_type.clone()),
            aggregate_type,
            init: Arc::new(init),
            folds: EventRegistry::new(),
            fallback: None,
            commands: BTreeMap::new(),
            options: AggregateOptions::default(),
        }
    }

    /// Fold events of `E`'s identity. Other versions of the same type are cast to the
    /// highest registered one before folding.
    pub fn on<E, F>(mut self, f: F) -> DomainResult<Self>
    where
        E: Event,
        F: Fn(S, E) -> S + Send + Sync + 'static,
    {
        let fold: FoldFn<S> = Arc::new(move |state: S, event: &EventEnvelope| -> DomainResult<S> {
            Ok(f(state, event.payload_as::<E>()?))
        });
        self.folds.register(E::identity(), fold)?;
        Ok(self)
    }

    /// Catch-all fold for event types without a registered fold.
    pub fn on_any<F>(mut self, f: F) -> Self
    where
        F: Fn(S, &EventEnvelope) -> S + Send + Sync + 'static,
    {
        let fold: FoldFn<S> = Arc::new(move |state: S, event: &EventEnvelope| -> DomainResult<S> { Ok(f(state, event)) });
        self.fallback = Some(fold);
        self
    }

    pub fn with_options(mut self, options: AggregateOptions) -> Self {
        self.options = options;
        self
    }

    /// Register a command. Without an explicit name, the fn item's own name is used;
    /// closures must be named explicitly.
    pub fn register_command<P, F>(&mut self, command: F, options: CommandOptions) -> DomainResult<CommandInfo>
    where
        P: Payload,
        F: Fn(&S, P, &CommandContext) -> DomainResult<StateUpdate> + Send + Sync + 'static,
    {
        let name = match options.name.or_else(fn_item_name::<F>) {
            Some(name) if !name.is_empty() => name,
            _ => {
                return Err(DomainError::bad_request(format!(
                    "command on '{}' needs an explicit name",
                    self.aggregate_type
                )));
            }
        };
        if self.commands.contains_key(&name) {
            return Err(DomainError::conflict(format!(
                "command '{name}' is already registered on '{}'",
                self.aggregate_type
            )));
        }

        let command = Arc::new(command);
        let entry: CommandFn<S> = Arc::new(move |raw: JsonValue| -> DomainResult<PreparedCommand<S>> {
            let payload: P = decode_payload(raw)?;
            let command = Arc::clone(&command);
            Ok(Box::new(move |state: &S, ctx: &CommandContext| command(state, payload, ctx)))
        });
        self.commands.insert(name.clone(), entry);

        Ok(CommandInfo {
            aggregate_type: self.aggregate_type.clone(),
            name,
        })
    }

    /// Builder form of [`Aggregate::register_command`].
    pub fn with_command<P, F>(mut self, command: F, options: CommandOptions) -> DomainResult<Self>
    where
        P: Payload,
        F: Fn(&S, P, &CommandContext) -> DomainResult<StateUpdate> + Send + Sync + 'static,
    {
        self.register_command(command, options)?;
        Ok(self)
    }

    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    pub fn options(&self) -> &AggregateOptions {
        &self.options
    }

    pub fn snapshotter(&self) -> &Snapshotter {
        &self.snapshotter
    }

    pub fn snapshotter_mut(&mut self) -> &mut Snapshotter {
        &mut self.snapshotter
    }

    pub fn commands(&self) -> Vec<CommandInfo> {
        self.commands
            .keys()
            .map(|name| CommandInfo {
                aggregate_type: self.aggregate_type.clone(),
                name: name.clone(),
            })
            .collect()
    }

    pub async fn execute_command(
        &self,
        ctx: &ExecutionContext,
        aggregate_id: &str,
        command: &str,
        payload: JsonValue,
    ) -> DomainResult<Vec<EventEnvelope>> {
        let Some(entry) = self.commands.get(command) else {
            return Err(DomainError::not_found(format!(
                "command '{command}' not found on '{}'",
                self.aggregate_type
            )));
        };
        let prepared = entry(payload)?;

        let (status, pending) = self.hydrate(ctx.event_store(), ctx.caster(), aggregate_id).await?;
        let context = CommandContext {
            aggregate_id: aggregate_id.to_string(),
            aggregate_version: status.aggregate_version,
            caller: ctx.caller().clone(),
        };

        let result = match prepared(&status.state, &context) {
            Ok(StateUpdate::None) => Ok(Vec::new()),
            Ok(StateUpdate::Events(events)) => {
                self.append(ctx.event_store(), aggregate_id, events, status.revision).await
            }
            Ok(StateUpdate::Forced(events)) => {
                self.append(ctx.event_store(), aggregate_id, events, ExpectedRevision::Any).await
            }
            Err(e) => Err(e),
        };

        if let Some(record) = pending {
            if let Err(e) = self.snapshotter.set(&record).await {
                warn!(
                    aggregate_type = %self.aggregate_type,
                    aggregate_id,
                    error = %e,
                    "failed to persist snapshot"
                );
            }
        }

        match &result {
            Ok(events) => debug!(
                aggregate_type = %self.aggregate_type,
                aggregate_id,
                command,
                appended = events.len(),
                "command executed"
            ),
            Err(e) => debug!(
                aggregate_type = %self.aggregate_type,
                aggregate_id,
                command,
                error = %e,
                "command rejected"
            ),
        }
        result
    }

    /// Hydrate without running a command; never writes a snapshot.
    pub async fn load_state(
        &self,
        event_store: &dyn EventStore,
        caster: &EventCaster,
        aggregate_id: &str,
    ) -> DomainResult<AggregateStatus<S>> {
        Ok(self.hydrate(event_store, caster, aggregate_id).await?.0)
    }

    /// Hydrated status plus the snapshot the session decided to write, if any.
    async fn hydrate(
        &self,
        event_store: &dyn EventStore,
        caster: &EventCaster,
        aggregate_id: &str,
    ) -> DomainResult<(AggregateStatus<S>, Option<SnapshotRecord>)> {
        let mut session = self.snapshotter.begin_session(aggregate_id).await?;
        let snapshot = session
            .snapshot
            .take()
            .filter(|s| s.projector_version == self.options.projector_version);

        let mut status = None;
        if let Some(snapshot) = snapshot {
            let restored = match self.restore(snapshot) {
                Ok(from) => self.fold(event_store, caster, from).await,
                Err(e) => Err(e),
            };
            match restored {
                Ok(restored) => status = Some(restored),
                Err(e) => info!(
                    aggregate_type = %self.aggregate_type,
                    aggregate_id,
                    error = %e,
                    "snapshot unusable, hydrating from genesis"
                ),
            }
        }

        let status = match status {
            Some(status) => status,
            None => {
                let genesis = AggregateStatus::initial(aggregate_id, (self.init)(), self.options.projector_version);
                self.fold(event_store, caster, genesis).await?
            }
        };

        let pending = self.snapshotter.end_session(session, &status)?;
        Ok((status, pending))
    }

    fn restore(&self, snapshot: SnapshotRecord) -> DomainResult<AggregateStatus<S>> {
        Ok(AggregateStatus {
            aggregate_id: snapshot.aggregate_id,
            state: serde_json::from_value(snapshot.state)?,
            revision: snapshot.revision,
            aggregate_version: snapshot.aggregate_version,
            projector_version: snapshot.projector_version,
        })
    }

    async fn fold(
        &self,
        event_store: &dyn EventStore,
        caster: &EventCaster,
        mut status: AggregateStatus<S>,
    ) -> DomainResult<AggregateStatus<S>> {
        let from = match status.revision {
            ExpectedRevision::Exact(revision) => revision + 1,
            _ => 0,
        };
        let mut stream = match event_store
            .read(&self.aggregate_type, &status.aggregate_id, ReadOptions::from_revision(from))
            .await
        {
            Ok(stream) => stream,
            Err(EventStoreError::StreamNotFound(_)) => return Ok(status),
            Err(e) => return Err(e.into()),
        };

        while let Some(item) = stream.next().await {
            let event = match item {
                Ok(event) => event,
                Err(EventStoreError::StreamNotFound(_)) => break,
                Err(e) => return Err(e.into()),
            };
            status.state = self.apply(status.state, event, caster)?;
            status.advance();
        }
        Ok(status)
    }

    fn apply(&self, state: S, event: EventEnvelope, caster: &EventCaster) -> DomainResult<S> {
        let resolved = self.folds.resolve(event, caster)?;
        match (resolved.handler, &self.fallback) {
            (Some(fold), _) => fold(state, &resolved.event),
            (None, Some(fallback)) => fallback(state, &resolved.event),
            (None, None) => Ok(state),
        }
    }

    async fn append(
        &self,
        event_store: &Arc<dyn EventStore>,
        aggregate_id: &str,
        mut events: Vec<EventEnvelope>,
        expected: ExpectedRevision,
    ) -> DomainResult<Vec<EventEnvelope>> {
        if events.is_empty() {
            return Ok(events);
        }
        for event in &mut events {
            event.set_aggregate_id(aggregate_id);
        }
        Ok(event_store
            .append(&self.aggregate_type, aggregate_id, events, expected)
            .await?)
    }
}

/// Type-erased view of an [`Aggregate`] held by the runtime.
#[async_trait]
pub trait AggregateDispatch: Send + Sync {
    fn aggregate_type(&self) -> &str;

    fn snapshot_policy(&self) -> Option<SnapshotPolicy>;

    fn snapshotter_mut(&mut self) -> &mut Snapshotter;

    fn commands(&self) -> Vec<CommandInfo>;

    async fn execute_command(
        &self,
        ctx: &ExecutionContext,
        aggregate_id: &str,
        command: &str,
        payload: JsonValue,
    ) -> DomainResult<Vec<EventEnvelope>>;
}

#[async_trait]
impl<S> AggregateDispatch for Aggregate<S>
where
    S: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    fn snapshot_policy(&self) -> Option<SnapshotPolicy> {
        self.options.snapshots.clone()
    }

    fn snapshotter_mut(&mut self) -> &mut Snapshotter {
        &mut self.snapshotter
    }

    fn commands(&self) -> Vec<CommandInfo> {
        Aggregate::commands(self)
    }

    async fn execute_command(
        &self,
        ctx: &ExecutionContext,
        aggregate_id: &str,
        command: &str,
        payload: JsonValue,
    ) -> DomainResult<Vec<EventEnvelope>> {
        Aggregate::execute_command(self, ctx, aggregate_id, command, payload).await
    }
}
