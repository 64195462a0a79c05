//! Explicit per-call and per-event contexts.
//!
//! Every command or query runs inside an [`ExecutionContext`] created by the runtime
//! for that call; every event a projection applies runs inside a
//! [`ProjectionContext`]. Nothing is stored in globals or task-locals, so several
//! runtimes can live in one process.
//!
//! ## Side effects
//!
//! Projections are replayed from the start of the log whenever they are rebuilt. Side
//! effects (emitting events, executing or scheduling commands) must therefore only
//! run for events that arrive while the projection is live and active. The gate is
//! [`side_effect`]; the `emit`/`execute_command`/`schedule_command` helpers on
//! [`ProjectionContext`] go through it.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use chronicle_core::{DomainError, DomainResult, ExpectedRevision};
use chronicle_events::{EventCaster, EventEnvelope};

use crate::event_store::EventStore;
use crate::projections::Projection;
use crate::read_model::ReadModel;
use crate::store::{Store, Table};

/// The slice of the runtime that projections may call back into.
#[async_trait]
pub trait CommandGateway: Send + Sync {
    async fn execute_command(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
        command: &str,
        payload: JsonValue,
        context: JsonValue,
    ) -> DomainResult<Vec<EventEnvelope>>;

    async fn schedule_command(
        &self,
        execute_at: DateTime<Utc>,
        aggregate_type: &str,
        aggregate_id: &str,
        command: &str,
        payload: JsonValue,
        context: JsonValue,
    ) -> DomainResult<()>;
}

/// Context of one command or query call.
///
/// `projections` is a point-in-time copy of the active projections, taken when the
/// call started; activating another version mid-call does not affect it.
#[derive(Clone)]
pub struct ExecutionContext {
    event_store: Arc<dyn EventStore>,
    caster: Arc<EventCaster>,
    projections: Arc<HashMap<String, Arc<Projection>>>,
    read_models: Arc<HashMap<String, Arc<ReadModel>>>,
    caller: JsonValue,
}

impl ExecutionContext {
    pub fn new(
        event_store: Arc<dyn EventStore>,
        caster: Arc<EventCaster>,
        projections: HashMap<String, Arc<Projection>>,
        read_models: Arc<HashMap<String, Arc<ReadModel>>>,
        caller: JsonValue,
    ) -> Self {
        Self {
            event_store,
            caster,
            projections: Arc::new(projections),
            read_models,
            caller,
        }
    }

    pub fn event_store(&self) -> &Arc<dyn EventStore> {
        &self.event_store
    }

    pub fn caster(&self) -> &EventCaster {
        &self.caster
    }

    /// Whatever the caller passed along (user, tenant, request ids…), `null` if nothing.
    pub fn caller(&self) -> &JsonValue {
        &self.caller
    }

    pub fn active_projection(&self, name: &str) -> Option<&Arc<Projection>> {
        self.projections.get(name)
    }

    pub fn read_model(&self, name: &str) -> Option<&Arc<ReadModel>> {
        self.read_models.get(&name.to_lowercase())
    }
}

/// Context of one event applied by a projection.
#[derive(Clone)]
pub struct ProjectionContext {
    is_replaying: bool,
    current_event: EventEnvelope,
    event_store: Arc<dyn EventStore>,
    caster: Arc<EventCaster>,
    store: Arc<dyn Store>,
    active: Arc<AtomicBool>,
    gateway: Weak<dyn CommandGateway>,
}

impl ProjectionContext {
    pub(crate) fn new(
        is_replaying: bool,
        current_event: EventEnvelope,
        event_store: Arc<dyn EventStore>,
        caster: Arc<EventCaster>,
        store: Arc<dyn Store>,
        active: Arc<AtomicBool>,
        gateway: Weak<dyn CommandGateway>,
    ) -> Self {
        Self {
            is_replaying,
            current_event,
            event_store,
            caster,
            store,
            active,
            gateway,
        }
    }

    pub fn is_replaying(&self) -> bool {
        self.is_replaying
    }

    /// The event being applied, as it came from the log (before any casting).
    pub fn current_event(&self) -> &EventEnvelope {
        &self.current_event
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn caster(&self) -> &EventCaster {
        &self.caster
    }

    /// The projection's own store.
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn table(&self, name: &str) -> DomainResult<Arc<dyn Table>> {
        Ok(self.store.table(name)?)
    }

    fn side_effects_enabled(&self) -> bool {
        !self.is_replaying && self.is_active()
    }

    fn gateway(&self) -> DomainResult<Arc<dyn CommandGateway>> {
        self.gateway
            .upgrade()
            .ok_or_else(|| DomainError::internal("runtime has been dropped"))
    }

    /// Append `events` to their aggregates' streams without a revision check.
    ///
    /// Events are grouped by aggregate id and inherit correlation/causation from the
    /// current event.
    pub async fn emit(&self, aggregate_type: &str, events: Vec<EventEnvelope>) -> DomainResult<()> {
        side_effect(Some(self), "emit", || self.append_grouped(aggregate_type, events)).await
    }

    pub async fn execute_command(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
        command: &str,
        payload: JsonValue,
        context: JsonValue,
    ) -> DomainResult<()> {
        side_effect(Some(self), "execute_command", || async move {
            match self.gateway() {
                Ok(gateway) => gateway
                    .execute_command(aggregate_type, aggregate_id, command, payload, context)
                    .await
                    .map(|_| ()),
                Err(e) => Err(e),
            }
        })
        .await
    }

    pub async fn schedule_command(
        &self,
        execute_at: DateTime<Utc>,
        aggregate_type: &str,
        aggregate_id: &str,
        command: &str,
        payload: JsonValue,
        context: JsonValue,
    ) -> DomainResult<()> {
        side_effect(Some(self), "schedule_command", || async move {
            match self.gateway() {
                Ok(gateway) => {
                    gateway
                        .schedule_command(execute_at, aggregate_type, aggregate_id, command, payload, context)
                        .await
                }
                Err(e) => Err(e),
            }
        })
        .await
    }

    async fn append_grouped(&self, aggregate_type: &str, events: Vec<EventEnvelope>) -> DomainResult<()> {
        let mut groups: BTreeMap<String, Vec<EventEnvelope>> = BTreeMap::new();
        for event in events {
            if event.aggregate_id().is_empty() {
                return Err(DomainError::bad_request(format!(
                    "emitted '{}' event has no aggregate id",
                    event.display_name()
                )));
            }
            let event = event.caused_by(&self.current_event);
            groups.entry(event.aggregate_id().to_string()).or_default().push(event);
        }

        let appends = groups.into_iter().map(|(aggregate_id, events)| async move {
            self.event_store
                .append(aggregate_type, &aggregate_id, events, ExpectedRevision::Any)
                .await
        });
        for result in futures::future::join_all(appends).await {
            result?;
        }
        Ok(())
    }
}

/// Run `effect` only when `ctx` is present, not replaying and its projection is active.
///
/// Without a context this is a usage error: it is logged and the effect is skipped.
pub async fn side_effect<F, Fut>(ctx: Option<&ProjectionContext>, name: &str, effect: F) -> DomainResult<()>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = DomainResult<()>>,
{
    let Some(ctx) = ctx else {
        tracing::warn!(
            side_effect = name,
            "invalid side effect execution: side effects only run from projection event handlers"
        );
        return Ok(());
    };

    if !ctx.side_effects_enabled() {
        tracing::trace!(
            side_effect = name,
            event_id = %ctx.current_event.id(),
            replaying = ctx.is_replaying,
            active = ctx.is_active(),
            "side effect skipped"
        );
        return Ok(());
    }

    effect().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::{EventFilter, InMemoryEventStore};
    use crate::store::InMemoryStore;
    use std::sync::atomic::AtomicUsize;

    struct NoGateway;

    #[async_trait]
    impl CommandGateway for NoGateway {
        async fn execute_command(
            &self,
            _: &str,
            _: &str,
            _: &str,
            _: JsonValue,
            _: JsonValue,
        ) -> DomainResult<Vec<EventEnvelope>> {
            Ok(vec![])
        }

        async fn schedule_command(
            &self,
            _: DateTime<Utc>,
            _: &str,
            _: &str,
            _: &str,
            _: JsonValue,
            _: JsonValue,
        ) -> DomainResult<()> {
            Ok(())
        }
    }

    fn ctx(event_store: Arc<InMemoryEventStore>, replaying: bool, active: bool) -> ProjectionContext {
        let gateway: Weak<dyn CommandGateway> = Weak::<NoGateway>::new();
        let current = EventEnvelope::from_parts("order.placed", 1, serde_json::json!({}))
            .unwrap()
            .with_aggregate_id("o1");
        ProjectionContext::new(
            replaying,
            current,
            event_store,
            Arc::new(EventCaster::new()),
            Arc::new(InMemoryStore::new("orders-1")),
            Arc::new(AtomicBool::new(active)),
            gateway,
        )
    }

    async fn count_runs(ctx: Option<&ProjectionContext>) -> usize {
        let runs = AtomicUsize::new(0);
        side_effect(ctx, "count", || async {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok::<(), DomainError>(())
        })
        .await
        .unwrap();
        runs.load(Ordering::SeqCst)
    }

    #[tokio::test]
    async fn gate_runs_only_live_and_active() {
        let store = Arc::new(InMemoryEventStore::new());
        assert_eq!(count_runs(None).await, 0);
        assert_eq!(count_runs(Some(&ctx(store.clone(), true, true))).await, 0);
        assert_eq!(count_runs(Some(&ctx(store.clone(), false, false))).await, 0);
        assert_eq!(count_runs(Some(&ctx(store, false, true))).await, 1);
    }

    #[tokio::test]
    async fn emitted_events_inherit_correlation() {
        let store = Arc::new(InMemoryEventStore::new());
        let ctx = ctx(store.clone(), false, true);
        let shipped = EventEnvelope::from_parts("order.shipped", 1, serde_json::json!({}))
            .unwrap()
            .with_aggregate_id("o1");
        ctx.emit("order", vec![shipped]).await.unwrap();

        assert_eq!(
            store.latest_position(&EventFilter::types(["order.shipped"])).await.unwrap(),
            Some(chronicle_core::Position::new(0))
        );
        let mut stream = store
            .read("order", "o1", Default::default())
            .await
            .unwrap();
        let stored = futures::StreamExt::next(&mut stream).await.unwrap().unwrap();
        assert_eq!(stored.causation_id(), Some(ctx.current_event().id()));
        assert_eq!(stored.correlation_id(), ctx.current_event().correlation_id());
    }

    #[tokio::test]
    async fn emit_while_replaying_appends_nothing() {
        let store = Arc::new(InMemoryEventStore::new());
        let ctx = ctx(store.clone(), true, true);
        let shipped = EventEnvelope::from_parts("order.shipped", 1, serde_json::json!({}))
            .unwrap()
            .with_aggregate_id("o1");
        ctx.emit("order", vec![shipped]).await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn commands_fail_once_the_runtime_is_gone() {
        let ctx = ctx(Arc::new(InMemoryEventStore::new()), false, true);
        let err = ctx
            .execute_command("order", "o1", "ship", JsonValue::Null, JsonValue::Null)
            .await
            .unwrap_err();
        assert_eq!(err.status(), 500);
    }
}
