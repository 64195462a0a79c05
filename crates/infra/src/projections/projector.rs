use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;

use chronicle_core::{DomainError, DomainResult};
use chronicle_events::{Event, EventEnvelope, EventRegistry, Identity};

use crate::context::ProjectionContext;
use crate::store::TableDefinition;

/// Async event handler of a projector.
pub type ProjectionHandler =
    Arc<dyn Fn(ProjectionContext, EventEnvelope) -> BoxFuture<'static, DomainResult<()>> + Send + Sync>;

/// Stateless description of how events materialize into tables.
///
/// A projector is versioned: changing what it writes means registering a new version
/// and building a new projection from it, while the old one keeps serving reads.
pub struct Projector {
    name: String,
    version: u32,
    tables: Vec<TableDefinition>,
    handlers: EventRegistry<ProjectionHandler>,
}

impl std::fmt::Debug for Projector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Projector")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("tables", &self.tables)
            .field("events", &self.handlers.types())
            .finish()
    }
}

impl Projector {
    pub fn new(name: impl Into<String>, version: u32) -> DomainResult<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(DomainError::bad_request("projector name must not be empty"));
        }
        if version == 0 {
            return Err(DomainError::bad_request(format!(
                "projector '{name}' needs a version greater than zero"
            )));
        }
        Ok(Self {
            name,
            version,
            tables: Vec::new(),
            handlers: EventRegistry::new(),
        })
    }

    pub fn with_table(mut self, table: TableDefinition) -> Self {
        self.tables.push(table);
        self
    }

    /// Handle events of `E`'s identity; other versions of the type are cast first.
    pub fn on<E, F, Fut>(mut self, f: F) -> DomainResult<Self>
    where
        E: Event,
        F: Fn(ProjectionContext, E) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DomainResult<()>> + Send + 'static,
    {
        let handler: ProjectionHandler = Arc::new(move |ctx: ProjectionContext, event: EventEnvelope| {
            match event.payload_as::<E>() {
                Ok(payload) => f(ctx, payload).boxed(),
                Err(e) => futures::future::ready(Err(e)).boxed(),
            }
        });
        self.handlers.register(E::identity(), handler)?;
        Ok(self)
    }

    /// Handle raw envelopes of `identity`, for event types without a Rust definition.
    pub fn on_identity<F, Fut>(mut self, identity: Identity, f: F) -> DomainResult<Self>
    where
        F: Fn(ProjectionContext, EventEnvelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DomainResult<()>> + Send + 'static,
    {
        let handler: ProjectionHandler =
            Arc::new(move |ctx: ProjectionContext, event: EventEnvelope| f(ctx, event).boxed());
        self.handlers.register(identity, handler)?;
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// `name@version`
    pub fn display_name(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }

    pub fn tables(&self) -> &[TableDefinition] {
        &self.tables
    }

    /// Event types this projector subscribes to.
    pub fn types(&self) -> Vec<String> {
        self.handlers.types()
    }

    /// Apply one event. Events without a handler are ignored.
    pub async fn on_event(&self, ctx: ProjectionContext, event: EventEnvelope) -> DomainResult<()> {
        let resolved = self.handlers.resolve(event, ctx.caster())?;
        match resolved.handler {
            Some(handler) => handler(ctx, resolved.event).await,
            None => Ok(()),
        }
    }
}
