use std::collections::BTreeSet;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use thiserror::Error;

use chronicle_core::{
    Direction, DomainError, ExpectedRevision, Position, ReadFrom, SubscribeFrom,
};
use chronicle_events::EventEnvelope;

/// Lazy sequence of events produced by [`EventStore::read`] and [`EventStore::subscribe`].
pub type EventStream = Pin<Box<dyn Stream<Item = Result<EventEnvelope, EventStoreError>> + Send>>;

/// Event store operation error.
///
/// These are **infrastructure errors** (storage, concurrency) as opposed to domain
/// errors (validation, invariants). They map into [`DomainError`] at the boundary.
#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error("optimistic concurrency check failed: {0}")]
    Conflict(String),

    #[error("stream not found: {0}")]
    StreamNotFound(String),

    #[error("invalid append: {0}")]
    InvalidAppend(String),

    #[error("event store failure: {0}")]
    Internal(String),
}

impl From<EventStoreError> for DomainError {
    fn from(value: EventStoreError) -> Self {
        match value {
            EventStoreError::Conflict(msg) => DomainError::conflict(msg),
            EventStoreError::StreamNotFound(msg) => DomainError::not_found(msg),
            EventStoreError::InvalidAppend(msg) => DomainError::bad_request(msg),
            EventStoreError::Internal(msg) => DomainError::internal(msg),
        }
    }
}

/// Options for reading a single aggregate stream.
///
/// `from` anchors the read (inclusive). Forwards reads yield the anchor and everything
/// after it; backwards reads yield the anchor and everything before it, newest first.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct ReadOptions {
    pub from: ReadFrom,
    pub direction: Direction,
}

impl ReadOptions {
    pub fn from_revision(revision: u64) -> Self {
        Self {
            from: ReadFrom::Revision(revision),
            direction: Direction::Forwards,
        }
    }
}

/// Restricts a subscription (or a latest-position lookup) to a set of event types.
///
/// `None` matches every event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    types: Option<BTreeSet<String>>,
}

impl EventFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn types<I, T>(types: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self {
            types: Some(types.into_iter().map(Into::into).collect()),
        }
    }

    pub fn matches(&self, event_type: &str) -> bool {
        self.types.as_ref().is_none_or(|types| types.contains(event_type))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    pub from: SubscribeFrom,
    pub filter: EventFilter,
}

/// Append-only event log with per-aggregate streams and a global position order.
///
/// ## Streams
///
/// One stream per `(aggregate_type, aggregate_id)`. Stream revisions start at `0`, so
/// the revision of a stream's last event equals its event count minus one. Every
/// appended event additionally receives a totally ordered log [`Position`].
///
/// ## Append semantics
///
/// - the precondition is checked against the revision of the stream's last event
///   (`None` for a missing stream); violations fail with [`EventStoreError::Conflict`]
/// - events must carry the target `aggregate_id`
/// - the batch is persisted atomically and returned with positions assigned
///
/// ## Reads and subscriptions
///
/// - `read` yields a finite stream; a missing stream yields a single
///   [`EventStoreError::StreamNotFound`] item
/// - `subscribe` yields history after the anchor, then live events, and ends when the
///   store is closed or the stream is dropped
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn connect(&self) -> Result<(), EventStoreError>;

    async fn close(&self, force: bool) -> Result<(), EventStoreError>;

    async fn read(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
        options: ReadOptions,
    ) -> Result<EventStream, EventStoreError>;

    async fn append(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
        events: Vec<EventEnvelope>,
        expected: ExpectedRevision,
    ) -> Result<Vec<EventEnvelope>, EventStoreError>;

    async fn subscribe(&self, options: SubscribeOptions) -> Result<EventStream, EventStoreError>;

    /// Position of the newest event matching `filter`, `None` if there is none.
    async fn latest_position(&self, filter: &EventFilter) -> Result<Option<Position>, EventStoreError>;
}

#[async_trait]
impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    async fn connect(&self) -> Result<(), EventStoreError> {
        (**self).connect().await
    }

    async fn close(&self, force: bool) -> Result<(), EventStoreError> {
        (**self).close(force).await
    }

    async fn read(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
        options: ReadOptions,
    ) -> Result<EventStream, EventStoreError> {
        (**self).read(aggregate_type, aggregate_id, options).await
    }

    async fn append(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
        events: Vec<EventEnvelope>,
        expected: ExpectedRevision,
    ) -> Result<Vec<EventEnvelope>, EventStoreError> {
        (**self).append(aggregate_type, aggregate_id, events, expected).await
    }

    async fn subscribe(&self, options: SubscribeOptions) -> Result<EventStream, EventStoreError> {
        (**self).subscribe(options).await
    }

    async fn latest_position(&self, filter: &EventFilter) -> Result<Option<Position>, EventStoreError> {
        (**self).latest_position(filter).await
    }
}
