use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::sync::watch;

use chronicle_core::{Direction, ExpectedRevision, Position, ReadFrom, SubscribeFrom};
use chronicle_events::EventEnvelope;

use super::r#trait::{
    EventFilter, EventStore, EventStoreError, EventStream, ReadOptions, SubscribeOptions,
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct StreamKey {
    aggregate_type: String,
    aggregate_id: String,
}

#[derive(Debug, Default)]
struct Log {
    streams: HashMap<StreamKey, Vec<EventEnvelope>>,
    /// Every event in append order; the index is the event's position.
    events: Vec<EventEnvelope>,
}

fn poisoned() -> EventStoreError {
    EventStoreError::Internal("lock poisoned".to_string())
}

/// In-memory append-only event store.
///
/// Intended for tests/dev. Not optimized for performance.
///
/// Subscriptions pull from the shared log behind a cursor and park on a `watch`
/// channel that is bumped on every append, so no event appended after the anchor can
/// be missed. Closing the store bumps a generation counter that ends every
/// subscription opened before; data itself survives close/connect cycles.
#[derive(Debug)]
pub struct InMemoryEventStore {
    log: Arc<RwLock<Log>>,
    head: watch::Sender<u64>,
    generation: watch::Sender<u64>,
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self {
            log: Arc::default(),
            head: watch::channel(0).0,
            generation: watch::channel(0).0,
        }
    }
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of events in the log.
    pub fn len(&self) -> usize {
        self.log.read().map(|log| log.events.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct Cursor {
    log: Arc<RwLock<Log>>,
    next: usize,
    filter: EventFilter,
    head: watch::Receiver<u64>,
    generation: watch::Receiver<u64>,
    opened_in: u64,
}

impl Cursor {
    fn next_matching(&mut self) -> Result<Option<EventEnvelope>, EventStoreError> {
        let log = self.log.read().map_err(|_| poisoned())?;
        let start = self.next.min(log.events.len());
        match log.events[start..]
            .iter()
            .position(|e| self.filter.matches(e.event_type()))
        {
            Some(offset) => {
                self.next = start + offset + 1;
                Ok(Some(log.events[start + offset].clone()))
            }
            None => {
                self.next = log.events.len();
                Ok(None)
            }
        }
    }

    fn into_stream(self) -> EventStream {
        Box::pin(futures::stream::unfold(self, |mut cursor| async move {
            loop {
                if *cursor.generation.borrow() != cursor.opened_in {
                    return None;
                }
                cursor.head.borrow_and_update();
                match cursor.next_matching() {
                    Ok(Some(event)) => return Some((Ok(event), cursor)),
                    Ok(None) => {}
                    Err(e) => return Some((Err(e), cursor)),
                }
                tokio::select! {
                    changed = cursor.head.changed() => {
                        if changed.is_err() {
                            return None;
                        }
                    }
                    changed = cursor.generation.changed() => {
                        if changed.is_err() {
                            return None;
                        }
                    }
                }
            }
        }))
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn connect(&self) -> Result<(), EventStoreError> {
        tracing::debug!("in-memory event store connected");
        Ok(())
    }

    async fn close(&self, force: bool) -> Result<(), EventStoreError> {
        self.generation.send_modify(|g| *g += 1);
        tracing::debug!(force, "in-memory event store closed");
        Ok(())
    }

    async fn read(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
        options: ReadOptions,
    ) -> Result<EventStream, EventStoreError> {
        let key = StreamKey {
            aggregate_type: aggregate_type.to_string(),
            aggregate_id: aggregate_id.to_string(),
        };
        let log = self.log.read().map_err(|_| poisoned())?;

        let Some(stream) = log.streams.get(&key) else {
            let missing = EventStoreError::StreamNotFound(format!("{aggregate_type}-{aggregate_id}"));
            return Ok(Box::pin(futures::stream::iter([Err(missing)])));
        };

        let len = stream.len();
        let events: Vec<EventEnvelope> = match options.direction {
            Direction::Forwards => {
                let start = match options.from {
                    ReadFrom::Start => 0,
                    ReadFrom::End => len,
                    ReadFrom::Revision(r) => usize::try_from(r).unwrap_or(usize::MAX).min(len),
                };
                stream[start..].to_vec()
            }
            Direction::Backwards => {
                let end = match options.from {
                    ReadFrom::Start => 1.min(len),
                    ReadFrom::End => len,
                    ReadFrom::Revision(r) => usize::try_from(r)
                        .map_or(len, |r| r.saturating_add(1))
                        .min(len),
                };
                stream[..end].iter().rev().cloned().collect()
            }
        };

        Ok(Box::pin(futures::stream::iter(events.into_iter().map(Ok))))
    }

    async fn append(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
        events: Vec<EventEnvelope>,
        expected: ExpectedRevision,
    ) -> Result<Vec<EventEnvelope>, EventStoreError> {
        if let Some((idx, _)) = events
            .iter()
            .enumerate()
            .find(|(_, e)| e.aggregate_id() != aggregate_id)
        {
            return Err(EventStoreError::InvalidAppend(format!(
                "batch contains an event for a different aggregate (index {idx})"
            )));
        }

        let key = StreamKey {
            aggregate_type: aggregate_type.to_string(),
            aggregate_id: aggregate_id.to_string(),
        };

        let committed = {
            let mut log = self.log.write().map_err(|_| poisoned())?;
            let current = log
                .streams
                .get(&key)
                .and_then(|s| s.len().checked_sub(1))
                .map(|r| r as u64);

            if !expected.matches(current) {
                return Err(EventStoreError::Conflict(format!(
                    "stream {aggregate_type}-{aggregate_id}: expected {expected}, actual {}",
                    current.map_or_else(|| "no stream".to_string(), |r| r.to_string())
                )));
            }
            if events.is_empty() {
                return Ok(vec![]);
            }

            let mut committed = Vec::with_capacity(events.len());
            for event in events {
                let position = Position::new(log.events.len() as u64);
                let event = event.with_position(position);
                log.events.push(event.clone());
                committed.push(event);
            }
            log.streams.entry(key).or_default().extend(committed.iter().cloned());
            committed
        };

        self.head.send_modify(|h| *h += committed.len() as u64);
        Ok(committed)
    }

    async fn subscribe(&self, options: SubscribeOptions) -> Result<EventStream, EventStoreError> {
        let next = match options.from {
            SubscribeFrom::Start => 0,
            SubscribeFrom::End => self.log.read().map_err(|_| poisoned())?.events.len(),
            SubscribeFrom::After(p) => usize::try_from(p.value()).map_or(usize::MAX, |p| p.saturating_add(1)),
        };

        let generation = self.generation.subscribe();
        let opened_in = *generation.borrow();
        let cursor = Cursor {
            log: Arc::clone(&self.log),
            next,
            filter: options.filter,
            head: self.head.subscribe(),
            generation,
            opened_in,
        };
        Ok(cursor.into_stream())
    }

    async fn latest_position(&self, filter: &EventFilter) -> Result<Option<Position>, EventStoreError> {
        let log = self.log.read().map_err(|_| poisoned())?;
        Ok(log
            .events
            .iter()
            .rev()
            .find(|e| filter.matches(e.event_type()))
            .and_then(|e| e.position()))
    }
}
