//! Append-only event store boundary.
//!
//! The runtime talks to the event log only through [`EventStore`]. Concrete database
//! adapters live outside this workspace; [`InMemoryEventStore`] is the reference
//! adapter used by tests and local development.

pub mod in_memory;
pub mod r#trait;

pub use in_memory::InMemoryEventStore;
pub use r#trait::{
    EventFilter, EventStore, EventStoreError, EventStream, ReadOptions, SubscribeOptions,
};
