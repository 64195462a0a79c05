//! Key/value stores for projections, snapshots and runtime configuration.
//!
//! A [`Store`] is a prefixed set of [`Table`]s over JSON objects. Projection stores,
//! snapshot stores and the runtime's internal store are all created through a
//! [`StoreProvider`], so a host plugs in a database adapter once and every
//! consumer gets its own prefix.

pub mod in_memory;
pub mod r#trait;
pub mod typed;

pub use in_memory::{InMemoryStore, InMemoryStoreProvider};
pub use r#trait::{
    Record, Store, StoreError, StoreProvider, Table, TableDefinition, to_record,
};
pub use typed::TypedTable;
