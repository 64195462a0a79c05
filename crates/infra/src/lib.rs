//! Runtime layer: adapters, aggregates, projections, scheduling and the orchestrator.
//!
//! - [`event_store`] and [`store`] define the storage seams and ship in-memory adapters
//! - [`aggregate`] and [`snapshot`] implement the write side
//! - [`projections`] and [`read_model`] implement the read side
//! - [`scheduler`] delivers commands at a later time
//! - [`runtime`] wires everything together behind one [`Runtime`]

pub mod aggregate;
pub mod context;
pub mod event_store;
pub mod projections;
pub mod read_model;
pub mod runtime;
pub mod scheduler;
pub mod snapshot;
pub mod store;

mod integration_tests;

pub use aggregate::{
    Aggregate, AggregateDispatch, AggregateOptions, AggregateStatus, CommandContext, CommandInfo,
    CommandOptions, Payload, StateUpdate,
};
pub use context::{CommandGateway, ExecutionContext, ProjectionContext, side_effect};
pub use projections::{Projection, ProjectionInfo, Projector};
pub use read_model::{QueryContext, ReadModel};
pub use runtime::{Runtime, RuntimeConfig, RuntimeSettings};
