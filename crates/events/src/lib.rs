//! Event definitions, envelopes and version casting.
//!
//! Everything here is pure: event stores, aggregates and projections in
//! `chronicle-infra` build on these types.

pub mod caster;
pub mod envelope;
pub mod event;
pub mod identity;
pub mod registry;

pub use caster::{CastDirection, CastFn, EventCaster};
pub use envelope::EventEnvelope;
pub use event::{Event, event_type_of};
pub use identity::Identity;
pub use registry::{EventRegistry, Resolved};
