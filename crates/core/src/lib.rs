//! `chronicle-core`: foundation building blocks shared by every layer.
//!
//! This crate contains **pure** primitives (no IO): the error taxonomy, log
//! positions and revisions, and identifier newtypes.

pub mod error;
pub mod id;
pub mod revision;

pub use error::{DomainError, DomainResult};
pub use id::{EventId, InvocationId};
pub use revision::{Direction, ExpectedRevision, Position, ReadFrom, SubscribeFrom};
