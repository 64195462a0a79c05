//! Projections (read model builders).
//!
//! A [`Projector`] describes how events turn into table writes. A [`Projection`] is
//! one projector materialized into one store, identified as `"{name}-{version}"`.
//! Several versions of a name may run side by side; the [`ProjectionMap`] tracks
//! which one is active and serves reads.
//!
//! Projections are:
//! - **Rebuildable**: a new version replays the whole log into a fresh store
//! - **Resumable**: the processed position lives next to the data
//! - **At-least-once**: handlers may see an event again after a crash

pub mod map;
pub mod projection;
pub mod projector;

pub use map::ProjectionMap;
pub use projection::{POSITION_TABLE, Projection, ProjectionDeps, ProjectionInfo, ProjectorInfo};
pub use projector::{ProjectionHandler, Projector};
