//! Event version casting.
//!
//! The caster knows which event definitions exist (the event catalog) and how to move
//! an event between versions of the same type.
//!
//! ## Design
//!
//! - Casting walks one version step at a time, up or down.
//! - Each step applies the payload transformation installed for that exact
//!   `(type, from, to)` pair. A step without one only substitutes the version.
//! - Field-level promotion/demotion rules are never inferred. Transformations are
//!   supplied by the implementer per event-type/version pair.
//! - Both ends of a cast must be known definitions, otherwise the cast fails with
//!   [`DomainError::Cast`].
//!
//! The caster is owned by a runtime instance and passed to whoever resolves events.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde_json::Value as JsonValue;

use chronicle_core::{DomainError, DomainResult};

use crate::envelope::EventEnvelope;
use crate::event::Event;
use crate::identity::Identity;

/// Payload transformation for one version step.
pub type CastFn = Arc<dyn Fn(JsonValue) -> DomainResult<JsonValue> + Send + Sync>;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CastDirection {
    Up,
    Down,
}

impl CastDirection {
    pub fn between(from: u32, to: u32) -> Option<Self> {
        match from.cmp(&to) {
            core::cmp::Ordering::Less => Some(CastDirection::Up),
            core::cmp::Ordering::Greater => Some(CastDirection::Down),
            core::cmp::Ordering::Equal => None,
        }
    }
}

#[derive(Clone, Default)]
pub struct EventCaster {
    catalog: HashMap<String, BTreeSet<u32>>,
    transforms: HashMap<(String, u32, u32), CastFn>,
}

impl core::fmt::Debug for EventCaster {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventCaster")
            .field("catalog", &self.catalog)
            .field("transforms", &self.transforms.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl EventCaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a typed event definition to the catalog.
    pub fn register<E: Event>(&mut self) -> DomainResult<()> {
        self.register_identity(E::identity())
    }

    pub fn with<E: Event>(mut self) -> DomainResult<Self> {
        self.register::<E>()?;
        Ok(self)
    }

    /// Add a definition known only by identity (e.g. events owned by another service).
    pub fn register_identity(&mut self, identity: Identity) -> DomainResult<()> {
        if identity.version() == 0 {
            return Err(DomainError::bad_request(format!(
                "version of event '{}' must be greater than 0",
                identity.event_type()
            )));
        }
        let versions = self.catalog.entry(identity.event_type().to_string()).or_default();
        if !versions.insert(identity.version()) {
            return Err(DomainError::conflict(format!(
                "duplicate event definition: '{}' already exists",
                identity.display_name()
            )));
        }
        Ok(())
    }

    pub fn is_known(&self, event_type: &str, version: u32) -> bool {
        self.catalog
            .get(event_type)
            .is_some_and(|versions| versions.contains(&version))
    }

    pub fn versions(&self, event_type: &str) -> Vec<u32> {
        self.catalog
            .get(event_type)
            .map(|v| v.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Install the payload transformation for one adjacent version step.
    pub fn with_transform<F>(
        mut self,
        event_type: impl Into<String>,
        from: u32,
        to: u32,
        transform: F,
    ) -> DomainResult<Self>
    where
        F: Fn(JsonValue) -> DomainResult<JsonValue> + Send + Sync + 'static,
    {
        let event_type = event_type.into();
        if from.abs_diff(to) != 1 {
            return Err(DomainError::bad_request(format!(
                "cast transformation for '{event_type}' must connect adjacent versions ({from} -> {to})"
            )));
        }
        let key = (event_type, from, to);
        if self.transforms.contains_key(&key) {
            return Err(DomainError::conflict(format!(
                "cast transformation for '{}' {} -> {} already exists",
                key.0, from, to
            )));
        }
        self.transforms.insert(key, Arc::new(transform));
        Ok(self)
    }

    /// Cast `event` to `target_version` of its type.
    pub fn cast(&self, event: EventEnvelope, target_version: u32) -> DomainResult<EventEnvelope> {
        let source_version = event.version();
        let Some(direction) = CastDirection::between(source_version, target_version) else {
            return Ok(event);
        };

        let event_type = event.event_type().to_string();
        if !self.is_known(&event_type, source_version) || !self.is_known(&event_type, target_version) {
            return Err(DomainError::cast(format!(
                "casting '{}' to '{}@{}' failed: event catalog is not up to date",
                event.display_name(),
                event_type,
                target_version
            )));
        }

        let mut payload = event.payload().clone();
        let mut version = source_version;
        while version != target_version {
            let next = match direction {
                CastDirection::Up => version + 1,
                CastDirection::Down => version - 1,
            };
            if let Some(transform) = self.transforms.get(&(event_type.clone(), version, next)) {
                payload = transform(payload).map_err(|e| {
                    DomainError::cast(format!(
                        "casting '{event_type}@{version}' to '{event_type}@{next}' failed: {e}"
                    ))
                })?;
            }
            version = next;
        }

        Ok(event.recast(target_version, payload))
    }
}
