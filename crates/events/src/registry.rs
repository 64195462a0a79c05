//! Explicit `(type, version) → handler` dispatch table.
//!
//! Aggregates (fold functions) and projectors (async store updaters) both build one
//! registry at construction time through explicit `register` calls. Resolving an
//! event returns the handler for its exact version, or casts the event to the
//! highest version registered for its type.

use std::collections::{BTreeMap, HashMap};

use chronicle_core::{DomainError, DomainResult};

use crate::caster::EventCaster;
use crate::envelope::EventEnvelope;
use crate::identity::Identity;

/// Outcome of [`EventRegistry::resolve`].
#[derive(Debug)]
pub struct Resolved<'a, H> {
    /// The event as the handler expects it (cast if needed).
    pub event: EventEnvelope,
    /// `None` when no handler is registered for the event's type.
    pub handler: Option<&'a H>,
}

#[derive(Debug, Clone)]
pub struct EventRegistry<H> {
    handlers: HashMap<String, BTreeMap<u32, H>>,
}

impl<H> Default for EventRegistry<H> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }
}

impl<H> EventRegistry<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `identity`. A second handler for the same identity fails.
    pub fn register(&mut self, identity: Identity, handler: H) -> DomainResult<()> {
        if identity.event_type().is_empty() || identity.version() == 0 {
            return Err(DomainError::bad_request(format!(
                "invalid event identity {identity}"
            )));
        }
        let versions = self.handlers.entry(identity.event_type().to_string()).or_default();
        if versions.contains_key(&identity.version()) {
            return Err(DomainError::conflict(format!(
                "handler for '{}' is already registered",
                identity.display_name()
            )));
        }
        versions.insert(identity.version(), handler);
        Ok(())
    }

    /// Registered event types, sorted.
    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn get(&self, identity: &Identity) -> Option<&H> {
        self.handlers
            .get(identity.event_type())
            .and_then(|versions| versions.get(&identity.version()))
    }

    /// Find the handler for `event`, casting it to the highest registered version of
    /// its type when its own version has no handler.
    pub fn resolve(&self, event: EventEnvelope, caster: &EventCaster) -> DomainResult<Resolved<'_, H>> {
        let Some(versions) = self.handlers.get(event.event_type()) else {
            return Ok(Resolved { event, handler: None });
        };

        if let Some(handler) = versions.get(&event.version()) {
            return Ok(Resolved {
                event,
                handler: Some(handler),
            });
        }

        let Some((&target, handler)) = versions.iter().next_back() else {
            return Ok(Resolved { event, handler: None });
        };
        let event = caster.cast(event, target)?;
        Ok(Resolved {
            event,
            handler: Some(handler),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use proptest::prelude::*;

    fn registry() -> EventRegistry<&'static str> {
        let mut r = EventRegistry::new();
        r.register(Identity::new("pet.registered", 1), "registered@1").unwrap();
        r.register(Identity::new("pet.registered", 3), "registered@3").unwrap();
        r.register(Identity::new("pet.renamed", 1), "renamed@1").unwrap();
        r
    }

    fn caster() -> EventCaster {
        let mut c = EventCaster::new();
        for v in 1..=4 {
            c.register_identity(Identity::new("pet.registered", v)).unwrap();
        }
        c.register_identity(Identity::new("pet.renamed", 1)).unwrap();
        c
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut r = registry();
        let err = r.register(Identity::new("pet.registered", 3), "again").unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn types_are_listed_once() {
        assert_eq!(registry().types(), vec!["pet.registered", "pet.renamed"]);
    }

    #[test]
    fn exact_version_resolves_unchanged() {
        let r = registry();
        let e = EventEnvelope::from_parts("pet.registered", 1, json!({"name": "Lucky"})).unwrap();
        let resolved = r.resolve(e.clone(), &caster()).unwrap();
        assert_eq!(resolved.handler, Some(&"registered@1"));
        assert_eq!(resolved.event, e);
    }

    #[test]
    fn missing_version_casts_to_highest_registered() {
        let r = registry();
        let e = EventEnvelope::from_parts("pet.registered", 2, json!({"name": "Lucky"})).unwrap();
        let resolved = r.resolve(e, &caster()).unwrap();
        assert_eq!(resolved.handler, Some(&"registered@3"));
        assert_eq!(resolved.event.version(), 3);

        let e = EventEnvelope::from_parts("pet.registered", 4, json!({})).unwrap();
        let resolved = r.resolve(e, &caster()).unwrap();
        assert_eq!(resolved.event.version(), 3);
    }

    #[test]
    fn unknown_type_has_no_handler() {
        let e = EventEnvelope::from_parts("pet.adopted", 1, json!({})).unwrap();
        let binding = registry();
        let resolved = binding.resolve(e, &caster()).unwrap();
        assert!(resolved.handler.is_none());
    }

    #[test]
    fn uncastable_event_fails() {
        let e = EventEnvelope::from_parts("pet.registered", 9, json!({})).unwrap();
        assert!(matches!(registry().resolve(e, &caster()), Err(DomainError::Cast(_))));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 128,
            ..ProptestConfig::default()
        })]

        #[test]
        fn resolve_picks_exact_or_highest(registered in proptest::collection::btree_set(1u32..12, 1..6), event_version in 1u32..12) {
            let mut r = EventRegistry::new();
            let mut c = EventCaster::new();
            for v in 1..12 {
                c.register_identity(Identity::new("item.moved", v)).unwrap();
            }
            for v in &registered {
                r.register(Identity::new("item.moved", *v), *v).unwrap();
            }

            let e = EventEnvelope::from_parts("item.moved", event_version, json!({})).unwrap();
            let resolved = r.resolve(e, &c).unwrap();
            let expected = if registered.contains(&event_version) {
                event_version
            } else {
                *registered.iter().next_back().unwrap()
            };
            prop_assert_eq!(resolved.handler.copied(), Some(expected));
            prop_assert_eq!(resolved.event.version(), expected);
        }
    }
}
