use chrono::{DateTime, Utc};
use serde::ser::Error as _;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value as JsonValue;

use chronicle_core::{DomainError, DomainResult, EventId, Position};

use crate::event::Event;
use crate::identity::Identity;

/// Envelope for one domain occurrence, carrying identity, tracing and ordering metadata.
///
/// This is the unit appended to an event stream and delivered to subscribers.
///
/// Notes:
/// - `correlation_id` defaults to the event's own id; `caused_by` inherits it from the
///   causing event and records that event's id as `causation_id`.
/// - `aggregate_id` is stamped by the aggregate right before append. Serializing an
///   envelope without one fails, so an unstamped event can never reach storage or
///   the network.
/// - `position` is assigned by the event store on append and is `None` before.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "EnvelopeData")]
pub struct EventEnvelope {
    id: EventId,
    event_type: String,
    version: u32,
    timestamp: DateTime<Utc>,
    aggregate_id: String,
    payload: JsonValue,
    correlation_id: EventId,
    causation_id: Option<EventId>,
    meta: JsonValue,
    position: Option<Position>,
}

impl EventEnvelope {
    /// Wrap a typed event, running its payload validation.
    pub fn new<E: Event>(event: E) -> DomainResult<Self> {
        event.validate()?;
        let payload = serde_json::to_value(&event)?;
        Self::from_parts(E::event_type(), E::VERSION, payload)
    }

    /// Build an envelope for an event type that has no typed definition at hand.
    pub fn from_parts(
        event_type: impl Into<String>,
        version: u32,
        payload: JsonValue,
    ) -> DomainResult<Self> {
        let event_type = event_type.into();
        if event_type.is_empty() {
            return Err(DomainError::bad_request("event type must not be empty"));
        }
        if version == 0 {
            return Err(DomainError::bad_request(format!(
                "version of event '{event_type}' must be greater than 0"
            )));
        }

        let id = EventId::new();
        Ok(Self {
            id,
            event_type,
            version,
            timestamp: Utc::now(),
            aggregate_id: String::new(),
            payload,
            correlation_id: id,
            causation_id: None,
            meta: JsonValue::Object(Default::default()),
            position: None,
        })
    }

    pub fn with_aggregate_id(mut self, aggregate_id: impl Into<String>) -> Self {
        self.aggregate_id = aggregate_id.into();
        self
    }

    pub fn with_meta(mut self, meta: JsonValue) -> Self {
        self.meta = meta;
        self
    }

    /// Mark this event as a consequence of `cause`.
    pub fn caused_by(mut self, cause: &EventEnvelope) -> Self {
        self.correlation_id = cause.correlation_id;
        self.causation_id = Some(cause.id);
        self
    }

    /// Assign the log position (event stores only).
    pub fn with_position(mut self, position: Position) -> Self {
        self.position = Some(position);
        self
    }

    pub fn set_aggregate_id(&mut self, aggregate_id: impl Into<String>) {
        self.aggregate_id = aggregate_id.into();
    }

    pub(crate) fn recast(mut self, version: u32, payload: JsonValue) -> Self {
        self.version = version;
        self.payload = payload;
        self
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn identity(&self) -> Identity {
        Identity::new(self.event_type.clone(), self.version)
    }

    pub fn display_name(&self) -> String {
        format!("{}@{}", self.event_type, self.version)
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn aggregate_id(&self) -> &str {
        &self.aggregate_id
    }

    pub fn payload(&self) -> &JsonValue {
        &self.payload
    }

    pub fn correlation_id(&self) -> EventId {
        self.correlation_id
    }

    pub fn causation_id(&self) -> Option<EventId> {
        self.causation_id
    }

    pub fn meta(&self) -> &JsonValue {
        &self.meta
    }

    pub fn position(&self) -> Option<Position> {
        self.position
    }

    /// Decode the payload as the typed event `E`.
    ///
    /// The envelope must carry exactly `E`'s identity; resolve it through an
    /// `EventRegistry` first when the stored version may differ.
    pub fn payload_as<E: Event>(&self) -> DomainResult<E> {
        if self.event_type != E::event_type() || self.version != E::VERSION {
            return Err(DomainError::cast(format!(
                "'{}' event cannot be read as '{}'",
                self.display_name(),
                E::identity().display_name()
            )));
        }
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            DomainError::internal(format!(
                "payload of '{}' event {} is malformed: {e}",
                self.display_name(),
                self.id
            ))
        })
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EnvelopeRef<'a> {
    id: EventId,
    #[serde(rename = "type")]
    event_type: &'a str,
    version: u32,
    timestamp: DateTime<Utc>,
    aggregate_id: &'a str,
    payload: &'a JsonValue,
    correlation_id: EventId,
    causation_id: Option<EventId>,
    meta: &'a JsonValue,
    position: Option<Position>,
}

impl Serialize for EventEnvelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.aggregate_id.is_empty() {
            return Err(S::Error::custom(format!(
                "invalid event state: missing aggregate id for '{}' event",
                self.display_name()
            )));
        }
        EnvelopeRef {
            id: self.id,
            event_type: &self.event_type,
            version: self.version,
            timestamp: self.timestamp,
            aggregate_id: &self.aggregate_id,
            payload: &self.payload,
            correlation_id: self.correlation_id,
            causation_id: self.causation_id,
            meta: &self.meta,
            position: self.position,
        }
        .serialize(serializer)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnvelopeData {
    id: EventId,
    #[serde(rename = "type")]
    event_type: String,
    version: u32,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    aggregate_id: String,
    #[serde(default)]
    payload: JsonValue,
    correlation_id: Option<EventId>,
    #[serde(default)]
    causation_id: Option<EventId>,
    #[serde(default)]
    meta: Option<JsonValue>,
    #[serde(default)]
    position: Option<Position>,
}

impl TryFrom<EnvelopeData> for EventEnvelope {
    type Error = String;

    fn try_from(data: EnvelopeData) -> Result<Self, Self::Error> {
        if data.event_type.is_empty() {
            return Err("event type must not be empty".to_string());
        }
        if data.version == 0 {
            return Err(format!(
                "version of event '{}' must be greater than 0",
                data.event_type
            ));
        }
        Ok(Self {
            id: data.id,
            event_type: data.event_type,
            version: data.version,
            timestamp: data.timestamp,
            aggregate_id: data.aggregate_id,
            payload: data.payload,
            correlation_id: data.correlation_id.unwrap_or(data.id),
            causation_id: data.causation_id,
            meta: data.meta.unwrap_or_else(|| JsonValue::Object(Default::default())),
            position: data.position,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct PetRenamed {
        name: String,
    }

    impl Event for PetRenamed {
        const NAME: &'static str = "PetRenamed";
        const VERSION: u32 = 1;

        fn validate(&self) -> DomainResult<()> {
            if self.name.trim().is_empty() {
                return Err(DomainError::bad_request("name must not be blank"));
            }
            Ok(())
        }
    }

    #[test]
    fn typed_construction_derives_identity() {
        let e = EventEnvelope::new(PetRenamed { name: "Slevin".into() }).unwrap();
        assert_eq!(e.event_type(), "pet.renamed");
        assert_eq!(e.version(), 1);
        assert_eq!(e.correlation_id(), e.id());
        assert_eq!(e.causation_id(), None);
        assert_eq!(e.meta(), &json!({}));
        assert_eq!(e.position(), None);
    }

    #[test]
    fn typed_construction_validates_payload() {
        let err = EventEnvelope::new(PetRenamed { name: " ".into() }).unwrap_err();
        assert!(err.is_bad_request());
    }

    #[test]
    fn caused_events_inherit_correlation() {
        let cause = EventEnvelope::from_parts("pet.registered", 1, json!({})).unwrap();
        let effect = EventEnvelope::from_parts("pet.renamed", 1, json!({})).unwrap().caused_by(&cause);
        assert_eq!(effect.correlation_id(), cause.correlation_id());
        assert_eq!(effect.causation_id(), Some(cause.id()));

        let second = EventEnvelope::from_parts("pet.renamed", 1, json!({})).unwrap().caused_by(&effect);
        assert_eq!(second.correlation_id(), cause.id());
        assert_eq!(second.causation_id(), Some(effect.id()));
    }

    #[test]
    fn serializing_requires_aggregate_id() {
        let e = EventEnvelope::from_parts("pet.renamed", 1, json!({"name": "x"})).unwrap();
        assert!(serde_json::to_value(&e).is_err());

        let value = serde_json::to_value(e.with_aggregate_id("pet-1")).unwrap();
        assert_eq!(value["type"], "pet.renamed");
        assert_eq!(value["aggregateId"], "pet-1");
        assert!(value.get("correlationId").is_some());
    }

    #[test]
    fn zero_versions_are_rejected() {
        assert!(EventEnvelope::from_parts("pet.renamed", 0, json!({})).is_err());

        let stored = json!({
            "id": EventId::new(),
            "type": "pet.renamed",
            "version": 0,
            "timestamp": Utc::now(),
            "aggregateId": "pet-1",
            "payload": {}
        });
        assert!(serde_json::from_value::<EventEnvelope>(stored).is_err());
    }

    #[test]
    fn payload_as_checks_identity() {
        let e = EventEnvelope::from_parts("pet.renamed", 2, json!({"name": "x"})).unwrap();
        assert!(matches!(e.payload_as::<PetRenamed>(), Err(DomainError::Cast(_))));

        let e = EventEnvelope::from_parts("pet.renamed", 1, json!({"name": "x"})).unwrap();
        assert_eq!(e.payload_as::<PetRenamed>().unwrap().name, "x");
    }
}
