use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use chronicle_core::{DomainError, DomainResult};
use chronicle_events::{Event, EventEnvelope};

/// Command payload schema: decoded from JSON, then validated.
pub trait Payload: DeserializeOwned + Send + 'static {
    fn validate(&self) -> DomainResult<()> {
        Ok(())
    }
}

impl Payload for JsonValue {}

impl Payload for () {}

/// Decode and validate a raw payload; every failure is a Bad Request.
pub fn decode_payload<P: Payload>(raw: JsonValue) -> DomainResult<P> {
    let payload: P = serde_json::from_value(raw)
        .map_err(|e| DomainError::bad_request(format!("invalid payload: {e}")))?;
    payload.validate()?;
    Ok(payload)
}

/// What a command decided.
#[derive(Debug, Clone, PartialEq)]
pub enum StateUpdate {
    /// Nothing happened; nothing is appended.
    None,
    /// Append with the hydrated revision as precondition.
    Events(Vec<EventEnvelope>),
    /// Append without a concurrency check.
    Forced(Vec<EventEnvelope>),
}

impl StateUpdate {
    pub fn event<E: Event>(event: E) -> DomainResult<Self> {
        Ok(StateUpdate::Events(vec![EventEnvelope::new(event)?]))
    }

    pub fn force(self) -> Self {
        match self {
            StateUpdate::Events(events) => StateUpdate::Forced(events),
            other => other,
        }
    }

    pub fn events(&self) -> &[EventEnvelope] {
        match self {
            StateUpdate::None => &[],
            StateUpdate::Events(events) | StateUpdate::Forced(events) => events,
        }
    }
}

impl From<EventEnvelope> for StateUpdate {
    fn from(value: EventEnvelope) -> Self {
        StateUpdate::Events(vec![value])
    }
}

impl From<Vec<EventEnvelope>> for StateUpdate {
    fn from(value: Vec<EventEnvelope>) -> Self {
        if value.is_empty() {
            StateUpdate::None
        } else {
            StateUpdate::Events(value)
        }
    }
}

/// Read-only view handed to a command alongside the state.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandContext {
    pub aggregate_id: String,
    /// Number of events folded into the state.
    pub aggregate_version: u64,
    /// Caller-supplied context, `null` if none.
    pub caller: JsonValue,
}

#[derive(Debug, Clone, Default)]
pub struct CommandOptions {
    pub name: Option<String>,
}

impl CommandOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
        }
    }
}

/// Handle to a registered command, usable as an execution target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandInfo {
    pub aggregate_type: String,
    pub name: String,
}

/// Name of a fn item, `None` for closures and function pointers.
pub(crate) fn fn_item_name<F>() -> Option<String> {
    let full = std::any::type_name::<F>();
    if full.contains("{{closure}}") || full.starts_with("fn(") || full.starts_with('&') {
        return None;
    }
    let path = full.split('<').next().unwrap_or(full);
    path.rsplit("::").next().filter(|n| !n.is_empty()).map(str::to_string)
}
