//! Event identity: the `(type, version)` pair.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use chronicle_core::DomainError;

/// `(type, version)` pair identifying one event schema.
///
/// The canonical string form is `{"type":"<type>","version":<n>}`; it is both the
/// handler lookup key and the duplicate-registration key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identity {
    #[serde(rename = "type")]
    event_type: String,
    version: u32,
}

impl Identity {
    pub fn new(event_type: impl Into<String>, version: u32) -> Self {
        Self {
            event_type: event_type.into(),
            version,
        }
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// `type@version`, used in log lines and error messages.
    pub fn display_name(&self) -> String {
        format!("{}@{}", self.event_type, self.version)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // serde_json escapes the type exactly like the canonical form requires.
        let ty = serde_json::to_string(&self.event_type).map_err(|_| fmt::Error)?;
        write!(f, r#"{{"type":{ty},"version":{}}}"#, self.version)
    }
}

impl FromStr for Identity {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let identity: Identity = serde_json::from_str(s)
            .map_err(|e| DomainError::bad_request(format!("invalid event identity '{s}': {e}")))?;
        if identity.event_type.is_empty() {
            return Err(DomainError::bad_request(format!(
                "invalid event identity '{s}': empty type"
            )));
        }
        Ok(identity)
    }
}
