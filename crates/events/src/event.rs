use serde::Serialize;
use serde::de::DeserializeOwned;

use chronicle_core::DomainResult;

use crate::identity::Identity;

/// A typed event definition.
///
/// Events are:
/// - **immutable** (treat them as facts)
/// - **versioned** (schema evolution), `VERSION` must be greater than zero
/// - designed to be **append-only**
///
/// The wire type is derived from `NAME` (see [`event_type_of`]), so renaming the
/// Rust type does not change stored events as long as `NAME` stays put.
pub trait Event: Serialize + DeserializeOwned + Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Declared event name, e.g. `"AccountOpened"`.
    const NAME: &'static str;

    /// Schema version for this event type.
    const VERSION: u32;

    /// Stable event type identifier, e.g. `"account.opened"`.
    fn event_type() -> String {
        event_type_of(Self::NAME)
    }

    fn identity() -> Identity {
        Identity::new(Self::event_type(), Self::VERSION)
    }

    /// Payload schema check, run whenever an envelope is built from this event.
    fn validate(&self) -> DomainResult<()> {
        Ok(())
    }
}

/// Derive a dot-separated, lower-case event type from a declared name.
///
/// Runs of non-word characters separate words, and an upper-case letter that
/// follows a word character starts a new word:
/// `AccountOpened` → `account.opened`, `order placed` → `order.placed`.
pub fn event_type_of(name: &str) -> String {
    let mut words: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut prev_is_word = false;

    for c in name.chars() {
        let is_word = c.is_ascii_alphanumeric() || c == '_';
        if !is_word {
            if !current.is_empty() {
                words.push(core::mem::take(&mut current));
            }
            prev_is_word = false;
            continue;
        }
        if c.is_ascii_uppercase() && prev_is_word && !current.is_empty() {
            words.push(core::mem::take(&mut current));
        }
        current.push(c.to_ascii_lowercase());
        prev_is_word = true;
    }
    if !current.is_empty() {
        words.push(current);
    }

    words.join(".")
}
