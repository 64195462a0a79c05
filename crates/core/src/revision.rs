//! Log positions, stream revisions and read anchors.
//!
//! Two orderings exist in an event log:
//! - a **stream revision** (`u64`, 0-based) orders the events of one aggregate stream;
//! - a **position** ([`Position`]) totally orders every event in the log.
//!
//! Appends are guarded by an [`ExpectedRevision`] (optimistic concurrency);
//! reads and subscriptions start at an anchor ([`ReadFrom`], [`SubscribeFrom`]).

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Opaque, totally ordered log position assigned by the event store on append.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Position(u64);

impl Position {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u64 {
        self.0
    }

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl From<u64> for Position {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Optimistic concurrency precondition for an append.
///
/// Serialized as `"state_new"`, `"state_exists"`, `"any"` or the bare revision number.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RevisionRepr", into = "RevisionRepr")]
pub enum ExpectedRevision {
    /// Skip the check (forced appends).
    Any,
    /// The stream must not exist yet.
    New,
    /// The stream must already exist.
    MustExist,
    /// The last event of the stream must sit at this revision.
    Exact(u64),
}

impl ExpectedRevision {
    /// `current` is the revision of the stream's last event, `None` if the stream does not exist.
    pub fn matches(self, current: Option<u64>) -> bool {
        match self {
            ExpectedRevision::Any => true,
            ExpectedRevision::New => current.is_none(),
            ExpectedRevision::MustExist => current.is_some(),
            ExpectedRevision::Exact(r) => current == Some(r),
        }
    }

    pub fn check(self, current: Option<u64>) -> DomainResult<()> {
        if self.matches(current) {
            Ok(())
        } else {
            Err(DomainError::conflict(format!(
                "optimistic concurrency check failed (expected: {self}, actual: {})",
                current.map_or_else(|| "no stream".to_string(), |r| r.to_string())
            )))
        }
    }
}

impl fmt::Display for ExpectedRevision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpectedRevision::Any => f.write_str(ANY),
            ExpectedRevision::New => f.write_str(STATE_NEW),
            ExpectedRevision::MustExist => f.write_str(STATE_EXISTS),
            ExpectedRevision::Exact(r) => write!(f, "{r}"),
        }
    }
}

const ANY: &str = "any";
const STATE_NEW: &str = "state_new";
const STATE_EXISTS: &str = "state_exists";

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RevisionRepr {
    Revision(u64),
    Marker(String),
}

impl From<ExpectedRevision> for RevisionRepr {
    fn from(value: ExpectedRevision) -> Self {
        match value {
            ExpectedRevision::Exact(r) => RevisionRepr::Revision(r),
            other => RevisionRepr::Marker(other.to_string()),
        }
    }
}

impl TryFrom<RevisionRepr> for ExpectedRevision {
    type Error = String;

    fn try_from(value: RevisionRepr) -> Result<Self, Self::Error> {
        match value {
            RevisionRepr::Revision(r) => Ok(ExpectedRevision::Exact(r)),
            RevisionRepr::Marker(m) => match m.as_str() {
                ANY => Ok(ExpectedRevision::Any),
                STATE_NEW => Ok(ExpectedRevision::New),
                STATE_EXISTS => Ok(ExpectedRevision::MustExist),
                other => Err(format!("unknown revision marker '{other}'")),
            },
        }
    }
}

/// Where a stream read starts. `Revision` is inclusive.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadFrom {
    #[default]
    Start,
    End,
    Revision(u64),
}

/// Where a subscription starts. `After` resumes behind an already processed position.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscribeFrom {
    #[default]
    Start,
    End,
    After(Position),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[default]
    Forwards,
    Backwards,
}
