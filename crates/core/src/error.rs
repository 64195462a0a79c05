//! Shared error taxonomy.
//!
//! Every failure that crosses the runtime boundary is a [`DomainError`]. Each
//! variant carries an HTTP-style status so boundary layers can translate it
//! without matching on variants, but the taxonomy is meaningful on its own.
//!
//! Two variants are specialisations of broader categories:
//! - [`DomainError::DuplicateAggregate`] is a conflict raised by command logic when
//!   an aggregate id is already claimed.
//! - [`DomainError::Unaltered`] is a bad request for commands that would not change
//!   any state.

use thiserror::Error;

/// Result type used across the runtime.
pub type DomainResult<T> = Result<T, DomainError>;

/// Runtime-wide error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Unexpected failure (storage, serialization, broken invariants).
    #[error("internal error: {0}")]
    Internal(String),

    /// Aggregate type, command, projector, projection or read-model handler unresolved.
    #[error("not found: {0}")]
    NotFound(String),

    /// Optimistic concurrency failure or duplicate registration.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Domain rules declare the aggregate id as already claimed.
    #[error("aggregate already exists: {0}")]
    DuplicateAggregate(String),

    /// A payload or query failed validation.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The command would not alter any state.
    #[error("unaltered state: {0}")]
    Unaltered(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// An event could not be resolved to a version a handler understands.
    #[error("event cast failed: {0}")]
    Cast(String),
}

impl DomainError {
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn duplicate_aggregate(msg: impl Into<String>) -> Self {
        Self::DuplicateAggregate(msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn unaltered(msg: impl Into<String>) -> Self {
        Self::Unaltered(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    pub fn cast(msg: impl Into<String>) -> Self {
        Self::Cast(msg.into())
    }

    /// HTTP-style status code for boundary translation.
    pub fn status(&self) -> u16 {
        match self {
            DomainError::Internal(_) | DomainError::Cast(_) => 500,
            DomainError::NotFound(_) => 404,
            DomainError::Conflict(_) | DomainError::DuplicateAggregate(_) => 409,
            DomainError::BadRequest(_) | DomainError::Unaltered(_) => 400,
            DomainError::Forbidden(_) => 403,
            DomainError::Unauthorized(_) => 401,
        }
    }

    /// True for [`DomainError::Conflict`] and its specialisations.
    pub fn is_conflict(&self) -> bool {
        matches!(self, DomainError::Conflict(_) | DomainError::DuplicateAggregate(_))
    }

    /// True for [`DomainError::BadRequest`] and its specialisations.
    pub fn is_bad_request(&self) -> bool {
        matches!(self, DomainError::BadRequest(_) | DomainError::Unaltered(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DomainError::NotFound(_))
    }
}

impl From<serde_json::Error> for DomainError {
    fn from(value: serde_json::Error) -> Self {
        DomainError::Internal(format!("serialization failed: {value}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_follow_the_taxonomy() {
        assert_eq!(DomainError::internal("x").status(), 500);
        assert_eq!(DomainError::not_found("x").status(), 404);
        assert_eq!(DomainError::conflict("x").status(), 409);
        assert_eq!(DomainError::duplicate_aggregate("x").status(), 409);
        assert_eq!(DomainError::bad_request("x").status(), 400);
        assert_eq!(DomainError::unaltered("x").status(), 400);
        assert_eq!(DomainError::forbidden("x").status(), 403);
        assert_eq!(DomainError::unauthorized("x").status(), 401);
        assert_eq!(DomainError::cast("x").status(), 500);
    }

    #[test]
    fn specialisations_keep_their_category() {
        assert!(DomainError::duplicate_aggregate("acc-1").is_conflict());
        assert!(DomainError::unaltered("same name").is_bad_request());
        assert!(!DomainError::conflict("x").is_bad_request());
    }

    #[test]
    fn errors_are_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<DomainError>();
    }
}
