//! Delayed command execution.
//!
//! A [`Scheduler`] adapter stores `(execute_at, data)` invocations and delivers them
//! to every subscribed callback once due. The runtime subscribes one callback through
//! a [`CommandScheduler`] and encodes commands as [`ScheduledCommand`] data.
//!
//! [`LocalScheduler`] is the in-process adapter; durable adapters implement the same
//! trait on top of their own storage.

pub mod command;
pub mod local;
pub mod storage;

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value as JsonValue;
use thiserror::Error;

use chronicle_core::{DomainError, InvocationId};

pub use command::{CommandScheduler, ScheduledCommand};
pub use local::{LocalScheduler, LocalSchedulerConfig, MAX_TIMEOUT, RetryPolicy};
pub use storage::{InMemoryInvocationStorage, Invocation, InvocationStorage};

/// Receives due invocations. Identity (for unsubscribing) is the `Arc` pointer.
pub type SchedulerCallback =
    Arc<dyn Fn(DateTime<Utc>, JsonValue) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Wrap an async fn as a [`SchedulerCallback`].
pub fn callback<F, Fut>(f: F) -> SchedulerCallback
where
    F: Fn(DateTime<Utc>, JsonValue) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |execute_at: DateTime<Utc>, data: JsonValue| f(execute_at, data).boxed())
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invocation storage failure: {0}")]
    Storage(String),

    #[error("invalid invocation: {0}")]
    Invalid(String),
}

impl From<SchedulerError> for DomainError {
    fn from(value: SchedulerError) -> Self {
        match value {
            SchedulerError::Invalid(msg) => DomainError::bad_request(msg),
            other => DomainError::internal(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(value: serde_json::Error) -> Self {
        SchedulerError::Invalid(value.to_string())
    }
}

#[async_trait]
pub trait Scheduler: Send + Sync {
    async fn subscribe(&self, callback: SchedulerCallback) -> Result<(), SchedulerError>;

    async fn unsubscribe(&self, callback: &SchedulerCallback) -> Result<(), SchedulerError>;

    async fn schedule(&self, execute_at: DateTime<Utc>, data: JsonValue) -> Result<InvocationId, SchedulerError>;
}

#[async_trait]
impl<S> Scheduler for Arc<S>
where
    S: Scheduler + ?Sized,
{
    async fn subscribe(&self, callback: SchedulerCallback) -> Result<(), SchedulerError> {
        (**self).subscribe(callback).await
    }

    async fn unsubscribe(&self, callback: &SchedulerCallback) -> Result<(), SchedulerError> {
        (**self).unsubscribe(callback).await
    }

    async fn schedule(&self, execute_at: DateTime<Utc>, data: JsonValue) -> Result<InvocationId, SchedulerError> {
        (**self).schedule(execute_at, data).await
    }
}
