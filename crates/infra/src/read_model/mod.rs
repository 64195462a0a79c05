//! Named query façades over projections.
//!
//! A [`ReadModel`] is bound to a projection *name*, not a version: every call reads
//! from whichever version is active in the calling [`ExecutionContext`], so switching
//! the active version never requires touching query code.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value as JsonValue;

use chronicle_core::{DomainError, DomainResult};

use crate::aggregate::{Payload, decode_payload};
use crate::context::ExecutionContext;
use crate::projections::Projection;
use crate::store::{Store, Table};

/// A query whose input has already been decoded.
type PreparedQuery = Box<dyn FnOnce(QueryContext) -> BoxFuture<'static, DomainResult<JsonValue>> + Send>;

type QueryFn = Arc<dyn Fn(JsonValue) -> DomainResult<PreparedQuery> + Send + Sync>;

/// What a query handler gets to work with.
#[derive(Clone)]
pub struct QueryContext {
    projection: Arc<Projection>,
    caller: JsonValue,
}

impl QueryContext {
    /// Store of the active projection.
    pub fn store(&self) -> &Arc<dyn Store> {
        self.projection.store()
    }

    pub fn table(&self, name: &str) -> DomainResult<Arc<dyn Table>> {
        Ok(self.projection.store().table(name)?)
    }

    pub fn projection(&self) -> &Arc<Projection> {
        &self.projection
    }

    pub fn caller(&self) -> &JsonValue {
        &self.caller
    }
}

pub struct ReadModel {
    name: String,
    projection_name: String,
    handlers: BTreeMap<String, QueryFn>,
}

impl std::fmt::Debug for ReadModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadModel")
            .field("name", &self.name)
            .field("projection_name", &self.projection_name)
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ReadModel {
    /// Read model names are case-insensitive and stored lower-cased.
    pub fn new(name: impl Into<String>, projection_name: impl Into<String>) -> Self {
        Self {
            name: name.into().to_lowercase(),
            projection_name: projection_name.into(),
            handlers: BTreeMap::new(),
        }
    }

    pub fn handle<Q, R, F, Fut>(mut self, name: impl Into<String>, f: F) -> DomainResult<Self>
    where
        Q: Payload,
        R: Serialize + Send + 'static,
        F: Fn(QueryContext, Q) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DomainResult<R>> + Send + 'static,
    {
        let name = name.into();
        if self.handlers.contains_key(&name) {
            return Err(DomainError::conflict(format!(
                "query '{name}' is already registered on read model '{}'",
                self.name
            )));
        }

        let f = Arc::new(f);
        let query: QueryFn = Arc::new(move |raw: JsonValue| -> DomainResult<PreparedQuery> {
            let input: Q = decode_payload(raw)?;
            let f = Arc::clone(&f);
            Ok(Box::new(move |ctx: QueryContext| {
                let pending = f(ctx, input);
                async move {
                    let result = pending.await?;
                    Ok::<JsonValue, DomainError>(serde_json::to_value(result)?)
                }
                .boxed()
            }))
        });
        self.handlers.insert(name, query);
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn projection_name(&self) -> &str {
        &self.projection_name
    }

    pub fn handlers(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }

    pub async fn call(&self, ctx: &ExecutionContext, handler: &str, query: JsonValue) -> DomainResult<JsonValue> {
        let Some(entry) = self.handlers.get(handler) else {
            return Err(DomainError::not_found(format!(
                "query '{handler}' not found on read model '{}'",
                self.name
            )));
        };
        let prepared = entry(query)?;

        let Some(projection) = ctx.active_projection(&self.projection_name) else {
            return Err(DomainError::not_found(format!(
                "no active projection '{}' for read model '{}'",
                self.projection_name, self.name
            )));
        };

        prepared(QueryContext {
            projection: Arc::clone(projection),
            caller: ctx.caller().clone(),
        })
        .await
    }
}
