use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use chronicle_core::InvocationId;

use super::SchedulerError;

/// A pending delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invocation {
    pub id: InvocationId,
    pub execute_at: DateTime<Utc>,
    pub data: JsonValue,
    pub retry_count: u32,
}

impl Invocation {
    pub fn new(execute_at: DateTime<Utc>, data: JsonValue) -> Self {
        Self {
            id: InvocationId::new(),
            execute_at,
            data,
            retry_count: 0,
        }
    }
}

/// Durable backing for pending invocations.
#[async_trait]
pub trait InvocationStorage: Send + Sync {
    async fn load(&self) -> Result<Vec<Invocation>, SchedulerError>;

    /// Insert or replace by id.
    async fn save(&self, invocation: &Invocation) -> Result<(), SchedulerError>;

    async fn delete(&self, id: InvocationId) -> Result<(), SchedulerError>;
}

#[derive(Debug, Default)]
pub struct InMemoryInvocationStorage {
    entries: RwLock<HashMap<InvocationId, Invocation>>,
}

impl InMemoryInvocationStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned() -> SchedulerError {
    SchedulerError::Storage("lock poisoned".to_string())
}

#[async_trait]
impl InvocationStorage for InMemoryInvocationStorage {
    async fn load(&self) -> Result<Vec<Invocation>, SchedulerError> {
        let entries = self.entries.read().map_err(|_| poisoned())?;
        let mut loaded: Vec<Invocation> = entries.values().cloned().collect();
        loaded.sort_by_key(|i| i.execute_at);
        Ok(loaded)
    }

    async fn save(&self, invocation: &Invocation) -> Result<(), SchedulerError> {
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        entries.insert(invocation.id, invocation.clone());
        Ok(())
    }

    async fn delete(&self, id: InvocationId) -> Result<(), SchedulerError> {
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        entries.remove(&id);
        Ok(())
    }
}
