use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;

use chronicle_core::DomainError;

/// One stored entry: a JSON object that contains (at least) the table's key fields.
pub type Record = serde_json::Map<String, JsonValue>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("table '{0}' is not defined")]
    UnknownTable(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("store '{0}' is not connected")]
    NotConnected(String),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store failure: {0}")]
    Internal(String),
}

impl From<StoreError> for DomainError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::InvalidKey(msg) => DomainError::bad_request(msg),
            other => DomainError::internal(other.to_string()),
        }
    }
}

/// Name and key fields of a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDefinition {
    name: String,
    key: Vec<String>,
}

impl TableDefinition {
    pub fn new<I, T>(name: impl Into<String>, key: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self {
            name: name.into(),
            key: key.into_iter().map(Into::into).collect(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key(&self) -> &[String] {
        &self.key
    }

    /// Canonical key string for `record`: the key fields only, as JSON with sorted
    /// field names. Extra fields are ignored.
    pub fn key_of(&self, record: &Record) -> Result<String, StoreError> {
        let mut key = Record::new();
        for field in &self.key {
            let value = record.get(field).ok_or_else(|| {
                StoreError::InvalidKey(format!(
                    "missing key field '{field}' for table '{}'",
                    self.name
                ))
            })?;
            key.insert(field.clone(), value.clone());
        }
        let mut fields: Vec<(&String, &JsonValue)> = key.iter().collect();
        fields.sort_by(|a, b| a.0.cmp(b.0));
        let sorted: Record = fields.into_iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        Ok(serde_json::to_string(&sorted)?)
    }

    pub fn is_key_field(&self, field: &str) -> bool {
        self.key.iter().any(|k| k == field)
    }
}

/// Serialize `value` into a [`Record`]. Anything but a JSON object is rejected.
pub fn to_record<T: Serialize + ?Sized>(value: &T) -> Result<Record, StoreError> {
    match serde_json::to_value(value)? {
        JsonValue::Object(record) => Ok(record),
        other => Err(StoreError::InvalidKey(format!(
            "expected a JSON object, got {other}"
        ))),
    }
}

/// Key/value table inside a [`Store`].
///
/// - `set` writes the whole entry, replacing any previous one with the same key
/// - `update` shallow-merges `values` into an existing entry and is a no-op when
///   there is none; key fields in `values` are ignored
/// - `remove` of a missing key is a no-op
#[async_trait]
pub trait Table: Send + Sync {
    fn definition(&self) -> &TableDefinition;

    async fn set(&self, entry: Record) -> Result<(), StoreError>;

    async fn get(&self, key: &Record) -> Result<Option<Record>, StoreError>;

    async fn update(&self, key: &Record, values: Record) -> Result<(), StoreError>;

    async fn remove(&self, key: &Record) -> Result<(), StoreError>;
}

/// A prefixed collection of tables (one per projection, snapshot scope or runtime).
#[async_trait]
pub trait Store: Send + Sync {
    fn prefix(&self) -> &str;

    async fn connect(&self) -> Result<(), StoreError>;

    async fn close(&self, force: bool) -> Result<(), StoreError>;

    /// Declare tables; redefining an existing name replaces its definition.
    fn define_tables(&self, tables: &[TableDefinition]) -> Result<(), StoreError>;

    fn table(&self, name: &str) -> Result<Arc<dyn Table>, StoreError>;
}

#[async_trait]
impl<S> Store for Arc<S>
where
    S: Store + ?Sized,
{
    fn prefix(&self) -> &str {
        (**self).prefix()
    }

    async fn connect(&self) -> Result<(), StoreError> {
        (**self).connect().await
    }

    async fn close(&self, force: bool) -> Result<(), StoreError> {
        (**self).close(force).await
    }

    fn define_tables(&self, tables: &[TableDefinition]) -> Result<(), StoreError> {
        (**self).define_tables(tables)
    }

    fn table(&self, name: &str) -> Result<Arc<dyn Table>, StoreError> {
        (**self).table(name)
    }
}

/// Creates stores for a prefix. The runtime holds one provider per configured store name.
pub trait StoreProvider: Send + Sync {
    fn create(&self, prefix: &str) -> Arc<dyn Store>;
}

impl<P> StoreProvider for Arc<P>
where
    P: StoreProvider + ?Sized,
{
    fn create(&self, prefix: &str) -> Arc<dyn Store> {
        (**self).create(prefix)
    }
}
