use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use super::r#trait::{Record, Store, StoreError, StoreProvider, Table, TableDefinition};

/// Table name → canonical key → entry.
type Backend = RwLock<HashMap<String, HashMap<String, Record>>>;

fn poisoned() -> StoreError {
    StoreError::Internal("lock poisoned".to_string())
}

/// In-memory store for tests/dev.
///
/// Tables are namespaced as `<prefix>_<name>` inside a backend that may be shared
/// with other stores (see [`InMemoryStoreProvider`]), so data outlives a single
/// store handle the way it outlives a database connection.
#[derive(Debug)]
pub struct InMemoryStore {
    prefix: String,
    backend: Arc<Backend>,
    tables: RwLock<HashMap<String, TableDefinition>>,
    connected: Arc<AtomicBool>,
}

impl InMemoryStore {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self::with_backend(prefix, Arc::default())
    }

    fn with_backend(prefix: impl Into<String>, backend: Arc<Backend>) -> Self {
        Self {
            prefix: prefix.into(),
            backend,
            tables: RwLock::new(HashMap::new()),
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Store for InMemoryStore {
    fn prefix(&self) -> &str {
        &self.prefix
    }

    async fn connect(&self) -> Result<(), StoreError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self, _force: bool) -> Result<(), StoreError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn define_tables(&self, tables: &[TableDefinition]) -> Result<(), StoreError> {
        let mut defined = self.tables.write().map_err(|_| poisoned())?;
        for def in tables {
            defined.insert(def.name().to_string(), def.clone());
        }
        Ok(())
    }

    fn table(&self, name: &str) -> Result<Arc<dyn Table>, StoreError> {
        let defined = self.tables.read().map_err(|_| poisoned())?;
        let definition = defined
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::UnknownTable(format!("{}_{name}", self.prefix)))?;
        Ok(Arc::new(InMemoryTable {
            full_name: format!("{}_{name}", self.prefix),
            definition,
            backend: Arc::clone(&self.backend),
            connected: Arc::clone(&self.connected),
        }))
    }
}

struct InMemoryTable {
    full_name: String,
    definition: TableDefinition,
    backend: Arc<Backend>,
    connected: Arc<AtomicBool>,
}

impl InMemoryTable {
    fn ensure_connected(&self) -> Result<(), StoreError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::NotConnected(self.full_name.clone()))
        }
    }
}

#[async_trait]
impl Table for InMemoryTable {
    fn definition(&self) -> &TableDefinition {
        &self.definition
    }

    async fn set(&self, entry: Record) -> Result<(), StoreError> {
        self.ensure_connected()?;
        let key = self.definition.key_of(&entry)?;
        let mut backend = self.backend.write().map_err(|_| poisoned())?;
        backend.entry(self.full_name.clone()).or_default().insert(key, entry);
        Ok(())
    }

    async fn get(&self, key: &Record) -> Result<Option<Record>, StoreError> {
        self.ensure_connected()?;
        let key = self.definition.key_of(key)?;
        let backend = self.backend.read().map_err(|_| poisoned())?;
        Ok(backend.get(&self.full_name).and_then(|t| t.get(&key)).cloned())
    }

    async fn update(&self, key: &Record, values: Record) -> Result<(), StoreError> {
        self.ensure_connected()?;
        let key = self.definition.key_of(key)?;
        let mut backend = self.backend.write().map_err(|_| poisoned())?;
        let Some(entry) = backend.get_mut(&self.full_name).and_then(|t| t.get_mut(&key)) else {
            return Ok(());
        };
        for (field, value) in values {
            if !self.definition.is_key_field(&field) {
                entry.insert(field, value);
            }
        }
        Ok(())
    }

    async fn remove(&self, key: &Record) -> Result<(), StoreError> {
        self.ensure_connected()?;
        let key = self.definition.key_of(key)?;
        let mut backend = self.backend.write().map_err(|_| poisoned())?;
        if let Some(table) = backend.get_mut(&self.full_name) {
            table.remove(&key);
        }
        Ok(())
    }
}

/// Hands out [`InMemoryStore`]s that share one backend.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStoreProvider {
    backend: Arc<Backend>,
}

impl InMemoryStoreProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StoreProvider for InMemoryStoreProvider {
    fn create(&self, prefix: &str) -> Arc<dyn Store> {
        Arc::new(InMemoryStore::with_backend(prefix, Arc::clone(&self.backend)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value as JsonValue, json};

    fn record(value: JsonValue) -> Record {
        value.as_object().cloned().unwrap()
    }

    async fn connected_store(provider: &InMemoryStoreProvider, prefix: &str) -> Arc<dyn Store> {
        let store = provider.create(prefix);
        store
            .define_tables(&[TableDefinition::new("pets", ["id"])])
            .unwrap();
        store.connect().await.unwrap();
        store
    }

    #[tokio::test]
    async fn crud_round() {
        let provider = InMemoryStoreProvider::new();
        let table = connected_store(&provider, "p").await.table("pets").unwrap();

        table.set(record(json!({"id": "1", "name": "Lucky", "age": 3}))).await.unwrap();
        table
            .update(&record(json!({"id": "1"})), record(json!({"name": "Slevin", "id": "2"})))
            .await
            .unwrap();
        let pet = table.get(&record(json!({"id": "1"}))).await.unwrap().unwrap();
        assert_eq!(JsonValue::Object(pet), json!({"id": "1", "name": "Slevin", "age": 3}));

        table.remove(&record(json!({"id": "1"}))).await.unwrap();
        assert!(table.get(&record(json!({"id": "1"}))).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_of_missing_entry_is_a_noop() {
        let provider = InMemoryStoreProvider::new();
        let table = connected_store(&provider, "p").await.table("pets").unwrap();
        table
            .update(&record(json!({"id": "404"})), record(json!({"name": "x"})))
            .await
            .unwrap();
        assert!(table.get(&record(json!({"id": "404"}))).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn prefixes_isolate_and_data_survives_reconnect() {
        let provider = InMemoryStoreProvider::new();
        let a = connected_store(&provider, "a").await;
        let b = connected_store(&provider, "b").await;

        a.table("pets")
            .unwrap()
            .set(record(json!({"id": "1"})))
            .await
            .unwrap();
        assert!(b.table("pets").unwrap().get(&record(json!({"id": "1"}))).await.unwrap().is_none());

        a.close(false).await.unwrap();
        let again = connected_store(&provider, "a").await;
        assert!(again.table("pets").unwrap().get(&record(json!({"id": "1"}))).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn closed_or_undefined_tables_fail() {
        let store = InMemoryStore::new("p");
        assert!(matches!(store.table("pets"), Err(StoreError::UnknownTable(_))));

        store.define_tables(&[TableDefinition::new("pets", ["id"])]).unwrap();
        let table = store.table("pets").unwrap();
        let err = table.get(&record(json!({"id": "1"}))).await.unwrap_err();
        assert!(matches!(err, StoreError::NotConnected(_)));
    }
}
