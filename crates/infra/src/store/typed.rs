use std::marker::PhantomData;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::r#trait::{StoreError, Table, to_record};

/// Serde-typed view over a [`Table`].
///
/// `K` serializes to the key fields, `V` to the remaining fields of an entry. On
/// `set` both are merged into one record; `get` decodes the whole record into `V`,
/// so `V` may either repeat or ignore the key fields.
pub struct TypedTable<K, V> {
    table: Arc<dyn Table>,
    _marker: PhantomData<fn(K) -> V>,
}

impl<K, V> Clone for TypedTable<K, V> {
    fn clone(&self) -> Self {
        Self {
            table: Arc::clone(&self.table),
            _marker: PhantomData,
        }
    }
}

impl<K, V> TypedTable<K, V>
where
    K: Serialize,
    V: Serialize + DeserializeOwned,
{
    pub fn new(table: Arc<dyn Table>) -> Self {
        Self {
            table,
            _marker: PhantomData,
        }
    }

    pub fn raw(&self) -> &Arc<dyn Table> {
        &self.table
    }

    pub async fn set(&self, key: &K, value: &V) -> Result<(), StoreError> {
        let mut entry = to_record(value)?;
        entry.extend(to_record(key)?);
        self.table.set(entry).await
    }

    pub async fn get(&self, key: &K) -> Result<Option<V>, StoreError> {
        let Some(entry) = self.table.get(&to_record(key)?).await? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_value(serde_json::Value::Object(entry))?))
    }

    /// Shallow-merge `values` (any serializable object) into an existing entry.
    pub async fn update<U: Serialize + ?Sized>(&self, key: &K, values: &U) -> Result<(), StoreError> {
        self.table.update(&to_record(key)?, to_record(values)?).await
    }

    pub async fn remove(&self, key: &K) -> Result<(), StoreError> {
        self.table.remove(&to_record(key)?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryStore, Store, TableDefinition};
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Serialize)]
    struct PetKey<'a> {
        id: &'a str,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Pet {
        name: String,
        visits: u32,
    }

    #[tokio::test]
    async fn typed_access_merges_key_and_value() {
        let store = InMemoryStore::new("vet");
        store.define_tables(&[TableDefinition::new("pets", ["id"])]).unwrap();
        store.connect().await.unwrap();

        let pets: TypedTable<PetKey<'_>, Pet> = TypedTable::new(store.table("pets").unwrap());
        let key = PetKey { id: "p1" };
        pets.set(&key, &Pet { name: "Lucky".into(), visits: 0 }).await.unwrap();
        pets.update(&key, &json!({"visits": 2})).await.unwrap();

        assert_eq!(
            pets.get(&key).await.unwrap(),
            Some(Pet { name: "Lucky".into(), visits: 2 })
        );

        let raw = pets.raw().get(&to_record(&key).unwrap()).await.unwrap().unwrap();
        assert_eq!(raw.get("id"), Some(&json!("p1")));
    }
}
