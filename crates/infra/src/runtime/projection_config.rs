use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use chronicle_core::DomainResult;

use crate::store::{StoreProvider, TableDefinition, TypedTable};

/// Prefix of the runtime's own store.
pub const CONFIG_STORE_PREFIX: &str = "_chronicle_config";
pub const CONFIG_TABLE: &str = "projections";
const STATUS_ID: &str = "status";

/// One configured projection version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectionVersionConfig {
    pub projection_id: String,
    pub name: String,
    pub version: u32,
    pub projector_name: String,
    pub projector_version: u32,
    pub store_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectionNameConfig {
    pub active_version: Option<u32>,
    pub versions: BTreeMap<u32, ProjectionVersionConfig>,
}

/// Every configured projection, by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectionConfig {
    pub map: BTreeMap<String, ProjectionNameConfig>,
}

impl ProjectionConfig {
    pub fn add(&mut self, entry: ProjectionVersionConfig) {
        self.map
            .entry(entry.name.clone())
            .or_default()
            .versions
            .insert(entry.version, entry);
    }

    pub fn set_active(&mut self, name: &str, version: u32) {
        self.map.entry(name.to_string()).or_default().active_version = Some(version);
    }

    pub fn remove(&mut self, name: &str, version: u32) {
        let Some(config) = self.map.get_mut(name) else {
            return;
        };
        config.versions.remove(&version);
        if config.active_version == Some(version) {
            config.active_version = None;
        }
        if config.versions.is_empty() {
            self.map.remove(name);
        }
    }
}

#[derive(Debug, Serialize)]
struct StatusKey {
    id: &'static str,
}

/// Persists [`ProjectionConfig`] as a single entry of the internal store.
pub(crate) struct ProjectionConfigStore {
    table: TypedTable<StatusKey, ProjectionConfig>,
}

impl ProjectionConfigStore {
    pub(crate) async fn open(provider: &Arc<dyn StoreProvider>) -> DomainResult<Self> {
        let store = provider.create(CONFIG_STORE_PREFIX);
        store.define_tables(&[TableDefinition::new(CONFIG_TABLE, ["id"])])?;
        store.connect().await?;
        Ok(Self {
            table: TypedTable::new(store.table(CONFIG_TABLE)?),
        })
    }

    pub(crate) async fn load(&self) -> DomainResult<ProjectionConfig> {
        Ok(self.table.get(&StatusKey { id: STATUS_ID }).await?.unwrap_or_default())
    }

    pub(crate) async fn save(&self, config: &ProjectionConfig) -> DomainResult<()> {
        Ok(self.table.set(&StatusKey { id: STATUS_ID }, config).await?)
    }
}
