use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::{info, warn};

use chronicle_core::{DomainError, DomainResult};

use super::projection::{Projection, ProjectionDeps};

/// All projections of a runtime, by id, plus the active version of each name.
#[derive(Debug, Default)]
pub struct ProjectionMap {
    projections: BTreeMap<String, Arc<Projection>>,
    active: HashMap<String, String>,
}

impl ProjectionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, projection: Arc<Projection>) -> DomainResult<()> {
        if self.projections.contains_key(projection.id()) {
            return Err(DomainError::conflict(format!(
                "projection '{}' already exists",
                projection.id()
            )));
        }
        self.projections.insert(projection.id().to_string(), projection);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Arc<Projection>> {
        self.projections.get(id)
    }

    pub fn get_by_name(&self, name: &str, version: u32) -> Option<&Arc<Projection>> {
        self.get(&Projection::id_of(name, version))
    }

    /// Make `name@version` the one projection serving reads for `name`.
    ///
    /// A projection that is not live yet can only be activated with `force`.
    pub fn set_active(&mut self, name: &str, version: u32, force: bool) -> DomainResult<()> {
        let id = Projection::id_of(name, version);
        let Some(projection) = self.projections.get(&id) else {
            return Err(DomainError::not_found(format!("projection '{id}' not found")));
        };
        if !projection.is_live_tracking() && !force {
            return Err(DomainError::conflict(format!(
                "projection '{id}' is not live yet"
            )));
        }

        if let Some(previous) = self.active.get(name).and_then(|p| self.projections.get(p)) {
            previous.set_active(false);
        }
        projection.set_active(true);
        self.active.insert(name.to_string(), id);
        info!(projection = %name, version, force, "projection activated");
        Ok(())
    }

    pub fn get_active(&self, name: &str) -> Option<&Arc<Projection>> {
        self.active.get(name).and_then(|id| self.projections.get(id))
    }

    /// Point-in-time copy of the active projections, by name.
    pub fn active_snapshot(&self) -> HashMap<String, Arc<Projection>> {
        self.active
            .iter()
            .filter_map(|(name, id)| {
                self.projections
                    .get(id)
                    .map(|projection| (name.clone(), Arc::clone(projection)))
            })
            .collect()
    }

    /// Active version per name.
    pub fn active_versions(&self) -> HashMap<String, u32> {
        self.active_snapshot()
            .into_iter()
            .map(|(name, projection)| (name, projection.version()))
            .collect()
    }

    /// Stop and forget a projection. Its materialized data stays in its store.
    pub async fn remove(&mut self, name: &str, version: u32, force: bool) -> DomainResult<()> {
        let id = Projection::id_of(name, version);
        let Some(projection) = self.projections.get(&id) else {
            return Ok(());
        };
        if projection.is_active() && !force {
            return Err(DomainError::conflict(format!(
                "projection '{id}' is active"
            )));
        }

        projection.stop().await?;
        projection.set_active(false);
        if self.active.get(name) == Some(&id) {
            self.active.remove(name);
        }
        self.projections.remove(&id);
        info!(projection = %id, "projection removed");
        Ok(())
    }

    pub async fn init(&self, deps: &ProjectionDeps) -> DomainResult<()> {
        for projection in self.projections.values() {
            projection.init(deps.clone()).await?;
        }
        Ok(())
    }

    /// Stop every projection; failures are logged and do not stop the others.
    pub async fn stop(&self) {
        for projection in self.projections.values() {
            if let Err(e) = projection.stop().await {
                warn!(projection = %projection.id(), error = %e, "failed to stop projection");
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Projection>> {
        self.projections.values()
    }

    pub fn is_empty(&self) -> bool {
        self.projections.is_empty()
    }
}
