//! Persistence for package units and dependency edges
//!
//! The store is the single source of truth for unit state. Workers never
//! cache units between steps; every decision re-reads the unit first.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::core::unit::{BuildStatus, DependencyEdge, PackageUnit, UnitId};
use crate::error::StoreError;
use crate::infra::filesystem;

/// Snapshot of everything the store holds
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreState {
    #[serde(default)]
    pub units: BTreeMap<UnitId, PackageUnit>,
    #[serde(default)]
    pub edges: Vec<DependencyEdge>,
}

impl StoreState {
    fn dependencies_of(&self, unit: &UnitId) -> Vec<DependencyEdge> {
        self.edges.iter().filter(|e| &e.unit == unit).cloned().collect()
    }

    fn dependents_of(&self, unit: &UnitId) -> Vec<DependencyEdge> {
        self.edges
            .iter()
            .filter(|e| &e.depends_on == unit)
            .cloned()
            .collect()
    }

    fn replace_dependencies(&mut self, unit: &UnitId, edges: Vec<DependencyEdge>) {
        self.edges.retain(|e| &e.unit != unit);
        self.edges.extend(edges);
    }
}

/// Unit and edge persistence
#[async_trait]
pub trait UnitStore: Send + Sync {
    /// Load a unit
    async fn get_unit(&self, id: &UnitId) -> Result<Option<PackageUnit>, StoreError>;

    /// Insert or overwrite a unit
    async fn put_unit(&self, unit: &PackageUnit) -> Result<(), StoreError>;

    /// All units, ordered by id
    async fn list_units(&self) -> Result<Vec<PackageUnit>, StoreError>;

    /// Edges leaving `unit` (what it depends on)
    async fn dependencies_of(&self, unit: &UnitId) -> Result<Vec<DependencyEdge>, StoreError>;

    /// Edges entering `unit` (what depends on it)
    async fn dependents_of(&self, unit: &UnitId) -> Result<Vec<DependencyEdge>, StoreError>;

    /// Delete every edge leaving `unit` and insert `edges`
    async fn replace_dependencies(
        &self,
        unit: &UnitId,
        edges: Vec<DependencyEdge>,
    ) -> Result<(), StoreError>;

    /// Every edge
    async fn all_edges(&self) -> Result<Vec<DependencyEdge>, StoreError>;

    /// Load a unit that must exist
    async fn require_unit(&self, id: &UnitId) -> Result<PackageUnit, StoreError> {
        self.get_unit(id)
            .await?
            .ok_or_else(|| StoreError::UnitNotFound(id.clone()))
    }

    /// Units currently in `status`
    async fn units_with_status(&self, status: BuildStatus) -> Result<Vec<PackageUnit>, StoreError> {
        Ok(self
            .list_units()
            .await?
            .into_iter()
            .filter(|u| u.status == status)
            .collect())
    }
}

/// In-process store
#[derive(Debug, Default)]
pub struct MemoryUnitStore {
    state: RwLock<StoreState>,
}

impl MemoryUnitStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UnitStore for MemoryUnitStore {
    async fn get_unit(&self, id: &UnitId) -> Result<Option<PackageUnit>, StoreError> {
        Ok(self.state.read().await.units.get(id).cloned())
    }

    async fn put_unit(&self, unit: &PackageUnit) -> Result<(), StoreError> {
        self.state
            .write()
            .await
            .units
            .insert(unit.id.clone(), unit.clone());
        Ok(())
    }

    async fn list_units(&self) -> Result<Vec<PackageUnit>, StoreError> {
        Ok(self.state.read().await.units.values().cloned().collect())
    }

    async fn dependencies_of(&self, unit: &UnitId) -> Result<Vec<DependencyEdge>, StoreError> {
        Ok(self.state.read().await.dependencies_of(unit))
    }

    async fn dependents_of(&self, unit: &UnitId) -> Result<Vec<DependencyEdge>, StoreError> {
        Ok(self.state.read().await.dependents_of(unit))
    }

    async fn replace_dependencies(
        &self,
        unit: &UnitId,
        edges: Vec<DependencyEdge>,
    ) -> Result<(), StoreError> {
        self.state.write().await.replace_dependencies(unit, edges);
        Ok(())
    }

    async fn all_edges(&self) -> Result<Vec<DependencyEdge>, StoreError> {
        Ok(self.state.read().await.edges.clone())
    }
}

/// Store shared between processes through a locked JSON snapshot
#[derive(Debug, Clone)]
pub struct FileUnitStore {
    path: PathBuf,
}

impl FileUnitStore {
    /// Use the snapshot at `path`; the file is created on first write
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the snapshot
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read<R, F>(&self, f: F) -> Result<R, StoreError>
    where
        R: Send + 'static,
        F: FnOnce(StoreState) -> R + Send + 'static,
    {
        let path = self.path.clone();
        let state: StoreState =
            filesystem::blocking(move || filesystem::read_json_locked(&path)).await?;
        Ok(f(state))
    }

    async fn update<F>(&self, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut StoreState) + Send + 'static,
    {
        let path = self.path.clone();
        filesystem::blocking(move || filesystem::update_json_locked(&path, f)).await?;
        Ok(())
    }
}

#[async_trait]
impl UnitStore for FileUnitStore {
    async fn get_unit(&self, id: &UnitId) -> Result<Option<PackageUnit>, StoreError> {
        let id = id.clone();
        self.read(move |mut s| s.units.remove(&id)).await
    }

    async fn put_unit(&self, unit: &PackageUnit) -> Result<(), StoreError> {
        let unit = unit.clone();
        self.update(move |s| {
            s.units.insert(unit.id.clone(), unit);
        })
        .await
    }

    async fn list_units(&self) -> Result<Vec<PackageUnit>, StoreError> {
        self.read(|s| s.units.into_values().collect()).await
    }

    async fn dependencies_of(&self, unit: &UnitId) -> Result<Vec<DependencyEdge>, StoreError> {
        let unit = unit.clone();
        self.read(move |s| s.dependencies_of(&unit)).await
    }

    async fn dependents_of(&self, unit: &UnitId) -> Result<Vec<DependencyEdge>, StoreError> {
        let unit = unit.clone();
        self.read(move |s| s.dependents_of(&unit)).await
    }

    async fn replace_dependencies(
        &self,
        unit: &UnitId,
        edges: Vec<DependencyEdge>,
    ) -> Result<(), StoreError> {
        let unit = unit.clone();
        self.update(move |s| s.replace_dependencies(&unit, edges))
            .await
    }

    async fn all_edges(&self) -> Result<Vec<DependencyEdge>, StoreError> {
        self.read(|s| s.edges).await
    }
}
