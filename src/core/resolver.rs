//! Dependency resolution
//!
//! Builds the dependency graph between package units, layers it into build
//! order levels and answers on-demand readiness checks.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;

use crate::core::requirements::RequirementParser;
use crate::core::unit::{DependencyEdge, DependencyType, PackageUnit, UnitId};
use crate::error::{ResolverError, StoreError};
use crate::infra::store::UnitStore;

/// Build order levels computed from a dependency graph
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildLevels {
    /// Level N holds units whose dependencies all sit in levels below N
    pub levels: Vec<Vec<UnitId>>,
    /// Units that could not be layered because they sit on or behind a
    /// cycle. When non-empty these are also the last entry of `levels`.
    pub cyclic: Vec<UnitId>,
}

impl BuildLevels {
    /// Level assigned to `unit`
    pub fn level_of(&self, unit: &UnitId) -> Option<u32> {
        self.levels
            .iter()
            .position(|level| level.contains(unit))
            .and_then(|i| u32::try_from(i).ok())
    }

    /// Whether the graph contained a cycle
    pub fn has_cycle(&self) -> bool {
        !self.cyclic.is_empty()
    }

    /// Total number of units placed
    pub fn unit_count(&self) -> usize {
        self.levels.iter().map(Vec::len).sum()
    }
}

/// Dependency graph for package units
#[derive(Debug, Default, Clone)]
pub struct DependencyGraph {
    /// Adjacency list: unit -> units it depends on
    deps: BTreeMap<UnitId, BTreeSet<UnitId>>,
}

impl DependencyGraph {
    /// Create a new empty dependency graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from stored units and edges
    pub fn from_parts<'a>(
        units: impl IntoIterator<Item = &'a UnitId>,
        edges: impl IntoIterator<Item = &'a DependencyEdge>,
    ) -> Self {
        let mut graph = Self::new();
        for unit in units {
            graph.add_unit(unit.clone());
        }
        for edge in edges {
            if let Err(e) = graph.add_edge(edge.unit.clone(), edge.depends_on.clone()) {
                tracing::warn!("Ignoring edge: {e}");
            }
        }
        graph
    }

    /// Add a unit with no dependencies (no-op if already present)
    pub fn add_unit(&mut self, unit: UnitId) {
        self.deps.entry(unit).or_default();
    }

    /// Record that `unit` depends on `depends_on`
    pub fn add_edge(&mut self, unit: UnitId, depends_on: UnitId) -> Result<(), ResolverError> {
        if unit == depends_on {
            return Err(ResolverError::SelfDependency(unit));
        }
        self.deps.entry(depends_on.clone()).or_default();
        self.deps.entry(unit).or_default().insert(depends_on);
        Ok(())
    }

    /// Direct dependencies of `unit`
    pub fn dependencies(&self, unit: &UnitId) -> impl Iterator<Item = &UnitId> {
        self.deps.get(unit).into_iter().flatten()
    }

    /// Number of units in the graph
    pub fn len(&self) -> usize {
        self.deps.len()
    }

    /// Whether the graph is empty
    pub fn is_empty(&self) -> bool {
        self.deps.is_empty()
    }

    /// Kahn-style layering into build order levels.
    ///
    /// Each pass takes every unit whose dependencies are all placed. When a
    /// pass finds none but units remain, the remainder is emitted as one
    /// final level and reported in [`BuildLevels::cyclic`]. Units within a
    /// level are sorted, so the result is deterministic.
    pub fn compute_levels(&self) -> BuildLevels {
        let mut in_degree: BTreeMap<&UnitId, usize> =
            self.deps.iter().map(|(unit, deps)| (unit, deps.len())).collect();

        let mut dependents: BTreeMap<&UnitId, Vec<&UnitId>> = BTreeMap::new();
        for (unit, deps) in &self.deps {
            for dep in deps {
                dependents.entry(dep).or_default().push(unit);
            }
        }

        let mut result = BuildLevels::default();

        while !in_degree.is_empty() {
            let ready: Vec<&UnitId> = in_degree
                .iter()
                .filter(|(_, degree)| **degree == 0)
                .map(|(unit, _)| *unit)
                .collect();

            if ready.is_empty() {
                let remainder: Vec<UnitId> = in_degree.keys().map(|u| (*u).clone()).collect();
                result.cyclic.clone_from(&remainder);
                result.levels.push(remainder);
                break;
            }

            for unit in &ready {
                in_degree.remove(unit);
                for dependent in dependents.get(unit).into_iter().flatten() {
                    if let Some(degree) = in_degree.get_mut(dependent) {
                        *degree = degree.saturating_sub(1);
                    }
                }
            }

            result
                .levels
                .push(ready.into_iter().cloned().collect());
        }

        result
    }
}

/// Dependencies of `unit` that do not yet let it build.
///
/// A dependency is satisfied when its status is `Completed` or
/// `NotRequired`. An edge pointing at a unit missing from the store counts
/// as unsatisfied.
pub async fn unbuilt_dependencies(
    store: &dyn UnitStore,
    unit: &UnitId,
) -> Result<Vec<UnitId>, StoreError> {
    let mut unbuilt = Vec::new();
    for edge in store.dependencies_of(unit).await? {
        let satisfied = store
            .get_unit(&edge.depends_on)
            .await?
            .is_some_and(|dep| dep.status.satisfies_dependents());
        if !satisfied {
            unbuilt.push(edge.depends_on);
        }
    }
    unbuilt.sort();
    unbuilt.dedup();
    Ok(unbuilt)
}

/// Whether every direct dependency of `unit` is satisfied
pub async fn is_ready(store: &dyn UnitStore, unit: &UnitId) -> Result<bool, StoreError> {
    Ok(unbuilt_dependencies(store, unit).await?.is_empty())
}

/// Metadata returned by a [`MetadataProvider`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageMetadata {
    /// Resolved version
    pub version: Option<String>,
    /// Build descriptor text
    pub descriptor: Option<String>,
    /// Direct runtime dependencies, as requirement strings (`idna>=3.4`)
    pub dependencies: Vec<String>,
}

/// Source of package metadata (version, descriptor, direct dependencies)
#[async_trait]
pub trait MetadataProvider: Send + Sync {
    /// Look up `name`, optionally pinned to `version`
    async fn lookup(&self, name: &str, version: Option<&str>)
        -> Result<PackageMetadata, ResolverError>;
}

/// Summary of a resolution run
#[derive(Debug, Clone, Default)]
pub struct ResolutionReport {
    /// Units created because a resolved unit depends on them
    pub new_units: Vec<UnitId>,
    /// Units whose metadata lookup failed
    pub failures: Vec<(UnitId, String)>,
    /// Levels computed after the run
    pub levels: BuildLevels,
}

/// Walks units through a [`MetadataProvider`] and keeps edges and levels current
pub struct DependencyResolver {
    store: Arc<dyn UnitStore>,
    provider: Arc<dyn MetadataProvider>,
    parser: RequirementParser,
}

impl DependencyResolver {
    pub fn new(store: Arc<dyn UnitStore>, provider: Arc<dyn MetadataProvider>) -> Self {
        Self {
            store,
            provider,
            parser: RequirementParser::new(),
        }
    }

    /// Resolve `roots` and everything they transitively depend on.
    ///
    /// Each visited unit gets its version and descriptor filled in and its
    /// outgoing edges replaced. Dependencies that do not exist yet are
    /// created on the root's target and visited in turn. Levels are
    /// recomputed once at the end.
    pub async fn resolve(&self, roots: &[UnitId]) -> Result<ResolutionReport, ResolverError> {
        let mut report = ResolutionReport::default();
        let mut queue: VecDeque<UnitId> = roots.iter().cloned().collect();
        let mut visited = HashSet::new();

        while let Some(id) = queue.pop_front() {
            if !visited.insert(id.clone()) {
                continue;
            }

            let mut unit = self.store.require_unit(&id).await?;
            let metadata = match self
                .provider
                .lookup(&unit.name, unit.version.as_deref())
                .await
            {
                Ok(metadata) => metadata,
                Err(e) => {
                    tracing::warn!("Failed to resolve {id}: {e}");
                    report.failures.push((id, e.to_string()));
                    continue;
                }
            };

            apply_metadata(&mut unit, &metadata);
            self.store.put_unit(&unit).await?;

            let mut edges = Vec::new();
            for raw in &metadata.dependencies {
                let Some(requirement) = self.parser.parse_line(raw) else {
                    tracing::warn!("Skipping unparseable dependency '{raw}' of {id}");
                    continue;
                };
                let dep_id = UnitId::new(&requirement.name, &unit.target);
                if dep_id == id {
                    tracing::warn!("Skipping self-dependency of {id}");
                    continue;
                }

                if self.store.get_unit(&dep_id).await?.is_none() {
                    let mut dep = PackageUnit::new(&requirement.name, &unit.target)
                        .with_architecture(unit.architecture.clone());
                    dep.version = requirement.pinned_version().map(str::to_string);
                    self.store.put_unit(&dep).await?;
                    tracing::info!("Discovered dependency {dep_id} of {id}");
                    report.new_units.push(dep_id.clone());
                }

                let mut edge = DependencyEdge::new(id.clone(), dep_id.clone(), DependencyType::Runtime);
                if !requirement.specs.is_empty() {
                    edge = edge.with_constraint(requirement.version_spec());
                }
                edges.push(edge);
                queue.push_back(dep_id);
            }

            tracing::debug!("{id} has {} direct dependencies", edges.len());
            self.store.replace_dependencies(&id, edges).await?;
        }

        report.levels = self.recompute_levels().await?;
        Ok(report)
    }

    /// Fetch and store the descriptor of a unit that has none.
    ///
    /// Returns `false` when the provider has no descriptor for it either.
    pub async fn prepare_descriptor(&self, id: &UnitId) -> Result<bool, ResolverError> {
        let mut unit = self.store.require_unit(id).await?;
        if unit.descriptor.is_some() {
            return Ok(true);
        }

        let metadata = self
            .provider
            .lookup(&unit.name, unit.version.as_deref())
            .await?;
        apply_metadata(&mut unit, &metadata);
        self.store.put_unit(&unit).await?;
        Ok(unit.descriptor.is_some())
    }

    /// Recompute levels over every stored unit and persist `build_order`
    pub async fn recompute_levels(&self) -> Result<BuildLevels, StoreError> {
        recompute_levels(self.store.as_ref()).await
    }
}

fn apply_metadata(unit: &mut PackageUnit, metadata: &PackageMetadata) {
    if unit.version.is_none() {
        unit.version.clone_from(&metadata.version);
    }
    if metadata.descriptor.is_some() {
        unit.descriptor.clone_from(&metadata.descriptor);
    }
    unit.updated_at = chrono::Utc::now();
}

/// Recompute levels over every stored unit and persist changed `build_order` values
pub async fn recompute_levels(store: &dyn UnitStore) -> Result<BuildLevels, StoreError> {
    let units = store.list_units().await?;
    let edges = store.all_edges().await?;
    let graph = DependencyGraph::from_parts(units.iter().map(|u| &u.id), &edges);
    let levels = graph.compute_levels();

    if levels.has_cycle() {
        let names: Vec<&str> = levels.cyclic.iter().map(UnitId::as_str).collect();
        tracing::warn!(
            "Dependency cycle: {} unit(s) placed in final level {}: {}",
            levels.cyclic.len(),
            levels.levels.len().saturating_sub(1),
            names.join(", ")
        );
    }

    for mut unit in units {
        let level = levels.level_of(&unit.id);
        if unit.build_order != level {
            unit.build_order = level;
            store.put_unit(&unit).await?;
        }
    }

    Ok(levels)
}
