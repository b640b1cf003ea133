//! Static driver registration table and the dependency graph derived from it.

mod metadata;
mod name;

pub use metadata::{DriverMetadata, LatestLeafSupport, LeafRuntime};
pub use name::DriverName;

use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::error::{CatalogScanError, Result};

/// Helper driver that records the newest leaf per package version.
pub const FIND_LATEST_LEAVES: &str = "Internal_FindLatestCatalogLeafScan";

/// Helper driver that records the newest leaf per package id.
pub const FIND_LATEST_LEAVES_PER_ID: &str =
    "Internal_FindLatestCatalogLeafScanPerId";

/// Validated, immutable view of every registered driver.
///
/// Built once at process start. Missing dependencies and cycles are rejected
/// by [`DriverRegistryBuilder::build`], so lookups on a built registry never
/// fail for registered names.
#[derive(Clone, Debug)]
pub struct DriverRegistry {
    drivers: BTreeMap<DriverName, DriverMetadata>,
    external_cursors: BTreeSet<DriverName>,
    dependents: BTreeMap<DriverName, Vec<DriverName>>,
    depth: BTreeMap<DriverName, usize>,
    topological_order: Vec<DriverName>,
    closures: BTreeMap<DriverName, Vec<DriverName>>,
}

/// Collects driver metadata before validation.
#[derive(Debug, Default)]
pub struct DriverRegistryBuilder {
    drivers: Vec<DriverMetadata>,
    external_cursors: Vec<DriverName>,
}

impl DriverRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a cursor owned outside the engine, such as the remote
    /// catalog's own position.
    pub fn external_cursor(mut self, name: impl Into<DriverName>) -> Self {
        self.external_cursors.push(name.into());
        self
    }

    pub fn driver(mut self, metadata: DriverMetadata) -> Self {
        self.drivers.push(metadata);
        self
    }

    pub fn build(self) -> Result<DriverRegistry> {
        let mut drivers = BTreeMap::new();
        let mut external_cursors = BTreeSet::new();

        for name in self.external_cursors {
            if !external_cursors.insert(name.clone()) {
                return Err(CatalogScanError::Configuration(format!(
                    "external cursor {name} is registered twice"
                )));
            }
        }

        let helpers = [FIND_LATEST_LEAVES, FIND_LATEST_LEAVES_PER_ID]
            .into_iter()
            .map(|name| DriverMetadata::new(name).internal());

        for metadata in self.drivers.into_iter().chain(helpers) {
            let name = metadata.name.clone();
            if external_cursors.contains(&name)
                || drivers.insert(name.clone(), metadata).is_some()
            {
                return Err(CatalogScanError::Configuration(format!(
                    "driver {name} is registered twice"
                )));
            }
        }

        let mut missing = Vec::new();
        for metadata in drivers.values() {
            for dependency in &metadata.dependencies {
                if !drivers.contains_key(dependency)
                    && !external_cursors.contains(dependency)
                {
                    missing.push(format!(
                        "{} depends on {}",
                        metadata.name, dependency
                    ));
                }
            }
        }
        if !missing.is_empty() {
            return Err(CatalogScanError::Configuration(format!(
                "some drivers are missing dependencies: {}",
                missing.join("; ")
            )));
        }

        let mut dependents: BTreeMap<DriverName, Vec<DriverName>> =
            BTreeMap::new();
        for metadata in drivers.values() {
            for dependency in &metadata.dependencies {
                if drivers.contains_key(dependency) {
                    dependents
                        .entry(dependency.clone())
                        .or_default()
                        .push(metadata.name.clone());
                }
            }
        }

        let (depth, topological_order) = topological_sort(&drivers)?;

        let mut registry = DriverRegistry {
            drivers,
            external_cursors,
            dependents,
            depth,
            topological_order,
            closures: BTreeMap::new(),
        };

        let closures = registry
            .topological_order
            .iter()
            .map(|name| (name.clone(), registry.compute_closure(name)))
            .collect();
        registry.closures = closures;

        Ok(registry)
    }
}

/// Kahn's algorithm in rounds. Each round takes every driver whose driver
/// dependencies are already placed; the final order sorts by
/// `(round, lowercase name)`.
fn topological_sort(
    drivers: &BTreeMap<DriverName, DriverMetadata>,
) -> Result<(BTreeMap<DriverName, usize>, Vec<DriverName>)> {
    let mut remaining: BTreeMap<&DriverName, BTreeSet<&DriverName>> = drivers
        .values()
        .filter(|metadata| !metadata.internal)
        .map(|metadata| {
            let deps = metadata
                .dependencies
                .iter()
                .filter(|dependency| drivers.contains_key(*dependency))
                .collect();
            (&metadata.name, deps)
        })
        .collect();

    let mut placed: HashSet<&DriverName> = HashSet::new();
    let mut depth = BTreeMap::new();
    let mut round = 0;

    while !remaining.is_empty() {
        let covered: Vec<&DriverName> = remaining
            .iter()
            .filter(|(_, deps)| deps.iter().all(|dep| placed.contains(dep)))
            .map(|(name, _)| *name)
            .collect();

        if covered.is_empty() {
            let stuck: Vec<String> =
                remaining.keys().map(|name| name.to_string()).collect();
            return Err(CatalogScanError::Configuration(format!(
                "unable to find a topological order, unresolved drivers: {}",
                stuck.join(", ")
            )));
        }

        for name in covered {
            remaining.remove(name);
            placed.insert(name);
            depth.insert(name.clone(), round);
        }

        round += 1;
    }

    let mut order: Vec<DriverName> = depth.keys().cloned().collect();
    order.sort_by(|a, b| {
        depth[a].cmp(&depth[b]).then_with(|| {
            a.as_str()
                .to_lowercase()
                .cmp(&b.as_str().to_lowercase())
                .then_with(|| a.cmp(b))
        })
    });

    Ok((depth, order))
}

impl DriverRegistry {
    pub fn builder() -> DriverRegistryBuilder {
        DriverRegistryBuilder::new()
    }

    pub fn get(&self, name: &str) -> Result<&DriverMetadata> {
        self.drivers.get(name).ok_or_else(|| {
            CatalogScanError::InvalidArgument(format!(
                "driver {name} is not registered"
            ))
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.drivers.contains_key(name)
    }

    pub fn is_external_cursor(&self, name: &str) -> bool {
        self.external_cursors.contains(name)
    }

    pub fn external_cursors(&self) -> impl Iterator<Item = &DriverName> {
        self.external_cursors.iter()
    }

    /// Drivers a caller may start directly, in topological order.
    pub fn startable_drivers(&self) -> &[DriverName] {
        &self.topological_order
    }

    /// Topological round of a startable driver. Drivers with only external
    /// dependencies are in round 0.
    pub fn depth(&self, name: &str) -> Option<usize> {
        self.depth.get(name).copied()
    }

    /// Direct dependencies, drivers and external cursors alike.
    pub fn dependencies(&self, name: &str) -> Result<&[DriverName]> {
        Ok(&self.get(name)?.dependencies)
    }

    /// Direct dependencies that are registered drivers.
    pub fn driver_dependencies(&self, name: &str) -> Result<Vec<DriverName>> {
        Ok(self
            .dependencies(name)?
            .iter()
            .filter(|dependency| self.drivers.contains_key(*dependency))
            .cloned()
            .collect())
    }

    pub fn dependents(&self, name: &str) -> Result<&[DriverName]> {
        self.get(name)?;
        Ok(self
            .dependents
            .get(name)
            .map(Vec::as_slice)
            .unwrap_or_default())
    }

    /// Every driver `name` depends on, directly or not, ordered with the
    /// deepest dependencies first and `name` itself last.
    pub fn transitive_closure(&self, name: &str) -> Result<Vec<DriverName>> {
        if let Some(closure) = self.closures.get(name) {
            return Ok(closure.clone());
        }
        self.get(name)?;
        Ok(self.compute_closure(&DriverName::new(name)))
    }

    fn compute_closure(&self, name: &DriverName) -> Vec<DriverName> {
        let mut visited = HashSet::new();
        let mut order = Vec::new();
        self.visit_dependencies(name, &mut visited, &mut order);
        order
    }

    /// Depth-first post-order: a driver is pushed only after everything it
    /// depends on.
    fn visit_dependencies(
        &self,
        name: &DriverName,
        visited: &mut HashSet<DriverName>,
        order: &mut Vec<DriverName>,
    ) {
        if !visited.insert(name.clone()) {
            return;
        }
        if let Some(metadata) = self.drivers.get(name) {
            for dependency in &metadata.dependencies {
                if self.drivers.contains_key(dependency) {
                    self.visit_dependencies(dependency, visited, order);
                }
            }
        }
        order.push(name.clone());
    }

    /// Ordered groups of drivers that may run concurrently.
    ///
    /// Rejected drivers are left out of the graph; a driver whose dependency
    /// was rejected can never be scheduled and is reported as an error. Each
    /// returned batch only keeps drivers that are in the closure of
    /// `desired`, sorted by name.
    pub fn parallel_batches(
        &self,
        desired: &BTreeSet<DriverName>,
        rejected: &BTreeSet<DriverName>,
    ) -> Result<Vec<Vec<DriverName>>> {
        let mut graph: BTreeMap<DriverName, BTreeSet<DriverName>> = self
            .topological_order
            .iter()
            .filter(|name| !rejected.contains(*name))
            .map(|name| {
                let deps = self
                    .drivers
                    .get(name)
                    .map(|metadata| {
                        metadata
                            .dependencies
                            .iter()
                            .filter(|dep| self.drivers.contains_key(*dep))
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default();
                (name.clone(), deps)
            })
            .collect();

        let mut wanted = BTreeSet::new();
        for name in desired {
            wanted.extend(self.transitive_closure(name.as_str())?);
        }

        let mut batches = Vec::new();
        while !graph.is_empty() {
            let batch: BTreeSet<DriverName> = graph
                .iter()
                .filter(|(_, deps)| deps.is_empty())
                .map(|(name, _)| name.clone())
                .collect();

            if batch.is_empty() {
                let unresolved: Vec<String> = graph
                    .iter()
                    .filter_map(|(name, deps)| {
                        let missing: Vec<&str> = deps
                            .iter()
                            .filter(|dep| !graph.contains_key(*dep))
                            .map(DriverName::as_str)
                            .collect();
                        (!missing.is_empty()).then(|| {
                            format!("{name} depends on {}", missing.join(", "))
                        })
                    })
                    .collect();
                return Err(CatalogScanError::Configuration(format!(
                    "check the disabled drivers; some drivers are missing dependencies: {}",
                    unresolved.join("; ")
                )));
            }

            for name in &batch {
                graph.remove(name);
            }
            for deps in graph.values_mut() {
                deps.retain(|dep| !batch.contains(dep));
            }

            let kept: Vec<DriverName> =
                batch.into_iter().filter(|name| wanted.contains(name)).collect();
            if !kept.is_empty() {
                batches.push(kept);
            }
        }

        Ok(batches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DriverRegistry {
        DriverRegistry::builder()
            .external_cursor("catalog")
            .external_cursor("flat-container")
            .driver(DriverMetadata::new("LoadPackageArchive").depends_on("flat-container"))
            .driver(DriverMetadata::new("PackageAssemblyToCsv").depends_on("flat-container"))
            .driver(
                DriverMetadata::new("PackageArchiveToCsv")
                    .depends_on("LoadPackageArchive")
                    .depends_on("PackageAssemblyToCsv"),
            )
            .driver(DriverMetadata::new("PackageSignatureToCsv").depends_on("LoadPackageArchive"))
            .driver(DriverMetadata::new("buildVersionSet").depends_on("catalog"))
            .build()
            .unwrap()
    }

    #[test]
    fn topological_order_respects_edges() {
        let registry = sample();
        let order = registry.startable_drivers();
        let position = |name: &str| {
            order.iter().position(|n| n.as_str() == name).unwrap()
        };

        for name in order {
            for dep in registry.driver_dependencies(name.as_str()).unwrap() {
                assert!(position(dep.as_str()) < position(name.as_str()));
            }
            for dependent in registry.dependents(name.as_str()).unwrap() {
                assert!(position(dependent.as_str()) > position(name.as_str()));
            }
        }
    }

    #[test]
    fn ties_break_by_case_insensitive_name() {
        let registry = sample();
        let names: Vec<&str> = registry
            .startable_drivers()
            .iter()
            .map(DriverName::as_str)
            .collect();
        assert_eq!(
            names,
            vec![
                "buildVersionSet",
                "LoadPackageArchive",
                "PackageAssemblyToCsv",
                "PackageArchiveToCsv",
                "PackageSignatureToCsv",
            ]
        );
        assert_eq!(registry.depth("PackageArchiveToCsv"), Some(1));
    }

    #[test]
    fn helpers_are_registered_but_not_startable() {
        let registry = sample();
        assert!(registry.contains(FIND_LATEST_LEAVES));
        assert!(registry.get(FIND_LATEST_LEAVES_PER_ID).unwrap().internal);
        assert!(
            !registry
                .startable_drivers()
                .iter()
                .any(|name| name.as_str() == FIND_LATEST_LEAVES)
        );
    }

    #[test]
    fn missing_dependency_is_a_configuration_error() {
        let err = DriverRegistry::builder()
            .driver(DriverMetadata::new("A").depends_on("B"))
            .build()
            .unwrap_err();
        assert!(matches!(err, CatalogScanError::Configuration(msg) if msg.contains("A depends on B")));
    }

    #[test]
    fn cycles_are_rejected() {
        let err = DriverRegistry::builder()
            .driver(DriverMetadata::new("A").depends_on("B"))
            .driver(DriverMetadata::new("B").depends_on("A"))
            .build()
            .unwrap_err();
        assert!(matches!(err, CatalogScanError::Configuration(_)));
    }

    #[test]
    fn closure_lists_dependencies_before_self() {
        let registry = sample();
        let closure = registry.transitive_closure("PackageArchiveToCsv").unwrap();
        assert_eq!(closure.last().unwrap().as_str(), "PackageArchiveToCsv");
        assert_eq!(closure.len(), 3);
        assert!(closure.iter().any(|n| n.as_str() == "LoadPackageArchive"));
        assert!(closure.iter().any(|n| n.as_str() == "PackageAssemblyToCsv"));
    }

    #[test]
    fn closure_of_a_diamond_keeps_dependencies_first() {
        let registry = DriverRegistry::builder()
            .external_cursor("catalog")
            .driver(DriverMetadata::new("A").depends_on("catalog"))
            .driver(DriverMetadata::new("B").depends_on("A"))
            .driver(DriverMetadata::new("C").depends_on("B"))
            .driver(DriverMetadata::new("D").depends_on("B").depends_on("C"))
            .build()
            .unwrap();

        let closure = registry.transitive_closure("D").unwrap();
        let names: Vec<&str> = closure.iter().map(DriverName::as_str).collect();
        assert_eq!(names, vec!["A", "B", "C", "D"]);

        let position =
            |name: &str| names.iter().position(|n| *n == name).unwrap();
        for name in &names {
            for dep in registry.driver_dependencies(name).unwrap() {
                assert!(position(dep.as_str()) < position(name));
            }
        }
    }

    #[test]
    fn parallel_batches_keep_only_desired_closure() {
        let registry = sample();
        let desired = BTreeSet::from([DriverName::new("PackageArchiveToCsv")]);
        let batches = registry
            .parallel_batches(&desired, &BTreeSet::new())
            .unwrap();
        let names: Vec<Vec<&str>> = batches
            .iter()
            .map(|batch| batch.iter().map(DriverName::as_str).collect())
            .collect();
        assert_eq!(
            names,
            vec![
                vec!["LoadPackageArchive", "PackageAssemblyToCsv"],
                vec!["PackageArchiveToCsv"],
            ]
        );
    }

    #[test]
    fn rejecting_a_dependency_reports_stuck_dependents() {
        let registry = sample();
        let desired = BTreeSet::from([DriverName::new("PackageSignatureToCsv")]);
        let rejected = BTreeSet::from([DriverName::new("LoadPackageArchive")]);
        let err = registry.parallel_batches(&desired, &rejected).unwrap_err();
        assert!(
            matches!(err, CatalogScanError::Configuration(msg) if msg.contains("PackageSignatureToCsv depends on LoadPackageArchive"))
        );
    }

    #[test]
    fn latest_leaf_support_resolution() {
        assert_eq!(LatestLeafSupport::Either.resolve(None), Some(true));
        assert_eq!(LatestLeafSupport::Either.resolve(Some(false)), Some(false));
        assert_eq!(LatestLeafSupport::AllLeavesOnly.resolve(None), Some(false));
        assert_eq!(LatestLeafSupport::AllLeavesOnly.resolve(Some(true)), None);
        assert_eq!(LatestLeafSupport::LatestLeavesOnly.resolve(Some(false)), None);
    }
}
