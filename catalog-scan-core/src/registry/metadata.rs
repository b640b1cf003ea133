use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::DriverName;

/// Whether a driver can run over only the newest leaf per package.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum LatestLeafSupport {
    /// Every leaf in range must be processed.
    AllLeavesOnly,
    /// Only the newest leaf per package is processed.
    LatestLeavesOnly,
    /// The caller picks; defaults to latest leaves.
    Either,
}

impl LatestLeafSupport {
    /// Resolve the caller's request against what the driver supports.
    /// Returns `None` when the explicit request is not supported.
    pub fn resolve(self, requested: Option<bool>) -> Option<bool> {
        match (self, requested) {
            (LatestLeafSupport::AllLeavesOnly, None | Some(false)) => {
                Some(false)
            }
            (LatestLeafSupport::LatestLeavesOnly, None | Some(true)) => {
                Some(true)
            }
            (LatestLeafSupport::Either, requested) => {
                Some(requested.unwrap_or(true))
            }
            _ => None,
        }
    }
}

/// How leaf work is dispatched to the driver.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum LeafRuntime {
    /// One call per group of leaves sharing a page.
    Batch,
    /// One call per leaf, each with its own optimistic-concurrency retry.
    SingleLeaf,
}

/// Declared metadata for one driver.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DriverMetadata {
    pub name: DriverName,
    /// Direct dependencies. Each entry names another driver or an external
    /// cursor registered with the registry.
    pub dependencies: Vec<DriverName>,
    pub latest_leaf_support: LatestLeafSupport,
    pub bucket_range_support: bool,
    /// The driver's output can change without a new catalog event.
    pub updated_outside_of_catalog: bool,
    /// First `min` used when the driver has never run.
    pub default_min: Option<DateTime<Utc>>,
    pub runtime: LeafRuntime,
    /// Helper drivers are started by other scans and never directly.
    pub internal: bool,
}

impl DriverMetadata {
    pub fn new(name: impl Into<DriverName>) -> Self {
        Self {
            name: name.into(),
            dependencies: Vec::new(),
            latest_leaf_support: LatestLeafSupport::AllLeavesOnly,
            bucket_range_support: false,
            updated_outside_of_catalog: false,
            default_min: None,
            runtime: LeafRuntime::Batch,
            internal: false,
        }
    }

    pub fn depends_on(mut self, dependency: impl Into<DriverName>) -> Self {
        self.dependencies.push(dependency.into());
        self
    }

    pub fn latest_leaves(mut self, support: LatestLeafSupport) -> Self {
        self.latest_leaf_support = support;
        self
    }

    pub fn bucket_ranges(mut self, supported: bool) -> Self {
        self.bucket_range_support = supported;
        self
    }

    pub fn updated_outside_of_catalog(mut self, value: bool) -> Self {
        self.updated_outside_of_catalog = value;
        self
    }

    pub fn default_min(mut self, min: DateTime<Utc>) -> Self {
        self.default_min = Some(min);
        self
    }

    pub fn runtime(mut self, runtime: LeafRuntime) -> Self {
        self.runtime = runtime;
        self
    }

    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }
}
