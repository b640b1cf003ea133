//! Driver graph as written in a settings file.

use catalog_scan_core::{
    DriverMetadata, DriverRegistry, Result,
    registry::{LatestLeafSupport, LeafRuntime},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One `[[registry.drivers]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverSpec {
    pub name: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default = "default_latest_leaf_support")]
    pub latest_leaf_support: LatestLeafSupport,
    #[serde(default)]
    pub bucket_range_support: bool,
    #[serde(default)]
    pub updated_outside_of_catalog: bool,
    #[serde(default)]
    pub default_min: Option<DateTime<Utc>>,
    #[serde(default = "default_runtime")]
    pub runtime: LeafRuntime,
}

fn default_latest_leaf_support() -> LatestLeafSupport {
    LatestLeafSupport::AllLeavesOnly
}

fn default_runtime() -> LeafRuntime {
    LeafRuntime::Batch
}

impl DriverSpec {
    pub fn to_metadata(&self) -> DriverMetadata {
        let mut metadata = DriverMetadata::new(self.name.as_str())
            .latest_leaves(self.latest_leaf_support)
            .bucket_ranges(self.bucket_range_support)
            .updated_outside_of_catalog(self.updated_outside_of_catalog)
            .runtime(self.runtime);
        for dependency in &self.dependencies {
            metadata = metadata.depends_on(dependency.as_str());
        }
        if let Some(min) = self.default_min {
            metadata = metadata.default_min(min);
        }
        metadata
    }
}

/// The `[registry]` table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySpec {
    /// Cursors owned outside the engine.
    pub external_cursors: Vec<String>,
    pub drivers: Vec<DriverSpec>,
}

impl RegistrySpec {
    pub fn is_empty(&self) -> bool {
        self.external_cursors.is_empty() && self.drivers.is_empty()
    }

    /// Build and validate the registry. Cycles and missing dependencies are
    /// configuration errors.
    pub fn build(&self) -> Result<DriverRegistry> {
        let mut builder = DriverRegistry::builder();
        for cursor in &self.external_cursors {
            builder = builder.external_cursor(cursor.as_str());
        }
        for driver in &self.drivers {
            builder = builder.driver(driver.to_metadata());
        }
        builder.build()
    }
}
