use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use super::{
    BatchLeafDriver, CatalogScanDriver, FindLatestLeavesDriver,
    LatestLeafIdentity, SingleLeafBatchAdapter, SingleLeafDriver,
};
use crate::{
    catalog::CatalogClient,
    error::{CatalogScanError, Result},
    registry::{
        DriverName, DriverRegistry, FIND_LATEST_LEAVES, FIND_LATEST_LEAVES_PER_ID,
        LeafRuntime,
    },
    scan::ScanStorage,
};

/// Leaf-level implementation of a driver.
#[derive(Clone)]
pub enum LeafDriver {
    Batch(Arc<dyn BatchLeafDriver>),
    Single(Arc<dyn SingleLeafDriver>),
}

impl fmt::Debug for LeafDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeafDriver::Batch(_) => f.write_str("LeafDriver::Batch"),
            LeafDriver::Single(_) => f.write_str("LeafDriver::Single"),
        }
    }
}

impl LeafDriver {
    pub fn runtime(&self) -> LeafRuntime {
        match self {
            LeafDriver::Batch(_) => LeafRuntime::Batch,
            LeafDriver::Single(_) => LeafRuntime::SingleLeaf,
        }
    }

    /// Run a single-leaf driver through the batch path.
    pub fn batched(
        driver: Arc<dyn SingleLeafDriver>,
        try_again_later: Duration,
    ) -> Self {
        LeafDriver::Batch(Arc::new(SingleLeafBatchAdapter::new(
            driver,
            try_again_later,
        )))
    }
}

#[derive(Clone)]
struct Registration {
    index: Arc<dyn CatalogScanDriver>,
    leaf: Option<LeafDriver>,
}

/// Resolves driver names to their implementations.
#[derive(Clone)]
pub struct DriverFactory {
    registry: Arc<DriverRegistry>,
    drivers: HashMap<DriverName, Registration>,
}

impl fmt::Debug for DriverFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.drivers.keys().map(DriverName::as_str).collect();
        names.sort_unstable();
        f.debug_struct("DriverFactory")
            .field("drivers", &names)
            .finish()
    }
}

impl DriverFactory {
    pub fn builder(registry: Arc<DriverRegistry>) -> DriverFactoryBuilder {
        DriverFactoryBuilder {
            registry,
            drivers: HashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<DriverRegistry> {
        &self.registry
    }

    pub fn index_driver(&self, name: &str) -> Result<Arc<dyn CatalogScanDriver>> {
        self.drivers
            .get(name)
            .map(|registration| Arc::clone(&registration.index))
            .ok_or_else(|| {
                CatalogScanError::Configuration(format!(
                    "no implementation registered for driver {name}"
                ))
            })
    }

    pub fn leaf_driver(&self, name: &str) -> Result<LeafDriver> {
        self.drivers
            .get(name)
            .and_then(|registration| registration.leaf.clone())
            .ok_or_else(|| {
                CatalogScanError::Configuration(format!(
                    "driver {name} has no leaf implementation"
                ))
            })
    }
}

#[derive(Debug)]
pub struct DriverFactoryBuilder {
    registry: Arc<DriverRegistry>,
    drivers: HashMap<DriverName, Registration>,
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("leaf", &self.leaf)
            .finish_non_exhaustive()
    }
}

impl DriverFactoryBuilder {
    pub fn driver(
        mut self,
        name: impl Into<DriverName>,
        index: Arc<dyn CatalogScanDriver>,
        leaf: LeafDriver,
    ) -> Self {
        self.drivers.insert(
            name.into(),
            Registration {
                index,
                leaf: Some(leaf),
            },
        );
        self
    }

    /// Register a driver that never produces leaf scans.
    pub fn index_driver(
        mut self,
        name: impl Into<DriverName>,
        index: Arc<dyn CatalogScanDriver>,
    ) -> Self {
        self.drivers
            .insert(name.into(), Registration { index, leaf: None });
        self
    }

    /// Adds the built-in find-latest helpers and checks every registry
    /// driver against its implementation.
    pub fn build(
        mut self,
        storage: ScanStorage,
        catalog: Arc<dyn CatalogClient>,
    ) -> Result<DriverFactory> {
        for (name, identity) in [
            (FIND_LATEST_LEAVES, LatestLeafIdentity::PackageVersion),
            (FIND_LATEST_LEAVES_PER_ID, LatestLeafIdentity::PackageId),
        ] {
            let helper = FindLatestLeavesDriver::new(
                storage.clone(),
                Arc::clone(&catalog),
                identity,
            );
            self.drivers.insert(
                DriverName::new(name),
                Registration {
                    index: Arc::new(helper),
                    leaf: None,
                },
            );
        }

        for name in self.drivers.keys() {
            if !self.registry.contains(name.as_str()) {
                return Err(CatalogScanError::Configuration(format!(
                    "implementation registered for unknown driver {name}"
                )));
            }
        }

        for name in self.registry.startable_drivers() {
            let registration = self.drivers.get(name).ok_or_else(|| {
                CatalogScanError::Configuration(format!(
                    "driver {name} has no implementation"
                ))
            })?;
            let declared = self.registry.get(name.as_str())?.runtime;
            if let Some(leaf) = &registration.leaf
                && leaf.runtime() != declared
            {
                return Err(CatalogScanError::Configuration(format!(
                    "driver {name} declares {declared:?} but registered a {:?} leaf driver",
                    leaf.runtime()
                )));
            }
        }

        Ok(DriverFactory {
            registry: self.registry,
            drivers: self.drivers,
        })
    }
}
