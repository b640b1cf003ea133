use std::{fmt, sync::Arc};

use tracing::debug;

use crate::{
    bucket::BucketedPackageSource,
    catalog::{CatalogClient, RemoteCursorClient},
    config::CatalogScanConfig,
    cursor::CursorStorageService,
    driver::DriverFactory,
    error::Result,
    events::{ScanEvent, ScanObserver},
    lease::LeaseService,
    queue::MessageQueue,
    registry::DriverRegistry,
    scan::ScanStorage,
};

/// Shared collaborators of the scan service and the message processors.
#[derive(Clone)]
pub struct ScanContext {
    pub config: Arc<CatalogScanConfig>,
    pub drivers: Arc<DriverFactory>,
    pub storage: ScanStorage,
    pub cursors: CursorStorageService,
    pub leases: Arc<dyn LeaseService>,
    pub queue: Arc<dyn MessageQueue>,
    pub catalog: Arc<dyn CatalogClient>,
    pub remote_cursors: Arc<dyn RemoteCursorClient>,
    /// Required only by drivers that support bucket-range scans.
    pub buckets: Option<Arc<dyn BucketedPackageSource>>,
    pub observer: Arc<dyn ScanObserver>,
}

impl fmt::Debug for ScanContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanContext")
            .field("config", &self.config)
            .field("drivers", &self.drivers)
            .field("storage", &self.storage)
            .field("cursors", &self.cursors)
            .field("buckets", &self.buckets.is_some())
            .finish_non_exhaustive()
    }
}

impl ScanContext {
    pub fn registry(&self) -> &DriverRegistry {
        self.drivers.registry()
    }

    /// Create the shared tables and lease storage. Per-scan child tables
    /// are created lazily.
    pub async fn initialize(&self) -> Result<()> {
        self.storage.initialize().await?;
        self.cursors.initialize().await?;
        self.leases.initialize().await
    }

    pub(crate) async fn publish(&self, event: ScanEvent) {
        if let Err(err) = self.observer.publish(event).await {
            debug!("scan observer rejected event: {err}");
        }
    }
}
