//! Driver contracts.
//!
//! A driver plugs domain work into the scan pipeline. The index-level
//! contract shapes how a scan fans out and how it finishes; the leaf-level
//! contracts do the per-package work.

mod adapter;
mod factory;
mod find_latest;

pub use adapter::SingleLeafBatchAdapter;
pub use factory::{DriverFactory, DriverFactoryBuilder, LeafDriver};
pub use find_latest::{FindLatestLeavesDriver, LatestLeafIdentity};

use std::time::Duration;

use async_trait::async_trait;

use crate::scan::{IndexScan, IndexScanResult, LeafScan, PageScan, PageScanResult};

/// Index and page level hooks for one driver.
#[async_trait]
pub trait CatalogScanDriver: Send + Sync {
    /// Prepare storage the driver writes into. Called once per scan.
    async fn initialize(&self, scan: &IndexScan) -> anyhow::Result<()>;

    /// Decide how the scan expands.
    async fn process_index(
        &self,
        scan: &IndexScan,
    ) -> anyhow::Result<IndexScanResult>;

    async fn start_custom_expand(&self, scan: &IndexScan) -> anyhow::Result<()> {
        anyhow::bail!(
            "driver {} does not implement custom expansion (scan {})",
            scan.driver,
            scan.scan_id
        )
    }

    async fn is_custom_expand_complete(
        &self,
        scan: &IndexScan,
    ) -> anyhow::Result<bool> {
        anyhow::bail!(
            "driver {} does not implement custom expansion (scan {})",
            scan.driver,
            scan.scan_id
        )
    }

    async fn process_page(&self, page: &PageScan) -> anyhow::Result<PageScanResult>;

    async fn start_aggregate(&self, scan: &IndexScan) -> anyhow::Result<()>;

    async fn is_aggregate_complete(&self, scan: &IndexScan) -> anyhow::Result<bool>;

    /// Last hook before the cursor moves. Also called when a scan is aborted.
    async fn finalize(&self, scan: &IndexScan) -> anyhow::Result<()>;
}

/// Outcome of a batch of leaves. Leaves not listed succeeded.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LeafBatchResult {
    /// Leaf ids that failed.
    pub failed: Vec<String>,
    /// Leaf ids the driver deferred, with the wait before the retry.
    pub try_again_later: Vec<(String, Duration)>,
}

impl LeafBatchResult {
    pub fn success() -> Self {
        Self::default()
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.try_again_later.is_empty()
    }
}

/// Processes the leaves of one page in a single call.
#[async_trait]
pub trait BatchLeafDriver: Send + Sync {
    async fn process_leaves(
        &self,
        leaves: &[LeafScan],
    ) -> anyhow::Result<LeafBatchResult>;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LeafOutcome {
    Success,
    /// The leaf cannot be processed yet; retry without spending an attempt.
    TryAgainLater,
}

/// Processes one leaf at a time.
#[async_trait]
pub trait SingleLeafDriver: Send + Sync {
    async fn process_leaf(&self, leaf: &LeafScan) -> anyhow::Result<LeafOutcome>;
}
