use std::{collections::HashMap, fmt, sync::Arc};

use async_trait::async_trait;
use tracing::debug;

use super::CatalogScanDriver;
use crate::{
    catalog::{CatalogClient, CatalogLeafItem},
    scan::{
        IndexScan, IndexScanResult, LeafParent, LeafScan, PageScan,
        PageScanResult, ScanStorage,
    },
};

/// Which leaves count as the same package when picking the newest.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum LatestLeafIdentity {
    /// Package id and version.
    PackageVersion,
    /// Package id alone.
    PackageId,
}

impl LatestLeafIdentity {
    fn leaf_id(self, item: &CatalogLeafItem) -> String {
        match self {
            LatestLeafIdentity::PackageVersion => item.package_version.to_lowercase(),
            LatestLeafIdentity::PackageId => item.package_id.to_lowercase(),
        }
    }
}

/// Built-in helper that walks a commit range for a parent scan and records
/// only the newest leaf per package identity in the parent's leaf table.
///
/// Leaf rows are keyed by package identity rather than catalog rank, so pages
/// processed in any order converge on the same rows.
pub struct FindLatestLeavesDriver {
    storage: ScanStorage,
    catalog: Arc<dyn CatalogClient>,
    identity: LatestLeafIdentity,
}

impl fmt::Debug for FindLatestLeavesDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FindLatestLeavesDriver")
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

impl FindLatestLeavesDriver {
    pub fn new(
        storage: ScanStorage,
        catalog: Arc<dyn CatalogClient>,
        identity: LatestLeafIdentity,
    ) -> Self {
        Self {
            storage,
            catalog,
            identity,
        }
    }

    async fn parent_of(&self, page: &PageScan) -> anyhow::Result<IndexScan> {
        let (Some(parent_driver), Some(parent_scan_id)) =
            (&page.parent_driver, &page.parent_scan_id)
        else {
            anyhow::bail!(
                "find-latest page {} of scan {} has no parent scan",
                page.page_id,
                page.scan_id
            );
        };
        self.storage
            .get_index_scan(parent_driver.as_str(), parent_scan_id)
            .await?
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "parent scan {parent_driver}/{parent_scan_id} not found"
                )
            })
    }

    /// Write the leaf unless a row with an equal or newer commit exists.
    async fn write_if_newer(&self, mut leaf: LeafScan) -> anyhow::Result<bool> {
        let existing = self
            .storage
            .get_leaf_scan(
                &leaf.storage_suffix,
                &leaf.scan_id,
                &leaf.page_id,
                &leaf.leaf_id,
            )
            .await?;
        match existing {
            None => self.storage.insert_leaf_scan(&mut leaf).await?,
            Some(current) if current.commit_timestamp >= leaf.commit_timestamp => {
                return Ok(false);
            }
            Some(current) => {
                leaf.etag = current.etag;
                self.storage.replace_leaf_scan(&mut leaf).await?;
            }
        }
        Ok(true)
    }
}

#[async_trait]
impl CatalogScanDriver for FindLatestLeavesDriver {
    async fn initialize(&self, _scan: &IndexScan) -> anyhow::Result<()> {
        Ok(())
    }

    async fn process_index(
        &self,
        _scan: &IndexScan,
    ) -> anyhow::Result<IndexScanResult> {
        Ok(IndexScanResult::ExpandAllLeaves)
    }

    async fn process_page(&self, page: &PageScan) -> anyhow::Result<PageScanResult> {
        let parent = self.parent_of(page).await?;
        let catalog_page = self.catalog.get_catalog_page(&page.url).await?;

        let mut latest: HashMap<(String, String), &CatalogLeafItem> = HashMap::new();
        for item in catalog_page.leaves_in_bounds(page.min, page.max, true) {
            let key = (item.package_id.to_lowercase(), self.identity.leaf_id(item));
            latest.insert(key, item);
        }

        let mut written = 0usize;
        for ((package_id, leaf_id), item) in latest {
            let leaf = LeafScan::from_item(
                LeafParent {
                    storage_suffix: &parent.storage_suffix,
                    scan_id: &parent.scan_id,
                    page_id: &package_id,
                    driver: &parent.driver,
                    min: parent.min,
                    max: parent.max,
                    bucket_ranges: None,
                    page_url: Some(&page.url),
                },
                leaf_id,
                item,
            );
            if self.write_if_newer(leaf).await? {
                written += 1;
            }
        }

        debug!(
            page = %page.url,
            parent_scan_id = %parent.scan_id,
            written,
            "recorded latest leaves"
        );
        Ok(PageScanResult::Processed)
    }

    async fn start_aggregate(&self, _scan: &IndexScan) -> anyhow::Result<()> {
        Ok(())
    }

    async fn is_aggregate_complete(&self, _scan: &IndexScan) -> anyhow::Result<bool> {
        Ok(true)
    }

    async fn finalize(&self, _scan: &IndexScan) -> anyhow::Result<()> {
        Ok(())
    }
}
