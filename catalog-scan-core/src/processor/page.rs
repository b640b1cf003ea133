use std::fmt;

use tracing::{info, warn};

use super::enqueue_leaf_scans;
use crate::{
    context::ScanContext,
    error::{CatalogScanError, Result},
    queue::PageScanMessage,
    scan::{LeafParent, LeafScan, PageScan, PageScanResult, PageScanState, ids},
};

/// Expands one catalog page into leaf scans, or lets the driver handle the
/// page on its own.
#[derive(Clone)]
pub struct PageScanProcessor {
    context: ScanContext,
}

impl fmt::Debug for PageScanProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageScanProcessor").finish_non_exhaustive()
    }
}

impl PageScanProcessor {
    pub fn new(context: ScanContext) -> Self {
        Self { context }
    }

    pub async fn process(&self, message: &PageScanMessage) -> Result<()> {
        let Some(mut page) = self
            .context
            .storage
            .get_page_scan(
                &message.storage_suffix,
                &message.scan_id,
                &message.page_id,
            )
            .await?
        else {
            warn!(
                scan_id = %message.scan_id,
                page_id = %message.page_id,
                "no matching page scan was found"
            );
            return Ok(());
        };

        let driver = self.context.drivers.index_driver(page.driver.as_str())?;
        match driver.process_page(&page).await? {
            PageScanResult::Processed => {
                self.context.storage.delete_page_scan(&page).await
            }
            PageScanResult::ExpandAllowDuplicates => {
                self.expand(&mut page, false).await
            }
            PageScanResult::ExpandRemoveDuplicates => {
                self.expand(&mut page, true).await
            }
        }
    }

    async fn expand(
        &self,
        page: &mut PageScan,
        exclude_redundant: bool,
    ) -> Result<()> {
        let storage = &self.context.storage;
        let mut leaf_scans: Option<Vec<LeafScan>> = None;

        if page.state == PageScanState::Created {
            self.transition(page, PageScanState::Expanding).await?;
        }

        if page.state == PageScanState::Expanding {
            let leaves = self.leaf_scans(page, exclude_redundant).await?;
            storage
                .insert_missing_leaf_scans(
                    &page.storage_suffix,
                    &page.scan_id,
                    &page.page_id,
                    leaves.clone(),
                )
                .await?;
            leaf_scans = Some(leaves);
            self.transition(page, PageScanState::Enqueuing).await?;
        }

        if page.state == PageScanState::Enqueuing {
            let leaves = match leaf_scans.take() {
                Some(leaves) => leaves,
                None => self.leaf_scans(page, exclude_redundant).await?,
            };
            enqueue_leaf_scans(&self.context, &leaves).await?;
            self.transition(page, PageScanState::Complete).await?;
        }

        if page.state == PageScanState::Complete {
            storage.delete_page_scan(page).await?;
        }

        Ok(())
    }

    async fn transition(
        &self,
        page: &mut PageScan,
        state: PageScanState,
    ) -> Result<()> {
        page.state = state;
        self.context.storage.replace_page_scan(page).await
    }

    async fn leaf_scans(
        &self,
        page: &PageScan,
        exclude_redundant: bool,
    ) -> Result<Vec<LeafScan>> {
        info!(url = %page.url, "loading catalog page");
        let catalog_page = self.context.catalog.get_catalog_page(&page.url).await?;
        let items = catalog_page.leaves_in_bounds(page.min, page.max, exclude_redundant);
        let ranks = catalog_page.leaf_ranks();
        info!(
            count = items.len(),
            min = %page.min,
            max = %page.max,
            "starting scan of catalog leaves"
        );

        let mut ranked = items
            .into_iter()
            .map(|item| {
                ranks
                    .get(item.url.as_str())
                    .map(|rank| (*rank, item))
                    .ok_or_else(|| {
                        CatalogScanError::InvalidState(format!(
                            "leaf {} has no rank on page {}",
                            item.url, page.url
                        ))
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        ranked.sort_by_key(|(rank, _)| *rank);

        let parent = LeafParent {
            storage_suffix: &page.storage_suffix,
            scan_id: &page.scan_id,
            page_id: &page.page_id,
            driver: &page.driver,
            min: page.min,
            max: page.max,
            bucket_ranges: None,
            page_url: Some(&page.url),
        };
        Ok(ranked
            .into_iter()
            .map(|(rank, item)| LeafScan::from_item(parent, ids::leaf_id(rank), item))
            .collect())
    }
}
