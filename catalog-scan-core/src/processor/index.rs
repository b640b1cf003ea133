use std::{collections::HashSet, fmt, sync::Arc};

use chrono::Utc;
use tracing::{info, warn};

use super::{backoff::requeue_delay, enqueue_leaf_scans, enqueue_page_scans};
use crate::{
    bucket::BucketRange,
    context::ScanContext,
    driver::CatalogScanDriver,
    error::{CatalogScanError, Result},
    events::ScanEvent,
    queue::{IndexScanMessage, ScanMessage},
    registry::{FIND_LATEST_LEAVES, FIND_LATEST_LEAVES_PER_ID},
    scan::{
        IndexScan, IndexScanResult, IndexScanState, LeafParent, LeafScan,
        PageScan, PageScanState, ids,
    },
    service::CatalogScanService,
    storage::TableEntity,
};

/// Drives an index scan from `Created` to `Complete`.
///
/// Every step checks the stored state before acting and persists the next
/// state with an etag-guarded replace, so a redelivered message resumes where
/// the last writer stopped. Losing a replace race hands the scan back to the
/// queue instead of failing.
#[derive(Clone)]
pub struct IndexScanProcessor {
    context: ScanContext,
    service: Arc<CatalogScanService>,
}

impl fmt::Debug for IndexScanProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexScanProcessor").finish_non_exhaustive()
    }
}

impl IndexScanProcessor {
    pub fn new(context: ScanContext, service: Arc<CatalogScanService>) -> Self {
        Self { context, service }
    }

    pub async fn process(&self, message: &IndexScanMessage) -> Result<()> {
        let mut message = message.clone();
        let Some(mut scan) = self
            .context
            .storage
            .get_index_scan(message.partition_key(), &message.scan_id)
            .await?
        else {
            return self.handle_missing(message).await;
        };

        if scan.state.is_terminal() {
            return Ok(());
        }

        info!(
            driver = %scan.driver,
            scan_id = %scan.scan_id,
            state = ?scan.state,
            "processing index scan"
        );

        let driver = self.context.drivers.index_driver(scan.driver.as_str())?;

        if scan.state == IndexScanState::Created {
            driver.initialize(&scan).await?;
            scan.started = Some(Utc::now());
            if !self
                .transition(&mut message, &mut scan, IndexScanState::Initialized)
                .await?
            {
                return Ok(());
            }
        }

        if scan.state == IndexScanState::Initialized && scan.result.is_none() {
            let result = driver.process_index(&scan).await?;
            if let Some(required) = result.requires_latest_leaves()
                && required != scan.only_latest_leaves
            {
                return Err(CatalogScanError::Configuration(format!(
                    "index scan result {result:?} is not supported when only_latest_leaves is {}",
                    scan.only_latest_leaves
                )));
            }
            if result.requires_latest_leaves().is_some() {
                self.context
                    .storage
                    .initialize_child_tables(&scan.storage_suffix)
                    .await?;
            }
            scan.result = Some(result);
            if !self.try_replace(&mut message, &mut scan).await? {
                return Ok(());
            }
        }

        let Some(result) = scan.result else {
            return Err(CatalogScanError::InvalidState(format!(
                "index scan {} is in state {:?} without a result",
                scan.scan_id, scan.state
            )));
        };

        if scan.bucket_ranges.is_some() {
            if result != IndexScanResult::ExpandLatestLeaves {
                return Err(CatalogScanError::NotSupported(format!(
                    "bucket ranges cannot be processed with the {result:?} mode"
                )));
            }
            return self
                .expand_bucket_ranges(&mut message, &mut scan, driver.as_ref())
                .await;
        }

        match result {
            IndexScanResult::ExpandAllLeaves => {
                self.expand_all_leaves(&mut message, &mut scan, driver.as_ref())
                    .await
            }
            IndexScanResult::ExpandLatestLeaves => {
                self.expand_latest_leaves(
                    &mut message,
                    &mut scan,
                    driver.as_ref(),
                    FIND_LATEST_LEAVES,
                )
                .await
            }
            IndexScanResult::ExpandLatestLeavesPerId => {
                self.expand_latest_leaves(
                    &mut message,
                    &mut scan,
                    driver.as_ref(),
                    FIND_LATEST_LEAVES_PER_ID,
                )
                .await
            }
            IndexScanResult::CustomExpand => {
                self.custom_expand(&mut message, &mut scan, driver.as_ref())
                    .await
            }
            IndexScanResult::Processed => {
                if scan.state == IndexScanState::Initialized
                    && !self
                        .transition(
                            &mut message,
                            &mut scan,
                            IndexScanState::StartingAggregate,
                        )
                        .await?
                {
                    return Ok(());
                }
                self.aggregate_and_finalize(&mut message, &mut scan, driver.as_ref())
                    .await
            }
        }
    }

    async fn handle_missing(&self, mut message: IndexScanMessage) -> Result<()> {
        let limit = self.context.config.index.missing_scan_max_attempts;
        if message.attempt_count < limit {
            warn!(
                driver = %message.driver,
                scan_id = %message.scan_id,
                attempt_count = message.attempt_count,
                "index scan should already exist; trying again"
            );
            message.attempt_count += 1;
            self.requeue(&message).await
        } else {
            warn!(
                driver = %message.driver,
                scan_id = %message.scan_id,
                attempt_count = message.attempt_count,
                "index scan never appeared; giving up"
            );
            Ok(())
        }
    }

    async fn expand_all_leaves(
        &self,
        message: &mut IndexScanMessage,
        scan: &mut IndexScan,
        driver: &dyn CatalogScanDriver,
    ) -> Result<()> {
        let storage = &self.context.storage;

        if scan.state == IndexScanState::Initialized
            && !self
                .transition(message, scan, IndexScanState::Expanding)
                .await?
        {
            return Ok(());
        }

        if scan.state == IndexScanState::Expanding {
            let pages = self.page_scans(scan).await?;
            storage
                .insert_missing_page_scans(&scan.storage_suffix, &scan.scan_id, pages)
                .await?;
            if !self
                .transition(message, scan, IndexScanState::Enqueuing)
                .await?
            {
                return Ok(());
            }
        }

        if scan.state == IndexScanState::Enqueuing {
            let pages = storage
                .get_page_scans(&scan.storage_suffix, &scan.scan_id, None)
                .await?;
            enqueue_page_scans(&self.context, &pages).await?;
            message.attempt_count = 0;
            if !self.transition(message, scan, IndexScanState::Working).await? {
                return Ok(());
            }
        }

        if scan.state == IndexScanState::Requeuing {
            let take = Some(self.context.config.fan_out.requeue_take);
            let leaves = storage
                .get_leaf_scans_for_scan(&scan.storage_suffix, &scan.scan_id, take)
                .await?;
            enqueue_leaf_scans(&self.context, &leaves).await?;
            let pages = storage
                .get_page_scans(&scan.storage_suffix, &scan.scan_id, take)
                .await?;
            enqueue_page_scans(&self.context, &pages).await?;
            info!(
                scan_id = %scan.scan_id,
                pages = pages.len(),
                leaves = leaves.len(),
                "requeued unfinished child scans"
            );
            if !self.transition(message, scan, IndexScanState::Working).await? {
                return Ok(());
            }
        }

        if scan.state == IndexScanState::Working {
            if !self.are_pages_complete(scan).await?
                || !self.are_leaves_complete(scan).await?
            {
                if self.should_recover_fan_out(scan).await? {
                    warn!(
                        scan_id = %scan.scan_id,
                        "no progress for a while; requeuing unfinished child scans"
                    );
                    message.attempt_count = 0;
                    if !self
                        .transition(message, scan, IndexScanState::Requeuing)
                        .await?
                    {
                        return Ok(());
                    }
                }
                message.attempt_count += 1;
                return self.requeue(message).await;
            }
            if !self
                .transition(message, scan, IndexScanState::StartingAggregate)
                .await?
            {
                return Ok(());
            }
        }

        self.aggregate_and_finalize(message, scan, driver).await
    }

    async fn expand_latest_leaves(
        &self,
        message: &mut IndexScanMessage,
        scan: &mut IndexScan,
        driver: &dyn CatalogScanDriver,
        helper_driver: &str,
    ) -> Result<()> {
        if scan.state == IndexScanState::Initialized
            && !self
                .transition(message, scan, IndexScanState::FindingLatest)
                .await?
        {
            return Ok(());
        }

        if scan.state == IndexScanState::FindingLatest {
            let helper = self
                .service
                .get_or_start_find_latest(scan, helper_driver)
                .await?;
            if !helper.state.is_terminal() {
                info!(scan_id = %scan.scan_id, "still finding latest catalog leaves");
                message.attempt_count += 1;
                return self.requeue(message).await;
            }
            if helper.state != IndexScanState::Complete {
                return Err(CatalogScanError::InvalidState(format!(
                    "find-latest scan {} ended in state {:?}",
                    helper.scan_id, helper.state
                )));
            }
            info!(scan_id = %scan.scan_id, "finding latest catalog leaves is complete");
            if !self
                .transition(message, scan, IndexScanState::Expanding)
                .await?
            {
                return Ok(());
            }
        }

        if scan.state == IndexScanState::Expanding {
            let helper_id = ids::find_latest_scan_id(&scan.scan_id);
            if let Some(helper) =
                self.context.storage.get_index_scan("", &helper_id).await?
            {
                match self.context.storage.delete_index_scan(&helper).await {
                    Ok(()) => {}
                    Err(err) if err.is_conflict() => {}
                    Err(err) => return Err(err),
                }
            }
            if !self
                .transition(message, scan, IndexScanState::Enqueuing)
                .await?
            {
                return Ok(());
            }
        }

        self.enqueue_and_wait_for_leaves(message, scan, driver).await
    }

    async fn expand_bucket_ranges(
        &self,
        message: &mut IndexScanMessage,
        scan: &mut IndexScan,
        driver: &dyn CatalogScanDriver,
    ) -> Result<()> {
        if scan.state == IndexScanState::Initialized
            && !self
                .transition(message, scan, IndexScanState::Expanding)
                .await?
        {
            return Ok(());
        }

        if scan.state == IndexScanState::Expanding {
            let source = self.context.buckets.as_ref().ok_or_else(|| {
                CatalogScanError::Configuration(
                    "bucket-range scans need a bucketed package source".to_string(),
                )
            })?;
            let ranges = scan.bucket_ranges.clone().unwrap_or_default();
            for bucket in BucketRange::parse_buckets(&ranges)? {
                let mut packages = source.packages_in_bucket(bucket).await?;
                packages.sort_by_key(|item| item.identity());

                let page_id = ids::bucket_page_id(bucket);
                let parent = LeafParent {
                    storage_suffix: &scan.storage_suffix,
                    scan_id: &scan.scan_id,
                    page_id: &page_id,
                    driver: &scan.driver,
                    min: scan.min,
                    max: scan.max,
                    bucket_ranges: Some(ranges.as_str()),
                    page_url: None,
                };
                let leaves = packages
                    .iter()
                    .enumerate()
                    .map(|(rank, item)| {
                        LeafScan::from_item(parent, ids::leaf_id(rank), item)
                    })
                    .collect();
                self.context
                    .storage
                    .insert_missing_leaf_scans(
                        &scan.storage_suffix,
                        &scan.scan_id,
                        &page_id,
                        leaves,
                    )
                    .await?;
            }
            if !self
                .transition(message, scan, IndexScanState::Enqueuing)
                .await?
            {
                return Ok(());
            }
        }

        self.enqueue_and_wait_for_leaves(message, scan, driver).await
    }

    async fn enqueue_and_wait_for_leaves(
        &self,
        message: &mut IndexScanMessage,
        scan: &mut IndexScan,
        driver: &dyn CatalogScanDriver,
    ) -> Result<()> {
        if scan.state == IndexScanState::Enqueuing {
            let count = self.enqueue_all_leaf_scans(scan).await?;
            info!(scan_id = %scan.scan_id, count, "enqueued leaf scans");
            message.attempt_count = 0;
            if !self.transition(message, scan, IndexScanState::Working).await? {
                return Ok(());
            }
        }

        if scan.state == IndexScanState::Working {
            if !self.are_leaves_complete(scan).await? {
                message.attempt_count += 1;
                return self.requeue(message).await;
            }
            if !self
                .transition(message, scan, IndexScanState::StartingAggregate)
                .await?
            {
                return Ok(());
            }
        }

        self.aggregate_and_finalize(message, scan, driver).await
    }

    /// Table-scan the leaf scans in chunks so a large fan-out never sits in
    /// memory at once. A failure part way re-enqueues from the start on
    /// redelivery; leaf processing tolerates the duplicates.
    async fn enqueue_all_leaf_scans(&self, scan: &IndexScan) -> Result<usize> {
        let take = self.context.config.fan_out.enqueue_take.max(1);
        let mut after: Option<(String, String)> = None;
        let mut total = 0;
        loop {
            let chunk = self
                .context
                .storage
                .get_leaf_scans_chunk(
                    &scan.storage_suffix,
                    &scan.scan_id,
                    after.as_ref(),
                    take,
                )
                .await?;
            let Some(last) = chunk.last() else {
                break;
            };
            after = Some((last.partition_key(), last.row_key()));
            enqueue_leaf_scans(&self.context, &chunk).await?;
            total += chunk.len();
            if chunk.len() < take {
                break;
            }
        }
        Ok(total)
    }

    async fn custom_expand(
        &self,
        message: &mut IndexScanMessage,
        scan: &mut IndexScan,
        driver: &dyn CatalogScanDriver,
    ) -> Result<()> {
        if scan.state == IndexScanState::Initialized
            && !self
                .transition(message, scan, IndexScanState::StartingExpand)
                .await?
        {
            return Ok(());
        }

        if scan.state == IndexScanState::StartingExpand {
            driver.start_custom_expand(scan).await?;
            message.attempt_count = 0;
            if !self.transition(message, scan, IndexScanState::Working).await? {
                return Ok(());
            }
        }

        if scan.state == IndexScanState::Working {
            if !driver.is_custom_expand_complete(scan).await? {
                info!(scan_id = %scan.scan_id, "custom expansion is still running");
                message.attempt_count += 1;
                return self.requeue(message).await;
            }
            if !self
                .transition(message, scan, IndexScanState::StartingAggregate)
                .await?
            {
                return Ok(());
            }
        }

        self.aggregate_and_finalize(message, scan, driver).await
    }

    async fn aggregate_and_finalize(
        &self,
        message: &mut IndexScanMessage,
        scan: &mut IndexScan,
        driver: &dyn CatalogScanDriver,
    ) -> Result<()> {
        if scan.state == IndexScanState::StartingAggregate {
            driver.start_aggregate(scan).await?;
            message.attempt_count = 0;
            if !self
                .transition(message, scan, IndexScanState::Aggregating)
                .await?
            {
                return Ok(());
            }
        }

        if scan.state == IndexScanState::Aggregating {
            if !driver.is_aggregate_complete(scan).await? {
                info!(scan_id = %scan.scan_id, "index scan is still aggregating");
                message.attempt_count += 1;
                return self.requeue(message).await;
            }
            if !self
                .transition(message, scan, IndexScanState::Finalizing)
                .await?
            {
                return Ok(());
            }
        }

        if scan.state == IndexScanState::Finalizing {
            self.finalize(scan, driver).await?;
            scan.completed = Some(Utc::now());
            if self.transition(message, scan, IndexScanState::Complete).await? {
                info!(
                    driver = %scan.driver,
                    scan_id = %scan.scan_id,
                    "catalog scan is complete"
                );
            }
        }

        Ok(())
    }

    async fn finalize(
        &self,
        scan: &IndexScan,
        driver: &dyn CatalogScanDriver,
    ) -> Result<()> {
        driver.finalize(scan).await?;

        if !scan.storage_suffix.is_empty() {
            info!(scan_id = %scan.scan_id, "deleting suffixed scan tables");
            self.context
                .storage
                .delete_child_tables(&scan.storage_suffix)
                .await?;
        }

        if scan.has_cursor() {
            if scan.bucket_ranges.is_some() {
                return Err(CatalogScanError::InvalidState(format!(
                    "bucket-range scan {} must not own a cursor",
                    scan.scan_id
                )));
            }
            match self
                .context
                .cursors
                .advance(&scan.cursor_name, scan.max)
                .await?
            {
                Some(from) => {
                    self.context
                        .publish(ScanEvent::CursorAdvanced {
                            name: scan.cursor_name.clone(),
                            from,
                            to: scan.max,
                        })
                        .await;
                }
                None => {
                    warn!(
                        cursor = %scan.cursor_name,
                        max = %scan.max,
                        "cursor is already at or past the scan max; skipping update"
                    );
                }
            }
        }

        if scan.continue_update {
            self.service.update_all(Some(scan.max)).await?;
        }

        if scan.parent_driver.is_none() {
            if scan.parent_scan_id.is_some() {
                return Err(CatalogScanError::InvalidState(format!(
                    "scan {} has a parent scan id but no parent driver",
                    scan.scan_id
                )));
            }
            self.context
                .storage
                .delete_old_index_scans(
                    scan.driver.as_str(),
                    &scan.scan_id,
                    self.context.config.old_index_scans_to_keep,
                )
                .await?;
        }

        Ok(())
    }

    async fn page_scans(&self, scan: &IndexScan) -> Result<Vec<PageScan>> {
        info!("loading catalog index");
        let index = self.context.catalog.get_catalog_index().await?;
        let ranks = index.page_ranks();
        let pages = index.pages_in_bounds(scan.min, scan.max);
        info!(
            driver = %scan.driver,
            count = pages.len(),
            min = %scan.min,
            max = %scan.max,
            "starting scan of catalog pages"
        );

        let mut seen = HashSet::new();
        let mut page_scans = Vec::with_capacity(pages.len());
        for page in pages {
            if !seen.insert(page.url.as_str()) {
                continue;
            }
            let rank = ranks.get(page.url.as_str()).copied().ok_or_else(|| {
                CatalogScanError::InvalidState(format!(
                    "catalog page {} has no rank",
                    page.url
                ))
            })?;
            page_scans.push(PageScan {
                storage_suffix: scan.storage_suffix.clone(),
                scan_id: scan.scan_id.clone(),
                page_id: ids::page_id(rank),
                driver: scan.driver.clone(),
                only_latest_leaves: scan.only_latest_leaves,
                parent_driver: scan.parent_driver.clone(),
                parent_scan_id: scan.parent_scan_id.clone(),
                state: PageScanState::Created,
                min: scan.min,
                max: scan.max,
                url: page.url.clone(),
                rank,
                etag: None,
            });
        }
        page_scans.sort_by_key(|page| page.rank);
        Ok(page_scans)
    }

    async fn are_pages_complete(&self, scan: &IndexScan) -> Result<bool> {
        let pending = self
            .context
            .storage
            .page_scan_count_lower_bound(&scan.storage_suffix, &scan.scan_id)
            .await?;
        if pending > 0 {
            info!(scan_id = %scan.scan_id, pending, "page scans are still pending");
        }
        Ok(pending == 0)
    }

    async fn are_leaves_complete(&self, scan: &IndexScan) -> Result<bool> {
        let pending = self
            .context
            .storage
            .leaf_scan_count_lower_bound(&scan.storage_suffix, &scan.scan_id)
            .await?;
        if pending > 0 {
            info!(scan_id = %scan.scan_id, pending, "leaf scans are still pending");
        }
        Ok(pending == 0)
    }

    /// Child records exist but nothing has touched the scan for a while and
    /// no child message is queued.
    async fn should_recover_fan_out(&self, scan: &IndexScan) -> Result<bool> {
        let Some(updated) = scan.timestamp else {
            return Ok(false);
        };
        if Utc::now() - updated < self.context.config.index.fan_out_recovery_after()
        {
            return Ok(false);
        }
        let pending = self
            .context
            .queue
            .pending_child_messages(&scan.scan_id)
            .await?;
        Ok(matches!(pending, None | Some(0)))
    }

    async fn transition(
        &self,
        message: &mut IndexScanMessage,
        scan: &mut IndexScan,
        state: IndexScanState,
    ) -> Result<bool> {
        let from = scan.state;
        scan.state = state;
        if !self.try_replace(message, scan).await? {
            return Ok(false);
        }
        self.context
            .publish(ScanEvent::IndexStateChanged {
                driver: scan.driver.clone(),
                scan_id: scan.scan_id.clone(),
                from,
                to: state,
            })
            .await;
        Ok(true)
    }

    /// Persist the scan. Returns false after losing an etag race; the
    /// message has then been handed back to the queue with a long delay.
    async fn try_replace(
        &self,
        message: &mut IndexScanMessage,
        scan: &mut IndexScan,
    ) -> Result<bool> {
        match self.context.storage.replace_index_scan(scan).await {
            Ok(()) => Ok(true),
            Err(err) if err.is_conflict() => {
                message.attempt_count = message
                    .attempt_count
                    .saturating_add(self.context.config.index.conflict_attempt_penalty);
                let delay =
                    requeue_delay(&self.context.config.backoff, message.attempt_count);
                self.context
                    .queue
                    .enqueue(vec![ScanMessage::Index(message.clone())], delay)
                    .await?;
                warn!(
                    scan_id = %scan.scan_id,
                    ?delay,
                    "index scan was updated by another worker; trying again later"
                );
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    async fn requeue(&self, message: &IndexScanMessage) -> Result<()> {
        let delay = requeue_delay(&self.context.config.backoff, message.attempt_count);
        self.context
            .queue
            .enqueue(vec![ScanMessage::Index(message.clone())], delay)
            .await
    }
}
