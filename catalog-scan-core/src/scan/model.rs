use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    catalog::{CatalogLeafItem, LeafType},
    registry::DriverName,
    storage::{ETag, TableEntity},
};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum IndexScanState {
    Created,
    Initialized,
    FindingLatest,
    StartingExpand,
    Expanding,
    Enqueuing,
    Requeuing,
    Working,
    StartingAggregate,
    Aggregating,
    Finalizing,
    Complete,
    Aborted,
}

impl IndexScanState {
    pub fn is_terminal(self) -> bool {
        matches!(self, IndexScanState::Complete | IndexScanState::Aborted)
    }
}

/// How the driver wants its index scan expanded.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum IndexScanResult {
    /// One page scan per catalog page, one leaf scan per leaf in range.
    ExpandAllLeaves,
    /// Only the newest leaf per package id and version.
    ExpandLatestLeaves,
    /// Only the newest leaf per package id.
    ExpandLatestLeavesPerId,
    /// The driver fans out on its own.
    CustomExpand,
    /// Nothing to fan out; go straight to aggregation.
    Processed,
}

impl IndexScanResult {
    pub fn requires_latest_leaves(self) -> Option<bool> {
        match self {
            IndexScanResult::ExpandAllLeaves => Some(false),
            IndexScanResult::ExpandLatestLeaves
            | IndexScanResult::ExpandLatestLeavesPerId => Some(true),
            IndexScanResult::CustomExpand | IndexScanResult::Processed => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum PageScanState {
    Created,
    Expanding,
    Enqueuing,
    Complete,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum PageScanResult {
    Processed,
    ExpandAllowDuplicates,
    ExpandRemoveDuplicates,
}

/// Root record of one scan over `(min, max]` for a driver.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndexScan {
    pub driver: DriverName,
    pub scan_id: String,
    pub storage_suffix: String,
    pub state: IndexScanState,
    pub result: Option<IndexScanResult>,
    pub only_latest_leaves: bool,
    pub parent_driver: Option<DriverName>,
    pub parent_scan_id: Option<String>,
    /// Cursor advanced on completion. Empty when the scan owns no cursor.
    pub cursor_name: String,
    pub bucket_ranges: Option<String>,
    pub min: DateTime<Utc>,
    pub max: DateTime<Utc>,
    /// Run a full update pass once this scan completes.
    pub continue_update: bool,
    pub created: DateTime<Utc>,
    pub started: Option<DateTime<Utc>>,
    pub completed: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub etag: Option<ETag>,
    /// Time of the last write, maintained by the store.
    #[serde(skip)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl IndexScan {
    pub fn is_helper(&self) -> bool {
        self.parent_scan_id.is_some()
    }

    pub fn has_cursor(&self) -> bool {
        !self.cursor_name.is_empty()
    }
}

impl TableEntity for IndexScan {
    fn partition_key(&self) -> String {
        if self.is_helper() {
            String::new()
        } else {
            self.driver.to_string()
        }
    }

    fn row_key(&self) -> String {
        self.scan_id.clone()
    }

    fn etag(&self) -> Option<&ETag> {
        self.etag.as_ref()
    }

    fn set_etag(&mut self, etag: Option<ETag>) {
        self.etag = etag;
    }

    fn set_timestamp(&mut self, timestamp: DateTime<Utc>) {
        self.timestamp = Some(timestamp);
    }
}

/// One catalog page within an all-leaves index scan.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PageScan {
    pub storage_suffix: String,
    pub scan_id: String,
    pub page_id: String,
    pub driver: DriverName,
    pub only_latest_leaves: bool,
    pub parent_driver: Option<DriverName>,
    pub parent_scan_id: Option<String>,
    pub state: PageScanState,
    pub min: DateTime<Utc>,
    pub max: DateTime<Utc>,
    pub url: String,
    pub rank: usize,
    #[serde(skip)]
    pub etag: Option<ETag>,
}

impl TableEntity for PageScan {
    fn partition_key(&self) -> String {
        self.scan_id.clone()
    }

    fn row_key(&self) -> String {
        self.page_id.clone()
    }

    fn etag(&self) -> Option<&ETag> {
        self.etag.as_ref()
    }

    fn set_etag(&mut self, etag: Option<ETag>) {
        self.etag = etag;
    }
}

/// One catalog leaf awaiting processing. Deleting the row marks it done.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LeafScan {
    pub storage_suffix: String,
    pub scan_id: String,
    pub page_id: String,
    pub leaf_id: String,
    pub driver: DriverName,
    pub min: DateTime<Utc>,
    pub max: DateTime<Utc>,
    pub bucket_ranges: Option<String>,
    pub url: String,
    pub page_url: Option<String>,
    pub leaf_type: LeafType,
    pub commit_id: String,
    pub commit_timestamp: DateTime<Utc>,
    pub package_id: String,
    pub package_version: String,
    pub attempt_count: u32,
    pub next_attempt: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub etag: Option<ETag>,
}

impl LeafScan {
    pub fn partition_key_for(scan_id: &str, page_id: &str) -> String {
        format!("{scan_id}-{page_id}")
    }

    /// Copy the catalog facts of `item` into a fresh leaf record.
    pub fn from_item(
        parent: LeafParent<'_>,
        leaf_id: String,
        item: &CatalogLeafItem,
    ) -> Self {
        Self {
            storage_suffix: parent.storage_suffix.to_string(),
            scan_id: parent.scan_id.to_string(),
            page_id: parent.page_id.to_string(),
            leaf_id,
            driver: parent.driver.clone(),
            min: parent.min,
            max: parent.max,
            bucket_ranges: parent.bucket_ranges.map(str::to_string),
            url: item.url.clone(),
            page_url: parent.page_url.map(str::to_string),
            leaf_type: item.leaf_type,
            commit_id: item.commit_id.clone(),
            commit_timestamp: item.commit_timestamp,
            package_id: item.package_id.clone(),
            package_version: item.package_version.clone(),
            attempt_count: 0,
            next_attempt: None,
            etag: None,
        }
    }

    /// Record the start of an attempt and push out the next eligible time.
    /// `delay` sees the attempt count after the increment.
    pub fn start_attempt(
        &mut self,
        now: DateTime<Utc>,
        delay: impl FnOnce(u32) -> Duration,
    ) {
        self.attempt_count = self.attempt_count.saturating_add(1);
        self.next_attempt = Some(
            now.checked_add_signed(delay(self.attempt_count))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        );
    }

    /// Undo [`Self::start_attempt`] after a driver deferral.
    pub fn reset_attempt(&mut self, now: DateTime<Utc>) {
        self.attempt_count = self.attempt_count.saturating_sub(1);
        self.next_attempt = Some(now);
    }
}

/// The scan-level fields a new [`LeafScan`] inherits.
#[derive(Clone, Copy, Debug)]
pub struct LeafParent<'a> {
    pub storage_suffix: &'a str,
    pub scan_id: &'a str,
    pub page_id: &'a str,
    pub driver: &'a DriverName,
    pub min: DateTime<Utc>,
    pub max: DateTime<Utc>,
    pub bucket_ranges: Option<&'a str>,
    pub page_url: Option<&'a str>,
}

impl TableEntity for LeafScan {
    fn partition_key(&self) -> String {
        Self::partition_key_for(&self.scan_id, &self.page_id)
    }

    fn row_key(&self) -> String {
        self.leaf_id.clone()
    }

    fn etag(&self) -> Option<&ETag> {
        self.etag.as_ref()
    }

    fn set_etag(&mut self, etag: Option<ETag>) {
        self.etag = etag;
    }
}
