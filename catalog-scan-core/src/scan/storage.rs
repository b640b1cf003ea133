use std::{collections::{HashMap, HashSet}, fmt, sync::Arc};

use tracing::{debug, info};

use super::{IndexScan, LeafScan, PageScan};
use crate::{
    error::{CatalogScanError, Result},
    storage::{RowQuery, TableEntity, TableStore, TypedTable},
};

pub const INDEX_SCAN_TABLE: &str = "catalogindexscans";
const PAGE_SCAN_TABLE_PREFIX: &str = "catalogpagescan";
const LEAF_SCAN_TABLE_PREFIX: &str = "catalogleafscan";

pub fn page_scan_table(storage_suffix: &str) -> String {
    format!("{PAGE_SCAN_TABLE_PREFIX}{storage_suffix}")
}

pub fn leaf_scan_table(storage_suffix: &str) -> String {
    format!("{LEAF_SCAN_TABLE_PREFIX}{storage_suffix}")
}

/// Durable home of index, page and leaf scan records.
///
/// Index scans share one table. Page and leaf scans live in tables named by
/// the owning scan's storage suffix so a finished scan can drop its children
/// wholesale.
#[derive(Clone)]
pub struct ScanStorage {
    store: Arc<dyn TableStore>,
}

impl fmt::Debug for ScanStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanStorage")
            .field("index_table", &INDEX_SCAN_TABLE)
            .finish()
    }
}

impl ScanStorage {
    pub fn new(store: Arc<dyn TableStore>) -> Self {
        Self { store }
    }

    fn index_table(&self) -> TypedTable {
        TypedTable::new(Arc::clone(&self.store), INDEX_SCAN_TABLE)
    }

    fn page_table(&self, storage_suffix: &str) -> TypedTable {
        TypedTable::new(
            Arc::clone(&self.store),
            page_scan_table(storage_suffix),
        )
    }

    fn leaf_table(&self, storage_suffix: &str) -> TypedTable {
        TypedTable::new(
            Arc::clone(&self.store),
            leaf_scan_table(storage_suffix),
        )
    }

    pub async fn initialize(&self) -> Result<()> {
        self.index_table().create_if_not_exists().await
    }

    pub async fn initialize_child_tables(
        &self,
        storage_suffix: &str,
    ) -> Result<()> {
        self.page_table(storage_suffix).create_if_not_exists().await?;
        self.leaf_table(storage_suffix).create_if_not_exists().await
    }

    pub async fn delete_child_tables(&self, storage_suffix: &str) -> Result<()> {
        self.page_table(storage_suffix).delete().await?;
        self.leaf_table(storage_suffix).delete().await
    }

    // Index scans

    pub async fn get_index_scan(
        &self,
        partition_key: &str,
        scan_id: &str,
    ) -> Result<Option<IndexScan>> {
        self.index_table().get(partition_key, scan_id).await
    }

    /// Newest scans first, as scan ids sort in descending time order.
    pub async fn get_latest_index_scans(
        &self,
        partition_key: &str,
        take: usize,
    ) -> Result<Vec<IndexScan>> {
        self.index_table()
            .query(&RowQuery::partition(partition_key).with_take(take))
            .await
    }

    pub async fn insert_index_scan(&self, scan: &mut IndexScan) -> Result<()> {
        self.index_table().insert(scan).await
    }

    pub async fn replace_index_scan(&self, scan: &mut IndexScan) -> Result<()> {
        self.index_table().replace(scan).await
    }

    /// Overwrite without an etag precondition.
    pub async fn force_replace_index_scan(
        &self,
        scan: &mut IndexScan,
    ) -> Result<()> {
        scan.etag = None;
        self.index_table().replace(scan).await
    }

    pub async fn delete_index_scan(&self, scan: &IndexScan) -> Result<()> {
        self.index_table().delete_entity(scan).await
    }

    /// Delete terminal scans older than `current_scan_id`, keeping the newest
    /// `keep` of them.
    pub async fn delete_old_index_scans(
        &self,
        partition_key: &str,
        current_scan_id: &str,
        keep: usize,
    ) -> Result<usize> {
        let mut old: Vec<IndexScan> = self
            .index_table()
            .query::<IndexScan>(&RowQuery::partition(partition_key))
            .await?
            .into_iter()
            .filter(|scan| {
                scan.scan_id.as_str() > current_scan_id
                    && scan.state.is_terminal()
            })
            .skip(keep)
            .collect();

        let deleted = old.len();
        if deleted > 0 {
            info!(
                partition = partition_key,
                count = deleted,
                "deleting old index scans"
            );
            self.index_table().delete_many(&mut old).await?;
        }
        Ok(deleted)
    }

    // Page scans

    pub async fn get_page_scan(
        &self,
        storage_suffix: &str,
        scan_id: &str,
        page_id: &str,
    ) -> Result<Option<PageScan>> {
        not_found_as_none(
            self.page_table(storage_suffix).get(scan_id, page_id).await,
        )
    }

    pub async fn get_page_scans(
        &self,
        storage_suffix: &str,
        scan_id: &str,
        take: Option<usize>,
    ) -> Result<Vec<PageScan>> {
        let mut query = RowQuery::partition(scan_id);
        query.take = take;
        self.page_table(storage_suffix).query(&query).await
    }

    /// Insert the page scans that are not stored yet. Stored pages absent
    /// from `page_scans` indicate a different expansion and fail the call.
    pub async fn insert_missing_page_scans(
        &self,
        storage_suffix: &str,
        scan_id: &str,
        page_scans: Vec<PageScan>,
    ) -> Result<()> {
        let existing: HashSet<String> = self
            .get_page_scans(storage_suffix, scan_id, None)
            .await?
            .into_iter()
            .map(|page| page.page_id)
            .collect();
        let wanted: HashSet<&str> =
            page_scans.iter().map(|page| page.page_id.as_str()).collect();
        if let Some(extra) =
            existing.iter().find(|id| !wanted.contains(id.as_str()))
        {
            return Err(CatalogScanError::InvalidState(format!(
                "scan {scan_id} has unexpected page scan {extra}"
            )));
        }

        let mut missing: Vec<PageScan> = page_scans
            .into_iter()
            .filter(|page| !existing.contains(&page.page_id))
            .collect();
        debug!(scan_id, count = missing.len(), "inserting page scans");
        self.page_table(storage_suffix).insert_many(&mut missing).await
    }

    pub async fn replace_page_scan(&self, page: &mut PageScan) -> Result<()> {
        self.page_table(&page.storage_suffix).replace(page).await
    }

    pub async fn delete_page_scan(&self, page: &PageScan) -> Result<()> {
        self.page_table(&page.storage_suffix).delete_entity(page).await
    }

    pub async fn page_scan_count_lower_bound(
        &self,
        storage_suffix: &str,
        scan_id: &str,
    ) -> Result<usize> {
        Ok(self
            .get_page_scans(storage_suffix, scan_id, Some(1))
            .await?
            .len())
    }

    // Leaf scans

    pub async fn get_leaf_scan(
        &self,
        storage_suffix: &str,
        scan_id: &str,
        page_id: &str,
        leaf_id: &str,
    ) -> Result<Option<LeafScan>> {
        not_found_as_none(
            self.leaf_table(storage_suffix)
                .get(&LeafScan::partition_key_for(scan_id, page_id), leaf_id)
                .await,
        )
    }

    /// Fetch the requested leaves of one page with a single range query.
    /// Fails with `TableNotFound` when the scan's tables are gone.
    pub async fn get_leaf_scans(
        &self,
        storage_suffix: &str,
        scan_id: &str,
        page_id: &str,
        leaf_ids: &[&str],
    ) -> Result<HashMap<String, LeafScan>> {
        let (Some(min), Some(max)) =
            (leaf_ids.iter().min(), leaf_ids.iter().max())
        else {
            return Ok(HashMap::new());
        };
        let wanted: HashSet<&str> = leaf_ids.iter().copied().collect();
        let query =
            RowQuery::partition(LeafScan::partition_key_for(scan_id, page_id))
                .with_row_range(*min, *max);
        Ok(self
            .leaf_table(storage_suffix)
            .query::<LeafScan>(&query)
            .await?
            .into_iter()
            .filter(|leaf| wanted.contains(leaf.leaf_id.as_str()))
            .map(|leaf| (leaf.leaf_id.clone(), leaf))
            .collect())
    }

    /// Leaf scans of a whole index scan across every page, in key order.
    pub async fn get_leaf_scans_for_scan(
        &self,
        storage_suffix: &str,
        scan_id: &str,
        take: Option<usize>,
    ) -> Result<Vec<LeafScan>> {
        let mut query = RowQuery::partition_prefix(format!("{scan_id}-"));
        query.take = take;
        self.leaf_table(storage_suffix).query(&query).await
    }

    /// Up to `take` leaf scans of an index scan in key order, starting
    /// strictly after the `(partition, row)` key of a previous chunk.
    pub async fn get_leaf_scans_chunk(
        &self,
        storage_suffix: &str,
        scan_id: &str,
        after: Option<&(String, String)>,
        take: usize,
    ) -> Result<Vec<LeafScan>> {
        let mut query =
            RowQuery::partition_prefix(format!("{scan_id}-")).with_take(take);
        if let Some((partition_key, row_key)) = after {
            query = query.after(partition_key.as_str(), row_key.as_str());
        }
        self.leaf_table(storage_suffix).query(&query).await
    }

    pub async fn leaf_scan_count_lower_bound(
        &self,
        storage_suffix: &str,
        scan_id: &str,
    ) -> Result<usize> {
        Ok(self
            .get_leaf_scans_for_scan(storage_suffix, scan_id, Some(1))
            .await?
            .len())
    }

    /// Insert the leaf scans whose URL is not stored yet for the page.
    pub async fn insert_missing_leaf_scans(
        &self,
        storage_suffix: &str,
        scan_id: &str,
        page_id: &str,
        leaf_scans: Vec<LeafScan>,
    ) -> Result<()> {
        let partition = LeafScan::partition_key_for(scan_id, page_id);
        let table = self.leaf_table(storage_suffix);
        let existing: HashSet<String> = table
            .query::<LeafScan>(&RowQuery::partition(partition))
            .await?
            .into_iter()
            .map(|leaf| leaf.url)
            .collect();

        let mut missing: Vec<LeafScan> = leaf_scans
            .into_iter()
            .filter(|leaf| !existing.contains(&leaf.url))
            .collect();
        debug!(scan_id, page_id, count = missing.len(), "inserting leaf scans");
        table.insert_many(&mut missing).await
    }

    pub async fn insert_leaf_scan(&self, leaf: &mut LeafScan) -> Result<()> {
        self.leaf_table(&leaf.storage_suffix).insert(leaf).await
    }

    pub async fn replace_leaf_scan(&self, leaf: &mut LeafScan) -> Result<()> {
        self.leaf_table(&leaf.storage_suffix).replace(leaf).await
    }

    /// Etag-guarded batch replace. All rows must share a partition.
    pub async fn replace_leaf_scans(
        &self,
        storage_suffix: &str,
        leaf_scans: &mut [LeafScan],
    ) -> Result<()> {
        ensure_single_partition(leaf_scans)?;
        self.leaf_table(storage_suffix).replace_many(leaf_scans).await
    }

    pub async fn delete_leaf_scan(&self, leaf: &LeafScan) -> Result<()> {
        self.leaf_table(&leaf.storage_suffix).delete_entity(leaf).await
    }

    /// Etag-guarded batch delete. All rows must share a partition.
    pub async fn delete_leaf_scans(
        &self,
        storage_suffix: &str,
        leaf_scans: &mut [LeafScan],
    ) -> Result<()> {
        ensure_single_partition(leaf_scans)?;
        self.leaf_table(storage_suffix).delete_many(leaf_scans).await
    }
}

fn ensure_single_partition<T: TableEntity>(entities: &[T]) -> Result<()> {
    let mut partitions = entities.iter().map(TableEntity::partition_key);
    if let Some(first) = partitions.next()
        && partitions.any(|pk| pk != first)
    {
        return Err(CatalogScanError::InvalidBatch(
            "leaf scans span more than one page".to_string(),
        ));
    }
    Ok(())
}

fn not_found_as_none<T>(result: Result<Option<T>>) -> Result<Option<T>> {
    match result {
        Err(CatalogScanError::TableNotFound(_)) => Ok(None),
        other => other,
    }
}
