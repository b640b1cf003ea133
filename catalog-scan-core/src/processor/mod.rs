//! Message processors for the three scan levels.
//!
//! Each processor loads the stored record a message points at and advances
//! it. Messages carry keys only, so a duplicate or stale delivery finds the
//! record already moved on and does nothing harmful.

mod backoff;
mod index;
mod leaf;
mod page;

pub use backoff::{leaf_delay, leaf_delay_band, requeue_delay, total_attempts};
pub use index::IndexScanProcessor;
pub use leaf::{LeafBatchOutcome, LeafDelivery, LeafScanProcessor};
pub use page::PageScanProcessor;

use std::time::Duration;

use tracing::info;

use crate::{
    context::ScanContext,
    error::Result,
    queue::{LeafScanMessage, PageScanMessage, ScanMessage},
    scan::{LeafScan, PageScan},
};

pub(crate) async fn enqueue_leaf_scans(
    context: &ScanContext,
    leaves: &[LeafScan],
) -> Result<()> {
    if leaves.is_empty() {
        return Ok(());
    }
    info!(count = leaves.len(), "enqueuing leaf scans");
    let messages = leaves
        .iter()
        .map(|leaf| {
            ScanMessage::Leaf(LeafScanMessage {
                storage_suffix: leaf.storage_suffix.clone(),
                scan_id: leaf.scan_id.clone(),
                page_id: leaf.page_id.clone(),
                leaf_id: leaf.leaf_id.clone(),
            })
        })
        .collect();
    context.queue.enqueue(messages, Duration::ZERO).await
}

pub(crate) async fn enqueue_page_scans(
    context: &ScanContext,
    pages: &[PageScan],
) -> Result<()> {
    if pages.is_empty() {
        return Ok(());
    }
    info!(count = pages.len(), "enqueuing page scans");
    let messages = pages
        .iter()
        .map(|page| {
            ScanMessage::Page(PageScanMessage {
                storage_suffix: page.storage_suffix.clone(),
                scan_id: page.scan_id.clone(),
                page_id: page.page_id.clone(),
            })
        })
        .collect();
    context.queue.enqueue(messages, Duration::ZERO).await
}
