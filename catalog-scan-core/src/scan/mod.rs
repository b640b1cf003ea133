//! Scan records and their storage.
//!
//! A scan is a tree: one [`IndexScan`] per driver run, fanned out into
//! [`PageScan`]s per catalog page and [`LeafScan`]s per catalog leaf. Every
//! level is persisted before messages for it are enqueued, so a worker can
//! resume from any stored state.

pub mod ids;
mod model;
mod storage;

pub use model::{
    IndexScan, IndexScanResult, IndexScanState, LeafParent, LeafScan,
    PageScan, PageScanResult, PageScanState,
};
pub use storage::{
    INDEX_SCAN_TABLE, ScanStorage, leaf_scan_table, page_scan_table,
};
