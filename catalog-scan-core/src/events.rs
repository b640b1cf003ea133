use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::Result,
    queue::LeafScanMessage,
    registry::DriverName,
    scan::IndexScanState,
};

// Notifications emitted as scans move through the pipeline. They mirror what
// is already persisted; nothing depends on them being delivered.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ScanEvent {
    ScanStarted {
        driver: DriverName,
        scan_id: String,
        min: DateTime<Utc>,
        max: DateTime<Utc>,
    },
    IndexStateChanged {
        driver: DriverName,
        scan_id: String,
        from: IndexScanState,
        to: IndexScanState,
    },
    CursorAdvanced {
        name: String,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    },
    LeafBatchProcessed {
        driver: Option<DriverName>,
        completed: usize,
        failed: usize,
        try_again_later: usize,
        no_matching_scan: usize,
        poison: usize,
    },
    LeafPoisoned {
        message: LeafScanMessage,
        attempt_count: u32,
    },
    ScanAborted {
        driver: DriverName,
        scan_id: String,
    },
}

#[async_trait]
pub trait ScanObserver: Send + Sync {
    async fn publish(&self, event: ScanEvent) -> Result<()>;
}

/// Observer that drops every event.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopObserver;

#[async_trait]
impl ScanObserver for NoopObserver {
    async fn publish(&self, _event: ScanEvent) -> Result<()> {
        Ok(())
    }
}
