use serde::{Deserialize, Serialize};

use crate::registry::DriverName;

/// Points at an index scan record. Helper scans live in the empty partition.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct IndexScanMessage {
    pub driver: DriverName,
    pub scan_id: String,
    pub helper: bool,
    #[serde(default)]
    pub attempt_count: u32,
}

impl IndexScanMessage {
    pub fn partition_key(&self) -> &str {
        if self.helper { "" } else { self.driver.as_str() }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PageScanMessage {
    pub storage_suffix: String,
    pub scan_id: String,
    pub page_id: String,
}

#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct LeafScanMessage {
    pub storage_suffix: String,
    pub scan_id: String,
    pub page_id: String,
    pub leaf_id: String,
}

/// Everything that travels through the work queue. Messages only carry keys;
/// the stored records hold all mutable state.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScanMessage {
    Index(IndexScanMessage),
    Page(PageScanMessage),
    Leaf(LeafScanMessage),
}

impl ScanMessage {
    /// Scan the message contributes to.
    pub fn scan_id(&self) -> &str {
        match self {
            ScanMessage::Index(m) => &m.scan_id,
            ScanMessage::Page(m) => &m.scan_id,
            ScanMessage::Leaf(m) => &m.scan_id,
        }
    }
}

impl From<IndexScanMessage> for ScanMessage {
    fn from(value: IndexScanMessage) -> Self {
        ScanMessage::Index(value)
    }
}

impl From<PageScanMessage> for ScanMessage {
    fn from(value: PageScanMessage) -> Self {
        ScanMessage::Page(value)
    }
}

impl From<LeafScanMessage> for ScanMessage {
    fn from(value: LeafScanMessage) -> Self {
        ScanMessage::Leaf(value)
    }
}
