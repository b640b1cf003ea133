use std::fmt;

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Seconds between 0001-01-01T00:00:00Z and the Unix epoch.
const SECONDS_BEFORE_UNIX_EPOCH: i64 = 62_135_596_800;

/// The absolute minimum cursor value, `0001-01-01T00:00:00Z`.
pub fn cursor_min() -> DateTime<Utc> {
    DateTime::from_timestamp(-SECONDS_BEFORE_UNIX_EPOCH, 0)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// 100ns ticks elapsed since `0001-01-01T00:00:00Z`.
fn ticks(at: DateTime<Utc>) -> i64 {
    let seconds = at.timestamp().saturating_add(SECONDS_BEFORE_UNIX_EPOCH);
    seconds
        .saturating_mul(10_000_000)
        .saturating_add(i64::from(at.timestamp_subsec_nanos() / 100))
}

/// Fixed-width id that sorts newest first under ordinal comparison.
pub fn descending_id(at: DateTime<Utc>) -> String {
    format!("{:020}", i64::MAX - ticks(at).max(0))
}

/// Identity of a new index scan: a time-descending prefix plus a unique
/// component that doubles as the storage suffix for its child tables.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StorageId {
    sequence: String,
    unique: String,
}

impl StorageId {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self {
            sequence: descending_id(at),
            unique: Uuid::new_v4().simple().to_string(),
        }
    }

    pub fn sequence(&self) -> &str {
        &self.sequence
    }

    pub fn unique(&self) -> &str {
        &self.unique
    }
}

impl fmt::Display for StorageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.sequence, self.unique)
    }
}

pub fn page_id(rank: usize) -> String {
    format!("P{rank:010}")
}

pub fn leaf_id(rank: usize) -> String {
    format!("L{rank:010}")
}

/// Page id used for the leaves of one bucket in a bucket-range scan.
pub fn bucket_page_id(bucket: u16) -> String {
    format!("B{bucket:03}")
}

pub fn find_latest_scan_id(parent_scan_id: &str) -> String {
    format!("{parent_scan_id}-fl")
}

pub fn find_latest_storage_suffix(parent_suffix: &str) -> String {
    format!("{parent_suffix}fl")
}

pub fn bucket_scan_id(storage_id: &StorageId, bucket_count: usize) -> String {
    format!("{storage_id}-r{bucket_count}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn newer_ids_sort_first() {
        let older = Utc::now();
        let newer = older + Duration::milliseconds(1);
        let (a, b) = (descending_id(older), descending_id(newer));
        assert_eq!(a.len(), 20);
        assert!(b < a);
    }

    #[test]
    fn cursor_min_is_year_one() {
        assert_eq!(cursor_min().to_rfc3339(), "0001-01-01T00:00:00+00:00");
        assert_eq!(ticks(cursor_min()), 0);
    }

    #[test]
    fn ranks_are_zero_padded() {
        assert_eq!(page_id(7), "P0000000007");
        assert_eq!(leaf_id(12345), "L0000012345");
        assert_eq!(bucket_page_id(5), "B005");
    }
}
