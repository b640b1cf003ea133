//! Key-value table storage seam.
//!
//! Rows are addressed by `(partition key, row key)` and carry an opaque
//! version token. All cross-worker coordination happens through the
//! conditional operations exposed here: insert-if-absent,
//! replace-if-version-matches, delete-if-version-matches, and atomic batches
//! scoped to a single partition.

mod entity;
mod memory;

pub use entity::{TableEntity, TypedTable};
pub use memory::InMemoryTableStore;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Upper bound on operations in one transactional batch.
pub const MAX_BATCH_SIZE: usize = 100;

/// Opaque version token issued by the store on every write.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ETag(pub String);

impl fmt::Display for ETag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A stored row as returned by the backend.
#[derive(Clone, Debug)]
pub struct TableRow {
    pub partition_key: String,
    pub row_key: String,
    pub etag: ETag,
    /// Time of the last write to this row.
    pub timestamp: DateTime<Utc>,
    pub value: serde_json::Value,
}

/// A single write inside a batch.
#[derive(Clone, Debug)]
pub enum TableOperation {
    /// Fails with `EntityAlreadyExists` when the row is present.
    Insert {
        partition_key: String,
        row_key: String,
        value: serde_json::Value,
    },
    /// Insert or overwrite without any precondition.
    Upsert {
        partition_key: String,
        row_key: String,
        value: serde_json::Value,
    },
    /// Overwrite an existing row. With an etag the write only succeeds when
    /// the stored version still matches.
    Replace {
        partition_key: String,
        row_key: String,
        value: serde_json::Value,
        etag: Option<ETag>,
    },
    /// Remove an existing row, optionally guarded by an etag.
    Delete {
        partition_key: String,
        row_key: String,
        etag: Option<ETag>,
    },
}

impl TableOperation {
    pub fn partition_key(&self) -> &str {
        match self {
            TableOperation::Insert { partition_key, .. }
            | TableOperation::Upsert { partition_key, .. }
            | TableOperation::Replace { partition_key, .. }
            | TableOperation::Delete { partition_key, .. } => partition_key,
        }
    }

    pub fn row_key(&self) -> &str {
        match self {
            TableOperation::Insert { row_key, .. }
            | TableOperation::Upsert { row_key, .. }
            | TableOperation::Replace { row_key, .. }
            | TableOperation::Delete { row_key, .. } => row_key,
        }
    }
}

/// Which partitions a query touches.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PartitionFilter {
    Exact(String),
    Prefix(String),
    All,
}

/// Ordered range query. Rows come back sorted by `(partition, row)` using
/// ordinal string comparison.
#[derive(Clone, Debug)]
pub struct RowQuery {
    pub partition: PartitionFilter,
    /// Inclusive lower bound on the row key.
    pub row_min: Option<String>,
    /// Inclusive upper bound on the row key.
    pub row_max: Option<String>,
    /// Continuation: only rows strictly after this `(partition, row)` key.
    pub after: Option<(String, String)>,
    pub take: Option<usize>,
}

impl RowQuery {
    pub fn partition(partition_key: impl Into<String>) -> Self {
        Self {
            partition: PartitionFilter::Exact(partition_key.into()),
            row_min: None,
            row_max: None,
            after: None,
            take: None,
        }
    }

    pub fn partition_prefix(prefix: impl Into<String>) -> Self {
        Self {
            partition: PartitionFilter::Prefix(prefix.into()),
            row_min: None,
            row_max: None,
            after: None,
            take: None,
        }
    }

    pub fn all() -> Self {
        Self {
            partition: PartitionFilter::All,
            row_min: None,
            row_max: None,
            after: None,
            take: None,
        }
    }

    pub fn with_row_range(
        mut self,
        min: impl Into<String>,
        max: impl Into<String>,
    ) -> Self {
        self.row_min = Some(min.into());
        self.row_max = Some(max.into());
        self
    }

    pub fn after(
        mut self,
        partition_key: impl Into<String>,
        row_key: impl Into<String>,
    ) -> Self {
        self.after = Some((partition_key.into(), row_key.into()));
        self
    }

    pub fn with_take(mut self, take: usize) -> Self {
        self.take = Some(take);
        self
    }

    pub fn matches(&self, partition_key: &str, row_key: &str) -> bool {
        let partition_ok = match &self.partition {
            PartitionFilter::Exact(pk) => pk == partition_key,
            PartitionFilter::Prefix(prefix) => {
                partition_key.starts_with(prefix.as_str())
            }
            PartitionFilter::All => true,
        };

        partition_ok
            && self.row_min.as_deref().is_none_or(|min| row_key >= min)
            && self.row_max.as_deref().is_none_or(|max| row_key <= max)
            && self.after.as_ref().is_none_or(|(pk, rk)| {
                (partition_key, row_key) > (pk.as_str(), rk.as_str())
            })
    }
}

/// Abstracts the durable table backend shared by every worker.
#[async_trait]
pub trait TableStore: Send + Sync {
    /// Create the table when it does not exist yet.
    async fn create_table(&self, table: &str) -> Result<()>;

    /// Delete the table and all of its rows. Missing tables are ignored.
    async fn delete_table(&self, table: &str) -> Result<()>;

    /// Point read. Fails with `TableNotFound` when the table is absent.
    async fn get(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
    ) -> Result<Option<TableRow>>;

    /// Ordered range read. Fails with `TableNotFound` when the table is
    /// absent.
    async fn query(&self, table: &str, query: &RowQuery)
    -> Result<Vec<TableRow>>;

    /// Apply all operations atomically. Every operation must target the same
    /// partition and the batch may hold at most [`MAX_BATCH_SIZE`]
    /// operations. Returns the new etag per operation (`None` for deletes).
    async fn submit(
        &self,
        table: &str,
        operations: Vec<TableOperation>,
    ) -> Result<Vec<Option<ETag>>>;
}
