use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    error::{CatalogScanError, Result},
    scan::ids::cursor_min,
    storage::{ETag, TableEntity, TableStore, TypedTable},
};

pub const CURSOR_TABLE: &str = "cursors";

/// Cursor owned by a driver's scans.
pub fn driver_cursor_name(driver: &str) -> String {
    format!("CatalogScan-{driver}")
}

/// A named watermark. Everything at or before `value` has been processed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CursorRecord {
    pub name: String,
    pub value: DateTime<Utc>,
    #[serde(skip)]
    pub etag: Option<ETag>,
}

impl TableEntity for CursorRecord {
    fn partition_key(&self) -> String {
        String::new()
    }

    fn row_key(&self) -> String {
        self.name.clone()
    }

    fn etag(&self) -> Option<&ETag> {
        self.etag.as_ref()
    }

    fn set_etag(&mut self, etag: Option<ETag>) {
        self.etag = etag;
    }
}

#[derive(Clone)]
pub struct CursorStorageService {
    table: TypedTable,
}

impl fmt::Debug for CursorStorageService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CursorStorageService")
            .field("table", &self.table.name())
            .finish()
    }
}

impl CursorStorageService {
    pub fn new(store: Arc<dyn TableStore>) -> Self {
        Self {
            table: TypedTable::new(store, CURSOR_TABLE),
        }
    }

    pub async fn initialize(&self) -> Result<()> {
        self.table.create_if_not_exists().await
    }

    /// Read the cursor, creating it at the absolute minimum when absent.
    pub async fn get_or_create(&self, name: &str) -> Result<CursorRecord> {
        if let Some(existing) = self.table.get("", name).await? {
            return Ok(existing);
        }

        let mut cursor = CursorRecord {
            name: name.to_string(),
            value: cursor_min(),
            etag: None,
        };
        match self.table.insert(&mut cursor).await {
            Ok(()) => Ok(cursor),
            Err(CatalogScanError::EntityAlreadyExists { .. }) => {
                self.table.get("", name).await?.ok_or_else(|| {
                    CatalogScanError::Internal(format!(
                        "cursor {name} vanished after a concurrent create"
                    ))
                })
            }
            Err(err) => Err(err),
        }
    }

    pub async fn get_value(&self, name: &str) -> Result<DateTime<Utc>> {
        Ok(self.get_or_create(name).await?.value)
    }

    /// Etag-guarded write of a cursor previously read. A write that would
    /// move the stored value backwards is rejected.
    pub async fn update(&self, cursor: &mut CursorRecord) -> Result<()> {
        if let Some(stored) = self.table.get::<CursorRecord>("", &cursor.name).await?
            && stored.value > cursor.value
        {
            return Err(CatalogScanError::InvalidArgument(format!(
                "cursor {} is at {} and cannot move back to {}",
                cursor.name, stored.value, cursor.value
            )));
        }
        self.table.replace(cursor).await
    }

    /// Move the cursor forward to `value`, retrying when a concurrent writer
    /// wins the etag race. Returns the previous value, or `None` when the
    /// cursor was already at or past `value`.
    pub async fn advance(
        &self,
        name: &str,
        value: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        loop {
            let mut cursor = self.get_or_create(name).await?;
            if cursor.value >= value {
                return Ok(None);
            }
            let previous = cursor.value;
            cursor.value = value;
            match self.table.replace(&mut cursor).await {
                Ok(()) => return Ok(Some(previous)),
                Err(CatalogScanError::PreconditionFailed { .. }) => {
                    debug!(cursor = %name, "cursor changed concurrently; re-reading");
                }
                Err(err) => return Err(err),
            }
        }
    }
}
