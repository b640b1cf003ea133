use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt,
    sync::Arc,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{
    ETag, MAX_BATCH_SIZE, RowQuery, TableOperation, TableRow, TableStore,
};
use crate::error::{CatalogScanError, Result};

#[derive(Clone, Debug)]
struct StoredRow {
    etag: ETag,
    timestamp: DateTime<Utc>,
    value: serde_json::Value,
}

type Table = BTreeMap<(String, String), StoredRow>;

#[derive(Debug, Default)]
struct StoreState {
    tables: HashMap<String, Table>,
    next_version: u64,
}

impl StoreState {
    fn next_etag(&mut self) -> ETag {
        self.next_version += 1;
        ETag(format!("W/\"{}\"", self.next_version))
    }
}

/// Process-local table store with the same conditional-write semantics as the
/// durable backend. Batches are validated in full before any row is touched,
/// so a failing batch leaves the table unchanged.
#[derive(Clone, Default)]
pub struct InMemoryTableStore {
    state: Arc<tokio::sync::Mutex<StoreState>>,
}

impl fmt::Debug for InMemoryTableStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("InMemoryTableStore");
        match self.state.try_lock() {
            Ok(state) => {
                let mut tables: Vec<_> = state
                    .tables
                    .iter()
                    .map(|(name, rows)| (name.clone(), rows.len()))
                    .collect();
                tables.sort();
                debug.field("tables", &tables);
            }
            Err(_) => {
                debug.field("state", &"<locked>");
            }
        }
        debug.finish()
    }
}

impl InMemoryTableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of the tables that currently exist, sorted.
    pub async fn table_names(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut names: Vec<_> = state.tables.keys().cloned().collect();
        names.sort();
        names
    }

    /// Total rows in a table, or `None` when the table is absent.
    pub async fn row_count(&self, table: &str) -> Option<usize> {
        let state = self.state.lock().await;
        state.tables.get(table).map(|rows| rows.len())
    }
}

fn not_found(table: &str, pk: &str, rk: &str) -> CatalogScanError {
    CatalogScanError::EntityNotFound {
        table: table.to_string(),
        partition_key: pk.to_string(),
        row_key: rk.to_string(),
    }
}

fn precondition_failed(table: &str, pk: &str, rk: &str) -> CatalogScanError {
    CatalogScanError::PreconditionFailed {
        table: table.to_string(),
        partition_key: pk.to_string(),
        row_key: rk.to_string(),
    }
}

fn validate_batch(
    table_name: &str,
    table: &Table,
    operations: &[TableOperation],
) -> Result<()> {
    if operations.len() > MAX_BATCH_SIZE {
        return Err(CatalogScanError::InvalidBatch(format!(
            "{} operations exceed the limit of {MAX_BATCH_SIZE}",
            operations.len()
        )));
    }

    let Some(first) = operations.first() else {
        return Ok(());
    };

    let mut seen = HashSet::new();
    for op in operations {
        if op.partition_key() != first.partition_key() {
            return Err(CatalogScanError::InvalidBatch(format!(
                "batch mixes partitions '{}' and '{}'",
                first.partition_key(),
                op.partition_key()
            )));
        }
        if !seen.insert(op.row_key()) {
            return Err(CatalogScanError::InvalidBatch(format!(
                "row '{}' appears more than once",
                op.row_key()
            )));
        }

        let key = (op.partition_key().to_string(), op.row_key().to_string());
        let existing = table.get(&key);
        match op {
            TableOperation::Insert {
                partition_key,
                row_key,
                ..
            } => {
                if existing.is_some() {
                    return Err(CatalogScanError::EntityAlreadyExists {
                        table: table_name.to_string(),
                        partition_key: partition_key.clone(),
                        row_key: row_key.clone(),
                    });
                }
            }
            TableOperation::Upsert { .. } => {}
            TableOperation::Replace {
                partition_key,
                row_key,
                etag,
                ..
            }
            | TableOperation::Delete {
                partition_key,
                row_key,
                etag,
            } => match existing {
                None => {
                    return Err(not_found(table_name, partition_key, row_key));
                }
                Some(row) => {
                    if etag.as_ref().is_some_and(|etag| *etag != row.etag) {
                        return Err(precondition_failed(
                            table_name,
                            partition_key,
                            row_key,
                        ));
                    }
                }
            },
        }
    }

    Ok(())
}

#[async_trait]
impl TableStore for InMemoryTableStore {
    async fn create_table(&self, table: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.tables.entry(table.to_string()).or_default();
        Ok(())
    }

    async fn delete_table(&self, table: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.tables.remove(table);
        Ok(())
    }

    async fn get(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
    ) -> Result<Option<TableRow>> {
        let state = self.state.lock().await;
        let rows = state
            .tables
            .get(table)
            .ok_or_else(|| CatalogScanError::TableNotFound(table.to_string()))?;

        Ok(rows
            .get(&(partition_key.to_string(), row_key.to_string()))
            .map(|row| TableRow {
                partition_key: partition_key.to_string(),
                row_key: row_key.to_string(),
                etag: row.etag.clone(),
                timestamp: row.timestamp,
                value: row.value.clone(),
            }))
    }

    async fn query(
        &self,
        table: &str,
        query: &RowQuery,
    ) -> Result<Vec<TableRow>> {
        let state = self.state.lock().await;
        let rows = state
            .tables
            .get(table)
            .ok_or_else(|| CatalogScanError::TableNotFound(table.to_string()))?;

        let matching = rows
            .iter()
            .filter(|((pk, rk), _)| query.matches(pk, rk))
            .map(|((pk, rk), row)| TableRow {
                partition_key: pk.clone(),
                row_key: rk.clone(),
                etag: row.etag.clone(),
                timestamp: row.timestamp,
                value: row.value.clone(),
            });

        Ok(match query.take {
            Some(take) => matching.take(take).collect(),
            None => matching.collect(),
        })
    }

    async fn submit(
        &self,
        table: &str,
        operations: Vec<TableOperation>,
    ) -> Result<Vec<Option<ETag>>> {
        let mut state = self.state.lock().await;
        {
            let rows = state.tables.get(table).ok_or_else(|| {
                CatalogScanError::TableNotFound(table.to_string())
            })?;
            validate_batch(table, rows, &operations)?;
        }

        let now = Utc::now();
        let mut etags = Vec::with_capacity(operations.len());
        for op in operations {
            match op {
                TableOperation::Insert {
                    partition_key,
                    row_key,
                    value,
                }
                | TableOperation::Upsert {
                    partition_key,
                    row_key,
                    value,
                }
                | TableOperation::Replace {
                    partition_key,
                    row_key,
                    value,
                    ..
                } => {
                    let etag = state.next_etag();
                    let row = StoredRow {
                        etag: etag.clone(),
                        timestamp: now,
                        value,
                    };
                    if let Some(rows) = state.tables.get_mut(table) {
                        rows.insert((partition_key, row_key), row);
                    }
                    etags.push(Some(etag));
                }
                TableOperation::Delete {
                    partition_key,
                    row_key,
                    ..
                } => {
                    if let Some(rows) = state.tables.get_mut(table) {
                        rows.remove(&(partition_key, row_key));
                    }
                    etags.push(None);
                }
            }
        }

        Ok(etags)
    }
}
