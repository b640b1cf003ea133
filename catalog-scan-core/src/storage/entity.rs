use std::{collections::BTreeMap, fmt, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Serialize, de::DeserializeOwned};

use super::{ETag, MAX_BATCH_SIZE, RowQuery, TableOperation, TableRow, TableStore};
use crate::error::Result;

/// A record that maps onto a single table row.
///
/// The etag and timestamp are owned by the store and must be skipped during
/// serialisation; [`TypedTable`] fills them in after every read and write.
pub trait TableEntity: Serialize + DeserializeOwned + Send + Sync {
    fn partition_key(&self) -> String;

    fn row_key(&self) -> String;

    fn etag(&self) -> Option<&ETag>;

    fn set_etag(&mut self, etag: Option<ETag>);

    fn set_timestamp(&mut self, _timestamp: DateTime<Utc>) {}
}

/// Typed view over one table of a [`TableStore`].
#[derive(Clone)]
pub struct TypedTable {
    store: Arc<dyn TableStore>,
    name: String,
}

impl fmt::Debug for TypedTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypedTable").field("name", &self.name).finish()
    }
}

impl TypedTable {
    pub fn new(store: Arc<dyn TableStore>, name: impl Into<String>) -> Self {
        Self {
            store,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn create_if_not_exists(&self) -> Result<()> {
        self.store.create_table(&self.name).await
    }

    pub async fn delete(&self) -> Result<()> {
        self.store.delete_table(&self.name).await
    }

    pub async fn get<T: TableEntity>(
        &self,
        partition_key: &str,
        row_key: &str,
    ) -> Result<Option<T>> {
        self.store
            .get(&self.name, partition_key, row_key)
            .await?
            .map(decode)
            .transpose()
    }

    pub async fn query<T: TableEntity>(
        &self,
        query: &RowQuery,
    ) -> Result<Vec<T>> {
        self.store
            .query(&self.name, query)
            .await?
            .into_iter()
            .map(decode)
            .collect()
    }

    pub async fn insert<T: TableEntity>(&self, entity: &mut T) -> Result<()> {
        let operation = TableOperation::Insert {
            partition_key: entity.partition_key(),
            row_key: entity.row_key(),
            value: serde_json::to_value(&*entity)?,
        };
        self.submit_one(entity, operation).await
    }

    pub async fn upsert<T: TableEntity>(&self, entity: &mut T) -> Result<()> {
        let operation = TableOperation::Upsert {
            partition_key: entity.partition_key(),
            row_key: entity.row_key(),
            value: serde_json::to_value(&*entity)?,
        };
        self.submit_one(entity, operation).await
    }

    /// Replace guarded by the entity's current etag.
    pub async fn replace<T: TableEntity>(&self, entity: &mut T) -> Result<()> {
        let operation = replace_operation(entity)?;
        self.submit_one(entity, operation).await
    }

    /// Delete guarded by the entity's current etag.
    pub async fn delete_entity<T: TableEntity>(&self, entity: &T) -> Result<()> {
        self.store
            .submit(&self.name, vec![delete_operation(entity)])
            .await?;
        Ok(())
    }

    pub async fn insert_many<T: TableEntity>(
        &self,
        entities: &mut [T],
    ) -> Result<()> {
        self.write_many(entities, |entity| {
            Ok(TableOperation::Insert {
                partition_key: entity.partition_key(),
                row_key: entity.row_key(),
                value: serde_json::to_value(entity)?,
            })
        })
        .await
    }

    pub async fn replace_many<T: TableEntity>(
        &self,
        entities: &mut [T],
    ) -> Result<()> {
        self.write_many(entities, replace_operation).await
    }

    pub async fn delete_many<T: TableEntity>(
        &self,
        entities: &mut [T],
    ) -> Result<()> {
        self.write_many(entities, |entity| Ok(delete_operation(entity)))
            .await
    }

    async fn submit_one<T: TableEntity>(
        &self,
        entity: &mut T,
        operation: TableOperation,
    ) -> Result<()> {
        let etags = self.store.submit(&self.name, vec![operation]).await?;
        entity.set_etag(etags.into_iter().next().flatten());
        entity.set_timestamp(Utc::now());
        Ok(())
    }

    /// Groups writes per partition and submits them in transactional chunks
    /// of at most [`MAX_BATCH_SIZE`]. Atomicity holds per chunk only.
    async fn write_many<T, F>(&self, entities: &mut [T], to_op: F) -> Result<()>
    where
        T: TableEntity,
        F: Fn(&T) -> Result<TableOperation>,
    {
        let mut by_partition: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (index, entity) in entities.iter().enumerate() {
            by_partition
                .entry(entity.partition_key())
                .or_default()
                .push(index);
        }

        for indices in by_partition.values() {
            for chunk in indices.chunks(MAX_BATCH_SIZE) {
                let operations = chunk
                    .iter()
                    .map(|&index| to_op(&entities[index]))
                    .collect::<Result<Vec<_>>>()?;
                let etags = self.store.submit(&self.name, operations).await?;
                let now = Utc::now();
                for (&index, etag) in chunk.iter().zip(etags) {
                    entities[index].set_etag(etag);
                    entities[index].set_timestamp(now);
                }
            }
        }

        Ok(())
    }
}

fn replace_operation<T: TableEntity>(entity: &T) -> Result<TableOperation> {
    Ok(TableOperation::Replace {
        partition_key: entity.partition_key(),
        row_key: entity.row_key(),
        value: serde_json::to_value(entity)?,
        etag: entity.etag().cloned(),
    })
}

fn delete_operation<T: TableEntity>(entity: &T) -> TableOperation {
    TableOperation::Delete {
        partition_key: entity.partition_key(),
        row_key: entity.row_key(),
        etag: entity.etag().cloned(),
    }
}

fn decode<T: TableEntity>(row: TableRow) -> Result<T> {
    let mut entity: T = serde_json::from_value(row.value)?;
    entity.set_etag(Some(row.etag));
    entity.set_timestamp(row.timestamp);
    Ok(entity)
}
