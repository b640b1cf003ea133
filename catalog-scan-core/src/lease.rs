//! Named, time-bounded exclusive leases.

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::{
    error::{CatalogScanError, Result},
    storage::{ETag, TableEntity, TableStore, TypedTable},
};

pub const LEASE_TABLE: &str = "leases";

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct LeaseId(pub Uuid);

impl Default for LeaseId {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaseId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

/// A held lease. Holding it past `expires_at` guarantees nothing.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Lease {
    pub name: String,
    pub lease_id: LeaseId,
    pub expires_at: DateTime<Utc>,
    #[serde(skip)]
    pub etag: Option<ETag>,
}

impl TableEntity for Lease {
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

#[async_trait]
pub trait LeaseService: Send + Sync {
    /// Create whatever backing storage the leases need.
    async fn initialize(&self) -> Result<()>;

    /// Take the lease when it is free or expired. `None` when another holder
    /// owns it.
    async fn try_acquire(
        &self,
        name: &str,
        duration: Duration,
    ) -> Result<Option<Lease>>;

    /// Give the lease back. Returns false when it was lost in the meantime.
    async fn release(&self, lease: &Lease) -> Result<bool>;
}

/// Lease service backed by rows in a table store.
#[derive(Clone)]
pub struct TableLeaseService {
    table: TypedTable,
}

impl fmt::Debug for TableLeaseService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableLeaseService")
            .field("table", &self.table.name())
            .finish()
    }
}

impl TableLeaseService {
    pub fn new(store: Arc<dyn TableStore>) -> Self {
        Self {
            table: TypedTable::new(store, LEASE_TABLE),
        }
    }
}

fn lost_race(err: &CatalogScanError) -> bool {
    err.is_conflict()
        || matches!(err, CatalogScanError::EntityAlreadyExists { .. })
}

#[async_trait]
impl LeaseService for TableLeaseService {
    async fn initialize(&self) -> Result<()> {
        self.table.create_if_not_exists().await
    }

    async fn try_acquire(
        &self,
        name: &str,
        duration: Duration,
    ) -> Result<Option<Lease>> {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(duration).map_err(|err| {
            CatalogScanError::InvalidArgument(format!(
                "lease duration {duration:?}: {err}"
            ))
        })?;

        let existing: Option<Lease> = self.table.get("", name).await?;
        let mut lease = Lease {
            name: name.to_string(),
            lease_id: LeaseId::new(),
            expires_at: now + ttl,
            etag: None,
        };

        let written = match existing {
            None => self.table.insert(&mut lease).await,
            Some(held) if held.expires_at > now => {
                debug!(lease = name, "lease is held by another worker");
                return Ok(None);
            }
            Some(expired) => {
                lease.etag = expired.etag;
                self.table.replace(&mut lease).await
            }
        };

        match written {
            Ok(()) => Ok(Some(lease)),
            Err(err) if lost_race(&err) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn release(&self, lease: &Lease) -> Result<bool> {
        let Some(current) = self.table.get::<Lease>("", &lease.name).await?
        else {
            return Ok(false);
        };
        if current.lease_id != lease.lease_id {
            return Ok(false);
        }
        match self.table.delete_entity(&current).await {
            Ok(()) => Ok(true),
            Err(err) if err.is_conflict() => Ok(false),
            Err(err) => Err(err),
        }
    }
}
