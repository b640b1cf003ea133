//! Scan start gating and the operator-facing entry points.
//!
//! Starting a scan is the only place where workers coordinate beyond etags:
//! a named lease serialises the decision so that at most one non-terminal
//! index scan exists per driver.

use std::{fmt, time::Duration};

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::{
    bucket::BucketRange,
    context::ScanContext,
    cursor::driver_cursor_name,
    error::{CatalogScanError, Result},
    events::ScanEvent,
    lease::Lease,
    queue::{IndexScanMessage, ScanMessage},
    registry::DriverName,
    scan::{
        IndexScan, IndexScanState,
        ids::{self, StorageId, cursor_min},
    },
    storage::TableEntity,
};

/// Result of a request to start a scan.
#[derive(Clone, Debug)]
pub enum UpdateOutcome {
    NewStarted(IndexScan),
    AlreadyStarted(IndexScan),
    Disabled,
    BlockedByDependency(DriverName),
    MinAfterMax,
    FullyCaughtUpWithMax,
    FullyCaughtUpWithDependency(DriverName),
    UnavailableLease,
}

impl UpdateOutcome {
    pub fn scan(&self) -> Option<&IndexScan> {
        match self {
            UpdateOutcome::NewStarted(scan) | UpdateOutcome::AlreadyStarted(scan) => {
                Some(scan)
            }
            _ => None,
        }
    }

    pub fn is_new_started(&self) -> bool {
        matches!(self, UpdateOutcome::NewStarted(_))
    }
}

/// Fields of an index scan about to be created.
struct NewScan<'a> {
    driver: DriverName,
    scan_id: String,
    storage_suffix: String,
    only_latest_leaves: bool,
    parent: Option<&'a IndexScan>,
    cursor_name: String,
    min: DateTime<Utc>,
    max: DateTime<Utc>,
    bucket_ranges: Option<String>,
    continue_update: bool,
}

#[derive(Clone)]
pub struct CatalogScanService {
    context: ScanContext,
}

impl fmt::Debug for CatalogScanService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CatalogScanService")
            .field("context", &self.context)
            .finish()
    }
}

impl CatalogScanService {
    pub fn new(context: ScanContext) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &ScanContext {
        &self.context
    }

    /// Start a scan for `driver` if its dependencies allow it.
    ///
    /// Without `max` the scan runs up to the slowest dependency. With
    /// `only_latest_leaves` unset the driver's declared support decides.
    pub async fn update(
        &self,
        driver: &str,
        max: Option<DateTime<Utc>>,
        only_latest_leaves: Option<bool>,
    ) -> Result<UpdateOutcome> {
        self.update_inner(driver, max, only_latest_leaves, false).await
    }

    /// Try to start every startable driver in topological order. Drivers
    /// started here trigger another pass when they complete.
    pub async fn update_all(
        &self,
        max: Option<DateTime<Utc>>,
    ) -> Result<Vec<(DriverName, UpdateOutcome)>> {
        let max = match max {
            Some(max) => max,
            None => self.source_max().await?.1,
        };

        let mut results = Vec::new();
        for driver in self.context.registry().startable_drivers() {
            let outcome = self
                .update_inner(driver.as_str(), Some(max), None, true)
                .await?;
            match &outcome {
                UpdateOutcome::NewStarted(scan) => info!(
                    driver = %driver,
                    scan_id = %scan.scan_id,
                    %max,
                    "started catalog scan"
                ),
                other => info!(
                    driver = %driver,
                    outcome = ?other,
                    "catalog scan did not start"
                ),
            }
            results.push((driver.clone(), outcome));
        }
        Ok(results)
    }

    async fn update_inner(
        &self,
        driver: &str,
        max: Option<DateTime<Utc>>,
        only_latest_leaves: Option<bool>,
        continue_update: bool,
    ) -> Result<UpdateOutcome> {
        let metadata = self.context.registry().get(driver)?;
        if metadata.internal {
            return Err(CatalogScanError::InvalidArgument(format!(
                "driver {driver} is internal and cannot be started directly"
            )));
        }
        let driver_name = metadata.name.clone();
        let only_latest_leaves = metadata
            .latest_leaf_support
            .resolve(only_latest_leaves)
            .ok_or_else(|| {
                CatalogScanError::InvalidArgument(format!(
                    "driver {driver} supports {:?}, which does not allow only_latest_leaves = {only_latest_leaves:?}",
                    metadata.latest_leaf_support
                ))
            })?;

        if let Some(outcome) = self.check_disabled_or_started(driver).await? {
            return Ok(outcome);
        }

        let cursor_name = driver_cursor_name(driver);
        let cursor = self.context.cursors.get_or_create(&cursor_name).await?;
        let mut used_default_min = true;
        let mut min = metadata.default_min.unwrap_or_else(cursor_min);
        if cursor.value > cursor_min() {
            min = cursor.value;
            used_default_min = false;
        }

        let (dependency, dependency_max) = self.dependency_max(driver).await?;
        if dependency_max <= cursor_min() {
            return Ok(UpdateOutcome::BlockedByDependency(dependency));
        }

        let took_dependency_max = max.is_none();
        let max = match max {
            None => dependency_max,
            Some(max) if max > dependency_max => {
                return Ok(UpdateOutcome::BlockedByDependency(dependency));
            }
            Some(max) => max,
        };

        if used_default_min && max < min {
            min = cursor_min();
        }
        if min > max {
            return Ok(UpdateOutcome::MinAfterMax);
        }
        if !took_dependency_max && min == max {
            return Ok(UpdateOutcome::FullyCaughtUpWithMax);
        }
        if min == dependency_max {
            return Ok(UpdateOutcome::FullyCaughtUpWithDependency(dependency));
        }

        let Some(lease) = self.acquire_start_lease(driver, None).await? else {
            return Ok(UpdateOutcome::UnavailableLease);
        };
        let outcome: Result<_> = async {
            if let Some(outcome) = self.check_disabled_or_started(driver).await? {
                return Ok(outcome);
            }
            let storage_id = StorageId::new(Utc::now());
            let scan = self
                .start_without_lease(NewScan {
                    driver: driver_name,
                    scan_id: storage_id.to_string(),
                    storage_suffix: storage_id.unique().to_string(),
                    only_latest_leaves,
                    parent: None,
                    cursor_name,
                    min,
                    max,
                    bucket_ranges: None,
                    continue_update,
                })
                .await?;
            Ok(UpdateOutcome::NewStarted(scan))
        }
        .await;
        self.release_lease(&lease).await;
        outcome
    }

    /// [`Self::update_buckets`] for range text such as `"0-99,250"`.
    pub async fn update_bucket_ranges(
        &self,
        driver: &str,
        ranges: &str,
    ) -> Result<UpdateOutcome> {
        let buckets = BucketRange::parse_buckets(ranges)?;
        self.update_buckets(driver, &buckets).await
    }

    /// Reprocess the given buckets of the bucketed package table. The scan
    /// is keyed by a fresh storage id.
    pub async fn update_buckets(
        &self,
        driver: &str,
        buckets: &[u16],
    ) -> Result<UpdateOutcome> {
        let storage_id = StorageId::new(Utc::now());
        let scan_id = ids::bucket_scan_id(&storage_id, buckets.len());
        self.update_buckets_with_id(&scan_id, storage_id.unique(), driver, buckets)
            .await
    }

    pub async fn update_buckets_with_id(
        &self,
        scan_id: &str,
        storage_suffix: &str,
        driver: &str,
        buckets: &[u16],
    ) -> Result<UpdateOutcome> {
        let metadata = self.context.registry().get(driver)?;
        if !metadata.bucket_range_support {
            return Err(CatalogScanError::InvalidArgument(format!(
                "driver {driver} does not support bucket range processing"
            )));
        }
        let driver_name = metadata.name.clone();
        let bucket_ranges = BucketRange::buckets_to_ranges(buckets.iter().copied())?
            .ok_or_else(|| {
                CatalogScanError::InvalidArgument(
                    "at least one bucket is required".to_string(),
                )
            })?;

        if let Some(existing) =
            self.context.storage.get_index_scan(driver, scan_id).await?
        {
            return Ok(UpdateOutcome::AlreadyStarted(existing));
        }

        if let Some(outcome) = self.check_disabled_or_started(driver).await? {
            return Ok(outcome);
        }

        let bucket_cursor_name =
            self.context.config.bucketed_package_cursor.as_deref().ok_or_else(
                || {
                    CatalogScanError::Configuration(
                        "bucket-range scans need bucketed_package_cursor".to_string(),
                    )
                },
            )?;
        let bucket_cursor = self
            .cursor_value(&DriverName::new(bucket_cursor_name))
            .await?;
        for dependency in self.context.registry().transitive_closure(driver)? {
            if bucket_cursor > self.cursor_value(&dependency).await? {
                return Ok(UpdateOutcome::BlockedByDependency(dependency));
            }
        }

        let Some(lease) = self.acquire_start_lease(driver, None).await? else {
            return Ok(UpdateOutcome::UnavailableLease);
        };
        let outcome: Result<_> = async {
            if let Some(outcome) = self.check_disabled_or_started(driver).await? {
                return Ok(outcome);
            }
            let scan = self
                .start_without_lease(NewScan {
                    driver: driver_name,
                    scan_id: scan_id.to_string(),
                    storage_suffix: storage_suffix.to_string(),
                    only_latest_leaves: true,
                    parent: None,
                    cursor_name: String::new(),
                    min: cursor_min(),
                    max: bucket_cursor,
                    bucket_ranges: Some(bucket_ranges),
                    continue_update: false,
                })
                .await?;
            Ok(UpdateOutcome::NewStarted(scan))
        }
        .await;
        self.release_lease(&lease).await;
        outcome
    }

    /// Return the find-latest helper of `parent`, starting it when absent.
    pub async fn get_or_start_find_latest(
        &self,
        parent: &IndexScan,
        helper_driver: &str,
    ) -> Result<IndexScan> {
        let helper_name = self.context.registry().get(helper_driver)?.name.clone();
        let scan_id = ids::find_latest_scan_id(&parent.scan_id);
        if let Some(existing) = self.context.storage.get_index_scan("", &scan_id).await?
        {
            return Ok(existing);
        }

        let lease = self
            .acquire_start_lease(helper_driver, Some(&parent.driver))
            .await?
            .ok_or_else(|| {
                CatalogScanError::InvalidState(format!(
                    "another worker is already starting find-latest scan {scan_id}"
                ))
            })?;
        let outcome: Result<_> = async {
            if let Some(existing) =
                self.context.storage.get_index_scan("", &scan_id).await?
            {
                return Ok(existing);
            }
            self.start_without_lease(NewScan {
                driver: helper_name,
                scan_id: scan_id.clone(),
                storage_suffix: ids::find_latest_storage_suffix(&parent.storage_suffix),
                only_latest_leaves: false,
                parent: Some(parent),
                cursor_name: String::new(),
                min: parent.min,
                max: parent.max,
                bucket_ranges: None,
                continue_update: false,
            })
            .await
        }
        .await;
        self.release_lease(&lease).await;
        outcome
    }

    /// Abort the newest non-terminal scan of `driver`. Child tables are
    /// dropped; the cursor keeps its value.
    pub async fn abort(&self, driver: &str) -> Result<Option<IndexScan>> {
        let Some(mut scan) = self.latest_incomplete_scan(driver).await? else {
            return Ok(None);
        };

        let helper_id = ids::find_latest_scan_id(&scan.scan_id);
        if let Some(helper) = self.context.storage.get_index_scan("", &helper_id).await?
        {
            self.release_scan_resources(&helper).await?;
            match self.context.storage.delete_index_scan(&helper).await {
                Ok(()) => {}
                Err(err) if err.is_conflict() => {}
                Err(err) => return Err(err),
            }
        }

        self.release_scan_resources(&scan).await?;
        scan.state = IndexScanState::Aborted;
        scan.completed = Some(Utc::now());
        self.context.storage.force_replace_index_scan(&mut scan).await?;

        warn!(driver = %scan.driver, scan_id = %scan.scan_id, "aborted catalog scan");
        self.context
            .publish(ScanEvent::ScanAborted {
                driver: scan.driver.clone(),
                scan_id: scan.scan_id.clone(),
            })
            .await;
        Ok(Some(scan))
    }

    pub async fn abort_all(&self) -> Result<Vec<IndexScan>> {
        let mut aborted = Vec::new();
        for driver in self.context.registry().startable_drivers() {
            if let Some(scan) = self.abort(driver.as_str()).await? {
                aborted.push(scan);
            }
        }
        Ok(aborted)
    }

    pub async fn get_cursor_value(&self, driver: &str) -> Result<DateTime<Utc>> {
        self.context.registry().get(driver)?;
        self.context
            .cursors
            .get_value(&driver_cursor_name(driver))
            .await
    }

    pub async fn get_latest_index_scans(
        &self,
        driver: &str,
        take: usize,
    ) -> Result<Vec<IndexScan>> {
        self.context.storage.get_latest_index_scans(driver, take).await
    }

    pub async fn get_index_scan(
        &self,
        driver: &str,
        scan_id: &str,
    ) -> Result<Option<IndexScan>> {
        if self.context.registry().get(driver)?.internal {
            return self.context.storage.get_index_scan("", scan_id).await;
        }
        self.context.storage.get_index_scan(driver, scan_id).await
    }

    /// The slowest direct dependency of `driver` and its cursor value.
    /// Drivers without dependencies follow the external cursors.
    pub async fn dependency_max(
        &self,
        driver: &str,
    ) -> Result<(DriverName, DateTime<Utc>)> {
        let dependencies = self.context.registry().dependencies(driver)?;
        if dependencies.is_empty() {
            return self.source_max().await;
        }

        let mut slowest: Option<(DriverName, DateTime<Utc>)> = None;
        for dependency in dependencies {
            let value = self.cursor_value(dependency).await?;
            if slowest.as_ref().is_none_or(|(_, current)| value < *current) {
                slowest = Some((dependency.clone(), value));
            }
        }
        slowest.ok_or_else(|| {
            CatalogScanError::Internal(format!("driver {driver} lost its dependencies"))
        })
    }

    /// The slowest external cursor.
    pub async fn source_max(&self) -> Result<(DriverName, DateTime<Utc>)> {
        let mut slowest: Option<(DriverName, DateTime<Utc>)> = None;
        for name in self.context.registry().external_cursors() {
            let value = self.cursor_value(name).await?;
            if slowest.as_ref().is_none_or(|(_, current)| value < *current) {
                slowest = Some((name.clone(), value));
            }
        }
        slowest.ok_or_else(|| {
            CatalogScanError::Configuration(
                "no external cursor is registered".to_string(),
            )
        })
    }

    async fn cursor_value(&self, name: &DriverName) -> Result<DateTime<Utc>> {
        if self.context.registry().is_external_cursor(name.as_str()) {
            return Ok(self.context.remote_cursors.get_cursor(name.as_str()).await?);
        }
        self.context
            .cursors
            .get_value(&driver_cursor_name(name.as_str()))
            .await
    }

    async fn check_disabled_or_started(
        &self,
        driver: &str,
    ) -> Result<Option<UpdateOutcome>> {
        if self.context.config.is_disabled(driver) {
            return Ok(Some(UpdateOutcome::Disabled));
        }
        Ok(self
            .latest_incomplete_scan(driver)
            .await?
            .map(UpdateOutcome::AlreadyStarted))
    }

    async fn latest_incomplete_scan(&self, driver: &str) -> Result<Option<IndexScan>> {
        Ok(self
            .context
            .storage
            .get_latest_index_scans(driver, self.context.config.latest_scans_to_check)
            .await?
            .into_iter()
            .find(|scan| !scan.state.is_terminal()))
    }

    async fn release_scan_resources(&self, scan: &IndexScan) -> Result<()> {
        let driver = self.context.drivers.index_driver(scan.driver.as_str())?;
        driver.finalize(scan).await?;
        if !scan.storage_suffix.is_empty() {
            self.context
                .storage
                .delete_child_tables(&scan.storage_suffix)
                .await?;
        }
        Ok(())
    }

    async fn acquire_start_lease(
        &self,
        driver: &str,
        parent_driver: Option<&DriverName>,
    ) -> Result<Option<Lease>> {
        let name = match parent_driver {
            Some(parent) => format!("Start-{driver}-{parent}"),
            None => format!("Start-{driver}"),
        };
        let lease = self
            .context
            .leases
            .try_acquire(&name, self.context.config.lease.start_lease_duration())
            .await?;
        if lease.is_none() {
            warn!(lease = %name, "start lease is held by another worker");
        }
        Ok(lease)
    }

    async fn release_lease(&self, lease: &Lease) {
        match self.context.leases.release(lease).await {
            Ok(true) => {}
            Ok(false) => warn!(lease = %lease.name, "start lease expired before release"),
            Err(err) => warn!(lease = %lease.name, "failed to release start lease: {err}"),
        }
    }

    /// Enqueue the first message, then insert the record. A message that
    /// arrives before the record retries until it appears.
    async fn start_without_lease(&self, new: NewScan<'_>) -> Result<IndexScan> {
        info!(
            driver = %new.driver,
            scan_id = %new.scan_id,
            min = %new.min,
            max = %new.max,
            "starting catalog index scan"
        );

        let message = IndexScanMessage {
            driver: new.driver.clone(),
            scan_id: new.scan_id.clone(),
            helper: new.parent.is_some(),
            attempt_count: 0,
        };
        self.context
            .queue
            .enqueue(vec![ScanMessage::Index(message)], Duration::ZERO)
            .await?;

        let mut scan = IndexScan {
            driver: new.driver,
            scan_id: new.scan_id,
            storage_suffix: new.storage_suffix,
            state: IndexScanState::Created,
            result: None,
            only_latest_leaves: new.only_latest_leaves,
            parent_driver: new.parent.map(|parent| parent.driver.clone()),
            parent_scan_id: new.parent.map(|parent| parent.scan_id.clone()),
            cursor_name: new.cursor_name,
            bucket_ranges: new.bucket_ranges,
            min: new.min,
            max: new.max,
            continue_update: new.continue_update,
            created: Utc::now(),
            started: None,
            completed: None,
            etag: None,
            timestamp: None,
        };

        match self.context.storage.insert_index_scan(&mut scan).await {
            Ok(()) => {}
            Err(CatalogScanError::EntityAlreadyExists { .. }) => {
                warn!(scan_id = %scan.scan_id, "index scan was already created");
                if let Some(existing) = self
                    .context
                    .storage
                    .get_index_scan(&scan.partition_key(), &scan.scan_id)
                    .await?
                {
                    scan = existing;
                }
            }
            Err(err) => return Err(err),
        }

        self.context
            .publish(ScanEvent::ScanStarted {
                driver: scan.driver.clone(),
                scan_id: scan.scan_id.clone(),
                min: scan.min,
                max: scan.max,
            })
            .await;
        Ok(scan)
    }
}
