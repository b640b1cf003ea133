#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use catalog_scan_core::{
    CatalogScanConfig, CatalogScanService, DriverMetadata, DriverRegistry,
    InProcScanEventBus, ScanContext, ScanWorker,
    bucket::BucketedPackageSource,
    catalog::{
        CatalogClient, CatalogIndex, CatalogLeafItem, CatalogPage,
        CatalogPageItem, LeafType, RemoteCursorClient,
    },
    cursor::CursorStorageService,
    driver::{
        BatchLeafDriver, CatalogScanDriver, DriverFactory, DriverFactoryBuilder,
        LeafBatchResult, LeafDriver, LeafOutcome, SingleLeafDriver,
    },
    lease::TableLeaseService,
    queue::InMemoryMessageQueue,
    registry::{LatestLeafSupport, LeafRuntime},
    scan::{IndexScan, IndexScanResult, LeafScan, PageScan, PageScanResult, ScanStorage},
    storage::{InMemoryTableStore, TableStore},
};
use chrono::{DateTime, TimeZone, Utc};

/// External cursor of the remote catalog.
pub const CATALOG: &str = "CatalogCursor";
/// External cursor of the bucketed package table.
pub const BUCKETS: &str = "BucketedPackages";
/// All-leaves batch driver reading straight from the catalog.
pub const LOAD: &str = "LoadPackageArchive";
/// Latest-leaves single-leaf driver that also supports bucket ranges.
pub const LATEST: &str = "PackageVersionToCsv";
/// Index-only driver downstream of [`LOAD`].
pub const DOWNSTREAM: &str = "PackageArchiveToCsv";

pub const PAGE_0: &str = "https://catalog.test/page0.json";
pub const PAGE_1: &str = "https://catalog.test/page1.json";

pub fn at(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
        + chrono::Duration::minutes(i64::from(minute))
}

pub fn leaf(url: &str, minute: u32, id: &str, version: &str) -> CatalogLeafItem {
    CatalogLeafItem {
        url: url.to_string(),
        leaf_type: LeafType::PackageDetails,
        commit_id: format!("commit-{minute}"),
        commit_timestamp: at(minute),
        package_id: id.to_string(),
        package_version: version.to_string(),
    }
}

/// Two pages, five leaves. `PkgA 1.0.0` is edited twice across pages.
pub fn sample_catalog() -> FakeCatalog {
    let page0 = CatalogPage {
        url: PAGE_0.to_string(),
        items: vec![
            leaf("a-1.0.0-first", 2, "PkgA", "1.0.0"),
            leaf("b-1.0.0", 5, "PkgB", "1.0.0"),
            leaf("a-2.0.0", 9, "PkgA", "2.0.0"),
        ],
    };
    let page1 = CatalogPage {
        url: PAGE_1.to_string(),
        items: vec![
            leaf("a-1.0.0-second", 12, "pkga", "1.0.0"),
            leaf("c-1.0.0", 18, "PkgC", "1.0.0"),
        ],
    };
    FakeCatalog::new(vec![(at(10), page0), (at(20), page1)])
}

pub fn all_leaf_urls() -> HashSet<String> {
    ["a-1.0.0-first", "b-1.0.0", "a-2.0.0", "a-1.0.0-second", "c-1.0.0"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

pub fn latest_leaf_urls() -> HashSet<String> {
    ["b-1.0.0", "a-2.0.0", "a-1.0.0-second", "c-1.0.0"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

/// Catalog served from memory.
#[derive(Debug)]
pub struct FakeCatalog {
    index: CatalogIndex,
    pages: HashMap<String, CatalogPage>,
}

impl FakeCatalog {
    pub fn new(pages: Vec<(DateTime<Utc>, CatalogPage)>) -> Self {
        let items = pages
            .iter()
            .map(|(commit_timestamp, page)| CatalogPageItem {
                url: page.url.clone(),
                commit_id: format!("page-{}", page.url),
                commit_timestamp: *commit_timestamp,
                count: page.items.len(),
            })
            .collect();
        let commit_timestamp = pages
            .iter()
            .map(|(timestamp, _)| *timestamp)
            .max()
            .unwrap_or_else(Utc::now);
        Self {
            index: CatalogIndex {
                commit_timestamp,
                items,
            },
            pages: pages
                .into_iter()
                .map(|(_, page)| (page.url.clone(), page))
                .collect(),
        }
    }
}

#[async_trait]
impl CatalogClient for FakeCatalog {
    async fn get_catalog_index(&self) -> anyhow::Result<CatalogIndex> {
        Ok(self.index.clone())
    }

    async fn get_catalog_page(&self, url: &str) -> anyhow::Result<CatalogPage> {
        self.pages
            .get(url)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown catalog page {url}"))
    }
}

#[derive(Debug, Default)]
pub struct FakeRemoteCursors {
    values: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl FakeRemoteCursors {
    pub fn set(&self, name: &str, value: DateTime<Utc>) {
        self.values
            .lock()
            .unwrap()
            .insert(name.to_string(), value);
    }
}

#[async_trait]
impl RemoteCursorClient for FakeRemoteCursors {
    async fn get_cursor(&self, name: &str) -> anyhow::Result<DateTime<Utc>> {
        self.values
            .lock()
            .unwrap()
            .get(name)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("unknown remote cursor {name}"))
    }
}

/// Every bucket holds one package named after the bucket.
#[derive(Debug, Default)]
pub struct FakeBuckets;

#[async_trait]
impl BucketedPackageSource for FakeBuckets {
    async fn packages_in_bucket(
        &self,
        bucket: u16,
    ) -> anyhow::Result<Vec<CatalogLeafItem>> {
        Ok(vec![leaf(
            &format!("bucket-{bucket}"),
            15,
            &format!("Bucket{bucket}"),
            "1.0.0",
        )])
    }
}

/// Test driver that records what it processed.
#[derive(Debug)]
pub struct RecordingDriver {
    result: IndexScanResult,
    failing: HashSet<String>,
    leaves: Mutex<Vec<LeafScan>>,
    finalized: AtomicUsize,
}

impl RecordingDriver {
    pub fn new(result: IndexScanResult) -> Self {
        Self {
            result,
            failing: HashSet::new(),
            leaves: Mutex::new(Vec::new()),
            finalized: AtomicUsize::new(0),
        }
    }

    /// Leaves with this URL fail on every attempt.
    pub fn failing(mut self, url: &str) -> Self {
        self.failing.insert(url.to_string());
        self
    }

    pub fn processed_urls(&self) -> HashSet<String> {
        self.leaves
            .lock()
            .unwrap()
            .iter()
            .map(|leaf| leaf.url.clone())
            .collect()
    }

    pub fn processed(&self) -> Vec<LeafScan> {
        self.leaves.lock().unwrap().clone()
    }

    pub fn finalized(&self) -> usize {
        self.finalized.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CatalogScanDriver for RecordingDriver {
    async fn initialize(&self, _scan: &IndexScan) -> anyhow::Result<()> {
        Ok(())
    }

    async fn process_index(&self, _scan: &IndexScan) -> anyhow::Result<IndexScanResult> {
        Ok(self.result)
    }

    async fn process_page(&self, _page: &PageScan) -> anyhow::Result<PageScanResult> {
        Ok(PageScanResult::ExpandRemoveDuplicates)
    }

    async fn start_aggregate(&self, _scan: &IndexScan) -> anyhow::Result<()> {
        Ok(())
    }

    async fn is_aggregate_complete(&self, _scan: &IndexScan) -> anyhow::Result<bool> {
        Ok(true)
    }

    async fn finalize(&self, _scan: &IndexScan) -> anyhow::Result<()> {
        self.finalized.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl BatchLeafDriver for RecordingDriver {
    async fn process_leaves(&self, leaves: &[LeafScan]) -> anyhow::Result<LeafBatchResult> {
        let mut result = LeafBatchResult::success();
        for leaf in leaves {
            if self.failing.contains(&leaf.url) {
                result.failed.push(leaf.leaf_id.clone());
            } else {
                self.leaves.lock().unwrap().push(leaf.clone());
            }
        }
        Ok(result)
    }
}

#[async_trait]
impl SingleLeafDriver for RecordingDriver {
    async fn process_leaf(&self, leaf: &LeafScan) -> anyhow::Result<LeafOutcome> {
        if self.failing.contains(&leaf.url) {
            anyhow::bail!("leaf {} is broken", leaf.url);
        }
        self.leaves.lock().unwrap().push(leaf.clone());
        Ok(LeafOutcome::Success)
    }
}

/// Zero leaf backoff so retries run inside one drain. Index polls keep
/// their delay and only run after [`Harness::release`].
pub fn test_config() -> CatalogScanConfig {
    let mut config = CatalogScanConfig::default();
    config.backoff.first_attempt_max_ms = 0;
    config.backoff.increment_ms = 0;
    config.bucketed_package_cursor = Some(BUCKETS.to_string());
    config
}

pub fn standard_registry() -> DriverRegistry {
    DriverRegistry::builder()
        .external_cursor(CATALOG)
        .external_cursor(BUCKETS)
        .driver(DriverMetadata::new(LOAD).depends_on(CATALOG))
        .driver(
            DriverMetadata::new(LATEST)
                .depends_on(CATALOG)
                .latest_leaves(LatestLeafSupport::LatestLeavesOnly)
                .bucket_ranges(true)
                .runtime(LeafRuntime::SingleLeaf),
        )
        .driver(DriverMetadata::new(DOWNSTREAM).depends_on(LOAD))
        .build()
        .expect("registry should be valid")
}

/// The standard drivers, kept so tests can inspect them.
#[derive(Debug, Clone)]
pub struct StandardDrivers {
    pub load: Arc<RecordingDriver>,
    pub latest: Arc<RecordingDriver>,
    pub downstream: Arc<RecordingDriver>,
}

impl StandardDrivers {
    pub fn new() -> Self {
        Self {
            load: Arc::new(RecordingDriver::new(IndexScanResult::ExpandAllLeaves)),
            latest: Arc::new(RecordingDriver::new(IndexScanResult::ExpandLatestLeaves)),
            downstream: Arc::new(RecordingDriver::new(IndexScanResult::Processed)),
        }
    }

    pub fn register(&self, builder: DriverFactoryBuilder) -> DriverFactoryBuilder {
        builder
            .driver(
                LOAD,
                self.load.clone(),
                LeafDriver::Batch(self.load.clone()),
            )
            .driver(
                LATEST,
                self.latest.clone(),
                LeafDriver::Single(self.latest.clone()),
            )
            .index_driver(DOWNSTREAM, self.downstream.clone())
    }
}

pub struct Harness {
    pub context: ScanContext,
    pub store: Arc<InMemoryTableStore>,
    pub queue: Arc<InMemoryMessageQueue>,
    pub remote: Arc<FakeRemoteCursors>,
    pub events: Arc<InProcScanEventBus>,
    pub worker: Arc<ScanWorker>,
}

impl Harness {
    pub async fn standard() -> (Self, StandardDrivers) {
        Self::standard_with(test_config()).await
    }

    pub async fn standard_with(config: CatalogScanConfig) -> (Self, StandardDrivers) {
        let drivers = StandardDrivers::new();
        let registered = drivers.clone();
        let harness = Self::build(
            config,
            standard_registry(),
            Arc::new(sample_catalog()),
            move |builder, _| registered.register(builder),
        )
        .await;
        (harness, drivers)
    }

    pub async fn build(
        config: CatalogScanConfig,
        registry: DriverRegistry,
        catalog: Arc<dyn CatalogClient>,
        register: impl FnOnce(DriverFactoryBuilder, &ScanStorage) -> DriverFactoryBuilder,
    ) -> Self {
        let store = Arc::new(InMemoryTableStore::new());
        let table_store: Arc<dyn TableStore> = store.clone();
        let storage = ScanStorage::new(Arc::clone(&table_store));

        let builder = DriverFactory::builder(Arc::new(registry));
        let drivers = register(builder, &storage)
            .build(storage.clone(), Arc::clone(&catalog))
            .expect("drivers should match the registry");

        let queue = Arc::new(InMemoryMessageQueue::new(Duration::from_secs(300)));
        let remote = Arc::new(FakeRemoteCursors::default());
        remote.set(CATALOG, at(20));
        remote.set(BUCKETS, at(20));
        let events = Arc::new(InProcScanEventBus::new(1024));

        let context = ScanContext {
            config: Arc::new(config),
            drivers: Arc::new(drivers),
            storage,
            cursors: CursorStorageService::new(Arc::clone(&table_store)),
            leases: Arc::new(TableLeaseService::new(Arc::clone(&table_store))),
            queue: queue.clone(),
            catalog,
            remote_cursors: remote.clone(),
            buckets: Some(Arc::new(FakeBuckets)),
            observer: events.clone(),
        };
        context.initialize().await.expect("scan tables");

        let worker = Arc::new(ScanWorker::new(context.clone()));
        Self {
            context,
            store,
            queue,
            remote,
            events,
            worker,
        }
    }

    pub fn service(&self) -> &CatalogScanService {
        self.worker.service()
    }

    /// Make delayed messages visible.
    pub async fn release(&self) {
        self.queue.release_delayed().await;
    }

    /// Drain, release delayed messages and repeat until the queue is empty
    /// or `rounds` runs out.
    pub async fn run_to_quiescence(&self, rounds: usize) {
        for _ in 0..rounds {
            self.worker.drain().await.expect("worker drain");
            if self.queue.is_empty().await {
                return;
            }
            self.release().await;
        }
    }

    pub async fn index_scan(&self, driver: &str, scan_id: &str) -> IndexScan {
        self.service()
            .get_index_scan(driver, scan_id)
            .await
            .expect("index scan lookup")
            .expect("index scan should exist")
    }

    pub async fn has_table(&self, name: &str) -> bool {
        self.store.table_names().await.iter().any(|table| table == name)
    }
}
