mod support;

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use catalog_scan_core::{
    DriverMetadata, DriverRegistry,
    catalog::{CatalogClient, CatalogIndex, CatalogPage},
    driver::{CatalogScanDriver, LeafDriver},
    events::ScanEvent,
    queue::ScanMessage,
    scan::{
        IndexScan, IndexScanResult, IndexScanState, PageScan, PageScanResult,
        ScanStorage,
    },
};
use chrono::Utc;
use mockall::mock;
use support::{
    CATALOG, Harness, LOAD, RecordingDriver, StandardDrivers, all_leaf_urls,
    sample_catalog, standard_registry, test_config,
};

fn load_only_registry() -> DriverRegistry {
    DriverRegistry::builder()
        .external_cursor(CATALOG)
        .driver(DriverMetadata::new(LOAD).depends_on(CATALOG))
        .build()
        .unwrap()
}

#[tokio::test]
async fn leaf_that_keeps_failing_is_poisoned() {
    let drivers = StandardDrivers {
        load: Arc::new(
            RecordingDriver::new(IndexScanResult::ExpandAllLeaves).failing("b-1.0.0"),
        ),
        ..StandardDrivers::new()
    };
    let registered = drivers.clone();
    let harness = Harness::build(
        test_config(),
        standard_registry(),
        Arc::new(sample_catalog()),
        move |builder, _| registered.register(builder),
    )
    .await;
    let mut events = harness.events.subscribe();

    let outcome = harness.service().update(LOAD, None, None).await.unwrap();
    let scan = outcome.scan().unwrap().clone();

    harness.run_to_quiescence(10).await;

    let mut expected = all_leaf_urls();
    expected.remove("b-1.0.0");
    assert_eq!(drivers.load.processed_urls(), expected);

    let remaining = harness
        .context
        .storage
        .get_leaf_scans_for_scan(&scan.storage_suffix, &scan.scan_id, None)
        .await
        .unwrap();
    assert_eq!(remaining.len(), 1);
    let stuck = &remaining[0];
    assert_eq!(stuck.url, "b-1.0.0");
    assert_eq!(stuck.attempt_count, 10);

    let dead = harness.queue.dead_letters().await;
    assert_eq!(dead.len(), 1);
    assert!(matches!(
        &dead[0],
        ScanMessage::Leaf(message) if message.leaf_id == stuck.leaf_id
    ));

    assert_eq!(
        harness.index_scan(LOAD, &scan.scan_id).await.state,
        IndexScanState::Working
    );

    let mut poisoned = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let ScanEvent::LeafPoisoned { attempt_count, .. } = event {
            poisoned.push(attempt_count);
        }
    }
    assert_eq!(poisoned, vec![10]);
}

/// Rewrites the stored index scan during `initialize` once, as a competing
/// worker would.
struct InterferingDriver {
    storage: ScanStorage,
    inner: Arc<RecordingDriver>,
    interfered: AtomicBool,
}

#[async_trait]
impl CatalogScanDriver for InterferingDriver {
    async fn initialize(&self, scan: &IndexScan) -> anyhow::Result<()> {
        if !self.interfered.swap(true, Ordering::SeqCst) {
            let mut stored = self
                .storage
                .get_index_scan(scan.driver.as_str(), &scan.scan_id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("scan {} is missing", scan.scan_id))?;
            self.storage.replace_index_scan(&mut stored).await?;
        }
        Ok(())
    }

    async fn process_index(&self, scan: &IndexScan) -> anyhow::Result<IndexScanResult> {
        self.inner.process_index(scan).await
    }

    async fn process_page(&self, page: &PageScan) -> anyhow::Result<PageScanResult> {
        self.inner.process_page(page).await
    }

    async fn start_aggregate(&self, scan: &IndexScan) -> anyhow::Result<()> {
        self.inner.start_aggregate(scan).await
    }

    async fn is_aggregate_complete(&self, scan: &IndexScan) -> anyhow::Result<bool> {
        self.inner.is_aggregate_complete(scan).await
    }

    async fn finalize(&self, scan: &IndexScan) -> anyhow::Result<()> {
        self.inner.finalize(scan).await
    }
}

#[tokio::test]
async fn losing_a_replace_race_requeues_with_a_penalty() {
    let inner = Arc::new(RecordingDriver::new(IndexScanResult::ExpandAllLeaves));
    let leaf = Arc::clone(&inner);
    let harness = Harness::build(
        test_config(),
        load_only_registry(),
        Arc::new(sample_catalog()),
        move |builder, storage| {
            let driver = InterferingDriver {
                storage: storage.clone(),
                inner: Arc::clone(&leaf),
                interfered: AtomicBool::new(false),
            };
            builder.driver(LOAD, Arc::new(driver), LeafDriver::Batch(leaf))
        },
    )
    .await;

    let outcome = harness.service().update(LOAD, None, None).await.unwrap();
    let scan = outcome.scan().unwrap().clone();

    assert_eq!(harness.worker.run_once().await.unwrap(), 1);
    assert_eq!(
        harness.index_scan(LOAD, &scan.scan_id).await.state,
        IndexScanState::Created
    );

    let queued = harness.queue.peek_all().await;
    assert_eq!(queued.len(), 1);
    let (message, visible_at) = &queued[0];
    let penalty = harness.context.config.index.conflict_attempt_penalty;
    assert!(matches!(
        message,
        ScanMessage::Index(index) if index.attempt_count == penalty
    ));
    assert!(*visible_at > Utc::now() + chrono::Duration::seconds(30));

    harness.run_to_quiescence(50).await;
    assert_eq!(
        harness.index_scan(LOAD, &scan.scan_id).await.state,
        IndexScanState::Complete
    );
    assert_eq!(inner.processed_urls(), all_leaf_urls());
}

mock! {
    pub Catalog {}

    #[async_trait]
    impl CatalogClient for Catalog {
        async fn get_catalog_index(&self) -> anyhow::Result<CatalogIndex>;
        async fn get_catalog_page(&self, url: &str) -> anyhow::Result<CatalogPage>;
    }
}

#[tokio::test]
async fn index_message_is_dead_lettered_after_repeated_failures() {
    let mut catalog = MockCatalog::new();
    catalog
        .expect_get_catalog_index()
        .times(2)
        .returning(|| Err(anyhow::anyhow!("catalog unavailable")));
    catalog.expect_get_catalog_page().never();

    let mut config = test_config();
    config.worker.max_dequeue_count = 2;
    let load = Arc::new(RecordingDriver::new(IndexScanResult::ExpandAllLeaves));
    let registered = Arc::clone(&load);
    let harness = Harness::build(
        config,
        load_only_registry(),
        Arc::new(catalog),
        move |builder, _| {
            builder.driver(LOAD, registered.clone(), LeafDriver::Batch(registered))
        },
    )
    .await;

    let outcome = harness.service().update(LOAD, None, None).await.unwrap();
    let scan = outcome.scan().unwrap().clone();

    harness.worker.run_once().await.unwrap();
    assert_eq!(
        harness.index_scan(LOAD, &scan.scan_id).await.state,
        IndexScanState::Expanding
    );
    assert_eq!(harness.queue.len().await, 1);
    assert!(harness.queue.dead_letters().await.is_empty());

    harness.worker.run_once().await.unwrap();
    assert!(harness.queue.is_empty().await);
    let dead = harness.queue.dead_letters().await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].scan_id(), scan.scan_id);
}
