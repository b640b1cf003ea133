mod support;

use std::collections::HashSet;

use catalog_scan_core::{
    CatalogScanError, UpdateOutcome,
    cursor::driver_cursor_name,
    events::ScanEvent,
    registry::FIND_LATEST_LEAVES,
    scan::{IndexScanState, ids, leaf_scan_table, page_scan_table},
};
use support::{
    Harness, LATEST, LOAD, PAGE_0, PAGE_1, all_leaf_urls, at, latest_leaf_urls,
    test_config,
};
use tokio::sync::broadcast;

fn drain_events(receiver: &mut broadcast::Receiver<ScanEvent>) -> Vec<ScanEvent> {
    let mut events = Vec::new();
    while let Ok(event) = receiver.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn all_leaves_scan_runs_to_completion() {
    let (harness, drivers) = Harness::standard().await;
    let mut events = harness.events.subscribe();

    let outcome = harness.service().update(LOAD, None, None).await.unwrap();
    let scan = outcome.scan().unwrap().clone();

    harness.run_to_quiescence(50).await;

    let stored = harness.index_scan(LOAD, &scan.scan_id).await;
    assert_eq!(stored.state, IndexScanState::Complete);
    assert!(stored.started.is_some());
    assert!(stored.completed.is_some());
    assert_eq!(stored.result, Some(catalog_scan_core::scan::IndexScanResult::ExpandAllLeaves));

    assert_eq!(drivers.load.processed_urls(), all_leaf_urls());
    assert_eq!(drivers.load.finalized(), 1);
    let page_urls: HashSet<String> = drivers
        .load
        .processed()
        .into_iter()
        .filter_map(|leaf| leaf.page_url)
        .collect();
    assert_eq!(
        page_urls,
        HashSet::from([PAGE_0.to_string(), PAGE_1.to_string()])
    );

    assert_eq!(
        harness.service().get_cursor_value(LOAD).await.unwrap(),
        at(20)
    );
    assert!(!harness.has_table(&page_scan_table(&scan.storage_suffix)).await);
    assert!(!harness.has_table(&leaf_scan_table(&scan.storage_suffix)).await);
    assert!(harness.queue.is_empty().await);
    assert!(harness.queue.dead_letters().await.is_empty());

    let events = drain_events(&mut events);
    assert!(events.iter().any(|event| matches!(
        event,
        ScanEvent::CursorAdvanced { name, to, .. }
            if *name == driver_cursor_name(LOAD) && *to == at(20)
    )));
    assert!(events.iter().any(|event| matches!(
        event,
        ScanEvent::IndexStateChanged { to: IndexScanState::Complete, .. }
    )));
}

#[tokio::test]
async fn fan_out_enqueues_leaves_in_small_chunks() {
    let mut config = test_config();
    config.fan_out.enqueue_take = 2;
    let (harness, drivers) = Harness::standard_with(config).await;

    let outcome = harness.service().update(LOAD, None, None).await.unwrap();
    let scan = outcome.scan().unwrap().clone();

    harness.run_to_quiescence(50).await;

    assert_eq!(
        harness.index_scan(LOAD, &scan.scan_id).await.state,
        IndexScanState::Complete
    );
    assert_eq!(drivers.load.processed().len(), all_leaf_urls().len());
    assert_eq!(drivers.load.processed_urls(), all_leaf_urls());
    assert_eq!(
        harness.service().get_cursor_value(LOAD).await.unwrap(),
        at(20)
    );
}

#[tokio::test]
async fn latest_leaves_scan_uses_a_find_latest_helper() {
    let (harness, drivers) = Harness::standard().await;

    let outcome = harness.service().update(LATEST, None, None).await.unwrap();
    let scan = outcome.scan().unwrap().clone();
    assert!(scan.only_latest_leaves);

    harness.run_to_quiescence(50).await;

    let stored = harness.index_scan(LATEST, &scan.scan_id).await;
    assert_eq!(stored.state, IndexScanState::Complete);
    assert_eq!(drivers.latest.processed_urls(), latest_leaf_urls());
    assert_eq!(drivers.latest.processed().len(), latest_leaf_urls().len());

    let helper_id = ids::find_latest_scan_id(&scan.scan_id);
    let helper = harness
        .service()
        .get_index_scan(FIND_LATEST_LEAVES, &helper_id)
        .await
        .unwrap();
    assert!(helper.is_none(), "helper record should be deleted");
    let helper_suffix = ids::find_latest_storage_suffix(&scan.storage_suffix);
    assert!(!harness.has_table(&page_scan_table(&helper_suffix)).await);
    assert!(!harness.has_table(&leaf_scan_table(&scan.storage_suffix)).await);

    assert_eq!(
        harness.service().get_cursor_value(LATEST).await.unwrap(),
        at(20)
    );
}

#[tokio::test]
async fn bucket_scan_reprocesses_packages_without_moving_the_cursor() {
    let (harness, drivers) = Harness::standard().await;
    let service = harness.service();

    let blocked = service.update_buckets(LATEST, &[3, 4, 5, 9]).await.unwrap();
    assert!(
        matches!(blocked, UpdateOutcome::BlockedByDependency(_)),
        "driver must catch up with the bucket cursor first: {blocked:?}"
    );

    let err = service.update_buckets(LOAD, &[1]).await.unwrap_err();
    assert!(matches!(err, CatalogScanError::InvalidArgument(_)));

    service.update(LATEST, None, None).await.unwrap();
    harness.run_to_quiescence(50).await;
    let before = drivers.latest.processed().len();

    let outcome = service.update_buckets(LATEST, &[3, 4, 5, 9]).await.unwrap();
    let scan = outcome.scan().expect("bucket scan should start").clone();
    assert_eq!(scan.bucket_ranges.as_deref(), Some("3-5,9"));
    assert!(scan.scan_id.ends_with("-r4"));
    assert!(!scan.has_cursor());

    harness.run_to_quiescence(50).await;

    let stored = harness.index_scan(LATEST, &scan.scan_id).await;
    assert_eq!(stored.state, IndexScanState::Complete);

    let bucket_leaves: Vec<_> = drivers.latest.processed().into_iter().skip(before).collect();
    let urls: HashSet<String> = bucket_leaves.iter().map(|leaf| leaf.url.clone()).collect();
    assert_eq!(
        urls,
        HashSet::from(["bucket-3", "bucket-4", "bucket-5", "bucket-9"].map(String::from))
    );
    assert!(bucket_leaves
        .iter()
        .all(|leaf| leaf.bucket_ranges.as_deref() == Some("3-5,9")));
    assert_eq!(service.get_cursor_value(LATEST).await.unwrap(), at(20));
}

#[tokio::test]
async fn cursor_never_moves_backwards() {
    let (harness, drivers) = Harness::standard().await;
    let mut events = harness.events.subscribe();

    let outcome = harness.service().update(LOAD, None, None).await.unwrap();
    let scan = outcome.scan().unwrap().clone();

    harness.worker.run_once().await.unwrap();
    assert_eq!(
        harness.index_scan(LOAD, &scan.scan_id).await.state,
        IndexScanState::Working
    );

    let cursors = &harness.context.cursors;
    let mut cursor = cursors.get_or_create(&driver_cursor_name(LOAD)).await.unwrap();
    cursor.value = at(25);
    cursors.update(&mut cursor).await.unwrap();

    harness.run_to_quiescence(50).await;

    assert_eq!(
        harness.index_scan(LOAD, &scan.scan_id).await.state,
        IndexScanState::Complete
    );
    assert_eq!(drivers.load.processed_urls(), all_leaf_urls());
    assert_eq!(
        harness.service().get_cursor_value(LOAD).await.unwrap(),
        at(25)
    );
    assert!(!drain_events(&mut events)
        .iter()
        .any(|event| matches!(event, ScanEvent::CursorAdvanced { .. })));
}

#[tokio::test]
async fn abort_drops_child_work_and_keeps_the_cursor() {
    let (harness, drivers) = Harness::standard().await;
    let service = harness.service();

    let outcome = service.update(LOAD, None, None).await.unwrap();
    let scan = outcome.scan().unwrap().clone();

    harness.worker.run_once().await.unwrap();
    assert_eq!(
        harness.index_scan(LOAD, &scan.scan_id).await.state,
        IndexScanState::Working
    );
    assert!(harness.has_table(&page_scan_table(&scan.storage_suffix)).await);

    let aborted = service.abort(LOAD).await.unwrap().expect("a scan was running");
    assert_eq!(aborted.scan_id, scan.scan_id);
    assert_eq!(aborted.state, IndexScanState::Aborted);
    assert!(aborted.completed.is_some());
    assert_eq!(drivers.load.finalized(), 1);

    assert!(!harness.has_table(&page_scan_table(&scan.storage_suffix)).await);
    assert!(!harness.has_table(&leaf_scan_table(&scan.storage_suffix)).await);

    harness.run_to_quiescence(50).await;

    assert_eq!(
        harness.index_scan(LOAD, &scan.scan_id).await.state,
        IndexScanState::Aborted
    );
    assert!(drivers.load.processed().is_empty());
    assert!(harness.queue.dead_letters().await.is_empty());
    assert_eq!(
        service.get_cursor_value(LOAD).await.unwrap(),
        ids::cursor_min()
    );

    assert!(service.abort(LOAD).await.unwrap().is_none());
    let restarted = service.update(LOAD, None, None).await.unwrap();
    assert!(restarted.is_new_started());
}
