mod support;

use std::collections::HashSet;
use std::sync::Arc;

use edgesync::{CaptureOutcome, EdgeEngine, EmbeddingRecord, RecordId, SyncState};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::json;
use tempfile::tempdir;

use support::{random_unit, test_config, InMemoryIndexingServer};

const DIM: usize = 8;

fn capture_n(engine: &EdgeEngine, rng: &mut StdRng, n: usize) -> Vec<RecordId> {
    (0..n)
        .map(|i| {
            let record = EmbeddingRecord::new(random_unit(rng, DIM), json!({"i": i}));
            match engine.capture_record(record).expect("capture") {
                CaptureOutcome::Stored { id } => id,
                other => panic!("unexpected capture outcome {other:?}"),
            }
        })
        .collect()
}

#[tokio::test]
async fn swap_keeps_exactly_the_uncovered_records() {
    let dir = tempdir().expect("tempdir");
    let engine = EdgeEngine::open(test_config(dir.path(), DIM), None).expect("open");
    let server = InMemoryIndexingServer::new(DIM);
    let mut sync = engine.synchronizer(server.clone());
    let mut rng = StdRng::seed_from_u64(11);

    let first = capture_n(&engine, &mut rng, 6);
    let report = sync.run_cycle().await.expect("cycle");
    assert_eq!(report.uploaded, 6);
    assert!(report.up_to_date, "nothing published yet");
    assert_eq!(engine.mutable().len(), 6);

    server.publish();
    let late = capture_n(&engine, &mut rng, 4);
    server.set_fail_uploads(true);
    let report = sync.run_cycle().await.expect("cycle");
    assert!(report.upload_error.is_some());
    let swap = report.swap.expect("swap to v1");
    assert_eq!(swap.version, 1);
    assert_eq!(swap.records, 6);
    assert_eq!(swap.superseded, 6);
    assert_eq!(swap.retained, 4);
    assert_eq!(swap.purged, 6);

    let mutable_ids: HashSet<_> = late.iter().filter(|id| engine.mutable().contains(id)).collect();
    assert_eq!(mutable_ids.len(), 4);
    let store = engine.immutable().load().expect("installed");
    assert!(first.iter().all(|id| store.contains(id)));
    assert!(first.iter().all(|id| !engine.mutable().contains(id)));

    let stats = engine.queue().stats();
    assert_eq!(stats.pending, 4);
    assert_eq!(stats.acknowledged, 0);
}

#[tokio::test]
async fn same_version_twice_is_a_no_op() {
    let dir = tempdir().expect("tempdir");
    let engine = EdgeEngine::open(test_config(dir.path(), DIM), None).expect("open");
    let server = InMemoryIndexingServer::new(DIM);
    server.set_publish_on_upload(true);
    let mut sync = engine.synchronizer(server.clone());
    let mut rng = StdRng::seed_from_u64(12);

    capture_n(&engine, &mut rng, 3);
    let first = sync.run_cycle().await.expect("cycle");
    assert_eq!(first.swap.as_ref().map(|s| s.version), Some(1));

    let again = sync.run_cycle().await.expect("cycle");
    assert!(again.swap.is_none());
    assert!(again.up_to_date);
    assert_eq!(engine.immutable().version(), Some(1));
    assert_eq!(server.fetches(), vec![None, Some(1)]);
}

#[tokio::test]
async fn deltas_fold_onto_the_installed_snapshot() {
    let dir = tempdir().expect("tempdir");
    let config = test_config(dir.path(), DIM);
    let engine = EdgeEngine::open(config.clone(), None).expect("open");
    let server = InMemoryIndexingServer::new(DIM);
    server.set_publish_on_upload(true);
    server.set_serve_deltas(true);
    let mut sync = engine.synchronizer(server.clone());
    let mut rng = StdRng::seed_from_u64(13);

    let a = capture_n(&engine, &mut rng, 5);
    sync.run_cycle().await.expect("cycle v1");
    let b = capture_n(&engine, &mut rng, 3);
    let report = sync.run_cycle().await.expect("cycle v2");
    let swap = report.swap.expect("swap");
    assert_eq!((swap.previous, swap.version, swap.records), (Some(1), 2, 8));

    let store = engine.immutable().load().expect("installed");
    assert!(a.iter().chain(&b).all(|id| store.contains(id)));
    assert!(engine.mutable().is_empty());
    assert_eq!(engine.queue().retained().len(), 0);

    // the retired v1 file is gone once nothing pins it
    assert!(!config.snapshot_path(1).exists());
    assert!(config.snapshot_path(2).exists());
    // downloads and merges only ever live in the tmp dir, and not past a swap
    assert_eq!(std::fs::read_dir(&config.tmp_dir).expect("tmp dir").count(), 0);
}

#[tokio::test]
async fn mismatched_delta_is_rejected_then_full_snapshot_requested() {
    let dir = tempdir().expect("tempdir");
    let engine = EdgeEngine::open(test_config(dir.path(), DIM), None).expect("open");
    let server = InMemoryIndexingServer::new(DIM);
    server.set_publish_on_upload(true);
    let mut sync = engine.synchronizer(server.clone());
    let mut rng = StdRng::seed_from_u64(14);

    capture_n(&engine, &mut rng, 2);
    sync.run_cycle().await.expect("cycle v1");
    capture_n(&engine, &mut rng, 2);
    server.send_bogus_delta_once();
    let err = sync.run_cycle().await.expect_err("bogus delta");
    assert_eq!(err.code(), "corruption");
    assert_eq!(engine.immutable().version(), Some(1), "prior store kept");
    assert_eq!(engine.mutable().len(), 2);
    assert_eq!(std::fs::read_dir(dir.path().join("tmp")).expect("tmp dir").count(), 0);

    let report = sync.run_cycle().await.expect("full retry");
    assert_eq!(report.swap.map(|s| s.version), Some(2));
    assert_eq!(server.fetches().last(), Some(&None));
    assert!(engine.mutable().is_empty());
}

#[tokio::test]
async fn fetch_failure_leaves_store_untouched() {
    let dir = tempdir().expect("tempdir");
    let engine = EdgeEngine::open(test_config(dir.path(), DIM), None).expect("open");
    let server = InMemoryIndexingServer::new(DIM);
    let mut sync = engine.synchronizer(server.clone());
    let mut rng = StdRng::seed_from_u64(15);

    capture_n(&engine, &mut rng, 3);
    server.set_fail_fetches(true);
    let err = sync.run_cycle().await.expect_err("fetch fails");
    assert!(err.is_retryable());
    assert!(engine.immutable().version().is_none());
    assert_eq!(engine.mutable().len(), 3);
    assert_eq!(engine.queue().stats().acknowledged, 3);
}

#[tokio::test]
async fn acknowledged_records_are_never_uploaded_again_across_restart() {
    let dir = tempdir().expect("tempdir");
    let config = test_config(dir.path(), DIM);
    let server = InMemoryIndexingServer::new(DIM);
    let mut rng = StdRng::seed_from_u64(16);

    let ids = {
        let engine = EdgeEngine::open(config.clone(), None).expect("open");
        let ids = capture_n(&engine, &mut rng, 7);
        let mut sync = engine.synchronizer(server.clone());
        sync.run_cycle().await.expect("cycle");
        ids
    };

    let engine = EdgeEngine::open(config, None).expect("reopen");
    assert_eq!(engine.recovery().mutable_restored, 7);
    let mut sync = engine.synchronizer(server.clone());
    let report = sync.run_cycle().await.expect("cycle after restart");
    assert_eq!(report.uploaded, 0);
    assert!(ids.iter().all(|id| server.upload_count(id) == 1));
}

#[tokio::test]
async fn unacknowledged_records_are_redrained_once_after_restart() {
    let dir = tempdir().expect("tempdir");
    let config = test_config(dir.path(), DIM);
    let server = InMemoryIndexingServer::new(DIM);
    let mut rng = StdRng::seed_from_u64(17);

    let ids = {
        let engine = EdgeEngine::open(config.clone(), None).expect("open");
        let ids = capture_n(&engine, &mut rng, 4);
        // lease a batch and "crash" while it is in flight
        let batch = engine.queue().drain(10).next().expect("batch").expect("lease");
        assert_eq!(batch.len(), 4);
        std::mem::forget(batch);
        ids
    };

    let engine = EdgeEngine::open(config.clone(), None).expect("reopen");
    assert_eq!(engine.queue().stats().pending, 4);
    let mut sync = engine.synchronizer(server.clone());
    assert_eq!(sync.run_cycle().await.expect("cycle").uploaded, 4);
    assert_eq!(sync.run_cycle().await.expect("cycle").uploaded, 0);
    drop(sync);
    drop(engine);

    let engine = EdgeEngine::open(config, None).expect("reopen again");
    let mut sync = engine.synchronizer(server.clone());
    assert_eq!(sync.run_cycle().await.expect("cycle").uploaded, 0);
    assert!(ids.iter().all(|id| server.upload_count(id) == 1));
    assert_eq!(engine.queue().entry(&ids[0]).expect("entry").attempt_count, 2);
}

#[tokio::test]
async fn background_loop_syncs_and_reports_status() {
    let dir = tempdir().expect("tempdir");
    let engine = Arc::new(EdgeEngine::open(test_config(dir.path(), DIM), None).expect("open"));
    let server = InMemoryIndexingServer::new(DIM);
    server.set_publish_on_upload(true);
    let handle = engine.start_sync(server.clone());
    let mut rng = StdRng::seed_from_u64(18);

    let ids = capture_n(&engine, &mut rng, 5);
    let report = handle.force_sync().await.expect("forced cycle");
    assert!(report.upload_error.is_none());

    let status = handle.status();
    assert_eq!(status.state, SyncState::Idle);
    assert!(status.snapshot_version.is_some());
    let store = engine.immutable().load().expect("installed");
    assert!(ids.iter().all(|id| store.contains(id)));
    assert!(engine.stats().sync.is_some());

    engine.shutdown().await;
    assert!(handle.force_sync().await.is_err());
}
