//! Pin tracker lifecycle integration tests.
//!
//! These tests drive the tracker with a mock daemon connector:
//! - State transitions (queued -> in progress -> terminal)
//! - Admission control when queues are full
//! - Concurrency limits of the pin and unpin pools
//! - Recovery, reconciliation and shutdown

use std::sync::Arc;
use std::time::Duration;

use tokio_test::{assert_err, assert_ok};

use pintracker_core::{
    testing::{fixtures, MockConnector},
    Cid, PinInfo, PinOperation, PinTracker, TrackerConfig, TrackerError, TrackerStatus,
};

/// Test helper wiring a started tracker to a mock connector.
struct TestHarness {
    tracker: Arc<PinTracker>,
    connector: MockConnector,
}

impl TestHarness {
    async fn new() -> Self {
        Self::with_config(TrackerConfig::default()).await
    }

    async fn with_config(config: TrackerConfig) -> Self {
        let connector = MockConnector::new();
        let tracker = Arc::new(
            PinTracker::new(config, fixtures::local_peer(), Arc::new(connector.clone()))
                .expect("Failed to create tracker"),
        );
        tracker.start().await;

        Self { tracker, connector }
    }

    /// Polls until `cid` reaches `status`, panicking after five seconds.
    async fn wait_for_status(&self, cid: &Cid, status: TrackerStatus) -> PinInfo {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let info = self.tracker.status(cid);
            if info.status == status {
                return info;
            }
            if tokio::time::Instant::now() > deadline {
                panic!(
                    "{} did not reach {} (last status: {})",
                    cid, status, info.status
                );
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

// =============================================================================
// State Transition Tests
// =============================================================================

#[tokio::test]
async fn test_unknown_cid_reports_unpinned() {
    let harness = TestHarness::new().await;

    let info = harness.tracker.status(&fixtures::cid(1));
    assert_eq!(info.status, TrackerStatus::Unpinned);
    assert_eq!(info.peer, fixtures::local_peer());
    assert!(harness.tracker.status_all().is_empty());
}

#[tokio::test]
async fn test_successful_pin_passes_through_every_state() {
    let harness = TestHarness::new().await;
    let cid = fixtures::cid(1);
    let mut events = harness.tracker.subscribe();
    harness.connector.hold();

    let status = assert_ok!(harness.tracker.track(fixtures::pin(1)));
    assert_eq!(status, TrackerStatus::PinQueued);

    harness.wait_for_status(&cid, TrackerStatus::Pinning).await;
    harness.connector.release();
    let info = harness.wait_for_status(&cid, TrackerStatus::Pinned).await;
    assert!(info.error.is_none());

    let mut seen = Vec::new();
    for _ in 0..3 {
        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("Should receive event")
            .expect("Channel should be open");
        assert_eq!(event.cid, cid);
        seen.push(event.status);
    }
    assert_eq!(
        seen,
        vec![
            TrackerStatus::PinQueued,
            TrackerStatus::Pinning,
            TrackerStatus::Pinned
        ]
    );

    // Final state is stable.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(harness.tracker.status(&cid).status, TrackerStatus::Pinned);
    assert!(harness.connector.daemon_has(&cid).await);
}

#[tokio::test]
async fn test_failed_pin_records_connector_error() {
    let harness = TestHarness::new().await;
    let cid = fixtures::cid(1);
    harness.connector.fail_cid(&cid, "pin: context deadline exceeded").await;

    harness.tracker.track(fixtures::pin(1)).unwrap();
    let info = harness.wait_for_status(&cid, TrackerStatus::PinError).await;
    assert_eq!(
        info.error.as_deref(),
        Some("pin: context deadline exceeded")
    );

    // A fresh track leaves the error state.
    harness.connector.clear_failures().await;
    let status = harness.tracker.track(fixtures::pin(1)).unwrap();
    assert_eq!(status, TrackerStatus::PinQueued);
    let info = harness.wait_for_status(&cid, TrackerStatus::Pinned).await;
    assert!(info.error.is_none());
}

#[tokio::test]
async fn test_untrack_after_pin() {
    let harness = TestHarness::new().await;
    let cid = fixtures::cid(1);

    harness.tracker.track(fixtures::pin(1)).unwrap();
    harness.wait_for_status(&cid, TrackerStatus::Pinned).await;

    let status = harness.tracker.untrack(&cid).unwrap();
    assert_eq!(status, TrackerStatus::UnpinQueued);
    harness.wait_for_status(&cid, TrackerStatus::Unpinned).await;
    assert!(!harness.connector.daemon_has(&cid).await);

    // Unpinned entries stay in the store until forgotten.
    assert_eq!(harness.tracker.status_all().len(), 1);
    let removed = harness.tracker.forget(&cid).unwrap();
    assert!(removed.is_some());
    assert!(harness.tracker.status_all().is_empty());
}

#[tokio::test]
async fn test_failed_unpin_records_unpin_error() {
    let harness = TestHarness::new().await;
    let cid = fixtures::cid(1);

    harness.tracker.track(fixtures::pin(1)).unwrap();
    harness.wait_for_status(&cid, TrackerStatus::Pinned).await;

    harness.connector.fail_cid(&cid, "unpin: not pinned or pinned indirectly").await;
    harness.tracker.untrack(&cid).unwrap();
    let info = harness.wait_for_status(&cid, TrackerStatus::UnpinError).await;
    assert!(info.error.unwrap().contains("not pinned"));
}

#[tokio::test]
async fn test_untrack_while_pinning_waits_for_pin() {
    let harness = TestHarness::new().await;
    let cid = fixtures::cid(1);
    harness.connector.hold();

    harness.tracker.track(fixtures::pin(1)).unwrap();
    harness.wait_for_status(&cid, TrackerStatus::Pinning).await;

    let status = harness.tracker.untrack(&cid).unwrap();
    assert_eq!(status, TrackerStatus::UnpinQueued);

    // The unpin must not reach the daemon while the pin is still running.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(harness.connector.call_count(PinOperation::Unpin, &cid).await, 0);
    assert_eq!(harness.connector.peak_concurrent_unpins(), 0);

    harness.connector.release();
    harness.wait_for_status(&cid, TrackerStatus::Unpinned).await;

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(harness.tracker.status(&cid).status, TrackerStatus::Unpinned);
    assert!(!harness.connector.daemon_has(&cid).await);

    let calls: Vec<PinOperation> = harness
        .connector
        .recorded_calls()
        .await
        .into_iter()
        .map(|call| call.operation)
        .collect();
    assert_eq!(calls, vec![PinOperation::Pin, PinOperation::Unpin]);
}

#[tokio::test]
async fn test_track_while_unpinning_waits_for_unpin() {
    let harness = TestHarness::new().await;
    let cid = fixtures::cid(1);

    harness.tracker.track(fixtures::pin(1)).unwrap();
    harness.wait_for_status(&cid, TrackerStatus::Pinned).await;

    harness.connector.hold();
    harness.tracker.untrack(&cid).unwrap();
    harness.wait_for_status(&cid, TrackerStatus::Unpinning).await;

    let status = harness.tracker.track(fixtures::pin(1)).unwrap();
    assert_eq!(status, TrackerStatus::PinQueued);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(harness.connector.call_count(PinOperation::Pin, &cid).await, 1);

    harness.connector.release();
    harness.wait_for_status(&cid, TrackerStatus::Pinned).await;

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(harness.tracker.status(&cid).status, TrackerStatus::Pinned);
    assert!(harness.connector.daemon_has(&cid).await);
    assert_eq!(harness.connector.call_count(PinOperation::Pin, &cid).await, 2);
}

#[tokio::test]
async fn test_flip_flopping_intents_end_on_last_request() {
    let harness = TestHarness::new().await;
    let cid = fixtures::cid(1);
    harness.connector.hold();

    harness.tracker.track(fixtures::pin(1)).unwrap();
    harness.wait_for_status(&cid, TrackerStatus::Pinning).await;

    // Back and forth while the pin runs: the unpin is finally wanted.
    harness.tracker.untrack(&cid).unwrap();
    assert_eq!(
        harness.tracker.track(fixtures::pin(1)).unwrap(),
        TrackerStatus::Pinning
    );
    harness.tracker.untrack(&cid).unwrap();

    harness.connector.release();
    harness.wait_for_status(&cid, TrackerStatus::Unpinned).await;
    assert!(!harness.connector.daemon_has(&cid).await);
    assert_eq!(harness.connector.call_count(PinOperation::Pin, &cid).await, 1);
    assert_eq!(harness.connector.call_count(PinOperation::Unpin, &cid).await, 1);
}

#[tokio::test]
async fn test_remote_pin_never_reaches_daemon() {
    let harness = TestHarness::new().await;
    let cid = fixtures::cid(1);

    let status = harness.tracker.track(fixtures::remote_pin(1)).unwrap();
    assert_eq!(status, TrackerStatus::Remote);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(harness.connector.recorded_calls().await.is_empty());
    assert_eq!(harness.tracker.status(&cid).status, TrackerStatus::Remote);
}

#[tokio::test]
async fn test_reallocated_pin_is_unpinned_locally() {
    let harness = TestHarness::new().await;
    let cid = fixtures::cid(1);

    harness.tracker.track(fixtures::pin(1)).unwrap();
    harness.wait_for_status(&cid, TrackerStatus::Pinned).await;

    let status = harness.tracker.track(fixtures::remote_pin(1)).unwrap();
    assert_eq!(status, TrackerStatus::UnpinQueued);
    harness.wait_for_status(&cid, TrackerStatus::Unpinned).await;
    assert_eq!(harness.connector.call_count(PinOperation::Unpin, &cid).await, 1);
}

// =============================================================================
// Admission Control Tests
// =============================================================================

#[tokio::test]
async fn test_third_track_rejected_when_queue_full() {
    let harness = TestHarness::with_config(
        TrackerConfig::default()
            .with_max_pin_queue_size(2)
            .with_concurrent_pins(1),
    )
    .await;
    harness.connector.hold();
    let (a, b, c) = (fixtures::cid(1), fixtures::cid(2), fixtures::cid(3));

    assert_ok!(harness.tracker.track(fixtures::pin(1)));
    assert_ok!(harness.tracker.track(fixtures::pin(2)));
    let err = assert_err!(harness.tracker.track(fixtures::pin(3)));
    assert!(matches!(err, TrackerError::Admission(_)));

    let info = harness.tracker.status(&c);
    assert_eq!(info.status, TrackerStatus::PinError);
    assert!(info.error.unwrap().contains("queue full"));
    assert!(harness.tracker.stats().pin_pool.queued <= 2);

    harness.connector.release();
    harness.wait_for_status(&a, TrackerStatus::Pinned).await;
    harness.wait_for_status(&b, TrackerStatus::Pinned).await;

    assert_eq!(harness.tracker.status(&c).status, TrackerStatus::PinError);
    assert_eq!(harness.connector.call_count(PinOperation::Pin, &c).await, 0);
}

#[tokio::test]
async fn test_track_twice_dispatches_once() {
    let harness = TestHarness::new().await;
    let cid = fixtures::cid(1);
    harness.connector.hold();

    harness.tracker.track(fixtures::pin(1)).unwrap();
    harness.wait_for_status(&cid, TrackerStatus::Pinning).await;
    let again = harness.tracker.track(fixtures::pin(1)).unwrap();
    assert_eq!(again, TrackerStatus::Pinning);

    harness.connector.release();
    harness.wait_for_status(&cid, TrackerStatus::Pinned).await;
    assert_eq!(
        harness.tracker.track(fixtures::pin(1)).unwrap(),
        TrackerStatus::Pinned
    );

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(harness.connector.call_count(PinOperation::Pin, &cid).await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_callers_enqueue_once() {
    let harness = TestHarness::new().await;
    let cid = fixtures::cid(1);
    harness.connector.hold();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let tracker = Arc::clone(&harness.tracker);
            tokio::spawn(async move { tracker.track(fixtures::pin(1)) })
        })
        .collect();
    for handle in handles {
        assert!(handle.await.unwrap().is_ok());
    }

    harness.connector.release();
    harness.wait_for_status(&cid, TrackerStatus::Pinned).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(harness.connector.call_count(PinOperation::Pin, &cid).await, 1);
}

// =============================================================================
// Worker Pool Tests
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pin_concurrency_is_bounded() {
    let harness =
        TestHarness::with_config(TrackerConfig::default().with_concurrent_pins(3)).await;
    harness.connector.set_call_duration(Duration::from_millis(20)).await;

    for n in 0..12 {
        harness.tracker.track(fixtures::pin(n)).unwrap();
    }
    for n in 0..12 {
        harness
            .wait_for_status(&fixtures::cid(n), TrackerStatus::Pinned)
            .await;
    }

    let peak = harness.connector.peak_concurrent_pins();
    assert!((1..=3).contains(&peak), "peak concurrent pins was {}", peak);

    // Pool counters are bumped right after the status write.
    tokio::time::sleep(Duration::from_millis(20)).await;
    let stats = harness.tracker.stats();
    assert_eq!(stats.pin_pool.workers, 3);
    assert_eq!(stats.pin_pool.total_processed, 12);
    assert_eq!(stats.pin_pool.total_failed, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unpins_are_serialized_in_order() {
    let harness = TestHarness::new().await;
    for n in 0..5 {
        harness.tracker.track(fixtures::pin(n)).unwrap();
    }
    for n in 0..5 {
        harness
            .wait_for_status(&fixtures::cid(n), TrackerStatus::Pinned)
            .await;
    }

    harness.connector.set_call_duration(Duration::from_millis(10)).await;
    for n in 0..5 {
        harness.tracker.untrack(&fixtures::cid(n)).unwrap();
    }
    for n in 0..5 {
        harness
            .wait_for_status(&fixtures::cid(n), TrackerStatus::Unpinned)
            .await;
    }

    assert_eq!(harness.connector.peak_concurrent_unpins(), 1);
    let order = harness.connector.cids_for(PinOperation::Unpin).await;
    let expected: Vec<Cid> = (0..5).map(fixtures::cid).collect();
    assert_eq!(order, expected);
}

#[tokio::test(start_paused = true)]
async fn test_connector_timeout_becomes_pin_error() {
    let harness = TestHarness::with_config(
        TrackerConfig::default().with_connector_timeout_secs(1),
    )
    .await;
    harness.connector.set_call_duration(Duration::from_secs(10)).await;
    let cid = fixtures::cid(1);

    harness.tracker.track(fixtures::pin(1)).unwrap();
    let info = harness.wait_for_status(&cid, TrackerStatus::PinError).await;
    assert!(info.error.unwrap().contains("timed out"));
    assert_eq!(harness.connector.concurrent_pins(), 0);
    assert_eq!(harness.tracker.stats().pin_pool.total_failed, 1);
}

// =============================================================================
// Recovery Tests
// =============================================================================

#[tokio::test]
async fn test_recover_requeues_only_errored_entries() {
    let harness = TestHarness::new().await;
    let (ok, bad1, bad2) = (fixtures::cid(0), fixtures::cid(1), fixtures::cid(2));
    harness.connector.fail_cid(&bad1, "daemon offline").await;
    harness.connector.fail_cid(&bad2, "daemon offline").await;

    for n in 0..3 {
        harness.tracker.track(fixtures::pin(n)).unwrap();
    }
    harness.wait_for_status(&ok, TrackerStatus::Pinned).await;
    harness.wait_for_status(&bad1, TrackerStatus::PinError).await;
    harness.wait_for_status(&bad2, TrackerStatus::PinError).await;
    let ok_before = harness.tracker.status(&ok);

    harness.connector.clear_failures().await;
    let requeued = harness.tracker.recover().unwrap();
    assert_eq!(requeued, 2);

    harness.wait_for_status(&bad1, TrackerStatus::Pinned).await;
    harness.wait_for_status(&bad2, TrackerStatus::Pinned).await;
    assert_eq!(harness.tracker.status(&ok), ok_before);
    assert_eq!(harness.connector.call_count(PinOperation::Pin, &ok).await, 1);

    // Nothing left to recover.
    assert_eq!(harness.tracker.recover().unwrap(), 0);
}

#[tokio::test]
async fn test_recover_recovers_unpin_errors() {
    let harness = TestHarness::new().await;
    let cid = fixtures::cid(1);

    harness.tracker.track(fixtures::pin(1)).unwrap();
    harness.wait_for_status(&cid, TrackerStatus::Pinned).await;
    harness.connector.fail_cid(&cid, "unpin failed").await;
    harness.tracker.untrack(&cid).unwrap();
    harness.wait_for_status(&cid, TrackerStatus::UnpinError).await;

    harness.connector.clear_failures().await;
    let info = harness.tracker.recover_cid(&cid).unwrap();
    assert_eq!(info.status, TrackerStatus::UnpinQueued);
    harness.wait_for_status(&cid, TrackerStatus::Unpinned).await;
}

#[tokio::test]
async fn test_recover_leaves_rejected_entries_in_error() {
    let harness = TestHarness::with_config(
        TrackerConfig::default()
            .with_max_pin_queue_size(1)
            .with_concurrent_pins(1),
    )
    .await;
    let (a, b, c, d) = (
        fixtures::cid(1),
        fixtures::cid(2),
        fixtures::cid(3),
        fixtures::cid(4),
    );
    harness.connector.fail_cid(&a, "boom").await;
    harness.tracker.track(fixtures::pin(1)).unwrap();
    harness.wait_for_status(&a, TrackerStatus::PinError).await;

    // Fill the pipeline: c in flight, d waiting in the queue.
    harness.connector.hold();
    harness.tracker.track(fixtures::pin(3)).unwrap();
    harness.wait_for_status(&c, TrackerStatus::Pinning).await;
    harness.tracker.track(fixtures::pin(4)).unwrap();

    let mut events = harness.tracker.subscribe();
    assert_eq!(harness.tracker.recover().unwrap(), 0);

    // The rejected entry keeps its original error and emits nothing.
    let info = harness.tracker.status(&a);
    assert_eq!(info.status, TrackerStatus::PinError);
    assert_eq!(info.error.as_deref(), Some("boom"));
    while let Ok(event) = events.try_recv() {
        assert_ne!(event.cid, a, "unexpected event {:?}", event);
    }

    // An untouched CID is unaffected.
    assert_eq!(harness.tracker.status(&b).status, TrackerStatus::Unpinned);

    harness.connector.release();
    harness.wait_for_status(&d, TrackerStatus::Pinned).await;
}

// =============================================================================
// Reconciliation Tests
// =============================================================================

#[tokio::test]
async fn test_sync_all_reconciles_with_daemon() {
    let harness = TestHarness::new().await;
    let (lost, found) = (fixtures::cid(1), fixtures::cid(2));

    harness.tracker.track(fixtures::pin(1)).unwrap();
    harness.wait_for_status(&lost, TrackerStatus::Pinned).await;

    harness.connector.fail_cid(&found, "timeout talking to daemon").await;
    harness.tracker.track(fixtures::pin(2)).unwrap();
    harness.wait_for_status(&found, TrackerStatus::PinError).await;

    // The daemon lost one pin and picked up the other on its own.
    harness.connector.set_daemon_pinned(&lost, false).await;
    harness.connector.set_daemon_pinned(&found, true).await;

    let changed = harness.tracker.sync_all().await.unwrap();
    assert_eq!(changed.len(), 2);

    let info = harness.tracker.status(&lost);
    assert_eq!(info.status, TrackerStatus::PinError);
    assert!(info.error.unwrap().contains("unexpectedly not pinned"));
    assert_eq!(harness.tracker.status(&found).status, TrackerStatus::Pinned);

    // A second pass finds nothing to do.
    assert!(harness.tracker.sync_all().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_sync_single_cid() {
    let harness = TestHarness::new().await;
    let cid = fixtures::cid(1);

    harness.tracker.track(fixtures::pin(1)).unwrap();
    harness.wait_for_status(&cid, TrackerStatus::Pinned).await;
    harness.tracker.untrack(&cid).unwrap();
    harness.wait_for_status(&cid, TrackerStatus::Unpinned).await;

    harness.connector.set_daemon_pinned(&cid, true).await;
    let info = harness.tracker.sync(&cid).await.unwrap();
    assert_eq!(info.status, TrackerStatus::UnpinError);

    // Recovery then unpins it again.
    harness.tracker.recover().unwrap();
    harness.wait_for_status(&cid, TrackerStatus::Unpinned).await;
    assert!(!harness.connector.daemon_has(&cid).await);
}

// =============================================================================
// Shutdown Tests
// =============================================================================

#[tokio::test]
async fn test_shutdown_drains_in_flight_and_abandons_queued() {
    let harness = TestHarness::with_config(TrackerConfig::default().with_concurrent_pins(1)).await;
    let (a, b) = (fixtures::cid(1), fixtures::cid(2));
    harness.connector.hold();

    harness.tracker.track(fixtures::pin(1)).unwrap();
    harness.wait_for_status(&a, TrackerStatus::Pinning).await;
    harness.tracker.track(fixtures::pin(2)).unwrap();

    let shutdown = {
        let tracker = Arc::clone(&harness.tracker);
        tokio::spawn(async move { tracker.shutdown().await })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!shutdown.is_finished(), "Shutdown should wait for in-flight pins");

    harness.connector.release();
    tokio::time::timeout(Duration::from_secs(5), shutdown)
        .await
        .expect("Shutdown should complete")
        .unwrap();

    assert_eq!(harness.tracker.status(&a).status, TrackerStatus::Pinned);
    assert_eq!(harness.tracker.status(&b).status, TrackerStatus::PinQueued);
    assert_eq!(harness.connector.call_count(PinOperation::Pin, &b).await, 0);
    assert!(!harness.tracker.stats().running);

    assert!(matches!(
        harness.tracker.track(fixtures::pin(3)),
        Err(TrackerError::ShuttingDown)
    ));
    // Reads keep working.
    assert_eq!(harness.tracker.status_all().len(), 2);
}
