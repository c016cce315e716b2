use std::time::Duration;

use lookout_core::testutil::{MockExtractor, MockSessionFactory};
use lookout_core::{AppError, Priority, TaskStatus};

use crate::common::{harness, harness_with_factory, identifiers, names, wait_until};

#[tokio::test]
async fn shutdown_aborts_in_flight_and_cancels_queued_work() {
    let extractor = MockExtractor::new().with_delay(Duration::from_secs(10));
    let h = harness(extractor, |config| {
        config.workers = 5;
        config.attempt_timeout = Duration::from_secs(30);
        config.pool.default_size = 5;
    });

    let handle = h
        .scheduler
        .submit(identifiers(8), &names(&["alpha"]), Priority::Medium)
        .await
        .unwrap();
    let busy = wait_until(Duration::from_secs(2), || {
        h.scheduler.pool_stats().leased == 5 && h.extractor.total_calls() == 5
    })
    .await;
    assert!(busy, "workers never picked up the batch");

    let report = h.scheduler.shutdown(Duration::from_millis(50)).await;
    assert_eq!(report.in_flight_aborted, 5);
    assert_eq!(report.pending_cancelled, 3);

    let results = h.scheduler.await_all(handle).await;
    assert_eq!(results.len(), 8);
    assert!(results.values().all(|r| r.status == TaskStatus::Cancelled));

    assert_eq!(h.factory.created(), h.factory.destroyed());
    assert_eq!(h.factory.live(), 0);
    assert_eq!(h.scheduler.pool_stats().leased, 0);
}

#[tokio::test]
async fn shutdown_with_slow_teardown_destroys_every_session() {
    let factory = MockSessionFactory::new().with_destroy_delay(Duration::from_millis(50));
    let extractor = MockExtractor::new().with_delay(Duration::from_secs(10));
    let h = harness_with_factory(factory, extractor, |config| {
        config.workers = 4;
        config.attempt_timeout = Duration::from_secs(30);
        config.lease_timeout = Duration::from_secs(10);
        config.pool.default_size = 2;
    });

    let handle = h
        .scheduler
        .submit(identifiers(6), &names(&["alpha"]), Priority::Medium)
        .await
        .unwrap();
    // Two workers hold sessions; the other two wait on the pool.
    let busy = wait_until(Duration::from_secs(2), || {
        h.scheduler.pool_stats().leased == 2
            && h.extractor.total_calls() == 2
            && h.scheduler.stats().queued == 2
    })
    .await;
    assert!(busy, "workers never saturated the pool");

    let report = h.scheduler.shutdown(Duration::from_millis(50)).await;
    assert_eq!(report.in_flight_aborted, 4);
    assert_eq!(report.pending_cancelled, 2);

    let results = h.scheduler.await_all(handle).await;
    assert!(results.values().all(|r| r.status == TaskStatus::Cancelled));

    let pool = h.scheduler.pool_stats();
    assert_eq!(h.factory.created(), 2);
    assert_eq!(h.factory.destroyed(), 2);
    assert_eq!(h.factory.live(), 0);
    assert_eq!(pool.created, pool.destroyed);
    assert_eq!(pool.leased, 0);
}

#[tokio::test]
async fn graceful_shutdown_lets_in_flight_work_finish() {
    let extractor = MockExtractor::new().with_delay(Duration::from_millis(50));
    let h = harness(extractor, |config| config.workers = 2);

    let handle = h
        .scheduler
        .submit(["one", "two"], &names(&["alpha"]), Priority::Medium)
        .await
        .unwrap();
    let busy = wait_until(Duration::from_secs(2), || h.extractor.total_calls() == 2).await;
    assert!(busy);

    let report = h.scheduler.shutdown(Duration::from_secs(2)).await;
    assert_eq!(report.in_flight_aborted, 0);
    assert_eq!(report.pending_cancelled, 0);

    let results = h.scheduler.await_all(handle).await;
    assert!(results.values().all(|r| r.status == TaskStatus::Succeeded));
    assert_eq!(h.factory.live(), 0);
    assert_eq!(h.reporter.count("stopped"), 2);
}

#[tokio::test]
async fn submissions_are_refused_once_shutdown_begins() {
    let h = harness(MockExtractor::new(), |_| {});
    h.scheduler.shutdown(Duration::from_millis(50)).await;

    let err = h
        .scheduler
        .submit(["late"], &names(&["alpha"]), Priority::Critical)
        .await
        .err()
        .unwrap();
    assert!(matches!(err, AppError::ShuttingDown));
    assert_eq!(h.extractor.total_calls(), 0);
}
