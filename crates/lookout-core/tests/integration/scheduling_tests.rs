use std::time::Duration;

use lookout_core::testutil::MockExtractor;
use lookout_core::{EndpointSnapshot, ErrorCategory, Priority, TaskStatus};

use crate::common::{harness, identifiers, names};

#[tokio::test]
async fn hundred_identifiers_over_two_endpoints_all_succeed() {
    let h = harness(MockExtractor::new(), |config| config.workers = 4);
    let ids = identifiers(100);

    let handle = h
        .scheduler
        .submit(ids.clone(), &names(&["alpha", "beta"]), Priority::Medium)
        .await
        .unwrap();
    let results = h.scheduler.await_all(handle).await;

    assert_eq!(results.len(), 100);
    for id in &ids {
        let report = &results[id];
        assert_eq!(report.status, TaskStatus::Succeeded, "{id} did not succeed");
        assert!(report.failure.is_none());
        assert_eq!(report.payload.as_ref().unwrap()["identifier"], id.as_str());
    }

    let stats = h.scheduler.stats();
    let successes: u64 = stats.endpoints.iter().map(|e| e.successes).sum();
    assert_eq!(successes, 100);
    assert_eq!(stats.queued, 0);

    h.scheduler.shutdown(Duration::from_millis(200)).await;
    assert_eq!(h.factory.live(), 0);
}

#[tokio::test]
async fn critical_batch_overtakes_queued_low_batch() {
    let extractor = MockExtractor::new().with_delay(Duration::from_millis(20));
    let h = harness(extractor, |config| config.workers = 1);
    let endpoints = names(&["alpha"]);

    let low = h
        .scheduler
        .submit(
            (0..5).map(|i| format!("low-{i}")),
            &endpoints,
            Priority::Low,
        )
        .await
        .unwrap();
    let critical = h
        .scheduler
        .submit(
            (0..5).map(|i| format!("crit-{i}")),
            &endpoints,
            Priority::Critical,
        )
        .await
        .unwrap();

    let low = h.scheduler.await_all(low).await;
    let critical = h.scheduler.await_all(critical).await;

    let first_critical = critical.values().map(|r| r.finished_at).min().unwrap();
    let low_before = low
        .values()
        .filter(|r| r.finished_at < first_critical)
        .count();
    // Only the low task already in hand when the critical batch arrived.
    assert!(low_before <= 1, "{low_before} low tasks ran before critical work");

    h.scheduler.shutdown(Duration::from_millis(200)).await;
}

#[tokio::test]
async fn stats_snapshots_are_monotonic_and_read_only() {
    let extractor = MockExtractor::new().with_delay(Duration::from_millis(2));
    extractor.fail_times("beta", 8, ErrorCategory::RemoteUnavailable);
    let h = harness(extractor, |config| config.workers = 3);

    let handle = h
        .scheduler
        .submit(identifiers(60), &names(&["alpha", "beta"]), Priority::Medium)
        .await
        .unwrap();

    let poll = async {
        let mut previous: Vec<EndpointSnapshot> = Vec::new();
        for _ in 0..40 {
            let current = h.scheduler.stats().endpoints;
            for before in &previous {
                if let Some(now) = current.iter().find(|e| e.endpoint == before.endpoint) {
                    assert!(now.successes >= before.successes);
                    assert!(now.failures >= before.failures);
                    assert!(now.total_attempts >= before.total_attempts);
                }
            }
            previous = current;
            tokio::time::sleep(Duration::from_millis(3)).await;
        }
    };
    let (results, ()) = tokio::join!(h.scheduler.await_all(handle), poll);
    assert!(results.values().all(|r| r.status == TaskStatus::Succeeded));

    let first = h.scheduler.stats();
    let second = h.scheduler.stats();
    assert_eq!(first.endpoints, second.endpoints);
    assert_eq!(first.pool, second.pool);

    h.scheduler.shutdown(Duration::from_millis(200)).await;
}

#[tokio::test]
async fn repeated_identifiers_across_batches_hit_the_cache() {
    let extractor = MockExtractor::new();
    let h = harness(extractor, |_| {});
    let endpoints = names(&["alpha", "beta"]);

    let first = h
        .scheduler
        .submit(identifiers(10), &endpoints, Priority::Medium)
        .await
        .unwrap();
    h.scheduler.await_all(first).await;
    let calls = h.extractor.total_calls();

    let second = h
        .scheduler
        .submit(identifiers(10), &endpoints, Priority::Medium)
        .await
        .unwrap();
    let results = h.scheduler.await_all(second).await;

    assert!(results.values().all(|r| r.cached && r.is_success()));
    assert_eq!(h.extractor.total_calls(), calls);
    h.scheduler.shutdown(Duration::from_millis(200)).await;
}

#[tokio::test]
async fn repeatedly_failing_task_is_demoted() {
    let extractor = MockExtractor::new();
    extractor.fail_times("alpha", 2, ErrorCategory::Network);
    let h = harness(extractor, |config| {
        config.workers = 1;
        config.retry.network.max_attempts = 1;
        config.aging.demote_after_failures = 2;
    });

    let handle = h
        .scheduler
        .submit(["slow"], &names(&["alpha"]), Priority::High)
        .await
        .unwrap();
    let report = h.scheduler.await_all(handle).await.remove("slow").unwrap();

    assert_eq!(report.status, TaskStatus::Succeeded);
    assert_eq!(report.attempts, 3);
    assert_eq!(h.reporter.count("demoted"), 1);
    assert_eq!(h.reporter.count("requeued"), 2);
    h.scheduler.shutdown(Duration::from_millis(200)).await;
}
