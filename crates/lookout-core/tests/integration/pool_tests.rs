use std::collections::HashSet;
use std::time::Duration;

use lookout_core::testutil::MockExtractor;
use lookout_core::{EndpointConfig, ErrorCategory, OrchestratorConfig, Priority, TaskStatus};

use crate::common::{harness, identifiers, names};

fn shared_group(config: &mut OrchestratorConfig, endpoints: &[&str], size: usize) {
    for endpoint in endpoints {
        config.endpoints.insert(
            endpoint.to_string(),
            EndpointConfig {
                group: Some("shared".into()),
                priority: EndpointConfig::DEFAULT_PRIORITY,
            },
        );
    }
    config.pool.group_sizes.insert("shared".into(), size);
}

#[tokio::test]
async fn lease_timeouts_are_retried_without_deadlock() {
    let extractor = MockExtractor::new().with_delay(Duration::from_millis(30));
    let h = harness(extractor, |config| {
        config.workers = 6;
        config.lease_timeout = Duration::from_millis(50);
        config.max_task_attempts = 100;
        shared_group(config, &["alpha", "beta"], 1);
    });

    let handle = h
        .scheduler
        .submit(identifiers(10), &names(&["alpha", "beta"]), Priority::Medium)
        .await
        .unwrap();
    let results = tokio::time::timeout(Duration::from_secs(10), h.scheduler.await_all(handle))
        .await
        .expect("scheduler stalled waiting for leases");

    assert!(results.values().all(|r| r.status == TaskStatus::Succeeded));
    assert!(h.reporter.count("lease_unavailable") > 0);
    assert!(h.factory.live() <= 1);
    assert_eq!(h.extractor.overlaps(), 0);

    h.scheduler.shutdown(Duration::from_millis(200)).await;
    assert_eq!(h.factory.live(), 0);
}

#[tokio::test]
async fn lease_timeout_is_reported_as_remote_unavailable() {
    let extractor = MockExtractor::new().with_delay(Duration::from_millis(40));
    let h = harness(extractor, |config| {
        config.workers = 5;
        config.lease_timeout = Duration::from_millis(20);
        config.max_task_attempts = 1;
        shared_group(config, &["alpha"], 1);
    });

    let handle = h
        .scheduler
        .submit(identifiers(5), &names(&["alpha"]), Priority::Medium)
        .await
        .unwrap();
    let results = h.scheduler.await_all(handle).await;

    let exhausted: Vec<_> = results
        .values()
        .filter(|r| r.status == TaskStatus::Exhausted)
        .collect();
    assert!(!exhausted.is_empty());
    assert!(results.values().any(|r| r.is_success()));
    for report in exhausted {
        let failure = report.failure.as_ref().unwrap();
        assert_eq!(failure.category, Some(ErrorCategory::RemoteUnavailable));
        // Never reached the endpoint.
        assert!(failure.endpoints_tried.is_empty());
    }

    h.scheduler.shutdown(Duration::from_millis(200)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shared_group_leases_are_never_handed_out_twice() {
    let extractor = MockExtractor::new().with_delay(Duration::from_millis(1));
    let h = harness(extractor, |config| {
        config.workers = 8;
        shared_group(config, &["alpha", "beta", "gamma"], 3);
    });

    let handle = h
        .scheduler
        .submit(
            identifiers(200),
            &names(&["alpha", "beta", "gamma"]),
            Priority::Medium,
        )
        .await
        .unwrap();

    let watch = async {
        for _ in 0..50 {
            let leases = h.scheduler.active_leases();
            let distinct: HashSet<_> = leases.iter().collect();
            assert_eq!(distinct.len(), leases.len());
            assert!(leases.len() <= 3, "{} leases out of a pool of 3", leases.len());
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    };
    let (results, ()) = tokio::join!(h.scheduler.await_all(handle), watch);

    assert_eq!(results.len(), 200);
    assert!(results.values().all(|r| r.is_success()));
    assert_eq!(h.extractor.overlaps(), 0);
    assert!(h.factory.created() <= 3);

    h.scheduler.shutdown(Duration::from_millis(200)).await;
    assert_eq!(h.factory.created(), h.factory.destroyed());
}
