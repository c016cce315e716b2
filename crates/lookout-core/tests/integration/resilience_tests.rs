use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lookout_core::stats::StatsConfig;
use lookout_core::testutil::MockExtractor;
use lookout_core::{
    CircuitBreakerConfig, CircuitState, EndpointConfig, EndpointRegistry, ErrorCategory,
    Priority, TaskStatus,
};
use tokio::sync::Barrier;

use crate::common::{harness, identifiers, names};

#[tokio::test]
async fn failing_endpoint_opens_circuit_and_traffic_moves_on() {
    let extractor = MockExtractor::new();
    extractor.fail_always("alpha", ErrorCategory::Network);
    let h = harness(extractor, |config| {
        config.workers = 1;
        config.retry.network.max_attempts = 5;
        config.circuit_breaker.reset_timeout = Duration::from_secs(60);
        config.endpoints.insert(
            "alpha".into(),
            EndpointConfig {
                group: None,
                priority: 10.0,
            },
        );
    });
    let endpoints = names(&["alpha", "beta"]);

    let handle = h
        .scheduler
        .submit(["first"], &endpoints, Priority::Medium)
        .await
        .unwrap();
    let report = h.scheduler.await_all(handle).await.remove("first").unwrap();
    assert_eq!(report.status, TaskStatus::Succeeded);
    assert_eq!(report.endpoint.as_deref(), Some("beta"));
    assert_eq!(h.extractor.calls("alpha"), 5);

    let alpha = h.scheduler.endpoint_stats("alpha").unwrap();
    assert_eq!(alpha.circuit_state, CircuitState::Open);
    assert_eq!(alpha.failures, 5);

    // Later work skips the open endpoint entirely.
    let handle = h
        .scheduler
        .submit(identifiers(10), &endpoints, Priority::Medium)
        .await
        .unwrap();
    let results = h.scheduler.await_all(handle).await;
    assert!(
        results
            .values()
            .all(|r| r.is_success() && r.endpoint.as_deref() == Some("beta"))
    );
    assert_eq!(h.extractor.calls("alpha"), 5);

    h.scheduler.shutdown(Duration::from_millis(200)).await;
}

#[tokio::test]
async fn open_circuit_recovers_after_reset_timeout() {
    let extractor = MockExtractor::new();
    extractor.fail_times("alpha", 5, ErrorCategory::Network);
    let h = harness(extractor, |config| {
        config.workers = 4;
        config.retry.network.max_attempts = 5;
        config.circuit_breaker.reset_timeout = Duration::from_millis(150);
    });

    let started = Instant::now();
    let handle = h
        .scheduler
        .submit(["only"], &names(&["alpha"]), Priority::Medium)
        .await
        .unwrap();
    let report = h.scheduler.await_all(handle).await.remove("only").unwrap();

    assert_eq!(report.status, TaskStatus::Succeeded);
    assert!(started.elapsed() >= Duration::from_millis(150));
    assert_eq!(h.extractor.calls("alpha"), 6);
    assert!(h.reporter.count("deferred") >= 1);

    let alpha = h.scheduler.endpoint_stats("alpha").unwrap();
    assert_eq!(alpha.circuit_state, CircuitState::Closed);
    assert_eq!(alpha.successes, 1);
    assert_eq!(alpha.failures, 5);

    h.scheduler.shutdown(Duration::from_millis(200)).await;
}

#[tokio::test]
async fn unavailable_endpoint_stays_out_for_the_extended_reset_window() {
    let extractor = MockExtractor::new();
    extractor.fail_times("alpha", 2, ErrorCategory::RemoteUnavailable);
    let h = harness(extractor, |config| {
        config.workers = 1;
        config.retry.remote_unavailable.max_attempts = 2;
        config.circuit_breaker.failure_threshold = 2;
        config.circuit_breaker.reset_timeout = Duration::from_millis(100);
        config.circuit_breaker.remote_unavailable_multiplier = 4.0;
        config.circuit_breaker.max_reset_timeout = Duration::from_secs(2);
    });

    let started = Instant::now();
    let handle = h
        .scheduler
        .submit(["only"], &names(&["alpha"]), Priority::Medium)
        .await
        .unwrap();

    // Well past the base reset timeout, the circuit is still open.
    tokio::time::sleep(Duration::from_millis(250)).await;
    let alpha = h.scheduler.endpoint_stats("alpha").unwrap();
    assert_eq!(alpha.circuit_state, CircuitState::Open);
    assert_eq!(h.extractor.calls("alpha"), 2);
    assert!(h.scheduler.rank(&names(&["alpha"])).is_empty());

    let report = h.scheduler.await_all(handle).await.remove("only").unwrap();
    assert_eq!(report.status, TaskStatus::Succeeded);
    assert!(started.elapsed() >= Duration::from_millis(400));
    assert_eq!(h.extractor.calls("alpha"), 3);
    assert_eq!(
        h.scheduler.endpoint_stats("alpha").unwrap().circuit_state,
        CircuitState::Closed
    );

    h.scheduler.shutdown(Duration::from_millis(200)).await;
}

#[tokio::test]
async fn task_blocked_on_open_circuits_is_exhausted_after_timeout() {
    let extractor = MockExtractor::new();
    extractor.fail_always("alpha", ErrorCategory::Network);
    let h = harness(extractor, |config| {
        config.retry.network.max_attempts = 5;
        config.circuit_breaker.reset_timeout = Duration::from_secs(10);
        config.all_open_timeout = Duration::from_millis(100);
    });

    let handle = h
        .scheduler
        .submit(["stuck"], &names(&["alpha"]), Priority::Medium)
        .await
        .unwrap();
    let report = h.scheduler.await_all(handle).await.remove("stuck").unwrap();

    assert_eq!(report.status, TaskStatus::Exhausted);
    let failure = report.failure.unwrap();
    assert_eq!(failure.endpoints_tried, names(&["alpha"]));
    assert_eq!(h.extractor.calls("alpha"), 5);

    h.scheduler.shutdown(Duration::from_millis(200)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn half_open_admits_exactly_one_trial_under_contention() {
    let registry = EndpointRegistry::new(
        CircuitBreakerConfig {
            failure_threshold: 1,
            reset_timeout: Duration::from_millis(50),
            ..Default::default()
        },
        StatsConfig::default(),
    );
    registry
        .admit("alpha")
        .unwrap()
        .failure(ErrorCategory::Network, Duration::from_millis(1));
    assert!(!registry.is_available("alpha"));
    tokio::time::sleep(Duration::from_millis(80)).await;

    let barrier = Arc::new(Barrier::new(32));
    let contenders: Vec<_> = (0..32)
        .map(|_| {
            let registry = registry.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                barrier.wait().await;
                match registry.admit("alpha") {
                    Ok(permit) => {
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        permit.success(Duration::from_millis(30));
                        true
                    }
                    Err(_) => false,
                }
            })
        })
        .collect();

    let admitted = futures::future::join_all(contenders)
        .await
        .into_iter()
        .filter(|joined| *joined.as_ref().unwrap())
        .count();
    assert_eq!(admitted, 1);
    assert_eq!(
        registry.snapshot("alpha").unwrap().circuit_state,
        CircuitState::Closed
    );
}

#[tokio::test]
async fn endpoints_tried_are_distinct_and_bounded_by_candidates() {
    let extractor = MockExtractor::new();
    extractor.fail_always("alpha", ErrorCategory::Network);
    extractor.fail_always("beta", ErrorCategory::ValidationFailure);
    extractor.fail_always("gamma", ErrorCategory::ExtractionFailure);
    let h = harness(extractor, |config| {
        config.workers = 4;
        config.max_task_attempts = 10;
        config.all_open_timeout = Duration::from_millis(200);
    });
    let endpoints = names(&["alpha", "beta", "gamma"]);

    let handle = h
        .scheduler
        .submit(identifiers(20), &endpoints, Priority::Medium)
        .await
        .unwrap();
    let results = h.scheduler.await_all(handle).await;

    assert_eq!(results.len(), 20);
    for report in results.values() {
        assert_eq!(report.status, TaskStatus::Exhausted);
        let tried = &report.failure.as_ref().unwrap().endpoints_tried;
        let distinct: HashSet<_> = tried.iter().collect();
        assert_eq!(distinct.len(), tried.len(), "duplicates in {tried:?}");
        assert!(tried.len() <= endpoints.len());
        assert!(tried.iter().all(|e| endpoints.contains(e)));
        assert!(report.attempts <= 10);
    }

    h.scheduler.shutdown(Duration::from_millis(200)).await;
}
