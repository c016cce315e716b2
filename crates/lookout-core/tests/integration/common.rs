use std::time::Duration;

use lookout_core::testutil::{MockExtractor, MockReporter, MockSessionFactory, fast_config};
use lookout_core::{AppErrorClassifier, NoopHook, OrchestratorConfig, Scheduler};

pub type TestScheduler =
    Scheduler<MockSessionFactory, MockExtractor, AppErrorClassifier, NoopHook, MockReporter>;

pub struct Harness {
    pub scheduler: TestScheduler,
    pub factory: MockSessionFactory,
    pub extractor: MockExtractor,
    pub reporter: MockReporter,
}

/// Scheduler wired to fresh mocks. `configure` tweaks the fast test config.
pub fn harness(
    extractor: MockExtractor,
    configure: impl FnOnce(&mut OrchestratorConfig),
) -> Harness {
    harness_with_factory(MockSessionFactory::new(), extractor, configure)
}

pub fn harness_with_factory(
    factory: MockSessionFactory,
    extractor: MockExtractor,
    configure: impl FnOnce(&mut OrchestratorConfig),
) -> Harness {
    let mut config = fast_config();
    configure(&mut config);

    let reporter = MockReporter::new();
    let scheduler = Scheduler::builder(config, factory.clone(), extractor.clone(), AppErrorClassifier)
        .with_reporter(reporter.clone())
        .build()
        .unwrap();

    Harness {
        scheduler,
        factory,
        extractor,
        reporter,
    }
}

pub fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

pub fn identifiers(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("400638133{i:04}")).collect()
}

/// Poll `condition` every few milliseconds until it holds or `limit` passes.
pub async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
