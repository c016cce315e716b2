//! Test utilities: mock implementations of the collaborator traits.
//!
//! Handwritten mocks for dependency injection in unit and integration tests.
//! All mocks share their state through `Arc`, so a clone handed to the
//! scheduler and the one kept by the test observe the same calls.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::config::OrchestratorConfig;
use crate::error::{AppError, ErrorCategory};
use crate::pool::PoolConfig;
use crate::retry::{CategoryPolicy, RetryPolicy};
use crate::traits::{AttemptHook, Extractor, SessionFactory};
use crate::worker::{WorkerEvent, WorkerReporter};

/// Configuration with millisecond delays so tests run quickly.
pub fn fast_config() -> OrchestratorConfig {
    let quick = |max_attempts, retryable| CategoryPolicy {
        max_attempts,
        base_delay: Duration::from_millis(2),
        max_delay: Duration::from_millis(20),
        jitter: 0.1,
        multiplier: 2.0,
        retryable,
    };
    OrchestratorConfig {
        workers: 2,
        lease_timeout: Duration::from_secs(2),
        attempt_timeout: Duration::from_secs(2),
        max_task_attempts: 6,
        all_open_timeout: Duration::from_secs(2),
        open_circuit_retry_delay: Duration::from_millis(10),
        retry: RetryPolicy {
            network: quick(3, true),
            remote_unavailable: quick(2, true),
            extraction_failure: quick(1, false),
            validation_failure: quick(1, false),
            unknown: quick(2, true),
            min_delay: Duration::from_millis(1),
        },
        circuit_breaker: CircuitBreakerConfig {
            failure_threshold: 5,
            reset_timeout: Duration::from_millis(200),
            ..Default::default()
        },
        pool: PoolConfig::default().with_default_size(2),
        ..Default::default()
    }
}

fn error_for(category: ErrorCategory, endpoint: &str) -> AppError {
    match category {
        ErrorCategory::Network => AppError::NetworkError(format!("{endpoint}: connection reset")),
        ErrorCategory::RemoteUnavailable => {
            AppError::RemoteUnavailable(format!("{endpoint}: 503 service unavailable"))
        }
        ErrorCategory::ExtractionFailure => {
            AppError::ExtractionError(format!("{endpoint}: price element missing"))
        }
        ErrorCategory::ValidationFailure => {
            AppError::ValidationError(format!("{endpoint}: no data for identifier"))
        }
        ErrorCategory::Unknown => AppError::Generic(format!("{endpoint}: something odd")),
    }
}

// ---------------------------------------------------------------------------
// MockSessionFactory
// ---------------------------------------------------------------------------

/// Session handed out by [`MockSessionFactory`].
#[derive(Debug)]
pub struct MockSession {
    pub id: u64,
    pub group: String,
    in_use: AtomicBool,
}

/// Factory that counts creates/destroys and tracks live sessions.
#[derive(Clone, Default)]
pub struct MockSessionFactory {
    next_id: Arc<AtomicU64>,
    created: Arc<AtomicUsize>,
    destroyed: Arc<AtomicUsize>,
    live: Arc<Mutex<HashSet<u64>>>,
    fail_next: Arc<AtomicBool>,
    destroy_delay: Duration,
}

impl MockSessionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `destroy` take `delay` before the session counts as gone.
    pub fn with_destroy_delay(mut self, delay: Duration) -> Self {
        self.destroy_delay = delay;
        self
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Sessions created and not yet destroyed.
    pub fn live(&self) -> usize {
        self.live.lock().unwrap().len()
    }

    pub fn fail_next_create(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

impl SessionFactory for MockSessionFactory {
    type Session = MockSession;

    async fn create(&self, group: &str) -> Result<MockSession, AppError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(AppError::SessionError(format!("cannot start session for {group}")));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.created.fetch_add(1, Ordering::SeqCst);
        self.live.lock().unwrap().insert(id);
        Ok(MockSession {
            id,
            group: group.to_string(),
            in_use: AtomicBool::new(false),
        })
    }

    async fn destroy(&self, session: MockSession) {
        if !self.destroy_delay.is_zero() {
            tokio::time::sleep(self.destroy_delay).await;
        }
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        self.live.lock().unwrap().remove(&session.id);
    }
}

// ---------------------------------------------------------------------------
// MockExtractor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum Script {
    Always(ErrorCategory),
    Times(usize, ErrorCategory),
}

/// Extractor that succeeds with `{"endpoint", "identifier"}` unless scripted
/// to fail for an endpoint. Detects two attempts sharing one session.
#[derive(Clone, Default)]
pub struct MockExtractor {
    scripts: Arc<Mutex<HashMap<String, Script>>>,
    calls: Arc<Mutex<HashMap<String, usize>>>,
    delay: Arc<Mutex<Duration>>,
    overlaps: Arc<AtomicUsize>,
}

struct InUse<'a>(&'a AtomicBool);

impl Drop for InUse<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl MockExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call sleeps this long before answering.
    pub fn with_delay(self, delay: Duration) -> Self {
        *self.delay.lock().unwrap() = delay;
        self
    }

    pub fn fail_always(&self, endpoint: &str, category: ErrorCategory) {
        self.scripts
            .lock()
            .unwrap()
            .insert(endpoint.to_string(), Script::Always(category));
    }

    pub fn fail_times(&self, endpoint: &str, times: usize, category: ErrorCategory) {
        self.scripts
            .lock()
            .unwrap()
            .insert(endpoint.to_string(), Script::Times(times, category));
    }

    pub fn calls(&self, endpoint: &str) -> usize {
        self.calls.lock().unwrap().get(endpoint).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }

    /// Number of times a session was used by two attempts at once.
    pub fn overlaps(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }

    fn next_outcome(&self, endpoint: &str) -> Option<ErrorCategory> {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(endpoint.to_string())
            .or_default() += 1;

        let mut scripts = self.scripts.lock().unwrap();
        match scripts.get_mut(endpoint) {
            Some(Script::Always(category)) => Some(*category),
            Some(Script::Times(remaining, category)) if *remaining > 0 => {
                *remaining -= 1;
                Some(*category)
            }
            _ => None,
        }
    }
}

impl Extractor<MockSession> for MockExtractor {
    type Error = AppError;

    async fn extract(
        &self,
        endpoint: &str,
        identifier: &str,
        session: &MockSession,
    ) -> Result<serde_json::Value, AppError> {
        if session.in_use.swap(true, Ordering::SeqCst) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        let _guard = InUse(&session.in_use);

        let outcome = self.next_outcome(endpoint);
        let delay = *self.delay.lock().unwrap();
        if delay.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(delay).await;
        }

        match outcome {
            Some(category) => Err(error_for(category, endpoint)),
            None => Ok(serde_json::json!({
                "endpoint": endpoint,
                "identifier": identifier,
            })),
        }
    }
}

// ---------------------------------------------------------------------------
// MockHook
// ---------------------------------------------------------------------------

/// Hook that counts its invocations.
#[derive(Clone, Default)]
pub struct MockHook {
    before: Arc<AtomicUsize>,
    unavailable: Arc<AtomicUsize>,
}

impl MockHook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn before_attempts(&self) -> usize {
        self.before.load(Ordering::SeqCst)
    }

    pub fn remote_unavailable(&self) -> usize {
        self.unavailable.load(Ordering::SeqCst)
    }
}

impl AttemptHook for MockHook {
    async fn before_attempt(&self, _endpoint: &str, _identifier: &str) {
        self.before.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_remote_unavailable(&self, _endpoint: &str, _identifier: &str) {
        self.unavailable.fetch_add(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// MockReporter
// ---------------------------------------------------------------------------

/// Reporter that records event names in order.
#[derive(Clone, Default)]
pub struct MockReporter {
    events: Arc<Mutex<Vec<String>>>,
}

impl MockReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events.lock().unwrap().iter().filter(|e| *e == name).count()
    }
}

impl WorkerReporter for MockReporter {
    fn report(&self, event: WorkerEvent<'_>) {
        let name = match event {
            WorkerEvent::Started { .. } => "started",
            WorkerEvent::TaskStarted { .. } => "task_started",
            WorkerEvent::TaskSucceeded { .. } => "task_succeeded",
            WorkerEvent::AttemptFailed { .. } => "attempt_failed",
            WorkerEvent::LeaseUnavailable { .. } => "lease_unavailable",
            WorkerEvent::Deferred { .. } => "deferred",
            WorkerEvent::Requeued { .. } => "requeued",
            WorkerEvent::Demoted { .. } => "demoted",
            WorkerEvent::TaskFinished { .. } => "task_finished",
            WorkerEvent::Stopped { .. } => "stopped",
        };
        self.events.lock().unwrap().push(name.to_string());
    }
}
