//! Top-level coordinator: accepts submissions, runs N workers over the
//! shared priority queue, collects results per batch and shuts down cleanly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cache::ResultCache;
use crate::config::OrchestratorConfig;
use crate::error::AppError;
use crate::executor::ResilientExecutor;
use crate::models::{
    EndpointSnapshot, PoolStats, SchedulerStats, ShutdownReport, TaskFailure, TaskReport,
};
use crate::pool::SessionPool;
use crate::queue::TaskQueue;
use crate::selector::{EndpointSelector, RankedEndpoint};
use crate::stats::EndpointRegistry;
use crate::task::{Priority, Task, TaskStatus};
use crate::traits::{AttemptHook, ErrorClassifier, Extractor, NoopHook, SessionFactory};
use crate::util::dedupe_preserving_order;
use crate::worker::{Runtime, TracingWorkerReporter, Worker, WorkerReporter};

/// Results of one `submit` call, redeemed with [`Scheduler::await_all`].
pub struct BatchHandle {
    id: Uuid,
    identifiers: Vec<String>,
    receiver: mpsc::UnboundedReceiver<TaskReport>,
}

impl BatchHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Distinct identifiers in submission order.
    pub fn identifiers(&self) -> &[String] {
        &self.identifiers
    }

    pub fn len(&self) -> usize {
        self.identifiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identifiers.is_empty()
    }
}

/// Builder for [`Scheduler`]. Hook and reporter default to no-op and tracing.
pub struct SchedulerBuilder<F, X, C, H, R> {
    config: OrchestratorConfig,
    factory: F,
    extractor: X,
    classifier: C,
    hook: H,
    reporter: R,
}

impl<F, X, C, H, R> SchedulerBuilder<F, X, C, H, R>
where
    F: SessionFactory,
    X: Extractor<F::Session>,
    C: ErrorClassifier<X::Error>,
    H: AttemptHook,
    R: WorkerReporter,
{
    pub fn with_hook<H2: AttemptHook>(self, hook: H2) -> SchedulerBuilder<F, X, C, H2, R> {
        SchedulerBuilder {
            config: self.config,
            factory: self.factory,
            extractor: self.extractor,
            classifier: self.classifier,
            hook,
            reporter: self.reporter,
        }
    }

    pub fn with_reporter<R2: WorkerReporter>(
        self,
        reporter: R2,
    ) -> SchedulerBuilder<F, X, C, H, R2> {
        SchedulerBuilder {
            config: self.config,
            factory: self.factory,
            extractor: self.extractor,
            classifier: self.classifier,
            hook: self.hook,
            reporter,
        }
    }

    /// Validate configuration and start the workers.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn build(self) -> Result<Scheduler<F, X, C, H, R>, AppError> {
        let config = self.config;
        config.validate()?;

        let registry = EndpointRegistry::new(config.circuit_breaker.clone(), config.stats.clone());
        let runtime = Arc::new(Runtime {
            queue: TaskQueue::new(config.queue_capacity),
            selector: EndpointSelector::new(registry.clone(), config.endpoints.clone()),
            pool: SessionPool::new(self.factory, config.pool.clone()),
            executor: ResilientExecutor::new(
                registry.clone(),
                config.retry.clone(),
                self.classifier,
                config.attempt_timeout,
            ),
            extractor: self.extractor,
            hook: self.hook,
            cache: ResultCache::new(&config.cache),
            aborted: AtomicUsize::new(0),
            config,
        });

        let reporter = Arc::new(self.reporter);
        let stop = CancellationToken::new();
        let abort = CancellationToken::new();
        let workers = (0..runtime.config.workers)
            .map(|i| {
                let worker = Worker::new(format!("worker-{i}"), runtime.clone(), reporter.clone());
                tokio::spawn(worker.run(stop.clone(), abort.clone()))
            })
            .collect();

        tracing::info!(
            workers = runtime.config.workers,
            queue_capacity = runtime.config.queue_capacity,
            "Scheduler started"
        );

        Ok(Scheduler {
            runtime,
            registry,
            stop,
            abort,
            workers: Mutex::new(workers),
            gate: Mutex::new(true),
            reporter,
        })
    }
}

/// Task scheduler over a bounded worker set.
pub struct Scheduler<F, X, C, H = NoopHook, R = TracingWorkerReporter>
where
    F: SessionFactory,
{
    runtime: Arc<Runtime<F, X, C, H>>,
    registry: EndpointRegistry,
    stop: CancellationToken,
    abort: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
    /// `true` while submissions are accepted. Held across the queue insert so
    /// shutdown cannot slip in between the check and the push.
    gate: Mutex<bool>,
    reporter: Arc<R>,
}

impl<F, X, C> Scheduler<F, X, C, NoopHook, TracingWorkerReporter>
where
    F: SessionFactory,
    X: Extractor<F::Session>,
    C: ErrorClassifier<X::Error>,
{
    pub fn builder(
        config: OrchestratorConfig,
        factory: F,
        extractor: X,
        classifier: C,
    ) -> SchedulerBuilder<F, X, C, NoopHook, TracingWorkerReporter> {
        SchedulerBuilder {
            config,
            factory,
            extractor,
            classifier,
            hook: NoopHook,
            reporter: TracingWorkerReporter,
        }
    }
}

fn lock_or_recover<'a, T>(mutex: &'a Mutex<T>, what: &str) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("{what} mutex poisoned, recovering");
        poisoned.into_inner()
    })
}

impl<F, X, C, H, R> Scheduler<F, X, C, H, R>
where
    F: SessionFactory,
    X: Extractor<F::Session>,
    C: ErrorClassifier<X::Error>,
    H: AttemptHook,
    R: WorkerReporter,
{
    pub fn config(&self) -> &OrchestratorConfig {
        &self.runtime.config
    }

    pub fn reporter(&self) -> &R {
        &self.reporter
    }

    /// Submit identifiers to be looked up on `endpoints`.
    ///
    /// Duplicate identifiers and endpoints are collapsed. Identifiers with a
    /// cached payload on one of the endpoints are answered immediately.
    ///
    /// # Errors
    ///
    /// `InvalidInput` for an empty endpoint list or a blank identifier or
    /// endpoint, `ShuttingDown` after [`Self::shutdown`], `QueueFull` when the
    /// batch does not fit.
    pub async fn submit<I, S>(
        &self,
        identifiers: I,
        endpoints: &[String],
        priority: Priority,
    ) -> Result<BatchHandle, AppError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if !*lock_or_recover(&self.gate, "Submission gate") {
            return Err(AppError::ShuttingDown);
        }

        let endpoints = dedupe_preserving_order(endpoints.iter().cloned());
        if endpoints.is_empty() {
            return Err(AppError::InvalidInput("endpoint list is empty".into()));
        }
        if endpoints.iter().any(|e| e.trim().is_empty()) {
            return Err(AppError::InvalidInput("endpoint IDs must not be blank".into()));
        }
        let identifiers = dedupe_preserving_order(identifiers);
        if identifiers.iter().any(|id| id.trim().is_empty()) {
            return Err(AppError::InvalidInput("identifiers must not be blank".into()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let mut tasks = Vec::with_capacity(identifiers.len());
        let mut hits = Vec::new();
        for identifier in &identifiers {
            match self.runtime.cache.find(&endpoints, identifier).await {
                Some((endpoint, payload)) => hits.push(TaskReport {
                    identifier: identifier.clone(),
                    status: TaskStatus::Succeeded,
                    payload: Some(payload),
                    failure: None,
                    endpoint: Some(endpoint),
                    attempts: 0,
                    cached: true,
                    finished_at: Utc::now(),
                }),
                None => tasks.push(
                    Task::new(identifier.clone(), endpoints.clone(), priority).with_reply(tx.clone()),
                ),
            }
        }

        let queued = tasks.len();
        {
            let gate = lock_or_recover(&self.gate, "Submission gate");
            if !*gate {
                return Err(AppError::ShuttingDown);
            }
            self.runtime.queue.submit(tasks)?;
        }

        let batch = BatchHandle {
            id: Uuid::new_v4(),
            identifiers,
            receiver: rx,
        };
        tracing::info!(
            batch_id = %batch.id,
            identifiers = batch.len(),
            endpoints = endpoints.len(),
            queued,
            cached = hits.len(),
            %priority,
            "Batch submitted"
        );
        for report in hits {
            // The receiver is alive: it is inside `batch`.
            let _ = tx.send(report);
        }
        Ok(batch)
    }

    /// Wait for every identifier in the batch to reach a terminal status.
    pub async fn await_all(&self, mut handle: BatchHandle) -> HashMap<String, TaskReport> {
        let mut results = HashMap::with_capacity(handle.len());
        while results.len() < handle.len() {
            match handle.receiver.recv().await {
                Some(report) => {
                    results.insert(report.identifier.clone(), report);
                }
                None => break,
            }
        }

        // A task can only vanish without reporting if its worker panicked.
        for identifier in &handle.identifiers {
            results.entry(identifier.clone()).or_insert_with(|| {
                tracing::error!(batch_id = %handle.id, %identifier, "Task lost without a result");
                TaskReport {
                    identifier: identifier.clone(),
                    status: TaskStatus::Cancelled,
                    payload: None,
                    failure: Some(TaskFailure {
                        category: None,
                        message: "task was lost before reporting a result".into(),
                        endpoints_tried: Vec::new(),
                    }),
                    endpoint: None,
                    attempts: 0,
                    cached: false,
                    finished_at: Utc::now(),
                }
            });
        }
        results
    }

    /// Stop accepting work, let in-flight tasks finish for up to
    /// `drain_timeout`, then interrupt them, cancel everything still queued
    /// and close the session pool.
    pub async fn shutdown(&self, drain_timeout: Duration) -> ShutdownReport {
        *lock_or_recover(&self.gate, "Submission gate") = false;
        tracing::info!(drain_timeout_ms = drain_timeout.as_millis() as u64, "Scheduler shutting down");
        self.stop.cancel();

        let handles = std::mem::take(&mut *lock_or_recover(&self.workers, "Worker list"));
        let deadline = tokio::time::Instant::now() + drain_timeout;
        let mut pending = handles.into_iter();
        let mut remaining = Vec::new();
        while let Some(mut handle) = pending.next() {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "Worker ended abnormally"),
                Err(_) => {
                    remaining.push(handle);
                    remaining.extend(pending);
                    break;
                }
            }
        }

        self.abort.cancel();
        if !remaining.is_empty() {
            tracing::info!(workers = remaining.len(), "Drain timeout elapsed, aborting in-flight attempts");
            for handle in remaining {
                if let Err(e) = handle.await {
                    tracing::warn!(error = %e, "Worker ended abnormally");
                }
            }
        }

        let drained = self.runtime.queue.drain();
        let pending_cancelled = drained.len();
        for task in drained {
            task.terminate(
                TaskStatus::Cancelled,
                Some("scheduler shut down before the task ran"),
            );
        }

        self.runtime.pool.close_all().await;

        let report = ShutdownReport {
            pending_cancelled,
            in_flight_aborted: self.runtime.aborted.load(Ordering::SeqCst),
        };
        tracing::info!(
            pending_cancelled = report.pending_cancelled,
            in_flight_aborted = report.in_flight_aborted,
            "Scheduler stopped"
        );
        report
    }

    pub fn is_accepting(&self) -> bool {
        *lock_or_recover(&self.gate, "Submission gate")
    }

    /// Read-only snapshot; never changes any state.
    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            endpoints: self.registry.snapshot_all(),
            pool: self.runtime.pool.stats(),
            queued: self.runtime.queue.len(),
        }
    }

    pub fn endpoint_stats(&self, endpoint: &str) -> Option<EndpointSnapshot> {
        self.registry.snapshot(endpoint)
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.runtime.pool.stats()
    }

    pub fn active_leases(&self) -> Vec<Uuid> {
        self.runtime.pool.active_leases()
    }

    /// Current ranking of `candidates`, best first. Open circuits are omitted.
    pub fn rank(&self, candidates: &[String]) -> Vec<RankedEndpoint> {
        self.runtime.selector.rank(candidates)
    }

    /// Administrative reset of one endpoint's stats and breaker.
    pub fn reset_endpoint(&self, endpoint: &str) -> bool {
        self.registry.reset(endpoint)
    }
}

impl<F, X, C, H, R> Drop for Scheduler<F, X, C, H, R>
where
    F: SessionFactory,
{
    fn drop(&mut self) {
        self.stop.cancel();
        self.abort.cancel();
    }
}
