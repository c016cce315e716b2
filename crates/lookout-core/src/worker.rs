use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cache::ResultCache;
use crate::config::OrchestratorConfig;
use crate::error::{AppError, ErrorCategory};
use crate::executor::{ExecutionError, ResilientExecutor};
use crate::pool::SessionPool;
use crate::queue::TaskQueue;
use crate::selector::EndpointSelector;
use crate::task::{Priority, Task, TaskStatus};
use crate::traits::{AttemptHook, ErrorClassifier, Extractor, SessionFactory};

/// Events emitted by workers for monitoring/logging.
#[derive(Debug, Clone)]
pub enum WorkerEvent<'a> {
    Started {
        worker_id: &'a str,
    },
    TaskStarted {
        task_id: Uuid,
        identifier: &'a str,
        endpoint: &'a str,
        attempt: u32,
    },
    TaskSucceeded {
        task_id: Uuid,
        identifier: &'a str,
        endpoint: &'a str,
    },
    AttemptFailed {
        task_id: Uuid,
        endpoint: &'a str,
        category: ErrorCategory,
        error: &'a str,
    },
    LeaseUnavailable {
        task_id: Uuid,
        group: &'a str,
        error: &'a str,
    },
    /// Every candidate circuit is open; the task waits.
    Deferred {
        task_id: Uuid,
        identifier: &'a str,
        delay: Duration,
    },
    Requeued {
        task_id: Uuid,
        delay: Duration,
        priority: Priority,
    },
    Demoted {
        task_id: Uuid,
        priority: Priority,
    },
    TaskFinished {
        task_id: Uuid,
        identifier: &'a str,
        status: TaskStatus,
    },
    Stopped {
        worker_id: &'a str,
    },
}

/// Trait for receiving worker events (decoupled logging).
pub trait WorkerReporter: Send + Sync + 'static {
    fn report(&self, event: WorkerEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingWorkerReporter;

impl WorkerReporter for TracingWorkerReporter {
    fn report(&self, event: WorkerEvent<'_>) {
        match event {
            WorkerEvent::Started { worker_id } => {
                tracing::info!(%worker_id, "Worker started");
            }
            WorkerEvent::TaskStarted {
                task_id,
                identifier,
                endpoint,
                attempt,
            } => {
                tracing::debug!(%task_id, %identifier, %endpoint, attempt, "Processing task");
            }
            WorkerEvent::TaskSucceeded {
                task_id,
                identifier,
                endpoint,
            } => {
                tracing::info!(%task_id, %identifier, %endpoint, "Task succeeded");
            }
            WorkerEvent::AttemptFailed {
                task_id,
                endpoint,
                category,
                error,
            } => {
                tracing::warn!(%task_id, %endpoint, %category, %error, "Attempt failed");
            }
            WorkerEvent::LeaseUnavailable {
                task_id,
                group,
                error,
            } => {
                tracing::warn!(%task_id, %group, %error, "No session available");
            }
            WorkerEvent::Deferred {
                task_id,
                identifier,
                delay,
            } => {
                tracing::debug!(
                    %task_id,
                    %identifier,
                    delay_ms = delay.as_millis() as u64,
                    "All candidate circuits open, deferring"
                );
            }
            WorkerEvent::Requeued {
                task_id,
                delay,
                priority,
            } => {
                tracing::debug!(%task_id, delay_ms = delay.as_millis() as u64, %priority, "Task requeued");
            }
            WorkerEvent::Demoted { task_id, priority } => {
                tracing::info!(%task_id, %priority, "Task demoted");
            }
            WorkerEvent::TaskFinished {
                task_id,
                identifier,
                status,
            } => {
                tracing::info!(%task_id, %identifier, %status, "Task finished");
            }
            WorkerEvent::Stopped { worker_id } => {
                tracing::info!(%worker_id, "Worker stopped");
            }
        }
    }
}

/// State shared by the scheduler and all of its workers.
pub(crate) struct Runtime<F: SessionFactory, X, C, H> {
    pub config: OrchestratorConfig,
    pub queue: TaskQueue,
    pub selector: EndpointSelector,
    pub pool: SessionPool<F>,
    pub executor: ResilientExecutor<C>,
    pub extractor: X,
    pub hook: H,
    pub cache: ResultCache,
    pub aborted: AtomicUsize,
}

/// One of the scheduler's N workers.
pub(crate) struct Worker<F: SessionFactory, X, C, H, R> {
    id: String,
    runtime: Arc<Runtime<F, X, C, H>>,
    reporter: Arc<R>,
}

impl<F, X, C, H, R> Worker<F, X, C, H, R>
where
    F: SessionFactory,
    X: Extractor<F::Session>,
    C: ErrorClassifier<X::Error>,
    H: AttemptHook,
    R: WorkerReporter,
{
    pub fn new(id: String, runtime: Arc<Runtime<F, X, C, H>>, reporter: Arc<R>) -> Self {
        Self {
            id,
            runtime,
            reporter,
        }
    }

    /// Pull tasks until `stop` fires. `abort` interrupts the task in hand.
    pub async fn run(self, stop: CancellationToken, abort: CancellationToken) {
        self.reporter.report(WorkerEvent::Started { worker_id: &self.id });

        while let Some(task) = self.runtime.queue.pop(&stop).await {
            self.process(task, &abort).await;
        }

        self.reporter.report(WorkerEvent::Stopped { worker_id: &self.id });
    }

    async fn process(&self, mut task: Task, abort: &CancellationToken) {
        let rt = &*self.runtime;
        task.status = TaskStatus::Running;

        if !task.has_candidates() {
            self.finish(task, TaskStatus::Exhausted, None);
            return;
        }

        let Some(endpoint) = rt.selector.next(&task) else {
            self.defer(task);
            return;
        };
        task.blocked_since = None;

        let group = rt.config.group_for(&endpoint);
        rt.hook.before_attempt(&endpoint, &task.identifier).await;

        let acquired = tokio::select! {
            biased;
            () = abort.cancelled() => {
                self.abort(task);
                return;
            }
            res = rt.pool.acquire(&group, rt.config.lease_timeout) => res,
        };

        let lease = match acquired {
            Ok(lease) => lease,
            Err(AppError::PoolClosed) => {
                self.abort(task);
                return;
            }
            Err(e) => {
                let message = e.to_string();
                self.reporter.report(WorkerEvent::LeaseUnavailable {
                    task_id: task.id,
                    group: &group,
                    error: &message,
                });
                let category = e.category();
                task.attempts += 1;
                task.record_failure(category, message);
                let delay = rt.executor.retry_policy().delay_for(category, task.attempts - 1);
                self.requeue_or_exhaust(task, delay);
                return;
            }
        };

        task.attempts += 1;
        self.reporter.report(WorkerEvent::TaskStarted {
            task_id: task.id,
            identifier: &task.identifier,
            endpoint: &endpoint,
            attempt: task.attempts,
        });

        let result = {
            let extractor = &rt.extractor;
            let ep = endpoint.as_str();
            let identifier = task.identifier.as_str();
            let session = lease.session();
            rt.executor
                .run(ep, abort, move || extractor.extract(ep, identifier, session))
                .await
        };

        match result {
            Ok(payload) => {
                rt.pool.release(lease, true).await;
                rt.cache
                    .insert(&endpoint, &task.identifier, payload.clone())
                    .await;
                self.reporter.report(WorkerEvent::TaskSucceeded {
                    task_id: task.id,
                    identifier: &task.identifier,
                    endpoint: &endpoint,
                });
                let (task_id, identifier) = (task.id, task.identifier.clone());
                task.succeed(&endpoint, payload);
                self.reporter.report(WorkerEvent::TaskFinished {
                    task_id,
                    identifier: &identifier,
                    status: TaskStatus::Succeeded,
                });
            }
            Err(ExecutionError::Cancelled) => {
                rt.pool.release(lease, false).await;
                self.abort(task);
            }
            Err(ExecutionError::CircuitOpen { retry_after, .. }) => {
                // Nothing was attempted; let selection run again once the circuit may admit.
                rt.pool.release(lease, true).await;
                task.attempts -= 1;
                let delay = open_circuit_delay(retry_after, rt.config.open_circuit_retry_delay);
                self.reporter.report(WorkerEvent::Deferred {
                    task_id: task.id,
                    identifier: &task.identifier,
                    delay,
                });
                rt.queue.push(task, delay);
            }
            Err(ExecutionError::Failed {
                category, message, ..
            }) => {
                rt.pool.release(lease, !category.taints_session()).await;
                self.reporter.report(WorkerEvent::AttemptFailed {
                    task_id: task.id,
                    endpoint: &endpoint,
                    category,
                    error: &message,
                });

                task.mark_tried(&endpoint);
                task.record_failure(category, message);
                if !rt.executor.retry_policy().is_retryable(category) {
                    task.exclude(&endpoint);
                }
                if category == ErrorCategory::RemoteUnavailable {
                    rt.hook
                        .on_remote_unavailable(&endpoint, &task.identifier)
                        .await;
                }

                let delay = if task.has_untried() {
                    Duration::ZERO
                } else {
                    rt.executor
                        .retry_policy()
                        .delay_for(category, task.attempts - 1)
                };
                self.requeue_or_exhaust(task, delay);
            }
        }
    }

    fn requeue_or_exhaust(&self, mut task: Task, delay: Duration) {
        let rt = &*self.runtime;
        if task.attempts >= rt.config.max_task_attempts || !task.has_candidates() {
            self.finish(task, TaskStatus::Exhausted, None);
            return;
        }

        if task.apply_aging(rt.config.aging.demote_after_failures) {
            self.reporter.report(WorkerEvent::Demoted {
                task_id: task.id,
                priority: task.priority,
            });
        }
        self.reporter.report(WorkerEvent::Requeued {
            task_id: task.id,
            delay,
            priority: task.priority,
        });
        rt.queue.push(task, delay);
    }

    /// Every candidate circuit is open: wait, unless that has gone on too long.
    fn defer(&self, mut task: Task) {
        let rt = &*self.runtime;
        let now = Instant::now();
        let since = *task.blocked_since.get_or_insert(now);
        if now.saturating_duration_since(since) >= rt.config.all_open_timeout {
            self.finish(
                task,
                TaskStatus::Exhausted,
                Some("every candidate endpoint stayed unavailable"),
            );
            return;
        }

        let delay = rt.config.open_circuit_retry_delay;
        self.reporter.report(WorkerEvent::Deferred {
            task_id: task.id,
            identifier: &task.identifier,
            delay,
        });
        rt.queue.push(task, delay);
    }

    fn abort(&self, task: Task) {
        self.runtime.aborted.fetch_add(1, Ordering::SeqCst);
        self.finish(
            task,
            TaskStatus::Cancelled,
            Some("scheduler shut down before the task finished"),
        );
    }

    fn finish(&self, task: Task, status: TaskStatus, reason: Option<&str>) {
        let task_id = task.id;
        let report = task.terminate(status, reason);
        self.reporter.report(WorkerEvent::TaskFinished {
            task_id,
            identifier: &report.identifier,
            status,
        });
    }
}

/// Wait before re-selecting after a circuit rejected an already-leased attempt.
///
/// A zero `retry_after` means another caller holds the half-open trial, so the
/// task backs off for the full configured delay rather than spinning.
fn open_circuit_delay(retry_after: Duration, configured: Duration) -> Duration {
    if retry_after.is_zero() {
        configured
    } else {
        retry_after.min(configured)
    }
}
