//! Retry, timeout and circuit gating around a single extraction call.
//!
//! One [`ResilientExecutor::run`] invocation is the scheduler's unit of work
//! against one endpoint: it retries in place while the failure category's
//! policy allows, and gives up with a classified [`ExecutionError`] so the
//! scheduler can re-route.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::error::ErrorCategory;
use crate::retry::RetryPolicy;
use crate::stats::EndpointRegistry;
use crate::traits::ErrorClassifier;

/// Classified outcome of a failed executor run.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExecutionError {
    #[error("{category} after {attempts} attempt(s): {message}")]
    Failed {
        category: ErrorCategory,
        message: String,
        attempts: u32,
    },

    /// The breaker refused the call before anything was attempted.
    #[error("Circuit open for endpoint '{endpoint}', retry after {}ms", .retry_after.as_millis())]
    CircuitOpen {
        endpoint: String,
        retry_after: Duration,
    },

    #[error("Execution cancelled")]
    Cancelled,
}

impl ExecutionError {
    pub fn category(&self) -> Option<ErrorCategory> {
        match self {
            ExecutionError::Failed { category, .. } => Some(*category),
            ExecutionError::CircuitOpen { .. } | ExecutionError::Cancelled => None,
        }
    }
}

/// Wraps calls with per-attempt timeout, classification, retry and breaker accounting.
#[derive(Clone)]
pub struct ResilientExecutor<C> {
    registry: EndpointRegistry,
    retry: Arc<RetryPolicy>,
    classifier: C,
    attempt_timeout: Duration,
}

impl<C> ResilientExecutor<C> {
    pub fn new(
        registry: EndpointRegistry,
        retry: RetryPolicy,
        classifier: C,
        attempt_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            retry: Arc::new(retry),
            classifier,
            attempt_timeout,
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Run `op` against `endpoint` until it succeeds, its failure category
    /// runs out of in-place attempts, the circuit opens, or `cancel` fires.
    ///
    /// Every attempt is recorded in the endpoint registry exactly once. An
    /// attempt exceeding the timeout is dropped and counts as a network
    /// failure. Cancellation drops the in-flight attempt without recording it.
    pub async fn run<T, E, Fut, Op>(
        &self,
        endpoint: &str,
        cancel: &CancellationToken,
        mut op: Op,
    ) -> Result<T, ExecutionError>
    where
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
        C: ErrorClassifier<E>,
    {
        let mut attempt: u32 = 0;
        let mut last_failure: Option<ExecutionError> = None;

        loop {
            if cancel.is_cancelled() {
                return Err(ExecutionError::Cancelled);
            }

            let permit = match self.registry.admit(endpoint) {
                Ok(permit) => permit,
                Err(retry_after) => {
                    tracing::debug!(%endpoint, retry_after_ms = retry_after.as_millis() as u64, "Circuit rejected attempt");
                    return Err(last_failure.unwrap_or_else(|| ExecutionError::CircuitOpen {
                        endpoint: endpoint.to_string(),
                        retry_after,
                    }));
                }
            };

            attempt += 1;
            let started = Instant::now();
            let outcome = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    drop(permit);
                    return Err(ExecutionError::Cancelled);
                }
                res = tokio::time::timeout(self.attempt_timeout, op()) => res,
            };
            let latency = started.elapsed();

            let (category, message) = match outcome {
                Ok(Ok(value)) => {
                    permit.success(latency);
                    return Ok(value);
                }
                Ok(Err(e)) => (self.classifier.classify(&e), e.to_string()),
                Err(_) => (
                    ErrorCategory::Network,
                    format!(
                        "attempt timed out after {} ms",
                        self.attempt_timeout.as_millis()
                    ),
                ),
            };
            permit.failure(category, latency);

            let will_retry = self.retry.allows_another(category, attempt);
            tracing::debug!(
                %endpoint,
                %category,
                attempt,
                will_retry,
                error = %message,
                "Attempt failed"
            );
            last_failure = Some(ExecutionError::Failed {
                category,
                message,
                attempts: attempt,
            });

            if !will_retry {
                break;
            }

            let delay = self.retry.delay_for(category, attempt - 1);
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(ExecutionError::Cancelled),
                () = tokio::time::sleep(delay) => {}
            }
        }

        Err(last_failure.unwrap_or(ExecutionError::Cancelled))
    }
}
