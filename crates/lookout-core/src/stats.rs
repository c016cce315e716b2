//! Shared per-endpoint health state.
//!
//! [`EndpointRegistry`] is the only place endpoint statistics and circuit
//! breakers live. Every read-modify-write happens under one mutex, so
//! concurrent success/failure reports from different workers hitting the same
//! endpoint can never lose an update, and the half-open trial slot is claimed
//! atomically.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::circuit_breaker::{Admission, CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::error::ErrorCategory;
use crate::models::EndpointSnapshot;

/// Tuning for the rolling statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    /// Weight kept by older samples on every update, in (0, 1].
    pub decay: f64,
    /// Smoothing factor for the latency EWMA, in (0, 1].
    pub latency_alpha: f64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            decay: 0.9,
            latency_alpha: 0.2,
        }
    }
}

/// Rolling counters for one endpoint.
#[derive(Debug, Clone, Default)]
pub struct EndpointStats {
    success_weight: f64,
    failure_weight: f64,
    pub successes: u64,
    pub failures: u64,
    pub mean_latency: Option<Duration>,
    pub last_failure_at: Option<DateTime<Utc>>,
}

impl EndpointStats {
    pub fn total_attempts(&self) -> u64 {
        self.successes + self.failures
    }

    /// Decayed success rate. Endpoints with no samples count as fully healthy.
    pub fn success_rate(&self) -> f64 {
        if self.total_attempts() == 0 {
            return 1.0;
        }
        self.success_weight / (self.success_weight + self.failure_weight).max(1.0)
    }

    fn record(&mut self, success: bool, latency: Duration, config: &StatsConfig) {
        self.success_weight *= config.decay;
        self.failure_weight *= config.decay;
        if success {
            self.success_weight += 1.0;
            self.successes += 1;
        } else {
            self.failure_weight += 1.0;
            self.failures += 1;
            self.last_failure_at = Some(Utc::now());
        }

        self.mean_latency = Some(match self.mean_latency {
            None => latency,
            Some(prev) => {
                let alpha = config.latency_alpha;
                Duration::from_secs_f64(
                    alpha * latency.as_secs_f64() + (1.0 - alpha) * prev.as_secs_f64(),
                )
            }
        });
    }
}

/// What the selector needs to know about one candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointView {
    pub endpoint: String,
    pub available: bool,
    pub success_rate: f64,
    pub mean_latency: Option<Duration>,
    pub total_attempts: u64,
}

#[derive(Debug)]
struct EndpointState {
    stats: EndpointStats,
    breaker: CircuitBreaker,
}

/// Mutex-guarded map of endpoint stats and breakers, cheap to clone.
#[derive(Clone)]
pub struct EndpointRegistry {
    inner: Arc<Mutex<HashMap<String, EndpointState>>>,
    breaker_config: CircuitBreakerConfig,
    stats_config: StatsConfig,
}

impl EndpointRegistry {
    pub fn new(breaker_config: CircuitBreakerConfig, stats_config: StatsConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            breaker_config,
            stats_config,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, EndpointState>> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Endpoint registry mutex poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn entry<'a>(
        &self,
        map: &'a mut HashMap<String, EndpointState>,
        endpoint: &str,
    ) -> &'a mut EndpointState {
        map.entry(endpoint.to_string())
            .or_insert_with(|| EndpointState {
                stats: EndpointStats::default(),
                breaker: CircuitBreaker::new(self.breaker_config.clone()),
            })
    }

    /// Ask the endpoint's breaker for permission to make one call.
    ///
    /// Returns the time until a trial may be admitted when rejected.
    pub fn admit(&self, endpoint: &str) -> Result<Permit, Duration> {
        let mut map = self.lock();
        let state = self.entry(&mut map, endpoint);
        match state.breaker.try_admit(Instant::now()) {
            Admission::Normal => Ok(Permit::new(self.clone(), endpoint, false)),
            Admission::Trial => {
                tracing::debug!(%endpoint, "Half-open trial admitted");
                Ok(Permit::new(self.clone(), endpoint, true))
            }
            Admission::Rejected { retry_after } => Err(retry_after),
        }
    }

    /// Read-only: would [`Self::admit`] succeed right now?
    pub fn is_available(&self, endpoint: &str) -> bool {
        let map = self.lock();
        map.get(endpoint)
            .is_none_or(|s| s.breaker.is_admissible(Instant::now()))
    }

    /// Views for a set of candidates, taken under a single lock.
    pub fn views(&self, endpoints: &[String]) -> Vec<EndpointView> {
        let map = self.lock();
        let now = Instant::now();
        endpoints
            .iter()
            .map(|endpoint| match map.get(endpoint) {
                Some(state) => EndpointView {
                    endpoint: endpoint.clone(),
                    available: state.breaker.is_admissible(now),
                    success_rate: state.stats.success_rate(),
                    mean_latency: state.stats.mean_latency,
                    total_attempts: state.stats.total_attempts(),
                },
                None => EndpointView {
                    endpoint: endpoint.clone(),
                    available: true,
                    success_rate: 1.0,
                    mean_latency: None,
                    total_attempts: 0,
                },
            })
            .collect()
    }

    /// Snapshot of one endpoint. Never changes breaker state.
    pub fn snapshot(&self, endpoint: &str) -> Option<EndpointSnapshot> {
        let map = self.lock();
        let now = Instant::now();
        map.get(endpoint).map(|state| to_snapshot(endpoint, state, now))
    }

    /// Snapshots of every endpoint seen so far, sorted by name.
    pub fn snapshot_all(&self) -> Vec<EndpointSnapshot> {
        let map = self.lock();
        let now = Instant::now();
        let mut out: Vec<_> = map
            .iter()
            .map(|(endpoint, state)| to_snapshot(endpoint, state, now))
            .collect();
        out.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
        out
    }

    /// Clear statistics and close the breaker. Returns false for unknown endpoints.
    pub fn reset(&self, endpoint: &str) -> bool {
        let mut map = self.lock();
        match map.get_mut(endpoint) {
            Some(state) => {
                state.stats = EndpointStats::default();
                state.breaker.reset();
                tracing::info!(%endpoint, "Endpoint stats reset");
                true
            }
            None => false,
        }
    }

    fn settle(&self, endpoint: &str, trial: bool, outcome: Option<(Option<ErrorCategory>, Duration)>) {
        let mut map = self.lock();
        let stats_config = self.stats_config.clone();
        let state = self.entry(&mut map, endpoint);
        let now = Instant::now();
        match outcome {
            Some((None, latency)) => {
                state.stats.record(true, latency, &stats_config);
                state.breaker.record_success(trial, now);
            }
            Some((Some(category), latency)) => {
                state.stats.record(false, latency, &stats_config);
                let before = state.breaker.state();
                state.breaker.record_failure(category, trial, now);
                if before != CircuitState::Open && state.breaker.state() == CircuitState::Open {
                    tracing::warn!(%endpoint, %category, "Endpoint circuit opened");
                }
            }
            None => state.breaker.release_trial(),
        }
    }
}

fn to_snapshot(endpoint: &str, state: &EndpointState, now: Instant) -> EndpointSnapshot {
    let breaker = state.breaker.snapshot(now);
    EndpointSnapshot {
        endpoint: endpoint.to_string(),
        successes: state.stats.successes,
        failures: state.stats.failures,
        total_attempts: state.stats.total_attempts(),
        success_rate: state.stats.success_rate(),
        mean_latency_ms: state.stats.mean_latency.map(|d| d.as_millis() as u64),
        last_failure_at: state.stats.last_failure_at,
        circuit_state: breaker.state,
        consecutive_failures: breaker.consecutive_failures,
    }
}

/// Permission to make one call against an endpoint.
///
/// Settle it with [`Permit::success`] or [`Permit::failure`]. Dropping an
/// unsettled permit gives a half-open trial slot back to the breaker.
pub struct Permit {
    registry: EndpointRegistry,
    endpoint: String,
    trial: bool,
    settled: bool,
}

impl Permit {
    fn new(registry: EndpointRegistry, endpoint: &str, trial: bool) -> Self {
        Self {
            registry,
            endpoint: endpoint.to_string(),
            trial,
            settled: false,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self, latency: Duration) {
        self.settled = true;
        self.registry
            .settle(&self.endpoint, self.trial, Some((None, latency)));
    }

    pub fn failure(mut self, category: ErrorCategory, latency: Duration) {
        self.settled = true;
        self.registry
            .settle(&self.endpoint, self.trial, Some((Some(category), latency)));
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.registry.settle(&self.endpoint, true, None);
        }
    }
}
