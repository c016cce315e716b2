//! Per-endpoint circuit breaker.
//!
//! Isolates endpoints that keep failing so workers route around them instead
//! of hammering them, while still probing for recovery.
//!
//! # Circuit States
//!
//! ```text
//! CLOSED (healthy) --[N failures]--> OPEN (rejecting) --[reset timeout]--> HALF_OPEN (one trial)
//!                                                                               |
//!                                        <--[trial failure]--                   |
//!                                                                               |
//! CLOSED <--------------------------------[trial success]-----------------------+
//! ```
//!
//! The breaker holds no lock of its own. [`crate::stats::EndpointRegistry`]
//! owns one breaker per endpoint behind its mutex, which makes each
//! read-modify-write below atomic with respect to the endpoint's stats.

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::ErrorCategory;
use crate::util::duration_ms;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed - requests flow normally.
    Closed,
    /// Circuit is open - requests are rejected immediately.
    Open,
    /// Circuit is half-open - a single trial request probes recovery.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit.
    pub failure_threshold: u32,

    /// Failures further apart than this do not accumulate.
    #[serde(with = "duration_ms")]
    pub failure_window: Duration,

    /// Time to wait before transitioning from Open to Half-Open.
    #[serde(with = "duration_ms")]
    pub reset_timeout: Duration,

    /// When the endpoint reports itself unavailable, multiply the reset timeout by this factor.
    pub remote_unavailable_multiplier: f32,

    /// Maximum reset timeout after repeated extensions.
    #[serde(with = "duration_ms")]
    pub max_reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(60),
            reset_timeout: Duration::from_secs(60),
            remote_unavailable_multiplier: 2.0,
            max_reset_timeout: Duration::from_secs(300),
        }
    }
}

/// Result of asking the breaker whether a call may proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Closed circuit, ordinary call.
    Normal,
    /// The single half-open probe.
    Trial,
    /// Rejected; the circuit may admit a trial after `retry_after`.
    Rejected { retry_after: Duration },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        !matches!(self, Admission::Rejected { .. })
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub trial_in_flight: bool,
    pub time_until_half_open: Option<Duration>,
}

/// Circuit breaker state machine for a single endpoint.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: CircuitState,
    failure_count: u32,
    last_failure_time: Option<Instant>,
    last_transition: Option<Instant>,
    trial_in_flight: bool,
    current_reset_timeout: Duration,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        let current_reset_timeout = config.reset_timeout;
        Self {
            config,
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_time: None,
            last_transition: None,
            trial_in_flight: false,
            current_reset_timeout,
        }
    }

    /// Stored state, without applying the lazy Open → HalfOpen transition.
    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn current_reset_timeout(&self) -> Duration {
        self.current_reset_timeout
    }

    /// Read-only admission check: would [`Self::try_admit`] let a call through?
    ///
    /// An Open circuit whose reset timeout has elapsed reports as admissible
    /// because the next caller would become the half-open trial. A HalfOpen
    /// circuit with its trial outstanding is not admissible.
    pub fn is_admissible(&self, now: Instant) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => !self.trial_in_flight,
            CircuitState::Open => self.reset_elapsed(now),
        }
    }

    /// Decide whether a call may proceed, claiming the half-open trial if due.
    pub fn try_admit(&mut self, now: Instant) -> Admission {
        self.maybe_transition_to_half_open(now);

        match self.state {
            CircuitState::Closed => Admission::Normal,
            CircuitState::HalfOpen if !self.trial_in_flight => {
                self.trial_in_flight = true;
                Admission::Trial
            }
            CircuitState::HalfOpen => Admission::Rejected {
                retry_after: Duration::ZERO,
            },
            CircuitState::Open => Admission::Rejected {
                retry_after: self.time_until_half_open(now).unwrap_or(self.current_reset_timeout),
            },
        }
    }

    pub fn record_success(&mut self, trial: bool, now: Instant) {
        match self.state {
            CircuitState::HalfOpen if trial => {
                tracing::info!("Circuit breaker closing after successful trial");
                self.state = CircuitState::Closed;
                self.failure_count = 0;
                self.trial_in_flight = false;
                self.last_transition = Some(now);
                self.current_reset_timeout = self.config.reset_timeout;
            }
            CircuitState::Closed => {
                self.failure_count = 0;
            }
            CircuitState::HalfOpen | CircuitState::Open => {}
        }
    }

    pub fn record_failure(&mut self, category: ErrorCategory, trial: bool, now: Instant) {
        if !category.trips_circuit() {
            if trial {
                // The endpoint answered, so the probe counts as recovered.
                self.record_success(true, now);
            }
            return;
        }

        match self.state {
            CircuitState::Closed => {
                let within_window = self
                    .last_failure_time
                    .is_some_and(|t| now.saturating_duration_since(t) <= self.config.failure_window);
                self.failure_count = if within_window {
                    self.failure_count + 1
                } else {
                    1
                };
                self.last_failure_time = Some(now);

                if self.failure_count >= self.config.failure_threshold {
                    tracing::warn!(
                        failures = self.failure_count,
                        %category,
                        "Circuit breaker opening after {} consecutive failures",
                        self.failure_count
                    );
                    self.open(category, now);
                }
            }
            CircuitState::HalfOpen if trial => {
                tracing::warn!(%category, "Circuit breaker trial failed, returning to open state");
                self.last_failure_time = Some(now);
                self.open(category, now);
            }
            CircuitState::HalfOpen | CircuitState::Open => {
                self.last_failure_time = Some(now);
            }
        }
    }

    /// Give back an admitted trial whose call never produced an outcome.
    pub fn release_trial(&mut self) {
        self.trial_in_flight = false;
    }

    pub fn reset(&mut self) {
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.last_failure_time = None;
        self.last_transition = None;
        self.trial_in_flight = false;
        self.current_reset_timeout = self.config.reset_timeout;
    }

    pub fn snapshot(&self, now: Instant) -> BreakerSnapshot {
        BreakerSnapshot {
            state: self.state,
            consecutive_failures: self.failure_count,
            trial_in_flight: self.trial_in_flight,
            time_until_half_open: if self.state == CircuitState::Open {
                self.time_until_half_open(now)
            } else {
                None
            },
        }
    }

    fn open(&mut self, category: ErrorCategory, now: Instant) {
        self.state = CircuitState::Open;
        self.trial_in_flight = false;
        self.last_transition = Some(now);

        if category == ErrorCategory::RemoteUnavailable {
            let max = self.config.max_reset_timeout;
            // `max` ignores NaN; infinity is clamped below.
            let multiplier = f64::from(self.config.remote_unavailable_multiplier).max(1.0);
            let extended = (self.current_reset_timeout.as_secs_f64() * multiplier)
                .min(max.as_secs_f64());
            self.current_reset_timeout = Duration::try_from_secs_f64(extended)
                .unwrap_or(max)
                .min(max);
            tracing::info!(
                reset_timeout_ms = self.current_reset_timeout.as_millis() as u64,
                "Extended reset timeout for unavailable endpoint"
            );
        }
    }

    fn reset_elapsed(&self, now: Instant) -> bool {
        self.last_transition
            .is_some_and(|t| now.saturating_duration_since(t) >= self.current_reset_timeout)
    }

    fn time_until_half_open(&self, now: Instant) -> Option<Duration> {
        self.last_transition.map(|t| {
            self.current_reset_timeout
                .saturating_sub(now.saturating_duration_since(t))
        })
    }

    fn maybe_transition_to_half_open(&mut self, now: Instant) {
        if self.state == CircuitState::Open && self.reset_elapsed(now) {
            tracing::info!("Circuit breaker transitioning to half-open state");
            self.state = CircuitState::HalfOpen;
            self.trial_in_flight = false;
            self.last_transition = Some(now);
        }
    }
}
