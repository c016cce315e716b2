//! Per-category retry policy with exponential backoff and jitter.
//!
//! Delay schedule for attempt `n` (0-indexed):
//!
//! ```text
//! backoff = min(max_delay, base_delay * multiplier^n)
//! delay   = max(min_delay, backoff ± jitter * backoff)
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ErrorCategory;
use crate::util::duration_ms;

/// Retry behaviour for one error category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryPolicy {
    /// Total attempts allowed within one executor invocation (first call included).
    pub max_attempts: u32,

    #[serde(with = "duration_ms")]
    pub base_delay: Duration,

    #[serde(with = "duration_ms")]
    pub max_delay: Duration,

    /// Fraction of the backoff added or subtracted at random (0.0 disables).
    pub jitter: f64,

    pub multiplier: f64,

    /// Whether this category is worth repeating against the same endpoint.
    pub retryable: bool,
}

impl CategoryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, retryable: bool) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay: Duration::from_secs(60),
            jitter: 0.1,
            multiplier: 2.0,
            retryable,
        }
    }

    /// Backoff before jitter. Non-decreasing in `attempt`, capped at `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.max(1.0).powi(attempt.min(i32::MAX as u32) as i32);
        let secs = self.base_delay.as_secs_f64() * exp;
        let capped = secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }
}

/// Immutable retry configuration keyed by [`ErrorCategory`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub network: CategoryPolicy,
    pub remote_unavailable: CategoryPolicy,
    pub extraction_failure: CategoryPolicy,
    pub validation_failure: CategoryPolicy,
    pub unknown: CategoryPolicy,

    /// Floor applied after jitter so a retry never spins with zero delay.
    #[serde(with = "duration_ms")]
    pub min_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            network: CategoryPolicy::new(3, Duration::from_secs(2), true),
            remote_unavailable: CategoryPolicy::new(2, Duration::from_secs(3), true),
            extraction_failure: CategoryPolicy::new(1, Duration::from_secs(1), false),
            validation_failure: CategoryPolicy::new(1, Duration::from_secs(1), false),
            unknown: CategoryPolicy::new(2, Duration::from_millis(1500), true),
            min_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    pub fn for_category(&self, category: ErrorCategory) -> &CategoryPolicy {
        match category {
            ErrorCategory::Network => &self.network,
            ErrorCategory::RemoteUnavailable => &self.remote_unavailable,
            ErrorCategory::ExtractionFailure => &self.extraction_failure,
            ErrorCategory::ValidationFailure => &self.validation_failure,
            ErrorCategory::Unknown => &self.unknown,
        }
    }

    pub fn is_retryable(&self, category: ErrorCategory) -> bool {
        self.for_category(category).retryable
    }

    /// True if another in-process attempt is allowed after `attempts_made` attempts.
    pub fn allows_another(&self, category: ErrorCategory, attempts_made: u32) -> bool {
        let policy = self.for_category(category);
        policy.retryable && attempts_made < policy.max_attempts
    }

    /// Jittered, floored delay before retry number `attempt` (0-indexed).
    pub fn delay_for(&self, category: ErrorCategory, attempt: u32) -> Duration {
        let policy = self.for_category(category);
        let backoff = policy.backoff(attempt);
        let jittered = if policy.jitter > 0.0 {
            let spread = backoff.as_secs_f64() * policy.jitter.min(1.0);
            backoff.as_secs_f64() + spread * rand_unit()
        } else {
            backoff.as_secs_f64()
        };
        Duration::from_secs_f64(jittered.max(0.0)).max(self.min_delay)
    }

    pub fn validate(&self) -> Result<(), String> {
        for category in ErrorCategory::ALL {
            let policy = self.for_category(category);
            if policy.max_attempts == 0 {
                return Err(format!("retry.{category}.max_attempts must be at least 1"));
            }
            if !(0.0..=1.0).contains(&policy.jitter) {
                return Err(format!("retry.{category}.jitter must be within [0, 1]"));
            }
        }
        if self.min_delay.is_zero() {
            return Err("retry.min_delay must be positive".into());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Jitter source: xorshift seeded from the clock plus a counter, no `rand`.
// ---------------------------------------------------------------------------

static JITTER_COUNTER: AtomicU64 = AtomicU64::new(0x9E37_79B9_7F4A_7C15);

/// Uniform value in [-1.0, 1.0].
fn rand_unit() -> f64 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    let mut x = nanos ^ JITTER_COUNTER.fetch_add(0x9E37_79B9_7F4A_7C15, Ordering::Relaxed);
    if x == 0 {
        x = 1;
    }
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    (x % 2_000_001) as f64 / 1_000_000.0 - 1.0
}
