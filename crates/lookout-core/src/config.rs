use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::CacheConfig;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::AppError;
use crate::pool::PoolConfig;
use crate::retry::RetryPolicy;
use crate::stats::StatsConfig;
use crate::util::duration_ms;

/// Static routing information for one endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Session pool group. Defaults to the endpoint ID.
    pub group: Option<String>,
    /// Static preference; higher is preferred.
    pub priority: f64,
}

impl EndpointConfig {
    pub const DEFAULT_PRIORITY: f64 = 1.0;
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            group: None,
            priority: Self::DEFAULT_PRIORITY,
        }
    }
}

/// Priority aging for tasks that keep failing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgingConfig {
    /// Demote a task one band every this many failures. Zero disables.
    pub demote_after_failures: u32,
}

impl Default for AgingConfig {
    fn default() -> Self {
        Self {
            demote_after_failures: 2,
        }
    }
}

/// Everything the scheduler reads at construction time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    #[serde(with = "duration_ms")]
    pub lease_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub attempt_timeout: Duration,
    /// Scheduler-level attempts per task before it is exhausted.
    pub max_task_attempts: u32,
    /// How long a task may wait with every candidate circuit open.
    #[serde(with = "duration_ms")]
    pub all_open_timeout: Duration,
    /// Requeue delay while every candidate circuit is open.
    #[serde(with = "duration_ms")]
    pub open_circuit_retry_delay: Duration,
    pub aging: AgingConfig,
    pub retry: RetryPolicy,
    pub circuit_breaker: CircuitBreakerConfig,
    pub pool: PoolConfig,
    pub stats: StatsConfig,
    pub cache: CacheConfig,
    pub endpoints: HashMap<String, EndpointConfig>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 10_000,
            lease_timeout: Duration::from_secs(30),
            attempt_timeout: Duration::from_secs(30),
            max_task_attempts: 6,
            all_open_timeout: Duration::from_secs(5 * 60),
            open_circuit_retry_delay: Duration::from_secs(1),
            aging: AgingConfig::default(),
            retry: RetryPolicy::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            pool: PoolConfig::default(),
            stats: StatsConfig::default(),
            cache: CacheConfig::default(),
            endpoints: HashMap::new(),
        }
    }
}

impl OrchestratorConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_endpoint(mut self, id: impl Into<String>, endpoint: EndpointConfig) -> Self {
        self.endpoints.insert(id.into(), endpoint);
        self
    }

    /// Pool group for an endpoint; unknown endpoints form their own group.
    pub fn group_for(&self, endpoint: &str) -> String {
        self.endpoints
            .get(endpoint)
            .and_then(|e| e.group.clone())
            .unwrap_or_else(|| endpoint.to_string())
    }

    pub fn validate(&self) -> Result<(), AppError> {
        let fail = |msg: String| Err(AppError::ConfigError(msg));

        if self.workers == 0 {
            return fail("workers must be at least 1".into());
        }
        if self.queue_capacity == 0 {
            return fail("queue_capacity must be at least 1".into());
        }
        if self.max_task_attempts == 0 {
            return fail("max_task_attempts must be at least 1".into());
        }
        if self.attempt_timeout.is_zero() {
            return fail("attempt_timeout must be positive".into());
        }
        if self.pool.default_size == 0 {
            return fail("pool.default_size must be at least 1".into());
        }
        if let Some((group, _)) = self.pool.group_sizes.iter().find(|(_, size)| **size == 0) {
            return fail(format!("pool.group_sizes.{group} must be at least 1"));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return fail("circuit_breaker.failure_threshold must be at least 1".into());
        }
        let multiplier = self.circuit_breaker.remote_unavailable_multiplier;
        if !(multiplier.is_finite() && multiplier >= 1.0) {
            return fail(format!(
                "circuit_breaker.remote_unavailable_multiplier must be a finite number >= 1, got {multiplier}"
            ));
        }
        if self.open_circuit_retry_delay.is_zero() {
            return fail("open_circuit_retry_delay must be positive".into());
        }
        if !(self.stats.decay > 0.0 && self.stats.decay <= 1.0) {
            return fail(format!("stats.decay must be within (0, 1], got {}", self.stats.decay));
        }
        if !(self.stats.latency_alpha > 0.0 && self.stats.latency_alpha <= 1.0) {
            return fail(format!(
                "stats.latency_alpha must be within (0, 1], got {}",
                self.stats.latency_alpha
            ));
        }
        if let Some((id, _)) = self
            .endpoints
            .iter()
            .find(|(_, e)| !(e.priority.is_finite() && e.priority > 0.0))
        {
            return fail(format!("endpoints.{id}.priority must be a positive number"));
        }
        self.retry.validate().map_err(AppError::ConfigError)
    }

    /// Apply `LOOKOUT_*` overrides using `lookup` to read variables.
    ///
    /// - `LOOKOUT_WORKERS`
    /// - `LOOKOUT_LEASE_TIMEOUT_MS`
    /// - `LOOKOUT_ATTEMPT_TIMEOUT_MS`
    /// - `LOOKOUT_MAX_TASK_ATTEMPTS`
    pub fn apply_overrides<L>(&mut self, lookup: L) -> Result<(), AppError>
    where
        L: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("LOOKOUT_WORKERS") {
            self.workers = parse_var("LOOKOUT_WORKERS", &raw)?;
        }
        if let Some(raw) = lookup("LOOKOUT_LEASE_TIMEOUT_MS") {
            self.lease_timeout = Duration::from_millis(parse_var("LOOKOUT_LEASE_TIMEOUT_MS", &raw)?);
        }
        if let Some(raw) = lookup("LOOKOUT_ATTEMPT_TIMEOUT_MS") {
            self.attempt_timeout =
                Duration::from_millis(parse_var("LOOKOUT_ATTEMPT_TIMEOUT_MS", &raw)?);
        }
        if let Some(raw) = lookup("LOOKOUT_MAX_TASK_ATTEMPTS") {
            self.max_task_attempts = parse_var("LOOKOUT_MAX_TASK_ATTEMPTS", &raw)?;
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T, AppError> {
    raw.trim().parse().map_err(|_| {
        AppError::ConfigError(format!("Invalid {name} '{raw}': must be a non-negative integer"))
    })
}

fn env_lookup(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

/// Supplies configuration once, at construction time.
pub trait ConfigSource {
    fn load(&self) -> Result<OrchestratorConfig, AppError>;
}

/// Defaults plus `LOOKOUT_*` environment overrides.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvSource;

impl ConfigSource for EnvSource {
    fn load(&self) -> Result<OrchestratorConfig, AppError> {
        let mut config = OrchestratorConfig::default();
        config.apply_overrides(env_lookup)?;
        config.validate()?;
        Ok(config)
    }
}

/// JSON file, then `LOOKOUT_*` environment overrides.
#[derive(Debug, Clone)]
pub struct JsonFileSource {
    path: PathBuf,
}

impl JsonFileSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    fn read(&self) -> Result<OrchestratorConfig, AppError> {
        let raw = std::fs::read_to_string(&self.path).map_err(|e| {
            AppError::ConfigError(format!("Cannot read {}: {e}", self.path.display()))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            AppError::ConfigError(format!("Cannot parse {}: {e}", self.path.display()))
        })
    }
}

impl ConfigSource for JsonFileSource {
    fn load(&self) -> Result<OrchestratorConfig, AppError> {
        let mut config = self.read()?;
        config.apply_overrides(env_lookup)?;
        config.validate()?;
        Ok(config)
    }
}
