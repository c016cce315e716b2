//! In-memory cache of successful payloads, keyed by (endpoint, identifier).

use std::time::Duration;

use moka::future::Cache;
use serde::{Deserialize, Serialize};

use crate::util::duration_ms;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Entry lifetime. Zero disables caching.
    #[serde(with = "duration_ms")]
    pub ttl: Duration,
    pub capacity: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(15 * 60),
            capacity: 10_000,
        }
    }
}

/// Payload cache with TTL-based expiry. Cheap to clone.
#[derive(Clone)]
pub struct ResultCache {
    inner: Option<Cache<(String, String), serde_json::Value>>,
}

impl ResultCache {
    pub fn new(config: &CacheConfig) -> Self {
        let inner = (!config.ttl.is_zero()).then(|| {
            Cache::builder()
                .time_to_live(config.ttl)
                .max_capacity(config.capacity)
                .build()
        });
        Self { inner }
    }

    pub fn disabled() -> Self {
        Self { inner: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    pub async fn get(&self, endpoint: &str, identifier: &str) -> Option<serde_json::Value> {
        let cache = self.inner.as_ref()?;
        cache
            .get(&(endpoint.to_string(), identifier.to_string()))
            .await
    }

    /// First cached payload among `endpoints`, in order.
    pub async fn find(
        &self,
        endpoints: &[String],
        identifier: &str,
    ) -> Option<(String, serde_json::Value)> {
        if !self.is_enabled() {
            return None;
        }
        for endpoint in endpoints {
            if let Some(payload) = self.get(endpoint, identifier).await {
                return Some((endpoint.clone(), payload));
            }
        }
        None
    }

    pub async fn insert(&self, endpoint: &str, identifier: &str, payload: serde_json::Value) {
        if let Some(cache) = &self.inner {
            cache
                .insert((endpoint.to_string(), identifier.to_string()), payload)
                .await;
        }
    }
}
