use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;

use crate::config::EndpointConfig;
use crate::stats::EndpointRegistry;
use crate::task::Task;

/// One scored candidate, best first in [`EndpointSelector::rank`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedEndpoint {
    pub endpoint: String,
    pub score: f64,
    pub static_priority: f64,
    pub success_rate: f64,
    pub total_attempts: u64,
}

/// Picks the healthiest endpoint for a task from live registry data.
#[derive(Clone)]
pub struct EndpointSelector {
    registry: EndpointRegistry,
    endpoints: Arc<HashMap<String, EndpointConfig>>,
}

impl EndpointSelector {
    pub fn new(registry: EndpointRegistry, endpoints: HashMap<String, EndpointConfig>) -> Self {
        Self {
            registry,
            endpoints: Arc::new(endpoints),
        }
    }

    fn static_priority(&self, endpoint: &str) -> f64 {
        self.endpoints
            .get(endpoint)
            .map_or(EndpointConfig::DEFAULT_PRIORITY, |c| c.priority)
    }

    /// Best endpoint among the task's candidates, or `None` if every
    /// candidate's circuit is open.
    pub fn next(&self, task: &Task) -> Option<String> {
        self.rank(&task.candidates())
            .into_iter()
            .next()
            .map(|r| r.endpoint)
    }

    /// Score the admissible candidates.
    ///
    /// `score = static_priority * success_rate / (1 + latency / max_latency)`,
    /// where `max_latency` is the slowest mean latency among the candidates.
    /// Ties go to the higher static priority, then to the endpoint with fewer
    /// attempts so far.
    pub fn rank(&self, candidates: &[String]) -> Vec<RankedEndpoint> {
        let views: Vec<_> = self
            .registry
            .views(candidates)
            .into_iter()
            .filter(|v| v.available)
            .collect();

        let max_latency = views
            .iter()
            .filter_map(|v| v.mean_latency)
            .max()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);

        let mut ranked: Vec<RankedEndpoint> = views
            .into_iter()
            .map(|v| {
                let normalized_latency = match v.mean_latency {
                    Some(latency) if max_latency > 0.0 => latency.as_secs_f64() / max_latency,
                    _ => 0.0,
                };
                let static_priority = self.static_priority(&v.endpoint);
                RankedEndpoint {
                    score: static_priority * v.success_rate / (1.0 + normalized_latency),
                    static_priority,
                    success_rate: v.success_rate,
                    total_attempts: v.total_attempts,
                    endpoint: v.endpoint,
                }
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| b.static_priority.total_cmp(&a.static_priority))
                .then_with(|| a.total_attempts.cmp(&b.total_attempts))
        });
        ranked
    }
}
