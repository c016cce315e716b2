use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::circuit_breaker::CircuitState;
use crate::error::ErrorCategory;
use crate::task::TaskStatus;

/// Structured failure delivered to callers instead of a raw error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    /// Category of the last error, `None` if the task never reached an endpoint.
    pub category: Option<ErrorCategory>,
    pub message: String,
    /// Distinct endpoints attempted, in order.
    pub endpoints_tried: Vec<String>,
}

/// Final outcome of one identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReport {
    pub identifier: String,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<TaskFailure>,
    /// Endpoint that produced the payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    pub attempts: u32,
    /// True if the payload came from the result cache.
    pub cached: bool,
    pub finished_at: DateTime<Utc>,
}

impl TaskReport {
    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Succeeded
    }
}

/// Read-only view of one endpoint's health.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointSnapshot {
    pub endpoint: String,
    pub successes: u64,
    pub failures: u64,
    pub total_attempts: u64,
    pub success_rate: f64,
    pub mean_latency_ms: Option<u64>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub circuit_state: CircuitState,
    pub consecutive_failures: u32,
}

/// Session pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub created: u64,
    pub destroyed: u64,
    pub leased: usize,
    pub idle: usize,
}

/// What `shutdown` had to cut short.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownReport {
    /// Queued tasks that never ran again.
    pub pending_cancelled: usize,
    /// Tasks whose attempt was interrupted.
    pub in_flight_aborted: usize,
}

/// Aggregate view returned by `Scheduler::stats`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub endpoints: Vec<EndpointSnapshot>,
    pub pool: PoolStats,
    pub queued: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_skips_empty_fields() {
        let report = TaskReport {
            identifier: "4006381333931".into(),
            status: TaskStatus::Succeeded,
            payload: Some(serde_json::json!({"title": "pen"})),
            failure: None,
            endpoint: Some("api".into()),
            attempts: 1,
            cached: false,
            finished_at: Utc::now(),
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "succeeded");
        assert!(json.get("failure").is_none());
        assert!(report.is_success());
    }

    #[test]
    fn test_failure_carries_category_and_endpoints() {
        let failure = TaskFailure {
            category: Some(ErrorCategory::ValidationFailure),
            message: "no data".into(),
            endpoints_tried: vec!["a".into(), "b".into()],
        };
        let json = serde_json::to_value(&failure).unwrap();
        assert_eq!(json["category"], "validation_failure");
        assert_eq!(json["endpoints_tried"][1], "b");
    }
}
