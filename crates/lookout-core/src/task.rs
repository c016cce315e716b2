use std::fmt;
use std::str::FromStr;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::ErrorCategory;
use crate::models::{TaskFailure, TaskReport};

/// Task urgency. Lower numeric value is served first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical = 0,
    High = 1,
    #[default]
    Medium = 2,
    Low = 3,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }

    /// One band less urgent, saturating at `Low`.
    pub fn demoted(self) -> Self {
        match self {
            Priority::Critical => Priority::High,
            Priority::High => Priority::Medium,
            Priority::Medium | Priority::Low => Priority::Low,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "critical" | "0" => Ok(Priority::Critical),
            "high" | "1" => Ok(Priority::High),
            "medium" | "2" => Ok(Priority::Medium),
            "low" | "3" => Ok(Priority::Low),
            _ => Err(format!("Unknown priority: {}", s)),
        }
    }
}

/// Lifecycle of a task.
///
/// `Failed` means the last attempt failed and the task is waiting in the
/// queue for another one; it is not terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Exhausted,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Exhausted => "exhausted",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Exhausted | TaskStatus::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "succeeded" => Ok(TaskStatus::Succeeded),
            "failed" => Ok(TaskStatus::Failed),
            "exhausted" => Ok(TaskStatus::Exhausted),
            "cancelled" => Ok(TaskStatus::Cancelled),
            _ => Err(format!("Unknown task status: {}", s)),
        }
    }
}

pub(crate) type ReportSender = mpsc::UnboundedSender<TaskReport>;

/// One identifier lookup moving through the scheduler.
///
/// Only the worker that popped a task from the queue touches it until it is
/// pushed back or finished.
#[derive(Debug)]
pub struct Task {
    pub id: Uuid,
    pub identifier: String,
    pub priority: Priority,
    pub status: TaskStatus,
    /// Scheduler-level attempts: executor runs plus lease timeouts.
    pub attempts: u32,
    pub failures: u32,
    pub last_error: Option<(ErrorCategory, String)>,
    /// Set while every candidate endpoint has an open circuit.
    pub blocked_since: Option<Instant>,
    pub created_at: DateTime<Utc>,
    untried: Vec<String>,
    tried: Vec<String>,
    excluded: Vec<String>,
    reply: Option<ReportSender>,
}

impl Task {
    pub fn new(identifier: impl Into<String>, endpoints: Vec<String>, priority: Priority) -> Self {
        Self {
            id: Uuid::new_v4(),
            identifier: identifier.into(),
            priority,
            status: TaskStatus::Pending,
            attempts: 0,
            failures: 0,
            last_error: None,
            blocked_since: None,
            created_at: Utc::now(),
            untried: endpoints,
            tried: Vec::new(),
            excluded: Vec::new(),
            reply: None,
        }
    }

    pub(crate) fn with_reply(mut self, reply: ReportSender) -> Self {
        self.reply = Some(reply);
        self
    }

    pub fn untried(&self) -> &[String] {
        &self.untried
    }

    pub fn tried(&self) -> &[String] {
        &self.tried
    }

    pub fn excluded(&self) -> &[String] {
        &self.excluded
    }

    pub fn has_untried(&self) -> bool {
        self.untried.iter().any(|e| !self.excluded.contains(e))
    }

    /// Endpoints the selector may pick from.
    ///
    /// Untried endpoints come first; once all have been attempted, tried
    /// endpoints that were not excluded are re-admitted.
    pub fn candidates(&self) -> Vec<String> {
        let source = if self.has_untried() {
            &self.untried
        } else {
            &self.tried
        };
        source
            .iter()
            .filter(|e| !self.excluded.contains(e))
            .cloned()
            .collect()
    }

    pub fn has_candidates(&self) -> bool {
        !self.candidates().is_empty()
    }

    pub fn mark_tried(&mut self, endpoint: &str) {
        self.untried.retain(|e| e != endpoint);
        if !self.tried.iter().any(|e| e == endpoint) {
            self.tried.push(endpoint.to_string());
        }
    }

    /// Permanently remove an endpoint from consideration for this task.
    pub fn exclude(&mut self, endpoint: &str) {
        if !self.excluded.iter().any(|e| e == endpoint) {
            self.excluded.push(endpoint.to_string());
        }
    }

    pub fn record_failure(&mut self, category: ErrorCategory, message: impl Into<String>) {
        self.failures += 1;
        self.status = TaskStatus::Failed;
        self.last_error = Some((category, message.into()));
    }

    /// Demote one priority band every `demote_after` failures. Zero disables aging.
    pub fn apply_aging(&mut self, demote_after: u32) -> bool {
        if demote_after == 0 || self.failures == 0 || self.failures % demote_after != 0 {
            return false;
        }
        let demoted = self.priority.demoted();
        let changed = demoted != self.priority;
        self.priority = demoted;
        changed
    }

    pub fn failure(&self) -> TaskFailure {
        let (category, message) = match &self.last_error {
            Some((category, message)) => (Some(*category), message.clone()),
            None => (None, "no endpoint could be attempted".to_string()),
        };
        TaskFailure {
            category,
            message,
            endpoints_tried: self.tried.clone(),
        }
    }

    /// Deliver a successful result and consume the task.
    pub fn succeed(mut self, endpoint: &str, payload: serde_json::Value) -> TaskReport {
        self.status = TaskStatus::Succeeded;
        let report = TaskReport {
            identifier: self.identifier.clone(),
            status: TaskStatus::Succeeded,
            payload: Some(payload),
            failure: None,
            endpoint: Some(endpoint.to_string()),
            attempts: self.attempts,
            cached: false,
            finished_at: Utc::now(),
        };
        self.deliver(report.clone());
        report
    }

    /// Deliver a terminal failure (`Exhausted` or `Cancelled`) and consume the task.
    pub fn terminate(mut self, status: TaskStatus, reason: Option<&str>) -> TaskReport {
        self.status = status;
        let mut failure = self.failure();
        if let Some(reason) = reason {
            failure.message = reason.to_string();
        }
        let report = TaskReport {
            identifier: self.identifier.clone(),
            status,
            payload: None,
            failure: Some(failure),
            endpoint: None,
            attempts: self.attempts,
            cached: false,
            finished_at: Utc::now(),
        };
        self.deliver(report.clone());
        report
    }

    fn deliver(&mut self, report: TaskReport) {
        if let Some(reply) = self.reply.take()
            && reply.send(report).is_err()
        {
            tracing::debug!(task_id = %self.id, "Result receiver dropped");
        }
    }
}
