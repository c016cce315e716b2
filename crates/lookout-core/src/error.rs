use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification used to pick a retry policy and decide session health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Transient transport failure (timeouts, resets, refused connections).
    Network,
    /// Endpoint refuses, is overloaded or blocks us.
    RemoteUnavailable,
    /// Payload came back but could not be understood.
    ExtractionFailure,
    /// Payload failed a sanity check, including confirmed "no data".
    ValidationFailure,
    /// Anything the classifier could not place.
    Unknown,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 5] = [
        ErrorCategory::Network,
        ErrorCategory::RemoteUnavailable,
        ErrorCategory::ExtractionFailure,
        ErrorCategory::ValidationFailure,
        ErrorCategory::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Network => "network",
            ErrorCategory::RemoteUnavailable => "remote_unavailable",
            ErrorCategory::ExtractionFailure => "extraction_failure",
            ErrorCategory::ValidationFailure => "validation_failure",
            ErrorCategory::Unknown => "unknown",
        }
    }

    /// Returns true if a session that saw this failure must not be reused.
    ///
    /// Transport-level failures leave the execution context in an unknown
    /// state; logical failures do not.
    pub fn taints_session(&self) -> bool {
        matches!(
            self,
            ErrorCategory::Network | ErrorCategory::RemoteUnavailable | ErrorCategory::Unknown
        )
    }

    /// Returns true if this failure should count toward opening the circuit.
    pub fn trips_circuit(&self) -> bool {
        matches!(
            self,
            ErrorCategory::Network | ErrorCategory::RemoteUnavailable | ErrorCategory::Unknown
        )
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Application-wide error types for lookout.
#[derive(Error, Debug)]
pub enum AppError {
    /// Submission was malformed (empty identifier or endpoint list).
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration could not be loaded or failed validation.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The scheduler no longer accepts submissions.
    #[error("Scheduler is shutting down")]
    ShuttingDown,

    /// Queue capacity reached.
    #[error("Task queue is full (capacity {0})")]
    QueueFull(usize),

    /// No session became free before the lease timeout.
    #[error("Timed out after {0} ms waiting for a session in group '{1}'")]
    LeaseTimeout(u64, String),

    /// The session pool was closed.
    #[error("Session pool is closed")]
    PoolClosed,

    /// A session could not be created.
    #[error("Session error: {0}")]
    SessionError(String),

    /// Network/connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Request timed out.
    #[error("Request timed out after {0} ms")]
    Timeout(u64),

    /// Endpoint refused, rate limited or blocked the request.
    #[error("Remote unavailable: {0}")]
    RemoteUnavailable(String),

    /// Response could not be turned into a payload.
    #[error("Extraction error: {0}")]
    ExtractionError(String),

    /// Payload failed validation or the endpoint has no data.
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl AppError {
    /// Maps this error onto the retry taxonomy.
    pub fn category(&self) -> ErrorCategory {
        match self {
            AppError::NetworkError(_) | AppError::Timeout(_) => ErrorCategory::Network,
            AppError::RemoteUnavailable(_)
            | AppError::LeaseTimeout(..)
            | AppError::SessionError(_) => ErrorCategory::RemoteUnavailable,
            AppError::ExtractionError(_) | AppError::SerializationError(_) => {
                ErrorCategory::ExtractionFailure
            }
            AppError::ValidationError(_) => ErrorCategory::ValidationFailure,
            _ => ErrorCategory::Unknown,
        }
    }
}
