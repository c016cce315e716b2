use std::time::Duration;

use lookout_core::error::ErrorCategory;
use lookout_core::traits::ErrorClassifier;
use reqwest::StatusCode;
use thiserror::Error;

/// Failure of one HTTP lookup.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Request timed out after {0} ms")]
    Timeout(u64),

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("HTTP {status} for {url}")]
    Status { status: u16, url: String },

    #[error("Request blocked by remote: {0}")]
    Blocked(String),

    #[error("No data for identifier '{0}'")]
    NotFound(String),

    #[error("Failed to decode response: {0}")]
    Decode(String),

    #[error("Structured data missing: {0}")]
    MissingData(String),

    #[error("No source configured for endpoint '{0}'")]
    UnknownEndpoint(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("HTTP error: {0}")]
    Http(String),
}

impl FetchError {
    pub(crate) fn from_reqwest(error: reqwest::Error, timeout: Duration) -> Self {
        if error.is_timeout() {
            FetchError::Timeout(timeout.as_millis() as u64)
        } else if error.is_connect() {
            FetchError::Connect(error.to_string())
        } else if error.is_builder() {
            FetchError::InvalidRequest(error.to_string())
        } else if error.is_decode() || error.is_body() {
            FetchError::Decode(error.to_string())
        } else {
            FetchError::Http(error.to_string())
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            FetchError::Timeout(_) | FetchError::Connect(_) => ErrorCategory::Network,
            FetchError::Status { status, .. } => status_category(*status),
            FetchError::Blocked(_) => ErrorCategory::RemoteUnavailable,
            FetchError::NotFound(_)
            | FetchError::UnknownEndpoint(_)
            | FetchError::InvalidRequest(_) => ErrorCategory::ValidationFailure,
            FetchError::Decode(_) | FetchError::MissingData(_) => ErrorCategory::ExtractionFailure,
            FetchError::Http(_) => ErrorCategory::Unknown,
        }
    }
}

fn status_category(status: u16) -> ErrorCategory {
    match StatusCode::from_u16(status) {
        Ok(StatusCode::NOT_FOUND | StatusCode::GONE) => ErrorCategory::ValidationFailure,
        Ok(StatusCode::REQUEST_TIMEOUT) => ErrorCategory::Network,
        Ok(StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS) => {
            ErrorCategory::RemoteUnavailable
        }
        Ok(code) if code.is_server_error() => ErrorCategory::RemoteUnavailable,
        _ => ErrorCategory::Unknown,
    }
}

/// Classifier for [`FetchError`]s produced by [`crate::SourceCatalog`].
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpErrorClassifier;

impl ErrorClassifier<FetchError> for HttpErrorClassifier {
    fn classify(&self, error: &FetchError) -> ErrorCategory {
        error.category()
    }
}
