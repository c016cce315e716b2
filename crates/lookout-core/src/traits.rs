use std::fmt::Display;
use std::future::Future;

use crate::error::{AppError, ErrorCategory};

/// Creates and destroys the stateful execution contexts kept in the pool.
///
/// The core never looks inside a session; it only hands a shared reference
/// to the [`Extractor`] while the session is leased.
pub trait SessionFactory: Send + Sync + 'static {
    type Session: Send + Sync + 'static;

    fn create(&self, group: &str) -> impl Future<Output = Result<Self::Session, AppError>> + Send;

    fn destroy(&self, session: Self::Session) -> impl Future<Output = ()> + Send;
}

/// Looks up one identifier on one endpoint using a leased session.
pub trait Extractor<S>: Send + Sync + Clone + 'static {
    type Error: Display + Send + Sync + 'static;

    /// The returned payload is opaque to the core.
    fn extract(
        &self,
        endpoint: &str,
        identifier: &str,
        session: &S,
    ) -> impl Future<Output = Result<serde_json::Value, Self::Error>> + Send;
}

/// Maps collaborator errors onto the retry taxonomy.
pub trait ErrorClassifier<E>: Send + Sync + Clone + 'static {
    fn classify(&self, error: &E) -> ErrorCategory;
}

/// Classifier for collaborators that already speak [`AppError`].
#[derive(Debug, Default, Clone, Copy)]
pub struct AppErrorClassifier;

impl ErrorClassifier<AppError> for AppErrorClassifier {
    fn classify(&self, error: &AppError) -> ErrorCategory {
        error.category()
    }
}

/// Classifies any displayable error by keywords in its message.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeywordClassifier;

impl KeywordClassifier {
    const NETWORK: &'static [&'static str] = &[
        "timeout",
        "timed out",
        "connection",
        "connect",
        "reset by peer",
        "broken pipe",
        "dns",
    ];
    const REMOTE_UNAVAILABLE: &'static [&'static str] = &[
        "404",
        "429",
        "500",
        "502",
        "503",
        "504",
        "blocked",
        "captcha",
        "rate limit",
        "too many requests",
        "access denied",
        "forbidden",
        "unavailable",
    ];
    const EXTRACTION: &'static [&'static str] = &[
        "parse",
        "json",
        "selector",
        "element not found",
        "unexpected",
        "decode",
    ];
    const VALIDATION: &'static [&'static str] = &["validation", "invalid", "no data", "mismatch"];

    pub fn classify_message(message: &str) -> ErrorCategory {
        let lower = message.to_lowercase();
        let has = |words: &[&str]| words.iter().any(|w| lower.contains(w));
        if has(Self::NETWORK) {
            ErrorCategory::Network
        } else if has(Self::REMOTE_UNAVAILABLE) {
            ErrorCategory::RemoteUnavailable
        } else if has(Self::EXTRACTION) {
            ErrorCategory::ExtractionFailure
        } else if has(Self::VALIDATION) {
            ErrorCategory::ValidationFailure
        } else {
            ErrorCategory::Unknown
        }
    }
}

impl<E: Display> ErrorClassifier<E> for KeywordClassifier {
    fn classify(&self, error: &E) -> ErrorCategory {
        Self::classify_message(&error.to_string())
    }
}

/// Hook point around attempts, for strategies that change how requests look
/// (header rotation, proxy switching). The core ships only the no-op.
pub trait AttemptHook: Send + Sync + 'static {
    fn before_attempt(&self, endpoint: &str, identifier: &str) -> impl Future<Output = ()> + Send {
        let _ = (endpoint, identifier);
        async {}
    }

    fn on_remote_unavailable(
        &self,
        endpoint: &str,
        identifier: &str,
    ) -> impl Future<Output = ()> + Send {
        let _ = (endpoint, identifier);
        async {}
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHook;

impl AttemptHook for NoopHook {}
