//! # Error Module
//!
//! Error types shared by the engine and its collaborators.
//!
//! ## Overview
//!
//! Request-level failures are expected during a crawl: a domain may be closing,
//! a duplicate may be filtered, a transfer may time out. Those are reported as
//! [`EngineError::IgnoreRequest`], which carries a [`Severity`] so the engine
//! can log a skip at the right level instead of treating it as a failure.
//! Every other variant is a genuine error; the download stage converts them
//! all into `IgnoreRequest` before they travel further down a request's chain.

use std::fmt;

/// How loudly an ignored request should be reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Severity {
    Trace,
    #[default]
    Debug,
    Info,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Severity::Trace => "TRACE",
            Severity::Debug => "DEBUG",
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Errors produced while orchestrating a crawl.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The request was skipped. Not a failure unless `severity` says so.
    #[error("{reason}")]
    IgnoreRequest { reason: String, severity: Severity },

    #[error("Download failed: {0}")]
    Download(String),

    #[error("Spider error: {0}")]
    Spider(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The producer side of a completion handle went away without resolving it.
    #[error("Request was cancelled before completion")]
    Cancelled,

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    /// An `IgnoreRequest` logged at debug level.
    pub fn ignore(reason: impl Into<String>) -> Self {
        Self::ignore_with(reason, Severity::Debug)
    }

    pub fn ignore_with(reason: impl Into<String>, severity: Severity) -> Self {
        EngineError::IgnoreRequest {
            reason: reason.into(),
            severity,
        }
    }

    /// Returns true for the `IgnoreRequest` class of errors.
    pub fn is_ignored(&self) -> bool {
        matches!(self, EngineError::IgnoreRequest { .. })
    }

    /// The level this error should be logged at, with its message.
    ///
    /// Ignored requests report their declared severity, everything else is an error.
    pub fn classify(&self) -> (Severity, String) {
        match self {
            EngineError::IgnoreRequest { reason, severity } => (*severity, reason.clone()),
            other => (Severity::Error, other.to_string()),
        }
    }

    /// Converts any failure into an `IgnoreRequest` so downstream stages treat it uniformly.
    pub fn into_ignored(self) -> Self {
        match self {
            ignored @ EngineError::IgnoreRequest { .. } => ignored,
            other => EngineError::ignore_with(other.to_string(), Severity::Error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_uses_declared_severity_for_ignored_requests() {
        let err = EngineError::ignore_with("filtered offsite", Severity::Info);
        assert_eq!(err.classify(), (Severity::Info, "filtered offsite".to_string()));

        let err = EngineError::Download("connection reset".into());
        assert_eq!(
            err.classify(),
            (Severity::Error, "Download failed: connection reset".to_string())
        );
    }

    #[test]
    fn into_ignored_keeps_ignored_and_wraps_the_rest() {
        let err = EngineError::ignore_with("duplicate", Severity::Trace).into_ignored();
        assert!(matches!(
            err,
            EngineError::IgnoreRequest { ref reason, severity: Severity::Trace } if reason == "duplicate"
        ));

        let err = EngineError::Spider("boom".into()).into_ignored();
        assert!(err.is_ignored());
        assert_eq!(err.to_string(), "Spider error: boom");
    }
}
