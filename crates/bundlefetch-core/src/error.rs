//! Error types for bundlefetch core

use bundlefetch_types::VerifyResult;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur in bundlefetch core
#[derive(Debug, Error)]
pub enum BundleError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("No transport registered for scheme '{0}'")]
    UnsupportedScheme(String),

    #[error("Malformed cache record: {0}")]
    Codec(String),

    #[error("Transfer failed: {0}")]
    Transfer(String),

    #[error("Server error: {status} - {message}")]
    ServerError { status: u16, message: String },

    #[error("Transfer stalled: no progress for {window:?}")]
    Stalled { window: Duration },

    #[error("Verification failed: {0}")]
    Verification(VerifyResult),

    #[error("user cancelled")]
    Cancelled,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl BundleError {
    /// Check if this error is retryable at the downloader level.
    ///
    /// `hard_fail_status` is the configured threshold at or above which a
    /// server status is not retried.
    pub fn is_retryable(&self, hard_fail_status: Option<u16>) -> bool {
        match self {
            BundleError::Network(_) | BundleError::Transfer(_) | BundleError::Stalled { .. } => true,
            BundleError::Verification(_) => true,
            BundleError::ServerError { status, .. } => match hard_fail_status {
                Some(threshold) => *status < threshold,
                None => true,
            },
            _ => false,
        }
    }
}

impl From<url::ParseError> for BundleError {
    fn from(error: url::ParseError) -> Self {
        BundleError::InvalidUrl(error.to_string())
    }
}

impl From<serde_json::Error> for BundleError {
    fn from(error: serde_json::Error) -> Self {
        BundleError::Config(error.to_string())
    }
}

pub type BundleResult<T> = Result<T, BundleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_errors_respect_hard_fail_threshold() {
        let err = BundleError::ServerError {
            status: 503,
            message: "unavailable".into(),
        };
        assert!(err.is_retryable(None));
        assert!(err.is_retryable(Some(600)));
        assert!(!err.is_retryable(Some(500)));
    }

    #[test]
    fn test_local_errors_are_not_retryable() {
        let err = BundleError::Io(std::io::Error::other("disk full"));
        assert!(!err.is_retryable(None));
        assert!(!BundleError::Codec("truncated".into()).is_retryable(None));
    }

    #[test]
    fn test_integrity_errors_are_retryable() {
        assert!(BundleError::Verification(VerifyResult::FileCrcError).is_retryable(Some(400)));
        let stalled = BundleError::Stalled {
            window: Duration::from_secs(5),
        };
        assert!(stalled.is_retryable(None));
    }
}
