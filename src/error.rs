//! Error types for url-fetcher
//!
//! Per-task fetch failures never show up here: they are recorded on the task
//! itself (see [`crate::types::FetchOutcome`]) and flow downstream as data.
//! The variants below are what queues, stages and the controller report.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::stage::StageState;

/// Result type alias for url-fetcher operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for url-fetcher
#[derive(Debug, Error)]
pub enum Error {
    /// Push (or a second close) attempted on a closed task queue
    #[error("task queue is closed")]
    QueueClosed,

    /// Fetch attempt budget consumed without a terminal decision
    #[error("no more attempts for task {id} (last status {status_code})")]
    ExhaustedAttempts {
        /// The task whose budget ran out
        id: String,
        /// Last HTTP status observed (0 if no response was ever received)
        status_code: u16,
    },

    /// A fetch ended with a non-retryable failure
    #[error("fetch failed for task {id}: {reason}")]
    Fetch {
        /// The task that failed
        id: String,
        /// Why it failed
        reason: String,
    },

    /// A transport-level failure left no HTTP response to read
    #[error("external or routing error")]
    ExternalRouting,

    /// The process-wide cancellation token fired
    #[error("operation cancelled")]
    Cancelled,

    /// A stage did not stop within its forced-shutdown budget
    #[error("{stage} shutdown timed out after {timeout:?}")]
    ShutdownTimeout {
        /// Stage name
        stage: &'static str,
        /// The budget that was exceeded
        timeout: Duration,
    },

    /// A stage wait was interrupted by process-wide cancellation
    #[error("{stage} shutdown by cancellation")]
    ShutdownCancelled {
        /// Stage name
        stage: &'static str,
    },

    /// A lifecycle operation was called in the wrong state
    #[error("cannot {operation} {stage} in state {state:?}")]
    InvalidStageState {
        /// Stage name
        stage: &'static str,
        /// The attempted operation (e.g. "start")
        operation: &'static str,
        /// The state that prevented it
        state: StageState,
    },

    /// The task URL could not be parsed
    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "app.workers")
        key: Option<String>,
    },

    /// Config file or environment could not be read or parsed
    #[error("failed to load configuration: {0}")]
    ConfigLoad(#[from] ::config::ConfigError),

    /// Refused to overwrite an existing configuration file
    #[error("config file already exists: {}", .0.display())]
    ConfigExists(PathBuf),

    /// HTTP client error
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_yaml::Error),

    /// Logging could not be initialised
    #[error("logging error: {0}")]
    Logging(String),
}

impl Error {
    /// Create a configuration error for a specific key
    pub fn config(message: impl Into<String>, key: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            key: Some(key.into()),
        }
    }

    /// Returns true if the error is transient and the operation could be retried
    ///
    /// Only transport-level failures qualify. Queue, lifecycle and cancellation
    /// errors are never retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Network(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::Interrupted
            ),
            Error::ExternalRouting => true,
            Error::QueueClosed
            | Error::ExhaustedAttempts { .. }
            | Error::Fetch { .. }
            | Error::Cancelled
            | Error::ShutdownTimeout { .. }
            | Error::ShutdownCancelled { .. }
            | Error::InvalidStageState { .. }
            | Error::InvalidUrl(_)
            | Error::Config { .. }
            | Error::ConfigLoad(_)
            | Error::ConfigExists(_)
            | Error::Serialization(_)
            | Error::Logging(_) => false,
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_connection_errors_are_retryable() {
        for kind in [
            std::io::ErrorKind::TimedOut,
            std::io::ErrorKind::ConnectionRefused,
            std::io::ErrorKind::ConnectionReset,
            std::io::ErrorKind::BrokenPipe,
        ] {
            let err = Error::Io(std::io::Error::new(kind, "transient"));
            assert!(err.is_retryable(), "{kind:?} should be retryable");
        }
    }

    #[test]
    fn io_permission_denied_is_not_retryable() {
        let err = Error::Io(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "denied",
        ));
        assert!(!err.is_retryable());
    }

    #[test]
    fn lifecycle_errors_are_not_retryable() {
        assert!(!Error::QueueClosed.is_retryable());
        assert!(!Error::Cancelled.is_retryable());
        assert!(
            !Error::ShutdownTimeout {
                stage: "processor",
                timeout: Duration::from_secs(5),
            }
            .is_retryable()
        );
        assert!(
            !Error::ExhaustedAttempts {
                id: "1".to_string(),
                status_code: 503,
            }
            .is_retryable()
        );
    }

    #[test]
    fn external_routing_is_retryable() {
        assert!(Error::ExternalRouting.is_retryable());
    }

    #[test]
    fn display_includes_context() {
        let err = Error::ExhaustedAttempts {
            id: "7".to_string(),
            status_code: 429,
        };
        assert_eq!(err.to_string(), "no more attempts for task 7 (last status 429)");

        let err = Error::InvalidStageState {
            stage: "reader",
            operation: "start",
            state: StageState::Running,
        };
        assert_eq!(err.to_string(), "cannot start reader in state Running");

        let err = Error::config("must be greater than zero", "app.workers");
        assert_eq!(err.to_string(), "configuration error: must be greater than zero");
    }
}
