//! Job error types and connectivity classification.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type for job operations.
pub type JobResult<T> = Result<T, JobError>;

/// Job-related errors.
#[derive(Debug, Error)]
pub enum JobError {
    /// A job handler failed.
    #[error("Job handler failed: {message}")]
    Handler {
        message: String,
        code: Option<String>,
    },

    /// Operation timed out.
    #[error("{operation} timed out after {}ms", .after.as_millis())]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// Broker is not usable right now.
    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Redis error.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Redis pool error.
    #[error("Redis pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Unknown job type.
    #[error("Unknown job type: {0}")]
    UnknownJobType(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Class of a connectivity failure. Used to deduplicate log output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityKind {
    /// Connection refused.
    Refused,
    /// Connection reset by peer.
    Reset,
    /// Connection closed or dropped.
    Closed,
    /// Stream ended unexpectedly.
    Ended,
    /// Connect, ping, or pool checkout timed out.
    Timeout,
    /// Some other connection-level failure.
    Other,
}

impl fmt::Display for ConnectivityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Refused => "refused",
            Self::Reset => "reset",
            Self::Closed => "closed",
            Self::Ended => "ended",
            Self::Timeout => "timeout",
            Self::Other => "connection",
        };
        f.write_str(name)
    }
}

impl ConnectivityKind {
    /// Classifies an error message. Returns `None` for application errors.
    #[must_use]
    pub fn from_message(message: &str) -> Option<Self> {
        let lower = message.to_ascii_lowercase();

        if lower.contains("refused") {
            Some(Self::Refused)
        } else if lower.contains("reset") {
            Some(Self::Reset)
        } else if lower.contains("timed out") || lower.contains("timeout") {
            Some(Self::Timeout)
        } else if lower.contains("closed") || lower.contains("broken pipe") {
            Some(Self::Closed)
        } else if lower.contains("ended") || lower.contains("unexpected eof") {
            Some(Self::Ended)
        } else if lower.contains("connection") {
            Some(Self::Other)
        } else {
            None
        }
    }

    fn from_redis(err: &redis::RedisError) -> Option<Self> {
        if err.is_connection_refusal() {
            return Some(Self::Refused);
        }
        if err.is_timeout() {
            return Some(Self::Timeout);
        }
        if let Some(kind) = Self::from_message(&err.to_string()) {
            return Some(kind);
        }
        if err.is_connection_dropped() {
            return Some(Self::Closed);
        }
        if err.is_io_error() {
            return Some(Self::Other);
        }
        None
    }
}

impl JobError {
    /// Creates a handler error.
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler {
            message: message.into(),
            code: None,
        }
    }

    /// Creates a handler error with a machine-readable code.
    pub fn handler_with_code(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self::Handler {
            message: message.into(),
            code: Some(code.into()),
        }
    }

    /// Returns the connectivity class of this error, or `None` when it is an
    /// application-level failure.
    #[must_use]
    pub fn connectivity(&self) -> Option<ConnectivityKind> {
        match self {
            JobError::Redis(e) => ConnectivityKind::from_redis(e),
            JobError::Pool(e) => match e {
                deadpool_redis::PoolError::Timeout(_) => Some(ConnectivityKind::Timeout),
                deadpool_redis::PoolError::Backend(inner) => ConnectivityKind::from_redis(inner)
                    .or(Some(ConnectivityKind::Other)),
                deadpool_redis::PoolError::Closed => Some(ConnectivityKind::Closed),
                _ => ConnectivityKind::from_message(&e.to_string()),
            },
            JobError::Timeout { .. } => Some(ConnectivityKind::Timeout),
            JobError::BrokerUnavailable(msg) => {
                ConnectivityKind::from_message(msg).or(Some(ConnectivityKind::Other))
            }
            JobError::Io(e) => match e.kind() {
                std::io::ErrorKind::ConnectionRefused => Some(ConnectivityKind::Refused),
                std::io::ErrorKind::ConnectionReset => Some(ConnectivityKind::Reset),
                std::io::ErrorKind::ConnectionAborted | std::io::ErrorKind::BrokenPipe => {
                    Some(ConnectivityKind::Closed)
                }
                std::io::ErrorKind::UnexpectedEof => Some(ConnectivityKind::Ended),
                std::io::ErrorKind::TimedOut => Some(ConnectivityKind::Timeout),
                _ => None,
            },
            _ => None,
        }
    }

    /// Returns true if this error signals broker unavailability.
    #[must_use]
    pub fn is_connectivity(&self) -> bool {
        self.connectivity().is_some()
    }

    /// Returns true if a broker job failing with this error may be retried.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            JobError::Handler { .. } | JobError::Timeout { .. } | JobError::Redis(_) | JobError::Pool(_)
        )
    }

    /// Machine-readable code, when one exists.
    #[must_use]
    pub fn code(&self) -> Option<String> {
        match self {
            JobError::Handler { code, .. } => code.clone(),
            JobError::Timeout { .. } => Some("TIMEOUT".to_string()),
            JobError::Redis(e) => Some(format!("{:?}", e.kind())),
            JobError::Io(e) => Some(format!("{:?}", e.kind())),
            _ => self.connectivity().map(|k| k.to_string().to_ascii_uppercase()),
        }
    }
}

impl From<imgq_core::ImgqError> for JobError {
    fn from(err: imgq_core::ImgqError) -> Self {
        use imgq_core::ImgqError;

        match err {
            ImgqError::Configuration(message) | ImgqError::Validation(message) => {
                JobError::Configuration(message)
            }
            ImgqError::Io(e) => JobError::Io(e),
            other => JobError::Internal(other.to_string()),
        }
    }
}

/// Serializable error detail stored with failed jobs and dead-letter records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Error message.
    pub message: String,

    /// Cause chain, one cause per line.
    pub stack: Option<String>,

    /// Machine-readable code.
    pub code: Option<String>,
}

impl ErrorDetail {
    /// Builds a detail from any error, walking its `source()` chain.
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut causes = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            causes.push(cause.to_string());
            source = cause.source();
        }

        Self {
            message: err.to_string(),
            stack: (!causes.is_empty()).then(|| causes.join("\n")),
            code: None,
        }
    }
}

impl From<&JobError> for ErrorDetail {
    fn from(err: &JobError) -> Self {
        let mut detail = ErrorDetail::from_error(err);
        if let JobError::Handler { message, .. } = err {
            detail.message = message.clone();
        }
        detail.code = err.code();
        detail
    }
}
