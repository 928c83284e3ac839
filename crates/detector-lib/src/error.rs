//! Error types shared across the detection library

use thiserror::Error;

use crate::models::MetricKind;

/// Failures reported by a key-value store backend
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("request throttled: {0}")]
    Throttled(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("table not found: {0}")]
    TableNotFound(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("io error: {0}")]
    Io(String),
}

impl StoreError {
    /// Throttling and availability errors are worth retrying; everything else fails fast.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Throttled(_) | StoreError::Unavailable(_))
    }

    /// Short machine-readable class name for logs and metrics labels
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::Throttled(_) => "throttled",
            StoreError::Unavailable(_) => "unavailable",
            StoreError::AccessDenied(_) => "access_denied",
            StoreError::InvalidKey(_) => "invalid_key",
            StoreError::TableNotFound(_) => "table_not_found",
            StoreError::Codec(_) => "codec",
            StoreError::Io(_) => "io",
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Codec(e.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

/// Errors raised while evaluating a metric sample
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DetectionError {
    #[error("invalid {metric} sample: {field}={value} ({reason})")]
    InvalidSample {
        metric: MetricKind,
        field: &'static str,
        value: f64,
        reason: &'static str,
    },
}

/// Notification delivery failures, classified for retry decisions
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NotifyError {
    #[error("notification sink is not configured")]
    NotConfigured,

    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("sink returned server error status {0}")]
    Server(u16),

    #[error("sink rejected message with status {0}")]
    Client(u16),

    #[error("delivery failed: {0}")]
    Other(String),
}

impl NotifyError {
    /// Timeouts and connection failures are transport-level and retried with backoff
    pub fn is_transport(&self) -> bool {
        matches!(self, NotifyError::Timeout | NotifyError::Connection(_))
    }
}

/// Failures from the metrics source or distribution directory
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    #[error("source request failed: {0}")]
    Request(String),

    #[error("source returned status {status} for {resource}")]
    Status { status: u16, resource: String },

    #[error("malformed source payload: {0}")]
    Malformed(String),
}

/// Rejections of an inbound accounts event
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventValidationError {
    #[error("event must be an object, got {0}")]
    NotAnObject(&'static str),

    #[error("event missing required field: 'accounts'")]
    MissingAccounts,

    #[error("'accounts' must be a list, got {0}")]
    AccountsNotList(&'static str),

    #[error("account at index {index} must be an object, got {kind}")]
    AccountNotObject { index: usize, kind: &'static str },

    #[error("account at index {index} missing required fields: {fields:?}")]
    MissingFields { index: usize, fields: Vec<&'static str> },

    #[error("account at index {index} has invalid '{field}': {reason}")]
    InvalidField {
        index: usize,
        field: &'static str,
        reason: &'static str,
    },

    #[error("event is not valid JSON: {0}")]
    Json(String),
}

/// Configuration validation failure carrying every violation found
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("configuration invalid: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_classification() {
        assert!(StoreError::Throttled("slow down".into()).is_retryable());
        assert!(StoreError::Unavailable("503".into()).is_retryable());
        assert!(!StoreError::AccessDenied("nope".into()).is_retryable());
        assert!(!StoreError::InvalidKey("".into()).is_retryable());
        assert!(!StoreError::Codec("bad".into()).is_retryable());
    }

    #[test]
    fn test_notify_error_classification() {
        assert!(NotifyError::Timeout.is_transport());
        assert!(NotifyError::Connection("reset".into()).is_transport());
        assert!(!NotifyError::Server(502).is_transport());
        assert!(!NotifyError::Client(400).is_transport());
    }

    #[test]
    fn test_config_error_lists_all_violations() {
        let err = ConfigError::Invalid(vec!["a".into(), "b".into()]);
        assert_eq!(err.to_string(), "configuration invalid: a; b");
    }
}
