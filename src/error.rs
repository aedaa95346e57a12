//! Error types shared by the engine, the backends and the config loader.
use std::time::Duration;

use thiserror::Error;

/// Errors surfaced to callers of the engine API.
///
/// `InvalidTarget` and `Configuration` are raised synchronously at job
/// creation; everything that goes wrong after a job is queued is captured in
/// the job's own outcome instead.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScanError {
    #[error("invalid target '{target}': {reason}")]
    InvalidTarget { target: String, reason: String },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    #[error("scan is already in terminal state '{status}'")]
    AlreadyTerminal { status: String },

    #[error("no free scan slot ({limit} in use)")]
    GovernorExhausted { limit: usize },

    #[error("cancelled")]
    Cancelled,
}

impl ScanError {
    pub fn invalid_target(target: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidTarget {
            target: target.into(),
            reason: reason.into(),
        }
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn scan_not_found(id: impl ToString) -> Self {
        Self::NotFound {
            kind: "scan",
            id: id.to_string(),
        }
    }

    pub fn schedule_not_found(id: impl ToString) -> Self {
        Self::NotFound {
            kind: "schedule",
            id: id.to_string(),
        }
    }
}

/// Failure of a single target probe, as reported by a backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProbeError {
    /// Worth retrying: timeouts, resets, temporary resolver failures.
    #[error("transient: {0}")]
    Transient(String),

    /// Retrying will not help: malformed target, permission denied, unresolvable name.
    #[error("{0}")]
    Permanent(String),

    #[error("probe timed out after {0:?}")]
    Timeout(Duration),

    #[error("probe cancelled")]
    Cancelled,
}

impl ProbeError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }

    /// Classify an I/O error from a connect or read.
    pub fn from_io(err: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
            | ErrorKind::TimedOut
            | ErrorKind::BrokenPipe => Self::Transient(err.to_string()),
            _ => Self::Permanent(err.to_string()),
        }
    }
}

/// Errors raised while loading or validating the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {path}")]
    FileNotFound { path: String },

    #[error("failed to parse config: {reason}")]
    ParseFailed { reason: String },

    #[error("invalid config value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}
