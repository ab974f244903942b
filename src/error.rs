//! Error handling module for stackkeeper
//!
//! Provides centralized error handling with proper error types using thiserror.
//! Each concern gets its own enum so that service-local failures can be
//! recorded in a run's result list while configuration failures abort the
//! whole invocation before any backend is touched.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Top-level error for an engine invocation.
///
/// Only these errors abort a run. Everything that is local to one service is
/// expressed through [`BackupError`] or [`CleanupError`] and contained in the
/// run's report instead.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Malformed or missing configuration/policy document (exit code 2)
    #[error("Configuration invalid: {0}")]
    ConfigInvalid(String),

    /// Unknown service identifier or environment name (exit code 2)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Periodic scheduler errors
    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    /// IO errors (backup root, event log)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::ConfigInvalid(msg.into())
    }

    /// Create a not-found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Whether this error belongs to the "fails fast before any backend is
    /// touched" class.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::ConfigInvalid(_) | Self::NotFound(_))
    }
}

/// Failure of one backup invocation for one (service, backup type).
#[derive(Error, Debug)]
pub enum BackupError {
    /// Backend container is not running; the service is skipped.
    #[error("{service}: service unavailable ({reason})")]
    ServiceUnavailable { service: String, reason: String },

    /// Requested backup type is not offered by the adapter.
    #[error("{service}: unsupported backup type '{requested}' (supported: {})", .supported.join(", "))]
    UnsupportedBackupType {
        service: String,
        requested: String,
        supported: Vec<String>,
    },

    /// The dump/export command returned non-success or timed out.
    #[error("{service}: backup command failed: {reason}")]
    CommandFailed { service: String, reason: String },

    /// Another invocation holds the lock for this (environment, service).
    #[error("{service}: another backup or cleanup is in progress")]
    InProgress { service: String },

    /// The run was cancelled while this backup was being written.
    #[error("{service}: cancelled, partial artifact discarded")]
    Cancelled { service: String },

    /// Local filesystem failure while writing the artifact.
    #[error("{service}: artifact IO error: {source}")]
    Io {
        service: String,
        #[source]
        source: std::io::Error,
    },
}

impl BackupError {
    /// Create a command failure
    pub fn command(service: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CommandFailed {
            service: service.into(),
            reason: reason.into(),
        }
    }

    /// Translate a runtime failure into the backup taxonomy
    pub fn from_runtime(service: &str, err: RuntimeError) -> Self {
        match err {
            RuntimeError::Unreachable { reason, .. } => Self::ServiceUnavailable {
                service: service.to_string(),
                reason,
            },
            RuntimeError::Cancelled => Self::Cancelled {
                service: service.to_string(),
            },
            other => Self::command(service, other.to_string()),
        }
    }
}

/// Failure of one cleanup invocation for one service.
#[derive(Error, Debug)]
pub enum CleanupError {
    /// Backend container is not running; the service is skipped.
    #[error("{service}: service unavailable ({reason})")]
    ServiceUnavailable { service: String, reason: String },

    /// The cleanup command returned non-success, timed out or produced
    /// output that could not be understood.
    #[error("{service}: cleanup failed: {reason}")]
    Failed { service: String, reason: String },

    /// Another invocation holds the lock for this (environment, service).
    #[error("{service}: another backup or cleanup is in progress")]
    InProgress { service: String },

    /// The run was cancelled while this cleanup was running.
    #[error("{service}: cancelled")]
    Cancelled { service: String },
}

impl CleanupError {
    /// Create a cleanup failure
    pub fn failed(service: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Failed {
            service: service.into(),
            reason: reason.into(),
        }
    }

    /// Translate a runtime failure into the cleanup taxonomy
    pub fn from_runtime(service: &str, err: RuntimeError) -> Self {
        match err {
            RuntimeError::Unreachable { reason, .. } => Self::ServiceUnavailable {
                service: service.to_string(),
                reason,
            },
            RuntimeError::Cancelled => Self::Cancelled {
                service: service.to_string(),
            },
            other => Self::failed(service, other.to_string()),
        }
    }
}

/// Errors from invoking administrative commands through the container runtime.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Container is not running or the runtime cannot see it
    #[error("container '{container}' is not reachable: {reason}")]
    Unreachable { container: String, reason: String },

    /// The runtime binary could not be spawned
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Command exceeded its time budget and was killed
    #[error("{command} timed out after {}s", .after.as_secs())]
    TimedOut { command: String, after: Duration },

    /// Command exited with a non-zero status
    #[error("{command} failed (exit code {code}): {stderr}")]
    Failed {
        command: String,
        code: i32,
        stderr: String,
    },

    /// Run cancelled by signal
    #[error("cancelled")]
    Cancelled,

    /// IO error while streaming command output
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the periodic scheduler backend.
#[derive(Error, Debug)]
pub enum ScheduleError {
    /// Scheduler table could not be read
    #[error("failed to read scheduler table: {0}")]
    Read(String),

    /// Scheduler table could not be written
    #[error("failed to write scheduler table: {0}")]
    Write(String),
}

/// Failure to deliver a notification through one channel.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "error", rename_all = "snake_case")]
pub enum DeliveryError {
    /// Channel id referenced by policy but not configured
    #[error("channel '{channel}' is not configured")]
    UnknownChannel { channel: String },

    /// Transport-level failure (HTTP, sendmail)
    #[error("delivery through '{channel}' failed: {reason}")]
    Failed { channel: String, reason: String },
}

/// Advisory lock acquisition failure.
#[derive(Error, Debug)]
pub enum LockError {
    /// Another process holds the lock
    #[error("lock {path} is held by another process")]
    Contended { path: PathBuf },

    /// Lock file could not be created or locked
    #[error("cannot lock {path}: {reason}")]
    Io { path: PathBuf, reason: String },
}
