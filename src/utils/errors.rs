// src/utils/errors.rs
//! Error types for the worker pool engine
//!
//! Every fallible operation of the library returns [`EngineError`]. Errors
//! raised by tasks themselves travel through [`EngineError::Task`] untouched,
//! so callers can downcast them back to their own domain types.

use std::time::Duration;
use thiserror::Error;

/// Main error type for the engine
#[derive(Error, Debug)]
pub enum EngineError {
    /// A retried operation did not succeed before its timeout, or its wait
    /// was interrupted. Carries the last recoverable cause, if any.
    #[error("Retry timeout exceeded after {attempts} attempt(s)")]
    RetryTimeout {
        attempts: u32,
        #[source]
        cause: Option<anyhow::Error>,
    },

    #[error("Task did not complete within {0:?}")]
    TaskTimeout(Duration),

    #[error("Worker process died while executing task (exit code: {exit_code:?})")]
    TaskCrashed { exit_code: Option<i32> },

    /// Error raised by the task itself; the worker is considered healthy.
    #[error(transparent)]
    Task(anyhow::Error),

    #[error("No worker available after {0:?}")]
    QueueTimeout(Duration),

    #[error("Invalid lifecycle operation: {0}")]
    Lifecycle(String),

    #[error("A process with --accept '{accept}' is already running; pid {pid}")]
    ProcessConflict { pid: u32, accept: String },

    #[error("Worker process exited with code {0:?}")]
    ProcessExited(Option<i32>),

    #[error("Failed to stop worker process: {0}")]
    ProcessStopFailed(String),

    #[error("Failed to spawn worker process: {0}")]
    ProcessSpawnFailed(String),

    #[error("Profile directory error: {0}")]
    Profile(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// True when the error came from the task rather than from the pool or
    /// the worker process.
    pub fn is_task_error(&self) -> bool {
        matches!(self, EngineError::Task(_))
    }

    /// True for errors after which the worker was restarted.
    pub fn caused_restart(&self) -> bool {
        matches!(
            self,
            EngineError::TaskTimeout(_) | EngineError::TaskCrashed { .. }
        )
    }
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;
