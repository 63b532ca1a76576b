//! Error types
//!
//! Only precondition and infrastructure failures are errors. Environmental
//! and transient failures (no connectivity, reconnect timeouts, failed visits)
//! are reported as values on `RotationResult` / `VisitOutcome`.

use thiserror::Error;

/// Errors raised by the orchestration core
#[derive(Debug, Error)]
pub enum PacerError {
    /// A driver (session loop or schedule runner) is already active
    #[error("{0} already running")]
    AlreadyRunning(&'static str),

    /// The schedule runner was started without a configured schedule
    #[error("no traffic schedule configured")]
    ScheduleMissing,

    /// Schedule parameters cannot produce an interval array
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    /// Configuration failed validation
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The request executor could not complete a visit
    #[error("visit dispatch failed: {0}")]
    Dispatch(String),

    /// A connectivity toggle command failed
    #[error("connectivity toggle failed: {0}")]
    Toggle(String),

    /// I/O error
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// HTTP client error
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// Layered configuration could not be loaded
    #[error(transparent)]
    ConfigLoad(#[from] config::ConfigError),
}

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, PacerError>;
