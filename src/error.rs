//! Custom error types for the engine.
//!
//! This module defines the primary error type, `FrameworkError`, for the whole
//! crate. Using the `thiserror` crate, it provides a centralized and consistent
//! way to handle the errors that can occur, from configuration and I/O issues
//! to run-lifecycle violations.
//!
//! Expected control-flow outcomes (cancellation, graceful end, pause, step
//! waits) are NOT errors here; those travel as tagged enums (`CheckResult`,
//! `IterationStatus`, `StepWaitOutcome`). `FrameworkError` is reserved for
//! genuine failures that have no meaningful in-band representation.

use thiserror::Error;

/// Convenience alias for results using the engine error type.
pub type AppResult<T> = std::result::Result<T, FrameworkError>;

#[derive(Error, Debug)]
pub enum FrameworkError {
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Settings error: {0}")]
    Settings(#[from] figment::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Strategy error: {0}")]
    Strategy(String),

    #[error("A run is already active: {0}")]
    RunAlreadyActive(String),

    #[error("No run is active")]
    NoActiveRun,

    #[error("Stale command still processing from a previous run: {0}")]
    StaleCommand(String),

    #[error("Worker task failed: {0}")]
    WorkerFailed(String),

    #[error("Worker task did not stop within {0:?}")]
    WorkerJoinTimeout(std::time::Duration),
}
