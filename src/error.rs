//! Custom error types for the application.
//!
//! This module defines the primary error type, `LabError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to
//! report the failures that reach a caller of the engine.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps errors from `figment`, typically file parsing or type
//!   mismatches while loading the configuration.
//! - **`Configuration`**, **`UnknownSetup`**, **`MissingDevice`**: Semantic
//!   configuration errors. These are fatal for the request that hit them and
//!   are never retried.
//! - **`AlreadyExecuting`**, **`InvalidExecutionId`**: Protocol errors raised by
//!   the engine when a caller breaks single-flight or presents the wrong
//!   execution id. The manager facade flattens these into rejection statuses.
//! - **`SpecificationRejected`**: The submitted specification was not accepted.
//! - **`Instrument`**: Failures originating from a device.
//! - **`Worker`**: The engine worker task stopped unexpectedly.
//!
//! Hardware failures inside an experiment run are *not* `LabError`s; they are
//! captured into the run's `ExecutionStatus` instead.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, LabError>;

/// Errors returned by the engine and its collaborators.
#[derive(Error, Debug)]
pub enum LabError {
    /// Loading the configuration failed
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// The configuration is inconsistent
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// No setup is configured under this id
    #[error("Unknown setup id: '{0}'")]
    UnknownSetup(String),

    /// A driver needs a device that is not installed
    #[error("Required device not present: {0}")]
    MissingDevice(String),

    /// A run is still in flight
    #[error("Already executing (execution id {0})")]
    AlreadyExecuting(i32),

    /// The id does not belong to the held run
    #[error("Invalid execution id: {0}")]
    InvalidExecutionId(i32),

    /// The specification was not accepted; carries the reason
    #[error("Specification rejected: {0}")]
    SpecificationRejected(String),

    /// A device reported a failure
    #[error("Instrument error: {0}")]
    Instrument(String),

    /// The engine is shut down or its worker failed
    #[error("Engine worker error: {0}")]
    Worker(String),

    /// Reading or writing a file failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LabError {
    /// True for errors a caller causes by breaking the execution-id protocol.
    ///
    /// These are reported back as rejection values rather than faults.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            LabError::AlreadyExecuting(_)
                | LabError::InvalidExecutionId(_)
                | LabError::SpecificationRejected(_)
        )
    }
}
