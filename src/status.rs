//! Status and validation value types exchanged with callers.
//!
//! All of these are plain snapshots: every read through the engine hands out a
//! fresh copy, and nothing here is mutated after it leaves the driver.

use crate::power::PowerState;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Sentinel execution id meaning "no run yet".
pub const NO_EXECUTION_ID: i32 = 0;

/// Where a run is in its lifecycle.
///
/// Everything between `Waiting` and `Finalising` counts as executing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecuteStatus {
    /// No run has been started on this driver
    #[default]
    Created,
    /// Accepted, waiting for the equipment to become ready
    Waiting,
    /// Initialising phase
    Initialising,
    /// Starting phase
    Starting,
    /// Running phase
    Running,
    /// Stopping phase
    Stopping,
    /// Finalising phase
    Finalising,
    /// Every phase has been attempted; see [`ResultStatus`]
    Completed,
}

impl ExecuteStatus {
    /// True while the run still owns the equipment.
    pub fn is_executing(self) -> bool {
        !matches!(self, ExecuteStatus::Created | ExecuteStatus::Completed)
    }
}

impl fmt::Display for ExecuteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Outcome of a run, meaningful once `ExecuteStatus::Completed` is reached.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResultStatus {
    /// Not completed yet
    #[default]
    None,
    /// Every phase succeeded
    Completed,
    /// A phase failed
    Failed,
    /// Stopped at a cancellation point
    Cancelled,
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Snapshot of a run as seen by a caller.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStatus {
    /// Id minted when the run was accepted
    pub execution_id: i32,
    /// Lifecycle position
    pub execute_status: ExecuteStatus,
    /// Outcome once completed
    pub result_status: ResultStatus,
    /// Seconds until the run is expected to complete
    pub time_remaining: u32,
    /// Failure text, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ExecutionStatus {
    /// Status for a request that was turned away before any run was created.
    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            execution_id: NO_EXECUTION_ID,
            execute_status: ExecuteStatus::Completed,
            result_status: ResultStatus::Failed,
            time_remaining: 0,
            error_message: Some(message.into()),
        }
    }

    /// True once the run has reached `Completed`.
    pub fn is_completed(&self) -> bool {
        self.execute_status == ExecuteStatus::Completed
    }

    /// True for a completed run whose results can be fetched.
    pub fn succeeded(&self) -> bool {
        self.is_completed() && self.result_status == ResultStatus::Completed
    }
}

/// Result of validating a specification.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Validation {
    /// Whether the specification can run
    pub accepted: bool,
    /// Estimated wall-clock seconds for the run, zero when rejected
    pub execution_time: u32,
    /// Rejection reason
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl Validation {
    /// An accepted specification with the given time estimate.
    pub fn accepted(execution_time: u32) -> Self {
        Self {
            accepted: true,
            execution_time,
            error_message: None,
        }
    }

    /// A rejected specification.
    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            accepted: false,
            execution_time: 0,
            error_message: Some(message.into()),
        }
    }

    /// Copy of this validation with `seconds` added to the estimate.
    pub fn delayed_by(&self, seconds: u32) -> Self {
        let mut validation = self.clone();
        if validation.accepted {
            validation.execution_time = validation.execution_time.saturating_add(seconds);
        }
        validation
    }
}

/// Overall equipment status reported to callers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabEquipmentStatus {
    /// Whether the equipment is powered
    pub online: bool,
    /// Human-readable summary of the last transition
    pub status_message: String,
    /// Current power state
    pub power_state: PowerState,
}
