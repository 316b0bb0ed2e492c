//! Core library for the lab_equipment service.
//!
//! This library contains the power-lifecycle engine, the experiment driver
//! contract with its five-phase sequencer, the concrete experiment drivers,
//! and the device capability traits they run against. It is used by the
//! `lab_equipment` binary and by the integration tests.

pub mod config;
pub mod device;
pub mod driver;
pub mod engine;
pub mod error;
pub mod logging;
pub mod manager;
pub mod power;
pub mod signal;
pub mod specification;
pub mod status;

pub use config::LabConfig;
pub use engine::LabEquipmentEngine;
pub use error::{AppResult, LabError};
pub use manager::LabEquipmentManager;
pub use status::{ExecuteStatus, ExecutionStatus, LabEquipmentStatus, ResultStatus, Validation};
