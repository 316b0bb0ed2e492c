//! Caller-facing facade over the engine.
//!
//! Callers of [`LabEquipmentManager`] always get a value back for protocol
//! problems: a wrong execution id, a second start while a run is in flight, or
//! a rejected specification become a failed [`ExecutionStatus`] (or `false`
//! for cancellation). Configuration errors, such as an unknown setup id or a
//! missing device, are still returned as `Err`.

use crate::config::LabConfig;
use crate::device::DeviceSet;
use crate::driver::{DriverFactory, DriverRegistry};
use crate::engine::LabEquipmentEngine;
use crate::error::{AppResult, LabError};
use crate::status::{ExecutionStatus, LabEquipmentStatus, Validation};
use std::sync::Arc;
use tracing::{info, warn};

/// Engine facade that answers protocol errors with values.
pub struct LabEquipmentManager {
    engine: LabEquipmentEngine,
}

impl LabEquipmentManager {
    /// Build the factory from `config` and start the engine.
    pub fn start(config: &LabConfig, registry: Arc<DriverRegistry>, devices: DeviceSet) -> AppResult<Self> {
        config.validate_against(&registry)?;
        let factory = DriverFactory::new(registry, config.setups.clone(), devices);
        info!(
            name = %config.application.name,
            setups = ?factory.setup_ids(),
            "Starting lab equipment"
        );
        Ok(Self {
            engine: LabEquipmentEngine::spawn(config.engine, factory),
        })
    }

    /// Wrap an engine that is already running.
    pub fn from_engine(engine: LabEquipmentEngine) -> Self {
        Self { engine }
    }

    /// The wrapped engine.
    pub fn engine(&self) -> &LabEquipmentEngine {
        &self.engine
    }

    /// See [`LabEquipmentEngine::validate`].
    pub async fn validate(&self, specification: &str) -> AppResult<Validation> {
        self.engine.validate(specification).await
    }

    /// Start a run; protocol errors become a rejected status.
    pub async fn start_execution(&self, specification: &str) -> AppResult<ExecutionStatus> {
        flatten(self.engine.start_execution(specification).await)
    }

    /// Status of a run; protocol errors become a rejected status.
    pub async fn get_execution_status(&self, execution_id: i32) -> AppResult<ExecutionStatus> {
        flatten(self.engine.get_execution_status(execution_id).await)
    }

    /// Results of a completed run; `None` on a protocol error.
    pub async fn get_experiment_results(&self, execution_id: i32) -> AppResult<Option<String>> {
        match self.engine.get_experiment_results(execution_id).await {
            Err(e) if e.is_protocol() => {
                warn!(error = %e, "Results request rejected");
                Ok(None)
            }
            other => other,
        }
    }

    /// Cancel a run; `false` on a protocol error.
    pub async fn cancel_lab_execution(&self, execution_id: i32) -> AppResult<bool> {
        match self.engine.cancel_lab_execution(execution_id).await {
            Err(e) if e.is_protocol() => {
                warn!(error = %e, "Cancel request rejected");
                Ok(false)
            }
            other => other,
        }
    }

    /// Seconds until the equipment is ready.
    pub async fn time_until_ready(&self) -> u32 {
        self.engine.time_until_ready().await
    }

    /// Seconds until the idle powerdown; 0 when none is counting down.
    pub async fn time_until_powerdown(&self) -> u32 {
        self.engine.time_until_powerdown().await.unwrap_or(0)
    }

    /// Online flag, status message and power state.
    pub async fn lab_equipment_status(&self) -> LabEquipmentStatus {
        self.engine.lab_equipment_status().await
    }

    /// Stop the engine worker.
    pub async fn shutdown(&self) -> AppResult<()> {
        self.engine.shutdown().await
    }
}

fn flatten(result: AppResult<ExecutionStatus>) -> AppResult<ExecutionStatus> {
    match result {
        Err(e) if e.is_protocol() => {
            warn!(error = %e, "Request rejected");
            Ok(ExecutionStatus::rejected(rejection_message(&e)))
        }
        other => other,
    }
}

fn rejection_message(error: &LabError) -> String {
    match error {
        LabError::SpecificationRejected(message) => message.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ApplicationConfig, SetupConfig};
    use crate::device::simulated::{Faults, SimulationConfig};
    use crate::power::EngineTimings;
    use crate::status::{ExecuteStatus, ResultStatus, NO_EXECUTION_ID};
    use std::collections::BTreeMap;

    fn manager() -> LabEquipmentManager {
        let config = LabConfig {
            application: ApplicationConfig::default(),
            engine: EngineTimings::default(),
            setups: BTreeMap::from([(
                "SpeedVsVoltage".to_string(),
                SetupConfig {
                    driver: "motor".to_string(),
                    config: serde_json::Value::Null,
                },
            )]),
            simulation: SimulationConfig::default(),
        };
        let devices = config.simulation.build_devices(&Faults::new());
        LabEquipmentManager::start(&config, Arc::new(DriverRegistry::with_builtin()), devices).unwrap()
    }

    const SPEC: &str = r#"{"setupId": "SpeedVsVoltage", "min": 0, "max": 12, "step": 4, "repeat": 2}"#;

    #[tokio::test(start_paused = true)]
    async fn test_second_start_becomes_rejection_status() {
        let manager = manager();
        let first = manager.start_execution(SPEC).await.unwrap();
        assert_ne!(first.execution_id, NO_EXECUTION_ID);

        let second = manager.start_execution(SPEC).await.unwrap();
        assert_eq!(second.execution_id, NO_EXECUTION_ID);
        assert_eq!(second.execute_status, ExecuteStatus::Completed);
        assert_eq!(second.result_status, ResultStatus::Failed);
        assert_eq!(
            second.error_message,
            Some(format!("Already executing (execution id {})", first.execution_id))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_specification_message_is_passed_through() {
        let manager = manager();
        let status = manager
            .start_execution(r#"{"setupId": "SpeedVsVoltage", "min": 0, "max": 40, "step": 4, "repeat": 2}"#)
            .await
            .unwrap();
        assert_eq!(
            status.error_message.as_deref(),
            Some("voltage (40) exceeds maximum (24)")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrong_ids_are_values_not_errors() {
        let manager = manager();
        let started = manager.start_execution(SPEC).await.unwrap();
        let wrong = started.execution_id.wrapping_add(1).max(1);

        let status = manager.get_execution_status(wrong).await.unwrap();
        assert!(status.error_message.unwrap().contains("Invalid execution id"));
        assert!(!manager.cancel_lab_execution(wrong).await.unwrap());
        assert!(manager.get_experiment_results(wrong).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_setup_is_still_an_error() {
        let manager = manager();
        let err = manager
            .start_execution(r#"{"setupId": "SpeedVsTorque", "min": 0}"#)
            .await
            .unwrap_err();
        assert!(matches!(err, LabError::UnknownSetup(_)));
        assert!(manager.validate(r#"{"setupId": "SpeedVsTorque"}"#).await.is_err());
    }
}
