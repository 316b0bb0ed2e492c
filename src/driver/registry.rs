//! Driver registry and the setup-id factory built on it.
//!
//! A [`DriverRegistry`] maps a driver *kind* (the `driver` key of a setup in
//! the configuration) to a constructor. A [`DriverFactory`] combines the
//! registry with the configured setups and the equipment, and turns a setup id
//! into a fresh driver instance.
//!
//! ```toml
//! [setups.RadioactivityVsDistance]
//! driver = "radioactivity"
//!
//! [setups.RadioactivityVsDistance.config.limits]
//! max_list_len = 8
//! ```

use super::motor::{MotorConfig, MotorExperiment};
use super::radioactivity::{RadioactivityConfig, RadioactivityExperiment};
use super::{ExperimentDriver, PhasedDriver};
use crate::config::SetupConfig;
use crate::device::DeviceSet;
use crate::error::{AppResult, LabError};
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

/// Everything a constructor gets to build one driver instance.
pub struct DriverContext<'a> {
    /// Setup id being built
    pub setup_id: &'a str,
    /// The setup's opaque `config` table
    pub config: &'a serde_json::Value,
    /// Equipment shared by every driver
    pub devices: &'a DeviceSet,
}

impl DriverContext<'_> {
    /// Deserialize the setup's configuration, defaulting when absent.
    pub fn parse_config<T: DeserializeOwned + Default>(&self) -> AppResult<T> {
        if self.config.is_null() {
            return Ok(T::default());
        }
        serde_json::from_value(self.config.clone()).map_err(|e| {
            LabError::Configuration(format!(
                "Invalid configuration for setup '{}': {}",
                self.setup_id, e
            ))
        })
    }
}

type DriverConstructor =
    Box<dyn Fn(&DriverContext<'_>) -> AppResult<Box<dyn ExperimentDriver>> + Send + Sync>;

/// Driver kinds known to this build.
pub struct DriverRegistry {
    constructors: HashMap<String, DriverConstructor>,
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

impl DriverRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// A registry with the `radioactivity` and `motor` kinds.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("radioactivity", |ctx| {
            let config: RadioactivityConfig = ctx.parse_config()?;
            let phases = RadioactivityExperiment::new(ctx.setup_id, ctx.devices.clone(), config)?;
            Ok(PhasedDriver::boxed(ctx.setup_id, ctx.devices.clone(), phases))
        });
        registry.register("motor", |ctx| {
            let config: MotorConfig = ctx.parse_config()?;
            let phases = MotorExperiment::new(ctx.setup_id, ctx.devices.clone(), config)?;
            Ok(PhasedDriver::boxed(ctx.setup_id, ctx.devices.clone(), phases))
        });
        registry
    }

    /// Register a constructor for `kind`, replacing any existing one.
    pub fn register<F>(&mut self, kind: impl Into<String>, constructor: F)
    where
        F: Fn(&DriverContext<'_>) -> AppResult<Box<dyn ExperimentDriver>> + Send + Sync + 'static,
    {
        self.constructors.insert(kind.into(), Box::new(constructor));
    }

    /// Whether `kind` has a constructor.
    pub fn contains(&self, kind: &str) -> bool {
        self.constructors.contains_key(kind)
    }

    /// Registered kind names, sorted.
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.constructors.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// Build a driver of `kind`.
    pub fn create(&self, kind: &str, ctx: &DriverContext<'_>) -> AppResult<Box<dyn ExperimentDriver>> {
        let constructor = self.constructors.get(kind).ok_or_else(|| {
            LabError::Configuration(format!(
                "Setup '{}' uses unknown driver '{}'",
                ctx.setup_id, kind
            ))
        })?;
        constructor(ctx)
    }
}

/// Resolves setup ids to fresh driver instances.
#[derive(Clone)]
pub struct DriverFactory {
    registry: Arc<DriverRegistry>,
    setups: BTreeMap<String, SetupConfig>,
    devices: DeviceSet,
}

impl DriverFactory {
    /// Factory over `setups`, building drivers from `registry`.
    pub fn new(
        registry: Arc<DriverRegistry>,
        setups: BTreeMap<String, SetupConfig>,
        devices: DeviceSet,
    ) -> Self {
        Self {
            registry,
            setups,
            devices,
        }
    }

    /// Setup ids this factory can build, sorted.
    pub fn setup_ids(&self) -> Vec<&str> {
        self.setups.keys().map(String::as_str).collect()
    }

    /// Equipment handed to every driver.
    pub fn devices(&self) -> &DeviceSet {
        &self.devices
    }

    /// Build a new driver for `setup_id`.
    pub fn create(&self, setup_id: &str) -> AppResult<Box<dyn ExperimentDriver>> {
        let setup = self
            .setups
            .get(setup_id)
            .ok_or_else(|| LabError::UnknownSetup(setup_id.to_string()))?;
        debug!(setup = setup_id, driver = %setup.driver, "Creating driver");
        let ctx = DriverContext {
            setup_id,
            config: &setup.config,
            devices: &self.devices,
        };
        self.registry.create(&setup.driver, &ctx)
    }
}

impl std::fmt::Debug for DriverFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverFactory")
            .field("kinds", &self.registry.kinds())
            .field("setups", &self.setup_ids())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::simulated::{Faults, SimulationConfig};
    use serde_json::json;

    fn factory(setups: &[(&str, &str, serde_json::Value)]) -> DriverFactory {
        let setups = setups
            .iter()
            .map(|(id, driver, config)| {
                (
                    id.to_string(),
                    SetupConfig {
                        driver: driver.to_string(),
                        config: config.clone(),
                    },
                )
            })
            .collect();
        DriverFactory::new(
            Arc::new(DriverRegistry::with_builtin()),
            setups,
            SimulationConfig::default().build_devices(&Faults::new()),
        )
    }

    #[test]
    fn test_builtin_kinds() {
        assert_eq!(DriverRegistry::with_builtin().kinds(), vec!["motor", "radioactivity"]);
    }

    #[test]
    fn test_create_resolves_setup_to_driver() {
        let factory = factory(&[
            ("SpeedVsField", "motor", serde_json::Value::Null),
            ("RadioactivityVsTime", "radioactivity", json!({})),
        ]);
        let motor = factory.create("SpeedVsField").unwrap();
        assert_eq!(motor.name(), "DC Motor");
        assert_eq!(motor.setup_id(), "SpeedVsField");
        assert_eq!(factory.create("RadioactivityVsTime").unwrap().name(), "Radioactivity");
    }

    #[test]
    fn test_unknown_setup_is_configuration_error() {
        let factory = factory(&[("SpeedVsField", "motor", serde_json::Value::Null)]);
        let err = factory.create("SpeedVsTorque").err().unwrap();
        assert!(matches!(err, LabError::UnknownSetup(ref id) if id == "SpeedVsTorque"));
    }

    #[test]
    fn test_bad_driver_config_names_the_setup() {
        let factory = factory(&[("SpeedVsField", "motor", json!({"fixed_voltage": "high"}))]);
        let err = factory.create("SpeedVsField").err().unwrap();
        assert!(err.to_string().contains("Invalid configuration for setup 'SpeedVsField'"));
    }

    #[test]
    fn test_custom_kind_can_be_registered() {
        let mut registry = DriverRegistry::new();
        registry.register("motor-alias", |ctx| {
            let phases = MotorExperiment::new("SpeedVsVoltage", ctx.devices.clone(), MotorConfig::default())?;
            Ok(PhasedDriver::boxed(ctx.setup_id, ctx.devices.clone(), phases))
        });
        assert!(registry.contains("motor-alias"));
        assert!(!registry.contains("motor"));
    }
}
