//! Configuration loading using Figment.
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `LABEQUIP_`, nested keys separated
//!    by a double underscore
//!
//! ```text
//! LABEQUIP_APPLICATION__LOG_LEVEL=debug
//! LABEQUIP_ENGINE__POWERDOWN_TIMEOUT=0
//! ```
//!
//! # Example
//!
//! ```toml
//! [application]
//! name = "Radioactivity Lab"
//! log_level = "info"
//!
//! [engine]
//! powerup_delay = 5
//! initialise_delay = 3
//! powerdown_timeout = 300
//! poweroff_delay = 10
//!
//! [setups.RadioactivityVsDistance]
//! driver = "radioactivity"
//! ```

use crate::device::simulated::SimulationConfig;
use crate::driver::DriverRegistry;
use crate::error::{AppResult, LabError};
use crate::power::EngineTimings;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Longest powerup, initialise or poweroff delay accepted, in seconds.
pub const MAX_DELAY_SECS: u32 = 3600;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabConfig {
    /// Application name and logging
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Power lifecycle timings
    #[serde(default)]
    pub engine: EngineTimings,
    /// Setup id to driver selection
    #[serde(default)]
    pub setups: BTreeMap<String, SetupConfig>,
    /// Simulated equipment used by the CLI and tests
    #[serde(default)]
    pub simulation: SimulationConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Display name used in startup logs
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Emit JSON log lines instead of human-readable ones
    #[serde(default)]
    pub log_json: bool,
}

fn default_name() -> String {
    "Lab Equipment".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_json: false,
        }
    }
}

/// One `[setups.<id>]` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetupConfig {
    /// Registered driver kind, e.g. `radioactivity`
    pub driver: String,
    /// Driver-specific settings handed to the constructor as-is
    #[serde(default)]
    pub config: serde_json::Value,
}

impl LabConfig {
    /// Load configuration from `path` and the environment, then validate it.
    ///
    /// Environment variables take precedence over the file.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("LABEQUIP_").split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Validate against the built-in driver kinds.
    pub fn validate(&self) -> AppResult<()> {
        self.validate_against(&DriverRegistry::with_builtin())
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - At least one setup is configured
    /// - Every setup names a driver kind known to `registry`
    /// - Delays are at most [`MAX_DELAY_SECS`]
    pub fn validate_against(&self, registry: &DriverRegistry) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(LabError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.setups.is_empty() {
            return Err(LabError::Configuration(
                "At least one setup must be configured".to_string(),
            ));
        }

        for (id, setup) in &self.setups {
            if !registry.contains(&setup.driver) {
                return Err(LabError::Configuration(format!(
                    "Invalid driver '{}' for setup '{}'. Must be one of: {}",
                    setup.driver,
                    id,
                    registry.kinds().join(", ")
                )));
            }
        }

        let delays = [
            ("powerup_delay", self.engine.powerup_delay),
            ("initialise_delay", self.engine.initialise_delay),
            ("poweroff_delay", self.engine.poweroff_delay),
        ];
        for (name, value) in delays {
            if value > MAX_DELAY_SECS {
                return Err(LabError::Configuration(format!(
                    "Invalid {} {}. Must be at most {}",
                    name, value, MAX_DELAY_SECS
                )));
            }
        }

        if self.engine.hardware_timeout == 0 {
            return Err(LabError::Configuration(
                "Invalid hardware_timeout 0. Must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn config() -> LabConfig {
        LabConfig {
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
        }
    }

    fn write_toml(contents: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_config_validation_valid() {
        assert!(config().validate().is_ok());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = config();
        config.application.log_level = "verbose".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Invalid log_level"));
    }

    #[test]
    fn test_no_setups() {
        let mut config = config();
        config.setups.clear();
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("At least one setup"));
    }

    #[test]
    fn test_unknown_driver_kind() {
        let mut config = config();
        config.setups.insert(
            "Pendulum".to_string(),
            SetupConfig {
                driver: "pendulum".to_string(),
                config: serde_json::Value::Null,
            },
        );
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("Invalid driver 'pendulum' for setup 'Pendulum'"));
        assert!(err.contains("motor, radioactivity"));
    }

    #[test]
    fn test_delay_limit() {
        let mut config = config();
        config.engine.poweroff_delay = MAX_DELAY_SECS + 1;
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("Invalid poweroff_delay 3601"));

        // The idle timeout is not capped.
        let mut config = self::config();
        config.engine.powerdown_timeout = 86_400;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let file = write_toml(
            r#"
[application]
name = "Radioactivity Lab"
log_level = "debug"

[engine]
powerup_delay = 7
powerdown_timeout = 0

[setups.RadioactivityVsDistance]
driver = "radioactivity"

[setups.RadioactivityVsDistance.config.limits]
max_list_len = 4

[simulation.counter]
counts_per_sec = 12.5
"#,
        );

        let config = LabConfig::load_from(file.path()).unwrap();
        assert_eq!(config.application.name, "Radioactivity Lab");
        assert_eq!(config.engine.powerup_delay, 7);
        assert_eq!(config.engine.initialise_delay, 3);
        assert!(!config.engine.powerdown_enabled());
        assert_eq!(config.simulation.counter.counts_per_sec, 12.5);

        let setup = &config.setups["RadioactivityVsDistance"];
        assert_eq!(setup.driver, "radioactivity");
        assert_eq!(setup.config["limits"]["max_list_len"], 4);
    }

    #[test]
    fn test_load_rejects_type_mismatch() {
        let file = write_toml(
            r#"
[engine]
powerup_delay = "soon"

[setups.SpeedVsVoltage]
driver = "motor"
"#,
        );
        let err = LabConfig::load_from(file.path()).unwrap_err();
        assert!(matches!(err, LabError::Config(_)));
    }
}
