//! DC motor experiments: speed against armature voltage or field current.
//!
//! `SpeedVsVoltage` sweeps the armature voltage with the field held fixed;
//! `SpeedVsField` sweeps the field current with the armature voltage held
//! fixed. Each point settles, then averages `repeat` speed measurements.

use super::timing::{whole_seconds, ExecutionTimes};
use super::validation::SpecValidator;
use super::{ExperimentPhases, PhaseContext, PhaseResult, Teardown};
use crate::device::{DeviceKind, DeviceSet, MotorRig};
use crate::error::{AppResult, LabError};
use crate::specification::Specification;
use anyhow::anyhow;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::{sleep, Duration};
use tracing::debug;

/// Sweep the armature voltage at a fixed field current.
pub const SETUP_SPEED_VS_VOLTAGE: &str = "SpeedVsVoltage";
/// Sweep the field current at a fixed armature voltage.
pub const SETUP_SPEED_VS_FIELD: &str = "SpeedVsField";

const REQUIRED: &[DeviceKind] = &[DeviceKind::Motor];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Swept {
    Voltage,
    Field,
}

/// Driver configuration from `[setups.<id>.config]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MotorConfig {
    /// Field current (percent) held during a voltage sweep
    #[serde(default = "default_fixed_field")]
    pub fixed_field: f64,
    /// Armature voltage held during a field sweep
    #[serde(default = "default_fixed_voltage")]
    pub fixed_voltage: f64,
    /// Overrides for the default parameter ranges
    #[serde(default)]
    pub limits: SpecValidator,
}

fn default_fixed_field() -> f64 {
    100.0
}

fn default_fixed_voltage() -> f64 {
    12.0
}

impl Default for MotorConfig {
    fn default() -> Self {
        Self {
            fixed_field: default_fixed_field(),
            fixed_voltage: default_fixed_voltage(),
            limits: SpecValidator::default(),
        }
    }
}

fn default_limits() -> SpecValidator {
    SpecValidator::new()
        .with_range("voltage", 0.0, 24.0)
        .with_range("field", 50.0, 100.0)
        .with_range("repeat", 1.0, 10.0)
        .with_max_list_len(50)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SweepSpec {
    min: f64,
    max: f64,
    step: f64,
    repeat: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct Reading {
    set_point: f64,
    speeds: Vec<f64>,
    average_speed: f64,
}

#[derive(Debug, Clone)]
struct Plan {
    set_points: Vec<f64>,
    repeat: u32,
    readings: Vec<Reading>,
}

/// Phase hooks for the two motor setups.
pub struct MotorExperiment {
    swept: Swept,
    devices: DeviceSet,
    config: MotorConfig,
    limits: SpecValidator,
    plan: Option<Plan>,
}

impl MotorExperiment {
    /// Build the experiment for `setup_id`, which must be a motor setup.
    pub fn new(setup_id: &str, devices: DeviceSet, config: MotorConfig) -> AppResult<Self> {
        let swept = match setup_id {
            SETUP_SPEED_VS_VOLTAGE => Swept::Voltage,
            SETUP_SPEED_VS_FIELD => Swept::Field,
            other => {
                return Err(LabError::Configuration(format!(
                    "Setup id '{}' is not a motor setup",
                    other
                )))
            }
        };
        let limits = config.limits.clone().merged_with(&default_limits());
        Ok(Self {
            swept,
            devices,
            config,
            limits,
            plan: None,
        })
    }

    fn motor(&self) -> anyhow::Result<&dyn MotorRig> {
        self.devices
            .motor
            .as_deref()
            .ok_or_else(|| anyhow!("Motor not present"))
    }

    fn swept_name(&self) -> &'static str {
        match self.swept {
            Swept::Voltage => "voltage",
            Swept::Field => "field",
        }
    }

    async fn apply(&self, set_point: f64) -> anyhow::Result<()> {
        let motor = self.motor()?;
        match self.swept {
            Swept::Voltage => motor.set_armature_voltage(set_point).await,
            Swept::Field => motor.set_field_current(set_point).await,
        }
    }
}

/// Number of set points from `min` to `max` inclusive, saturating at
/// `usize::MAX` for sweeps too fine to count.
fn point_count(min: f64, max: f64, step: f64) -> usize {
    let count = ((max - min) / step + 1e-9).floor() + 1.0;
    if count.is_finite() && count < usize::MAX as f64 {
        count as usize
    } else {
        usize::MAX
    }
}

/// `count` set points starting at `min`.
fn set_points(min: f64, step: f64, count: usize) -> Vec<f64> {
    (0..count).map(|i| min + step * i as f64).collect()
}

#[async_trait]
impl ExperimentPhases for MotorExperiment {
    fn name(&self) -> &'static str {
        "DC Motor"
    }

    fn required_devices(&self) -> &'static [DeviceKind] {
        REQUIRED
    }

    fn configure(&mut self, spec: &Specification) -> Result<ExecutionTimes, String> {
        let sweep: SweepSpec = spec.parse_params()?;
        let name = self.swept_name();

        if sweep.step.is_nan() || sweep.step <= 0.0 {
            return Err(format!("step ({}) must be greater than zero", sweep.step));
        }
        if sweep.min > sweep.max {
            return Err(format!(
                "min ({}) is greater than max ({})",
                sweep.min, sweep.max
            ));
        }
        self.limits.check(name, sweep.min)?;
        self.limits.check(name, sweep.max)?;
        self.limits.check("repeat", sweep.repeat)?;

        let count = point_count(sweep.min, sweep.max, sweep.step);
        self.limits.check_len(name, count)?;
        let points = set_points(sweep.min, sweep.step, count);

        let motor = self.motor().map_err(|e| e.to_string())?;
        let per_point = motor.settle_time() + motor.measure_time() * f64::from(sweep.repeat);
        let times = ExecutionTimes {
            initialise: 0,
            start: whole_seconds(motor.settle_time()),
            run: whole_seconds(per_point * points.len() as f64),
            // Zeroing the set points and stopping the motor are taken as instant.
            stop: 0,
            finalise: 0,
        };

        self.plan = Some(Plan {
            set_points: points,
            repeat: sweep.repeat,
            readings: Vec::new(),
        });
        Ok(times)
    }

    async fn initialise(&mut self, _ctx: &PhaseContext) -> PhaseResult {
        let motor = self.motor()?;
        match self.swept {
            Swept::Voltage => motor.set_field_current(self.config.fixed_field).await?,
            Swept::Field => motor.set_armature_voltage(0.0).await?,
        }
        Ok(())
    }

    async fn start(&mut self, _ctx: &PhaseContext) -> PhaseResult {
        let motor = self.motor()?;
        let first = self
            .plan
            .as_ref()
            .and_then(|p| p.set_points.first().copied())
            .ok_or_else(|| anyhow!("No validated specification"))?;
        match self.swept {
            Swept::Voltage => motor.set_armature_voltage(first).await?,
            Swept::Field => {
                motor.set_field_current(first).await?;
                motor.set_armature_voltage(self.config.fixed_voltage).await?;
            }
        }
        sleep(Duration::from_secs_f64(motor.settle_time().max(0.0))).await;
        Ok(())
    }

    async fn run(&mut self, ctx: &PhaseContext) -> PhaseResult {
        let mut plan = self
            .plan
            .take()
            .ok_or_else(|| anyhow!("No validated specification"))?;
        plan.readings.clear();
        let outcome = self.measure(&mut plan, ctx).await;
        self.plan = Some(plan);
        outcome
    }

    async fn stop(&mut self, teardown: &mut Teardown) {
        teardown
            .step("zero armature", async {
                self.motor()?.set_armature_voltage(0.0).await
            })
            .await;
        teardown
            .step("zero field", async { self.motor()?.set_field_current(0.0).await })
            .await;
        teardown
            .step("stop motor", async { self.motor()?.stop_motor().await })
            .await;
    }

    fn results(&self) -> serde_json::Value {
        match &self.plan {
            Some(plan) => json!({
                "swept": self.swept_name(),
                "repeat": plan.repeat,
                "readings": plan.readings,
            }),
            None => serde_json::Value::Null,
        }
    }
}

impl MotorExperiment {
    async fn measure(&self, plan: &mut Plan, ctx: &PhaseContext) -> PhaseResult {
        let motor = self.motor()?;
        let settle = Duration::from_secs_f64(motor.settle_time().max(0.0));

        for &set_point in &plan.set_points {
            ctx.checkpoint()?;
            self.apply(set_point).await?;
            sleep(settle).await;

            let mut speeds = Vec::with_capacity(plan.repeat as usize);
            for _ in 0..plan.repeat {
                ctx.checkpoint()?;
                speeds.push(motor.measure_speed().await?);
            }
            let average_speed = if speeds.is_empty() {
                0.0
            } else {
                speeds.iter().sum::<f64>() / speeds.len() as f64
            };
            debug!(set_point, average_speed, "Motor point measured");
            plan.readings.push(Reading {
                set_point,
                speeds,
                average_speed,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::simulated::{Faults, SimulationConfig};
    use crate::driver::{ExperimentDriver, PhasedDriver};
    use crate::status::ResultStatus;

    fn driver(setup_id: &str, faults: &Faults) -> PhasedDriver<MotorExperiment> {
        let devices = SimulationConfig::default().build_devices(faults);
        let phases = MotorExperiment::new(setup_id, devices.clone(), MotorConfig::default()).unwrap();
        PhasedDriver::new(setup_id, devices, phases)
    }

    fn voltage_spec(min: f64, max: f64, step: f64, repeat: u32) -> Specification {
        Specification::parse(&format!(
            r#"{{"setupId": "SpeedVsVoltage", "min": {min}, "max": {max}, "step": {step}, "repeat": {repeat}}}"#
        ))
        .unwrap()
    }

    #[test]
    fn test_set_points_include_max() {
        assert_eq!(point_count(0.0, 10.0, 2.5), 5);
        assert_eq!(set_points(0.0, 2.5, 5), vec![0.0, 2.5, 5.0, 7.5, 10.0]);
        assert_eq!(point_count(4.0, 4.0, 1.0), 1);
        assert_eq!(point_count(0.0, 0.3, 0.1), 4);
    }

    #[test]
    fn test_point_count_saturates_for_tiny_steps() {
        assert_eq!(point_count(0.0, 24.0, 1e-300), usize::MAX);
        assert_eq!(point_count(0.0, 24.0, f64::MIN_POSITIVE), usize::MAX);
    }

    #[tokio::test]
    async fn test_tiny_step_is_rejected_before_expanding() {
        let driver = driver(SETUP_SPEED_VS_VOLTAGE, &Faults::new());
        let spec = Specification::parse(
            r#"{"setupId": "SpeedVsVoltage", "min": 0, "max": 24, "step": 1e-300, "repeat": 1}"#,
        )
        .unwrap();

        let validation = driver.validate(&spec).await.unwrap();
        assert!(!validation.accepted);
        let message = validation.error_message.unwrap();
        assert!(message.starts_with("voltage list has"), "{message}");
        assert!(message.ends_with("maximum is 50"), "{message}");
    }

    #[tokio::test]
    async fn test_estimate_from_settle_and_measure_times() {
        let driver = driver(SETUP_SPEED_VS_VOLTAGE, &Faults::new());
        let validation = driver.validate(&voltage_spec(0.0, 12.0, 4.0, 3)).await.unwrap();
        // start settles 2s; 4 points x (2s settle + 3 x 1s measure)
        assert_eq!(validation.execution_time, 2 + 20);
    }

    #[tokio::test]
    async fn test_rejections() {
        let driver = driver(SETUP_SPEED_VS_VOLTAGE, &Faults::new());
        let cases = [
            (voltage_spec(0.0, 30.0, 5.0, 1), "voltage (30) exceeds maximum (24)"),
            (voltage_spec(10.0, 5.0, 1.0, 1), "min (10) is greater than max (5)"),
            (voltage_spec(0.0, 10.0, 0.0, 1), "step (0) must be greater than zero"),
            (voltage_spec(0.0, 10.0, 0.1, 1), "voltage list has 101 entries, maximum is 50"),
        ];
        for (spec, message) in cases {
            let validation = driver.validate(&spec).await.unwrap();
            assert!(!validation.accepted);
            assert_eq!(validation.error_message.as_deref(), Some(message));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_voltage_sweep_averages_measurements() {
        let faults = Faults::new();
        let driver = driver(SETUP_SPEED_VS_VOLTAGE, &faults);
        driver.validate(&voltage_spec(5.0, 10.0, 5.0, 2)).await.unwrap();
        driver.execute().await;

        assert!(driver.execution_status().succeeded());
        assert_eq!(faults.call_count("motor.measure"), 4);

        let doc: serde_json::Value =
            serde_json::from_str(&driver.experiment_results().await.unwrap()).unwrap();
        let readings = doc["data"]["readings"].as_array().unwrap();
        assert_eq!(readings.len(), 2);
        let average = readings[1]["averageSpeed"].as_f64().unwrap();
        assert!((average - 1200.0).abs() <= 0.5, "average {average}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_zeroes_armature_before_field() {
        let faults = Faults::new();
        faults.fail_on("motor.measure", "Tachometer not responding");
        let driver = driver(SETUP_SPEED_VS_VOLTAGE, &faults);
        driver.validate(&voltage_spec(0.0, 4.0, 2.0, 1)).await.unwrap();
        driver.execute().await;

        let status = driver.execution_status();
        assert_eq!(status.result_status, ResultStatus::Failed);
        assert_eq!(status.error_message.as_deref(), Some("Tachometer not responding"));

        let calls = faults.calls();
        let tail: Vec<&str> = calls.iter().rev().take(3).rev().map(String::as_str).collect();
        assert_eq!(tail, vec!["motor.armature", "motor.field", "motor.stop"]);
    }
}
