//! Simulated Hardware Implementations
//!
//! Provides simulated devices for running the engine without physical hardware.
//! All simulated devices use async-safe operations (`tokio::time::sleep`, not
//! `std::thread::sleep`), so tests can run them on a paused clock.
//!
//! Every device carries a [`Faults`] handle: a shared table of operation names
//! that should fail, plus a log of every operation attempted. Tests use it to
//! inject hardware failures and to check which teardown steps ran.

use super::{DeviceSet, MotorRig, PowerControl, RadiationCounter, Selector, TubeMover};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::time::{sleep, Duration};
use tracing::{debug, trace};

// =============================================================================
// Fault injection
// =============================================================================

#[derive(Default)]
struct FaultTable {
    planned: HashMap<String, String>,
    calls: Vec<String>,
}

/// Shared fault plan and call log for a group of simulated devices.
#[derive(Clone, Default)]
pub struct Faults {
    inner: Arc<Mutex<FaultTable>>,
}

impl Faults {
    /// An empty fault plan.
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, FaultTable> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every call to `operation` fail with `message` until cleared.
    pub fn fail_on(&self, operation: impl Into<String>, message: impl Into<String>) {
        self.table().planned.insert(operation.into(), message.into());
    }

    /// Stop failing `operation`.
    pub fn clear(&self, operation: &str) {
        self.table().planned.remove(operation);
    }

    /// Every operation attempted so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.table().calls.clone()
    }

    /// How many times `operation` was attempted.
    pub fn call_count(&self, operation: &str) -> usize {
        self.table().calls.iter().filter(|c| *c == operation).count()
    }

    /// Record an attempt at `operation` and fail it if planned.
    pub fn check(&self, operation: &str) -> Result<()> {
        let mut table = self.table();
        table.calls.push(operation.to_string());
        match table.planned.get(operation) {
            Some(message) => Err(anyhow!("{}", message)),
            None => Ok(()),
        }
    }
}

fn secs(seconds: f64) -> Duration {
    Duration::from_secs_f64(seconds.max(0.0))
}

// =============================================================================
// Configuration
// =============================================================================

/// Timings of one selector position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionTiming {
    /// Seconds from home to this position
    pub select: f64,
    /// Seconds from this position back to home
    #[serde(rename = "return")]
    pub return_: f64,
}

/// Simulated selector wheel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectorSimConfig {
    /// Position the wheel rests at
    pub home: String,
    /// Timings of every position, including home
    pub positions: BTreeMap<String, PositionTiming>,
}

/// Simulated tube carriage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TubeSimConfig {
    /// Distance the carriage parks at, in mm
    #[serde(default = "default_tube_home")]
    pub home_distance: u32,
    /// Travel speed
    #[serde(default = "default_tube_speed")]
    pub speed_mm_per_sec: f64,
}

fn default_tube_home() -> u32 {
    20
}

fn default_tube_speed() -> f64 {
    10.0
}

/// Simulated radiation counter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CounterSimConfig {
    /// Per-capture overhead in seconds on top of the counting duration
    #[serde(default = "default_counter_overhead")]
    pub overhead_secs: f64,
    /// Mean counts per second
    #[serde(default = "default_counter_cps")]
    pub counts_per_sec: f64,
}

fn default_counter_overhead() -> f64 {
    0.5
}

fn default_counter_cps() -> f64 {
    40.0
}

/// Simulated DC motor rig.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MotorSimConfig {
    /// Seconds for the speed to settle after a set point change
    #[serde(default = "default_motor_settle")]
    pub settle_secs: f64,
    /// Seconds per speed measurement
    #[serde(default = "default_motor_measure")]
    pub measure_secs: f64,
    /// Steady-state RPM per armature volt at 100% field
    #[serde(default = "default_rpm_per_volt")]
    pub rpm_per_volt: f64,
}

fn default_motor_settle() -> f64 {
    2.0
}

fn default_motor_measure() -> f64 {
    1.0
}

fn default_rpm_per_volt() -> f64 {
    120.0
}

/// Simulated power switching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerSimConfig {
    /// Seconds a power-up takes
    #[serde(default)]
    pub powerup_secs: f64,
    /// Seconds an initialise takes
    #[serde(default = "default_initialise_secs")]
    pub initialise_secs: f64,
    /// Seconds a power-down takes
    #[serde(default)]
    pub powerdown_secs: f64,
}

fn default_initialise_secs() -> f64 {
    3.0
}

/// `[simulation]` section of the configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Power switching
    #[serde(default)]
    pub power: PowerSimConfig,
    /// Source wheel
    #[serde(default = "default_sources")]
    pub sources: SelectorSimConfig,
    /// Absorber wheel
    #[serde(default = "default_absorbers")]
    pub absorbers: SelectorSimConfig,
    /// Tube carriage
    #[serde(default)]
    pub tube: TubeSimConfig,
    /// Radiation counter
    #[serde(default)]
    pub counter: CounterSimConfig,
    /// Motor rig
    #[serde(default)]
    pub motor: MotorSimConfig,
}

impl Default for PowerSimConfig {
    fn default() -> Self {
        Self {
            powerup_secs: 0.0,
            initialise_secs: default_initialise_secs(),
            powerdown_secs: 0.0,
        }
    }
}

impl Default for TubeSimConfig {
    fn default() -> Self {
        Self {
            home_distance: default_tube_home(),
            speed_mm_per_sec: default_tube_speed(),
        }
    }
}

impl Default for CounterSimConfig {
    fn default() -> Self {
        Self {
            overhead_secs: default_counter_overhead(),
            counts_per_sec: default_counter_cps(),
        }
    }
}

impl Default for MotorSimConfig {
    fn default() -> Self {
        Self {
            settle_secs: default_motor_settle(),
            measure_secs: default_motor_measure(),
            rpm_per_volt: default_rpm_per_volt(),
        }
    }
}

fn wheel(home: &str, positions: &[(&str, f64, f64)]) -> SelectorSimConfig {
    SelectorSimConfig {
        home: home.to_string(),
        positions: positions
            .iter()
            .map(|(name, select, return_)| {
                (
                    name.to_string(),
                    PositionTiming {
                        select: *select,
                        return_: *return_,
                    },
                )
            })
            .collect(),
    }
}

fn default_sources() -> SelectorSimConfig {
    wheel(
        "None",
        &[("None", 0.0, 0.0), ("Sr90", 4.2, 3.8), ("Co60", 6.1, 5.7)],
    )
}

fn default_absorbers() -> SelectorSimConfig {
    wheel(
        "None",
        &[
            ("None", 0.0, 0.0),
            ("Paper", 2.0, 1.8),
            ("Aluminium", 3.5, 3.1),
            ("Lead", 5.0, 4.6),
        ],
    )
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            power: PowerSimConfig::default(),
            sources: default_sources(),
            absorbers: default_absorbers(),
            tube: TubeSimConfig::default(),
            counter: CounterSimConfig::default(),
            motor: MotorSimConfig::default(),
        }
    }
}

impl SimulationConfig {
    /// Build a fully populated simulated rig sharing one fault plan.
    pub fn build_devices(&self, faults: &Faults) -> DeviceSet {
        DeviceSet::new(Arc::new(SimulatedPower::new(self.power.clone(), faults.clone())))
            .with_source_selector(Arc::new(SimulatedSelector::new(
                "source",
                self.sources.clone(),
                faults.clone(),
            )))
            .with_absorber_selector(Arc::new(SimulatedSelector::new(
                "absorber",
                self.absorbers.clone(),
                faults.clone(),
            )))
            .with_tube(Arc::new(SimulatedTube::new(self.tube.clone(), faults.clone())))
            .with_counter(Arc::new(SimulatedCounter::new(
                self.counter.clone(),
                faults.clone(),
            )))
            .with_motor(Arc::new(SimulatedMotor::new(self.motor.clone(), faults.clone())))
    }
}

// =============================================================================
// SimulatedPower
// =============================================================================

/// Power switching with configurable durations.
///
/// Operation names: `power.up`, `power.initialise`, `power.down`.
#[derive(Default)]
pub struct SimulatedPower {
    config: PowerSimConfig,
    faults: Faults,
}

impl SimulatedPower {
    /// Power switching with the given timings.
    pub fn new(config: PowerSimConfig, faults: Faults) -> Self {
        Self { config, faults }
    }
}

#[async_trait]
impl PowerControl for SimulatedPower {
    async fn power_up(&self) -> Result<()> {
        sleep(secs(self.config.powerup_secs)).await;
        self.faults.check("power.up")
    }

    async fn initialise(&self) -> Result<()> {
        sleep(secs(self.config.initialise_secs)).await;
        self.faults.check("power.initialise")
    }

    async fn power_down(&self) -> Result<()> {
        sleep(secs(self.config.powerdown_secs)).await;
        self.faults.check("power.down")
    }
}

// =============================================================================
// SimulatedSelector
// =============================================================================

/// Selector wheel that moves `current → home → target`.
///
/// Operation names: `<name>.select`, `<name>.return`.
pub struct SimulatedSelector {
    name: String,
    config: SelectorSimConfig,
    current: Mutex<String>,
    faults: Faults,
}

impl SimulatedSelector {
    /// Selector called `name` in operation names.
    pub fn new(name: impl Into<String>, config: SelectorSimConfig, faults: Faults) -> Self {
        let current = Mutex::new(config.home.clone());
        Self {
            name: name.into(),
            config,
            current,
            faults,
        }
    }

    fn current(&self) -> MutexGuard<'_, String> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Position the wheel is currently at.
    pub fn selected(&self) -> String {
        self.current().clone()
    }

    fn timing(&self, position: &str) -> Option<&PositionTiming> {
        self.config.positions.get(position)
    }
}

#[async_trait]
impl Selector for SimulatedSelector {
    fn home(&self) -> &str {
        &self.config.home
    }

    fn positions(&self) -> Vec<String> {
        self.config.positions.keys().cloned().collect()
    }

    fn select_time(&self, position: &str) -> Option<f64> {
        self.timing(position).map(|t| t.select)
    }

    fn return_time(&self, position: &str) -> Option<f64> {
        self.timing(position).map(|t| t.return_)
    }

    async fn select(&self, position: &str) -> Result<()> {
        self.faults.check(&format!("{}.select", self.name))?;
        let target = self
            .select_time(position)
            .ok_or_else(|| anyhow!("{} position '{}' does not exist", self.name, position))?;
        let from = self.selected();
        let back = self.return_time(&from).unwrap_or(0.0);
        let home = self.select_time(self.home()).unwrap_or(0.0);
        debug!(selector = %self.name, from = %from, to = %position, "Selecting");
        sleep(secs(back + target - home)).await;
        *self.current() = position.to_string();
        Ok(())
    }

    async fn return_home(&self) -> Result<()> {
        self.faults.check(&format!("{}.return", self.name))?;
        let from = self.selected();
        sleep(secs(self.return_time(&from).unwrap_or(0.0))).await;
        *self.current() = self.config.home.clone();
        Ok(())
    }
}

// =============================================================================
// SimulatedTube
// =============================================================================

/// Tube carriage moving at constant speed.
///
/// Operation names: `tube.move`.
pub struct SimulatedTube {
    config: TubeSimConfig,
    distance: Mutex<u32>,
    faults: Faults,
}

impl SimulatedTube {
    /// Tube carriage parked at its home distance.
    pub fn new(config: TubeSimConfig, faults: Faults) -> Self {
        let distance = Mutex::new(config.home_distance);
        Self {
            config,
            distance,
            faults,
        }
    }

    fn position(&self) -> MutexGuard<'_, u32> {
        self.distance.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for SimulatedTube {
    fn default() -> Self {
        Self::new(TubeSimConfig::default(), Faults::default())
    }
}

#[async_trait]
impl TubeMover for SimulatedTube {
    fn home_distance(&self) -> u32 {
        self.config.home_distance
    }

    fn move_time(&self, from_mm: u32, to_mm: u32) -> f64 {
        if self.config.speed_mm_per_sec <= 0.0 {
            return 0.0;
        }
        f64::from(from_mm.abs_diff(to_mm)) / self.config.speed_mm_per_sec
    }

    async fn distance(&self) -> Result<u32> {
        Ok(*self.position())
    }

    async fn move_to(&self, distance_mm: u32) -> Result<()> {
        self.faults.check("tube.move")?;
        let from = *self.position();
        trace!(from, to = distance_mm, "Moving tube");
        sleep(secs(self.move_time(from, distance_mm))).await;
        *self.position() = distance_mm;
        Ok(())
    }
}

// =============================================================================
// SimulatedCounter
// =============================================================================

/// Counter producing Poisson-ish counts around a configured mean rate.
///
/// Operation names: `counter.configure`, `counter.capture`, `counter.stop`.
#[derive(Default)]
pub struct SimulatedCounter {
    config: CounterSimConfig,
    faults: Faults,
}

impl SimulatedCounter {
    /// Counter with the given rate and overhead.
    pub fn new(config: CounterSimConfig, faults: Faults) -> Self {
        Self { config, faults }
    }
}

#[async_trait]
impl RadiationCounter for SimulatedCounter {
    fn capture_time(&self, duration_secs: u32) -> f64 {
        f64::from(duration_secs) + self.config.overhead_secs
    }

    async fn configure(&self, _duration_secs: u32) -> Result<()> {
        self.faults.check("counter.configure")
    }

    async fn capture(&self, duration_secs: u32) -> Result<u32> {
        self.faults.check("counter.capture")?;
        sleep(secs(self.capture_time(duration_secs))).await;
        let mean = self.config.counts_per_sec * f64::from(duration_secs);
        let spread = mean.sqrt();
        let noise = if spread > 0.0 {
            rand::thread_rng().gen_range(-spread..=spread)
        } else {
            0.0
        };
        Ok((mean + noise).round().max(0.0) as u32)
    }

    async fn stop(&self) -> Result<()> {
        self.faults.check("counter.stop")
    }
}

// =============================================================================
// SimulatedMotor
// =============================================================================

#[derive(Default)]
struct MotorState {
    armature_volts: f64,
    field_percent: f64,
}

/// Motor whose speed is proportional to armature voltage and field current.
///
/// Operation names: `motor.armature`, `motor.field`, `motor.measure`,
/// `motor.stop`.
#[derive(Default)]
pub struct SimulatedMotor {
    config: MotorSimConfig,
    state: Mutex<MotorState>,
    faults: Faults,
}

impl SimulatedMotor {
    /// Motor rig at rest.
    pub fn new(config: MotorSimConfig, faults: Faults) -> Self {
        Self {
            config,
            state: Mutex::new(MotorState::default()),
            faults,
        }
    }

    fn state(&self) -> MutexGuard<'_, MotorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl MotorRig for SimulatedMotor {
    fn settle_time(&self) -> f64 {
        self.config.settle_secs
    }

    fn measure_time(&self) -> f64 {
        self.config.measure_secs
    }

    async fn set_armature_voltage(&self, volts: f64) -> Result<()> {
        self.faults.check("motor.armature")?;
        self.state().armature_volts = volts;
        Ok(())
    }

    async fn set_field_current(&self, percent: f64) -> Result<()> {
        self.faults.check("motor.field")?;
        self.state().field_percent = percent;
        Ok(())
    }

    async fn measure_speed(&self) -> Result<f64> {
        self.faults.check("motor.measure")?;
        sleep(secs(self.config.measure_secs)).await;
        let (volts, field) = {
            let state = self.state();
            (state.armature_volts, state.field_percent)
        };
        if field <= 0.0 {
            return Ok(0.0);
        }
        // Speed rises as field weakens: n ∝ V / Φ
        let ideal = self.config.rpm_per_volt * volts * (100.0 / field);
        let jitter = rand::thread_rng().gen_range(-0.5..=0.5);
        Ok((ideal + jitter).max(0.0))
    }

    async fn stop_motor(&self) -> Result<()> {
        self.faults.check("motor.stop")?;
        *self.state() = MotorState::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_selector_routes_through_home() {
        let selector = SimulatedSelector::new("absorber", default_absorbers(), Faults::new());
        let started = tokio::time::Instant::now();

        selector.select("Paper").await.unwrap();
        selector.select("Lead").await.unwrap();

        // 2.0 to Paper, then 1.8 back + 5.0 out to Lead
        let elapsed = started.elapsed().as_secs_f64();
        assert!((elapsed - 8.8).abs() < 0.01, "elapsed {elapsed}");
        assert_eq!(selector.selected(), "Lead");
    }

    #[tokio::test]
    async fn test_selector_rejects_unknown_position() {
        let selector = SimulatedSelector::new("source", default_sources(), Faults::new());
        let err = selector.select("Am241").await.unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[tokio::test]
    async fn test_faults_fail_and_record() {
        let faults = Faults::new();
        faults.fail_on("counter.stop", "Counter not responding");
        let counter = SimulatedCounter::new(CounterSimConfig::default(), faults.clone());

        let err = counter.stop().await.unwrap_err();
        assert_eq!(err.to_string(), "Counter not responding");
        assert_eq!(faults.call_count("counter.stop"), 1);

        faults.clear("counter.stop");
        assert!(counter.stop().await.is_ok());
        assert_eq!(faults.calls(), vec!["counter.stop", "counter.stop"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tube_move_time_scales_with_distance() {
        let tube = SimulatedTube::default();
        assert_eq!(tube.move_time(20, 60), 4.0);
        tube.move_to(60).await.unwrap();
        assert_eq!(tube.distance().await.unwrap(), 60);
    }

    #[tokio::test(start_paused = true)]
    async fn test_motor_speed_follows_set_points() {
        let motor = SimulatedMotor::new(MotorSimConfig::default(), Faults::new());
        motor.set_field_current(100.0).await.unwrap();
        motor.set_armature_voltage(10.0).await.unwrap();
        let speed = motor.measure_speed().await.unwrap();
        assert!((speed - 1200.0).abs() <= 0.5);

        motor.stop_motor().await.unwrap();
        assert_eq!(motor.measure_speed().await.unwrap(), 0.0);
    }
}
