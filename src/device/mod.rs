//! Hardware capability traits consumed by the engine and the experiment drivers.
//!
//! Devices implement the small capability traits they actually support:
//!
//! - [`PowerControl`]: whole-rig power up, initialise and power down (engine only)
//! - [`Selector`]: a wheel of named positions (radioactive sources, absorbers)
//! - [`TubeMover`]: the Geiger tube carriage, positioned by distance
//! - [`RadiationCounter`]: timed count capture
//! - [`MotorRig`]: DC motor test rig set points and speed measurement
//!
//! Each capability trait is async, `Send + Sync`, and reports failure through
//! `anyhow::Result`. The error's display text is the device's "last error":
//! drivers copy it verbatim into the run status, and best-effort teardown keeps
//! the first one it sees.
//!
//! Besides the operations themselves, devices report timing primitives
//! (`select_time`, `return_time`, `move_time`, `capture_time`) that drivers
//! compose into execution-time estimates.

pub mod simulated;

use crate::error::{AppResult, LabError};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Whole-equipment power control driven by the engine worker.
#[async_trait]
pub trait PowerControl: Send + Sync {
    /// Switch the equipment on.
    async fn power_up(&self) -> Result<()>;

    /// Bring every device to a known state after power up.
    async fn initialise(&self) -> Result<()>;

    /// Switch the equipment off. Called best-effort; errors are only logged.
    async fn power_down(&self) -> Result<()>;
}

/// A wheel or carousel of named positions that always returns through home.
#[async_trait]
pub trait Selector: Send + Sync {
    /// Name of the reference position the wheel rests at.
    fn home(&self) -> &str;

    /// Names of every selectable position, home included.
    fn positions(&self) -> Vec<String>;

    /// Seconds to move from home to `position`.
    fn select_time(&self, position: &str) -> Option<f64>;

    /// Seconds to move from `position` back to home.
    fn return_time(&self, position: &str) -> Option<f64>;

    /// Move to `position`, routing through home.
    async fn select(&self, position: &str) -> Result<()>;

    /// Return whatever is selected to home.
    async fn return_home(&self) -> Result<()>;
}

/// Geiger tube carriage positioned by distance from the source.
#[async_trait]
pub trait TubeMover: Send + Sync {
    /// Distance in millimetres the tube parks at.
    fn home_distance(&self) -> u32;

    /// Seconds to travel between two distances.
    fn move_time(&self, from_mm: u32, to_mm: u32) -> f64;

    /// Current distance in millimetres.
    async fn distance(&self) -> Result<u32>;

    /// Move to an absolute distance in millimetres.
    async fn move_to(&self, distance_mm: u32) -> Result<()>;
}

/// Radiation counter capturing counts over a fixed duration.
#[async_trait]
pub trait RadiationCounter: Send + Sync {
    /// Wall-clock seconds one capture of `duration_secs` takes, overhead included.
    fn capture_time(&self, duration_secs: u32) -> f64;

    /// Prepare the counter for a sequence of captures.
    async fn configure(&self, duration_secs: u32) -> Result<()>;

    /// Capture counts for `duration_secs`.
    async fn capture(&self, duration_secs: u32) -> Result<u32>;

    /// Stop counting and leave the counter idle.
    async fn stop(&self) -> Result<()>;
}

/// DC motor test rig.
#[async_trait]
pub trait MotorRig: Send + Sync {
    /// Seconds for the motor to settle after a set point change.
    fn settle_time(&self) -> f64;

    /// Seconds one speed measurement takes.
    fn measure_time(&self) -> f64;

    /// Armature voltage set point in volts.
    async fn set_armature_voltage(&self, volts: f64) -> Result<()>;

    /// Field current set point as a percentage of maximum.
    async fn set_field_current(&self, percent: f64) -> Result<()>;

    /// Measured shaft speed in RPM.
    async fn measure_speed(&self) -> Result<f64>;

    /// Remove drive from the motor.
    async fn stop_motor(&self) -> Result<()>;
}

/// Identifies a device slot in a [`DeviceSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    /// Source selector wheel
    SourceSelector,
    /// Absorber selector wheel
    AbsorberSelector,
    /// Geiger tube carriage
    Tube,
    /// Radiation counter
    Counter,
    /// DC motor rig
    Motor,
}

impl DeviceKind {
    /// Name used in error messages and configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::SourceSelector => "source_selector",
            DeviceKind::AbsorberSelector => "absorber_selector",
            DeviceKind::Tube => "tube",
            DeviceKind::Counter => "counter",
            DeviceKind::Motor => "motor",
        }
    }
}

/// The equipment handed to the engine: power control plus whichever devices
/// this rig actually has.
#[derive(Clone)]
pub struct DeviceSet {
    /// Equipment power switching, always present
    pub power: Arc<dyn PowerControl>,
    /// Radioactive source wheel
    pub source_selector: Option<Arc<dyn Selector>>,
    /// Absorber wheel
    pub absorber_selector: Option<Arc<dyn Selector>>,
    /// Tube carriage
    pub tube: Option<Arc<dyn TubeMover>>,
    /// Radiation counter
    pub counter: Option<Arc<dyn RadiationCounter>>,
    /// Motor rig
    pub motor: Option<Arc<dyn MotorRig>>,
}

impl DeviceSet {
    /// A set with power control only.
    pub fn new(power: Arc<dyn PowerControl>) -> Self {
        Self {
            power,
            source_selector: None,
            absorber_selector: None,
            tube: None,
            counter: None,
            motor: None,
        }
    }

    /// Attach a source selector.
    pub fn with_source_selector(mut self, selector: Arc<dyn Selector>) -> Self {
        self.source_selector = Some(selector);
        self
    }

    /// Attach an absorber selector.
    pub fn with_absorber_selector(mut self, selector: Arc<dyn Selector>) -> Self {
        self.absorber_selector = Some(selector);
        self
    }

    /// Attach a tube carriage.
    pub fn with_tube(mut self, tube: Arc<dyn TubeMover>) -> Self {
        self.tube = Some(tube);
        self
    }

    /// Attach a radiation counter.
    pub fn with_counter(mut self, counter: Arc<dyn RadiationCounter>) -> Self {
        self.counter = Some(counter);
        self
    }

    /// Attach a motor rig.
    pub fn with_motor(mut self, motor: Arc<dyn MotorRig>) -> Self {
        self.motor = Some(motor);
        self
    }

    /// Whether the slot for `kind` is populated.
    pub fn has(&self, kind: DeviceKind) -> bool {
        match kind {
            DeviceKind::SourceSelector => self.source_selector.is_some(),
            DeviceKind::AbsorberSelector => self.absorber_selector.is_some(),
            DeviceKind::Tube => self.tube.is_some(),
            DeviceKind::Counter => self.counter.is_some(),
            DeviceKind::Motor => self.motor.is_some(),
        }
    }

    /// Fail with `MissingDevice` for the first absent device in `required`.
    pub fn require(&self, required: &[DeviceKind]) -> AppResult<()> {
        match required.iter().find(|kind| !self.has(**kind)) {
            Some(kind) => Err(LabError::MissingDevice(kind.as_str().to_string())),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for DeviceSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSet")
            .field("source_selector", &self.source_selector.is_some())
            .field("absorber_selector", &self.absorber_selector.is_some())
            .field("tube", &self.tube.is_some())
            .field("counter", &self.counter.is_some())
            .field("motor", &self.motor.is_some())
            .finish()
    }
}
