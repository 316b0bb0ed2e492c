//! Radioactivity experiments: counts against time, distance or absorber.
//!
//! One driver serves three setups, which differ only in what the Running phase
//! sweeps:
//!
//! | Setup id                   | Swept       | Fixed                  |
//! |----------------------------|-------------|------------------------|
//! | `RadioactivityVsTime`      | nothing     | one absorber, distance |
//! | `RadioactivityVsDistance`  | distances   | one absorber           |
//! | `RadioactivityVsAbsorber`  | absorbers   | one distance           |
//!
//! At every point the counter captures `repeat` times for `duration` seconds.
//!
//! ## Phases
//!
//! - Initialising: configure the counter, park the tube at the first distance
//! - Starting: select the source
//! - Running: for each point select the absorber and move the tube (only when
//!   they change), then capture
//! - Stopping: return absorber, return source, send tube home, stop counter
//! - Finalising: confirm the tube is parked at home

use super::timing::{capture_time, sweep_time, tube_sweep_time, whole_seconds, ExecutionTimes};
use super::validation::SpecValidator;
use super::{ExperimentPhases, PhaseContext, PhaseResult, Teardown};
use crate::device::{DeviceKind, DeviceSet, RadiationCounter, Selector, TubeMover};
use crate::error::{AppResult, LabError};
use crate::specification::Specification;
use anyhow::anyhow;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

/// Counts against time at one absorber and distance.
pub const SETUP_VS_TIME: &str = "RadioactivityVsTime";
/// Counts against tube distance.
pub const SETUP_VS_DISTANCE: &str = "RadioactivityVsDistance";
/// Counts against absorber.
pub const SETUP_VS_ABSORBER: &str = "RadioactivityVsAbsorber";

const REQUIRED: &[DeviceKind] = &[
    DeviceKind::SourceSelector,
    DeviceKind::AbsorberSelector,
    DeviceKind::Tube,
    DeviceKind::Counter,
];

/// Which parameter the Running phase sweeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sweep {
    /// Repeated captures at a single point
    Time,
    /// One point per tube distance
    Distance,
    /// One point per absorber
    Absorber,
}

impl Sweep {
    /// Sweep for a radioactivity setup id.
    pub fn for_setup(setup_id: &str) -> Option<Self> {
        match setup_id {
            SETUP_VS_TIME => Some(Sweep::Time),
            SETUP_VS_DISTANCE => Some(Sweep::Distance),
            SETUP_VS_ABSORBER => Some(Sweep::Absorber),
            _ => None,
        }
    }
}

/// Driver configuration from `[setups.<id>.config]`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RadioactivityConfig {
    /// Overrides for the default parameter ranges
    #[serde(default)]
    pub limits: SpecValidator,
}

fn default_limits() -> SpecValidator {
    SpecValidator::new()
        .with_range("distance", 20.0, 120.0)
        .with_range("duration", 1.0, 60.0)
        .with_range("repeat", 1.0, 20.0)
        .with_max_list_len(10)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RadioactivitySpec {
    source_name: String,
    #[serde(default)]
    absorbers: Vec<String>,
    #[serde(default)]
    distances: Vec<u32>,
    duration: u32,
    repeat: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct Point {
    absorber: String,
    distance: u32,
    counts: Vec<u32>,
}

#[derive(Debug, Clone)]
struct Plan {
    source: String,
    duration: u32,
    repeat: u32,
    points: Vec<Point>,
}

/// Phase hooks for the three radioactivity setups.
pub struct RadioactivityExperiment {
    sweep: Sweep,
    devices: DeviceSet,
    limits: SpecValidator,
    plan: Option<Plan>,
}

impl RadioactivityExperiment {
    /// Build the experiment for `setup_id`, which must be a radioactivity setup.
    pub fn new(setup_id: &str, devices: DeviceSet, config: RadioactivityConfig) -> AppResult<Self> {
        let sweep = Sweep::for_setup(setup_id).ok_or_else(|| {
            LabError::Configuration(format!(
                "Setup id '{}' is not a radioactivity setup",
                setup_id
            ))
        })?;
        Ok(Self {
            sweep,
            devices,
            limits: config.limits.merged_with(&default_limits()),
            plan: None,
        })
    }

    fn sources(&self) -> anyhow::Result<&dyn Selector> {
        self.devices
            .source_selector
            .as_deref()
            .ok_or_else(|| anyhow!("Source selector not present"))
    }

    fn absorbers(&self) -> anyhow::Result<&dyn Selector> {
        self.devices
            .absorber_selector
            .as_deref()
            .ok_or_else(|| anyhow!("Absorber selector not present"))
    }

    fn tube(&self) -> anyhow::Result<&dyn TubeMover> {
        self.devices
            .tube
            .as_deref()
            .ok_or_else(|| anyhow!("Tube not present"))
    }

    fn counter(&self) -> anyhow::Result<&dyn RadiationCounter> {
        self.devices
            .counter
            .as_deref()
            .ok_or_else(|| anyhow!("Counter not present"))
    }

    fn plan(&self) -> anyhow::Result<&Plan> {
        self.plan
            .as_ref()
            .ok_or_else(|| anyhow!("No validated specification"))
    }

    /// Expand the specification into the ordered list of capture points.
    fn build_plan(&self, spec: RadioactivitySpec) -> Result<Plan, String> {
        let sources = self.sources().map_err(|e| e.to_string())?;
        let absorbers = self.absorbers().map_err(|e| e.to_string())?;
        let tube = self.tube().map_err(|e| e.to_string())?;

        if sources.select_time(&spec.source_name).is_none() {
            return Err(format!("Source '{}' is not available", spec.source_name));
        }
        for absorber in &spec.absorbers {
            if absorbers.select_time(absorber).is_none() {
                return Err(format!("Absorber '{}' is not available", absorber));
            }
        }

        self.limits.check("duration", spec.duration)?;
        self.limits.check("repeat", spec.repeat)?;

        let absorber_list = if spec.absorbers.is_empty() {
            vec![absorbers.home().to_string()]
        } else {
            spec.absorbers.clone()
        };
        let distance_list = if spec.distances.is_empty() {
            vec![tube.home_distance()]
        } else {
            spec.distances.clone()
        };

        match self.sweep {
            Sweep::Time | Sweep::Distance if absorber_list.len() > 1 => {
                return Err("Only one absorber may be specified".to_string());
            }
            Sweep::Time | Sweep::Absorber if distance_list.len() > 1 => {
                return Err("Only one distance may be specified".to_string());
            }
            _ => {}
        }
        self.limits.check_list("distance", &distance_list)?;
        self.limits.check_len("absorber", absorber_list.len())?;

        let points = match self.sweep {
            Sweep::Time => vec![(absorber_list[0].clone(), distance_list[0])],
            Sweep::Distance => distance_list
                .iter()
                .map(|d| (absorber_list[0].clone(), *d))
                .collect(),
            Sweep::Absorber => absorber_list
                .iter()
                .map(|a| (a.clone(), distance_list[0]))
                .collect(),
        };

        Ok(Plan {
            source: spec.source_name,
            duration: spec.duration,
            repeat: spec.repeat,
            points: points
                .into_iter()
                .map(|(absorber, distance)| Point {
                    absorber,
                    distance,
                    counts: Vec::new(),
                })
                .collect(),
        })
    }

    fn estimate(&self, plan: &Plan) -> Result<ExecutionTimes, String> {
        let sources = self.sources().map_err(|e| e.to_string())?;
        let absorbers = self.absorbers().map_err(|e| e.to_string())?;
        let tube = self.tube().map_err(|e| e.to_string())?;
        let counter = self.counter().map_err(|e| e.to_string())?;

        let first_distance = plan.points.first().map_or(tube.home_distance(), |p| p.distance);
        let last_distance = plan.points.last().map_or(tube.home_distance(), |p| p.distance);

        // Consecutive repeats of the same absorber are not reselected.
        let mut absorber_moves: Vec<&str> = Vec::new();
        for point in &plan.points {
            if absorber_moves.last() != Some(&point.absorber.as_str()) {
                absorber_moves.push(&point.absorber);
            }
        }
        let last_absorber = absorber_moves.last().copied().unwrap_or(absorbers.home());
        let distances: Vec<u32> = plan.points.iter().map(|p| p.distance).collect();

        let initialise = tube.move_time(tube.home_distance(), first_distance);
        let start = sweep_time(
            sources.home(),
            &[plan.source.as_str()],
            |p| sources.select_time(p).unwrap_or(0.0),
            |p| sources.return_time(p).unwrap_or(0.0),
        );
        let run = sweep_time(
            absorbers.home(),
            &absorber_moves,
            |p| absorbers.select_time(p).unwrap_or(0.0),
            |p| absorbers.return_time(p).unwrap_or(0.0),
        ) + tube_sweep_time(first_distance, &distances, |a, b| tube.move_time(a, b))
            + capture_time(counter.capture_time(plan.duration), plan.repeat)
                * plan.points.len() as f64;
        let stop = absorbers.return_time(last_absorber).unwrap_or(0.0)
            + sources.return_time(&plan.source).unwrap_or(0.0)
            + tube.move_time(last_distance, tube.home_distance());

        Ok(ExecutionTimes {
            initialise: whole_seconds(initialise),
            start: whole_seconds(start),
            run: whole_seconds(run),
            stop: whole_seconds(stop),
            finalise: 0,
        })
    }
}

#[async_trait]
impl ExperimentPhases for RadioactivityExperiment {
    fn name(&self) -> &'static str {
        "Radioactivity"
    }

    fn required_devices(&self) -> &'static [DeviceKind] {
        REQUIRED
    }

    fn configure(&mut self, spec: &Specification) -> Result<ExecutionTimes, String> {
        let params: RadioactivitySpec = spec.parse_params()?;
        let plan = self.build_plan(params)?;
        let times = self.estimate(&plan)?;
        self.plan = Some(plan);
        Ok(times)
    }

    async fn initialise(&mut self, _ctx: &PhaseContext) -> PhaseResult {
        let plan = self.plan()?;
        self.counter()?.configure(plan.duration).await?;
        if let Some(first) = plan.points.first() {
            self.tube()?.move_to(first.distance).await?;
        }
        Ok(())
    }

    async fn start(&mut self, _ctx: &PhaseContext) -> PhaseResult {
        let source = self.plan()?.source.clone();
        info!(source = %source, "Selecting source");
        self.sources()?.select(&source).await?;
        Ok(())
    }

    async fn run(&mut self, ctx: &PhaseContext) -> PhaseResult {
        let mut plan = self.plan.take().ok_or_else(|| anyhow!("No validated specification"))?;
        let outcome = self.capture_points(&mut plan, ctx).await;
        self.plan = Some(plan);
        outcome
    }

    async fn stop(&mut self, teardown: &mut Teardown) {
        teardown
            .step("return absorber", async { self.absorbers()?.return_home().await })
            .await;
        teardown
            .step("return source", async { self.sources()?.return_home().await })
            .await;
        teardown
            .step("tube home", async {
                let tube = self.tube()?;
                tube.move_to(tube.home_distance()).await
            })
            .await;
        teardown
            .step("stop counter", async { self.counter()?.stop().await })
            .await;
    }

    async fn finalise(&mut self, teardown: &mut Teardown) {
        let parked = async {
            let tube = self.tube()?;
            let distance = tube.distance().await?;
            if distance != tube.home_distance() {
                return Err(anyhow!(
                    "Tube at {} mm, expected home at {} mm",
                    distance,
                    tube.home_distance()
                ));
            }
            Ok::<(), anyhow::Error>(())
        };
        teardown.step("confirm tube home", parked).await;
    }

    fn results(&self) -> serde_json::Value {
        match &self.plan {
            Some(plan) => json!({
                "sourceName": plan.source,
                "duration": plan.duration,
                "repeat": plan.repeat,
                "points": plan.points,
            }),
            None => serde_json::Value::Null,
        }
    }
}

impl RadioactivityExperiment {
    async fn capture_points(&self, plan: &mut Plan, ctx: &PhaseContext) -> PhaseResult {
        let absorbers = self.absorbers()?;
        let tube = self.tube()?;
        let counter = self.counter()?;
        let mut selected = absorbers.home().to_string();
        let mut distance = plan.points.first().map_or(tube.home_distance(), |p| p.distance);

        for point in plan.points.iter_mut() {
            ctx.checkpoint()?;
            if point.absorber != selected {
                absorbers.select(&point.absorber).await?;
                selected = point.absorber.clone();
            }
            if point.distance != distance {
                tube.move_to(point.distance).await?;
                distance = point.distance;
            }
            point.counts.clear();
            for _ in 0..plan.repeat {
                ctx.checkpoint()?;
                let counts = counter.capture(plan.duration).await?;
                point.counts.push(counts);
            }
            debug!(
                absorber = %point.absorber,
                distance = point.distance,
                counts = ?point.counts,
                "Point captured"
            );
        }
        Ok(())
    }
}
