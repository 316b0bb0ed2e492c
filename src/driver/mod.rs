//! Experiment driver contract and the generic five-phase sequencer.
//!
//! Every experiment type implements [`ExperimentPhases`]: a small set of hooks,
//! one per phase, plus specification handling. [`PhasedDriver`] wraps those
//! hooks and provides everything the engine needs through the object-safe
//! [`ExperimentDriver`] trait: validation, execution, cooperative cancellation,
//! execution-id bookkeeping, status snapshots and results.
//!
//! # Phase discipline
//!
//! ```text
//! Initialising ─► Starting ─► Running ─┬─► Stopping ─► Finalising ─► Completed
//!        │            │          │      │
//!        └────────────┴──────────┴──────┘  failure or cancellation skips ahead
//! ```
//!
//! - Initialising, Starting and Running stop at the first failure, or as soon as
//!   the cancellation flag is seen at a checkpoint. Cancellation is never
//!   preemptive: hooks call [`PhaseContext::checkpoint`] once per loop
//!   iteration.
//! - Stopping and Finalising always run, and every step inside them is attempted
//!   through a [`Teardown`], which keeps only the first error. Their job is to
//!   return the hardware to a safe state whatever happened upstream.

pub mod motor;
pub mod radioactivity;
pub mod registry;
pub mod timing;
pub mod validation;

pub use registry::{DriverContext, DriverFactory, DriverRegistry};
pub use timing::ExecutionTimes;
pub use validation::SpecValidator;

use crate::device::{DeviceKind, DeviceSet};
use crate::error::{AppResult, LabError};
use crate::specification::Specification;
use crate::status::{ExecuteStatus, ExecutionStatus, ResultStatus, Validation, NO_EXECUTION_ID};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

// =============================================================================
// Phase outcomes and cancellation
// =============================================================================

/// Why an upstream phase stopped early.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseError {
    /// The cancellation flag was seen at a checkpoint
    Cancelled,
    /// A hardware call failed; carries the device's error text
    Failed(String),
}

impl From<anyhow::Error> for PhaseError {
    fn from(err: anyhow::Error) -> Self {
        PhaseError::Failed(err.to_string())
    }
}

/// Result of an upstream phase hook.
pub type PhaseResult = Result<(), PhaseError>;

/// Shared cooperative cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// A token that has not been cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag. Cannot be undone.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether the flag has been raised.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// What a phase hook sees of the run it belongs to.
#[derive(Debug, Clone)]
pub struct PhaseContext {
    cancel: CancelToken,
}

impl PhaseContext {
    /// Context observing `cancel`.
    pub fn new(cancel: CancelToken) -> Self {
        Self { cancel }
    }

    /// Cancellation point; call once per loop iteration.
    pub fn checkpoint(&self) -> PhaseResult {
        if self.cancel.is_cancelled() {
            Err(PhaseError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Whether the run has been asked to stop.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Best-effort step runner for Stopping and Finalising.
///
/// Every step is attempted; only the first failure's text is kept.
#[derive(Debug, Default)]
pub struct Teardown {
    first_error: Option<String>,
    attempted: usize,
    failed: usize,
}

impl Teardown {
    /// A teardown with nothing recorded.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run one step, recording its failure and carrying on.
    pub async fn step<T, F>(&mut self, name: &str, step: F) -> Option<T>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        let result = step.await;
        self.record(name, result)
    }

    /// Record the outcome of a step that already ran.
    pub fn record<T>(&mut self, name: &str, result: anyhow::Result<T>) -> Option<T> {
        self.attempted += 1;
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(step = name, error = %e, "Teardown step failed, continuing");
                self.failed += 1;
                if self.first_error.is_none() {
                    self.first_error = Some(e.to_string());
                }
                None
            }
        }
    }

    /// Text of the first failed step, if any.
    pub fn first_error(&self) -> Option<&str> {
        self.first_error.as_deref()
    }

    /// Steps attempted so far.
    pub fn attempted(&self) -> usize {
        self.attempted
    }

    /// Steps that failed.
    pub fn failed(&self) -> usize {
        self.failed
    }
}

// =============================================================================
// Driver contract
// =============================================================================

/// Per-experiment hooks sequenced by [`PhasedDriver`].
#[async_trait]
pub trait ExperimentPhases: Send + Sync + 'static {
    /// Human-readable experiment name.
    fn name(&self) -> &'static str;

    /// Devices that must be present for this experiment to run at all.
    fn required_devices(&self) -> &'static [DeviceKind];

    /// Parse and range-check `spec`, keep it for execution, and estimate each
    /// phase. An `Err` is the rejection message.
    fn configure(&mut self, spec: &Specification) -> Result<ExecutionTimes, String>;

    /// Prepare the equipment for the run.
    async fn initialise(&mut self, _ctx: &PhaseContext) -> PhaseResult {
        Ok(())
    }

    /// Bring the equipment to its starting point.
    async fn start(&mut self, ctx: &PhaseContext) -> PhaseResult;

    /// Perform the measurements.
    async fn run(&mut self, ctx: &PhaseContext) -> PhaseResult;

    /// Return the equipment to a safe state.
    async fn stop(&mut self, teardown: &mut Teardown);

    /// Confirm the equipment is parked.
    async fn finalise(&mut self, _teardown: &mut Teardown) {}

    /// Data collected by the last run.
    fn results(&self) -> serde_json::Value;
}

/// What the engine holds for an accepted (or candidate) run.
#[async_trait]
pub trait ExperimentDriver: Send + Sync {
    /// Human-readable experiment name.
    fn name(&self) -> &str;

    /// Setup id this driver instance was created for.
    fn setup_id(&self) -> &str;

    /// Validate a specification for this setup.
    ///
    /// Configuration problems (missing device, wrong setup) are `Err`;
    /// out-of-range parameters are an unaccepted [`Validation`].
    async fn validate(&self, spec: &Specification) -> AppResult<Validation>;

    /// Run all five phases to completion on the calling task.
    async fn execute(&self);

    /// Raise the cancellation flag. Returns `false` if the run already ended.
    fn cancel(&self) -> bool;

    /// Whether cancellation has been requested.
    fn is_cancelled(&self) -> bool;

    /// Id of the run this driver holds, 0 before one is assigned.
    fn execution_id(&self) -> i32;

    /// Assign the execution id minted by the engine.
    fn set_execution_id(&self, id: i32);

    /// Mark the run accepted and waiting for the equipment.
    fn mark_waiting(&self);

    /// Complete a run that never started, as failed with `message`.
    fn abort(&self, message: &str);

    /// Fresh snapshot of the run.
    fn execution_status(&self) -> ExecutionStatus;

    /// Results document of a successfully completed run.
    async fn experiment_results(&self) -> Option<String>;
}

// =============================================================================
// Generic sequencer
// =============================================================================

#[derive(Debug, Clone, Default)]
struct RunState {
    execute_status: ExecuteStatus,
    result_status: ResultStatus,
    error_message: Option<String>,
    estimate: ExecutionTimes,
    started_at: Option<Instant>,
}

impl RunState {
    fn time_remaining(&self) -> u32 {
        let total = self.estimate.total();
        match (self.execute_status, self.started_at) {
            (ExecuteStatus::Completed, _) => 0,
            (status, Some(started)) if status.is_executing() => {
                let elapsed = u32::try_from(started.elapsed().as_secs()).unwrap_or(u32::MAX);
                total.saturating_sub(elapsed).max(1)
            }
            _ => total,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ResultDocument {
    run_uid: String,
    setup_id: String,
    execution_id: i32,
    timestamp: DateTime<Utc>,
    data: serde_json::Value,
}

/// [`ExperimentDriver`] built from a set of [`ExperimentPhases`] hooks.
pub struct PhasedDriver<P> {
    setup_id: String,
    devices: DeviceSet,
    name: &'static str,
    phases: Mutex<P>,
    run: watch::Sender<RunState>,
    cancel_token: CancelToken,
    execution_id: AtomicI32,
}

impl<P: ExperimentPhases> PhasedDriver<P> {
    /// Sequencer for `phases` running on `devices`.
    pub fn new(setup_id: impl Into<String>, devices: DeviceSet, phases: P) -> Self {
        let (run, _rx) = watch::channel(RunState::default());
        Self {
            setup_id: setup_id.into(),
            devices,
            name: phases.name(),
            phases: Mutex::new(phases),
            run,
            cancel_token: CancelToken::new(),
            execution_id: AtomicI32::new(NO_EXECUTION_ID),
        }
    }

    /// Boxed for a [`DriverRegistry`] constructor.
    pub fn boxed(setup_id: impl Into<String>, devices: DeviceSet, phases: P) -> Box<dyn ExperimentDriver> {
        Box::new(Self::new(setup_id, devices, phases))
    }

    fn enter(&self, status: ExecuteStatus) {
        debug!(setup = %self.setup_id, phase = %status, "Entering phase");
        self.run.send_modify(|run| run.execute_status = status);
    }

    fn complete(&self, result: ResultStatus, error_message: Option<String>) {
        info!(
            setup = %self.setup_id,
            execution_id = self.execution_id(),
            result = %result,
            error = error_message.as_deref().unwrap_or(""),
            "Execution completed"
        );
        self.run.send_modify(|run| {
            run.execute_status = ExecuteStatus::Completed;
            run.result_status = result;
            run.error_message = error_message;
        });
    }

    async fn run_upstream(&self, phases: &mut P, ctx: &PhaseContext) -> PhaseResult {
        ctx.checkpoint()?;
        self.enter(ExecuteStatus::Initialising);
        phases.initialise(ctx).await?;

        ctx.checkpoint()?;
        self.enter(ExecuteStatus::Starting);
        phases.start(ctx).await?;

        ctx.checkpoint()?;
        self.enter(ExecuteStatus::Running);
        phases.run(ctx).await
    }
}

#[async_trait]
impl<P: ExperimentPhases> ExperimentDriver for PhasedDriver<P> {
    fn name(&self) -> &str {
        self.name
    }

    fn setup_id(&self) -> &str {
        &self.setup_id
    }

    async fn validate(&self, spec: &Specification) -> AppResult<Validation> {
        let mut phases = self.phases.lock().await;

        self.devices.require(phases.required_devices())?;

        if spec.params.is_empty() {
            return Ok(Validation::rejected("Specification has no parameters"));
        }

        if spec.setup_id != self.setup_id {
            return Err(LabError::Configuration(format!(
                "Setup id '{}' does not match {} setup '{}'",
                spec.setup_id,
                phases.name(),
                self.setup_id
            )));
        }

        match phases.configure(spec) {
            Ok(estimate) => {
                self.run.send_modify(|run| run.estimate = estimate);
                debug!(setup = %self.setup_id, ?estimate, "Specification accepted");
                Ok(Validation::accepted(estimate.total()))
            }
            Err(message) => {
                debug!(setup = %self.setup_id, %message, "Specification rejected");
                Ok(Validation::rejected(message))
            }
        }
    }

    async fn execute(&self) {
        let current = self.run.borrow().execute_status;
        if !matches!(current, ExecuteStatus::Created | ExecuteStatus::Waiting) {
            warn!(setup = %self.setup_id, status = %current, "Execute called on a run that is not pending");
            return;
        }

        let mut phases = self.phases.lock().await;
        let ctx = PhaseContext::new(self.cancel_token.clone());
        info!(
            setup = %self.setup_id,
            experiment = phases.name(),
            execution_id = self.execution_id(),
            "Execution started"
        );
        self.run.send_modify(|run| run.started_at = Some(Instant::now()));

        let upstream = self.run_upstream(&mut phases, &ctx).await;

        let mut teardown = Teardown::new();
        self.enter(ExecuteStatus::Stopping);
        phases.stop(&mut teardown).await;
        self.enter(ExecuteStatus::Finalising);
        phases.finalise(&mut teardown).await;

        let (result, message) = match upstream {
            Ok(()) => match teardown.first_error() {
                None => (ResultStatus::Completed, None),
                Some(e) => (ResultStatus::Failed, Some(e.to_string())),
            },
            Err(PhaseError::Cancelled) => (
                ResultStatus::Cancelled,
                teardown.first_error().map(str::to_string),
            ),
            Err(PhaseError::Failed(e)) => (ResultStatus::Failed, Some(e)),
        };
        self.complete(result, message);
    }

    fn cancel(&self) -> bool {
        let executing = self.run.borrow().execute_status.is_executing();
        if executing {
            info!(setup = %self.setup_id, execution_id = self.execution_id(), "Cancellation requested");
            self.cancel_token.cancel();
        }
        executing
    }

    fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    fn execution_id(&self) -> i32 {
        self.execution_id.load(Ordering::SeqCst)
    }

    fn set_execution_id(&self, id: i32) {
        self.execution_id.store(id, Ordering::SeqCst);
    }

    fn mark_waiting(&self) {
        self.run.send_if_modified(|run| {
            if run.execute_status == ExecuteStatus::Created {
                run.execute_status = ExecuteStatus::Waiting;
                true
            } else {
                false
            }
        });
    }

    fn abort(&self, message: &str) {
        let pending = matches!(
            self.run.borrow().execute_status,
            ExecuteStatus::Created | ExecuteStatus::Waiting
        );
        if pending {
            self.complete(ResultStatus::Failed, Some(message.to_string()));
        }
    }

    fn execution_status(&self) -> ExecutionStatus {
        let run = self.run.borrow();
        ExecutionStatus {
            execution_id: self.execution_id(),
            execute_status: run.execute_status,
            result_status: run.result_status,
            time_remaining: run.time_remaining(),
            error_message: run.error_message.clone(),
        }
    }

    async fn experiment_results(&self) -> Option<String> {
        if !self.execution_status().succeeded() {
            return None;
        }
        let data = self.phases.lock().await.results();
        let document = ResultDocument {
            run_uid: uuid::Uuid::new_v4().to_string(),
            setup_id: self.setup_id.clone(),
            execution_id: self.execution_id(),
            timestamp: Utc::now(),
            data,
        };
        match serde_json::to_string(&document) {
            Ok(text) => Some(text),
            Err(e) => {
                warn!(setup = %self.setup_id, error = %e, "Failed to serialize results");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::simulated::{Faults, SimulatedPower};
    use serde_json::json;
    use tracing_test::traced_test;

    /// Test experiment: loops `points` times in Running and has five
    /// Stopping steps, all routed through a fault table.
    struct Scripted {
        faults: Faults,
        points: u32,
        cancel_at: Option<u32>,
        cancel: Option<CancelToken>,
        visited: Vec<u32>,
    }

    impl Scripted {
        fn new(faults: Faults) -> Self {
            Self {
                faults,
                points: 4,
                cancel_at: None,
                cancel: None,
                visited: Vec::new(),
            }
        }

        fn step(&self, name: &str) -> anyhow::Result<()> {
            self.faults.check(name)
        }
    }

    #[async_trait]
    impl ExperimentPhases for Scripted {
        fn name(&self) -> &'static str {
            "Scripted"
        }

        fn required_devices(&self) -> &'static [DeviceKind] {
            &[]
        }

        fn configure(&mut self, spec: &Specification) -> Result<ExecutionTimes, String> {
            let points = spec
                .params
                .get("points")
                .and_then(|v| v.as_u64())
                .ok_or_else(|| "points missing".to_string())?;
            if points > 10 {
                return Err(format!("points ({}) exceeds maximum (10)", points));
            }
            self.points = points as u32;
            Ok(ExecutionTimes {
                run: self.points,
                ..Default::default()
            })
        }

        async fn start(&mut self, _ctx: &PhaseContext) -> PhaseResult {
            self.step("start")?;
            Ok(())
        }

        async fn run(&mut self, ctx: &PhaseContext) -> PhaseResult {
            for point in 0..self.points {
                ctx.checkpoint()?;
                if Some(point) == self.cancel_at {
                    if let Some(token) = &self.cancel {
                        token.cancel();
                    }
                }
                self.step("run.point")?;
                self.visited.push(point);
            }
            Ok(())
        }

        async fn stop(&mut self, teardown: &mut Teardown) {
            for i in 1..=5 {
                let name = format!("stop.{}", i);
                teardown.record(&name, self.step(&name));
            }
        }

        async fn finalise(&mut self, teardown: &mut Teardown) {
            teardown.record("finalise", self.step("finalise"));
        }

        fn results(&self) -> serde_json::Value {
            json!({ "visited": self.visited })
        }
    }

    fn devices() -> DeviceSet {
        DeviceSet::new(Arc::new(SimulatedPower::default()))
    }

    fn spec(points: u32) -> Specification {
        Specification::parse(&format!(r#"{{"setupId": "Scripted", "points": {}}}"#, points)).unwrap()
    }

    #[tokio::test]
    async fn test_successful_run_completes_and_yields_results() {
        let faults = Faults::new();
        let driver = PhasedDriver::new("Scripted", devices(), Scripted::new(faults.clone()));

        let validation = driver.validate(&spec(3)).await.unwrap();
        assert!(validation.accepted);
        assert_eq!(validation.execution_time, 3);

        driver.set_execution_id(77);
        driver.mark_waiting();
        assert_eq!(driver.execution_status().execute_status, ExecuteStatus::Waiting);

        driver.execute().await;
        let status = driver.execution_status();
        assert_eq!(status.execution_id, 77);
        assert!(status.succeeded());
        assert_eq!(status.time_remaining, 0);

        let results = driver.experiment_results().await.unwrap();
        let doc: serde_json::Value = serde_json::from_str(&results).unwrap();
        assert_eq!(doc["executionId"], 77);
        assert_eq!(doc["data"]["visited"], json!([0, 1, 2]));
    }

    #[tokio::test]
    async fn test_out_of_range_spec_is_rejected_not_raised() {
        let driver = PhasedDriver::new("Scripted", devices(), Scripted::new(Faults::new()));
        let validation = driver.validate(&spec(11)).await.unwrap();
        assert!(!validation.accepted);
        assert_eq!(
            validation.error_message.as_deref(),
            Some("points (11) exceeds maximum (10)")
        );
    }

    #[tokio::test]
    async fn test_setup_mismatch_is_configuration_error() {
        let driver = PhasedDriver::new("Other", devices(), Scripted::new(Faults::new()));
        let err = driver.validate(&spec(2)).await.unwrap_err();
        assert!(matches!(err, LabError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_running_failure_skips_to_teardown() {
        let faults = Faults::new();
        faults.fail_on("run.point", "Counter timed out");
        let driver = PhasedDriver::new("Scripted", devices(), Scripted::new(faults.clone()));
        driver.validate(&spec(4)).await.unwrap();

        driver.execute().await;
        let status = driver.execution_status();
        assert_eq!(status.result_status, ResultStatus::Failed);
        assert_eq!(status.error_message.as_deref(), Some("Counter timed out"));
        assert_eq!(faults.call_count("run.point"), 1);
        for i in 1..=5 {
            assert_eq!(faults.call_count(&format!("stop.{}", i)), 1);
        }
        assert_eq!(faults.call_count("finalise"), 1);
        assert!(driver.experiment_results().await.is_none());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_stopping_attempts_every_step_and_keeps_first_error() {
        let faults = Faults::new();
        faults.fail_on("stop.2", "Absorber wheel jammed");
        faults.fail_on("stop.4", "Tube carriage stalled");
        let driver = PhasedDriver::new("Scripted", devices(), Scripted::new(faults.clone()));
        driver.validate(&spec(2)).await.unwrap();

        driver.execute().await;

        for i in 1..=5 {
            assert_eq!(faults.call_count(&format!("stop.{}", i)), 1, "stop.{i}");
        }
        let status = driver.execution_status();
        assert_eq!(status.result_status, ResultStatus::Failed);
        assert_eq!(status.error_message.as_deref(), Some("Absorber wheel jammed"));
        assert!(logs_contain("Teardown step failed, continuing"));
        assert!(logs_contain("Tube carriage stalled"));
    }

    #[tokio::test]
    async fn test_cancellation_is_checked_once_per_iteration() {
        let faults = Faults::new();
        let mut phases = Scripted::new(faults.clone());
        let driver_cancel = CancelToken::new();
        phases.cancel_at = Some(1);
        phases.cancel = Some(driver_cancel.clone());

        let mut driver = PhasedDriver::new("Scripted", devices(), phases);
        driver.cancel_token = driver_cancel;
        driver.validate(&spec(5)).await.unwrap();
        driver.mark_waiting();

        driver.execute().await;

        let status = driver.execution_status();
        assert!(status.is_completed());
        assert_eq!(status.result_status, ResultStatus::Cancelled);
        // Point 1 finishes its iteration; point 2 sees the flag.
        assert_eq!(faults.call_count("run.point"), 2);
        for i in 1..=5 {
            assert_eq!(faults.call_count(&format!("stop.{}", i)), 1);
        }
        assert!(driver.experiment_results().await.is_none());
        assert!(!driver.cancel());
    }

    #[tokio::test]
    async fn test_cancel_before_start_skips_upstream() {
        let faults = Faults::new();
        let driver = PhasedDriver::new("Scripted", devices(), Scripted::new(faults.clone()));
        driver.validate(&spec(3)).await.unwrap();
        driver.mark_waiting();
        assert!(driver.cancel());

        driver.execute().await;
        assert_eq!(driver.execution_status().result_status, ResultStatus::Cancelled);
        assert_eq!(faults.call_count("start"), 0);
        assert_eq!(faults.call_count("stop.1"), 1);
    }

    #[tokio::test]
    async fn test_abort_only_affects_pending_runs() {
        let driver = PhasedDriver::new("Scripted", devices(), Scripted::new(Faults::new()));
        driver.validate(&spec(1)).await.unwrap();
        driver.mark_waiting();
        driver.abort("Equipment failed to power up");

        let status = driver.execution_status();
        assert_eq!(status.result_status, ResultStatus::Failed);
        assert_eq!(status.error_message.as_deref(), Some("Equipment failed to power up"));

        // An aborted run is not executed afterwards.
        driver.execute().await;
        assert_eq!(
            driver.execution_status().error_message.as_deref(),
            Some("Equipment failed to power up")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiting_run_reports_full_estimate() {
        let driver = PhasedDriver::new("Scripted", devices(), Scripted::new(Faults::new()));
        driver.validate(&spec(6)).await.unwrap();
        driver.mark_waiting();
        assert_eq!(driver.execution_status().time_remaining, 6);
    }
}
