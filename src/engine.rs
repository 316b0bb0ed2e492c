//! Power lifecycle engine.
//!
//! [`LabEquipmentEngine`] owns the equipment's power state and at most one
//! experiment driver. A single worker task drives the power state machine in
//! one-second ticks; every public operation may be called concurrently from
//! any task.
//!
//! ## Shared state
//!
//! | Field               | Written by          | Guard              |
//! |---------------------|---------------------|--------------------|
//! | power snapshot      | worker only         | `RwLock`           |
//! | held driver         | callers             | `Mutex`            |
//! | suspend / shutdown  | callers             | atomics            |
//! | power-up request    | callers and worker  | atomic swap        |
//! | run handoff         | caller notifies     | [`Signal`]         |
//!
//! The held-driver slot is locked for the whole of a `start_execution`, so two
//! concurrent starts can never both pass the single-flight check.
//!
//! ## Handoff
//!
//! `start_execution` stores the new driver, suspends the idle powerdown,
//! requests a power-up if the equipment is down, and raises the signal. The
//! worker consumes the signal in `PowerdownSuspended`, lowering it before it
//! runs the driver, so a notify that races with a finishing run is never lost.

use crate::device::PowerControl;
use crate::driver::{DriverFactory, ExperimentDriver};
use crate::error::{AppResult, LabError};
use crate::power::{EngineTimings, PowerSnapshot, PowerState};
use crate::signal::Signal;
use crate::specification::Specification;
use crate::status::{
    ExecuteStatus, ExecutionStatus, LabEquipmentStatus, ResultStatus, Validation, NO_EXECUTION_ID,
};
use rand::Rng;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, PoisonError};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Duration, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

/// Worker tick and the longest single signal wait.
const TICK: Duration = Duration::from_secs(1);

struct Shared {
    timings: EngineTimings,
    power: Arc<dyn PowerControl>,
    snapshot: RwLock<PowerSnapshot>,
    status_message: RwLock<String>,
    driver: Mutex<Option<Arc<dyn ExperimentDriver>>>,
    /// Terminal status of the last released run
    last_status: Mutex<Option<ExecutionStatus>>,
    last_execution_id: AtomicI32,
    suspend_powerdown: AtomicBool,
    powerup_requested: AtomicBool,
    shutdown: AtomicBool,
    online: AtomicBool,
    signal: Signal,
}

impl Shared {
    async fn set_message(&self, message: impl Into<String>) {
        *self.status_message.write().await = message.into();
    }

    /// Run one power call, bounded by the hardware timeout.
    async fn hardware<F>(&self, operation: &str, call: F) -> Result<(), String>
    where
        F: Future<Output = anyhow::Result<()>>,
    {
        let limit = Duration::from_secs(u64::from(self.timings.hardware_timeout));
        match timeout(limit, call).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!(
                "{} timed out after {} s",
                operation, self.timings.hardware_timeout
            )),
        }
    }

    /// Consume a pending power-up request. A raised signal counts as one.
    fn take_powerup_request(&self) -> bool {
        let requested = self.powerup_requested.swap(false, Ordering::SeqCst);
        if !requested && self.signal.is_signalled() {
            info!("Run waiting on powered-down equipment, powering up");
            return true;
        }
        requested
    }

    /// Fail a run that was accepted but never started.
    async fn abort_pending(&self, reason: &str) {
        if let Some(driver) = self.driver.lock().await.as_ref() {
            if driver.execution_status().execute_status == ExecuteStatus::Waiting {
                warn!(execution_id = driver.execution_id(), reason, "Aborting waiting run");
                driver.abort(reason);
            }
        }
        self.signal.reset();
    }
}

// =============================================================================
// Worker
// =============================================================================

struct Worker {
    shared: Arc<Shared>,
    ticker: Interval,
}

impl Worker {
    fn new(shared: Arc<Shared>) -> Self {
        let mut ticker = interval_at(Instant::now() + TICK, TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { shared, ticker }
    }

    fn shutting_down(&self) -> bool {
        self.shared.shutdown.load(Ordering::SeqCst)
    }

    async fn enter(&mut self, state: PowerState, countdown: u32) {
        let previous = {
            let mut snapshot = self.shared.snapshot.write().await;
            let previous = snapshot.state;
            *snapshot = PowerSnapshot::enter(state, countdown);
            previous
        };
        self.ticker.reset();
        info!(from = %previous, to = %state, countdown, "Power state changed");
    }

    /// Wait one tick, then decrement the countdown.
    async fn count_down(&mut self) {
        self.ticker.tick().await;
        let mut snapshot = self.shared.snapshot.write().await;
        snapshot.countdown = snapshot.countdown.saturating_sub(1);
        trace!(state = %snapshot.state, countdown = snapshot.countdown, "Tick");
    }

    async fn run(mut self) {
        info!(timings = ?self.shared.timings, "Engine worker started");
        let timings = self.shared.timings;

        loop {
            let snapshot = *self.shared.snapshot.read().await;
            match snapshot.state {
                PowerState::Off => {
                    if self.shutting_down() {
                        break;
                    }
                    if self.shared.take_powerup_request() {
                        self.enter(PowerState::PoweringUp, 0).await;
                    } else {
                        self.ticker.tick().await;
                    }
                }
                PowerState::PoweringUp => self.power_up().await,
                PowerState::PowerUpDelay => {
                    if self.shutting_down() {
                        self.enter(PowerState::PoweringDown, 0).await;
                    } else if snapshot.countdown == 0 {
                        self.enter(PowerState::Initialising, 0).await;
                    } else {
                        self.count_down().await;
                    }
                }
                PowerState::Initialising => self.initialise().await,
                PowerState::Ready => {
                    if self.shutting_down() {
                        self.enter(PowerState::PoweringDown, 0).await;
                    } else if self.shared.suspend_powerdown.load(Ordering::SeqCst) {
                        self.enter(PowerState::PowerdownSuspended, 0).await;
                    } else if snapshot.countdown == 0 {
                        info!("Idle timeout reached");
                        self.enter(PowerState::PoweringDown, 0).await;
                    } else {
                        self.count_down().await;
                    }
                }
                PowerState::PowerdownSuspended => {
                    if self.shared.signal.wait(TICK).await {
                        self.shared.signal.reset();
                        self.enter(PowerState::Executing, 0).await;
                    } else if self.shutting_down() {
                        self.enter(PowerState::PoweringDown, 0).await;
                    } else if !self.shared.suspend_powerdown.load(Ordering::SeqCst)
                        && timings.powerdown_enabled()
                    {
                        self.enter(PowerState::Ready, timings.powerdown_timeout).await;
                    }
                }
                PowerState::Executing => self.execute().await,
                PowerState::PoweringDown => self.power_down().await,
                PowerState::PowerOffDelay => {
                    if snapshot.countdown > 0 {
                        self.count_down().await;
                    } else if self.shutting_down() {
                        break;
                    } else if self.shared.take_powerup_request() {
                        self.enter(PowerState::PoweringUp, 0).await;
                    } else {
                        self.enter(PowerState::Off, 0).await;
                    }
                }
            }
        }

        self.shared
            .abort_pending("Engine shut down before the run started")
            .await;
        self.shared.online.store(false, Ordering::SeqCst);
        *self.shared.snapshot.write().await = PowerSnapshot::default();
        self.shared.set_message("Shut down").await;
        info!("Engine worker stopped");
    }

    async fn power_up(&mut self) {
        self.shared.set_message("Powering up").await;
        let result = self
            .shared
            .hardware("Power up", self.shared.power.power_up())
            .await;
        match result {
            Ok(()) => {
                self.shared.online.store(true, Ordering::SeqCst);
                let delay = self.shared.timings.powerup_delay;
                self.enter(PowerState::PowerUpDelay, delay).await;
            }
            Err(e) => {
                let message = format!("Power up failed: {}", e);
                error!(error = %e, "Power up failed");
                self.shared.set_message(message.clone()).await;
                self.shared.abort_pending(&message).await;
                self.enter(PowerState::Off, 0).await;
            }
        }
    }

    async fn initialise(&mut self) {
        self.shared.set_message("Initialising").await;
        let result = self
            .shared
            .hardware("Initialise", self.shared.power.initialise())
            .await;
        match result {
            Ok(()) => {
                self.shared.set_message("Ready").await;
                let timings = self.shared.timings;
                if timings.powerdown_enabled() {
                    self.enter(PowerState::Ready, timings.powerdown_timeout).await;
                } else {
                    self.enter(PowerState::PowerdownSuspended, 0).await;
                }
            }
            Err(e) => {
                let message = format!("Initialisation failed: {}", e);
                error!(error = %e, "Initialisation failed");
                self.shared.set_message(message.clone()).await;
                self.shared.abort_pending(&message).await;
                self.enter(PowerState::PoweringDown, 0).await;
            }
        }
    }

    async fn execute(&mut self) {
        let driver = self.shared.driver.lock().await.clone();
        match driver {
            Some(driver) => {
                self.shared
                    .set_message(format!("Executing {}", driver.name()))
                    .await;
                driver.execute().await;
                let status = driver.execution_status();
                info!(
                    execution_id = status.execution_id,
                    result = %status.result_status,
                    "Run finished"
                );
                self.shared.set_message("Ready").await;
            }
            None => warn!("Signalled with no driver held"),
        }
        self.enter(PowerState::PowerdownSuspended, 0).await;
    }

    async fn power_down(&mut self) {
        self.shared.set_message("Powering down").await;
        let result = self
            .shared
            .hardware("Power down", self.shared.power.power_down())
            .await;
        if let Err(e) = result {
            error!(error = %e, "Power down failed");
        }
        self.shared.online.store(false, Ordering::SeqCst);
        self.shared.set_message("Powered off").await;
        let delay = self.shared.timings.poweroff_delay;
        self.enter(PowerState::PowerOffDelay, delay).await;
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Power-lifecycle orchestrator and single-flight experiment runner.
pub struct LabEquipmentEngine {
    shared: Arc<Shared>,
    factory: DriverFactory,
    worker: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl LabEquipmentEngine {
    /// Create the engine and start its worker on the current tokio runtime.
    ///
    /// The worker begins powering the equipment up immediately.
    pub fn spawn(timings: EngineTimings, factory: DriverFactory) -> Self {
        let shared = Arc::new(Shared {
            timings,
            power: factory.devices().power.clone(),
            snapshot: RwLock::new(PowerSnapshot::default()),
            status_message: RwLock::new("Powered off".to_string()),
            driver: Mutex::new(None),
            last_status: Mutex::new(None),
            last_execution_id: AtomicI32::new(NO_EXECUTION_ID),
            suspend_powerdown: AtomicBool::new(false),
            powerup_requested: AtomicBool::new(true),
            shutdown: AtomicBool::new(false),
            online: AtomicBool::new(false),
            signal: Signal::new(),
        });
        let handle = tokio::spawn(Worker::new(shared.clone()).run());
        Self {
            shared,
            factory,
            worker: std::sync::Mutex::new(Some(handle)),
        }
    }

    /// Timings the worker runs with.
    pub fn timings(&self) -> &EngineTimings {
        &self.shared.timings
    }

    /// Configured setup ids.
    pub fn setup_ids(&self) -> Vec<&str> {
        self.factory.setup_ids()
    }

    fn ensure_running(&self) -> AppResult<()> {
        if self.shared.shutdown.load(Ordering::SeqCst) {
            return Err(LabError::Worker("Engine is shut down".to_string()));
        }
        Ok(())
    }

    async fn request_powerup_if_down(&self) {
        let state = self.shared.snapshot.read().await.state;
        if state.is_down() && !self.shared.powerup_requested.swap(true, Ordering::SeqCst) {
            info!(state = %state, "Power up requested");
        }
    }

    fn mint_execution_id(&self) -> i32 {
        let previous = self.shared.last_execution_id.load(Ordering::SeqCst);
        let mut rng = rand::thread_rng();
        let id = loop {
            let candidate = rng.gen_range(1..=i32::MAX);
            if candidate != previous {
                break candidate;
            }
        };
        self.shared.last_execution_id.store(id, Ordering::SeqCst);
        id
    }

    /// Validate a specification without starting it.
    ///
    /// Unparseable or out-of-range specifications are an unaccepted
    /// [`Validation`]; an unknown setup id or a missing device is an error.
    /// The estimate includes the time until the equipment is ready. An
    /// accepted specification requests a power-up if the equipment is down.
    pub async fn validate(&self, specification: &str) -> AppResult<Validation> {
        self.ensure_running()?;
        let spec = match Specification::parse(specification) {
            Ok(spec) => spec,
            Err(message) => return Ok(Validation::rejected(message)),
        };
        let driver = self.factory.create(&spec.setup_id)?;
        let validation = driver.validate(&spec).await?;
        if !validation.accepted {
            return Ok(validation);
        }

        self.request_powerup_if_down().await;
        Ok(validation.delayed_by(self.time_until_ready().await))
    }

    /// Accept a run and hand it to the worker.
    ///
    /// Fails with `AlreadyExecuting` while the held run has not completed, and
    /// with `SpecificationRejected` if validation does not accept it.
    pub async fn start_execution(&self, specification: &str) -> AppResult<ExecutionStatus> {
        self.ensure_running()?;
        let mut slot = self.shared.driver.lock().await;

        if let Some(held) = slot.as_ref() {
            let status = held.execution_status();
            if !status.is_completed() {
                return Err(LabError::AlreadyExecuting(status.execution_id));
            }
        }

        let spec = Specification::parse(specification).map_err(LabError::SpecificationRejected)?;
        let driver: Arc<dyn ExperimentDriver> = Arc::from(self.factory.create(&spec.setup_id)?);
        let validation = driver.validate(&spec).await?;
        if !validation.accepted {
            return Err(LabError::SpecificationRejected(
                validation
                    .error_message
                    .unwrap_or_else(|| "Specification not accepted".to_string()),
            ));
        }

        let execution_id = self.mint_execution_id();
        driver.set_execution_id(execution_id);
        driver.mark_waiting();
        *slot = Some(driver.clone());
        *self.shared.last_status.lock().await = None;
        self.shared.suspend_powerdown.store(true, Ordering::SeqCst);
        drop(slot);

        self.request_powerup_if_down().await;
        self.shared.signal.notify();

        let mut status = driver.execution_status();
        status.time_remaining = status
            .time_remaining
            .saturating_add(self.time_until_ready().await);
        info!(
            execution_id,
            setup = %spec.setup_id,
            estimate = status.time_remaining,
            "Execution accepted"
        );
        Ok(status)
    }

    /// Status of the run identified by `execution_id`.
    ///
    /// Id 0 is accepted in place of the real id. Observing a completed run
    /// resumes the idle powerdown; a run that did not complete successfully is
    /// released at the same time.
    pub async fn get_execution_status(&self, execution_id: i32) -> AppResult<ExecutionStatus> {
        let mut slot = self.shared.driver.lock().await;

        let Some(driver) = slot.as_ref() else {
            let last = self.shared.last_status.lock().await.clone();
            return match last {
                Some(status)
                    if execution_id == status.execution_id || execution_id == NO_EXECUTION_ID =>
                {
                    Ok(status)
                }
                _ if execution_id == NO_EXECUTION_ID => Ok(ExecutionStatus::default()),
                _ => Err(LabError::InvalidExecutionId(execution_id)),
            };
        };

        if execution_id == NO_EXECUTION_ID {
            debug!(
                active = driver.execution_id(),
                "Status requested with execution id 0"
            );
        } else if execution_id != driver.execution_id() {
            return Err(LabError::InvalidExecutionId(execution_id));
        }

        let mut status = driver.execution_status();
        if status.is_completed() {
            self.shared.suspend_powerdown.store(false, Ordering::SeqCst);
            if status.result_status != ResultStatus::Completed {
                info!(
                    execution_id = status.execution_id,
                    result = %status.result_status,
                    "Releasing driver after unsuccessful run"
                );
                *self.shared.last_status.lock().await = Some(status.clone());
                *slot = None;
            }
        } else {
            status.time_remaining = status
                .time_remaining
                .saturating_add(self.time_until_ready().await);
        }
        Ok(status)
    }

    /// Results of a completed run, exactly once.
    ///
    /// Returns `None` while the run is still executing, and after the driver
    /// has been released.
    pub async fn get_experiment_results(&self, execution_id: i32) -> AppResult<Option<String>> {
        let mut slot = self.shared.driver.lock().await;
        let Some(driver) = slot.as_ref() else {
            return Ok(None);
        };
        if execution_id != driver.execution_id() {
            return Err(LabError::InvalidExecutionId(execution_id));
        }

        let status = driver.execution_status();
        if !status.is_completed() {
            return Ok(None);
        }

        let results = driver.experiment_results().await;
        info!(execution_id, "Results retrieved, releasing driver");
        *self.shared.last_status.lock().await = Some(status);
        *slot = None;
        self.shared.suspend_powerdown.store(false, Ordering::SeqCst);
        Ok(results)
    }

    /// Ask the run to stop at its next cancellation point.
    ///
    /// Returns `false` if the run had already completed.
    pub async fn cancel_lab_execution(&self, execution_id: i32) -> AppResult<bool> {
        let slot = self.shared.driver.lock().await;
        match slot.as_ref() {
            Some(driver) if driver.execution_id() == execution_id => Ok(driver.cancel()),
            Some(_) => Err(LabError::InvalidExecutionId(execution_id)),
            None => {
                let released = self
                    .shared
                    .last_status
                    .lock()
                    .await
                    .as_ref()
                    .is_some_and(|s| s.execution_id == execution_id);
                if released {
                    Ok(false)
                } else {
                    Err(LabError::InvalidExecutionId(execution_id))
                }
            }
        }
    }

    /// Seconds until the equipment is ready to execute.
    pub async fn time_until_ready(&self) -> u32 {
        self.shared
            .snapshot
            .read()
            .await
            .time_until_ready(&self.shared.timings)
    }

    /// Seconds until the idle powerdown, if one is counting down.
    pub async fn time_until_powerdown(&self) -> Option<u32> {
        self.shared
            .snapshot
            .read()
            .await
            .time_until_powerdown(&self.shared.timings)
    }

    /// Current power state.
    pub async fn power_state(&self) -> PowerState {
        self.shared.snapshot.read().await.state
    }

    /// Online flag, status message and power state.
    pub async fn lab_equipment_status(&self) -> LabEquipmentStatus {
        LabEquipmentStatus {
            online: self.shared.online.load(Ordering::SeqCst),
            status_message: self.shared.status_message.read().await.clone(),
            power_state: self.power_state().await,
        }
    }

    /// Stop the worker.
    ///
    /// A run already executing finishes first; the equipment is then powered
    /// down and the worker exits after the power-off delay. A run still
    /// waiting for the equipment is failed.
    pub async fn shutdown(&self) -> AppResult<()> {
        info!("Shutdown requested");
        self.shared.shutdown.store(true, Ordering::SeqCst);
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match handle {
            Some(handle) => handle
                .await
                .map_err(|e| LabError::Worker(format!("Worker task failed: {}", e))),
            None => Ok(()),
        }
    }
}

impl Drop for LabEquipmentEngine {
    fn drop(&mut self) {
        let handle = self
            .worker
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}
