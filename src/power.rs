//! Power lifecycle states and the "time until ready" arithmetic.
//!
//! ```text
//! Off ─► PoweringUp ─► PowerUpDelay ─► Initialising ─► Ready ◄──► PowerdownSuspended ◄──► Executing
//!  ▲         │                              │            │
//!  │         └─(fail)─► Off                 └─(fail)─┐   └─(timeout/shutdown)─┐
//!  │                                                 ▼                        ▼
//!  └──────────────── PowerOffDelay ◄──────────── PoweringDown ◄───────────────┘
//! ```
//!
//! Everything here is pure; the engine worker owns the live [`PowerSnapshot`].

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::time::Instant;

/// Equipment power state. Only the engine worker changes it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PowerState {
    /// Powered off
    #[default]
    Off,
    /// Power-up call in progress
    PoweringUp,
    /// Waiting for the equipment to settle after power-up
    PowerUpDelay,
    /// Initialise call in progress
    Initialising,
    /// Idle, counting down to powerdown
    Ready,
    /// Powerdown held off while a run is pending
    PowerdownSuspended,
    /// Running an experiment
    Executing,
    /// Power-down call in progress
    PoweringDown,
    /// Waiting before the equipment may power up again
    PowerOffDelay,
}

impl PowerState {
    /// True when the equipment can accept work without powering up first.
    pub fn is_ready(self) -> bool {
        matches!(
            self,
            PowerState::Ready | PowerState::PowerdownSuspended | PowerState::Executing
        )
    }

    /// True while the equipment is on its way down or already off.
    pub fn is_down(self) -> bool {
        matches!(
            self,
            PowerState::Off | PowerState::PoweringDown | PowerState::PowerOffDelay
        )
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Timing parameters of the power lifecycle, all in whole seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineTimings {
    /// Wait after powering up before initialising
    #[serde(default = "default_powerup_delay")]
    pub powerup_delay: u32,
    /// Expected duration of equipment initialisation
    #[serde(default = "default_initialise_delay")]
    pub initialise_delay: u32,
    /// Idle time in `Ready` before powering down; 0 disables powerdown
    #[serde(default = "default_powerdown_timeout")]
    pub powerdown_timeout: u32,
    /// Wait after powering down before the equipment may power up again
    #[serde(default = "default_poweroff_delay")]
    pub poweroff_delay: u32,
    /// Upper bound on a single power up, initialise or power down call
    #[serde(default = "default_hardware_timeout")]
    pub hardware_timeout: u32,
}

fn default_powerup_delay() -> u32 {
    5
}

fn default_initialise_delay() -> u32 {
    3
}

fn default_powerdown_timeout() -> u32 {
    300
}

fn default_poweroff_delay() -> u32 {
    10
}

fn default_hardware_timeout() -> u32 {
    120
}

impl Default for EngineTimings {
    fn default() -> Self {
        Self {
            powerup_delay: default_powerup_delay(),
            initialise_delay: default_initialise_delay(),
            powerdown_timeout: default_powerdown_timeout(),
            poweroff_delay: default_poweroff_delay(),
            hardware_timeout: default_hardware_timeout(),
        }
    }
}

impl EngineTimings {
    /// Whether the idle powerdown countdown is in effect at all.
    pub fn powerdown_enabled(&self) -> bool {
        self.powerdown_timeout > 0
    }

    /// Seconds from a cold start until `Ready`.
    pub fn cold_start(&self) -> u32 {
        self.powerup_delay.saturating_add(self.initialise_delay)
    }
}

/// Live power state plus whatever countdown belongs to it.
#[derive(Debug, Clone, Copy)]
pub struct PowerSnapshot {
    /// Current state
    pub state: PowerState,
    /// Ticks left in `PowerUpDelay`, `Ready` or `PowerOffDelay`
    pub countdown: u32,
    /// When `Initialising` was entered
    pub initialise_started: Option<Instant>,
}

impl Default for PowerSnapshot {
    fn default() -> Self {
        Self {
            state: PowerState::Off,
            countdown: 0,
            initialise_started: None,
        }
    }
}

impl PowerSnapshot {
    /// Snapshot for `state` with a fresh countdown.
    pub fn enter(state: PowerState, countdown: u32) -> Self {
        Self {
            state,
            countdown,
            initialise_started: (state == PowerState::Initialising).then(Instant::now),
        }
    }

    /// Seconds until the equipment is ready, derived only from the state and
    /// its countdown.
    pub fn time_until_ready(&self, timings: &EngineTimings) -> u32 {
        match self.state {
            PowerState::Off | PowerState::PoweringUp => timings.cold_start(),
            PowerState::PowerUpDelay => self.countdown.saturating_add(timings.initialise_delay),
            PowerState::Initialising => {
                let elapsed = self
                    .initialise_started
                    .map(|started| started.elapsed().as_secs())
                    .unwrap_or(0);
                let elapsed = u32::try_from(elapsed).unwrap_or(u32::MAX);
                timings.initialise_delay.saturating_sub(elapsed).max(1)
            }
            PowerState::PoweringDown => timings
                .poweroff_delay
                .saturating_add(timings.cold_start()),
            PowerState::PowerOffDelay => self.countdown.saturating_add(timings.cold_start()),
            PowerState::Ready | PowerState::PowerdownSuspended | PowerState::Executing => 0,
        }
    }

    /// Seconds until an idle powerdown, if one is counting down.
    pub fn time_until_powerdown(&self, timings: &EngineTimings) -> Option<u32> {
        match self.state {
            PowerState::Ready if timings.powerdown_enabled() => Some(self.countdown),
            _ => None,
        }
    }
}
