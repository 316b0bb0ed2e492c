//! Execution-time estimation from device timing primitives.
//!
//! Selector wheels cannot move directly between two non-home positions; every
//! move passes back through home. Moving from `B` to `C` therefore costs
//!
//! ```text
//! cost(B → C) = returnTime(B) + selectTime(C) − selectTime(home)
//! ```
//!
//! A sweep starts at home and applies the recurrence once per step, carrying
//! the previous target forward. Totals stay in `f64` until a phase estimate is
//! rounded to whole seconds.

use serde::{Deserialize, Serialize};

/// Seconds for one selector move from `from` to `to`.
pub fn move_cost<F, R>(home: &str, from: &str, to: &str, select_time: F, return_time: R) -> f64
where
    F: Fn(&str) -> f64,
    R: Fn(&str) -> f64,
{
    return_time(from) + select_time(to) - select_time(home)
}

/// Seconds to visit `targets` in order, starting from home.
pub fn sweep_time<S, F, R>(home: &str, targets: &[S], select_time: F, return_time: R) -> f64
where
    S: AsRef<str>,
    F: Fn(&str) -> f64,
    R: Fn(&str) -> f64,
{
    let mut previous = home;
    let mut total = 0.0;
    for target in targets {
        let target = target.as_ref();
        total += move_cost(home, previous, target, &select_time, &return_time);
        previous = target;
    }
    total
}

/// Seconds to visit each distance in turn, starting at `start`.
pub fn tube_sweep_time<M>(start: u32, targets: &[u32], move_time: M) -> f64
where
    M: Fn(u32, u32) -> f64,
{
    let mut previous = start;
    let mut total = 0.0;
    for &target in targets {
        total += move_time(previous, target);
        previous = target;
    }
    total
}

/// Seconds for `repeat` captures of one capture each.
pub fn capture_time(single_capture: f64, repeat: u32) -> f64 {
    single_capture * f64::from(repeat)
}

/// Round a non-negative estimate to whole seconds.
pub fn whole_seconds(seconds: f64) -> u32 {
    if seconds.is_finite() && seconds > 0.0 {
        seconds.round().min(f64::from(u32::MAX)) as u32
    } else {
        0
    }
}

/// Predicted duration of each execution phase, in whole seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionTimes {
    /// Initialising phase
    pub initialise: u32,
    /// Starting phase
    pub start: u32,
    /// Running phase
    pub run: u32,
    /// Stopping phase
    pub stop: u32,
    /// Finalising phase
    pub finalise: u32,
}

impl ExecutionTimes {
    /// Sum of every phase.
    pub fn total(&self) -> u32 {
        [self.initialise, self.start, self.run, self.stop, self.finalise]
            .iter()
            .fold(0u32, |acc, t| acc.saturating_add(*t))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn table() -> (HashMap<&'static str, f64>, HashMap<&'static str, f64>) {
        let select = HashMap::from([("Home", 0.5), ("P1", 2.0), ("P2", 3.5), ("P3", 5.0)]);
        let ret = HashMap::from([("Home", 0.0), ("P1", 1.75), ("P2", 3.25), ("P3", 4.5)]);
        (select, ret)
    }

    #[test]
    fn test_three_step_sweep_matches_manual_sum() {
        let (select, ret) = table();
        let s = |p: &str| select[p];
        let r = |p: &str| ret[p];

        let manual = (r("Home") + s("P1") - s("Home"))
            + (r("P1") + s("P2") - s("Home"))
            + (r("P2") + s("P3") - s("Home"));

        let computed = sweep_time("Home", &["P1", "P2", "P3"], s, r);
        assert!((computed - manual).abs() < 1e-9);
        assert!((computed - 14.0).abs() < 1e-9);
        assert_eq!(whole_seconds(computed), 14);
    }

    #[test]
    fn test_sweep_of_nothing_costs_nothing() {
        let (select, ret) = table();
        let empty: [&str; 0] = [];
        assert_eq!(sweep_time("Home", &empty, |p| select[p], |p| ret[p]), 0.0);
    }

    #[test]
    fn test_tube_sweep_carries_previous_distance() {
        let per_mm = |from: u32, to: u32| f64::from(from.abs_diff(to)) / 10.0;
        assert_eq!(tube_sweep_time(20, &[30, 50, 40], per_mm), 4.0);
    }

    #[test]
    fn test_capture_time_scales_with_repeat() {
        assert_eq!(capture_time(10.5, 3), 31.5);
        assert_eq!(capture_time(10.5, 0), 0.0);
    }

    #[test]
    fn test_whole_seconds_rounds_to_nearest() {
        assert_eq!(whole_seconds(12.49), 12);
        assert_eq!(whole_seconds(12.5), 13);
        assert_eq!(whole_seconds(-3.0), 0);
        assert_eq!(whole_seconds(f64::NAN), 0);
    }

    #[test]
    fn test_total_sums_phases() {
        let times = ExecutionTimes {
            initialise: 1,
            start: 7,
            run: 90,
            stop: 9,
            finalise: 1,
        };
        assert_eq!(times.total(), 108);
    }
}
