//! Range checks for specification parameters.
//!
//! Drivers build a [`SpecValidator`] from their configuration and run every
//! submitted value through it. A failed check is a rejection message, never an
//! error: the caller is expected to fix the specification and resubmit.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Display;

/// Inclusive bounds for one named parameter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Range {
    /// Smallest accepted value
    pub min: f64,
    /// Largest accepted value
    pub max: f64,
}

impl Range {
    /// Bounds `min..=max`.
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }
}

/// Named parameter ranges plus a cap on list lengths.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpecValidator {
    #[serde(default)]
    ranges: HashMap<String, Range>,
    #[serde(default)]
    max_list_len: Option<usize>,
}

impl SpecValidator {
    /// A validator with no ranges and no list limit.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the range for `name`.
    pub fn with_range(mut self, name: impl Into<String>, min: f64, max: f64) -> Self {
        self.ranges.insert(name.into(), Range::new(min, max));
        self
    }

    /// Limit every list parameter to `len` entries.
    pub fn with_max_list_len(mut self, len: usize) -> Self {
        self.max_list_len = Some(len);
        self
    }

    /// Fill in ranges from `defaults` that this validator does not define.
    pub fn merged_with(mut self, defaults: &SpecValidator) -> Self {
        for (name, range) in &defaults.ranges {
            self.ranges.entry(name.clone()).or_insert(*range);
        }
        if self.max_list_len.is_none() {
            self.max_list_len = defaults.max_list_len;
        }
        self
    }

    /// Range registered for `name`.
    pub fn range(&self, name: &str) -> Option<Range> {
        self.ranges.get(name).copied()
    }

    /// Check one value against the range registered for `name`.
    ///
    /// Parameters without a registered range always pass.
    pub fn check<T>(&self, name: &str, value: T) -> Result<(), String>
    where
        T: Into<f64> + Display + Copy,
    {
        let Some(range) = self.ranges.get(name) else {
            return Ok(());
        };
        let v: f64 = value.into();
        if v < range.min {
            return Err(format!(
                "{} ({}) is less than minimum ({})",
                name, value, range.min
            ));
        }
        if v > range.max {
            return Err(format!(
                "{} ({}) exceeds maximum ({})",
                name, value, range.max
            ));
        }
        Ok(())
    }

    /// Check that a list is non-empty, not too long, and every entry in range.
    pub fn check_list<T>(&self, name: &str, values: &[T]) -> Result<(), String>
    where
        T: Into<f64> + Display + Copy,
    {
        self.check_len(name, values.len())?;
        values.iter().try_for_each(|v| self.check(name, *v))
    }

    /// Check only the length of a list parameter.
    pub fn check_len(&self, name: &str, len: usize) -> Result<(), String> {
        if len == 0 {
            return Err(format!("{} list is empty", name));
        }
        match self.max_list_len {
            Some(max) if len > max => Err(format!(
                "{} list has {} entries, maximum is {}",
                name, len, max
            )),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> SpecValidator {
        SpecValidator::new()
            .with_range("distance", 20.0, 100.0)
            .with_range("duration", 1.0, 60.0)
            .with_max_list_len(3)
    }

    #[test]
    fn test_check_accepts_bounds_inclusive() {
        let v = validator();
        assert!(v.check("distance", 20u32).is_ok());
        assert!(v.check("distance", 100u32).is_ok());
    }

    #[test]
    fn test_check_messages() {
        let v = validator();
        assert_eq!(
            v.check("distance", 10u32).unwrap_err(),
            "distance (10) is less than minimum (20)"
        );
        assert_eq!(
            v.check("duration", 61u32).unwrap_err(),
            "duration (61) exceeds maximum (60)"
        );
    }

    #[test]
    fn test_unregistered_parameter_passes() {
        assert!(validator().check("repeat", 9999u32).is_ok());
    }

    #[test]
    fn test_check_list_rejects_empty_long_and_out_of_range() {
        let v = validator();
        assert_eq!(
            v.check_list::<u32>("distance", &[]).unwrap_err(),
            "distance list is empty"
        );
        assert!(v
            .check_list("distance", &[20u32, 30, 40, 50])
            .unwrap_err()
            .contains("maximum is 3"));
        assert!(v
            .check_list("distance", &[20u32, 130])
            .unwrap_err()
            .contains("exceeds maximum"));
        assert!(v.check_list("distance", &[20u32, 30, 40]).is_ok());
    }

    #[test]
    fn test_merge_keeps_own_ranges() {
        let defaults = SpecValidator::new()
            .with_range("distance", 0.0, 10.0)
            .with_range("repeat", 1.0, 5.0)
            .with_max_list_len(10);
        let merged = validator().merged_with(&defaults);
        assert_eq!(merged.range("distance"), Some(Range::new(20.0, 100.0)));
        assert_eq!(merged.range("repeat"), Some(Range::new(1.0, 5.0)));
        assert!(merged.check_len("distance", 4).is_err());
    }
}
