//! Submitted experiment specifications.
//!
//! A specification arrives as text. It names the setup that should run it and
//! carries whatever parameters that setup's driver understands:
//!
//! ```json
//! {
//!   "setupId": "RadioactivityVsDistance",
//!   "sourceName": "Sr90",
//!   "absorbers": ["None"],
//!   "distances": [20, 40, 60],
//!   "duration": 10,
//!   "repeat": 3
//! }
//! ```
//!
//! Only `setupId` is interpreted here; drivers pull typed parameters out with
//! [`Specification::parse_params`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A parsed specification: setup id plus the remaining parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Specification {
    /// Setup that should run this specification
    pub setup_id: String,
    /// Everything else, interpreted by the driver
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl Specification {
    /// Parse specification text.
    ///
    /// The error is a message suitable for a validation rejection.
    pub fn parse(text: &str) -> Result<Self, String> {
        serde_json::from_str(text).map_err(|e| format!("Invalid specification: {}", e))
    }

    /// Deserialize the parameters into a driver's typed specification.
    pub fn parse_params<T: DeserializeOwned>(&self) -> Result<T, String> {
        serde_json::from_value(Value::Object(self.params.clone()))
            .map_err(|e| format!("Invalid {} parameters: {}", self.setup_id, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Sweep {
        distances: Vec<u32>,
        duration: u32,
    }

    #[test]
    fn test_parse_splits_setup_id_from_params() {
        let spec = Specification::parse(
            r#"{"setupId": "RadioactivityVsDistance", "distances": [20, 40], "duration": 5}"#,
        )
        .unwrap();
        assert_eq!(spec.setup_id, "RadioactivityVsDistance");
        assert!(!spec.params.contains_key("setupId"));

        let sweep: Sweep = spec.parse_params().unwrap();
        assert_eq!(sweep.distances, vec![20, 40]);
        assert_eq!(sweep.duration, 5);
    }

    #[test]
    fn test_missing_setup_id_is_rejected() {
        let err = Specification::parse(r#"{"duration": 5}"#).unwrap_err();
        assert!(err.starts_with("Invalid specification"));
    }

    #[test]
    fn test_bad_params_name_the_setup() {
        let spec = Specification::parse(r#"{"setupId": "X", "distances": "near"}"#).unwrap();
        let err = spec.parse_params::<Sweep>().unwrap_err();
        assert!(err.starts_with("Invalid X parameters"));
    }
}
