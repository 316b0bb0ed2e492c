//! Tracing subscriber setup.
//!
//! `RUST_LOG` takes precedence; otherwise the configured
//! `application.log_level` applies to every target.
//!
//! ```text
//! RUST_LOG=lab_equipment::engine=trace lab_equipment run --spec demos/distance.json
//! LABEQUIP_APPLICATION__LOG_JSON=true lab_equipment run --spec demos/distance.json
//! ```

use crate::config::LabConfig;
use crate::error::{AppResult, LabError};
use tracing_subscriber::EnvFilter;

/// Build the filter: `RUST_LOG` if set and valid, else `level`.
pub fn filter_for(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Install the global subscriber described by `config`.
///
/// Fails if a global subscriber is already installed.
pub fn init_from_config(config: &LabConfig) -> AppResult<()> {
    let filter = filter_for(&config.application.log_level);
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let result = if config.application.log_json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    result.map_err(|e| LabError::Configuration(format!("Failed to initialise logging: {}", e)))
}
