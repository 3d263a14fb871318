//! Runtime tuning of the composite actuators, loaded with Figment.
//!
//! Settings are layered:
//! 1. built-in defaults
//! 2. an optional TOML file
//! 3. environment variables prefixed with `DAQ_ACTUATOR_`
//!
//! ```text
//! DAQ_ACTUATOR_STOP_TIMEOUT_MS=2000
//! DAQ_ACTUATOR_CONVERGENCE_ATTEMPTS=20
//! ```
//!
//! Each actuator's parameter struct embeds an [`ActuatorSettings`] with
//! `#[serde(default)]`, so a description file only needs to mention the
//! values it changes.

use crate::error::{ActuatorError, ActuatorResult};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Tuning shared by all composite actuators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActuatorSettings {
    /// Maximum wait per dependency when stopping (ms)
    pub stop_timeout_ms: u64,
    /// Polling interval while waiting for a move that may be followed by an
    /// update move (ms)
    pub backlash_poll_ms: u64,
    /// Corrective moves before a sensor-verified move gives up
    pub convergence_attempts: u32,
    /// Fraction of the remaining error applied by each corrective move
    pub convergence_step: f64,
    /// Moves between two re-homings of a rotation axis
    pub rotation_reference_period: u32,
    /// Default moves between two re-homings of a linear axis
    pub linear_reference_period: u32,
    /// Deviation from a known position above which snapping is logged
    pub snap_warning_tolerance: f64,
}

impl Default for ActuatorSettings {
    fn default() -> Self {
        Self {
            stop_timeout_ms: 1000,
            backlash_poll_ms: 10,
            convergence_attempts: 10,
            convergence_step: 0.1,
            rotation_reference_period: 5,
            linear_reference_period: 10,
            snap_warning_tolerance: 1e-6,
        }
    }
}

impl ActuatorSettings {
    /// Load settings from defaults, an optional TOML file and the environment.
    ///
    /// # Errors
    ///
    /// Returns `ConfigLoad` if a source cannot be parsed, `Configuration` if
    /// a value is out of bounds.
    pub fn load(path: Option<&Path>) -> ActuatorResult<Self> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        let settings: Self = figment.merge(Env::prefixed("DAQ_ACTUATOR_")).extract()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Check value bounds.
    pub fn validate(&self) -> ActuatorResult<()> {
        if self.backlash_poll_ms == 0 {
            return Err(ActuatorError::config("backlash_poll_ms must be positive"));
        }
        if self.convergence_attempts == 0 {
            return Err(ActuatorError::config(
                "convergence_attempts must be at least 1",
            ));
        }
        if !(self.convergence_step > 0.0 && self.convergence_step <= 1.0) {
            return Err(ActuatorError::config(format!(
                "convergence_step must be in (0, 1], got {}",
                self.convergence_step
            )));
        }
        if self.rotation_reference_period == 0 {
            return Err(ActuatorError::config(
                "rotation_reference_period must be at least 1",
            ));
        }
        if !(self.snap_warning_tolerance >= 0.0) {
            return Err(ActuatorError::config(
                "snap_warning_tolerance must be non-negative",
            ));
        }
        Ok(())
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn backlash_poll(&self) -> Duration {
        Duration::from_millis(self.backlash_poll_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = ActuatorSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.stop_timeout(), Duration::from_secs(1));
        assert_eq!(settings.backlash_poll(), Duration::from_millis(10));
    }

    #[test]
    fn test_invalid_step() {
        let settings = ActuatorSettings {
            convergence_step: 1.5,
            ..ActuatorSettings::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(ActuatorError::Configuration(_))
        ));
    }

    #[test]
    fn test_partial_deserialization() {
        let settings: ActuatorSettings =
            serde_json::from_str(r#"{"convergence_attempts": 3}"#).unwrap();
        assert_eq!(settings.convergence_attempts, 3);
        assert_eq!(settings.stop_timeout_ms, 1000);
    }
}
