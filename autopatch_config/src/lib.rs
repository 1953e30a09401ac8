#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
//! Rig configuration schemas for the patch pipette engine.
//!
//! - `RigConfig` and sub-structs are deserialized from TOML and validated.
//! - Per-state overrides are carried as raw TOML tables; the core crate
//!   merges them over each state's defaults key by key.

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Invalid(&'static str),
    #[error("toml parse error: {0}")]
    Parse(String),
}

/// Pressure subsystem limits and timing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PressureSection {
    /// Absolute bound on commanded pressure in pascals. The facade clamps
    /// every setpoint to `[-limit, +limit]`.
    pub limit: f64,
    /// Regulator settling interval in milliseconds. Ramps sample at this
    /// interval, and source switches to regulator wait this long after the
    /// setpoint is written.
    pub settle_ms: u64,
    /// Deprecated alias for `limit` (magnitude of the strongest allowed
    /// vacuum). Migrated to `limit` during validation when `limit` was left
    /// at its default.
    pub max_vacuum: Option<f64>,
}

impl Default for PressureSection {
    fn default() -> Self {
        Self {
            limit: 70e3,
            settle_ms: 300,
            max_vacuum: None,
        }
    }
}

/// Pipette and stage geometry used by the motion planner.
///
/// Lengths are meters, angles radians, speeds meters per second.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeometrySection {
    /// Pipette axis pitch below horizontal, in (0, pi/2).
    pub pitch: f64,
    /// Pipette axis yaw in the global XY plane.
    pub yaw: f64,
    /// Standby height above the sample surface for the approach path.
    pub approach_height: f64,
    /// Focus height above the surface while searching for the tip.
    pub search_height: f64,
    /// Tip height above the surface at the search position.
    pub search_tip_height: f64,
    /// Pull-back along the pipette axis at the search position.
    pub search_distance: f64,
    /// Height above surface for the idle parking position.
    pub idle_height: f64,
    /// Distance from the origin for the idle parking position.
    pub idle_distance: f64,
    /// Clearance above the surface considered "out of the sample".
    pub clearance: f64,
    /// Home position for the stage, global meters.
    pub home_position: [f64; 3],
    /// XY origin the idle position is computed from.
    pub origin: [f64; 2],
    /// Waypoint route from the work area to the cleaning well. The reverse
    /// route is replayed to come back.
    pub clean_route: Vec<[f64; 3]>,
    /// Optional route to a rinse well, visited after the cleaning well.
    pub rinse_route: Vec<[f64; 3]>,
    /// Waypoint route to the collection tube.
    pub collect_route: Vec<[f64; 3]>,
    /// Fast travel speed.
    pub fast_speed: f64,
    /// Slow in-sample speed.
    pub slow_speed: f64,
    /// Approach/positioning speed.
    pub approach_speed: f64,
}

impl Default for GeometrySection {
    fn default() -> Self {
        Self {
            pitch: 0.5,
            yaw: 0.0,
            approach_height: 100e-6,
            search_height: 2e-3,
            search_tip_height: 1.5e-3,
            search_distance: 2e-3,
            idle_height: 1e-3,
            idle_distance: 7e-3,
            clearance: 100e-6,
            home_position: [-10e-3, 0.0, 5e-3],
            origin: [0.0, 0.0],
            clean_route: vec![[5e-3, -20e-3, 2e-3], [5e-3, -25e-3, -1e-3]],
            rinse_route: Vec::new(),
            collect_route: vec![[5e-3, 20e-3, 2e-3], [5e-3, 25e-3, -1e-3]],
            fast_speed: 3e-3,
            slow_speed: 10e-6,
            approach_speed: 300e-6,
        }
    }
}

/// Amplifier defaults pushed when a state does not override them.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClampSection {
    /// Default VC holding in volts.
    pub holding_vc: f64,
    /// Default IC holding in amps.
    pub holding_ic: f64,
    /// Test pulse amplitude (volts in VC).
    pub test_pulse_amplitude: f64,
    /// Test pulse duration in seconds.
    pub test_pulse_duration: f64,
    /// Test pulse repetition interval in seconds.
    pub test_pulse_interval: f64,
}

impl Default for ClampSection {
    fn default() -> Self {
        Self {
            holding_vc: 0.0,
            holding_ic: 0.0,
            test_pulse_amplitude: -10e-3,
            test_pulse_duration: 10e-3,
            test_pulse_interval: 0.2,
        }
    }
}

/// Camera-to-global mapping for the scope transform chain.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OpticsSection {
    /// Translation of the microscope frame in the global frame.
    pub scope_offset: [f64; 3],
    /// Translation of the camera frame in the microscope frame.
    pub camera_offset: [f64; 3],
}

impl Default for OpticsSection {
    fn default() -> Self {
        Self {
            scope_offset: [0.0; 3],
            camera_offset: [0.0; 3],
        }
    }
}

/// Top-level rig configuration.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RigConfig {
    pub pressure: PressureSection,
    pub geometry: GeometrySection,
    pub clamp: ClampSection,
    pub optics: OpticsSection,
    /// Per-state override tables, keyed by state name. Unknown keys inside
    /// a table are rejected when the core crate merges it over the state's
    /// defaults.
    pub states: Option<toml::value::Table>,
}

impl RigConfig {
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let cfg: Self = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate ranges and apply deprecated-field migrations.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let p = &self.pressure;
        let limit = self.pressure_limit();
        if !(limit.is_finite() && limit > 0.0) {
            return Err(ConfigError::Invalid("pressure.limit must be > 0"));
        }
        if p.settle_ms == 0 {
            return Err(ConfigError::Invalid("pressure.settle_ms must be >= 1"));
        }
        let g = &self.geometry;
        if !(g.pitch > 0.0 && g.pitch < std::f64::consts::FRAC_PI_2) {
            return Err(ConfigError::Invalid(
                "geometry.pitch must be in (0, pi/2) radians",
            ));
        }
        if g.fast_speed <= 0.0 || g.slow_speed <= 0.0 || g.approach_speed <= 0.0 {
            return Err(ConfigError::Invalid("geometry speeds must be > 0"));
        }
        if g.approach_height < 0.0 || g.search_height < 0.0 || g.idle_height < 0.0 {
            return Err(ConfigError::Invalid("geometry heights must be >= 0"));
        }
        if self.clamp.test_pulse_interval <= 0.0 || self.clamp.test_pulse_duration <= 0.0 {
            return Err(ConfigError::Invalid("clamp test pulse timing must be > 0"));
        }
        Ok(())
    }

    /// Effective absolute pressure bound, honoring the deprecated
    /// `max_vacuum` alias when `limit` was left at its default.
    pub fn pressure_limit(&self) -> f64 {
        match self.pressure.max_vacuum {
            Some(v) if (self.pressure.limit - PressureSection::default().limit).abs() < f64::EPSILON => {
                tracing::warn!(
                    max_vacuum = v,
                    "pressure.max_vacuum is deprecated; use pressure.limit"
                );
                v.abs()
            }
            _ => self.pressure.limit,
        }
    }

    /// Override table for one state, if configured.
    pub fn state_overrides(&self, name: &str) -> Option<&toml::Value> {
        self.states.as_ref().and_then(|t| t.get(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = RigConfig::default();
        cfg.validate().unwrap();
        assert!((cfg.pressure_limit() - 70e3).abs() < 1e-9);
    }

    #[test]
    fn max_vacuum_migrates_when_limit_is_default() {
        let cfg = RigConfig::from_toml("[pressure]\nmax_vacuum = -50e3\n").unwrap();
        assert!((cfg.pressure_limit() - 50e3).abs() < 1e-9);
    }

    #[test]
    fn explicit_limit_wins_over_max_vacuum() {
        let cfg = RigConfig::from_toml("[pressure]\nlimit = 60e3\nmax_vacuum = -50e3\n").unwrap();
        assert!((cfg.pressure_limit() - 60e3).abs() < 1e-9);
    }

    #[test]
    fn zero_pitch_rejected() {
        let err = RigConfig::from_toml("[geometry]\npitch = 0.0\n").unwrap_err();
        assert!(err.to_string().contains("pitch"));
    }
}
