pub mod clock;

pub use clock::{Clock, MonotonicClock};

use std::time::Duration;

/// Boxed error type used at every device trait boundary.
///
/// Device implementations report errors however they like; the engine maps
/// them to its own typed error enum at the call site.
pub type DevError = Box<dyn std::error::Error + Send + Sync>;
pub type DevResult<T> = Result<T, DevError>;

/// Amplifier clamp mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClampMode {
    /// Voltage clamp; holding is in volts.
    Vc,
    /// Current clamp; holding is in amps.
    Ic,
    /// Zero-current clamp. Safe intermediate between VC and IC.
    I0,
}

impl ClampMode {
    /// Stable index for per-mode caches.
    pub const fn index(self) -> usize {
        match self {
            ClampMode::Vc => 0,
            ClampMode::Ic => 1,
            ClampMode::I0 => 2,
        }
    }
}

impl std::fmt::Display for ClampMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClampMode::Vc => write!(f, "VC"),
            ClampMode::Ic => write!(f, "IC"),
            ClampMode::I0 => write!(f, "I=0"),
        }
    }
}

/// Which port feeds the pipette's pressure line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PressureSource {
    /// Vented to atmosphere; setpoint is ignored.
    Atmosphere,
    /// Manual user port (mouth pressure / syringe); setpoint is ignored.
    User,
    /// Electronic regulator driven by the commanded setpoint in pascals.
    Regulator,
}

impl std::fmt::Display for PressureSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PressureSource::Atmosphere => write!(f, "atmosphere"),
            PressureSource::User => write!(f, "user"),
            PressureSource::Regulator => write!(f, "regulator"),
        }
    }
}

/// Analysis results of a single amplifier test pulse.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TestPulseAnalysis {
    /// Steady-state (access + seal) resistance in ohms.
    pub steady_state_resistance: f64,
    /// Apparent capacitance in farads.
    pub capacitance: f64,
    /// Baseline holding current in amps.
    pub baseline_current: f64,
}

/// One timestamped test-pulse measurement.
///
/// Immutable once produced; `start_time` is seconds on the producing
/// device's monotonic timebase and is non-decreasing per device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TestPulse {
    pub start_time: f64,
    pub analysis: TestPulseAnalysis,
}

/// Stimulus parameters for the amplifier test pulse.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TestPulseParams {
    /// Pulse amplitude (volts in VC, amps in IC).
    pub amplitude: f64,
    /// Pulse duration in seconds.
    pub duration: f64,
    /// Repetition interval in seconds.
    pub interval: f64,
}

impl Default for TestPulseParams {
    fn default() -> Self {
        Self {
            amplitude: -10e-3,
            duration: 10e-3,
            interval: 0.2,
        }
    }
}

/// Patch amplifier command surface.
pub trait ClampAmplifier: Send {
    fn set_mode(&mut self, mode: ClampMode) -> DevResult<()>;
    fn set_holding(&mut self, mode: ClampMode, value: f64) -> DevResult<()>;
    fn enable_test_pulse(&mut self, enabled: bool) -> DevResult<()>;
    fn set_test_pulse_params(&mut self, params: TestPulseParams) -> DevResult<()>;
    fn enable_auto_bias(&mut self, enabled: bool) -> DevResult<()>;
    fn set_auto_bias_target(&mut self, volts: f64) -> DevResult<()>;
    /// Opaque amplifier routine: zero the pipette offset.
    fn auto_pipette_offset(&mut self) -> DevResult<()>;
    /// Opaque amplifier routine: compensate fast capacitance.
    fn auto_cap_comp(&mut self) -> DevResult<()>;
}

/// Blocking test-pulse measurement source, owned exclusively by the engine's
/// pump thread (the command surface stays free for concurrent use).
///
/// `read_pulse` blocks up to `timeout` for the next completed pulse and
/// returns `None` when none arrived (test pulse disabled, amplifier busy
/// switching modes). Producers may silently stop; consumers time out on
/// their own.
pub trait PulseSource: Send {
    fn read_pulse(&mut self, timeout: Duration) -> DevResult<Option<TestPulse>>;
}

/// Pressure regulator collaborator.
///
/// Source selection and setpoint are independent commands; the ordering of
/// the two on a source change is the engine's responsibility.
pub trait PressureRegulator: Send {
    fn select_source(&mut self, source: PressureSource) -> DevResult<()>;
    /// Command the regulator setpoint in pascals (negative = suction).
    fn set_setpoint(&mut self, pascals: f64) -> DevResult<()>;
}

/// Motorized pipette stage collaborator.
///
/// Moves are started asynchronously; the engine polls `is_moving` to build
/// blocking futures on top. `halt` must stop motion promptly and leave the
/// stage at its current position.
pub trait Stage: Send {
    fn position(&mut self) -> DevResult<[f64; 3]>;
    /// Travel limits as `(min, max)` per axis, in global meters.
    fn limits(&mut self) -> DevResult<([f64; 3], [f64; 3])>;
    fn start_move(&mut self, target: [f64; 3], speed: f64, linear: bool) -> DevResult<()>;
    fn is_moving(&mut self) -> DevResult<bool>;
    fn halt(&mut self) -> DevResult<()>;
}

/// Microscope / imaging collaborator.
///
/// Only what the engine needs: the sample surface depth, focus control, and
/// the camera ROI center in the camera's own frame (the engine maps it to
/// global coordinates through its transform tree).
pub trait Scope: Send {
    fn surface_depth(&mut self) -> DevResult<f64>;
    fn set_focus_depth(&mut self, z: f64) -> DevResult<()>;
    fn roi_center_camera(&mut self) -> DevResult<[f64; 3]>;
}
