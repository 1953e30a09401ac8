//! Test and helper mocks for autopatch_core.
//!
//! These are deliberately thin: they record commands and simulate timing,
//! nothing else. The full simulated rig lives in `autopatch_hardware::sim`.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use autopatch_traits::{
    ClampAmplifier, ClampMode, DevResult, PressureRegulator, PressureSource, Scope, Stage,
    TestPulseParams,
};

/// Shared append-only log of device commands, for asserting ordering.
#[derive(Debug, Clone, Default)]
pub struct CommandLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl CommandLog {
    pub fn push(&self, entry: impl Into<String>) {
        if let Ok(mut g) = self.entries.lock() {
            g.push(entry.into());
        }
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut g) = self.entries.lock() {
            g.clear();
        }
    }
}

/// Pressure regulator that only records commands.
pub struct NoopPressure {
    log: CommandLog,
}

impl NoopPressure {
    pub fn new(log: CommandLog) -> Self {
        Self { log }
    }
}

impl PressureRegulator for NoopPressure {
    fn select_source(&mut self, source: PressureSource) -> DevResult<()> {
        self.log.push(format!("source {source}"));
        Ok(())
    }

    fn set_setpoint(&mut self, pascals: f64) -> DevResult<()> {
        self.log.push(format!("setpoint {pascals}"));
        Ok(())
    }
}

/// Clamp amplifier that only records commands.
pub struct NoopClamp {
    log: CommandLog,
}

impl NoopClamp {
    pub fn new(log: CommandLog) -> Self {
        Self { log }
    }
}

impl ClampAmplifier for NoopClamp {
    fn set_mode(&mut self, mode: ClampMode) -> DevResult<()> {
        self.log.push(format!("mode {mode}"));
        Ok(())
    }

    fn set_holding(&mut self, mode: ClampMode, value: f64) -> DevResult<()> {
        self.log.push(format!("holding {mode} {value}"));
        Ok(())
    }

    fn enable_test_pulse(&mut self, enabled: bool) -> DevResult<()> {
        self.log.push(format!("test pulse {enabled}"));
        Ok(())
    }

    fn set_test_pulse_params(&mut self, params: TestPulseParams) -> DevResult<()> {
        self.log.push(format!("test pulse params {:?}", params));
        Ok(())
    }

    fn enable_auto_bias(&mut self, enabled: bool) -> DevResult<()> {
        self.log.push(format!("auto bias {enabled}"));
        Ok(())
    }

    fn set_auto_bias_target(&mut self, volts: f64) -> DevResult<()> {
        self.log.push(format!("auto bias target {volts}"));
        Ok(())
    }

    fn auto_pipette_offset(&mut self) -> DevResult<()> {
        self.log.push("auto pipette offset".to_string());
        Ok(())
    }

    fn auto_cap_comp(&mut self) -> DevResult<()> {
        self.log.push("auto cap comp".to_string());
        Ok(())
    }
}

struct NoopMotion {
    from: [f64; 3],
    to: [f64; 3],
    started: Instant,
    duration: Duration,
}

/// Stage whose every move takes a fixed duration, with linear position
/// interpolation and halting mid-leg.
pub struct NoopStage {
    position: [f64; 3],
    motion: Option<NoopMotion>,
    move_duration: Duration,
    limits: ([f64; 3], [f64; 3]),
}

impl NoopStage {
    pub fn new(position: [f64; 3], move_duration: Duration) -> Self {
        Self {
            position,
            motion: None,
            move_duration,
            limits: ([-10e-3; 3], [10e-3; 3]),
        }
    }

    pub fn with_limits(mut self, lo: [f64; 3], hi: [f64; 3]) -> Self {
        self.limits = (lo, hi);
        self
    }

    fn settle(&mut self) {
        if let Some(m) = &self.motion {
            let t = m.started.elapsed().as_secs_f64();
            let dur = m.duration.as_secs_f64().max(1e-9);
            if t >= dur {
                self.position = m.to;
                self.motion = None;
            } else {
                let f = t / dur;
                for axis in 0..3 {
                    self.position[axis] = m.from[axis] + (m.to[axis] - m.from[axis]) * f;
                }
            }
        }
    }
}

impl Stage for NoopStage {
    fn position(&mut self) -> DevResult<[f64; 3]> {
        self.settle();
        Ok(self.position)
    }

    fn limits(&mut self) -> DevResult<([f64; 3], [f64; 3])> {
        Ok(self.limits)
    }

    fn start_move(&mut self, target: [f64; 3], _speed: f64, _linear: bool) -> DevResult<()> {
        self.settle();
        self.motion = Some(NoopMotion {
            from: self.position,
            to: target,
            started: Instant::now(),
            duration: self.move_duration,
        });
        Ok(())
    }

    fn is_moving(&mut self) -> DevResult<bool> {
        self.settle();
        Ok(self.motion.is_some())
    }

    fn halt(&mut self) -> DevResult<()> {
        self.settle();
        self.motion = None;
        Ok(())
    }
}

/// Scope with fixed surface depth and ROI center.
pub struct NoopScope {
    pub surface_z: f64,
    pub roi_center: [f64; 3],
    pub focus_z: f64,
}

impl NoopScope {
    pub fn new(surface_z: f64, roi_center: [f64; 3]) -> Self {
        Self {
            surface_z,
            roi_center,
            focus_z: surface_z,
        }
    }
}

impl Scope for NoopScope {
    fn surface_depth(&mut self) -> DevResult<f64> {
        Ok(self.surface_z)
    }

    fn set_focus_depth(&mut self, z: f64) -> DevResult<()> {
        self.focus_z = z;
        Ok(())
    }

    fn roi_center_camera(&mut self) -> DevResult<[f64; 3]> {
        Ok(self.roi_center)
    }
}
