//! Example: implementing the device traits for a custom rig.
//!
//! The engine only ever sees the collaborator traits in `autopatch_traits`;
//! this shows the minimal set of stub implementations needed to stand up a
//! `Rig` without any hardware (or without the full simulated preparation in
//! `autopatch_hardware`).

use std::sync::Arc;
use std::time::Duration;

use autopatch_config::RigConfig;
use autopatch_core::{Rig, RigDevices};
use autopatch_traits::{
    ClampAmplifier, ClampMode, DevResult, MonotonicClock, PressureRegulator, PressureSource,
    Scope, Stage, TestPulseParams,
};

struct StubClamp;

impl ClampAmplifier for StubClamp {
    fn set_mode(&mut self, mode: ClampMode) -> DevResult<()> {
        println!("clamp mode -> {mode}");
        Ok(())
    }
    fn set_holding(&mut self, mode: ClampMode, value: f64) -> DevResult<()> {
        println!("holding[{mode}] -> {value} ");
        Ok(())
    }
    fn enable_test_pulse(&mut self, enabled: bool) -> DevResult<()> {
        println!("test pulse -> {enabled}");
        Ok(())
    }
    fn set_test_pulse_params(&mut self, _params: TestPulseParams) -> DevResult<()> {
        Ok(())
    }
    fn enable_auto_bias(&mut self, _enabled: bool) -> DevResult<()> {
        Ok(())
    }
    fn set_auto_bias_target(&mut self, _volts: f64) -> DevResult<()> {
        Ok(())
    }
    fn auto_pipette_offset(&mut self) -> DevResult<()> {
        Ok(())
    }
    fn auto_cap_comp(&mut self) -> DevResult<()> {
        Ok(())
    }
}

struct StubPressure;

impl PressureRegulator for StubPressure {
    fn select_source(&mut self, source: PressureSource) -> DevResult<()> {
        println!("pressure source -> {source}");
        Ok(())
    }
    fn set_setpoint(&mut self, pascals: f64) -> DevResult<()> {
        println!("pressure setpoint -> {pascals} Pa");
        Ok(())
    }
}

struct StubStage {
    position: [f64; 3],
}

impl Stage for StubStage {
    fn position(&mut self) -> DevResult<[f64; 3]> {
        Ok(self.position)
    }
    fn limits(&mut self) -> DevResult<([f64; 3], [f64; 3])> {
        Ok(([-10e-3; 3], [10e-3; 3]))
    }
    fn start_move(&mut self, target: [f64; 3], _speed: f64, _linear: bool) -> DevResult<()> {
        // Instant teleport; a real stage would track motion.
        self.position = target;
        Ok(())
    }
    fn is_moving(&mut self) -> DevResult<bool> {
        Ok(false)
    }
    fn halt(&mut self) -> DevResult<()> {
        Ok(())
    }
}

struct StubScope;

impl Scope for StubScope {
    fn surface_depth(&mut self) -> DevResult<f64> {
        Ok(0.0)
    }
    fn set_focus_depth(&mut self, _z: f64) -> DevResult<()> {
        Ok(())
    }
    fn roi_center_camera(&mut self) -> DevResult<[f64; 3]> {
        Ok([0.0; 3])
    }
}

fn main() -> Result<(), eyre::Report> {
    let rig = Arc::new(Rig::new(
        RigDevices {
            clamp: Box::new(StubClamp),
            pressure: Box::new(StubPressure),
            stage: Box::new(StubStage {
                position: [0.0, 0.0, 2e-3],
            }),
            scope: Box::new(StubScope),
        },
        &RigConfig::default(),
        Arc::new(MonotonicClock::new()),
    ));

    // Exercise the facades directly.
    rig.pressure.set(PressureSource::Regulator, -1500.0)?;
    rig.clamp.set_mode(ClampMode::Vc)?;
    rig.clamp.set_holding(ClampMode::Vc, -70e-3)?;
    rig.clamp.set_mode(ClampMode::Ic)?; // routes through I=0

    let op = rig.stage.move_to(nalgebra::Vector3::new(1e-3, 0.0, 1e-3), 1e-3, false)?;
    op.wait(Duration::from_secs(5))?;
    println!("tip now at {:?}", rig.stage.position()?);
    Ok(())
}
