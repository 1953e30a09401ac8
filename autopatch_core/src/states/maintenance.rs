//! Tip maintenance states: blowout, clean, collect.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use autopatch_traits::{ClampMode, PressureSource};

use crate::error::Result;
use crate::planner::MotionPath;
use crate::state::{PatchState, StateContext, StateSetup};
use crate::util::secs;

/// Run a `(pressure, duration)` sequence on the regulator, venting at the
/// end.
fn run_pressure_sequence(cx: &StateContext, sequence: &[(f64, f64)]) -> Result<()> {
    for (pressure, duration) in sequence {
        cx.rig.pressure.set(PressureSource::Regulator, *pressure)?;
        cx.task.sleep(secs(*duration))?;
    }
    cx.rig.pressure.set(PressureSource::Atmosphere, 0.0)?;
    Ok(())
}

fn execute(cx: &StateContext, path: &MotionPath, timeout: f64) -> Result<()> {
    let op = cx.rig.stage.move_path(path)?;
    cx.wait_for(&op, Some(Duration::from_secs_f64(timeout)))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BlowoutConfig {
    /// Positive pulse clearing the tip.
    pub pressure: f64,
    pub duration: f64,
    /// Observation window after the pulse.
    pub settle_time: f64,
    pub next_state: String,
}

impl Default for BlowoutConfig {
    fn default() -> Self {
        Self {
            pressure: 50e3,
            duration: 1.0,
            settle_time: 2.0,
            next_state: super::names::BATH.to_string(),
        }
    }
}

/// Retract above the sample and clear the tip with a positive pressure
/// pulse.
pub struct BlowoutState {
    config: BlowoutConfig,
}

impl BlowoutState {
    pub fn new(config: BlowoutConfig) -> Self {
        Self { config }
    }
}

impl PatchState for BlowoutState {
    fn name(&self) -> &'static str {
        super::names::BLOWOUT
    }

    fn setup(&self) -> StateSetup {
        StateSetup {
            clamp_mode: Some(ClampMode::Vc),
            holding: Some((ClampMode::Vc, 0.0)),
            test_pulse: Some(true),
            ..StateSetup::default()
        }
    }

    fn run(&mut self, cx: &mut StateContext) -> Result<Option<String>> {
        let cfg = self.config.clone();
        let scene = cx.rig.scene()?;
        let retract = cx.rig.planner.clear_sample(&scene);
        if !retract.is_empty() {
            execute(cx, &retract, 120.0)?;
        }
        cx.rig.pressure.set(PressureSource::Regulator, cfg.pressure)?;
        cx.task.sleep(secs(cfg.duration))?;
        cx.rig.pressure.set(PressureSource::Atmosphere, 0.0)?;

        let r = cx.median_resistance(3, cfg.settle_time.max(5.0))?;
        cx.record.set("blowoutResistance", r);
        tracing::info!(r, "blowout complete");
        Ok(Some(cfg.next_state))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CleanConfig {
    /// `(pressure, duration)` pairs run at the cleaning well.
    pub wash_sequence: Vec<(f64, f64)>,
    /// Times the wash sequence repeats.
    pub repeats: u32,
    /// Sequence run at the rinse well, when a rinse route is configured.
    pub rinse_sequence: Vec<(f64, f64)>,
    pub move_timeout: f64,
    pub next_state: String,
}

impl Default for CleanConfig {
    fn default() -> Self {
        Self {
            wash_sequence: vec![(-35e3, 1.0), (100e3, 1.0)],
            repeats: 3,
            rinse_sequence: vec![(-35e3, 0.5), (100e3, 0.5)],
            move_timeout: 300.0,
            next_state: super::names::OUT.to_string(),
        }
    }
}

/// Carry the tip to the cleaning well, run the wash cycles, and come back
/// the way we went.
pub struct CleanState {
    config: CleanConfig,
}

impl CleanState {
    pub fn new(config: CleanConfig) -> Self {
        Self { config }
    }
}

impl PatchState for CleanState {
    fn name(&self) -> &'static str {
        super::names::CLEAN
    }

    fn setup(&self) -> StateSetup {
        StateSetup {
            pressure: Some((PressureSource::Atmosphere, 0.0)),
            clamp_mode: Some(ClampMode::Vc),
            holding: Some((ClampMode::Vc, 0.0)),
            test_pulse: Some(false),
            ..StateSetup::default()
        }
    }

    fn run(&mut self, cx: &mut StateContext) -> Result<Option<String>> {
        let cfg = self.config.clone();
        let scene = cx.rig.scene()?;
        let clean_route = cx.rig.planner.geometry().clean_route.clone();
        let rinse_route = cx.rig.planner.geometry().rinse_route.clone();

        let (to_well, back) = cx.rig.planner.well_route(&scene, &clean_route)?;
        execute(cx, &to_well, cfg.move_timeout)?;
        for _ in 0..cfg.repeats.max(1) {
            run_pressure_sequence(cx, &cfg.wash_sequence)?;
        }

        if !rinse_route.is_empty() {
            let rinse_scene = crate::planner::Scene {
                pose: crate::planner::PipettePose {
                    position: cx.rig.stage.position()?,
                    ..scene.pose
                },
                ..scene
            };
            let (to_rinse, from_rinse) = cx.rig.planner.well_route(&rinse_scene, &rinse_route)?;
            execute(cx, &to_rinse, cfg.move_timeout)?;
            run_pressure_sequence(cx, &cfg.rinse_sequence)?;
            execute(cx, &from_rinse, cfg.move_timeout)?;
        }

        execute(cx, &back, cfg.move_timeout)?;
        cx.record.set("tipCleaned", true);
        tracing::info!("tip cleaned");
        Ok(Some(cfg.next_state))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CollectConfig {
    /// Sequence expelling the contents into the collection tube.
    pub expel_sequence: Vec<(f64, f64)>,
    pub move_timeout: f64,
    pub next_state: String,
}

impl Default for CollectConfig {
    fn default() -> Self {
        Self {
            expel_sequence: vec![(50e3, 2.0)],
            move_timeout: 300.0,
            next_state: super::names::OUT.to_string(),
        }
    }
}

/// Carry the tip contents (e.g. an extracted nucleus) to the collection
/// tube, expel them, and return.
pub struct CollectState {
    config: CollectConfig,
}

impl CollectState {
    pub fn new(config: CollectConfig) -> Self {
        Self { config }
    }
}

impl PatchState for CollectState {
    fn name(&self) -> &'static str {
        super::names::COLLECT
    }

    fn setup(&self) -> StateSetup {
        StateSetup {
            clamp_mode: Some(ClampMode::Vc),
            test_pulse: Some(false),
            ..StateSetup::default()
        }
    }

    fn run(&mut self, cx: &mut StateContext) -> Result<Option<String>> {
        let cfg = self.config.clone();
        let scene = cx.rig.scene()?;
        let route = cx.rig.planner.geometry().collect_route.clone();
        let (to_tube, back) = cx.rig.planner.well_route(&scene, &route)?;
        execute(cx, &to_tube, cfg.move_timeout)?;
        run_pressure_sequence(cx, &cfg.expel_sequence)?;
        execute(cx, &back, cfg.move_timeout)?;
        cx.record.set("collected", true);
        tracing::info!("collection complete");
        Ok(Some(cfg.next_state))
    }
}
