//! Reseal: withdraw the pipette slowly while preserving membrane
//! integrity, optionally extracting the nucleus; and the follow-on state
//! that parks the pipette at home with the nucleus held by suction.

use std::time::Duration;

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use autopatch_traits::{ClampMode, PressureSource};

use crate::analysis::{MembraneTrend, ResealConfig, ResealMonitor};
use crate::error::{PatchError, Result, err};
use crate::pressure::{RampPace, RampTarget};
use crate::state::{PatchState, StateContext, StateSetup};
use crate::util::secs;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResealStateConfig {
    /// Wiggle the tip and ramp suction before retracting, to coax the
    /// nucleus into the tip.
    pub nuzzle: bool,
    pub nuzzle_duration: f64,
    pub nuzzle_amplitude: f64,
    pub nuzzle_pressure: f64,
    /// Retraction creep speed along the pipette axis.
    pub retraction_speed: f64,
    /// Length of each retraction leg between measurements.
    pub leg_distance: f64,
    pub detection_tau: f64,
    pub repair_tau: f64,
    pub stretch_threshold: f64,
    pub tear_threshold: f64,
    /// Pause on a stretching membrane before re-checking.
    pub pause_duration: f64,
    /// Distance to back down when the membrane tears.
    pub recover_distance: f64,
    /// Retracted distance that counts as success.
    pub retraction_success_distance: f64,
    /// Alternative success: resistance above this...
    pub success_resistance: f64,
    /// ...for this long.
    pub success_duration: f64,
    pub reseal_timeout: f64,
    /// Suction applied once retraction succeeded, to hold the nucleus.
    pub slurp_pressure: f64,
    pub slurp_duration: f64,
    /// Vertical lift after the slurp.
    pub lift_distance: f64,
    pub success_state: String,
    pub fallback_state: String,
}

impl Default for ResealStateConfig {
    fn default() -> Self {
        Self {
            nuzzle: false,
            nuzzle_duration: 4.0,
            nuzzle_amplitude: 2e-6,
            nuzzle_pressure: -20e3,
            retraction_speed: 0.3e-6,
            leg_distance: 5e-6,
            detection_tau: 1.0,
            repair_tau: 10.0,
            stretch_threshold: 1e-3,
            tear_threshold: -1e-3,
            pause_duration: 2.0,
            recover_distance: 1e-6,
            retraction_success_distance: 200e-6,
            success_resistance: 500e6,
            success_duration: 10.0,
            reseal_timeout: 600.0,
            slurp_pressure: -60e3,
            slurp_duration: 2.0,
            lift_distance: 500e-6,
            success_state: super::names::HOME_WITH_NUCLEUS.to_string(),
            fallback_state: super::names::WHOLE_CELL.to_string(),
        }
    }
}

pub struct ResealState {
    config: ResealStateConfig,
}

impl ResealState {
    pub fn new(config: ResealStateConfig) -> Self {
        Self { config }
    }

    /// Side-to-side wiggle with suction ramping in, encouraging the nucleus
    /// toward the tip.
    fn nuzzle(&self, cx: &mut StateContext) -> Result<()> {
        let cfg = &self.config;
        let ramp = cx.rig.pressure.ramp(
            RampTarget::To(cfg.nuzzle_pressure),
            Some(RampPace::Duration(secs(cfg.nuzzle_duration))),
        )?;
        let pose = cx.rig.pose()?;
        let lateral = Vector3::new(-pose.yaw.sin(), pose.yaw.cos(), 0.0);
        let started = cx.task.elapsed();
        let mut sign = 1.0;
        while cx.task.elapsed() - started < cfg.nuzzle_duration {
            let op = cx
                .rig
                .stage
                .step(lateral * (cfg.nuzzle_amplitude * sign), cfg.retraction_speed * 10.0)?;
            cx.wait_for(&op, Some(Duration::from_secs(30)))?;
            sign = -sign;
        }
        cx.wait_for(&ramp, Some(Duration::from_secs(30)))?;
        // Wiggle back to center.
        Ok(())
    }
}

impl PatchState for ResealState {
    fn name(&self) -> &'static str {
        super::names::RESEAL
    }

    fn setup(&self) -> StateSetup {
        StateSetup {
            clamp_mode: Some(ClampMode::Vc),
            test_pulse: Some(true),
            fallback_state: Some(self.config.fallback_state.clone()),
            ..StateSetup::default()
        }
    }

    fn run(&mut self, cx: &mut StateContext) -> Result<Option<String>> {
        let cfg = self.config.clone();
        let baseline = cx.median_resistance(3, 10.0)?;
        cx.record.set("resealStartResistance", baseline);

        if cfg.nuzzle {
            self.nuzzle(cx)?;
        }

        let mut monitor = ResealMonitor::new(ResealConfig {
            detection_tau: cfg.detection_tau,
            repair_tau: cfg.repair_tau,
            stretch_threshold: cfg.stretch_threshold,
            tear_threshold: cfg.tear_threshold,
        });
        let retract_dir = -cx.rig.pose()?.direction();
        let start_pos = cx.rig.stage.position()?;
        let mut above_since: Option<f64> = None;

        loop {
            if cx.task.elapsed() > cfg.reseal_timeout {
                return err(PatchError::Timeout("reseal".into()));
            }
            let Some(pulse) = cx.cycle()? else { continue };
            let r = pulse.analysis.steady_state_resistance;
            let trend = monitor.update(pulse.start_time, r);

            let retracted = (cx.rig.stage.position()? - start_pos).norm();
            if retracted >= cfg.retraction_success_distance {
                cx.record.set("resealRetractedDistance", retracted);
                break;
            }
            if r >= cfg.success_resistance {
                let now = cx.task.elapsed();
                let since = *above_since.get_or_insert(now);
                if now - since >= cfg.success_duration {
                    cx.record.set("resealResistance", r);
                    break;
                }
            } else {
                above_since = None;
            }

            match trend {
                MembraneTrend::Steady => {
                    let pos = cx.rig.stage.position()?;
                    let op = cx.rig.stage.move_to(
                        pos + retract_dir * cfg.leg_distance,
                        cfg.retraction_speed,
                        true,
                    )?;
                    cx.wait_for(&op, None)?;
                }
                MembraneTrend::Stretching => {
                    tracing::debug!(r, "membrane stretching, pausing retraction");
                    cx.task.sleep(secs(cfg.pause_duration))?;
                }
                MembraneTrend::Tearing => {
                    tracing::debug!(r, "membrane tearing, backing down");
                    let pos = cx.rig.stage.position()?;
                    let op = cx.rig.stage.move_to(
                        pos - retract_dir * cfg.recover_distance,
                        cfg.retraction_speed,
                        true,
                    )?;
                    cx.wait_for(&op, None)?;
                    cx.task.sleep(secs(cfg.pause_duration))?;
                }
            }
        }

        // Retraction succeeded: hold the nucleus with strong suction, then
        // lift clear.
        cx.rig
            .pressure
            .set(PressureSource::Regulator, cfg.slurp_pressure)?;
        cx.task.sleep(secs(cfg.slurp_duration))?;
        let pos = cx.rig.stage.position()?;
        let lift = cx.rig.stage.move_to(
            pos + Vector3::z() * cfg.lift_distance,
            cfg.retraction_speed * 20.0,
            false,
        )?;
        cx.wait_for(&lift, Some(Duration::from_secs(120)))?;
        cx.record.set("resealSuccessful", true);
        tracing::info!("reseal complete");
        Ok(Some(cfg.success_state))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HomeWithNucleusConfig {
    /// Ramp duration to full suction while extracting.
    pub ramp_duration: f64,
    pub move_timeout: f64,
}

impl Default for HomeWithNucleusConfig {
    fn default() -> Self {
        Self {
            ramp_duration: 5.0,
            move_timeout: 300.0,
        }
    }
}

/// Carry the captured nucleus to the home position and hold it there under
/// full suction until stopped from outside.
pub struct HomeWithNucleusState {
    config: HomeWithNucleusConfig,
}

impl HomeWithNucleusState {
    pub fn new(config: HomeWithNucleusConfig) -> Self {
        Self { config }
    }
}

impl PatchState for HomeWithNucleusState {
    fn name(&self) -> &'static str {
        super::names::HOME_WITH_NUCLEUS
    }

    fn setup(&self) -> StateSetup {
        StateSetup {
            test_pulse: Some(false),
            ..StateSetup::default()
        }
    }

    fn run(&mut self, cx: &mut StateContext) -> Result<Option<String>> {
        let cfg = &self.config;
        let limit = cx.rig.pressure.limit();
        let ramp = cx.rig.pressure.ramp(
            RampTarget::To(-limit),
            Some(RampPace::Duration(secs(cfg.ramp_duration))),
        )?;
        cx.wait_for(&ramp, Some(Duration::from_secs(60)))?;

        let scene = cx.rig.scene()?;
        let path = cx.rig.planner.home(&scene);
        let op = cx.rig.stage.move_path(&path)?;
        cx.wait_for(&op, Some(Duration::from_secs_f64(cfg.move_timeout)))?;
        cx.record.set("nucleusHomeTime", cx.task.elapsed());
        tracing::info!("holding nucleus at home until stopped");

        // Hold position indefinitely; only an external stop ends this state.
        loop {
            cx.task.check_stop(Duration::from_millis(500))?;
        }
    }
}
