//! Cell-detect state: watch the resistance stream for the tip meeting a
//! membrane, optionally advancing the pipette toward the target.

use std::time::Duration;

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use autopatch_traits::{ClampMode, PressureSource};

use crate::analysis::{Proximity, ProximityConfig, ProximityDetector};
use crate::error::{PatchError, Result};
use crate::state::{PatchState, StateContext, StateSetup};
use crate::task::OpHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdvanceMode {
    /// Straight toward the target position.
    Target,
    /// Along the pipette's own axis.
    Axial,
    /// Straight down.
    Vertical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CellDetectConfig {
    /// Baseline resistance; when absent the first pulses are measured.
    pub initial_resistance: Option<f64>,
    pub baseline_samples: usize,
    /// Fast rule offset: one sample above `initial + fast_threshold` fires.
    pub fast_threshold: f64,
    /// Slow rule offset, combined with a strict monotonic rise.
    pub slow_threshold: f64,
    pub slow_steps: usize,
    /// Give up and fall back after this many seconds (0 falls back
    /// immediately).
    pub detect_timeout: f64,
    /// Slight positive pressure keeping the tip clean while hunting.
    pub target_pressure: f64,
    pub auto_advance: bool,
    /// One continuous creep versus timed discrete steps.
    pub advance_continuous: bool,
    pub advance_mode: AdvanceMode,
    pub advance_speed: f64,
    pub advance_step_distance: f64,
    pub advance_step_interval: f64,
    /// Total advance budget from the starting position.
    pub max_advance_distance: f64,
    /// How far past the target the tip may go.
    pub max_advance_distance_past_target: f64,
    /// Depth floor below the sample surface.
    pub max_advance_depth_below_surface: f64,
    pub next_state: String,
    pub fallback_state: String,
}

impl Default for CellDetectConfig {
    fn default() -> Self {
        Self {
            initial_resistance: None,
            baseline_samples: 4,
            fast_threshold: 1e6,
            slow_threshold: 0.2e6,
            slow_steps: 3,
            detect_timeout: 30.0,
            target_pressure: 1.5e3,
            auto_advance: true,
            advance_continuous: true,
            advance_mode: AdvanceMode::Target,
            advance_speed: 2e-6,
            advance_step_distance: 1e-6,
            advance_step_interval: 0.5,
            max_advance_distance: 40e-6,
            max_advance_distance_past_target: 10e-6,
            max_advance_depth_below_surface: 100e-6,
            next_state: super::names::SEAL.to_string(),
            fallback_state: super::names::BATH.to_string(),
        }
    }
}

pub struct CellDetectState {
    config: CellDetectConfig,
}

impl CellDetectState {
    pub fn new(config: CellDetectConfig) -> Self {
        Self { config }
    }

    /// Advance direction for the configured mode.
    fn advance_direction(&self, cx: &StateContext) -> Result<Vector3<f64>> {
        let pose = cx.rig.pose()?;
        Ok(match self.config.advance_mode {
            AdvanceMode::Axial => pose.direction(),
            AdvanceMode::Vertical => -Vector3::z(),
            AdvanceMode::Target => {
                let target = cx.rig.target().ok_or_else(|| {
                    eyre::Report::new(PatchError::Config(
                        "advance mode `target` requires a target position".into(),
                    ))
                })?;
                let v = target - pose.position;
                if v.norm() < 1e-12 {
                    pose.direction()
                } else {
                    v.normalize()
                }
            }
        })
    }

    /// Farthest point the tip may creep to, honoring the distance budget,
    /// the past-target margin and the depth floor.
    fn advance_endpoint(&self, cx: &StateContext, dir: Vector3<f64>) -> Result<Vector3<f64>> {
        let cfg = &self.config;
        let start = cx.rig.stage.position()?;
        let surface = cx.rig.scope.surface_depth()?;
        let mut allowed = cfg.max_advance_distance;
        if let Some(target) = cx.rig.target() {
            let toward = (target - start).dot(&dir);
            if toward.is_finite() {
                allowed = allowed.min(toward + cfg.max_advance_distance_past_target);
            }
        }
        if dir.z < 0.0 {
            let floor = surface - cfg.max_advance_depth_below_surface;
            let to_floor = (start.z - floor) / -dir.z;
            allowed = allowed.min(to_floor);
        }
        Ok(start + dir * allowed.max(0.0))
    }
}

impl PatchState for CellDetectState {
    fn name(&self) -> &'static str {
        super::names::CELL_DETECT
    }

    fn setup(&self) -> StateSetup {
        StateSetup {
            pressure: Some((PressureSource::Regulator, self.config.target_pressure)),
            clamp_mode: Some(ClampMode::Vc),
            test_pulse: Some(true),
            fallback_state: Some(self.config.fallback_state.clone()),
            ..StateSetup::default()
        }
    }

    fn run(&mut self, cx: &mut StateContext) -> Result<Option<String>> {
        let cfg = self.config.clone();
        if cfg.detect_timeout <= 0.0 {
            return Ok(Some(cfg.fallback_state));
        }

        let initial = match cfg.initial_resistance {
            Some(r) => r,
            None => match cx.record.get_number("initialBathResistance") {
                Some(r) => r,
                None => cx.median_resistance(cfg.baseline_samples, 10.0)?,
            },
        };
        let mut detector = ProximityDetector::new(
            initial,
            ProximityConfig {
                fast_threshold: cfg.fast_threshold,
                slow_threshold: cfg.slow_threshold,
                steps: cfg.slow_steps,
            },
        );

        // Continuous creep: one long slow move, stopped early either by the
        // fast rule (watch predicate, fires between drains) or by any
        // detection below.
        let mut advance: Option<OpHandle> = None;
        if cfg.auto_advance && cfg.advance_continuous {
            let dir = self.advance_direction(cx)?;
            let endpoint = self.advance_endpoint(cx, dir)?;
            let op = cx.rig.stage.move_to(endpoint, cfg.advance_speed, true)?;
            let fast_limit = initial + cfg.fast_threshold;
            cx.pulses
                .stop_when(&[&op], move |p| {
                    p.analysis.steady_state_resistance > fast_limit
                });
            advance = Some(op);
        }

        let start_pos = cx.rig.stage.position()?;
        let mut last_step = 0.0_f64;
        let detected = loop {
            if cx.task.elapsed() > cfg.detect_timeout {
                if let Some(op) = &advance {
                    op.stop();
                }
                tracing::info!("no cell detected before timeout");
                return Ok(Some(cfg.fallback_state));
            }
            let Some(pulse) = cx.cycle()? else { continue };
            let r = pulse.analysis.steady_state_resistance;
            if let Some(kind) = detector.update(r) {
                break kind;
            }

            // Timed stepping happens strictly between measurement cycles.
            if cfg.auto_advance
                && !cfg.advance_continuous
                && cx.task.elapsed() - last_step >= cfg.advance_step_interval
            {
                let pos = cx.rig.stage.position()?;
                if (pos - start_pos).norm() < cfg.max_advance_distance {
                    let dir = self.advance_direction(cx)?;
                    let endpoint = self.advance_endpoint(cx, dir)?;
                    let step = dir * cfg.advance_step_distance.min((endpoint - pos).norm());
                    let op = cx.rig.stage.step(step, cfg.advance_speed)?;
                    cx.wait_for(&op, Some(Duration::from_secs(30)))?;
                    last_step = cx.task.elapsed();
                }
            }
        };

        if let Some(op) = advance.take() {
            op.stop();
            let _ = op.wait(Duration::from_secs(5));
        }
        cx.rig.stage.halt();
        cx.record.set("detectedCell", true);
        cx.record.set("cellDetectTime", cx.task.elapsed());
        tracing::info!(?detected, "cell detected");
        if detected == Proximity::Fast {
            cx.record.set("cellDetectFastRule", true);
        }
        Ok(Some(cfg.next_state))
    }
}
