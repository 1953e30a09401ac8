//! Bath state: establish the open-tip baseline and watch for breakage or
//! clogging while the pipette sits in the bath.

use serde::{Deserialize, Serialize};

use autopatch_traits::{ClampMode, PressureSource};

use crate::analysis::BreakDetector;
use crate::error::{PatchError, Result, err};
use crate::state::{PatchState, StateContext, StateSetup};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BathConfig {
    /// Resistance below this counts as immersed (an open tip in air reads
    /// far higher).
    pub bath_threshold: f64,
    /// Offset below the baseline that counts as a broken tip (negative).
    pub break_threshold: f64,
    /// Offset above the baseline that counts as a clogged tip.
    pub clog_threshold: f64,
    /// Slight positive pressure keeping the tip clean in the bath.
    pub target_pressure: f64,
    /// Number of post-immersion pulses whose median becomes the baseline.
    pub baseline_samples: usize,
    /// Give up waiting for immersion/baseline after this many seconds.
    pub baseline_timeout: f64,
}

impl Default for BathConfig {
    fn default() -> Self {
        Self {
            bath_threshold: 50e6,
            break_threshold: -1e6,
            clog_threshold: 1e6,
            target_pressure: 3.5e3,
            baseline_samples: 8,
            baseline_timeout: 120.0,
        }
    }
}

pub struct BathState {
    config: BathConfig,
}

impl BathState {
    pub fn new(config: BathConfig) -> Self {
        Self { config }
    }
}

impl PatchState for BathState {
    fn name(&self) -> &'static str {
        super::names::BATH
    }

    fn setup(&self) -> StateSetup {
        StateSetup {
            new_record: true,
            pressure: Some((PressureSource::Regulator, self.config.target_pressure)),
            clamp_mode: Some(ClampMode::Vc),
            holding: Some((ClampMode::Vc, 0.0)),
            test_pulse: Some(true),
            ..StateSetup::default()
        }
    }

    fn run(&mut self, cx: &mut StateContext) -> Result<Option<String>> {
        let cfg = &self.config;

        // Wait for immersion, then collect the baseline.
        let mut samples: Vec<f64> = Vec::with_capacity(cfg.baseline_samples);
        let initial = loop {
            if cx.task.elapsed() > cfg.baseline_timeout {
                return err(PatchError::Timeout("bath baseline".into()));
            }
            let Some(p) = cx.cycle()? else { continue };
            let r = p.analysis.steady_state_resistance;
            if samples.is_empty() && r >= cfg.bath_threshold {
                tracing::trace!(r, "tip not immersed yet");
                continue;
            }
            samples.push(r);
            if samples.len() >= cfg.baseline_samples
                && let Some(m) = crate::util::median(&samples)
            {
                break m;
            }
        };
        cx.record.set("initialBathResistance", initial);
        cx.record.set("bathStartTime", cx.task.elapsed());
        tracing::info!(initial, "bath baseline established");

        let mut breaker = BreakDetector::new(initial, cfg.break_threshold);
        loop {
            let Some(p) = cx.cycle()? else { continue };
            let r = p.analysis.steady_state_resistance;
            if breaker.update(r) {
                cx.record.set("bathResistanceAtBreak", r);
                return Ok(Some(super::names::BROKEN.to_string()));
            }
            if r > initial + cfg.clog_threshold {
                tracing::info!(r, initial, "tip clogged in bath");
                cx.record.set("bathResistanceAtClog", r);
                return Ok(Some(super::names::FOULED.to_string()));
            }
        }
    }
}
